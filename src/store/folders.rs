//! Folder repository: per-folder sync cursor, backfill counter and unread
//! counts. Pure local-store operations, applied inside the caller's
//! transaction.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::error::Result;
use crate::models::{Folder, FolderRole};

pub fn upsert_folder(conn: &Connection, folder: &Folder) -> Result<()> {
    conn.execute(
        "INSERT INTO folders (id, name, role, cursor, remaining_old_messages_to_fetch,
                              is_history_complete, unread_count, last_updated_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
         ON CONFLICT(id) DO UPDATE SET
            name = excluded.name,
            role = excluded.role,
            cursor = excluded.cursor,
            remaining_old_messages_to_fetch = excluded.remaining_old_messages_to_fetch,
            is_history_complete = excluded.is_history_complete,
            unread_count = excluded.unread_count,
            last_updated_at = excluded.last_updated_at",
        params![
            folder.id,
            folder.name,
            folder.role.as_str(),
            folder.cursor,
            folder.remaining_old_messages_to_fetch,
            folder.is_history_complete as i32,
            folder.unread_count,
            folder.last_updated_at.map(|dt| dt.to_rfc3339()),
        ],
    )?;
    Ok(())
}

pub fn folder(conn: &Connection, id: &str) -> Result<Option<Folder>> {
    let found = conn
        .query_row(
            "SELECT id, name, role, cursor, remaining_old_messages_to_fetch,
                    is_history_complete, unread_count, last_updated_at
             FROM folders WHERE id = ?1",
            params![id],
            row_to_folder,
        )
        .optional()?;
    Ok(found)
}

pub fn folder_by_role(conn: &Connection, role: FolderRole) -> Result<Option<Folder>> {
    let found = conn
        .query_row(
            "SELECT id, name, role, cursor, remaining_old_messages_to_fetch,
                    is_history_complete, unread_count, last_updated_at
             FROM folders WHERE role = ?1 ORDER BY id LIMIT 1",
            params![role.as_str()],
            row_to_folder,
        )
        .optional()?;
    Ok(found)
}

/// Read-modify-write a folder inside the caller's transaction. Returns the
/// updated folder, or `None` if it does not exist.
pub fn update_folder(
    conn: &Connection,
    id: &str,
    mutate: impl FnOnce(&mut Folder),
) -> Result<Option<Folder>> {
    let Some(mut folder) = folder(conn, id)? else {
        return Ok(None);
    };
    mutate(&mut folder);
    upsert_folder(conn, &folder)?;
    Ok(Some(folder))
}

/// Recompute the folder's unread count from scratch by counting its unseen
/// messages.
pub fn refresh_unread_count(conn: &Connection, folder_id: &str) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM messages WHERE folder_id = ?1 AND seen = 0",
        params![folder_id],
        |row| row.get(0),
    )?;
    conn.execute(
        "UPDATE folders SET unread_count = ?1 WHERE id = ?2",
        params![count, folder_id],
    )?;
    Ok(count)
}

/// Folders whose backfill has not finished; threads there may be missing
/// older members, so they are not authoritative as reference threads.
pub fn ids_of_folders_with_incomplete_threads(conn: &Connection) -> Result<Vec<String>> {
    let mut stmt = conn.prepare("SELECT id FROM folders WHERE is_history_complete = 0")?;
    let ids = stmt
        .query_map([], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(ids)
}

fn row_to_folder(row: &Row) -> rusqlite::Result<Folder> {
    Ok(Folder {
        id: row.get(0)?,
        name: row.get(1)?,
        role: FolderRole::parse(&row.get::<_, String>(2)?),
        cursor: row.get(3)?,
        remaining_old_messages_to_fetch: row.get(4)?,
        is_history_complete: row.get::<_, i32>(5)? != 0,
        unread_count: row.get(6)?,
        last_updated_at: parse_timestamp(row.get::<_, Option<String>>(7)?),
    })
}

pub(crate) fn parse_timestamp(value: Option<String>) -> Option<DateTime<Utc>> {
    value
        .and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
