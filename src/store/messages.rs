//! Message repository: keyed CRUD over cached messages, plus the handful of
//! queries the sync core needs (oldest message for backfill, known short
//! uids, orphan detection).

use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashSet;

use crate::api::FlagUpdate;
use crate::error::Result;
use crate::models::Message;
use crate::store::folders::parse_timestamp;

const MESSAGE_COLUMNS: &str = "uid, short_uid, folder_id, subject, date, message_ids, seen,
    is_favorite, answered, forwarded, scheduled, is_spam, is_draft, has_attachments,
    fully_downloaded, draft_uuid";

pub fn upsert_message(conn: &Connection, message: &Message) -> Result<()> {
    conn.execute(
        "INSERT INTO messages (uid, short_uid, folder_id, subject, date, message_ids, seen,
                               is_favorite, answered, forwarded, scheduled, is_spam, is_draft,
                               has_attachments, fully_downloaded, draft_uuid)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)
         ON CONFLICT(uid) DO UPDATE SET
            short_uid = excluded.short_uid,
            folder_id = excluded.folder_id,
            subject = excluded.subject,
            date = excluded.date,
            message_ids = excluded.message_ids,
            seen = excluded.seen,
            is_favorite = excluded.is_favorite,
            answered = excluded.answered,
            forwarded = excluded.forwarded,
            scheduled = excluded.scheduled,
            is_spam = excluded.is_spam,
            is_draft = excluded.is_draft,
            has_attachments = excluded.has_attachments,
            fully_downloaded = excluded.fully_downloaded,
            draft_uuid = excluded.draft_uuid",
        params![
            message.uid,
            message.short_uid,
            message.folder_id,
            message.subject,
            message.date.to_rfc3339(),
            serde_json::to_string(&message.message_ids)?,
            message.seen as i32,
            message.is_favorite as i32,
            message.answered as i32,
            message.forwarded as i32,
            message.scheduled as i32,
            message.is_spam as i32,
            message.is_draft as i32,
            message.has_attachments as i32,
            message.fully_downloaded as i32,
            message.draft_uuid,
        ],
    )?;
    Ok(())
}

pub fn message(conn: &Connection, uid: &str) -> Result<Option<Message>> {
    let found = conn
        .query_row(
            &format!("SELECT {MESSAGE_COLUMNS} FROM messages WHERE uid = ?1"),
            params![uid],
            row_to_message,
        )
        .optional()?;
    Ok(found)
}

/// The locally-known oldest message of a folder (minimum short uid), used as
/// the backfill offset.
pub fn oldest_message(conn: &Connection, folder_id: &str) -> Result<Option<Message>> {
    let found = conn
        .query_row(
            &format!(
                "SELECT {MESSAGE_COLUMNS} FROM messages
                 WHERE folder_id = ?1 ORDER BY short_uid ASC LIMIT 1"
            ),
            params![folder_id],
            row_to_message,
        )
        .optional()?;
    Ok(found)
}

pub fn short_uids_in_folder(conn: &Connection, folder_id: &str) -> Result<HashSet<u32>> {
    let mut stmt = conn.prepare("SELECT short_uid FROM messages WHERE folder_id = ?1")?;
    let uids = stmt
        .query_map(params![folder_id], |row| row.get::<_, u32>(0))?
        .collect::<std::result::Result<HashSet<_>, _>>()?;
    Ok(uids)
}

/// Apply a flag delta. Returns whether a message with this uid existed.
pub fn update_flags(conn: &Connection, uid: &str, flags: &FlagUpdate) -> Result<bool> {
    let updated = conn.execute(
        "UPDATE messages SET seen = ?1, is_favorite = ?2, answered = ?3,
                             forwarded = ?4, scheduled = ?5
         WHERE uid = ?6",
        params![
            flags.seen as i32,
            flags.is_favorite as i32,
            flags.answered as i32,
            flags.forwarded as i32,
            flags.scheduled as i32,
            uid,
        ],
    )?;
    Ok(updated > 0)
}

/// Delete a message row, cascading to its local draft mirror if it has one.
/// Thread membership rows go away via foreign-key cascade.
pub fn delete_message(conn: &Connection, uid: &str) -> Result<()> {
    let draft_uuid: Option<String> = conn
        .query_row(
            "SELECT draft_uuid FROM messages WHERE uid = ?1",
            params![uid],
            |row| row.get(0),
        )
        .optional()?
        .flatten();
    if let Some(draft_uuid) = draft_uuid {
        conn.execute("DELETE FROM drafts WHERE uuid = ?1", params![draft_uuid])?;
    }
    conn.execute("DELETE FROM messages WHERE uid = ?1", params![uid])?;
    Ok(())
}

/// A message row not attached to any thread, typically left over from a
/// partially-applied prior sync.
pub fn is_orphan(conn: &Connection, uid: &str) -> Result<bool> {
    let attached: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM thread_messages WHERE message_uid = ?1)",
        params![uid],
        |row| row.get(0),
    )?;
    Ok(!attached)
}

/// Count of orphan messages in a folder, reported as a consistency anomaly
/// after each refresh round.
pub fn orphan_count(conn: &Connection, folder_id: &str) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM messages m
         WHERE m.folder_id = ?1
           AND NOT EXISTS(SELECT 1 FROM thread_messages tm WHERE tm.message_uid = m.uid)",
        params![folder_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

pub(crate) fn row_to_message(row: &Row) -> rusqlite::Result<Message> {
    let message_ids: Vec<String> =
        serde_json::from_str(&row.get::<_, String>(5)?).unwrap_or_default();
    Ok(Message {
        uid: row.get(0)?,
        short_uid: row.get(1)?,
        folder_id: row.get(2)?,
        subject: row.get(3)?,
        date: parse_timestamp(Some(row.get::<_, String>(4)?)).unwrap_or_else(chrono::Utc::now),
        message_ids,
        seen: row.get::<_, i32>(6)? != 0,
        is_favorite: row.get::<_, i32>(7)? != 0,
        answered: row.get::<_, i32>(8)? != 0,
        forwarded: row.get::<_, i32>(9)? != 0,
        scheduled: row.get::<_, i32>(10)? != 0,
        is_spam: row.get::<_, i32>(11)? != 0,
        is_draft: row.get::<_, i32>(12)? != 0,
        has_attachments: row.get::<_, i32>(13)? != 0,
        fully_downloaded: row.get::<_, i32>(14)? != 0,
        draft_uuid: row.get(15)?,
    })
}
