//! Thread repository: insert-or-merge by uid, membership bookkeeping,
//! ancestry intersection queries and aggregate recomputation.
//!
//! Thread ancestry (`messages_ids`) lives in the normalized
//! `thread_message_ids` table so that "which threads does this new message
//! belong to" is a single indexed join instead of a scan.

use std::collections::BTreeSet;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::{Message, Thread};
use crate::store::folders::{self, parse_timestamp};
use crate::store::messages::row_to_message;

/// UI-facing thread list filters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThreadFilter {
    All,
    Seen,
    Unseen,
    Starred,
    Attachments,
}

/// Insert-or-merge a thread row and grow its ancestry set.
pub fn upsert_thread(conn: &Connection, thread: &Thread) -> Result<()> {
    conn.execute(
        "INSERT INTO threads (uid, folder_id, unseen_messages_count, is_favorite,
                              has_attachments, date)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(uid) DO UPDATE SET
            folder_id = excluded.folder_id,
            unseen_messages_count = excluded.unseen_messages_count,
            is_favorite = excluded.is_favorite,
            has_attachments = excluded.has_attachments,
            date = excluded.date",
        params![
            thread.uid,
            thread.folder_id,
            thread.unseen_messages_count,
            thread.is_favorite as i32,
            thread.has_attachments as i32,
            thread.date.map(|dt| dt.to_rfc3339()),
        ],
    )?;
    // Ancestry only ever grows.
    let mut stmt = conn.prepare(
        "INSERT OR IGNORE INTO thread_message_ids (thread_uid, message_id) VALUES (?1, ?2)",
    )?;
    for message_id in &thread.messages_ids {
        stmt.execute(params![thread.uid, message_id])?;
    }
    Ok(())
}

pub fn thread(conn: &Connection, uid: &str) -> Result<Option<Thread>> {
    let found = conn
        .query_row(
            "SELECT uid, folder_id, unseen_messages_count, is_favorite, has_attachments, date
             FROM threads WHERE uid = ?1",
            params![uid],
            row_to_thread,
        )
        .optional()?;
    match found {
        Some(mut thread) => {
            thread.messages_ids = messages_ids(conn, &thread.uid)?;
            Ok(Some(thread))
        }
        None => Ok(None),
    }
}

fn messages_ids(conn: &Connection, thread_uid: &str) -> Result<BTreeSet<String>> {
    let mut stmt =
        conn.prepare("SELECT message_id FROM thread_message_ids WHERE thread_uid = ?1")?;
    let ids = stmt
        .query_map(params![thread_uid], |row| row.get::<_, String>(0))?
        .collect::<std::result::Result<BTreeSet<_>, _>>()?;
    Ok(ids)
}

/// All threads (in any folder) whose ancestry intersects `ids`, in stable
/// uid order.
pub fn threads_matching_ids(conn: &Connection, ids: &[String]) -> Result<Vec<Thread>> {
    if ids.is_empty() {
        return Ok(Vec::new());
    }
    let placeholders = vec!["?"; ids.len()].join(", ");
    let mut stmt = conn.prepare(&format!(
        "SELECT DISTINCT t.uid, t.folder_id, t.unseen_messages_count, t.is_favorite,
                t.has_attachments, t.date
         FROM threads t
         JOIN thread_message_ids tmi ON tmi.thread_uid = t.uid
         WHERE tmi.message_id IN ({placeholders})
         ORDER BY t.uid"
    ))?;
    let mut threads = stmt
        .query_map(params_from_iter(ids.iter()), row_to_thread)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for thread in &mut threads {
        thread.messages_ids = messages_ids(conn, &thread.uid)?;
    }
    Ok(threads)
}

/// Threads a message is currently a member of. Normally one; more than one
/// only transiently during a merge.
pub fn threads_containing_message(conn: &Connection, message_uid: &str) -> Result<Vec<Thread>> {
    let mut stmt = conn.prepare(
        "SELECT t.uid, t.folder_id, t.unseen_messages_count, t.is_favorite,
                t.has_attachments, t.date
         FROM threads t
         JOIN thread_messages tm ON tm.thread_uid = t.uid
         WHERE tm.message_uid = ?1
         ORDER BY t.uid",
    )?;
    let mut threads = stmt
        .query_map(params![message_uid], row_to_thread)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for thread in &mut threads {
        thread.messages_ids = messages_ids(conn, &thread.uid)?;
    }
    Ok(threads)
}

pub fn add_member(conn: &Connection, thread_uid: &str, message_uid: &str) -> Result<()> {
    conn.execute(
        "INSERT OR IGNORE INTO thread_messages (thread_uid, message_uid) VALUES (?1, ?2)",
        params![thread_uid, message_uid],
    )?;
    Ok(())
}

/// Returns whether the message was a member.
pub fn remove_member(conn: &Connection, thread_uid: &str, message_uid: &str) -> Result<bool> {
    let removed = conn.execute(
        "DELETE FROM thread_messages WHERE thread_uid = ?1 AND message_uid = ?2",
        params![thread_uid, message_uid],
    )?;
    Ok(removed > 0)
}

pub fn is_member(conn: &Connection, thread_uid: &str, message_uid: &str) -> Result<bool> {
    let found: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM thread_messages WHERE thread_uid = ?1 AND message_uid = ?2)",
        params![thread_uid, message_uid],
        |row| row.get(0),
    )?;
    Ok(found)
}

/// Member messages ordered oldest first.
pub fn members(conn: &Connection, thread_uid: &str) -> Result<Vec<Message>> {
    let mut stmt = conn.prepare(
        "SELECT m.uid, m.short_uid, m.folder_id, m.subject, m.date, m.message_ids, m.seen,
                m.is_favorite, m.answered, m.forwarded, m.scheduled, m.is_spam, m.is_draft,
                m.has_attachments, m.fully_downloaded, m.draft_uuid
         FROM messages m
         JOIN thread_messages tm ON tm.message_uid = m.uid
         WHERE tm.thread_uid = ?1
         ORDER BY m.date ASC, m.short_uid ASC, m.uid ASC",
    )?;
    let members = stmt
        .query_map(params![thread_uid], row_to_message)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(members)
}

pub fn member_count_in_folder(conn: &Connection, thread_uid: &str, folder_id: &str) -> Result<u32> {
    let count: u32 = conn.query_row(
        "SELECT COUNT(*) FROM thread_messages tm
         JOIN messages m ON m.uid = tm.message_uid
         WHERE tm.thread_uid = ?1 AND m.folder_id = ?2",
        params![thread_uid, folder_id],
        |row| row.get(0),
    )?;
    Ok(count)
}

/// Membership and ancestry rows go away via cascade.
pub fn delete_thread(conn: &Connection, uid: &str) -> Result<()> {
    conn.execute("DELETE FROM threads WHERE uid = ?1", params![uid])?;
    Ok(())
}

/// Recompute a thread's aggregates from its members. Deletes the thread and
/// returns `None` when it no longer has any member in its own folder.
pub fn recompute_thread(conn: &Connection, thread_uid: &str) -> Result<Option<Thread>> {
    let Some(mut thread) = thread(conn, thread_uid)? else {
        return Ok(None);
    };
    if member_count_in_folder(conn, thread_uid, &thread.folder_id)? == 0 {
        delete_thread(conn, thread_uid)?;
        return Ok(None);
    }

    let members = members(conn, thread_uid)?;
    thread.unseen_messages_count = members.iter().filter(|m| !m.seen).count() as u32;
    thread.is_favorite = members.iter().any(|m| m.is_favorite);
    thread.has_attachments = members.iter().any(|m| m.has_attachments);
    thread.date = members
        .iter()
        .filter(|m| m.folder_id == thread.folder_id)
        .map(|m| m.date)
        .max();
    upsert_thread(conn, &thread)?;
    Ok(Some(thread))
}

/// A folder's thread list, newest first, optionally filtered. UI-facing;
/// the sync core never calls this.
pub fn threads_in_folder(
    conn: &Connection,
    folder_id: &str,
    filter: ThreadFilter,
) -> Result<Vec<Thread>> {
    let predicate = match filter {
        ThreadFilter::All => "1 = 1",
        ThreadFilter::Seen => "unseen_messages_count = 0",
        ThreadFilter::Unseen => "unseen_messages_count > 0",
        ThreadFilter::Starred => "is_favorite = 1",
        ThreadFilter::Attachments => "has_attachments = 1",
    };
    let mut stmt = conn.prepare(&format!(
        "SELECT uid, folder_id, unseen_messages_count, is_favorite, has_attachments, date
         FROM threads WHERE folder_id = ?1 AND {predicate}
         ORDER BY date DESC, uid"
    ))?;
    let mut threads = stmt
        .query_map(params![folder_id], row_to_thread)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    for thread in &mut threads {
        thread.messages_ids = messages_ids(conn, &thread.uid)?;
    }
    Ok(threads)
}

/// Mark every member seen and settle the folder unread count incrementally.
pub fn mark_thread_seen(conn: &Connection, thread_uid: &str) -> Result<()> {
    let Some(thread) = thread(conn, thread_uid)? else {
        return Ok(());
    };
    let unseen = thread.unseen_messages_count;
    conn.execute(
        "UPDATE messages SET seen = 1 WHERE uid IN
            (SELECT message_uid FROM thread_messages WHERE thread_uid = ?1)",
        params![thread_uid],
    )?;
    conn.execute(
        "UPDATE threads SET unseen_messages_count = 0 WHERE uid = ?1",
        params![thread_uid],
    )?;
    folders::update_folder(conn, &thread.folder_id, |f| {
        f.unread_count = f.unread_count.saturating_sub(unseen);
    })?;
    Ok(())
}

/// Mark the most recent member unseen.
pub fn mark_thread_unseen(conn: &Connection, thread_uid: &str) -> Result<()> {
    let Some(thread) = thread(conn, thread_uid)? else {
        return Ok(());
    };
    let Some(last) = members(conn, thread_uid)?.into_iter().last() else {
        return Ok(());
    };
    if !last.seen {
        return Ok(());
    }
    conn.execute(
        "UPDATE messages SET seen = 0 WHERE uid = ?1",
        params![last.uid],
    )?;
    conn.execute(
        "UPDATE threads SET unseen_messages_count = unseen_messages_count + 1 WHERE uid = ?1",
        params![thread_uid],
    )?;
    folders::update_folder(conn, &thread.folder_id, |f| {
        f.unread_count += 1;
    })?;
    Ok(())
}

fn row_to_thread(row: &Row) -> rusqlite::Result<Thread> {
    Ok(Thread {
        uid: row.get(0)?,
        folder_id: row.get(1)?,
        messages_ids: BTreeSet::new(),
        unseen_messages_count: row.get(2)?,
        is_favorite: row.get::<_, i32>(3)? != 0,
        has_attachments: row.get::<_, i32>(4)? != 0,
        date: parse_timestamp(row.get::<_, Option<String>>(5)?),
    })
}
