//! Thread graph maintenance.
//!
//! Every function here runs inside the caller's write transaction: a batch of
//! added, deleted or updated messages is applied atomically, and a
//! cancellation surfacing mid-batch rolls the whole batch back.

use std::collections::BTreeSet;

use rusqlite::Transaction;
use tracing::trace;

use crate::api::{FlagUpdate, RemoteMessage};
use crate::error::{ErrorReporter, Result};
use crate::models::{long_uid, Folder, FolderRole, Message, Thread};
use crate::store::{folders, messages, threads};
use crate::sync::refresh::Scope;

/// Insert a page of newly-arrived messages and connect them to the thread
/// graph. Returns the threads (across all folders) the page touched, with
/// aggregates recomputed.
pub fn create_threads_for_added(
    tx: &Transaction,
    scope: &Scope,
    folder: &Folder,
    remote_messages: &[RemoteMessage],
    reporter: &dyn ErrorReporter,
) -> Result<Vec<Thread>> {
    let incomplete_folder_ids: BTreeSet<String> = folders::ids_of_folders_with_incomplete_threads(tx)?
        .into_iter()
        .collect();

    // Order preserved so threads anchor on the first arrival.
    let mut touched_thread_uids: Vec<String> = Vec::new();
    fn touch(uid: &str, touched: &mut Vec<String>) {
        if !touched.iter().any(|t| t == uid) {
            touched.push(uid.to_string());
        }
    }

    for remote in remote_messages {
        scope.ensure_active()?;
        let message = Message::from_remote(remote, folder);

        if let Some(existing) = messages::message(tx, &message.uid)? {
            if messages::is_orphan(tx, &existing.uid)? {
                // Leftover from a partially-applied earlier sync; rethread it.
                trace!(uid = %message.uid, "re-adopting orphan message");
            } else {
                reporter.anomaly(&format!(
                    "message {} reported as added but already threaded",
                    message.uid
                ));
                continue;
            }
        }
        messages::upsert_message(tx, &message)?;

        let matching = threads::threads_matching_ids(tx, &message.message_ids)?;
        let has_local_thread = matching.iter().any(|t| t.folder_id == folder.id);

        if !has_local_thread {
            let mut thread = Thread::from_message(&message);
            threads::upsert_thread(tx, &thread)?;
            threads::add_member(tx, &thread.uid, &message.uid)?;

            // A reference thread with complete history donates its members;
            // an incomplete one only donates ancestry, since its member set
            // may itself be missing older messages.
            let reference = matching
                .iter()
                .find(|t| !incomplete_folder_ids.contains(&t.folder_id));
            if let Some(reference) = reference {
                thread.messages_ids.extend(reference.messages_ids.iter().cloned());
                add_previous_messages_to_thread(tx, &thread, reference)?;
            } else if let Some(first) = matching.first() {
                thread.messages_ids.extend(first.messages_ids.iter().cloned());
            }
            threads::upsert_thread(tx, &thread)?;
            touch(&thread.uid, &mut touched_thread_uids);
        }

        for other in &matching {
            if threads::is_member(tx, &other.uid, &message.uid)? {
                continue;
            }
            let mut other = other.clone();
            other.messages_ids.extend(message.message_ids.iter().cloned());
            add_message_with_conditions(tx, &other, &message)?;
            threads::upsert_thread(tx, &other)?;
            touch(&other.uid, &mut touched_thread_uids);
        }
    }

    let mut touched = Vec::new();
    for uid in touched_thread_uids {
        scope.ensure_active()?;
        if let Some(thread) = threads::recompute_thread(tx, &uid)? {
            touched.push(thread);
        }
    }
    Ok(touched)
}

/// Remove deleted messages, dropping or recomputing the threads they leave
/// behind. Returns the folder ids whose thread lists changed.
pub fn handle_deleted_uids(
    tx: &Transaction,
    scope: &Scope,
    deleted_uids: &[String],
) -> Result<BTreeSet<String>> {
    let mut impacted_folder_ids = BTreeSet::new();
    let mut recompute: Vec<String> = Vec::new();

    for uid in deleted_uids {
        scope.ensure_active()?;
        let Some(message) = messages::message(tx, uid)? else {
            continue;
        };
        impacted_folder_ids.insert(message.folder_id.clone());

        for thread in threads::threads_containing_message(tx, uid)? {
            threads::remove_member(tx, &thread.uid, uid)?;
            impacted_folder_ids.insert(thread.folder_id.clone());
            if threads::member_count_in_folder(tx, &thread.uid, &thread.folder_id)? == 0 {
                threads::delete_thread(tx, &thread.uid)?;
                recompute.retain(|t| t != &thread.uid);
            } else if !recompute.contains(&thread.uid) {
                recompute.push(thread.uid);
            }
        }
        messages::delete_message(tx, uid)?;
    }

    for thread_uid in recompute {
        threads::recompute_thread(tx, &thread_uid)?;
    }
    Ok(impacted_folder_ids)
}

/// Apply flag deltas and recompute the threads they belong to. Returns the
/// folder ids whose thread lists changed.
pub fn handle_updated_messages(
    tx: &Transaction,
    scope: &Scope,
    updates: &[FlagUpdate],
    folder_id: &str,
) -> Result<BTreeSet<String>> {
    let mut impacted_folder_ids = BTreeSet::new();
    let mut recompute: Vec<String> = Vec::new();

    for update in updates {
        scope.ensure_active()?;
        let uid = long_uid(update.short_uid, folder_id);
        if !messages::update_flags(tx, &uid, update)? {
            continue;
        }
        for thread in threads::threads_containing_message(tx, &uid)? {
            if !recompute.contains(&thread.uid) {
                recompute.push(thread.uid);
            }
        }
    }

    for thread_uid in recompute {
        if let Some(thread) = threads::recompute_thread(tx, &thread_uid)? {
            impacted_folder_ids.insert(thread.folder_id);
        }
    }
    Ok(impacted_folder_ids)
}

/// Copy a reference thread's members into a new thread, subject to the new
/// thread's visibility rules.
fn add_previous_messages_to_thread(
    tx: &Transaction,
    thread: &Thread,
    reference: &Thread,
) -> Result<()> {
    for member in threads::members(tx, &reference.uid)? {
        if member.uid == thread.uid {
            continue;
        }
        add_message_with_conditions(tx, thread, &member)?;
    }
    Ok(())
}

/// Attach a message to a thread if the thread's folder wants to display it:
/// draft folders show only drafts, the trash shows only trashed messages,
/// everything else hides trashed messages.
fn add_message_with_conditions(tx: &Transaction, thread: &Thread, message: &Message) -> Result<()> {
    let role = folders::folder(tx, &thread.folder_id)?
        .map(|f| f.role)
        .unwrap_or(FolderRole::Custom);
    let accepted = match role {
        FolderRole::Draft => message.is_draft,
        FolderRole::Trash => is_in_trash(tx, message)?,
        _ => !is_in_trash(tx, message)?,
    };
    if accepted {
        threads::add_member(tx, &thread.uid, &message.uid)?;
    }
    Ok(())
}

fn is_in_trash(tx: &Transaction, message: &Message) -> Result<bool> {
    let role = folders::folder(tx, &message.folder_id)?.map(|f| f.role);
    Ok(role == Some(FolderRole::Trash))
}
