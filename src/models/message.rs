use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::RemoteMessage;
use crate::models::{long_uid, short_uid_of, Folder, FolderRole};

/// A single mail message as cached locally.
///
/// A message belongs to exactly one folder at a time. `short_uid` is the
/// server-assigned per-folder numeric id; `uid` is the long form
/// (`short_uid@folder_id`) and is globally unique.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub uid: String,
    pub short_uid: u32,
    pub folder_id: String,
    pub subject: Option<String>,
    pub date: DateTime<Utc>,
    /// Message-ID, In-Reply-To and References header values, used for
    /// threading. Initialized once when the message arrives.
    pub message_ids: Vec<String>,
    pub seen: bool,
    pub is_favorite: bool,
    pub answered: bool,
    pub forwarded: bool,
    pub scheduled: bool,
    pub is_spam: bool,
    pub is_draft: bool,
    pub has_attachments: bool,
    /// Whether the body has been fetched, not just the envelope.
    pub fully_downloaded: bool,
    /// Back-reference to a local draft mirror, if this message is an
    /// editable draft copy. Deleting the message cascades to the draft.
    pub draft_uuid: Option<String>,
}

impl Message {
    /// Build the local entity from a remote message, bound to the folder the
    /// refresh is targeting.
    pub fn from_remote(remote: &RemoteMessage, folder: &Folder) -> Self {
        let short_uid = short_uid_of(&remote.uid).unwrap_or(0);
        Self {
            uid: long_uid(short_uid, &folder.id),
            short_uid,
            folder_id: folder.id.clone(),
            subject: remote.subject.clone(),
            date: remote.date,
            message_ids: init_message_ids(remote),
            seen: remote.seen,
            is_favorite: remote.is_favorite,
            answered: remote.answered,
            forwarded: remote.forwarded,
            scheduled: remote.scheduled,
            is_spam: folder.role == FolderRole::Spam,
            is_draft: remote.is_draft,
            has_attachments: remote.has_attachments,
            fully_downloaded: false,
            draft_uuid: None,
        }
    }
}

/// Union of the Message-ID, In-Reply-To and References headers.
fn init_message_ids(remote: &RemoteMessage) -> Vec<String> {
    let mut ids: Vec<String> = Vec::new();
    let mut push = |id: String| {
        if !id.is_empty() && !ids.contains(&id) {
            ids.push(id);
        }
    };

    if let Some(message_id) = &remote.message_id {
        push(normalize_message_id(message_id));
    }
    for header in [&remote.in_reply_to, &remote.references] {
        if let Some(value) = header {
            for id in parse_message_id_list(value) {
                push(id);
            }
        }
    }

    ids
}

/// Parse a References-style header: whitespace-separated, angle-bracketed ids.
pub fn parse_message_id_list(value: &str) -> Vec<String> {
    value
        .split_whitespace()
        .map(normalize_message_id)
        .filter(|id| !id.is_empty())
        .collect()
}

fn normalize_message_id(id: impl AsRef<str>) -> String {
    id.as_ref()
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .to_string()
}
