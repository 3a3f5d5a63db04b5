use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::Message;

/// A conversation thread inside one folder.
///
/// `messages_ids` is the union of all member messages' `message_ids` and is
/// what new arrivals are matched against; it only ever grows. Distinct
/// threads in different folders may share overlapping ancestry (the same
/// logical conversation seen from Inbox and from Sent).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    /// Derived from the anchor message's uid.
    pub uid: String,
    pub folder_id: String,
    pub messages_ids: BTreeSet<String>,
    pub unseen_messages_count: u32,
    pub is_favorite: bool,
    pub has_attachments: bool,
    pub date: Option<DateTime<Utc>>,
}

impl Thread {
    /// Create a new thread anchored on `message`. Aggregates are filled in
    /// by the recompute pass at the end of the batch.
    pub fn from_message(message: &Message) -> Self {
        Self {
            uid: message.uid.clone(),
            folder_id: message.folder_id.clone(),
            messages_ids: message.message_ids.iter().cloned().collect(),
            unseen_messages_count: 0,
            is_favorite: false,
            has_attachments: false,
            date: Some(message.date),
        }
    }
}
