//! Remote mail API seam
//!
//! The sync engine only depends on three endpoints: full uid listing,
//! uid delta, and batched message fetch. The trait is object-safe so tests
//! and transports can be swapped behind `Arc<dyn MailApi>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::models::long_uid;

/// Full snapshot of a folder's current short uids plus a fresh cursor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UidListing {
    pub added_short_uids: Vec<u32>,
    pub cursor: String,
}

/// Incremental changes since a previously stored cursor. The three sets are
/// disjoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UidDelta {
    pub added_short_uids: Vec<u32>,
    pub deleted_short_uids: Vec<u32>,
    pub updated_messages: Vec<FlagUpdate>,
    pub cursor: String,
}

/// Per-message flag state reported by a delta.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct FlagUpdate {
    pub short_uid: u32,
    pub seen: bool,
    pub is_favorite: bool,
    pub answered: bool,
    pub forwarded: bool,
    pub scheduled: bool,
}

/// A message as returned by the batch fetch endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteMessage {
    /// Long uid (`short_uid@folder_id`).
    pub uid: String,
    pub subject: Option<String>,
    pub date: DateTime<Utc>,
    pub message_id: Option<String>,
    pub in_reply_to: Option<String>,
    /// Raw References header value (angle-bracketed, whitespace-separated).
    pub references: Option<String>,
    pub seen: bool,
    pub is_favorite: bool,
    pub answered: bool,
    pub forwarded: bool,
    pub scheduled: bool,
    pub is_draft: bool,
    pub has_attachments: bool,
}

/// Transient reconciliation record, produced once per refresh round and
/// consumed by the threading engine. Never persisted.
#[derive(Debug, Clone, Default)]
pub struct MessagesUids {
    pub added_short_uids: Vec<u32>,
    /// Long uids; deltas report short uids, converted here.
    pub deleted_uids: Vec<String>,
    pub updated_messages: Vec<FlagUpdate>,
    pub cursor: String,
}

impl MessagesUids {
    pub fn from_listing(listing: UidListing) -> Self {
        Self {
            added_short_uids: listing.added_short_uids,
            cursor: listing.cursor,
            ..Default::default()
        }
    }

    pub fn from_delta(delta: UidDelta, folder_id: &str) -> Self {
        Self {
            added_short_uids: delta.added_short_uids,
            deleted_uids: delta
                .deleted_short_uids
                .iter()
                .map(|short_uid| long_uid(*short_uid, folder_id))
                .collect(),
            updated_messages: delta.updated_messages,
            cursor: delta.cursor,
        }
    }
}

/// Remote mail API client.
#[async_trait]
pub trait MailApi: Send + Sync {
    /// List the folder's current short uids. With `offset_uid`, lists only
    /// messages older than that uid (used by backfill); page-bounded.
    async fn list_uids(
        &self,
        mailbox_uuid: &str,
        folder_id: &str,
        offset_uid: Option<u32>,
    ) -> Result<UidListing>;

    /// Changes since `cursor`.
    async fn delta_uids(
        &self,
        mailbox_uuid: &str,
        folder_id: &str,
        cursor: &str,
    ) -> Result<UidDelta>;

    /// Fetch full messages for a bounded batch of short uids.
    async fn messages_by_uids(
        &self,
        mailbox_uuid: &str,
        folder_id: &str,
        short_uids: &[u32],
    ) -> Result<Vec<RemoteMessage>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delta_conversion_builds_long_uids() {
        let delta = UidDelta {
            added_short_uids: vec![10, 11],
            deleted_short_uids: vec![3],
            updated_messages: vec![],
            cursor: "c2".into(),
        };
        let uids = MessagesUids::from_delta(delta, "f1");
        assert_eq!(uids.deleted_uids, vec!["3@f1".to_string()]);
        assert_eq!(uids.added_short_uids, vec![10, 11]);
        assert_eq!(uids.cursor, "c2");
    }
}
