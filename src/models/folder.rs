use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// How many old messages a freshly created folder is allowed to backfill.
pub const INITIAL_BACKFILL_QUOTA: u32 = 500;

/// Well-known folder roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderRole {
    Inbox,
    Sent,
    Draft,
    Trash,
    Spam,
    Archive,
    Custom,
}

impl FolderRole {
    pub fn as_str(self) -> &'static str {
        match self {
            FolderRole::Inbox => "inbox",
            FolderRole::Sent => "sent",
            FolderRole::Draft => "draft",
            FolderRole::Trash => "trash",
            FolderRole::Spam => "spam",
            FolderRole::Archive => "archive",
            FolderRole::Custom => "custom",
        }
    }

    pub fn parse(value: &str) -> FolderRole {
        match value {
            "inbox" => FolderRole::Inbox,
            "sent" => FolderRole::Sent,
            "draft" => FolderRole::Draft,
            "trash" => FolderRole::Trash,
            "spam" => FolderRole::Spam,
            "archive" => FolderRole::Archive,
            _ => FolderRole::Custom,
        }
    }

    /// Role folders refreshed opportunistically alongside this one, so that
    /// cross-folder thread aggregates stay fresh.
    pub fn companion_roles(self) -> &'static [FolderRole] {
        match self {
            FolderRole::Inbox => &[FolderRole::Sent, FolderRole::Draft],
            FolderRole::Sent => &[FolderRole::Inbox, FolderRole::Draft],
            FolderRole::Draft => &[FolderRole::Inbox, FolderRole::Sent],
            _ => &[],
        }
    }
}

/// A mailbox folder and its synchronization state.
///
/// `cursor == None` means the folder has never been synced and needs a full
/// uid listing. The cursor only advances after a fully-applied forward batch;
/// backfill never touches it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub role: FolderRole,
    pub cursor: Option<String>,
    pub remaining_old_messages_to_fetch: u32,
    pub is_history_complete: bool,
    pub unread_count: u32,
    pub last_updated_at: Option<DateTime<Utc>>,
}

impl Folder {
    pub fn new(id: impl Into<String>, name: impl Into<String>, role: FolderRole) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            role,
            cursor: None,
            remaining_old_messages_to_fetch: INITIAL_BACKFILL_QUOTA,
            is_history_complete: false,
            unread_count: 0,
            last_updated_at: None,
        }
    }
}
