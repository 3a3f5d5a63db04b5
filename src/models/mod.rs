//! Data model: folders, messages, threads
//!
//! Entities are plain structs keyed by stable string identifiers; all
//! relationships (thread membership, draft mirrors) are id-based so the
//! storage layer can delete rows without chasing object pointers.

mod folder;
mod message;
mod thread;

pub use folder::{Folder, FolderRole, INITIAL_BACKFILL_QUOTA};
pub use message::Message;
pub use thread::Thread;

/// Build the globally-unique long uid from a per-folder short uid.
pub fn long_uid(short_uid: u32, folder_id: &str) -> String {
    format!("{short_uid}@{folder_id}")
}

/// Extract the short uid component of a long uid.
pub fn short_uid_of(uid: &str) -> Option<u32> {
    uid.split('@').next()?.parse().ok()
}
