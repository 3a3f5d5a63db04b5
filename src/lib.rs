//! Mailbox synchronization and threading engine.
//!
//! The crate keeps a local SQLite cache of a remote mailbox in sync and
//! maintains per-folder conversation threads over it:
//!
//! - [`api::MailApi`] is the remote seam: uid listings, uid deltas and
//!   batched message fetches.
//! - [`store::LocalStore`] is the transactional cache; repositories under
//!   [`store`] cover folders, messages and threads.
//! - [`sync::refresh::RefreshController`] orchestrates refresh rounds
//!   (delta vs full listing, paging, historical backfill, cancellation) and
//!   [`sync::threading`] maintains the thread graph batch by batch.
//!
//! A refresh is driven per folder:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use mailcache::store::LocalStore;
//! # use mailcache::sync::{refresh::RefreshController, RefreshMode};
//! # async fn run(api: Arc<dyn mailcache::api::MailApi>) -> mailcache::error::Result<()> {
//! let store = Arc::new(LocalStore::open("mailbox.db")?);
//! let controller = RefreshController::new(api, store);
//! controller
//!     .refresh(RefreshMode::FullFolder, "mailbox-uuid", "folder-id")
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod api;
pub mod error;
pub mod models;
pub mod store;
pub mod sync;

pub use error::{MailError, Result};
pub use models::{Folder, FolderRole, Message, Thread};
pub use sync::{RefreshMode, RefreshOutcome};
