//! Folder refresh orchestration and message threading.
//!
//! [`refresh::RefreshController`] drives the network rounds (delta vs full
//! listing, paging, backfill, cancellation); [`threading`] applies each batch
//! of reconciled uids to the local thread graph inside a single write
//! transaction.

pub mod refresh;
pub mod threading;

use std::time::Duration;

use crate::models::Thread;

/// Page size for uid listings and batched message fetches.
pub const PAGE_SIZE: usize = 50;

/// Minimum spacing between consecutive paged API calls.
pub const MAX_DELAY_BETWEEN_API_CALLS: Duration = Duration::from_millis(500);

/// What a refresh round should cover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshMode {
    /// New messages for the target folder plus its companion role folders,
    /// then drain the target folder's backfill quota.
    FullFolder,
    /// New messages for the target folder only.
    FolderOnly,
    /// A single page of backfill, no forward sync.
    OnePageOfBackfill,
}

/// Terminal state of a refresh round.
#[derive(Debug, Clone)]
pub enum RefreshOutcome {
    /// The round ran to completion; carries the threads it touched in the
    /// target folder.
    Completed(Vec<Thread>),
    /// A newer refresh superseded this one. Partial work was committed
    /// page by page and remains valid.
    Cancelled,
    /// The round could not produce a result but the failure is recoverable
    /// (the folder disappeared server-side).
    NoResult,
}
