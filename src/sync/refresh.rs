//! Folder refresh orchestrator.
//!
//! One controller per mailbox. Starting a refresh cancels the previous one
//! (last writer wins); cancellation is cooperative and checked between API
//! calls and inside each write transaction, so a superseded refresh rolls
//! back its in-flight page and keeps everything already committed.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use chrono::Utc;
use tokio::time::{sleep, Instant};
use tracing::{debug, info};

use crate::api::{MailApi, MessagesUids};
use crate::error::{ErrorReporter, LogReporter, MailError, Result};
use crate::models::Thread;
use crate::store::{folders, messages, LocalStore};
use crate::sync::{threading, RefreshMode, RefreshOutcome, MAX_DELAY_BETWEEN_API_CALLS, PAGE_SIZE};

/// Cancellation handle for one refresh round. Checked cooperatively; raising
/// the flag never interrupts a write transaction midway.
#[derive(Clone)]
pub struct Scope {
    cancelled: Arc<AtomicBool>,
}

impl Scope {
    fn new(cancelled: Arc<AtomicBool>) -> Self {
        Self { cancelled }
    }

    /// A scope that is never cancelled, for applying batches outside a
    /// refresh round.
    pub fn detached() -> Self {
        Self::new(Arc::new(AtomicBool::new(false)))
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    pub fn ensure_active(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(MailError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Spaces consecutive API calls out to [`MAX_DELAY_BETWEEN_API_CALLS`].
struct Pacer {
    last_call: Option<Instant>,
}

impl Pacer {
    fn new() -> Self {
        Self { last_call: None }
    }

    async fn pace(&mut self, scope: &Scope) -> Result<()> {
        if let Some(last_call) = self.last_call {
            let elapsed = last_call.elapsed();
            if elapsed < MAX_DELAY_BETWEEN_API_CALLS {
                scope.ensure_active()?;
                sleep(MAX_DELAY_BETWEEN_API_CALLS - elapsed).await;
                scope.ensure_active()?;
            }
        }
        self.last_call = Some(Instant::now());
        Ok(())
    }
}

/// Optional observer hooks invoked around one refresh round.
///
/// `on_stopped` fires when the round ends on its own (completion, quiet
/// non-result or failure) but not when a newer refresh supersedes it; the
/// superseding round carries the spinner from there.
#[derive(Default)]
pub struct RefreshCallbacks {
    pub on_started: Option<Box<dyn Fn() + Send + Sync>>,
    pub on_stopped: Option<Box<dyn Fn() + Send + Sync>>,
}

/// Immutable result of one backfill page.
struct BackfillStep {
    impacted_threads: Vec<Thread>,
    remaining: u32,
    history_complete: bool,
}

impl BackfillStep {
    fn is_terminal(&self) -> bool {
        self.history_complete || self.remaining == 0
    }
}

pub struct RefreshController {
    api: Arc<dyn MailApi>,
    store: Arc<LocalStore>,
    reporter: Arc<dyn ErrorReporter>,
    current: Mutex<Option<Arc<AtomicBool>>>,
}

impl RefreshController {
    pub fn new(api: Arc<dyn MailApi>, store: Arc<LocalStore>) -> Self {
        Self::with_reporter(api, store, Arc::new(LogReporter))
    }

    pub fn with_reporter(
        api: Arc<dyn MailApi>,
        store: Arc<LocalStore>,
        reporter: Arc<dyn ErrorReporter>,
    ) -> Self {
        Self {
            api,
            store,
            reporter,
            current: Mutex::new(None),
        }
    }

    /// Cancel any in-flight refresh and open a scope for a new one.
    fn begin(&self) -> Scope {
        let mut current = self.current.lock().unwrap();
        if let Some(previous) = current.take() {
            previous.store(true, Ordering::Relaxed);
        }
        let flag = Arc::new(AtomicBool::new(false));
        *current = Some(flag.clone());
        Scope::new(flag)
    }

    /// Run one refresh round against `folder_id`.
    ///
    /// Cancellation and the folder disappearing server-side are quiet
    /// outcomes, not errors; anything else is reported and surfaced.
    pub async fn refresh(
        &self,
        mode: RefreshMode,
        mailbox_uuid: &str,
        folder_id: &str,
    ) -> Result<RefreshOutcome> {
        self.refresh_with_callbacks(mode, mailbox_uuid, folder_id, RefreshCallbacks::default())
            .await
    }

    /// [`refresh`](Self::refresh) with observer hooks for the UI layer
    /// (spinner start/stop around the round).
    pub async fn refresh_with_callbacks(
        &self,
        mode: RefreshMode,
        mailbox_uuid: &str,
        folder_id: &str,
        callbacks: RefreshCallbacks,
    ) -> Result<RefreshOutcome> {
        let scope = self.begin();
        info!(folder_id, ?mode, "refreshing folder");
        if let Some(on_started) = &callbacks.on_started {
            on_started();
        }

        let outcome = match self.fetch_messages(&scope, mode, mailbox_uuid, folder_id).await {
            Ok(impacted) => {
                self.report_orphans(folder_id)?;
                Ok(RefreshOutcome::Completed(impacted))
            }
            Err(MailError::Cancelled) => {
                debug!(folder_id, "refresh superseded");
                Ok(RefreshOutcome::Cancelled)
            }
            Err(err) if err.is_recoverable_api_error() => {
                debug!(folder_id, %err, "refresh ended without result");
                Ok(RefreshOutcome::NoResult)
            }
            Err(err) => {
                self.reporter.report(&err);
                Err(err)
            }
        };

        // A superseded round keeps quiet; the round that replaced it owns
        // the stop notification.
        if !matches!(outcome, Ok(RefreshOutcome::Cancelled)) {
            if let Some(on_stopped) = &callbacks.on_stopped {
                on_stopped();
            }
        }
        outcome
    }

    async fn fetch_messages(
        &self,
        scope: &Scope,
        mode: RefreshMode,
        mailbox_uuid: &str,
        folder_id: &str,
    ) -> Result<Vec<Thread>> {
        let mut impacted = match mode {
            RefreshMode::FullFolder => {
                let mut impacted = self
                    .fetch_new_messages(scope, mailbox_uuid, folder_id)
                    .await?;
                impacted.extend(
                    self.fetch_companion_folders(scope, mailbox_uuid, folder_id)
                        .await?,
                );
                impacted
            }
            RefreshMode::FolderOnly => {
                self.fetch_new_messages(scope, mailbox_uuid, folder_id)
                    .await?
            }
            RefreshMode::OnePageOfBackfill => {
                self.fetch_one_page_of_old_messages(scope, mailbox_uuid, folder_id)
                    .await?
                    .impacted_threads
            }
        };

        // Callers only see the target folder's threads, once each.
        impacted.retain(|t| t.folder_id == folder_id);
        let mut seen = BTreeSet::new();
        impacted.retain(|t| seen.insert(t.uid.clone()));
        Ok(impacted)
    }

    /// Opportunistically refresh the role folders paired with the target, so
    /// cross-folder threads (inbox + sent + drafts) stay coherent.
    async fn fetch_companion_folders(
        &self,
        scope: &Scope,
        mailbox_uuid: &str,
        folder_id: &str,
    ) -> Result<Vec<Thread>> {
        let role = self
            .store
            .read(|c| folders::folder(c, folder_id))?
            .map(|f| f.role);
        let Some(role) = role else {
            return Ok(Vec::new());
        };

        let mut impacted = Vec::new();
        for companion_role in role.companion_roles() {
            let companion = self
                .store
                .read(|c| folders::folder_by_role(c, *companion_role))?;
            let Some(companion) = companion else { continue };
            if companion.id == folder_id {
                continue;
            }
            match self
                .fetch_new_messages(scope, mailbox_uuid, &companion.id)
                .await
            {
                Ok(threads) => impacted.extend(threads),
                Err(err) if err.is_recoverable_api_error() => {
                    debug!(folder_id = %companion.id, %err, "skipping companion folder");
                }
                Err(err) => return Err(err),
            }
        }
        Ok(impacted)
    }

    /// Forward sync: delta against the stored cursor, or a full uid listing
    /// when the folder has never been synced. Any remaining backfill quota
    /// is drained afterwards.
    async fn fetch_new_messages(
        &self,
        scope: &Scope,
        mailbox_uuid: &str,
        folder_id: &str,
    ) -> Result<Vec<Thread>> {
        scope.ensure_active()?;
        let folder = self
            .store
            .read(|c| folders::folder(c, folder_id))?
            .ok_or_else(|| MailError::FolderNotFound(folder_id.to_string()))?;

        let uids = match &folder.cursor {
            Some(cursor) => {
                let delta = self
                    .api
                    .delta_uids(mailbox_uuid, folder_id, cursor)
                    .await?;
                MessagesUids::from_delta(delta, folder_id)
            }
            None => {
                let listing = self.api.list_uids(mailbox_uuid, folder_id, None).await?;
                MessagesUids::from_listing(listing)
            }
        };

        let mut impacted = self
            .handle_messages_uids(scope, mailbox_uuid, folder_id, uids, true)
            .await?;

        let remaining = self
            .store
            .read(|c| folders::folder(c, folder_id))?
            .map(|f| f.remaining_old_messages_to_fetch)
            .unwrap_or(0);
        if remaining > 0 {
            impacted.extend(
                self.fetch_old_messages(scope, mailbox_uuid, folder_id)
                    .await?,
            );
        }
        Ok(impacted)
    }

    /// Drain the folder's backfill quota, one page at a time.
    async fn fetch_old_messages(
        &self,
        scope: &Scope,
        mailbox_uuid: &str,
        folder_id: &str,
    ) -> Result<Vec<Thread>> {
        let mut impacted = Vec::new();
        let mut pacer = Pacer::new();
        loop {
            pacer.pace(scope).await?;
            let step = self
                .fetch_one_page_of_old_messages(scope, mailbox_uuid, folder_id)
                .await?;
            let terminal = step.is_terminal();
            impacted.extend(step.impacted_threads);
            if terminal {
                return Ok(impacted);
            }
        }
    }

    /// One page of backfill, anchored on the oldest locally-known short uid.
    async fn fetch_one_page_of_old_messages(
        &self,
        scope: &Scope,
        mailbox_uuid: &str,
        folder_id: &str,
    ) -> Result<BackfillStep> {
        scope.ensure_active()?;
        let oldest = self
            .store
            .read(|c| messages::oldest_message(c, folder_id))?
            .map(|m| m.short_uid);

        // Nothing local, or already at uid 1: there is nothing older.
        let Some(offset_uid) = oldest.filter(|uid| *uid > 1) else {
            self.save_completed_history(folder_id)?;
            return Ok(BackfillStep {
                impacted_threads: Vec::new(),
                remaining: 0,
                history_complete: true,
            });
        };

        let listing = self
            .api
            .list_uids(mailbox_uuid, folder_id, Some(offset_uid))
            .await?;
        if listing.added_short_uids.is_empty() {
            self.save_completed_history(folder_id)?;
            return Ok(BackfillStep {
                impacted_threads: Vec::new(),
                remaining: 0,
                history_complete: true,
            });
        }
        let page_len = listing.added_short_uids.len();

        // Backfill never moves the forward cursor.
        let impacted_threads = self
            .handle_messages_uids(
                scope,
                mailbox_uuid,
                folder_id,
                MessagesUids::from_listing(listing),
                false,
            )
            .await?;

        if page_len < PAGE_SIZE {
            // Short page: the server has no older messages left.
            self.save_completed_history(folder_id)?;
            return Ok(BackfillStep {
                impacted_threads,
                remaining: 0,
                history_complete: true,
            });
        }

        let remaining = self.store.write(|tx| {
            let folder = folders::update_folder(tx, folder_id, |f| {
                f.remaining_old_messages_to_fetch =
                    f.remaining_old_messages_to_fetch.saturating_sub(page_len as u32);
            })?;
            Ok(folder.map(|f| f.remaining_old_messages_to_fetch).unwrap_or(0))
        })?;
        Ok(BackfillStep {
            impacted_threads,
            remaining,
            history_complete: false,
        })
    }

    fn save_completed_history(&self, folder_id: &str) -> Result<()> {
        self.store.write(|tx| {
            folders::update_folder(tx, folder_id, |f| {
                f.remaining_old_messages_to_fetch = 0;
                f.is_history_complete = true;
            })?;
            Ok(())
        })
    }

    /// Apply one reconciliation record: deletions and flag updates in one
    /// transaction, additions page by page, then folder bookkeeping.
    async fn handle_messages_uids(
        &self,
        scope: &Scope,
        mailbox_uuid: &str,
        folder_id: &str,
        uids: MessagesUids,
        should_update_cursor: bool,
    ) -> Result<Vec<Thread>> {
        info!(
            folder_id,
            "Added: {} | Deleted: {} | Updated: {}",
            uids.added_short_uids.len(),
            uids.deleted_uids.len(),
            uids.updated_messages.len(),
        );

        let mut impacted_folder_ids = self.store.write(|tx| {
            let mut ids = threading::handle_deleted_uids(tx, scope, &uids.deleted_uids)?;
            ids.extend(threading::handle_updated_messages(
                tx,
                scope,
                &uids.updated_messages,
                folder_id,
            )?);
            Ok(ids)
        })?;

        let impacted_threads = self
            .handle_added_uids(scope, mailbox_uuid, folder_id, &uids.added_short_uids)
            .await?;
        impacted_folder_ids.extend(impacted_threads.iter().map(|t| t.folder_id.clone()));
        impacted_folder_ids.insert(folder_id.to_string());

        self.store.write(|tx| {
            scope.ensure_active()?;
            for id in &impacted_folder_ids {
                folders::refresh_unread_count(tx, id)?;
            }
            folders::update_folder(tx, folder_id, |f| {
                f.last_updated_at = Some(Utc::now());
                if should_update_cursor {
                    f.cursor = Some(uids.cursor.clone());
                }
            })?;
            Ok(())
        })?;

        self.store.notify(&impacted_folder_ids);
        Ok(impacted_threads)
    }

    /// Fetch and thread the added messages, one page-sized write transaction
    /// per chunk so a cancellation only ever loses the current page.
    async fn handle_added_uids(
        &self,
        scope: &Scope,
        mailbox_uuid: &str,
        folder_id: &str,
        added_short_uids: &[u32],
    ) -> Result<Vec<Thread>> {
        let known = self
            .store
            .read(|c| messages::short_uids_in_folder(c, folder_id))?;
        let new_uids: Vec<u32> = added_short_uids
            .iter()
            .copied()
            .filter(|uid| !known.contains(uid))
            .collect();
        if new_uids.is_empty() {
            return Ok(Vec::new());
        }

        let mut impacted: Vec<Thread> = Vec::new();
        let mut pacer = Pacer::new();
        for chunk in new_uids.chunks(PAGE_SIZE) {
            pacer.pace(scope).await?;
            let remote_messages = self
                .api
                .messages_by_uids(mailbox_uuid, folder_id, chunk)
                .await?;

            let page_threads = self.store.write(|tx| {
                let folder = folders::folder(tx, folder_id)?
                    .ok_or_else(|| MailError::FolderNotFound(folder_id.to_string()))?;
                threading::create_threads_for_added(
                    tx,
                    scope,
                    &folder,
                    &remote_messages,
                    self.reporter.as_ref(),
                )
            })?;

            for thread in page_threads {
                if let Some(existing) = impacted.iter_mut().find(|t| t.uid == thread.uid) {
                    *existing = thread;
                } else {
                    impacted.push(thread);
                }
            }
        }
        Ok(impacted)
    }

    fn report_orphans(&self, folder_id: &str) -> Result<()> {
        let orphans = self.store.read(|c| messages::orphan_count(c, folder_id))?;
        if orphans > 0 {
            self.reporter.anomaly(&format!(
                "{orphans} orphan message(s) left in folder {folder_id} after refresh"
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FlagUpdate, RemoteMessage, UidDelta, UidListing};
    use crate::models::{Folder, FolderRole};
    use crate::store::threads;
    use async_trait::async_trait;
    use chrono::{TimeZone, Utc};
    use std::collections::{HashMap, VecDeque};
    use tokio::sync::Notify;

    struct Gate {
        entered: Notify,
        release: Notify,
    }

    #[derive(Default)]
    struct MockApi {
        listings: Mutex<HashMap<String, VecDeque<UidListing>>>,
        deltas: Mutex<HashMap<String, VecDeque<UidDelta>>>,
        listing_offsets: Mutex<Vec<Option<u32>>>,
        gate: Option<Arc<Gate>>,
    }

    impl MockApi {
        fn push_listing(&self, folder_id: &str, short_uids: Vec<u32>, cursor: &str) {
            self.listings
                .lock()
                .unwrap()
                .entry(folder_id.to_string())
                .or_default()
                .push_back(UidListing {
                    added_short_uids: short_uids,
                    cursor: cursor.to_string(),
                });
        }

        fn push_delta(&self, folder_id: &str, delta: UidDelta) {
            self.deltas
                .lock()
                .unwrap()
                .entry(folder_id.to_string())
                .or_default()
                .push_back(delta);
        }
    }

    #[async_trait]
    impl MailApi for MockApi {
        async fn list_uids(
            &self,
            _mailbox_uuid: &str,
            folder_id: &str,
            offset_uid: Option<u32>,
        ) -> Result<UidListing> {
            self.listing_offsets.lock().unwrap().push(offset_uid);
            let listing = self
                .listings
                .lock()
                .unwrap()
                .get_mut(folder_id)
                .and_then(|queue| queue.pop_front());
            listing.ok_or_else(|| MailError::api("folder__not_exists", "no such folder"))
        }

        async fn delta_uids(
            &self,
            _mailbox_uuid: &str,
            folder_id: &str,
            _cursor: &str,
        ) -> Result<UidDelta> {
            let delta = self
                .deltas
                .lock()
                .unwrap()
                .get_mut(folder_id)
                .and_then(|queue| queue.pop_front());
            delta.ok_or_else(|| MailError::api("folder__not_exists", "no such folder"))
        }

        async fn messages_by_uids(
            &self,
            _mailbox_uuid: &str,
            folder_id: &str,
            short_uids: &[u32],
        ) -> Result<Vec<RemoteMessage>> {
            if let Some(gate) = &self.gate {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
            Ok(short_uids
                .iter()
                .map(|uid| RemoteMessage {
                    uid: format!("{uid}@{folder_id}"),
                    subject: Some(format!("msg {uid}")),
                    date: Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap()
                        + chrono::Duration::seconds(*uid as i64),
                    message_id: Some(format!("<mid-{uid}@{folder_id}>")),
                    in_reply_to: None,
                    references: None,
                    seen: false,
                    is_favorite: false,
                    answered: false,
                    forwarded: false,
                    scheduled: false,
                    is_draft: false,
                    has_attachments: false,
                })
                .collect())
        }
    }

    struct RecordingReporter {
        reports: Mutex<Vec<String>>,
    }

    impl RecordingReporter {
        fn new() -> Self {
            Self {
                reports: Mutex::new(Vec::new()),
            }
        }
    }

    impl ErrorReporter for RecordingReporter {
        fn report(&self, error: &MailError) {
            self.reports.lock().unwrap().push(error.to_string());
        }

        fn anomaly(&self, _message: &str) {}
    }

    fn store_with_folders(specs: &[(&str, &str, FolderRole)]) -> Arc<LocalStore> {
        let store = Arc::new(LocalStore::in_memory().unwrap());
        store
            .write(|tx| {
                for (id, name, role) in specs {
                    folders::upsert_folder(tx, &Folder::new(*id, *name, *role))?;
                }
                Ok(())
            })
            .unwrap();
        store
    }

    fn controller(api: MockApi, store: Arc<LocalStore>) -> RefreshController {
        RefreshController::new(Arc::new(api), store)
    }

    #[tokio::test(start_paused = true)]
    async fn first_sync_uses_full_listing_and_stores_cursor() {
        let store = store_with_folders(&[("inbox", "INBOX", FolderRole::Inbox)]);
        let api = MockApi::default();
        api.push_listing("inbox", vec![1, 2, 3], "c1");
        let controller = controller(api, store.clone());

        let outcome = controller
            .refresh(RefreshMode::FolderOnly, "mbx", "inbox")
            .await
            .unwrap();
        let RefreshOutcome::Completed(threads) = outcome else {
            panic!("expected completion");
        };
        assert_eq!(threads.len(), 3);

        let folder = store.read(|c| folders::folder(c, "inbox")).unwrap().unwrap();
        assert_eq!(folder.cursor.as_deref(), Some("c1"));
        assert!(folder.last_updated_at.is_some());
        assert_eq!(folder.unread_count, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn subsequent_sync_applies_delta() {
        let store = store_with_folders(&[("inbox", "INBOX", FolderRole::Inbox)]);
        let api = MockApi::default();
        api.push_listing("inbox", vec![1, 2], "c1");
        api.push_delta(
            "inbox",
            UidDelta {
                added_short_uids: vec![3],
                deleted_short_uids: vec![1],
                updated_messages: vec![FlagUpdate {
                    short_uid: 2,
                    seen: true,
                    is_favorite: false,
                    answered: false,
                    forwarded: false,
                    scheduled: false,
                }],
                cursor: "c2".into(),
            },
        );
        let controller = controller(api, store.clone());

        controller
            .refresh(RefreshMode::FolderOnly, "mbx", "inbox")
            .await
            .unwrap();
        controller
            .refresh(RefreshMode::FolderOnly, "mbx", "inbox")
            .await
            .unwrap();

        let folder = store.read(|c| folders::folder(c, "inbox")).unwrap().unwrap();
        assert_eq!(folder.cursor.as_deref(), Some("c2"));
        assert!(store.read(|c| messages::message(c, "1@inbox")).unwrap().is_none());
        assert!(store.read(|c| messages::message(c, "3@inbox")).unwrap().is_some());
        let kept = store
            .read(|c| messages::message(c, "2@inbox"))
            .unwrap()
            .unwrap();
        assert!(kept.seen);
        assert_eq!(folder.unread_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn replayed_delta_is_idempotent() {
        let store = store_with_folders(&[("inbox", "INBOX", FolderRole::Inbox)]);
        let api = MockApi::default();
        api.push_listing("inbox", vec![1], "c1");
        for _ in 0..2 {
            api.push_delta(
                "inbox",
                UidDelta {
                    added_short_uids: vec![2],
                    deleted_short_uids: vec![],
                    updated_messages: vec![],
                    cursor: "c2".into(),
                },
            );
        }
        let controller = controller(api, store.clone());

        for _ in 0..3 {
            controller
                .refresh(RefreshMode::FolderOnly, "mbx", "inbox")
                .await
                .unwrap();
        }

        // The replayed addition of uid 2 is filtered against known uids, so
        // the store converges to the same two messages and two threads.
        let count: u32 = store
            .read(|c| Ok(c.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 2);
        let all = store
            .read(|c| threads::threads_in_folder(c, "inbox", threads::ThreadFilter::All))
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_folder_on_server_is_a_quiet_non_result() {
        let store = store_with_folders(&[("inbox", "INBOX", FolderRole::Inbox)]);
        // No scripted listing: the mock answers folder__not_exists.
        let api = MockApi::default();
        let reporter = Arc::new(RecordingReporter::new());
        let controller =
            RefreshController::with_reporter(Arc::new(api), store.clone(), reporter.clone());

        let outcome = controller
            .refresh(RefreshMode::FolderOnly, "mbx", "inbox")
            .await
            .unwrap();
        assert!(matches!(outcome, RefreshOutcome::NoResult));
        assert!(reporter.reports.lock().unwrap().is_empty());

        let folder = store.read(|c| folders::folder(c, "inbox")).unwrap().unwrap();
        assert!(folder.cursor.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_local_folder_is_reported_and_surfaced() {
        let store = store_with_folders(&[]);
        let api = MockApi::default();
        let reporter = Arc::new(RecordingReporter::new());
        let controller =
            RefreshController::with_reporter(Arc::new(api), store, reporter.clone());

        let result = controller
            .refresh(RefreshMode::FolderOnly, "mbx", "nope")
            .await;
        assert!(matches!(result, Err(MailError::FolderNotFound(_))));
        assert_eq!(reporter.reports.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_refresh_backfills_until_short_page() {
        let store = store_with_folders(&[("inbox", "INBOX", FolderRole::Inbox)]);
        store
            .write(|tx| {
                folders::update_folder(tx, "inbox", |f| {
                    f.remaining_old_messages_to_fetch = 60;
                })?;
                Ok(())
            })
            .unwrap();

        let api = MockApi::default();
        // Forward listing, then two backfill pages: a full one and a short
        // terminal one.
        api.push_listing("inbox", (101..=150).rev().collect(), "c1");
        api.push_listing("inbox", (51..=100).rev().collect(), "c1");
        api.push_listing("inbox", (41..=50).rev().collect(), "c1");
        let controller = controller(api, store.clone());

        let outcome = controller
            .refresh(RefreshMode::FullFolder, "mbx", "inbox")
            .await
            .unwrap();
        assert!(matches!(outcome, RefreshOutcome::Completed(_)));

        let folder = store.read(|c| folders::folder(c, "inbox")).unwrap().unwrap();
        assert!(folder.is_history_complete);
        assert_eq!(folder.remaining_old_messages_to_fetch, 0);
        assert_eq!(folder.cursor.as_deref(), Some("c1"));

        let count: u32 = store
            .read(|c| Ok(c.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 110);
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_offsets_from_the_oldest_local_message() {
        let store = store_with_folders(&[("inbox", "INBOX", FolderRole::Inbox)]);
        store
            .write(|tx| {
                folders::update_folder(tx, "inbox", |f| {
                    f.remaining_old_messages_to_fetch = 50;
                })?;
                Ok(())
            })
            .unwrap();
        let api = Arc::new(MockApi::default());
        api.push_listing("inbox", (100..=120).rev().collect(), "c1");
        api.push_listing("inbox", (50..=99).rev().collect(), "c1");
        api.push_listing("inbox", (45..=49).rev().collect(), "c1");
        let controller = RefreshController::new(api.clone(), store.clone());

        controller
            .refresh(RefreshMode::FolderOnly, "mbx", "inbox")
            .await
            .unwrap();

        let folder = store.read(|c| folders::folder(c, "inbox")).unwrap().unwrap();
        // Full page of 50 drained the whole quota; history still open.
        assert_eq!(folder.remaining_old_messages_to_fetch, 0);
        assert!(!folder.is_history_complete);
        // Backfill never advances the cursor past the forward sync's.
        assert_eq!(folder.cursor.as_deref(), Some("c1"));

        let outcome = controller
            .refresh(RefreshMode::OnePageOfBackfill, "mbx", "inbox")
            .await
            .unwrap();
        assert!(matches!(outcome, RefreshOutcome::Completed(_)));

        // Forward listing first (no offset), then each backfill page
        // anchored on the oldest local short uid at that point.
        assert_eq!(
            *api.listing_offsets.lock().unwrap(),
            vec![None, Some(100), Some(50)]
        );
        let folder = store.read(|c| folders::folder(c, "inbox")).unwrap().unwrap();
        assert!(folder.is_history_complete);
        let oldest = store
            .read(|c| messages::oldest_message(c, "inbox"))
            .unwrap()
            .unwrap();
        assert_eq!(oldest.short_uid, 45);
    }

    #[tokio::test(start_paused = true)]
    async fn folder_only_refresh_drains_the_backfill_quota() {
        let store = store_with_folders(&[("inbox", "INBOX", FolderRole::Inbox)]);
        store
            .write(|tx| {
                folders::update_folder(tx, "inbox", |f| {
                    f.remaining_old_messages_to_fetch = 60;
                })?;
                Ok(())
            })
            .unwrap();
        let api = MockApi::default();
        api.push_listing("inbox", (101..=150).rev().collect(), "c1");
        api.push_listing("inbox", (51..=100).rev().collect(), "c1");
        api.push_listing("inbox", (41..=50).rev().collect(), "c1");
        let controller = controller(api, store.clone());

        let outcome = controller
            .refresh(RefreshMode::FolderOnly, "mbx", "inbox")
            .await
            .unwrap();
        assert!(matches!(outcome, RefreshOutcome::Completed(_)));

        // Backfill runs on every forward sync, not just full refreshes.
        let folder = store.read(|c| folders::folder(c, "inbox")).unwrap().unwrap();
        assert_eq!(folder.remaining_old_messages_to_fetch, 0);
        assert!(folder.is_history_complete);
        let count: u32 = store
            .read(|c| Ok(c.query_row("SELECT COUNT(*) FROM messages", [], |r| r.get(0))?))
            .unwrap();
        assert_eq!(count, 110);
    }

    #[tokio::test(start_paused = true)]
    async fn backfill_at_uid_one_completes_immediately() {
        let store = store_with_folders(&[("inbox", "INBOX", FolderRole::Inbox)]);
        let api = MockApi::default();
        api.push_listing("inbox", vec![1, 2, 3], "c1");
        let controller = controller(api, store.clone());

        controller
            .refresh(RefreshMode::FolderOnly, "mbx", "inbox")
            .await
            .unwrap();
        controller
            .refresh(RefreshMode::OnePageOfBackfill, "mbx", "inbox")
            .await
            .unwrap();

        let folder = store.read(|c| folders::folder(c, "inbox")).unwrap().unwrap();
        assert!(folder.is_history_complete);
        assert_eq!(folder.remaining_old_messages_to_fetch, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn full_refresh_covers_companion_role_folders() {
        let store = store_with_folders(&[
            ("inbox", "INBOX", FolderRole::Inbox),
            ("sent", "Sent", FolderRole::Sent),
            ("drafts", "Drafts", FolderRole::Draft),
        ]);
        let api = MockApi::default();
        api.push_listing("inbox", vec![1], "ci");
        api.push_listing("sent", vec![1], "cs");
        api.push_listing("drafts", vec![], "cd");
        let controller = controller(api, store.clone());

        let outcome = controller
            .refresh(RefreshMode::FullFolder, "mbx", "inbox")
            .await
            .unwrap();
        let RefreshOutcome::Completed(threads) = outcome else {
            panic!("expected completion");
        };
        // Only target-folder threads are returned, but the companions synced.
        assert!(threads.iter().all(|t| t.folder_id == "inbox"));
        let sent = store.read(|c| folders::folder(c, "sent")).unwrap().unwrap();
        assert_eq!(sent.cursor.as_deref(), Some("cs"));
        assert!(store.read(|c| messages::message(c, "1@sent")).unwrap().is_some());
        let drafts = store.read(|c| folders::folder(c, "drafts")).unwrap().unwrap();
        assert_eq!(drafts.cursor.as_deref(), Some("cd"));
    }

    #[tokio::test(start_paused = true)]
    async fn callbacks_fire_around_a_completed_round() {
        let store = store_with_folders(&[("inbox", "INBOX", FolderRole::Inbox)]);
        let api = MockApi::default();
        api.push_listing("inbox", vec![1], "c1");
        let controller = controller(api, store);

        let started = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let stopped = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let callbacks = RefreshCallbacks {
            on_started: Some(Box::new({
                let started = started.clone();
                move || {
                    started.fetch_add(1, Ordering::SeqCst);
                }
            })),
            on_stopped: Some(Box::new({
                let stopped = stopped.clone();
                move || {
                    stopped.fetch_add(1, Ordering::SeqCst);
                }
            })),
        };

        controller
            .refresh_with_callbacks(RefreshMode::FolderOnly, "mbx", "inbox", callbacks)
            .await
            .unwrap();
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_callback_is_suppressed_for_a_superseded_round() {
        let store = store_with_folders(&[
            ("inbox", "INBOX", FolderRole::Inbox),
            ("other", "Other", FolderRole::Custom),
        ]);
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let api = MockApi {
            gate: Some(gate.clone()),
            ..MockApi::default()
        };
        api.push_listing("inbox", (1..=60).collect(), "c1");
        api.push_listing("other", vec![], "cx");
        let controller = Arc::new(controller(api, store));

        let started = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let stopped = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let callbacks = RefreshCallbacks {
            on_started: Some(Box::new({
                let started = started.clone();
                move || {
                    started.fetch_add(1, Ordering::SeqCst);
                }
            })),
            on_stopped: Some(Box::new({
                let stopped = stopped.clone();
                move || {
                    stopped.fetch_add(1, Ordering::SeqCst);
                }
            })),
        };

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .refresh_with_callbacks(RefreshMode::FolderOnly, "mbx", "inbox", callbacks)
                    .await
            })
        };
        gate.entered.notified().await;
        controller
            .refresh(RefreshMode::FolderOnly, "mbx", "other")
            .await
            .unwrap();
        gate.release.notify_one();

        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, RefreshOutcome::Cancelled));
        assert_eq!(started.load(Ordering::SeqCst), 1);
        assert_eq!(stopped.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn superseded_refresh_cancels_without_advancing_the_cursor() {
        let store = store_with_folders(&[
            ("inbox", "INBOX", FolderRole::Inbox),
            ("other", "Other", FolderRole::Custom),
        ]);
        let gate = Arc::new(Gate {
            entered: Notify::new(),
            release: Notify::new(),
        });
        let api = MockApi {
            gate: Some(gate.clone()),
            ..MockApi::default()
        };
        api.push_listing("inbox", (1..=120).collect(), "c1");
        api.push_listing("other", vec![], "cx");
        let controller = Arc::new(controller(api, store.clone()));

        let first = {
            let controller = controller.clone();
            tokio::spawn(async move {
                controller
                    .refresh(RefreshMode::FolderOnly, "mbx", "inbox")
                    .await
            })
        };
        // First refresh is now blocked inside its first message-fetch page.
        gate.entered.notified().await;

        // A second refresh supersedes it ("other" has no additions, so it
        // never touches the gate).
        controller
            .refresh(RefreshMode::FolderOnly, "mbx", "other")
            .await
            .unwrap();
        gate.release.notify_one();

        let outcome = first.await.unwrap().unwrap();
        assert!(matches!(outcome, RefreshOutcome::Cancelled));

        // The cancelled page rolled back: no cursor, no messages.
        let folder = store.read(|c| folders::folder(c, "inbox")).unwrap().unwrap();
        assert!(folder.cursor.is_none());
        let count: u32 = store
            .read(|c| {
                Ok(c.query_row(
                    "SELECT COUNT(*) FROM messages WHERE folder_id = 'inbox'",
                    [],
                    |r| r.get(0),
                )?)
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
