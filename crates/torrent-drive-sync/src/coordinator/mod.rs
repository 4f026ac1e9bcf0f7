//! Pipeline coordinator - drives transfer items to completion.
//!
//! For every requested item the coordinator advances the per-item state
//! machine (`Pending -> Downloading -> Downloaded -> Uploading ->
//! Completed`, failures to `Failed`), reusing completed phases recorded
//! in the session store and saving the store after every transition so a
//! crash loses at most the in-flight phase.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cloud::{plan_tree, publish_tree, CloudStore, PublishFilter, PublishOptions, PublishOutcome};
use crate::config::Config;
use crate::engine::{AcquireHandle, TorrentEngine};
use crate::error::{Result, SyncError};
use crate::retry::RetryPolicy;
use crate::session::{FailedPhase, ItemKind, Phase, SessionState, SessionStore, TransferItem};
use crate::source::TorrentSource;

/// One unit of requested work, resolved at CLI parse time.
#[derive(Debug, Clone)]
pub enum TransferRequest {
    /// Acquire a torrent, optionally publishing it afterwards.
    Torrent(TorrentSource),
    /// Publish an existing local file or folder.
    LocalPath(PathBuf),
}

/// Per-run behavior switches. These are configuration inputs; the
/// resume/skip decisions they influence live in the coordinator.
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Publish downloaded content to the cloud drive.
    pub upload: bool,

    /// Destination folder id; falls back to the configured default.
    pub folder_id: Option<String>,

    /// Reuse prior download-phase state (default). When false, acquire
    /// runs again for `Downloaded` items; completed publishes are never
    /// regressed by this flag alone.
    pub resume: bool,

    /// Treat already-completed items and already-present remote files as
    /// done (default). When false, completed items are redone.
    pub skip_existing: bool,

    /// Preview the publish phase without touching the cloud or the
    /// session.
    pub dry_run: bool,

    /// Parallel publish workers; falls back to the configured value.
    pub workers: Option<usize>,

    /// Include globs for folder publishing.
    pub include: Vec<String>,

    /// Exclude globs for folder publishing.
    pub exclude: Vec<String>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            upload: false,
            folder_id: None,
            resume: true,
            skip_existing: true,
            dry_run: false,
            workers: None,
            include: Vec::new(),
            exclude: Vec::new(),
        }
    }
}

/// Download progress notification for user-facing rendering.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Display name of the item.
    pub item: String,
    pub bytes_done: u64,
    pub bytes_total: u64,
}

/// Final state of one item after a run.
#[derive(Debug, Clone, Serialize)]
pub struct ItemOutcome {
    pub identifier: String,
    pub name: String,
    pub phase: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// The item was already complete and no collaborator was contacted.
    pub skipped: bool,
}

/// Result of a coordinator run.
#[derive(Debug, Clone, Serialize)]
pub struct SyncResult {
    /// Unique run identifier.
    pub run_id: String,

    /// When the run started.
    pub started_at: DateTime<Utc>,

    /// When the run completed.
    pub completed_at: DateTime<Utc>,

    /// Total duration in seconds.
    pub duration_seconds: f64,

    /// Items requested in this run.
    pub items_total: usize,

    /// Items that reached `Completed` in this run.
    pub items_completed: usize,

    /// Items reported as already done without collaborator calls.
    pub items_skipped: usize,

    /// Items that ended in `Failed`.
    pub items_failed: usize,

    /// Per-item outcomes, in request order.
    pub outcomes: Vec<ItemOutcome>,
}

impl SyncResult {
    /// Serialize for `--output-json`.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

/// Pipeline coordinator.
///
/// Holds the injected session store and collaborator handles for one
/// run; the durable record is loaded at run start and saved after every
/// phase transition, never implicitly reloaded mid-run.
pub struct Coordinator {
    config: Config,
    store: SessionStore,
    options: RunOptions,
    engine: Option<Arc<dyn TorrentEngine>>,
    cloud: Option<Arc<dyn CloudStore>>,
    progress: Option<mpsc::Sender<ProgressEvent>>,
}

impl Coordinator {
    /// Create a coordinator over the given store.
    pub fn new(config: Config, store: SessionStore, options: RunOptions) -> Self {
        Self {
            config,
            store,
            options,
            engine: None,
            cloud: None,
            progress: None,
        }
    }

    /// Attach the torrent engine used for the acquire phase.
    pub fn with_engine(mut self, engine: Arc<dyn TorrentEngine>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Attach the cloud store used for the publish phase.
    pub fn with_cloud(mut self, cloud: Arc<dyn CloudStore>) -> Self {
        self.cloud = Some(cloud);
        self
    }

    /// Attach a channel receiving download progress events.
    pub fn with_progress(mut self, sender: mpsc::Sender<ProgressEvent>) -> Self {
        self.progress = Some(sender);
        self
    }

    /// Run the pipeline for the requested items.
    ///
    /// Per-item acquire/publish failures are absorbed into the item
    /// (retried up to the configured limit, then `Failed`); only
    /// configuration problems, session corruption, and cancellation
    /// abort the run itself.
    pub async fn run(
        &self,
        requests: Vec<TransferRequest>,
        cancel: CancellationToken,
    ) -> Result<SyncResult> {
        let started_at = Utc::now();
        let run_id = uuid::Uuid::new_v4().to_string();

        // Fail on bad input before any external call.
        let folder_id = self.effective_folder_id()?;
        let filter = PublishFilter::new(&self.options.include, &self.options.exclude)?;
        if requests.is_empty() {
            return Err(SyncError::Config("Nothing to transfer".to_string()));
        }

        let _lock = self.store.lock()?;
        let mut state = self.store.load()?;

        let healed = state.heal_in_flight();
        if healed > 0 {
            info!("Healed {healed} item(s) left mid-phase by a previous run");
        }

        info!("Starting run {run_id}: {} item(s)", requests.len());

        // Admission: create or reconcile one item per request.
        let mut run_ids = Vec::new();
        let mut seen = HashSet::new();
        for request in &requests {
            let id = self.admit(&mut state, request)?;
            if seen.insert(id.clone()) {
                run_ids.push(id);
            }
        }
        let skipped: HashSet<String> = run_ids
            .iter()
            .filter(|id| state.items[*id].phase == Phase::Completed)
            .cloned()
            .collect();
        self.store.save(&mut state)?;

        if self.options.dry_run {
            self.plan_run(&state, &run_ids, &filter)?;
        } else {
            // Phase 1: acquire.
            for id in &run_ids {
                if cancel.is_cancelled() {
                    break;
                }
                let (phase, kind) = {
                    let item = &state.items[id];
                    (item.phase, item.kind)
                };
                if phase != Phase::Pending {
                    if phase == Phase::Downloaded {
                        debug!("{id}: already downloaded, acquire skipped");
                    }
                    continue;
                }
                match kind {
                    ItemKind::LocalPath => self.acquire_local(&mut state, id)?,
                    ItemKind::Torrent => self.acquire_torrent(&mut state, id, &cancel).await?,
                }
            }

            // Download-only mode: a downloaded item is done.
            if !self.options.upload && !cancel.is_cancelled() {
                for id in &run_ids {
                    if state.items[id].phase == Phase::Downloaded {
                        with_item(&mut state, id, |item| item.complete_local())?;
                        self.store.save(&mut state)?;
                    }
                }
            }

            // Phase 2: publish.
            if self.options.upload && !cancel.is_cancelled() {
                let folder_id = folder_id.ok_or_else(|| {
                    SyncError::Config("--folder-id is required when uploading".to_string())
                })?;
                self.publish_items(&mut state, &run_ids, &folder_id, &filter, &cancel)
                    .await?;
            }
        }

        if cancel.is_cancelled() {
            // Discard in-flight phases; the store keeps the last
            // completed one and the next run resumes from there.
            state.heal_in_flight();
            self.store.save(&mut state)?;
            return Err(SyncError::Cancelled);
        }

        self.store.save(&mut state)?;

        let completed_at = Utc::now();
        let duration = (completed_at - started_at).num_milliseconds() as f64 / 1000.0;

        let mut result = SyncResult {
            run_id,
            started_at,
            completed_at,
            duration_seconds: duration,
            items_total: run_ids.len(),
            items_completed: 0,
            items_skipped: 0,
            items_failed: 0,
            outcomes: Vec::with_capacity(run_ids.len()),
        };

        for id in &run_ids {
            let item = &state.items[id];
            let was_skipped = skipped.contains(id);
            match item.phase {
                Phase::Completed if was_skipped => result.items_skipped += 1,
                Phase::Completed => result.items_completed += 1,
                Phase::Failed => result.items_failed += 1,
                _ => {}
            }
            result.outcomes.push(ItemOutcome {
                identifier: id.clone(),
                name: item.display_name.clone(),
                phase: item.phase,
                error: item.last_error.clone(),
                skipped: was_skipped,
            });
        }

        info!(
            "Run {}: {} item(s), {} completed, {} skipped, {} failed in {:.1}s",
            result.run_id,
            result.items_total,
            result.items_completed,
            result.items_skipped,
            result.items_failed,
            result.duration_seconds
        );

        Ok(result)
    }

    /// Resolve the effective publish folder, validating early.
    fn effective_folder_id(&self) -> Result<Option<String>> {
        if !self.options.upload {
            return Ok(None);
        }
        let folder = self
            .options
            .folder_id
            .clone()
            .or_else(|| self.config.upload.folder_id.clone());
        match folder {
            Some(f) if !f.is_empty() => Ok(Some(f)),
            _ => Err(SyncError::Config(
                "--folder-id is required when uploading".to_string(),
            )),
        }
    }

    /// Create or reconcile the session item for one request.
    fn admit(&self, state: &mut SessionState, request: &TransferRequest) -> Result<String> {
        let (id, new_item) = match request {
            TransferRequest::Torrent(source) => {
                let id = source.identifier()?;
                (
                    id.clone(),
                    TransferItem::new_torrent(
                        id,
                        source.as_engine_argument(),
                        source.display_name(),
                    ),
                )
            }
            TransferRequest::LocalPath(path) => {
                let canonical = path.canonicalize().map_err(|e| {
                    SyncError::Config(format!("Cannot resolve path {}: {e}", path.display()))
                })?;
                let id = crate::source::identifier_for_path(&canonical)?;
                (id.clone(), TransferItem::new_local(id, &canonical))
            }
        };

        match state.items.get_mut(&id) {
            Some(item) => {
                match item.phase {
                    Phase::Completed if !self.options.skip_existing => {
                        info!("{}: redoing completed item (no-skip)", item.display_name);
                        item.force_restart();
                    }
                    Phase::Completed => {
                        info!("{}: already completed, skipping", item.display_name);
                    }
                    // Re-requesting a failed item is the explicit retry
                    // instruction.
                    Phase::Failed => item.reset_for_retry()?,
                    _ => {}
                }
                if !self.options.resume {
                    item.force_redownload();
                }
            }
            None => {
                state.items.insert(id.clone(), new_item);
            }
        }

        Ok(id)
    }

    /// Dry run: report what the publish phase would upload.
    fn plan_run(&self, state: &SessionState, run_ids: &[String], filter: &PublishFilter) -> Result<()> {
        for id in run_ids {
            let item = &state.items[id];
            let path = match (&item.local_path, item.kind) {
                (Some(path), _) => path.clone(),
                (None, ItemKind::LocalPath) => PathBuf::from(&item.source),
                (None, ItemKind::Torrent) => {
                    info!("[dry-run] {}: not downloaded yet, nothing to plan", item.display_name);
                    continue;
                }
            };
            let plan = plan_tree(&path, filter)?;
            info!(
                "[dry-run] {}: would upload {} file(s) in {} folder(s), {:.2} MiB",
                item.display_name,
                plan.files,
                plan.folders,
                plan.total_bytes as f64 / (1024.0 * 1024.0)
            );
        }
        Ok(())
    }

    /// Acquire for a local path: the content is already on disk, so this
    /// reduces to an existence check. No collaborator is contacted.
    fn acquire_local(&self, state: &mut SessionState, id: &str) -> Result<()> {
        with_item(state, id, |item| item.begin_download())?;
        self.store.save(state)?;

        let source = state.items[id].source.clone();
        let path = PathBuf::from(&source);
        if path.exists() {
            with_item(state, id, |item| item.mark_downloaded(path.clone()))?;
        } else {
            let err = SyncError::acquire(&source, "local path no longer exists");
            warn!("{err}");
            with_item(state, id, |item| {
                item.download_attempts += 1;
                item.mark_failed(FailedPhase::Download, &err)
            })?;
        }
        self.store.save(state)
    }

    /// Acquire a torrent through the engine, with bounded retries.
    async fn acquire_torrent(
        &self,
        state: &mut SessionState,
        id: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let engine = self
            .engine
            .clone()
            .ok_or_else(|| SyncError::Config("No torrent engine configured".to_string()))?;
        let retry = self.config.transfer.retry_policy();

        let (source_str, name, dest) = {
            let item = &state.items[id];
            (item.source.clone(), item.display_name.clone(), self.item_dest_dir(item))
        };
        let source = TorrentSource::parse(&source_str)?;

        with_item(state, id, |item| item.begin_download())?;
        self.store.save(state)?;
        info!("{name}: acquiring into {}", dest.display());

        loop {
            let attempt = with_item(state, id, |item| {
                item.download_attempts += 1;
                Ok(item.download_attempts)
            })?;
            self.store.save(state)?;

            let result = match engine.start(&source, &dest).await {
                Ok(handle) => self.watch_acquire(handle.as_ref(), &name, cancel).await,
                Err(e) => Err(e),
            };

            match result {
                Ok(()) => {
                    let local = resolve_downloaded_path(&dest);
                    info!("{name}: download complete at {}", local.display());
                    with_item(state, id, |item| item.mark_downloaded(local))?;
                    self.store.save(state)?;
                    return Ok(());
                }
                Err(SyncError::Cancelled) => {
                    // Leave the item mid-phase; healing at run end (or
                    // on the next run) regresses it to Pending.
                    return Ok(());
                }
                Err(e) if e.is_retryable() && retry.allows_another(attempt) => {
                    let delay = retry.delay_after(attempt);
                    warn!(
                        "{name}: acquire attempt {attempt}/{} failed: {e}; retrying in {:.1}s",
                        retry.max_attempts,
                        delay.as_secs_f64()
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    warn!("{name}: acquire failed after {attempt} attempt(s): {e}");
                    with_item(state, id, |item| item.mark_failed(FailedPhase::Download, &e))?;
                    self.store.save(state)?;
                    return Ok(());
                }
            }
        }
    }

    /// Wait for an acquire to finish while forwarding progress.
    async fn watch_acquire(
        &self,
        handle: &dyn AcquireHandle,
        name: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let mut wait = handle.wait_complete(cancel.clone());
        let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                result = &mut wait => return result,
                _ = ticker.tick() => {
                    let progress = handle.progress();
                    if let Some(sender) = &self.progress {
                        let _ = sender.try_send(ProgressEvent {
                            item: name.to_string(),
                            bytes_done: progress.bytes_done,
                            bytes_total: progress.bytes_total,
                        });
                    }
                    debug!(
                        "{name}: {:.1}% ({}/{} bytes)",
                        progress.percent(),
                        progress.bytes_done,
                        progress.bytes_total
                    );
                }
            }
        }
    }

    /// Publish all downloaded items, fanning out across workers.
    ///
    /// Distinct items upload independently; state saves are serialized
    /// through this method as each task finishes, so at most one phase
    /// transition is in flight per identifier.
    async fn publish_items(
        &self,
        state: &mut SessionState,
        run_ids: &[String],
        folder_id: &str,
        filter: &PublishFilter,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let cloud = self
            .cloud
            .clone()
            .ok_or_else(|| SyncError::Config("No cloud store configured".to_string()))?;

        let candidates: Vec<String> = run_ids
            .iter()
            .filter(|id| state.items[*id].phase == Phase::Downloaded)
            .cloned()
            .collect();
        if candidates.is_empty() {
            return Ok(());
        }

        let workers = self
            .options
            .workers
            .unwrap_or_else(|| self.config.transfer.get_workers())
            .max(1);
        let retry = self.config.transfer.retry_policy();
        let semaphore = Arc::new(Semaphore::new(workers));

        info!(
            "Publishing {} item(s) with {} worker(s)",
            candidates.len(),
            workers
        );

        let mut handles = Vec::new();
        for id in candidates {
            if cancel.is_cancelled() {
                break;
            }

            let (path, name) = {
                let item = &state.items[&id];
                let path = item.local_path.clone().ok_or_else(|| {
                    SyncError::Config(format!("{}: downloaded item has no local path", id))
                })?;
                (path, item.display_name.clone())
            };

            with_item(state, &id, |item| item.begin_upload())?;
            self.store.save(state)?;

            let permit = semaphore.clone().acquire_owned().await.unwrap();
            let cloud = cloud.clone();
            let options = PublishOptions {
                chunk_size: self.config.upload.chunk_size(),
                skip_existing: self.options.skip_existing,
                filter: filter.clone(),
            };
            let folder = folder_id.to_string();
            let task_cancel = cancel.clone();

            let handle = tokio::spawn(async move {
                let result =
                    publish_with_retry(cloud, &path, &folder, options, retry, task_cancel, &name)
                        .await;
                drop(permit);
                result
            });
            handles.push((id, handle));
        }

        for (id, handle) in handles {
            let (attempts, outcome) = match handle.await {
                Ok(r) => r,
                Err(e) => (
                    0,
                    Err(SyncError::publish(
                        crate::error::PublishErrorKind::Network,
                        format!("publish task panicked: {e}"),
                    )),
                ),
            };

            with_item(state, &id, |item| {
                item.upload_attempts += attempts;
                Ok(())
            })?;

            match outcome {
                Ok(published) => {
                    info!(
                        "{id}: published as {} ({} uploaded, {} skipped)",
                        published.remote.id, published.files_uploaded, published.files_skipped
                    );
                    with_item(state, &id, |item| {
                        item.complete_via_publish(published.remote.id.clone())
                    })?;
                }
                Err(SyncError::Cancelled) => {
                    // Left mid-phase; healed at run end.
                }
                Err(e) => {
                    warn!("{id}: publish failed: {e}");
                    with_item(state, &id, |item| item.mark_failed(FailedPhase::Upload, &e))?;
                }
            }
            self.store.save(state)?;
        }

        Ok(())
    }

    /// Per-item download directory under the configured destination.
    fn item_dest_dir(&self, item: &TransferItem) -> PathBuf {
        let sanitized: String = item
            .display_name
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '_') {
                    c
                } else {
                    '_'
                }
            })
            .take(40)
            .collect();
        let short = &item.identifier[..item.identifier.len().min(8)];
        self.config
            .download
            .destination
            .join(format!("{sanitized}-{short}"))
    }
}

/// Apply a mutation to one item, with a uniform missing-item error.
fn with_item<R>(
    state: &mut SessionState,
    id: &str,
    f: impl FnOnce(&mut TransferItem) -> Result<R>,
) -> Result<R> {
    let item = state
        .items
        .get_mut(id)
        .ok_or_else(|| SyncError::Config(format!("Unknown session item: {id}")))?;
    f(item)
}

/// Where the acquired content actually is: the engine writes the torrent
/// under the per-item directory, so a single top-level entry is the
/// content itself and anything else means the directory is the content.
fn resolve_downloaded_path(dest: &Path) -> PathBuf {
    let entries: Vec<PathBuf> = std::fs::read_dir(dest)
        .map(|it| it.flatten().map(|e| e.path()).collect())
        .unwrap_or_default();
    match entries.as_slice() {
        [single] => single.clone(),
        _ => dest.to_path_buf(),
    }
}

/// Publish one item with bounded retries. Runs on a worker task; attempt
/// accounting is returned to the coordinator, which owns the state.
async fn publish_with_retry(
    cloud: Arc<dyn CloudStore>,
    path: &Path,
    folder_id: &str,
    options: PublishOptions,
    retry: RetryPolicy,
    cancel: CancellationToken,
    name: &str,
) -> (u32, Result<PublishOutcome>) {
    let mut attempt = 0;
    loop {
        attempt += 1;

        let result = tokio::select! {
            _ = cancel.cancelled() => Err(SyncError::Cancelled),
            result = publish_tree(cloud.as_ref(), path, folder_id, &options) => result,
        };

        match result {
            Ok(outcome) => return (attempt, Ok(outcome)),
            Err(SyncError::Cancelled) => return (attempt, Err(SyncError::Cancelled)),
            Err(e) if e.is_retryable() && retry.allows_another(attempt) => {
                let delay = retry.delay_after(attempt);
                warn!(
                    "{name}: publish attempt {attempt}/{} failed: {e}; retrying in {:.1}s",
                    retry.max_attempts,
                    delay.as_secs_f64()
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => return (attempt, Err(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::RemoteRef;
    use crate::engine::{AcquireProgress, AcquireState};
    use crate::error::PublishErrorKind;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

    const MAGNET_A: &str =
        "magnet:?xt=urn:btih:aab507494d02ebb1178b38f2e9d7be299c86b862&dn=item-a";
    const MAGNET_B: &str =
        "magnet:?xt=urn:btih:bbb507494d02ebb1178b38f2e9d7be299c86b862&dn=item-b";

    /// Engine that "downloads" by writing a payload file, failing the
    /// first `fail_attempts` starts.
    struct MockEngine {
        starts: AtomicUsize,
        fail_attempts: AtomicU32,
    }

    impl MockEngine {
        fn new(fail_attempts: u32) -> Arc<Self> {
            Arc::new(Self {
                starts: AtomicUsize::new(0),
                fail_attempts: AtomicU32::new(fail_attempts),
            })
        }

        fn starts(&self) -> usize {
            self.starts.load(Ordering::SeqCst)
        }
    }

    struct MockHandle;

    #[async_trait]
    impl AcquireHandle for MockHandle {
        fn progress(&self) -> AcquireProgress {
            AcquireProgress {
                bytes_done: 4,
                bytes_total: 4,
                state: AcquireState::Complete,
            }
        }

        async fn wait_complete(&self, _cancel: CancellationToken) -> Result<()> {
            Ok(())
        }

        fn cancel(&self) {}
    }

    #[async_trait]
    impl TorrentEngine for MockEngine {
        async fn start(
            &self,
            source: &TorrentSource,
            dest: &Path,
        ) -> Result<Box<dyn AcquireHandle>> {
            self.starts.fetch_add(1, Ordering::SeqCst);
            if self
                .fail_attempts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SyncError::acquire(source.as_engine_argument(), "no peers"));
            }
            std::fs::create_dir_all(dest)?;
            std::fs::write(dest.join("payload.bin"), b"data")?;
            Ok(Box::new(MockHandle))
        }
    }

    /// Cloud that counts calls, failing the first `fail_attempts`
    /// uploads with the given kind.
    struct MockCloud {
        uploads: AtomicUsize,
        lookups: AtomicUsize,
        folders: AtomicUsize,
        fail_attempts: AtomicU32,
        fail_kind: PublishErrorKind,
    }

    impl MockCloud {
        fn new() -> Arc<Self> {
            Self::failing(0, PublishErrorKind::Network)
        }

        fn failing(fail_attempts: u32, fail_kind: PublishErrorKind) -> Arc<Self> {
            Arc::new(Self {
                uploads: AtomicUsize::new(0),
                lookups: AtomicUsize::new(0),
                folders: AtomicUsize::new(0),
                fail_attempts: AtomicU32::new(fail_attempts),
                fail_kind,
            })
        }

        fn calls(&self) -> usize {
            self.uploads.load(Ordering::SeqCst)
                + self.lookups.load(Ordering::SeqCst)
                + self.folders.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl CloudStore for MockCloud {
        async fn upload_file(
            &self,
            path: &Path,
            _folder_id: &str,
            _chunk_size: u64,
        ) -> Result<RemoteRef> {
            if self
                .fail_attempts
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(SyncError::publish(self.fail_kind, "injected failure"));
            }
            let n = self.uploads.fetch_add(1, Ordering::SeqCst);
            Ok(RemoteRef {
                id: format!("file-{n}"),
                name: path.file_name().unwrap().to_string_lossy().into_owned(),
            })
        }

        async fn find_existing(&self, _name: &str, _folder_id: &str) -> Result<Option<RemoteRef>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(None)
        }

        async fn create_folder(&self, name: &str, _parent_id: &str) -> Result<RemoteRef> {
            let n = self.folders.fetch_add(1, Ordering::SeqCst);
            Ok(RemoteRef {
                id: format!("folder-{n}"),
                name: name.to_string(),
            })
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        config: Config,
        store: SessionStore,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.download.destination = dir.path().join("downloads");
        config.transfer.retry_base_delay_ms = Some(0);
        config.session_file = dir.path().join("session.json");
        let store = SessionStore::new(&config.session_file);
        Fixture {
            _dir: dir,
            config,
            store,
        }
    }

    fn coordinator(
        fixture: &Fixture,
        options: RunOptions,
        engine: Arc<MockEngine>,
        cloud: Arc<MockCloud>,
    ) -> Coordinator {
        Coordinator::new(fixture.config.clone(), fixture.store.clone(), options)
            .with_engine(engine)
            .with_cloud(cloud)
    }

    fn magnet_request(link: &str) -> TransferRequest {
        TransferRequest::Torrent(TorrentSource::parse(link).unwrap())
    }

    /// Seed the store with one item in the given phase.
    fn seed_item(fixture: &Fixture, link: &str, phase: Phase) -> String {
        let source = TorrentSource::parse(link).unwrap();
        let id = source.identifier().unwrap();
        let mut item = TransferItem::new_torrent(
            id.clone(),
            source.as_engine_argument(),
            source.display_name(),
        );

        if phase != Phase::Pending {
            item.begin_download().unwrap();
        }
        if matches!(phase, Phase::Downloaded | Phase::Uploading | Phase::Completed) {
            let payload_dir = fixture.config.download.destination.join(&id[..8]);
            std::fs::create_dir_all(&payload_dir).unwrap();
            std::fs::write(payload_dir.join("payload.bin"), b"data").unwrap();
            item.mark_downloaded(payload_dir.join("payload.bin")).unwrap();
        }
        if phase == Phase::Uploading {
            item.begin_upload().unwrap();
        }
        if phase == Phase::Completed {
            item.begin_upload().unwrap();
            item.complete_via_publish("seeded-remote".to_string()).unwrap();
        }

        let mut state = fixture.store.load().unwrap();
        state.items.insert(id.clone(), item);
        fixture.store.save(&mut state).unwrap();
        id
    }

    #[tokio::test]
    async fn test_completed_item_with_skip_makes_zero_calls() {
        let fx = fixture();
        let id = seed_item(&fx, MAGNET_A, Phase::Completed);
        let engine = MockEngine::new(0);
        let cloud = MockCloud::new();

        let options = RunOptions {
            upload: true,
            folder_id: Some("folder".into()),
            ..Default::default()
        };
        let result = coordinator(&fx, options, engine.clone(), cloud.clone())
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(engine.starts(), 0);
        assert_eq!(cloud.calls(), 0);
        assert_eq!(result.items_skipped, 1);
        assert_eq!(result.items_completed, 0);
        assert!(result.outcomes[0].skipped);

        let state = fx.store.load().unwrap();
        assert_eq!(state.items[&id].remote_reference.as_deref(), Some("seeded-remote"));
    }

    #[tokio::test]
    async fn test_downloaded_item_upload_only_calls_publish_not_acquire() {
        let fx = fixture();
        let id = seed_item(&fx, MAGNET_A, Phase::Downloaded);
        let engine = MockEngine::new(0);
        let cloud = MockCloud::new();

        let options = RunOptions {
            upload: true,
            folder_id: Some("folder".into()),
            ..Default::default()
        };
        let result = coordinator(&fx, options, engine.clone(), cloud.clone())
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(engine.starts(), 0);
        assert_eq!(cloud.uploads.load(Ordering::SeqCst), 1);
        assert_eq!(result.items_completed, 1);

        let state = fx.store.load().unwrap();
        let item = &state.items[&id];
        assert_eq!(item.phase, Phase::Completed);
        assert!(item.remote_reference.is_some());
        assert!(item.local_path.is_some());
    }

    #[tokio::test]
    async fn test_crash_mid_download_resumes_as_pending() {
        let fx = fixture();
        let id = seed_item(&fx, MAGNET_A, Phase::Downloading);
        let engine = MockEngine::new(0);
        let cloud = MockCloud::new();

        let result = coordinator(&fx, RunOptions::default(), engine.clone(), cloud)
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();

        // The healed item went through a full acquire again.
        assert_eq!(engine.starts(), 1);
        assert_eq!(result.items_completed, 1);
        let state = fx.store.load().unwrap();
        assert_eq!(state.items[&id].phase, Phase::Completed);
    }

    #[tokio::test]
    async fn test_acquire_succeeds_on_third_attempt() {
        let fx = fixture();
        let engine = MockEngine::new(2);
        let cloud = MockCloud::new();

        let result = coordinator(&fx, RunOptions::default(), engine.clone(), cloud)
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(engine.starts(), 3);
        assert_eq!(result.items_completed, 1);
        assert_eq!(result.items_failed, 0);

        let state = fx.store.load().unwrap();
        let item = state.items.values().next().unwrap();
        assert_eq!(item.download_attempts, 3);
        assert_eq!(item.phase, Phase::Completed);
    }

    #[tokio::test]
    async fn test_acquire_exhausts_retries_and_fails() {
        let fx = fixture();
        let engine = MockEngine::new(99);
        let cloud = MockCloud::new();

        let result = coordinator(&fx, RunOptions::default(), engine.clone(), cloud)
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(engine.starts(), 3);
        assert_eq!(result.items_failed, 1);

        let state = fx.store.load().unwrap();
        let item = state.items.values().next().unwrap();
        assert_eq!(item.phase, Phase::Failed);
        assert_eq!(item.download_attempts, 3);
        assert!(item.last_error.as_deref().unwrap_or("").contains("no peers"));
    }

    #[tokio::test]
    async fn test_download_only_scenario_a_completed_b_pending() {
        let fx = fixture();
        let id_a = seed_item(&fx, MAGNET_A, Phase::Completed);
        let engine = MockEngine::new(0);
        let cloud = MockCloud::new();

        let result = coordinator(&fx, RunOptions::default(), engine.clone(), cloud.clone())
            .run(
                vec![magnet_request(MAGNET_A), magnet_request(MAGNET_B)],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        // A untouched, B downloaded and completed per the
        // no-upload-requested rule.
        assert_eq!(engine.starts(), 1);
        assert_eq!(cloud.calls(), 0);
        assert_eq!(result.items_skipped, 1);
        assert_eq!(result.items_completed, 1);

        let state = fx.store.load().unwrap();
        assert_eq!(state.items[&id_a].remote_reference.as_deref(), Some("seeded-remote"));
        let b = state
            .items
            .values()
            .find(|i| i.display_name == "item-b")
            .unwrap();
        assert_eq!(b.phase, Phase::Completed);
        assert!(b.remote_reference.is_none());
        assert!(b.local_path.is_some());
    }

    #[tokio::test]
    async fn test_no_resume_redownloads_downloaded_item() {
        let fx = fixture();
        seed_item(&fx, MAGNET_A, Phase::Downloaded);
        let engine = MockEngine::new(0);

        let options = RunOptions {
            resume: false,
            ..Default::default()
        };
        coordinator(&fx, options, engine.clone(), MockCloud::new())
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(engine.starts(), 1);
    }

    #[tokio::test]
    async fn test_no_resume_does_not_regress_completed_item() {
        let fx = fixture();
        seed_item(&fx, MAGNET_A, Phase::Completed);
        let engine = MockEngine::new(0);

        let options = RunOptions {
            resume: false,
            ..Default::default()
        };
        let result = coordinator(&fx, options, engine.clone(), MockCloud::new())
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(engine.starts(), 0);
        assert_eq!(result.items_skipped, 1);
    }

    #[tokio::test]
    async fn test_no_skip_forces_redo_of_completed_item() {
        let fx = fixture();
        let id = seed_item(&fx, MAGNET_A, Phase::Completed);
        let engine = MockEngine::new(0);

        let options = RunOptions {
            skip_existing: false,
            ..Default::default()
        };
        let result = coordinator(&fx, options, engine.clone(), MockCloud::new())
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(engine.starts(), 1);
        assert_eq!(result.items_completed, 1);

        let state = fx.store.load().unwrap();
        // The prior publish result was discarded by the forced redo.
        assert!(state.items[&id].remote_reference.is_none());
    }

    #[tokio::test]
    async fn test_publish_fatal_error_does_not_retry() {
        let fx = fixture();
        let id = seed_item(&fx, MAGNET_A, Phase::Downloaded);
        let cloud = MockCloud::failing(99, PublishErrorKind::Auth);

        let options = RunOptions {
            upload: true,
            folder_id: Some("folder".into()),
            ..Default::default()
        };
        let result = coordinator(&fx, options, MockEngine::new(0), cloud.clone())
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.items_failed, 1);
        let state = fx.store.load().unwrap();
        let item = &state.items[&id];
        assert_eq!(item.phase, Phase::Failed);
        assert_eq!(item.upload_attempts, 1);
        assert!(item.remote_reference.is_none());
    }

    #[tokio::test]
    async fn test_publish_network_error_retries_then_succeeds() {
        let fx = fixture();
        let id = seed_item(&fx, MAGNET_A, Phase::Downloaded);
        let cloud = MockCloud::failing(1, PublishErrorKind::Network);

        let options = RunOptions {
            upload: true,
            folder_id: Some("folder".into()),
            ..Default::default()
        };
        let result = coordinator(&fx, options, MockEngine::new(0), cloud.clone())
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.items_completed, 1);
        let state = fx.store.load().unwrap();
        let item = &state.items[&id];
        assert_eq!(item.phase, Phase::Completed);
        assert_eq!(item.upload_attempts, 2);
        assert!(item.remote_reference.is_some());
    }

    #[tokio::test]
    async fn test_local_path_upload_flow() {
        let fx = fixture();
        let local = fx._dir.path().join("report.pdf");
        std::fs::write(&local, b"pdf").unwrap();
        let cloud = MockCloud::new();

        let options = RunOptions {
            upload: true,
            folder_id: Some("folder".into()),
            ..Default::default()
        };
        let result = coordinator(&fx, options, MockEngine::new(0), cloud.clone())
            .run(
                vec![TransferRequest::LocalPath(local)],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(result.items_completed, 1);
        assert_eq!(cloud.uploads.load(Ordering::SeqCst), 1);

        let state = fx.store.load().unwrap();
        let item = state.items.values().next().unwrap();
        assert_eq!(item.kind, ItemKind::LocalPath);
        assert_eq!(item.phase, Phase::Completed);
        assert!(item.remote_reference.is_some());
    }

    #[tokio::test]
    async fn test_upload_without_folder_id_aborts_before_external_calls() {
        let fx = fixture();
        let engine = MockEngine::new(0);
        let cloud = MockCloud::new();

        let options = RunOptions {
            upload: true,
            folder_id: None,
            ..Default::default()
        };
        let result = coordinator(&fx, options, engine.clone(), cloud.clone())
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await;

        assert!(matches!(result, Err(SyncError::Config(_))));
        assert_eq!(engine.starts(), 0);
        assert_eq!(cloud.calls(), 0);
    }

    #[tokio::test]
    async fn test_dry_run_touches_nothing() {
        let fx = fixture();
        let local = fx._dir.path().join("report.pdf");
        std::fs::write(&local, b"pdf").unwrap();
        let cloud = MockCloud::new();
        let engine = MockEngine::new(0);

        let options = RunOptions {
            upload: true,
            folder_id: Some("folder".into()),
            dry_run: true,
            ..Default::default()
        };
        coordinator(&fx, options, engine.clone(), cloud.clone())
            .run(
                vec![TransferRequest::LocalPath(local)],
                CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(engine.starts(), 0);
        assert_eq!(cloud.calls(), 0);
        let state = fx.store.load().unwrap();
        assert_eq!(state.items.values().next().unwrap().phase, Phase::Pending);
    }

    #[tokio::test]
    async fn test_state_is_saved_incrementally() {
        let fx = fixture();
        let engine = MockEngine::new(99);

        coordinator(&fx, RunOptions::default(), engine, MockCloud::new())
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();

        // The failure reached the durable record, not just memory.
        let reloaded = fx.store.load().unwrap();
        let item = reloaded.items.values().next().unwrap();
        assert_eq!(item.phase, Phase::Failed);
        assert!(item.last_error.is_some());
    }

    #[tokio::test]
    async fn test_retry_after_failed_run_resets_and_succeeds() {
        let fx = fixture();
        let engine = MockEngine::new(3);

        // First run exhausts the 3 attempts.
        coordinator(&fx, RunOptions::default(), engine.clone(), MockCloud::new())
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(fx.store.load().unwrap().items.values().next().unwrap().phase, Phase::Failed);

        // Re-requesting the same item is the explicit retry instruction.
        let result = coordinator(&fx, RunOptions::default(), engine.clone(), MockCloud::new())
            .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(result.items_completed, 1);
        let state = fx.store.load().unwrap();
        let item = state.items.values().next().unwrap();
        assert_eq!(item.phase, Phase::Completed);
        assert_eq!(item.download_attempts, 1);
    }

    #[tokio::test]
    async fn test_concurrent_run_rejected_by_lock() {
        let fx = fixture();
        let _lock = fx.store.lock().unwrap();

        let result = coordinator(
            &fx,
            RunOptions::default(),
            MockEngine::new(0),
            MockCloud::new(),
        )
        .run(vec![magnet_request(MAGNET_A)], CancellationToken::new())
        .await;

        assert!(matches!(result, Err(SyncError::SessionLocked(_))));
    }
}
