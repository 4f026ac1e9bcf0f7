//! File-based session state for resume capability.
//!
//! The session file is the single durable record of the pipeline: a JSON
//! document mapping item identifiers to [`TransferItem`]s. It is read as
//! a whole snapshot at run start, mutated in memory by the coordinator,
//! and written back atomically after every phase transition.

mod lock;

pub use lock::SessionLock;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::error::{Result, SyncError};

/// Current session schema version. Newer writers may add fields; readers
/// ignore what they do not know.
pub const SESSION_VERSION: u32 = 1;

/// Pipeline phase of a transfer item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Pending,
    Downloading,
    Downloaded,
    Uploading,
    Completed,
    Failed,
}

impl Phase {
    /// Whether moving from `self` to `next` is a legal transition.
    ///
    /// Transitions are monotonic forward, with the single exception of
    /// the explicit `Failed -> Pending` retry reset.
    pub fn can_transition(self, next: Phase) -> bool {
        use Phase::*;
        matches!(
            (self, next),
            (Pending, Downloading)
                | (Downloading, Downloaded)
                | (Downloading, Failed)
                | (Downloaded, Uploading)
                | (Downloaded, Completed)
                | (Uploading, Completed)
                | (Uploading, Failed)
                | (Failed, Pending)
        )
    }

    /// Whether this phase ends the pipeline for an item.
    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Completed | Phase::Failed)
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "pending",
            Phase::Downloading => "downloading",
            Phase::Downloaded => "downloaded",
            Phase::Uploading => "uploading",
            Phase::Completed => "completed",
            Phase::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Which phase an item failed in, so a retry re-enters the pipeline with
/// the right attempt counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailedPhase {
    Download,
    Upload,
}

/// What kind of thing an item's `source` field names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    /// A magnet link or .torrent file; acquired through the torrent engine.
    Torrent,
    /// A local file or folder supplied to the `upload` command. Already
    /// on disk, so the acquire phase reduces to an existence check.
    LocalPath,
}

/// One user-requested unit of work tracked across runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferItem {
    /// Stable lookup key. Immutable for the lifetime of the item.
    pub identifier: String,

    /// What `source` names.
    pub kind: ItemKind,

    /// Original user input (magnet link, .torrent path, or local path).
    pub source: String,

    /// Human-readable label.
    pub display_name: String,

    /// Current pipeline phase.
    pub phase: Phase,

    /// Filesystem location of the acquired content. Set for every phase
    /// from `Downloaded` onward.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_path: Option<PathBuf>,

    /// Cloud-side identifier. Set when the item completed through the
    /// publish phase; download-only completions carry none.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_reference: Option<String>,

    /// Acquire attempts spent on the current pass.
    #[serde(default)]
    pub download_attempts: u32,

    /// Publish attempts spent on the current pass.
    #[serde(default)]
    pub upload_attempts: u32,

    /// Last recorded error, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Which phase the item failed in (when `phase == Failed`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_phase: Option<FailedPhase>,

    /// When the item was first seen.
    pub created_at: DateTime<Utc>,

    /// When the item last changed.
    pub updated_at: DateTime<Utc>,
}

impl TransferItem {
    /// Create a new item for a torrent source, starting at `Pending`.
    pub fn new_torrent(identifier: String, source: String, display_name: String) -> Self {
        Self::new(identifier, ItemKind::Torrent, source, display_name)
    }

    /// Create a new item for a local path supplied to `upload`.
    pub fn new_local(identifier: String, path: &Path) -> Self {
        let display_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Self::new(
            identifier,
            ItemKind::LocalPath,
            path.display().to_string(),
            display_name,
        )
    }

    fn new(identifier: String, kind: ItemKind, source: String, display_name: String) -> Self {
        let now = Utc::now();
        Self {
            identifier,
            kind,
            source,
            display_name,
            phase: Phase::Pending,
            local_path: None,
            remote_reference: None,
            download_attempts: 0,
            upload_attempts: 0,
            last_error: None,
            failed_phase: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn transition(&mut self, next: Phase) -> Result<()> {
        if !self.phase.can_transition(next) {
            return Err(SyncError::Config(format!(
                "illegal phase transition for {}: {} -> {}",
                self.identifier, self.phase, next
            )));
        }
        self.phase = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    /// Enter the acquire phase.
    pub fn begin_download(&mut self) -> Result<()> {
        self.transition(Phase::Downloading)
    }

    /// Acquire succeeded; record where the content landed.
    pub fn mark_downloaded(&mut self, local_path: PathBuf) -> Result<()> {
        self.transition(Phase::Downloaded)?;
        self.local_path = Some(local_path);
        self.last_error = None;
        Ok(())
    }

    /// Enter the publish phase.
    pub fn begin_upload(&mut self) -> Result<()> {
        self.transition(Phase::Uploading)
    }

    /// Publish succeeded; the item is done.
    pub fn complete_via_publish(&mut self, remote_reference: String) -> Result<()> {
        self.transition(Phase::Completed)?;
        self.remote_reference = Some(remote_reference);
        self.last_error = None;
        self.failed_phase = None;
        Ok(())
    }

    /// Download-only mode: the item is done without a publish phase.
    pub fn complete_local(&mut self) -> Result<()> {
        self.transition(Phase::Completed)?;
        self.last_error = None;
        self.failed_phase = None;
        Ok(())
    }

    /// Record a terminal failure in the given phase.
    pub fn mark_failed(&mut self, phase: FailedPhase, error: &SyncError) -> Result<()> {
        self.transition(Phase::Failed)?;
        self.failed_phase = Some(phase);
        self.last_error = Some(error.to_string());
        Ok(())
    }

    /// Explicit retry reset: `Failed -> Pending`, clearing the attempt
    /// counter of the failed phase. Prior progress (`local_path`) is kept
    /// so resume decisions still apply.
    pub fn reset_for_retry(&mut self) -> Result<()> {
        let failed_phase = self.failed_phase.take();
        self.transition(Phase::Pending)?;
        match failed_phase {
            Some(FailedPhase::Download) | None => self.download_attempts = 0,
            Some(FailedPhase::Upload) => self.upload_attempts = 0,
        }
        self.last_error = None;
        Ok(())
    }

    /// Forced redo under no-skip: return the item to `Pending`, clearing
    /// publish results and counters. `local_path` is kept so the engine
    /// can verify existing data instead of refetching everything.
    pub fn force_restart(&mut self) {
        self.phase = Phase::Pending;
        self.remote_reference = None;
        self.download_attempts = 0;
        self.upload_attempts = 0;
        self.last_error = None;
        self.failed_phase = None;
        self.updated_at = Utc::now();
    }

    /// No-resume: discard download-phase progress so acquire runs again.
    /// Only affects `Downloaded` items; a completed publish phase is
    /// never regressed by this.
    pub fn force_redownload(&mut self) {
        if self.phase == Phase::Downloaded {
            self.phase = Phase::Pending;
            self.download_attempts = 0;
            self.updated_at = Utc::now();
        }
    }

    /// Heal an item that was left mid-phase by a crash or cancellation.
    ///
    /// Partial progress within a phase belongs to the external
    /// collaborator; the pipeline regresses to the last fully completed
    /// phase: `Downloading -> Pending`, `Uploading -> Downloaded`.
    /// Returns true if the item changed.
    pub fn heal_in_flight(&mut self) -> bool {
        let healed = match self.phase {
            Phase::Downloading => Phase::Pending,
            Phase::Uploading => Phase::Downloaded,
            _ => return false,
        };
        self.phase = healed;
        self.updated_at = Utc::now();
        true
    }
}

/// The durable session document: schema version plus the item map.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionState {
    /// Schema version of this document.
    pub version: u32,

    /// When the session was first created.
    pub created_at: DateTime<Utc>,

    /// When the session was last written.
    pub updated_at: DateTime<Utc>,

    /// Per-item state, keyed by identifier.
    #[serde(default)]
    pub items: HashMap<String, TransferItem>,
}

impl Default for SessionState {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            version: SESSION_VERSION,
            created_at: now,
            updated_at: now,
            items: HashMap::new(),
        }
    }
}

impl SessionState {
    /// Heal every item left mid-phase by a crash; returns how many changed.
    pub fn heal_in_flight(&mut self) -> usize {
        let mut healed = 0;
        for item in self.items.values_mut() {
            if item.heal_in_flight() {
                healed += 1;
            }
        }
        healed
    }

    /// Count items per phase, for the status listing.
    pub fn phase_counts(&self) -> HashMap<Phase, usize> {
        let mut counts = HashMap::new();
        for item in self.items.values() {
            *counts.entry(item.phase).or_insert(0) += 1;
        }
        counts
    }
}

/// Durable, crash-safe store for [`SessionState`].
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    /// Create a store backed by the given file path. Nothing is touched
    /// on disk until `load`/`save`/`clear` is called.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// The backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reconstruct session state from the durable record.
    ///
    /// A missing file is not an error: it yields an empty state. An
    /// unreadable or unparsable file is [`SyncError::SessionCorrupt`];
    /// the caller decides whether to abort or discard.
    pub fn load(&self) -> Result<SessionState> {
        if !self.path.exists() {
            return Ok(SessionState::default());
        }

        let content = std::fs::read_to_string(&self.path)?;
        let state: SessionState = serde_json::from_str(&content)
            .map_err(|e| SyncError::SessionCorrupt(e.to_string()))?;

        if state.version > SESSION_VERSION {
            warn!(
                "Session file {} has schema version {} (newer than {}); unknown fields ignored",
                self.path.display(),
                state.version,
                SESSION_VERSION
            );
        }

        Ok(state)
    }

    /// Atomically persist the full state snapshot.
    ///
    /// The document is written to a sibling temp file and renamed over
    /// the durable record, so a crash mid-write never leaves a
    /// half-written snapshot visible.
    pub fn save(&self, state: &mut SessionState) -> Result<()> {
        state.updated_at = Utc::now();

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let content = serde_json::to_string_pretty(state)?;
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, &content)?;
        std::fs::rename(&temp_path, &self.path)?;

        Ok(())
    }

    /// Remove all durable state. Subsequent `load` returns empty.
    pub fn clear(&self) -> Result<()> {
        for path in [
            self.path.clone(),
            self.path.with_extension("tmp"),
            lock::lock_path(&self.path),
        ] {
            match std::fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Take the single-invocation lock for this session file.
    pub fn lock(&self) -> Result<SessionLock> {
        SessionLock::acquire(&self.path)
    }
}
