//! Acquire collaborator contract.
//!
//! The torrent engine is an external collaborator: piece selection, peer
//! management, and partial-download resume all live inside it. The
//! coordinator only starts a download, observes progress, and waits for
//! completion through the narrow [`TorrentEngine`] / [`AcquireHandle`]
//! contract. The production adapter over librqbit is in [`rqbit`].

pub mod rqbit;

use std::path::Path;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::source::TorrentSource;

/// Coarse engine-side state of one acquire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireState {
    /// Resolving metadata, checking existing files, finding peers.
    Connecting,
    /// Fetching pieces.
    Fetching,
    /// All wanted data is on disk.
    Complete,
    /// The engine reported a failure.
    Error,
}

/// Progress snapshot for a running acquire.
#[derive(Debug, Clone, Copy)]
pub struct AcquireProgress {
    pub bytes_done: u64,
    pub bytes_total: u64,
    pub state: AcquireState,
}

impl AcquireProgress {
    /// Completion ratio in percent; 0.0 while the total is unknown.
    pub fn percent(&self) -> f64 {
        if self.bytes_total == 0 {
            return 0.0;
        }
        self.bytes_done as f64 * 100.0 / self.bytes_total as f64
    }
}

/// A running acquire, owned by the engine.
#[async_trait]
pub trait AcquireHandle: Send + Sync {
    /// Current progress snapshot.
    fn progress(&self) -> AcquireProgress;

    /// Whether all wanted data is on disk.
    fn is_complete(&self) -> bool {
        self.progress().state == AcquireState::Complete
    }

    /// Block until the acquire finishes or `cancel` fires.
    ///
    /// On cancellation this returns [`crate::SyncError::Cancelled`]; the
    /// engine keeps whatever partial state it manages itself.
    async fn wait_complete(&self, cancel: CancellationToken) -> Result<()>;

    /// Stop fetching. Best effort; partial engine state stays on disk so
    /// a later run can resume.
    fn cancel(&self);
}

/// The torrent engine contract.
#[async_trait]
pub trait TorrentEngine: Send + Sync {
    /// Begin acquiring `source` into `dest`, returning a handle to the
    /// running download.
    async fn start(&self, source: &TorrentSource, dest: &Path) -> Result<Box<dyn AcquireHandle>>;
}
