//! librqbit adapter for the acquire contract.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use librqbit::{AddTorrent, AddTorrentOptions, ManagedTorrent, Session};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{AcquireHandle, AcquireProgress, AcquireState, TorrentEngine};
use crate::error::{Result, SyncError};
use crate::source::TorrentSource;

/// Torrent engine backed by a librqbit session.
///
/// One session serves the whole run; each item overrides the output
/// folder so its content lands in its own directory. Downloads are added
/// with `overwrite: true` so a re-run only fetches missing pieces;
/// partial-download resume is the engine's own business.
pub struct RqbitEngine {
    session: Arc<Session>,
}

impl RqbitEngine {
    /// Create an engine rooted at the given download directory.
    pub async fn new(root: &Path) -> Result<Self> {
        std::fs::create_dir_all(root)?;
        let session = Session::new(root.to_path_buf())
            .await
            .map_err(|e| SyncError::acquire(root.display().to_string(), e.to_string()))?;
        Ok(Self { session })
    }
}

#[async_trait]
impl TorrentEngine for RqbitEngine {
    async fn start(&self, source: &TorrentSource, dest: &Path) -> Result<Box<dyn AcquireHandle>> {
        std::fs::create_dir_all(dest)?;

        let argument = source.as_engine_argument();
        let add = AddTorrent::from_cli_argument(&argument)
            .map_err(|e| SyncError::acquire(&argument, e.to_string()))?;

        let options = AddTorrentOptions {
            overwrite: true,
            output_folder: Some(dest.display().to_string()),
            ..Default::default()
        };

        let response = self
            .session
            .add_torrent(add, Some(options))
            .await
            .map_err(|e| SyncError::acquire(&argument, e.to_string()))?;

        let handle = response
            .into_handle()
            .ok_or_else(|| SyncError::acquire(&argument, "engine returned no torrent handle"))?;

        debug!("Engine started acquire of {} into {}", argument, dest.display());

        Ok(Box::new(RqbitHandle {
            source: argument,
            handle,
        }))
    }
}

struct RqbitHandle {
    source: String,
    handle: Arc<ManagedTorrent>,
}

#[async_trait]
impl AcquireHandle for RqbitHandle {
    fn progress(&self) -> AcquireProgress {
        let stats = self.handle.stats();
        let state = if stats.finished {
            AcquireState::Complete
        } else if stats.error.is_some() {
            AcquireState::Error
        } else if stats.total_bytes == 0 {
            AcquireState::Connecting
        } else {
            AcquireState::Fetching
        };
        AcquireProgress {
            bytes_done: stats.progress_bytes,
            bytes_total: stats.total_bytes,
            state,
        }
    }

    async fn wait_complete(&self, cancel: CancellationToken) -> Result<()> {
        tokio::select! {
            _ = cancel.cancelled() => {
                self.cancel();
                Err(SyncError::Cancelled)
            }
            result = self.handle.wait_until_completed() => {
                result.map_err(|e| SyncError::acquire(&self.source, e.to_string()))
            }
        }
    }

    fn cancel(&self) {
        // The engine checkpoints fetched pieces itself; dropping the
        // handle stops our interest and leaves partial data resumable.
        debug!("Cancelling acquire of {}", self.source);
    }
}
