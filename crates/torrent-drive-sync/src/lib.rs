//! # torrent-drive-sync
//!
//! Download torrents and publish them to a cloud drive folder, with a
//! durable session for resume across runs.
//!
//! The heavy lifting is delegated: the torrent wire protocol lives in
//! the external engine (librqbit) and the chunked-upload protocol in the
//! cloud drive API. This library owns what is left:
//!
//! - **Session tracking** - a crash-safe JSON record of every item's
//!   pipeline phase, saved after each transition
//! - **Coordination** - driving items through acquire then publish,
//!   skipping completed work and retrying failures with backoff
//! - **Duplicate checks** - already-completed items and already-present
//!   remote files are reported as done, not redone
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use torrent_drive_sync::{
//!     Config, Coordinator, RqbitEngine, RunOptions, SessionStore, TorrentSource,
//!     TransferRequest,
//! };
//!
//! #[tokio::main]
//! async fn main() -> torrent_drive_sync::Result<()> {
//!     let config = Config::default();
//!     let store = SessionStore::new(&config.session_file);
//!     let engine = RqbitEngine::new(&config.download.destination).await?;
//!
//!     let source = TorrentSource::parse("magnet:?xt=urn:btih:cab507494d02ebb1178b38f2e9d7be299c86b862")?;
//!     let coordinator = Coordinator::new(config, store, RunOptions::default())
//!         .with_engine(Arc::new(engine));
//!
//!     let result = coordinator
//!         .run(vec![TransferRequest::Torrent(source)], CancellationToken::new())
//!         .await?;
//!     println!("{} item(s) completed", result.items_completed);
//!     Ok(())
//! }
//! ```

pub mod cloud;
pub mod config;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod retry;
pub mod session;
pub mod source;

// Re-exports for convenient access
pub use cloud::drive::DriveClient;
pub use cloud::{CloudStore, PublishFilter, RemoteRef};
pub use config::Config;
pub use coordinator::{
    Coordinator, ItemOutcome, ProgressEvent, RunOptions, SyncResult, TransferRequest,
};
pub use engine::rqbit::RqbitEngine;
pub use engine::TorrentEngine;
pub use error::{PublishErrorKind, Result, SyncError};
pub use retry::RetryPolicy;
pub use session::{Phase, SessionState, SessionStore, TransferItem};
pub use source::TorrentSource;
