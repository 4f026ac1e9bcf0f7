//! Single-invocation lock for the session file.
//!
//! Concurrent coordinator runs over the same session file are not
//! supported: the store's discipline is read-snapshot, mutate, write-
//! snapshot, which two writers would corrupt. The lock file detects and
//! rejects a second invocation rather than serializing it.

use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::debug;

use crate::error::{Result, SyncError};

/// Path of the lock file guarding `session_path`.
pub(super) fn lock_path(session_path: &Path) -> PathBuf {
    let mut os = session_path.as_os_str().to_os_string();
    os.push(".lock");
    PathBuf::from(os)
}

/// Guard representing exclusive use of a session file.
///
/// Created with `create_new`, so acquisition is atomic: exactly one
/// invocation wins. The file records the holder's PID for diagnostics
/// and is removed when the guard drops. A lock left behind by a killed
/// process is removed by `clear`.
#[derive(Debug)]
pub struct SessionLock {
    path: PathBuf,
}

impl SessionLock {
    pub(super) fn acquire(session_path: &Path) -> Result<Self> {
        let path = lock_path(session_path);

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = write!(file, "{}", std::process::id());
                debug!("Acquired session lock {}", path.display());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let holder = std::fs::read_to_string(&path).unwrap_or_default();
                let holder = holder.trim();
                let detail = if holder.is_empty() {
                    path.display().to_string()
                } else {
                    format!("{} (pid {})", path.display(), holder)
                };
                Err(SyncError::SessionLocked(detail))
            }
            Err(e) => Err(e.into()),
        }
    }
}

impl Drop for SessionLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Could not remove session lock {}: {e}", self.path.display());
        }
    }
}
