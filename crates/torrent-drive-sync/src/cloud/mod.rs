//! Publish collaborator contract.
//!
//! The cloud drive is an external collaborator reached through the
//! narrow [`CloudStore`] trait; its resumable-upload protocol lives in
//! the production client ([`drive`]). This module also carries the
//! pieces that are generic over the trait: name filters, upload
//! planning, and recursive folder publishing.

pub mod drive;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use glob::Pattern;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::error::{Result, SyncError};

/// Cloud-side identifier of an uploaded file or created folder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteRef {
    pub id: String,
    pub name: String,
}

/// The cloud storage contract.
#[async_trait]
pub trait CloudStore: Send + Sync {
    /// Upload one file into the given folder, using `chunk_size` for the
    /// resumable transfer. Returns the remote reference of the new file.
    async fn upload_file(&self, path: &Path, folder_id: &str, chunk_size: u64)
        -> Result<RemoteRef>;

    /// Look up a non-trashed child of `folder_id` with the given name.
    async fn find_existing(&self, name: &str, folder_id: &str) -> Result<Option<RemoteRef>>;

    /// Create (or reuse) a folder with the given name under `parent_id`.
    async fn create_folder(&self, name: &str, parent_id: &str) -> Result<RemoteRef>;
}

/// Include/exclude name filter for folder publishing.
///
/// Patterns are shell-style globs matched against file names, not full
/// paths. An empty include list admits everything; excludes always win.
#[derive(Debug, Clone, Default)]
pub struct PublishFilter {
    include: Vec<Pattern>,
    exclude: Vec<Pattern>,
}

impl PublishFilter {
    /// Compile a filter from raw pattern strings.
    pub fn new(include: &[String], exclude: &[String]) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Pattern>> {
            patterns
                .iter()
                .map(|p| {
                    Pattern::new(p)
                        .map_err(|e| SyncError::Config(format!("Invalid pattern '{p}': {e}")))
                })
                .collect()
        };
        Ok(Self {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    /// Whether a file with this name passes the filter.
    pub fn matches(&self, name: &str) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|p| p.matches(name)) {
            return false;
        }
        !self.exclude.iter().any(|p| p.matches(name))
    }
}

/// Options for one publish pass.
#[derive(Debug, Clone)]
pub struct PublishOptions {
    /// Chunk size for resumable uploads, in bytes.
    pub chunk_size: u64,
    /// Skip files that already exist remotely.
    pub skip_existing: bool,
    /// Name filter for folder contents.
    pub filter: PublishFilter,
}

/// What a publish pass did.
#[derive(Debug, Clone)]
pub struct PublishOutcome {
    /// Remote reference of the published file or root folder.
    pub remote: RemoteRef,
    pub files_uploaded: usize,
    pub files_skipped: usize,
    pub bytes_uploaded: u64,
}

/// What a publish pass would touch, for dry runs and pre-upload logging.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishPlan {
    pub files: usize,
    pub folders: usize,
    pub total_bytes: u64,
}

/// Walk a local path and report what a publish pass would upload,
/// applying the name filter.
pub fn plan_tree(path: &Path, filter: &PublishFilter) -> Result<PublishPlan> {
    let mut plan = PublishPlan::default();

    if path.is_file() {
        plan.files = 1;
        plan.total_bytes = std::fs::metadata(path)?.len();
        return Ok(plan);
    }

    for entry in WalkDir::new(path).min_depth(1) {
        let entry = entry.map_err(|e| {
            SyncError::Io(std::io::Error::other(format!(
                "walking {}: {e}",
                path.display()
            )))
        })?;
        if entry.file_type().is_dir() {
            plan.folders += 1;
        } else if entry.file_type().is_file() {
            let name = entry.file_name().to_string_lossy();
            if !filter.matches(&name) {
                continue;
            }
            plan.files += 1;
            plan.total_bytes += entry.metadata().map(|m| m.len()).unwrap_or(0);
        }
    }

    Ok(plan)
}

/// Publish a file or folder tree into the given remote folder.
///
/// Files that already exist remotely are skipped (counted, not
/// re-uploaded) when `skip_existing` is set, which also makes a retried
/// publish pass resume where the previous one stopped. Directory
/// structure is recreated remotely; existing folders are reused.
pub async fn publish_tree(
    store: &dyn CloudStore,
    path: &Path,
    folder_id: &str,
    options: &PublishOptions,
) -> Result<PublishOutcome> {
    if !path.exists() {
        return Err(SyncError::Config(format!(
            "Publish path does not exist: {}",
            path.display()
        )));
    }

    if path.is_file() {
        return publish_file(store, path, folder_id, options).await;
    }

    let root_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "upload".to_string());

    let root_remote = store.create_folder(&root_name, folder_id).await?;
    info!("Publishing {} into remote folder {}", path.display(), root_remote.id);

    let mut outcome = PublishOutcome {
        remote: root_remote.clone(),
        files_uploaded: 0,
        files_skipped: 0,
        bytes_uploaded: 0,
    };

    // WalkDir yields parents before their children, so the remote id of
    // a directory is always known before anything inside it.
    let mut remote_dirs: HashMap<PathBuf, String> = HashMap::new();
    remote_dirs.insert(path.to_path_buf(), root_remote.id);

    for entry in WalkDir::new(path).min_depth(1) {
        let entry = entry.map_err(|e| {
            SyncError::Io(std::io::Error::other(format!(
                "walking {}: {e}",
                path.display()
            )))
        })?;
        let name = entry.file_name().to_string_lossy().into_owned();
        let parent_id = entry
            .path()
            .parent()
            .and_then(|p| remote_dirs.get(p))
            .cloned()
            .ok_or_else(|| {
                SyncError::Config(format!(
                    "No remote folder recorded for parent of {}",
                    entry.path().display()
                ))
            })?;

        if entry.file_type().is_dir() {
            let remote = store.create_folder(&name, &parent_id).await?;
            remote_dirs.insert(entry.path().to_path_buf(), remote.id);
        } else if entry.file_type().is_file() {
            if !options.filter.matches(&name) {
                debug!("Filtered out {}", entry.path().display());
                continue;
            }

            if options.skip_existing {
                if let Some(existing) = store.find_existing(&name, &parent_id).await? {
                    debug!("Skipping {} - already exists as {}", name, existing.id);
                    outcome.files_skipped += 1;
                    continue;
                }
            }

            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            store
                .upload_file(entry.path(), &parent_id, options.chunk_size)
                .await?;
            outcome.files_uploaded += 1;
            outcome.bytes_uploaded += size;
        }
    }

    Ok(outcome)
}

async fn publish_file(
    store: &dyn CloudStore,
    path: &Path,
    folder_id: &str,
    options: &PublishOptions,
) -> Result<PublishOutcome> {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());

    if options.skip_existing {
        if let Some(existing) = store.find_existing(&name, folder_id).await? {
            info!("Skipping {name} - already exists in the drive");
            return Ok(PublishOutcome {
                remote: existing,
                files_uploaded: 0,
                files_skipped: 1,
                bytes_uploaded: 0,
            });
        }
    }

    let size = std::fs::metadata(path)?.len();
    let remote = store.upload_file(path, folder_id, options.chunk_size).await?;
    Ok(PublishOutcome {
        remote,
        files_uploaded: 1,
        files_skipped: 0,
        bytes_uploaded: size,
    })
}
