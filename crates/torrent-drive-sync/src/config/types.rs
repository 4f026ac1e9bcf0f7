//! Configuration type definitions with auto-tuning based on system resources.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysinfo::System;
use tracing::info;

use crate::retry::RetryPolicy;

/// System resource information for auto-tuning.
#[derive(Debug, Clone)]
pub struct SystemResources {
    /// Total RAM in GB.
    pub total_memory_gb: f64,
    /// Number of CPU cores.
    pub cpu_cores: usize,
}

impl SystemResources {
    /// Detect system resources.
    pub fn detect() -> Self {
        let mut sys = System::new_all();
        sys.refresh_all();

        let total_memory_gb = sys.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0);
        let cpu_cores = sys.cpus().len();

        Self {
            total_memory_gb,
            cpu_cores,
        }
    }

    /// Log detected system resources.
    pub fn log(&self) {
        info!(
            "System resources: {:.1} GB RAM, {} CPU cores",
            self.total_memory_gb, self.cpu_cores
        );
    }
}

/// Root configuration structure.
///
/// Every section and field has a default, so an empty mapping (`{}`) is
/// a valid configuration file and the tool runs without one.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Torrent download configuration.
    #[serde(default)]
    pub download: DownloadConfig,

    /// Cloud drive upload configuration.
    #[serde(default)]
    pub upload: UploadConfig,

    /// Pipeline behavior configuration.
    #[serde(default)]
    pub transfer: TransferConfig,

    /// Session file for resume capability.
    #[serde(default = "default_session_file")]
    pub session_file: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            download: DownloadConfig::default(),
            upload: UploadConfig::default(),
            transfer: TransferConfig::default(),
            session_file: default_session_file(),
        }
    }
}

impl Config {
    /// Apply auto-tuned defaults based on system resources.
    /// Only fills in values that weren't explicitly set in the config file.
    pub fn with_auto_tuning(mut self) -> Self {
        let resources = SystemResources::detect();
        resources.log();
        self.transfer = self.transfer.with_auto_tuning(&resources);
        self
    }
}

/// Torrent download (acquire phase) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DownloadConfig {
    /// Directory downloaded content lands in (default: "downloads").
    /// Each item gets its own subdirectory underneath.
    #[serde(default = "default_destination")]
    pub destination: PathBuf,
}

impl Default for DownloadConfig {
    fn default() -> Self {
        Self {
            destination: default_destination(),
        }
    }
}

/// Cloud drive upload (publish phase) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UploadConfig {
    /// Default destination folder id; overridable per invocation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub folder_id: Option<String>,

    /// Chunk size for resumable uploads, in MiB (default: 100).
    #[serde(default = "default_chunk_size_mb")]
    pub chunk_size_mb: u64,

    /// Files at or above this size (MiB) report per-chunk progress
    /// (default: 1024).
    #[serde(default = "default_large_file_threshold_mb")]
    pub large_file_threshold_mb: u64,

    /// OAuth bearer token. Obtaining one is outside this tool; most
    /// setups leave this unset and export the token in the environment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,

    /// Environment variable consulted when `access_token` is unset.
    #[serde(default = "default_token_env")]
    pub access_token_env: String,

    /// Drive API base URL.
    #[serde(default = "default_api_base")]
    pub api_base_url: String,

    /// Drive upload base URL.
    #[serde(default = "default_upload_base")]
    pub upload_base_url: String,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            folder_id: None,
            chunk_size_mb: default_chunk_size_mb(),
            large_file_threshold_mb: default_large_file_threshold_mb(),
            access_token: None,
            access_token_env: default_token_env(),
            api_base_url: default_api_base(),
            upload_base_url: default_upload_base(),
        }
    }
}

impl UploadConfig {
    /// Chunk size in bytes.
    pub fn chunk_size(&self) -> u64 {
        self.chunk_size_mb * 1024 * 1024
    }

    /// Large-file threshold in bytes.
    pub fn large_file_threshold(&self) -> u64 {
        self.large_file_threshold_mb * 1024 * 1024
    }

    /// Resolve the bearer token from config or environment.
    pub fn resolve_access_token(&self) -> Option<String> {
        if let Some(token) = &self.access_token {
            if !token.is_empty() {
                return Some(token.clone());
            }
        }
        std::env::var(&self.access_token_env)
            .ok()
            .filter(|t| !t.is_empty())
    }
}

/// Pipeline behavior configuration.
/// Worker count uses Option to distinguish "not set" (use auto-tuned
/// default) from "explicitly set".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferConfig {
    /// Maximum attempts per phase before an item fails (default: 3).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_retries: Option<u32>,

    /// Base delay between attempts in milliseconds, doubled per attempt
    /// (default: 2000).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_base_delay_ms: Option<u64>,

    /// Parallel upload workers. Auto-tuned from CPU cores if not set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workers: Option<usize>,

    /// Skip items and files that already exist remotely (default: true).
    #[serde(default = "default_true")]
    pub skip_existing: bool,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            max_retries: None,
            retry_base_delay_ms: None,
            workers: None,
            skip_existing: true,
        }
    }
}

impl TransferConfig {
    /// Fill worker count from system resources when unset.
    pub fn with_auto_tuning(mut self, resources: &SystemResources) -> Self {
        if self.workers.is_none() {
            let workers = resources.cpu_cores.min(3).max(1);
            info!("Auto-tuned upload workers: {workers}");
            self.workers = Some(workers);
        }
        self
    }

    /// Effective worker count.
    pub fn get_workers(&self) -> usize {
        self.workers.unwrap_or(3).max(1)
    }

    /// Effective retry limit.
    pub fn get_max_retries(&self) -> u32 {
        self.max_retries.unwrap_or(3).max(1)
    }

    /// Effective retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.get_max_retries(),
            Duration::from_millis(self.retry_base_delay_ms.unwrap_or(2000)),
        )
    }
}

fn default_session_file() -> PathBuf {
    PathBuf::from("torrent-session.json")
}

fn default_destination() -> PathBuf {
    PathBuf::from("downloads")
}

fn default_chunk_size_mb() -> u64 {
    100
}

fn default_large_file_threshold_mb() -> u64 {
    1024
}

fn default_token_env() -> String {
    "DRIVE_ACCESS_TOKEN".to_string()
}

fn default_api_base() -> String {
    "https://www.googleapis.com/drive/v3".to_string()
}

fn default_upload_base() -> String {
    "https://www.googleapis.com/upload/drive/v3".to_string()
}

fn default_true() -> bool {
    true
}
