//! Configuration validation.

use super::Config;
use crate::error::{Result, SyncError};

/// Validate a loaded configuration before anything touches the network.
pub fn validate(config: &Config) -> Result<()> {
    if config.upload.chunk_size_mb == 0 {
        return Err(SyncError::Config(
            "upload.chunk_size_mb must be at least 1".to_string(),
        ));
    }

    if config.upload.large_file_threshold_mb == 0 {
        return Err(SyncError::Config(
            "upload.large_file_threshold_mb must be at least 1".to_string(),
        ));
    }

    if let Some(0) = config.transfer.max_retries {
        return Err(SyncError::Config(
            "transfer.max_retries must be at least 1".to_string(),
        ));
    }

    if let Some(0) = config.transfer.workers {
        return Err(SyncError::Config(
            "transfer.workers must be at least 1".to_string(),
        ));
    }

    if config.download.destination.as_os_str().is_empty() {
        return Err(SyncError::Config(
            "download.destination must not be empty".to_string(),
        ));
    }

    if config.session_file.as_os_str().is_empty() {
        return Err(SyncError::Config(
            "session_file must not be empty".to_string(),
        ));
    }

    for (name, url) in [
        ("upload.api_base_url", &config.upload.api_base_url),
        ("upload.upload_base_url", &config.upload.upload_base_url),
    ] {
        if !url.starts_with("http://") && !url.starts_with("https://") {
            return Err(SyncError::Config(format!("{name} must be an http(s) URL")));
        }
    }

    Ok(())
}
