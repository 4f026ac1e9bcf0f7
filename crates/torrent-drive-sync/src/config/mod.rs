//! Configuration loading and validation.

mod types;
mod validation;

pub use types::*;

use std::path::Path;

use crate::error::Result;

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml(&content)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        validation::validate(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_programmatic_default_matches_yaml_default() {
        let from_yaml = Config::from_yaml("{}").unwrap();
        let programmatic = Config::default();
        assert_eq!(programmatic.session_file, from_yaml.session_file);
        assert_eq!(programmatic.download.destination, from_yaml.download.destination);
        assert_eq!(programmatic.transfer.skip_existing, from_yaml.transfer.skip_existing);
        assert_eq!(programmatic.upload.chunk_size_mb, from_yaml.upload.chunk_size_mb);
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = Config::from_yaml("{}").unwrap();
        assert_eq!(config.download.destination, std::path::PathBuf::from("downloads"));
        assert_eq!(config.upload.chunk_size_mb, 100);
        assert_eq!(config.transfer.get_max_retries(), 3);
        assert!(config.transfer.skip_existing);
        assert_eq!(config.session_file, std::path::PathBuf::from("torrent-session.json"));
    }

    #[test]
    fn test_full_yaml_round_trip() {
        let yaml = r#"
download:
  destination: /srv/torrents
upload:
  folder_id: abc123
  chunk_size_mb: 50
transfer:
  max_retries: 5
  workers: 2
  skip_existing: false
session_file: /var/lib/tds/session.json
"#;
        let config = Config::from_yaml(yaml).unwrap();
        assert_eq!(config.download.destination, std::path::PathBuf::from("/srv/torrents"));
        assert_eq!(config.upload.folder_id.as_deref(), Some("abc123"));
        assert_eq!(config.upload.chunk_size(), 50 * 1024 * 1024);
        assert_eq!(config.transfer.get_max_retries(), 5);
        assert_eq!(config.transfer.get_workers(), 2);
        assert!(!config.transfer.skip_existing);
    }

    #[test]
    fn test_invalid_yaml_is_error() {
        assert!(Config::from_yaml("upload: [not, a, mapping").is_err());
    }

    #[test]
    fn test_invalid_values_rejected_on_load() {
        let yaml = "upload:\n  chunk_size_mb: 0\n";
        assert!(Config::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_retry_policy_from_config() {
        let yaml = "transfer:\n  max_retries: 4\n  retry_base_delay_ms: 100\n";
        let config = Config::from_yaml(yaml).unwrap();
        let policy = config.transfer.retry_policy();
        assert_eq!(policy.max_attempts, 4);
        assert_eq!(policy.base_delay, std::time::Duration::from_millis(100));
    }
}
