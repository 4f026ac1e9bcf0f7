//! Torrent source resolution.
//!
//! A user-supplied source string is resolved exactly once, at CLI parse
//! time, into a [`TorrentSource`]. Everything downstream (the session
//! store, the coordinator, the engine adapter) consumes the resolved
//! value and never re-inspects the raw string.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use url::Url;

use crate::error::{Result, SyncError};

/// A resolved torrent source: either a magnet link or a .torrent file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TorrentSource {
    /// A magnet link (`magnet:?xt=urn:btih:...`).
    Magnet(String),
    /// A local .torrent metadata file.
    TorrentFile(PathBuf),
}

impl TorrentSource {
    /// Resolve a raw CLI argument into a torrent source.
    ///
    /// Magnet links are validated to carry a BitTorrent info-hash
    /// (`xt=urn:btih:...`); .torrent paths must exist on disk.
    pub fn parse(input: &str) -> Result<Self> {
        if input.starts_with("magnet:") {
            // Validate up front so a bad link fails before any engine call.
            Self::magnet_info_hash(input)?;
            return Ok(TorrentSource::Magnet(input.to_string()));
        }

        if input.ends_with(".torrent") {
            let path = PathBuf::from(input);
            if !path.is_file() {
                return Err(SyncError::Config(format!(
                    "Torrent file not found: {}",
                    path.display()
                )));
            }
            return Ok(TorrentSource::TorrentFile(path));
        }

        Err(SyncError::Config(format!(
            "Invalid source '{input}': provide a .torrent file or magnet link"
        )))
    }

    /// Stable identifier for this source.
    ///
    /// Magnet links hash their info-hash, so the same torrent requested
    /// through differently-ordered query parameters maps to the same
    /// session item. Torrent files hash their canonicalized path.
    pub fn identifier(&self) -> Result<String> {
        match self {
            TorrentSource::Magnet(link) => {
                let info_hash = Self::magnet_info_hash(link)?;
                Ok(sha256_hex(format!("btih:{info_hash}").as_bytes()))
            }
            TorrentSource::TorrentFile(path) => identifier_for_path(path),
        }
    }

    /// Human-readable label for progress output and the status listing.
    pub fn display_name(&self) -> String {
        match self {
            TorrentSource::Magnet(link) => {
                if let Some(name) = Self::magnet_display_name(link) {
                    return name;
                }
                match Self::magnet_info_hash(link) {
                    Ok(hash) => format!("magnet:{}", &hash[..hash.len().min(16)]),
                    Err(_) => "magnet".to_string(),
                }
            }
            TorrentSource::TorrentFile(path) => path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| path.display().to_string()),
        }
    }

    /// The raw string handed to the torrent engine.
    pub fn as_engine_argument(&self) -> String {
        match self {
            TorrentSource::Magnet(link) => link.clone(),
            TorrentSource::TorrentFile(path) => path.display().to_string(),
        }
    }

    /// Extract the lower-cased BitTorrent info-hash from a magnet link.
    fn magnet_info_hash(link: &str) -> Result<String> {
        let url = Url::parse(link)
            .map_err(|e| SyncError::Config(format!("Invalid magnet link: {e}")))?;

        for (key, value) in url.query_pairs() {
            if key == "xt" {
                if let Some(hash) = value.strip_prefix("urn:btih:") {
                    if hash.is_empty() {
                        break;
                    }
                    return Ok(hash.to_ascii_lowercase());
                }
            }
        }

        Err(SyncError::Config(
            "Magnet link carries no BitTorrent info-hash (xt=urn:btih:...)".to_string(),
        ))
    }

    /// Extract the display-name (`dn`) parameter from a magnet link.
    fn magnet_display_name(link: &str) -> Option<String> {
        let url = Url::parse(link).ok()?;
        url.query_pairs()
            .find(|(key, _)| key == "dn")
            .map(|(_, value)| value.into_owned())
            .filter(|name| !name.is_empty())
    }
}

/// Stable identifier for a local path: SHA-256 over the canonicalized path.
pub fn identifier_for_path(path: &Path) -> Result<String> {
    let canonical = path.canonicalize().map_err(|e| {
        SyncError::Config(format!("Cannot resolve path {}: {e}", path.display()))
    })?;
    Ok(sha256_hex(canonical.to_string_lossy().as_bytes()))
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const UBUNTU_MAGNET: &str =
        "magnet:?xt=urn:btih:cab507494d02ebb1178b38f2e9d7be299c86b862&dn=ubuntu-21.04.iso";

    #[test]
    fn test_parse_magnet() {
        let source = TorrentSource::parse(UBUNTU_MAGNET).unwrap();
        assert!(matches!(source, TorrentSource::Magnet(_)));
        assert_eq!(source.display_name(), "ubuntu-21.04.iso");
    }

    #[test]
    fn test_magnet_identifier_ignores_param_order() {
        let a = TorrentSource::parse(
            "magnet:?xt=urn:btih:CAB507494D02EBB1178B38F2E9D7BE299C86B862&dn=first",
        )
        .unwrap();
        let b = TorrentSource::parse(
            "magnet:?dn=second&xt=urn:btih:cab507494d02ebb1178b38f2e9d7be299c86b862",
        )
        .unwrap();
        assert_eq!(a.identifier().unwrap(), b.identifier().unwrap());
    }

    #[test]
    fn test_magnet_without_info_hash_rejected() {
        assert!(TorrentSource::parse("magnet:?dn=nameless").is_err());
    }

    #[test]
    fn test_plain_string_rejected() {
        assert!(TorrentSource::parse("definitely-not-a-torrent").is_err());
    }

    #[test]
    fn test_missing_torrent_file_rejected() {
        assert!(TorrentSource::parse("/no/such/file.torrent").is_err());
    }

    #[test]
    fn test_torrent_file_identifier_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("linux.torrent");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(b"d8:announce0:e").unwrap();

        let source = TorrentSource::parse(path.to_str().unwrap()).unwrap();
        assert!(matches!(source, TorrentSource::TorrentFile(_)));
        assert_eq!(source.display_name(), "linux");
        assert_eq!(source.identifier().unwrap(), source.identifier().unwrap());
    }

    #[test]
    fn test_magnet_without_dn_uses_hash_prefix() {
        let source = TorrentSource::parse(
            "magnet:?xt=urn:btih:cab507494d02ebb1178b38f2e9d7be299c86b862",
        )
        .unwrap();
        assert_eq!(source.display_name(), "magnet:cab507494d02ebb1");
    }
}
