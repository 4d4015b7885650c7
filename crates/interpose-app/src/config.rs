//! JSON configuration file.
//!
//! Every field is optional; values given on the command line win.

use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::Deserialize;

/// Settings read from `--config <file>`.
#[derive(Debug, Default, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct FileConfig {
    pub addr: Option<String>,
    pub stream_large_bodies: Option<u64>,
    pub ssl_insecure: Option<bool>,
    pub ca_root_path: Option<PathBuf>,
    pub upstream: Option<String>,
    /// Seconds to wait for connections on shutdown.
    pub shutdown_timeout: Option<u64>,
    /// Dial upstream before the client handshake in CONNECT tunnels.
    pub upstream_cert: Option<bool>,
    pub log_level: Option<String>,
    pub log_dir: Option<PathBuf>,
}

impl FileConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::parse(&raw).with_context(|| format!("invalid config {}", path.display()))
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(serde_json::from_str(raw)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn parses_partial_config() {
        let config = FileConfig::parse(r#"{"addr": "127.0.0.1:8080", "upstream_cert": true}"#).unwrap();
        assert_eq!(config.addr.as_deref(), Some("127.0.0.1:8080"));
        assert_eq!(config.upstream_cert, Some(true));
        assert_eq!(config.upstream, None);
    }

    #[test]
    fn empty_object_is_default() {
        assert_eq!(FileConfig::parse("{}").unwrap(), FileConfig::default());
    }

    #[test]
    fn rejects_unknown_fields() {
        assert!(FileConfig::parse(r#"{"port": 1}"#).is_err());
        assert!(FileConfig::parse(r#"{"lazy": true}"#).is_err());
    }

    #[test]
    fn load_reports_missing_file() {
        let dir = TempDir::new().unwrap();
        let err = FileConfig::load(&dir.path().join("missing.json")).unwrap_err();
        assert!(err.to_string().contains("failed to read config"));
    }

    #[test]
    fn load_reads_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("interpose.json");
        std::fs::write(
            &path,
            r#"{"stream_large_bodies": 1024, "shutdown_timeout": 5, "ssl_insecure": true}"#,
        )
        .unwrap();

        let config = FileConfig::load(&path).unwrap();
        assert_eq!(config.stream_large_bodies, Some(1024));
        assert_eq!(config.shutdown_timeout, Some(5));
        assert_eq!(config.ssl_insecure, Some(true));
    }
}
