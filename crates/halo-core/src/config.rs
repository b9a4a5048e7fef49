use crate::adapter::ProtocolKind;
use anyhow::{Context as _, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

fn default_browser_host() -> String {
    "localhost".to_string()
}

fn default_browser_port() -> u16 {
    4969
}

fn default_poll_interval_secs() -> u64 {
    2
}

fn default_presences_dir() -> PathBuf {
    PathBuf::from("presences")
}

fn default_backoff_secs() -> u64 {
    5
}

fn default_stop_grace_secs() -> u64 {
    5
}

/// Engine configuration, passed explicitly into client/manager constructors.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    #[serde(default = "default_browser_host")]
    pub browser_host: String,
    #[serde(default = "default_browser_port")]
    pub browser_port: u16,
    /// Cadence of browser discovery and of the pages relay, in seconds.
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
    /// Pin a protocol instead of auto-detecting.
    #[serde(default)]
    pub protocol: Option<ProtocolKind>,
    #[serde(default = "default_presences_dir")]
    pub presences_dir: PathBuf,
    #[serde(default = "default_backoff_secs")]
    pub default_backoff_secs: u64,
    /// How long a stopping worker gets to exit cooperatively before it is
    /// force-terminated.
    #[serde(default = "default_stop_grace_secs")]
    pub stop_grace_secs: u64,
    /// Command that launches one worker process; defaults to the bundled
    /// worker binary.
    #[serde(default)]
    pub worker_command: Option<String>,
    #[serde(default)]
    pub worker_args: Vec<String>,
    #[serde(default)]
    pub dev_mode: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            browser_host: default_browser_host(),
            browser_port: default_browser_port(),
            poll_interval_secs: default_poll_interval_secs(),
            protocol: None,
            presences_dir: default_presences_dir(),
            default_backoff_secs: default_backoff_secs(),
            stop_grace_secs: default_stop_grace_secs(),
            worker_command: None,
            worker_args: Vec::new(),
            dev_mode: false,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path)
            .with_context(|| format!("read config {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse config {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("create config dir {}", parent.display()))?;
        }
        let raw = serde_json::to_string_pretty(self).context("serialize config")?;
        fs::write(path, raw).with_context(|| format!("write config {}", path.display()))
    }

    pub fn worker_command(&self) -> String {
        #[cfg(target_os = "windows")]
        let bundled = "halo-plugin-worker.exe";
        #[cfg(not(target_os = "windows"))]
        let bundled = "halo-plugin-worker";

        self.worker_command.clone().unwrap_or_else(|| {
            std::env::var("HALO_WORKER_BIN")
                .ok()
                .filter(|value| !value.trim().is_empty())
                .unwrap_or_else(|| bundled.to_string())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_yields_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.browser_host, "localhost");
        assert_eq!(config.browser_port, 4969);
        assert_eq!(config.poll_interval_secs, 2);
        assert_eq!(config.protocol, None);
        assert!(!config.dev_mode);
    }

    #[test]
    fn config_roundtrips_through_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("engine.json");

        let mut config = EngineConfig::default();
        config.browser_port = 9222;
        config.protocol = Some(ProtocolKind::Cdp);
        config.save(&path).expect("save config");

        let loaded = EngineConfig::load(&path).expect("load config");
        assert_eq!(loaded, config);
    }

    #[test]
    fn explicit_worker_command_wins() {
        let mut config = EngineConfig::default();
        config.worker_command = Some("cargo".to_string());
        assert_eq!(config.worker_command(), "cargo");
    }
}
