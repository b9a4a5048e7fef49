use crate::activity::ActivityPayload;
use crate::worker_transport::WorkerSender;
use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;

pub const DEFAULT_ENTRYPOINT: &str = "main";
pub const DEFAULT_CALLABLE: &str = "execute";
pub const MANIFEST_FILENAME: &str = "manifest.json";

fn default_entry() -> String {
    DEFAULT_ENTRYPOINT.to_string()
}

fn default_callable() -> String {
    DEFAULT_CALLABLE.to_string()
}

fn default_interval() -> u64 {
    15
}

fn default_enabled() -> bool {
    true
}

/// The manifest a plugin bundle ships. The engine only reads it.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct PresenceManifest {
    #[serde(default = "default_entry")]
    pub entry: String,
    #[serde(default = "default_callable")]
    pub callable: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_interval")]
    pub interval: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    /// Whether the plugin reads browser tabs and therefore requires a
    /// connected runtime.
    #[serde(default)]
    pub web: bool,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub on_exit: Option<String>,
    #[serde(default)]
    pub image: Option<String>,
}

impl PresenceManifest {
    pub fn load(dir: &Path) -> Result<Self> {
        let path = dir.join(MANIFEST_FILENAME);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("read manifest {}", path.display()))?;
        serde_json::from_str(&raw).with_context(|| format!("parse manifest {}", path.display()))
    }
}

/// Mirror of a worker's last published activity, written by its monitor
/// thread, read by the host for display.
pub type StatusMirror = Arc<Mutex<Option<ActivityPayload>>>;

/// Static metadata plus live process handles for one discovered plugin.
/// Created by discovery, mutated only by the manager's start/stop
/// transitions; the monitor thread clears the handles when the process
/// exits.
#[derive(Clone, Debug)]
pub struct WorkerSpecification {
    pub name: String,
    pub path: PathBuf,
    pub entrypoint: String,
    pub callable_name: String,
    pub interval_secs: u64,
    pub enabled: bool,
    pub backoff_secs: u64,
    pub verified: bool,
    pub web: bool,
    pub client_id: Option<String>,
    pub description: Option<String>,
    pub on_exit: Option<String>,
    pub image: Option<String>,
    pub runs: u32,
    pub process: Option<Arc<Mutex<Child>>>,
    pub sender: Option<Arc<WorkerSender>>,
    pub status: Option<StatusMirror>,
}

impl WorkerSpecification {
    pub fn from_manifest(
        name: impl Into<String>,
        path: impl Into<PathBuf>,
        manifest: &PresenceManifest,
        backoff_secs: u64,
        verified: bool,
    ) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            entrypoint: manifest.entry.clone(),
            callable_name: manifest.callable.clone(),
            interval_secs: manifest.interval,
            enabled: manifest.enabled,
            backoff_secs,
            verified,
            web: manifest.web,
            client_id: manifest.client_id.clone(),
            description: manifest.description.clone(),
            on_exit: manifest.on_exit.clone(),
            image: manifest.image.clone(),
            runs: 0,
            process: None,
            sender: None,
            status: None,
        }
    }

    /// Derived, never stored: running iff a process handle exists and the OS
    /// still reports the process alive.
    pub fn is_running(&self) -> bool {
        match &self.process {
            Some(process) => matches!(process.lock().try_wait(), Ok(None)),
            None => false,
        }
    }

    pub fn last_activity(&self) -> Option<ActivityPayload> {
        self.status.as_ref().and_then(|mirror| mirror.lock().clone())
    }

    pub fn clear_handles(&mut self) {
        self.process = None;
        self.sender = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_fills_defaults() {
        let manifest: PresenceManifest =
            serde_json::from_str(r#"{"client_id": "123"}"#).expect("parse manifest");
        assert_eq!(manifest.entry, "main");
        assert_eq!(manifest.callable, "execute");
        assert_eq!(manifest.interval, 15);
        assert!(manifest.enabled);
        assert!(!manifest.web);
        assert_eq!(manifest.client_id.as_deref(), Some("123"));
    }

    #[test]
    fn manifest_load_reports_missing_file() {
        let dir = tempfile::tempdir().expect("tempdir");
        assert!(PresenceManifest::load(dir.path()).is_err());
    }

    #[test]
    fn manifest_load_reads_bundle_directory() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(
            dir.path().join(MANIFEST_FILENAME),
            r#"{"entry": "media_session", "interval": 5, "web": true}"#,
        )
        .expect("write manifest");

        let manifest = PresenceManifest::load(dir.path()).expect("load manifest");
        assert_eq!(manifest.entry, "media_session");
        assert_eq!(manifest.interval, 5);
        assert!(manifest.web);
    }

    #[test]
    fn specification_without_process_is_not_running() {
        let manifest: PresenceManifest = serde_json::from_str("{}").expect("parse manifest");
        let spec = WorkerSpecification::from_manifest("demo", "/tmp/demo", &manifest, 5, true);
        assert!(!spec.is_running());
        assert_eq!(spec.runs, 0);
        assert!(spec.last_activity().is_none());
    }
}
