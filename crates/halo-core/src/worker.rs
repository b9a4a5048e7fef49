use crate::ipc::ActivityIpcClient;
use crate::plugin::{AccountInfo, PresenceContext, PresenceRegistry, StatusPublisher};
use crate::shim::{SharedPages, ShimRuntime};
use crate::signal::StopSignal;
use crate::worker_protocol::{HostMessage, WorkerMessage};
use anyhow::{Context as _, Result};
use parking_lot::Mutex;
use std::io::BufRead;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const ENV_PRESENCE_NAME: &str = "HALO_PRESENCE_NAME";
pub const ENV_PRESENCE_PATH: &str = "HALO_PRESENCE_PATH";
pub const ENV_PRESENCE_ENTRY: &str = "HALO_PRESENCE_ENTRY";
pub const ENV_PRESENCE_CALLABLE: &str = "HALO_PRESENCE_CALLABLE";
pub const ENV_PRESENCE_INTERVAL_SECS: &str = "HALO_PRESENCE_INTERVAL_SECS";
pub const ENV_PRESENCE_WEB: &str = "HALO_PRESENCE_WEB";
pub const ENV_CLIENT_ID: &str = "HALO_CLIENT_ID";
pub const ENV_ACCOUNT: &str = "HALO_ACCOUNT";

/// Static parameters of one worker process, handed over as environment
/// variables by the manager.
#[derive(Clone, Debug)]
pub struct WorkerConfig {
    pub name: String,
    pub path: PathBuf,
    pub entrypoint: String,
    pub callable: String,
    pub interval: Duration,
    pub client_id: Option<String>,
    pub web: bool,
    pub account: Option<AccountInfo>,
}

impl WorkerConfig {
    pub fn from_env() -> Result<Self> {
        let name = std::env::var(ENV_PRESENCE_NAME).context("worker needs HALO_PRESENCE_NAME")?;
        let path = std::env::var(ENV_PRESENCE_PATH).context("worker needs HALO_PRESENCE_PATH")?;
        let entrypoint =
            std::env::var(ENV_PRESENCE_ENTRY).unwrap_or_else(|_| "main".to_string());
        let callable =
            std::env::var(ENV_PRESENCE_CALLABLE).unwrap_or_else(|_| "execute".to_string());
        let interval_secs = std::env::var(ENV_PRESENCE_INTERVAL_SECS)
            .ok()
            .and_then(|value| value.parse::<u64>().ok())
            .unwrap_or(15);
        let web = std::env::var(ENV_PRESENCE_WEB)
            .map(|value| value == "1" || value.eq_ignore_ascii_case("true"))
            .unwrap_or(false);
        let client_id = std::env::var(ENV_CLIENT_ID)
            .ok()
            .filter(|value| !value.trim().is_empty());
        let account = std::env::var(ENV_ACCOUNT)
            .ok()
            .and_then(|raw| serde_json::from_str::<AccountInfo>(&raw).ok());

        Ok(Self {
            name,
            path: PathBuf::from(path),
            entrypoint,
            callable,
            interval: Duration::from_secs(interval_secs.max(1)),
            client_id,
            web,
            account,
        })
    }
}

/// Consume host messages from stdin: page snapshots replace the shared
/// slot, shutdown (or EOF, the manager being gone) raises the stop signal.
fn spawn_stdin_listener(snapshot: SharedPages, stop: StopSignal) {
    std::thread::spawn(move || {
        let stdin = std::io::stdin();
        for line in stdin.lock().lines() {
            let line = match line {
                Ok(line) => line,
                Err(err) => {
                    debug!(%err, "worker stdin read failed");
                    break;
                }
            };

            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            match serde_json::from_str::<HostMessage>(trimmed) {
                Ok(HostMessage::Pages { pages }) => {
                    *snapshot.lock() = pages;
                }
                Ok(HostMessage::Shutdown) => {
                    info!("shutdown requested by manager");
                    stop.set();
                    return;
                }
                Err(err) => {
                    warn!(%err, "unparseable host message");
                }
            }
        }
        debug!("manager channel closed");
        stop.set();
    });
}

/// Worker process body. Returns the process exit code: plugin-fatal
/// conditions (handshake rejection, unresolvable entrypoint, an error from
/// the presence body) are contained here as a non-zero exit.
pub fn run_worker(config: WorkerConfig, registry: &PresenceRegistry) -> i32 {
    info!(name = %config.name, pid = std::process::id(), "worker starting");

    let stop = StopSignal::new();
    let snapshot: SharedPages = Arc::new(Mutex::new(Vec::new()));
    spawn_stdin_listener(Arc::clone(&snapshot), stop.clone());

    let mut rpc = ActivityIpcClient::new(config.client_id.clone().unwrap_or_default());
    if let Err(err) = rpc.connect() {
        error!(%err, "activity handshake failed");
        return 1;
    }

    let Some((resolved, constructor)) = registry.resolve(&config.entrypoint, &config.callable)
    else {
        error!(
            entrypoint = %config.entrypoint,
            callable = %config.callable,
            "no registered presence matches the manifest"
        );
        return 1;
    };
    if resolved != config.callable {
        warn!(
            requested = %config.callable,
            resolved = %resolved,
            "requested callable not found, using fallback"
        );
    }

    let runtime = config.web.then(|| ShimRuntime::new(Arc::clone(&snapshot)));
    let status = StatusPublisher::stdout();
    status.send(&WorkerMessage::Ready {
        pid: std::process::id(),
    });

    let mut ctx = PresenceContext::new(
        rpc,
        runtime,
        config.interval,
        config.account.clone(),
        stop,
        status,
    );

    let mut presence = constructor();
    let code = match presence.run(&mut ctx) {
        Ok(Some(payload)) => {
            ctx.publish(&payload);
            0
        }
        Ok(None) => 0,
        Err(err) => {
            error!(name = %config.name, %err, "presence run failed");
            1
        }
    };

    ctx.shutdown();
    info!(name = %config.name, code, "worker exiting");
    code
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::activity::ActivityPayload;
    use crate::plugin::Presence;

    #[test]
    fn worker_config_reads_environment() {
        // Process-wide env mutation; this is the only test touching these
        // keys.
        std::env::set_var(ENV_PRESENCE_NAME, "demo");
        std::env::set_var(ENV_PRESENCE_PATH, "/tmp/demo");
        std::env::set_var(ENV_PRESENCE_INTERVAL_SECS, "3");
        std::env::set_var(ENV_PRESENCE_WEB, "true");
        std::env::set_var(ENV_ACCOUNT, r#"{"name":"gordon","id64":76561197960265729,"id3":1}"#);

        let config = WorkerConfig::from_env().expect("worker config");
        assert_eq!(config.name, "demo");
        assert_eq!(config.interval, Duration::from_secs(3));
        assert!(config.web);
        assert_eq!(config.account.as_ref().map(|a| a.id3), Some(1));
        assert_eq!(config.entrypoint, "main");
        assert_eq!(config.callable, "execute");
    }

    struct OneShot;

    impl Presence for OneShot {
        fn run(&mut self, _ctx: &mut PresenceContext) -> Result<Option<ActivityPayload>> {
            Ok(Some(ActivityPayload {
                state: Some("done".to_string()),
                ..ActivityPayload::default()
            }))
        }
    }

    #[test]
    fn unresolvable_presence_exits_nonzero() {
        let _guard = crate::ipc::PIPE_TEST_LOCK.lock();
        let dir = tempfile::tempdir().expect("tempdir");
        std::env::set_var("XDG_RUNTIME_DIR", dir.path());

        let registry = PresenceRegistry::new();
        let config = WorkerConfig {
            name: "ghost".to_string(),
            path: PathBuf::from("/tmp/ghost"),
            entrypoint: "ghost".to_string(),
            callable: "execute".to_string(),
            interval: Duration::from_secs(1),
            client_id: None,
            web: false,
            account: None,
        };
        assert_eq!(run_worker(config, &registry), 1);
    }

    #[test]
    fn one_shot_presence_completes_cleanly() {
        let _guard = crate::ipc::PIPE_TEST_LOCK.lock();
        let dir = tempfile::tempdir().expect("tempdir");
        std::env::set_var("XDG_RUNTIME_DIR", dir.path());

        let mut registry = PresenceRegistry::new();
        registry.register("main", "execute", || Box::new(OneShot));
        let config = WorkerConfig {
            name: "oneshot".to_string(),
            path: PathBuf::from("/tmp/oneshot"),
            entrypoint: "main".to_string(),
            callable: "execute".to_string(),
            interval: Duration::from_secs(1),
            client_id: None,
            web: false,
            account: None,
        };
        assert_eq!(run_worker(config, &registry), 0);
    }
}
