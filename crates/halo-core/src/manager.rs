use crate::config::EngineConfig;
use crate::plugin::AccountInfo;
use crate::runtime::Runtime;
use crate::signal::StopSignal;
use crate::sync::BundleSync;
use crate::worker::{
    ENV_ACCOUNT, ENV_CLIENT_ID, ENV_PRESENCE_CALLABLE, ENV_PRESENCE_ENTRY,
    ENV_PRESENCE_INTERVAL_SECS, ENV_PRESENCE_NAME, ENV_PRESENCE_PATH, ENV_PRESENCE_WEB,
};
use crate::worker_protocol::{HostMessage, PageRecord, WorkerMessage};
use crate::worker_spec::{PresenceManifest, StatusMirror, WorkerSpecification, MANIFEST_FILENAME};
use crate::worker_transport::{split_child, WorkerReceiver};
use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::process::{Child, Command, Stdio};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const MONITOR_TICK: Duration = Duration::from_millis(200);
const STOP_POLL_TICK: Duration = Duration::from_millis(100);

type WorkerMap = Arc<Mutex<HashMap<String, WorkerSpecification>>>;

/// Discovers presence bundles, runs each as an isolated worker process,
/// relays browser snapshots into browser-needing workers, and supervises
/// exits. Restart is always a user-initiated `start`, never automatic.
pub struct PresenceManager {
    config: EngineConfig,
    runtime: Option<Arc<Runtime>>,
    sync: Box<dyn BundleSync>,
    account: Mutex<Option<AccountInfo>>,
    workers: WorkerMap,
    stop: StopSignal,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl PresenceManager {
    pub fn new(
        config: EngineConfig,
        runtime: Option<Arc<Runtime>>,
        sync: Box<dyn BundleSync>,
    ) -> Self {
        Self {
            config,
            runtime,
            sync,
            account: Mutex::new(None),
            workers: Arc::new(Mutex::new(HashMap::new())),
            stop: StopSignal::new(),
            relay: Mutex::new(None),
        }
    }

    pub fn set_account(&self, account: Option<AccountInfo>) {
        *self.account.lock() = account;
    }

    pub fn runtime(&self) -> Option<&Arc<Runtime>> {
        self.runtime.as_ref()
    }

    /// Walk the presences directory and register every bundle that passes
    /// the sync collaborator and carries a parseable manifest. Additive and
    /// idempotent: a name already known is never re-parsed. Returns how many
    /// new specifications were registered.
    pub fn discover(&self, force: bool) -> usize {
        let dir = &self.config.presences_dir;
        if !dir.is_dir() {
            warn!(dir = %dir.display(), "presences directory does not exist");
            return 0;
        }

        if force {
            info!("forcing rediscovery of presence bundles");
            self.workers.lock().clear();
        }

        let Ok(entries) = std::fs::read_dir(dir) else {
            warn!(dir = %dir.display(), "presences directory is unreadable");
            return 0;
        };

        let mut discovered = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            if !path.is_dir() {
                continue;
            }
            let name = entry.file_name().to_string_lossy().to_string();
            if self.workers.lock().contains_key(&name) {
                debug!(%name, "bundle already discovered, skipping");
                continue;
            }

            let mut outcome = self.sync.verify(&name, &path);
            if !outcome.verified && self.config.dev_mode {
                info!(%name, "dev mode: forcing bundle sync");
                outcome = self.sync.force_verify(&name, &path);
            }
            if !outcome.verified {
                warn!(%name, detail = %outcome.detail, "bundle skipped");
                continue;
            }
            debug!(%name, detail = %outcome.detail, "bundle verified");

            if !path.join(MANIFEST_FILENAME).is_file() {
                warn!(%name, "manifest missing for bundle");
                continue;
            }
            let manifest = match PresenceManifest::load(&path) {
                Ok(manifest) => manifest,
                Err(err) => {
                    error!(%name, %err, "manifest parse failed");
                    continue;
                }
            };

            info!(
                %name,
                callable = %manifest.callable,
                interval = manifest.interval,
                "discovered presence"
            );
            let spec = WorkerSpecification::from_manifest(
                name.clone(),
                path,
                &manifest,
                self.config.default_backoff_secs,
                outcome.verified,
            );
            self.workers.lock().insert(name, spec);
            discovered += 1;
        }
        discovered
    }

    pub fn worker(&self, name: &str) -> Option<WorkerSpecification> {
        self.workers.lock().get(name).cloned()
    }

    pub fn workers(&self) -> Vec<WorkerSpecification> {
        let mut all = self.workers.lock().values().cloned().collect::<Vec<_>>();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Start one worker process. Refused while the specification is already
    /// running, and refused before any process is spawned when a
    /// browser-needing presence has no connected runtime behind it.
    pub fn start(&self, name: &str) -> Result<()> {
        let mut workers = self.workers.lock();
        let spec = workers
            .get_mut(name)
            .ok_or_else(|| anyhow!("unknown presence {name}"))?;

        if spec.is_running() {
            bail!("{name} is already running");
        }
        if spec.web {
            let connected = self
                .runtime
                .as_ref()
                .is_some_and(|runtime| runtime.is_connected());
            if !connected {
                bail!("no browser connected, cannot start {name}");
            }
            debug!(%name, "browser connected, starting web presence");
        }

        let account = self.account.lock().clone();
        let mut command = Command::new(self.config.worker_command());
        command
            .args(&self.config.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .env(ENV_PRESENCE_NAME, &spec.name)
            .env(ENV_PRESENCE_PATH, &spec.path)
            .env(ENV_PRESENCE_ENTRY, &spec.entrypoint)
            .env(ENV_PRESENCE_CALLABLE, &spec.callable_name)
            .env(ENV_PRESENCE_INTERVAL_SECS, spec.interval_secs.to_string())
            .env(ENV_PRESENCE_WEB, if spec.web { "1" } else { "0" })
            .env(ENV_CLIENT_ID, spec.client_id.clone().unwrap_or_default());
        if let Some(account) = &account {
            if let Ok(raw) = serde_json::to_string(account) {
                command.env(ENV_ACCOUNT, raw);
            }
        }

        let mut child = command
            .spawn()
            .map_err(|err| anyhow!("spawn worker {name} failed: {err}"))?;
        let pid = child.id();
        let (sender, receiver) = split_child(&mut child).map_err(|err| anyhow!(err))?;
        let sender = Arc::new(sender);

        if spec.web {
            // Seed the worker right away so it never observes an empty tab
            // list until the first relay tick.
            let snapshot = self.build_snapshot();
            if let Err(err) = sender.send(&HostMessage::Pages { pages: snapshot }) {
                debug!(%name, %err, "initial snapshot send failed");
            }
        }

        // Fresh mirror per start; the previous run's last payload is gone.
        let status: StatusMirror = Arc::new(Mutex::new(None));
        let process = Arc::new(Mutex::new(child));
        spec.process = Some(Arc::clone(&process));
        spec.sender = Some(Arc::clone(&sender));
        spec.status = Some(Arc::clone(&status));
        spec.runs += 1;

        let is_web = spec.web;
        let monitor_name = spec.name.clone();
        let workers_map = Arc::clone(&self.workers);
        std::thread::spawn(move || {
            monitor_worker(monitor_name, process, receiver, status, workers_map);
        });

        info!(%name, pid, "started worker");
        drop(workers);

        if is_web {
            self.ensure_relay();
        }
        Ok(())
    }

    /// Stop one worker: signal cooperative shutdown, wait out the grace
    /// window, then force-terminate. A worker that never checks its
    /// cancellation signal is killed, not waited on forever.
    pub fn stop(&self, name: &str) -> Result<()> {
        let (process, sender) = {
            let mut workers = self.workers.lock();
            let spec = workers
                .get_mut(name)
                .ok_or_else(|| anyhow!("unknown presence {name}"))?;
            if !spec.is_running() {
                warn!(%name, "worker is not running");
                spec.clear_handles();
                return Ok(());
            }
            (spec.process.clone(), spec.sender.clone())
        };

        if let Some(sender) = sender {
            info!(%name, "signalling worker shutdown");
            if let Err(err) = sender.send(&HostMessage::Shutdown) {
                debug!(%name, %err, "shutdown send failed");
            }
            sender.close();
        }

        if let Some(process) = process {
            let deadline = Instant::now() + Duration::from_secs(self.config.stop_grace_secs);
            let mut exited = false;
            while Instant::now() < deadline {
                if matches!(process.lock().try_wait(), Ok(Some(_))) {
                    exited = true;
                    break;
                }
                std::thread::sleep(STOP_POLL_TICK);
            }

            if !exited {
                warn!(%name, "worker ignored shutdown, terminating");
                let mut child = process.lock();
                if let Err(err) = child.kill() {
                    error!(%name, %err, "terminate failed");
                }
                let _ = child.wait();
            }
        }

        if let Some(spec) = self.workers.lock().get_mut(name) {
            spec.clear_handles();
        }
        info!(%name, "stopped worker");
        Ok(())
    }

    /// Stop every running worker; `only_web` scopes the sweep to
    /// browser-needing workers, used when the browser connection is torn
    /// down.
    pub fn stop_all(&self, only_web: bool) {
        if only_web {
            info!("stopping all web workers");
        }
        let names = {
            let workers = self.workers.lock();
            workers
                .values()
                .filter(|spec| spec.is_running() && (!only_web || spec.web))
                .map(|spec| spec.name.clone())
                .collect::<Vec<_>>()
        };
        for name in names {
            if let Err(err) = self.stop(&name) {
                error!(%name, %err, "stop failed");
            }
        }
    }

    /// Start every enabled specification, logging failures instead of
    /// aborting the sweep.
    pub fn start_all(&self) {
        let names = {
            let workers = self.workers.lock();
            workers
                .values()
                .filter(|spec| spec.enabled && !spec.is_running())
                .map(|spec| spec.name.clone())
                .collect::<Vec<_>>()
        };
        for name in names {
            if let Err(err) = self.start(&name) {
                warn!(%name, %err, "start failed");
            }
        }
    }

    /// Two-phase teardown: raise the stop signal, stop the workers, then
    /// join the relay thread.
    pub fn shutdown(&self) {
        self.stop.set();
        self.stop_all(false);
        if let Some(handle) = self.relay.lock().take() {
            if handle.join().is_err() {
                warn!("pages relay panicked");
            }
        }
    }

    fn build_snapshot(&self) -> Vec<PageRecord> {
        let Some(runtime) = self.runtime.as_ref() else {
            return Vec::new();
        };
        runtime.pages().iter().map(PageRecord::from_context).collect()
    }

    /// Lazily start the single relay thread that copies runtime pages into
    /// every running browser-needing worker on the runtime's own cadence.
    fn ensure_relay(&self) {
        let Some(runtime) = self.runtime.clone() else {
            return;
        };
        let mut relay = self.relay.lock();
        if relay.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let workers = Arc::clone(&self.workers);
        let stop = self.stop.clone();
        let interval = runtime.interval();
        *relay = Some(std::thread::spawn(move || {
            debug!("pages relay started");
            while !stop.is_set() {
                if runtime.protocol().is_some() {
                    runtime.load(true);
                    let message = HostMessage::Pages {
                        pages: runtime.pages().iter().map(PageRecord::from_context).collect(),
                    };
                    let targets = {
                        let workers = workers.lock();
                        workers
                            .values()
                            .filter(|spec| spec.web)
                            .filter_map(|spec| {
                                spec.sender
                                    .clone()
                                    .map(|sender| (spec.name.clone(), sender))
                            })
                            .collect::<Vec<_>>()
                    };
                    for (name, sender) in targets {
                        if let Err(err) = sender.send(&message) {
                            debug!(%name, %err, "snapshot relay failed");
                        }
                    }
                }
                stop.wait_timeout(interval);
            }
            debug!("pages relay stopped");
        }));
    }
}

impl Drop for PresenceManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Per-worker supervision: mirror status messages while the process lives,
/// then log the exit code and clear the specification's handles. No
/// automatic restart happens here.
fn monitor_worker(
    name: String,
    process: Arc<Mutex<Child>>,
    receiver: WorkerReceiver,
    status: StatusMirror,
    workers: WorkerMap,
) {
    debug!(%name, "monitoring worker");
    let mut reader_gone = false;
    loop {
        if reader_gone {
            std::thread::sleep(MONITOR_TICK);
        } else {
            match receiver.receive(MONITOR_TICK) {
                Ok(Some(WorkerMessage::Ready { pid })) => {
                    debug!(%name, pid, "worker reported ready");
                }
                Ok(Some(WorkerMessage::Status { activity })) => {
                    *status.lock() = activity;
                }
                Ok(None) => {}
                Err(err) => {
                    debug!(%name, %err, "worker channel closed");
                    reader_gone = true;
                }
            }
        }

        match process.lock().try_wait() {
            Ok(Some(exit)) => {
                info!(%name, code = exit.code(), "worker exited");
                break;
            }
            Ok(None) => {}
            Err(err) => {
                error!(%name, %err, "monitoring failed");
                break;
            }
        }
    }

    if let Some(spec) = workers.lock().get_mut(&name) {
        spec.clear_handles();
    }
}
