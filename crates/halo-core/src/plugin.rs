use crate::activity::ActivityPayload;
use crate::context::WireContext;
use crate::ipc::ActivityIpcClient;
use crate::shim::ShimRuntime;
use crate::signal::StopSignal;
use crate::worker_protocol::WorkerMessage;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

/// Names tried, in order, when a manifest's callable is not registered.
pub const FALLBACK_CALLABLES: [&str; 2] = ["execute", "main"];

const ACCOUNT_ID64_OFFSET: i64 = 76_561_197_960_265_728;

/// The active platform account a plugin may read game state for.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountInfo {
    pub name: String,
    pub id64: i64,
    pub id3: i64,
}

impl AccountInfo {
    pub fn new(name: impl Into<String>, id64: i64) -> Self {
        Self {
            name: name.into(),
            id64,
            id3: id64 - ACCOUNT_ID64_OFFSET,
        }
    }
}

/// Writes status mirror updates to the worker's stdout for the manager.
#[derive(Clone)]
pub struct StatusPublisher {
    out: Arc<Mutex<Box<dyn Write + Send>>>,
}

impl StatusPublisher {
    pub fn stdout() -> Self {
        Self::from_writer(Box::new(std::io::stdout()))
    }

    pub fn from_writer(writer: Box<dyn Write + Send>) -> Self {
        Self {
            out: Arc::new(Mutex::new(writer)),
        }
    }

    pub fn send(&self, message: &WorkerMessage) {
        let Ok(payload) = serde_json::to_string(message) else {
            return;
        };
        let mut out = self.out.lock();
        let _ = out
            .write_all(payload.as_bytes())
            .and_then(|()| out.write_all(b"\n"))
            .and_then(|()| out.flush());
    }
}

/// The capability set a presence runs against: the activity handle, an
/// optional read-only view of browser tabs, the cancellation signal, and the
/// manifest-declared cadence.
pub struct PresenceContext {
    pub rpc: ActivityIpcClient,
    pub runtime: Option<ShimRuntime>,
    pub interval: Duration,
    pub account: Option<AccountInfo>,
    stop: StopSignal,
    status: StatusPublisher,
}

impl PresenceContext {
    pub fn new(
        rpc: ActivityIpcClient,
        runtime: Option<ShimRuntime>,
        interval: Duration,
        account: Option<AccountInfo>,
        stop: StopSignal,
        status: StatusPublisher,
    ) -> Self {
        Self {
            rpc,
            runtime,
            interval,
            account,
            stop,
            status,
        }
    }

    /// Publish one activity update and mirror it for the host UI.
    pub fn publish(&mut self, payload: &ActivityPayload) {
        self.rpc.update(payload);
        self.status.send(&WorkerMessage::Status {
            activity: Some(payload.clone()),
        });
    }

    pub fn clear(&mut self) {
        self.rpc.clear();
        self.status.send(&WorkerMessage::Status { activity: None });
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.is_set()
    }

    /// Sleep one manifest interval, waking early on cancellation. Returns
    /// true while the presence should keep running.
    pub fn wait_interval(&self) -> bool {
        !self.stop.wait_timeout(self.interval)
    }

    /// Clear-then-close teardown: releases the activity channel and sends
    /// the final cleared status mirror.
    pub fn shutdown(&mut self) {
        self.rpc.close();
        self.status.send(&WorkerMessage::Status { activity: None });
    }

    /// Current snapshot of browser tabs; empty for presences without
    /// browser access.
    pub fn pages(&mut self) -> Vec<WireContext> {
        self.runtime
            .as_mut()
            .map(ShimRuntime::pages)
            .unwrap_or_default()
    }
}

/// One presence plugin. `run` is invoked exactly once; long-lived presences
/// own their loop and poll `ctx` for cancellation. A returned payload is
/// published once after the run ends.
pub trait Presence: Send {
    fn run(&mut self, ctx: &mut PresenceContext) -> anyhow::Result<Option<ActivityPayload>>;
}

pub type PresenceConstructor = fn() -> Box<dyn Presence>;

/// Maps a manifest's entrypoint module and callable name to a registered
/// constructor.
#[derive(Default)]
pub struct PresenceRegistry {
    modules: HashMap<String, HashMap<String, PresenceConstructor>>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        module: impl Into<String>,
        callable: impl Into<String>,
        constructor: PresenceConstructor,
    ) {
        self.modules
            .entry(module.into())
            .or_default()
            .insert(callable.into(), constructor);
    }

    /// Resolve the requested callable within an entrypoint module, falling
    /// back through the conventional names. Returns the resolved name so the
    /// caller can tell when a fallback was used.
    pub fn resolve(
        &self,
        entrypoint: &str,
        requested: &str,
    ) -> Option<(String, PresenceConstructor)> {
        let module = self.modules.get(entry_stem(entrypoint))?;

        let mut candidates = vec![requested];
        candidates.extend(
            FALLBACK_CALLABLES
                .iter()
                .copied()
                .filter(|name| *name != requested),
        );
        for candidate in candidates {
            if let Some(constructor) = module.get(candidate) {
                debug!(entrypoint, callable = candidate, "resolved presence");
                return Some((candidate.to_string(), *constructor));
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }
}

/// Manifests written for the original runtime name files ("main.py"); only
/// the stem identifies the module here.
pub fn entry_stem(entrypoint: &str) -> &str {
    Path::new(entrypoint)
        .file_stem()
        .and_then(|stem| stem.to_str())
        .unwrap_or(entrypoint)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullPresence;

    impl Presence for NullPresence {
        fn run(&mut self, _ctx: &mut PresenceContext) -> anyhow::Result<Option<ActivityPayload>> {
            Ok(None)
        }
    }

    fn null_presence() -> Box<dyn Presence> {
        Box::new(NullPresence)
    }

    #[test]
    fn resolve_prefers_the_requested_callable() {
        let mut registry = PresenceRegistry::new();
        registry.register("main", "execute", null_presence);
        registry.register("main", "run_loop", null_presence);

        let (name, _) = registry.resolve("main", "run_loop").expect("resolve");
        assert_eq!(name, "run_loop");
    }

    #[test]
    fn resolve_falls_back_through_conventional_names() {
        let mut registry = PresenceRegistry::new();
        registry.register("main", "main", null_presence);

        let (name, _) = registry.resolve("main", "does_not_exist").expect("resolve");
        assert_eq!(name, "main");
    }

    #[test]
    fn resolve_misses_unknown_modules() {
        let registry = PresenceRegistry::new();
        assert!(registry.resolve("ghost", "execute").is_none());
    }

    #[test]
    fn entry_stem_strips_file_extensions() {
        assert_eq!(entry_stem("main.py"), "main");
        assert_eq!(entry_stem("media_session"), "media_session");
    }

    #[test]
    fn account_id3_is_derived_from_id64() {
        let account = AccountInfo::new("gordon", 76_561_197_960_265_729);
        assert_eq!(account.id3, 1);
    }

    #[test]
    fn status_publisher_writes_one_message_per_line() {
        let buffer: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));

        struct SharedWriter(Arc<Mutex<Vec<u8>>>);
        impl Write for SharedWriter {
            fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }

        let publisher = StatusPublisher::from_writer(Box::new(SharedWriter(buffer.clone())));
        publisher.send(&WorkerMessage::Ready { pid: 7 });
        publisher.send(&WorkerMessage::Status { activity: None });

        let written = String::from_utf8(buffer.lock().clone()).expect("utf8");
        let lines = written.lines().collect::<Vec<_>>();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].contains("ready"));
        assert!(lines[1].contains("status"));
    }
}
