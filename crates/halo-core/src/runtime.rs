use crate::adapter::{EvalError, EvalOutcome, ProtocolAdapter, ProtocolKind};
use crate::bidi::BidiAdapter;
use crate::cdp::CdpAdapter;
use crate::config::EngineConfig;
use crate::context::WireContext;
use crate::signal::StopSignal;
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const DETECT_TIMEOUT: Duration = Duration::from_secs(1);

type ConnectionCallback = Box<dyn Fn(bool) + Send>;

struct RuntimeInner {
    adapter: Option<Box<dyn ProtocolAdapter>>,
    protocol: Option<ProtocolKind>,
    connected: bool,
    pages: Vec<WireContext>,
}

/// Owns one protocol adapter and a background discovery loop. State machine:
/// unloaded -> probing -> {connected, disconnected}; probing re-runs on every
/// `load()` call and on every poll tick.
pub struct Runtime {
    host: String,
    port: u16,
    interval: Duration,
    pinned_protocol: Option<ProtocolKind>,
    inner: Arc<Mutex<RuntimeInner>>,
    callbacks: Arc<Mutex<Vec<ConnectionCallback>>>,
    stop: StopSignal,
    poller: Mutex<Option<JoinHandle<()>>>,
}

impl Runtime {
    pub fn new(
        host: impl Into<String>,
        port: u16,
        interval: Duration,
        protocol: Option<ProtocolKind>,
    ) -> Self {
        Self {
            host: host.into(),
            port,
            interval,
            pinned_protocol: protocol,
            inner: Arc::new(Mutex::new(RuntimeInner {
                adapter: None,
                protocol: None,
                connected: false,
                pages: Vec::new(),
            })),
            callbacks: Arc::new(Mutex::new(Vec::new())),
            stop: StopSignal::new(),
            poller: Mutex::new(None),
        }
    }

    pub fn from_config(config: &EngineConfig) -> Self {
        Self::new(
            config.browser_host.clone(),
            config.browser_port,
            Duration::from_secs(config.poll_interval_secs),
            config.protocol,
        )
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn protocol(&self) -> Option<ProtocolKind> {
        self.inner.lock().protocol
    }

    /// Register an observer for connection flips; invoked from the discovery
    /// loop.
    pub fn on_connection_change(&self, callback: impl Fn(bool) + Send + 'static) {
        self.callbacks.lock().push(Box::new(callback));
    }

    /// Probe which protocol the endpoint speaks. Currently: a CDP discovery
    /// document wins; anything else means no protocol is available (the bidi
    /// path is disabled) rather than an error.
    fn detect_protocol(&self) -> Option<ProtocolKind> {
        let url = format!("http://{}:{}/json", self.host, self.port);
        match ureq::get(&url).timeout(DETECT_TIMEOUT).call() {
            Ok(response) => {
                let document = response.into_json::<Value>().ok()?;
                let first = document.as_array().and_then(|items| items.first())?;
                if first.get("webSocketDebuggerUrl").is_some() {
                    info!("detected cdp protocol");
                    return Some(ProtocolKind::Cdp);
                }
                warn!("discovery endpoint answered without a debugger url");
                None
            }
            Err(err) => {
                debug!(%err, "protocol detection probe failed");
                None
            }
        }
    }

    fn create_adapter(&self, protocol: ProtocolKind) -> Box<dyn ProtocolAdapter> {
        match protocol {
            ProtocolKind::Cdp => Box::new(CdpAdapter::new(self.host.clone(), self.port)),
            // Structurally disabled; connect() reports false.
            ProtocolKind::Bidi | ProtocolKind::Shim => {
                Box::new(BidiAdapter::new(self.host.clone(), self.port))
            }
        }
    }

    /// Initialize the adapter and optionally start the background discovery
    /// loop. Returns whether the runtime ended up connected. Re-entrant.
    pub fn load(&self, start_background: bool) -> bool {
        {
            let mut inner = self.inner.lock();
            if inner
                .adapter
                .as_ref()
                .is_some_and(|adapter| adapter.is_connected())
            {
                debug!("runtime already connected, skipping load");
                return true;
            }

            let protocol = self
                .pinned_protocol
                .or(inner.protocol)
                .or_else(|| self.detect_protocol());
            let Some(protocol) = protocol else {
                error!("no browser protocol available");
                return false;
            };
            inner.protocol = Some(protocol);

            let adapter = match inner.adapter.as_mut() {
                Some(adapter) => adapter,
                None => {
                    let created = self.create_adapter(protocol);
                    inner.adapter.insert(created)
                }
            };
            if !adapter.connect() {
                error!(protocol = protocol.as_tag(), "browser connection failed");
                inner.connected = false;
                return false;
            }
            inner.connected = true;
            info!(protocol = protocol.as_tag(), "runtime loaded");
        }

        if start_background && !self.interval.is_zero() {
            self.start_poller();
        }
        true
    }

    fn start_poller(&self) {
        let mut poller = self.poller.lock();
        if poller.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        self.stop.clear();

        let inner = Arc::clone(&self.inner);
        let callbacks = Arc::clone(&self.callbacks);
        let stop = self.stop.clone();
        let interval = self.interval;
        *poller = Some(std::thread::spawn(move || {
            debug!("discovery loop started");
            while !stop.is_set() {
                let flipped = {
                    let mut guard = inner.lock();
                    let was_connected = guard.connected;
                    if let Some(adapter) = guard.adapter.as_mut() {
                        match adapter.get_contexts() {
                            Ok(pages) => {
                                guard.pages = pages;
                                guard.connected = true;
                            }
                            Err(err) => {
                                // One bad poll never kills the loop.
                                warn!(%err, "discovery tick failed");
                                guard.pages.clear();
                                guard.connected = false;
                            }
                        }
                    }
                    (was_connected != guard.connected).then_some(guard.connected)
                };

                if let Some(connected) = flipped {
                    info!(connected, "browser connection changed");
                    for callback in callbacks.lock().iter() {
                        callback(connected);
                    }
                }
                stop.wait_timeout(interval);
            }
            debug!("discovery loop stopped");
        }));
    }

    /// Point-in-time value copy of the current context list. Two consecutive
    /// reads may return distinct objects that compare equal.
    pub fn pages(&self) -> Vec<WireContext> {
        let mut inner = self.inner.lock();
        let Some(adapter) = inner.adapter.as_mut() else {
            return Vec::new();
        };
        match adapter.get_contexts() {
            Ok(pages) => {
                inner.pages = pages.clone();
                pages
            }
            Err(err) => {
                debug!(%err, "page refresh failed");
                inner.pages.clear();
                Vec::new()
            }
        }
    }

    pub fn evaluate_script(
        &self,
        context_id: &str,
        expression: &str,
        await_promise: bool,
    ) -> Result<EvalOutcome, EvalError> {
        let mut inner = self.inner.lock();
        let adapter = inner
            .adapter
            .as_mut()
            .ok_or_else(|| EvalError::invalid_config("runtime is not loaded"))?;
        adapter.evaluate(context_id, expression, await_promise)
    }

    pub fn is_connected(&self) -> bool {
        let inner = self.inner.lock();
        inner.connected
            && inner
                .adapter
                .as_ref()
                .is_some_and(|adapter| adapter.is_connected())
    }

    /// Force one discovery refresh outside the poll cadence.
    pub fn refresh(&self) {
        let mut inner = self.inner.lock();
        if let Some(adapter) = inner.adapter.as_mut() {
            match adapter.get_contexts() {
                Ok(pages) => inner.pages = pages,
                Err(err) => debug!(%err, "forced refresh failed"),
            }
        }
    }

    /// Two-phase shutdown: signal the loop, join it, then release the
    /// adapter. Idempotent.
    pub fn stop(&self) {
        self.stop.set();
        if let Some(handle) = self.poller.lock().take() {
            if handle.join().is_err() {
                warn!("discovery loop panicked");
            }
        }
        let mut inner = self.inner.lock();
        if let Some(mut adapter) = inner.adapter.take() {
            adapter.close();
        }
        inner.connected = false;
        debug!("runtime stopped");
    }

    pub fn close(&self) {
        self.stop();
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        self.stop();
    }
}
