use crate::adapter::{EvalError, EvalOutcome, ProtocolAdapter, ProtocolKind};
use crate::context::WireContext;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;

const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(1);
const EVALUATE_TIMEOUT: Duration = Duration::from_secs(5);

/// One entry of the discovery endpoint's JSON document.
#[derive(Clone, Debug, Deserialize)]
pub struct PageDescriptor {
    #[serde(default)]
    pub id: String,
    #[serde(default, rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, rename = "webSocketDebuggerUrl")]
    pub web_socket_debugger_url: Option<String>,
}

/// Chrome DevTools Protocol adapter for Chromium-based browsers. Discovery
/// re-fetches the endpoint and fully replaces the context list each cycle;
/// evaluation reuses each context's lazily opened per-tab socket.
pub struct CdpAdapter {
    host: String,
    port: u16,
    connected: bool,
    contexts: Vec<WireContext>,
    evaluate_timeout: Duration,
}

impl CdpAdapter {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            connected: false,
            contexts: Vec::new(),
            evaluate_timeout: EVALUATE_TIMEOUT,
        }
    }

    pub fn with_evaluate_timeout(mut self, timeout: Duration) -> Self {
        self.evaluate_timeout = timeout;
        self
    }

    fn discovery_url(&self) -> String {
        format!("http://{}:{}/json", self.host, self.port)
    }

    fn fetch_descriptors(&self) -> Result<Vec<PageDescriptor>, String> {
        let url = self.discovery_url();
        let response = ureq::get(&url)
            .timeout(DISCOVERY_TIMEOUT)
            .call()
            .map_err(|err| format!("discovery request {url} failed: {err}"))?;
        let document: Value = response
            .into_json()
            .map_err(|err| format!("read discovery body {url} failed: {err}"))?;

        // Some endpoints return a single descriptor instead of an array.
        let items = match document {
            Value::Array(items) => items,
            Value::Object(_) => vec![document],
            other => return Err(format!("unexpected discovery document: {other}")),
        };

        items
            .into_iter()
            .map(|item| {
                serde_json::from_value::<PageDescriptor>(item)
                    .map_err(|err| format!("malformed page descriptor: {err}"))
            })
            .collect()
    }
}

impl ProtocolAdapter for CdpAdapter {
    fn connect(&mut self) -> bool {
        let url = self.discovery_url();
        self.connected = match ureq::get(&url).timeout(DISCOVERY_TIMEOUT).call() {
            Ok(response) => response.status() == 200,
            Err(ureq::Error::Status(code, _)) => {
                debug!(code, "discovery endpoint rejected probe");
                false
            }
            Err(ureq::Error::Transport(err)) => {
                debug!(%err, "discovery endpoint unreachable");
                false
            }
        };
        self.connected
    }

    fn get_contexts(&mut self) -> Result<Vec<WireContext>, String> {
        let descriptors = self.fetch_descriptors()?;
        let contexts = descriptors
            .into_iter()
            .filter(|descriptor| descriptor.kind == "page")
            .map(|descriptor| {
                WireContext::new(
                    descriptor.id,
                    descriptor.url,
                    descriptor.title,
                    ProtocolKind::Cdp,
                    descriptor.web_socket_debugger_url,
                )
            })
            .collect::<Vec<_>>();

        debug!(count = contexts.len(), "discovered contexts");
        // Full replacement; dropped contexts close their sockets.
        self.contexts = contexts;
        Ok(self.contexts.clone())
    }

    fn evaluate(
        &mut self,
        context_id: &str,
        expression: &str,
        await_promise: bool,
    ) -> Result<EvalOutcome, EvalError> {
        let timeout = self.evaluate_timeout;
        let context = self
            .contexts
            .iter_mut()
            .find(|context| context.id == context_id)
            .ok_or_else(|| {
                EvalError::invalid_config(format!("context {context_id} is not known"))
            })?;
        context.evaluate(expression, await_promise, timeout)
    }

    fn close(&mut self) {
        self.contexts.clear();
        self.connected = false;
    }

    fn is_connected(&self) -> bool {
        self.connected
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Write};
    use std::net::TcpListener;

    /// Minimal one-shot HTTP server returning a canned body for each
    /// accepted connection.
    fn stub_discovery(body: String, hits: usize) -> std::net::SocketAddr {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind stub");
        let addr = listener.local_addr().expect("addr");
        std::thread::spawn(move || {
            for _ in 0..hits {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut reader = BufReader::new(stream.try_clone().expect("clone stream"));
                let mut line = String::new();
                while reader.read_line(&mut line).is_ok() {
                    if line == "\r\n" || line.is_empty() {
                        break;
                    }
                    line.clear();
                }
                let response = format!(
                    "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{}",
                    body.len(),
                    body
                );
                let _ = stream.write_all(response.as_bytes());
            }
        });
        addr
    }

    fn discovery_body() -> String {
        serde_json::json!([
            {"id": "A", "type": "page", "url": "https://a.example", "title": "A",
             "webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/page/A"},
            {"id": "B", "type": "background_page", "url": "chrome-extension://b", "title": "B"},
            {"id": "C", "type": "page", "url": "https://c.example", "title": "C",
             "webSocketDebuggerUrl": "ws://127.0.0.1:1/devtools/page/C"},
        ])
        .to_string()
    }

    #[test]
    fn discovery_keeps_only_page_entries() {
        let addr = stub_discovery(discovery_body(), 1);
        let mut adapter = CdpAdapter::new(addr.ip().to_string(), addr.port());

        let contexts = adapter.get_contexts().expect("contexts");
        assert_eq!(contexts.len(), 2);
        assert_eq!(contexts[0].id, "A");
        assert_eq!(contexts[1].id, "C");
    }

    #[test]
    fn unchanged_tab_set_yields_equal_context_values() {
        let addr = stub_discovery(discovery_body(), 2);
        let mut adapter = CdpAdapter::new(addr.ip().to_string(), addr.port());

        let first = adapter.get_contexts().expect("first cycle");
        let second = adapter.get_contexts().expect("second cycle");
        assert_eq!(first, second);
    }

    #[test]
    fn connect_probe_flips_connected() {
        let addr = stub_discovery("[]".to_string(), 1);
        let mut adapter = CdpAdapter::new(addr.ip().to_string(), addr.port());
        assert!(!adapter.is_connected());
        assert!(adapter.connect());
        assert!(adapter.is_connected());
    }

    #[test]
    fn unreachable_endpoint_fails_probe_and_discovery() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let mut adapter = CdpAdapter::new(addr.ip().to_string(), addr.port());
        assert!(!adapter.connect());
        assert!(adapter.get_contexts().is_err());
    }

    #[test]
    fn evaluate_on_unknown_context_is_a_config_error() {
        let mut adapter = CdpAdapter::new("127.0.0.1", 1);
        let err = adapter
            .evaluate("missing", "1 + 1", false)
            .expect_err("unknown context must fail");
        assert_eq!(err.code, crate::adapter::EvalErrorCode::InvalidConfig);
    }
}
