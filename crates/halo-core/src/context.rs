use crate::adapter::{EvalError, EvalOutcome, ProtocolKind};
use crate::ws::{WsClient, WsError};
use serde_json::{json, Value};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const SOCKET_OPEN_TIMEOUT: Duration = Duration::from_secs(2);

/// Script run by `media_session` to read playback metadata out of a page.
pub const MEDIA_SESSION_EXPRESSION: &str = r#"
(function(){
  try {
    const ms = navigator.mediaSession;
    if(!ms) return null;
    const md = ms.metadata || {};
    return {
      title: md.title || null,
      artist: md.artist || null,
      album: md.album || null,
      artwork: (md.artwork && md.artwork[0]) ? (md.artwork[0].src || null) : null,
      playbackState: navigator.mediaSession.playbackState || null
    };
  } catch(e) {
    return {__error: e && e.message};
  }
})()
"#;

/// One remote-debuggable browser tab. Identity is `(id, url)`; the per-tab
/// socket, when opened, belongs to this value and closes with it.
pub struct WireContext {
    pub id: String,
    pub url: String,
    pub title: String,
    pub kind: ProtocolKind,
    pub ws_url: Option<String>,
    prefetched_media_session: Option<Value>,
    socket: Option<WsClient>,
    next_request_id: u64,
}

impl WireContext {
    pub fn new(
        id: impl Into<String>,
        url: impl Into<String>,
        title: impl Into<String>,
        kind: ProtocolKind,
        ws_url: Option<String>,
    ) -> Self {
        Self {
            id: id.into(),
            url: url.into(),
            title: title.into(),
            kind,
            ws_url,
            prefetched_media_session: None,
            socket: None,
            next_request_id: 0,
        }
    }

    pub fn with_media_session(mut self, media_session: Option<Value>) -> Self {
        self.prefetched_media_session = media_session;
        self
    }

    pub fn prefetched_media_session(&self) -> Option<&Value> {
        self.prefetched_media_session.as_ref()
    }

    pub fn is_socket_open(&self) -> bool {
        self.socket.as_ref().is_some_and(WsClient::is_alive)
    }

    fn ensure_socket(&mut self) -> Result<&mut WsClient, EvalError> {
        if !self.is_socket_open() {
            let endpoint = self.ws_url.clone().ok_or_else(|| {
                EvalError::invalid_config(format!("context {} has no socket endpoint", self.id))
            })?;
            debug!(id = %self.id, "opening context socket");
            let client = WsClient::connect(&endpoint, SOCKET_OPEN_TIMEOUT).map_err(|err| match err {
                WsError::Timeout => EvalError::timeout(format!("open {endpoint} timed out")),
                other => EvalError::transport(format!("open {endpoint} failed: {other}")),
            })?;
            return Ok(self.socket.insert(client));
        }
        self.socket
            .as_mut()
            .ok_or_else(|| EvalError::transport("context socket unavailable"))
    }

    /// Evaluate a script expression in this tab. Frames whose correlation id
    /// does not match are discarded; no matching response before `timeout`
    /// is a timeout error. A response carrying an error object becomes an
    /// `EvalOutcome` with `kind == "error"`, never an `Err`.
    pub fn evaluate(
        &mut self,
        expression: &str,
        await_promise: bool,
        timeout: Duration,
    ) -> Result<EvalOutcome, EvalError> {
        match self.kind {
            ProtocolKind::Shim => {
                return Err(EvalError::invalid_config(
                    "shim context cannot evaluate directly",
                ))
            }
            ProtocolKind::Bidi => {
                return Err(EvalError::invalid_config("bidi protocol is disabled"))
            }
            ProtocolKind::Cdp => {}
        }

        self.next_request_id += 1;
        let request_id = self.next_request_id;
        let request = json!({
            "id": request_id,
            "method": "Runtime.evaluate",
            "params": {
                "expression": expression,
                "awaitPromise": await_promise,
                "returnByValue": true,
            },
        });

        let deadline = Instant::now() + timeout;
        let result = {
            let socket = self.ensure_socket()?;
            exchange(socket, &request.to_string(), request_id, deadline)
        };
        if matches!(&result, Err(err) if !err.is_timeout()) {
            // A timed-out socket stays usable (stragglers are discarded by
            // correlation id later); a broken one does not.
            self.drop_socket();
        }
        result
    }

    /// Read the page's media-session metadata. Shim contexts return the
    /// snapshot value embedded by the owning runtime, if any.
    pub fn media_session(&mut self, timeout: Duration) -> Result<Option<Value>, EvalError> {
        if self.kind == ProtocolKind::Shim {
            if let Some(prefetched) = &self.prefetched_media_session {
                return Ok(Some(prefetched.clone()));
            }
        }
        let outcome = self.evaluate(MEDIA_SESSION_EXPRESSION, true, timeout)?;
        if let Some(error) = outcome.error {
            warn!(id = %self.id, %error, "media session probe failed");
            return Ok(None);
        }
        Ok(outcome.value.filter(|value| !value.is_null()))
    }

    fn drop_socket(&mut self) {
        if let Some(mut socket) = self.socket.take() {
            socket.close();
        }
    }

    pub fn close(&mut self) {
        self.drop_socket();
    }
}

fn exchange(
    socket: &mut WsClient,
    request: &str,
    request_id: u64,
    deadline: Instant,
) -> Result<EvalOutcome, EvalError> {
    socket
        .send_text(request)
        .map_err(|err| EvalError::transport(format!("evaluate send failed: {err}")))?;

    loop {
        let raw = match socket.recv_text(deadline) {
            Ok(raw) => raw,
            Err(WsError::Timeout) => {
                return Err(EvalError::timeout(format!(
                    "no response to Runtime.evaluate (id={request_id})"
                )))
            }
            Err(err) => {
                return Err(EvalError::transport(format!("evaluate receive failed: {err}")))
            }
        };

        let Ok(message) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        if message.get("id").and_then(Value::as_u64) != Some(request_id) {
            continue;
        }
        return Ok(translate_response(&message));
    }
}

fn translate_response(message: &Value) -> EvalOutcome {
    if let Some(error) = message.get("error") {
        let detail = error
            .get("message")
            .and_then(Value::as_str)
            .unwrap_or("unknown error")
            .to_string();
        return EvalOutcome::error(detail);
    }

    let inner = message.pointer("/result/result");
    EvalOutcome {
        kind: inner
            .and_then(|result| result.get("type"))
            .and_then(Value::as_str)
            .unwrap_or("undefined")
            .to_string(),
        value: inner.and_then(|result| result.get("value")).cloned(),
        error: None,
    }
}

impl Clone for WireContext {
    /// Clones are value snapshots: the per-tab socket stays with the
    /// original.
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            url: self.url.clone(),
            title: self.title.clone(),
            kind: self.kind,
            ws_url: self.ws_url.clone(),
            prefetched_media_session: self.prefetched_media_session.clone(),
            socket: None,
            next_request_id: 0,
        }
    }
}

impl PartialEq for WireContext {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.url == other.url
    }
}

impl Eq for WireContext {}

impl std::hash::Hash for WireContext {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
        self.url.hash(state);
    }
}

impl std::fmt::Debug for WireContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WireContext")
            .field("id", &self.id)
            .field("url", &self.url)
            .field("title", &self.title)
            .field("kind", &self.kind)
            .field("ws_url", &self.ws_url)
            .finish()
    }
}

impl Drop for WireContext {
    fn drop(&mut self) {
        self.drop_socket();
    }
}
