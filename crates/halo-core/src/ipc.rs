use crate::activity::ActivityPayload;
use serde_json::{json, Value};
use std::io::{Read, Write};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const PIPE_PROBE_RANGE: u32 = 10;
const CLEAR_TO_CLOSE_DELAY: Duration = Duration::from_millis(250);

/// Operation codes of the local activity channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OperationCode {
    Handshake,
    Frame,
    Close,
}

impl OperationCode {
    pub const fn code(self) -> i32 {
        match self {
            Self::Handshake => 0,
            Self::Frame => 1,
            Self::Close => 2,
        }
    }
}

#[derive(Debug)]
pub enum IpcError {
    Handshake(String),
}

impl std::fmt::Display for IpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Handshake(detail) => write!(f, "handshake rejected: {detail}"),
        }
    }
}

impl std::error::Error for IpcError {}

#[cfg(unix)]
mod pipe {
    use std::io;
    use std::os::unix::net::UnixStream;
    use std::path::PathBuf;

    pub type PipeStream = UnixStream;

    fn base_dirs() -> Vec<PathBuf> {
        ["XDG_RUNTIME_DIR", "TMPDIR"]
            .iter()
            .filter_map(|key| std::env::var_os(key).map(PathBuf::from))
            .chain(std::iter::once(PathBuf::from("/tmp")))
            .collect()
    }

    pub fn open(index: u32) -> io::Result<PipeStream> {
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no runtime dir");
        for base in base_dirs() {
            match UnixStream::connect(base.join(format!("discord-ipc-{index}"))) {
                Ok(stream) => return Ok(stream),
                Err(err) => last_err = err,
            }
        }
        Err(last_err)
    }
}

#[cfg(windows)]
mod pipe {
    use std::fs::{File, OpenOptions};
    use std::io;

    pub type PipeStream = File;

    pub fn open(index: u32) -> io::Result<PipeStream> {
        OpenOptions::new()
            .read(true)
            .write(true)
            .open(format!(r"\\.\pipe\discord-ipc-{index}"))
    }
}

/// Pipe probing reads the process environment and may reach real sockets,
/// so every test that constructs a client serializes on this.
#[cfg(test)]
pub(crate) static PIPE_TEST_LOCK: parking_lot::Mutex<()> = parking_lot::Mutex::new(());

/// Client for the local activity host. Construction probes the fixed family
/// of channel names; when none opens the client stays in a permanently
/// disconnected "preview" mode where every call is a logged no-op.
pub struct ActivityIpcClient {
    client_id: String,
    pid: u32,
    stream: Option<pipe::PipeStream>,
    pipe_available: bool,
    connected: bool,
}

impl ActivityIpcClient {
    pub fn new(client_id: impl Into<String>) -> Self {
        let mut stream = None;
        for index in 0..PIPE_PROBE_RANGE {
            match pipe::open(index) {
                Ok(opened) => {
                    debug!(index, "connected to activity channel");
                    stream = Some(opened);
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => {
                    error!(index, %err, "error opening activity channel");
                }
            }
        }

        if stream.is_none() {
            error!("no activity channel found (is the chat client running?)");
        }

        Self {
            client_id: client_id.into(),
            pid: std::process::id(),
            pipe_available: stream.is_some(),
            stream,
            connected: false,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Perform the single handshake exchange. An error-code response is a
    /// fatal configuration problem (bad client id) and is returned as such;
    /// an unavailable channel only logs a warning. No retry happens here.
    pub fn connect(&mut self) -> Result<(), IpcError> {
        if !self.pipe_available {
            warn!("activity channel unavailable, running without the host");
            return Ok(());
        }
        if self.connected {
            return Ok(());
        }

        let handshake = json!({"v": 1, "client_id": self.client_id});
        if let Err(err) = self.send_frame(OperationCode::Handshake, &handshake) {
            error!(%err, "handshake send failed");
            self.mark_broken();
            return Ok(());
        }

        let response = match self.recv_frame() {
            Ok(Some(response)) => response,
            Ok(None) => {
                warn!("empty handshake response");
                self.mark_broken();
                return Ok(());
            }
            Err(err) => {
                error!(%err, "handshake receive failed");
                self.mark_broken();
                return Ok(());
            }
        };

        if response.get("code").and_then(Value::as_i64) == Some(4000) {
            let message = response
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("handshake error")
                .to_string();
            return Err(IpcError::Handshake(message));
        }

        if response.get("evt").and_then(Value::as_str) == Some("READY") {
            self.connected = true;
            info!("activity host ready");
            Ok(())
        } else {
            Err(IpcError::Handshake(format!("unexpected response: {response}")))
        }
    }

    /// Publish one activity update. Degrades to a no-op when disconnected or
    /// when the payload carries neither state nor details.
    pub fn update(&mut self, payload: &ActivityPayload) {
        if !self.connected {
            warn!("update skipped, activity client is not connected");
            return;
        }
        if !payload.is_publishable() {
            warn!("update skipped, payload has neither state nor details");
            return;
        }
        self.send_activity(payload.to_wire());
    }

    /// Clear the published activity (a frame with a null activity).
    pub fn clear(&mut self) {
        if !self.connected {
            return;
        }
        self.send_activity(Value::Null);
    }

    /// Clear, give the host a moment to apply it, then close the channel.
    /// Closing without clearing can leave a stale activity visible on the
    /// host after this process exits.
    pub fn close(&mut self) {
        if self.connected {
            self.clear();
            thread::sleep(CLEAR_TO_CLOSE_DELAY);
            if let Err(err) = self.send_frame(OperationCode::Close, &json!({})) {
                debug!(%err, "close frame send failed");
            }
        }
        self.stream = None;
        self.connected = false;
    }

    fn send_activity(&mut self, activity: Value) {
        let envelope = json!({
            "cmd": "SET_ACTIVITY",
            "args": {"pid": self.pid, "activity": activity},
            "nonce": uuid::Uuid::new_v4().to_string(),
        });

        if let Err(err) = self.send_frame(OperationCode::Frame, &envelope) {
            error!(%err, "activity send failed");
            self.mark_broken();
            return;
        }
        // Acknowledgement content is irrelevant, but draining it keeps the
        // channel framing aligned.
        if let Err(err) = self.recv_frame() {
            debug!(%err, "activity acknowledgement read failed");
            self.mark_broken();
        }
    }

    fn mark_broken(&mut self) {
        self.connected = false;
        self.stream = None;
    }

    fn send_frame(&mut self, op: OperationCode, payload: &Value) -> Result<(), String> {
        let Some(stream) = self.stream.as_mut() else {
            return Err("activity channel is closed".to_string());
        };
        let body = serde_json::to_vec(payload)
            .map_err(|err| format!("serialize activity frame failed: {err}"))?;

        let mut packet = Vec::with_capacity(8 + body.len());
        packet.extend_from_slice(&op.code().to_le_bytes());
        packet.extend_from_slice(&(body.len() as i32).to_le_bytes());
        packet.extend_from_slice(&body);

        stream
            .write_all(&packet)
            .and_then(|()| stream.flush())
            .map_err(|err| format!("write activity frame failed: {err}"))
    }

    fn recv_frame(&mut self) -> Result<Option<Value>, String> {
        let Some(stream) = self.stream.as_mut() else {
            return Err("activity channel is closed".to_string());
        };

        let mut header = [0u8; 8];
        stream
            .read_exact(&mut header)
            .map_err(|err| format!("read activity header failed: {err}"))?;
        let length = i32::from_le_bytes([header[4], header[5], header[6], header[7]]);
        if length < 0 {
            return Err(format!("invalid activity frame length {length}"));
        }

        let mut body = vec![0u8; length as usize];
        stream
            .read_exact(&mut body)
            .map_err(|err| format!("read activity body failed: {err}"))?;

        match serde_json::from_slice(&body) {
            Ok(value) => Ok(Some(value)),
            Err(err) => {
                debug!(%err, "unparseable activity frame");
                Ok(None)
            }
        }
    }
}
