use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};
use tracing::debug;
use tungstenite::handshake::HandshakeError;
use tungstenite::{Error, Message, WebSocket};
use url::Url;

/// Granularity of blocking reads. Each read wakes at least this often so
/// deadline checks can run.
const READ_TICK: Duration = Duration::from_millis(100);

#[derive(Debug)]
pub enum WsError {
    Timeout,
    Closed,
    Endpoint(String),
    Io(String),
    Protocol(String),
}

impl WsError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout)
    }
}

impl std::fmt::Display for WsError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Timeout => write!(f, "websocket timed out"),
            Self::Closed => write!(f, "websocket is closed"),
            Self::Endpoint(detail) => write!(f, "invalid websocket endpoint: {detail}"),
            Self::Io(detail) => write!(f, "websocket io error: {detail}"),
            Self::Protocol(detail) => write!(f, "websocket protocol error: {detail}"),
        }
    }
}

impl std::error::Error for WsError {}

/// Blocking WebSocket client with a bounded open handshake and tick-based
/// receive so no call can hang past its caller's deadline.
pub struct WsClient {
    socket: WebSocket<TcpStream>,
}

impl WsClient {
    pub fn connect(endpoint: &str, open_timeout: Duration) -> Result<Self, WsError> {
        let parsed =
            Url::parse(endpoint).map_err(|err| WsError::Endpoint(format!("{endpoint}: {err}")))?;
        let host = parsed
            .host_str()
            .ok_or_else(|| WsError::Endpoint(format!("{endpoint}: missing host")))?;
        let port = parsed.port_or_known_default().unwrap_or(80);

        let deadline = Instant::now() + open_timeout;
        let addrs = (host, port)
            .to_socket_addrs()
            .map_err(|err| WsError::Io(format!("resolve {host}:{port} failed: {err}")))?
            .collect::<Vec<_>>();

        let mut stream = None;
        let mut last_err = WsError::Endpoint(format!("{endpoint}: no addresses"));
        for addr in addrs {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(WsError::Timeout);
            }
            match TcpStream::connect_timeout(&addr, remaining) {
                Ok(connected) => {
                    stream = Some(connected);
                    break;
                }
                Err(err) if err.kind() == std::io::ErrorKind::TimedOut => {
                    return Err(WsError::Timeout)
                }
                Err(err) => last_err = WsError::Io(format!("connect {addr} failed: {err}")),
            }
        }
        let stream = stream.ok_or(last_err)?;
        stream
            .set_read_timeout(Some(READ_TICK))
            .map_err(|err| WsError::Io(format!("set read timeout failed: {err}")))?;
        let _ = stream.set_nodelay(true);

        let mut attempt = tungstenite::client(endpoint, stream);
        loop {
            match attempt {
                Ok((socket, _response)) => return Ok(Self { socket }),
                Err(HandshakeError::Interrupted(mid)) => {
                    if Instant::now() >= deadline {
                        return Err(WsError::Timeout);
                    }
                    attempt = mid.handshake();
                }
                Err(HandshakeError::Failure(err)) => {
                    return Err(WsError::Protocol(format!("handshake failed: {err}")))
                }
            }
        }
    }

    pub fn send_text(&mut self, text: &str) -> Result<(), WsError> {
        self.socket
            .send(Message::Text(text.to_string()))
            .map_err(classify_error)
    }

    /// Receive the next text message before `deadline`. Non-text frames are
    /// skipped; a read past the deadline returns `WsError::Timeout`.
    pub fn recv_text(&mut self, deadline: Instant) -> Result<String, WsError> {
        loop {
            match self.socket.read() {
                Ok(Message::Text(text)) => return Ok(text),
                Ok(_) => {}
                Err(Error::Io(err))
                    if matches!(
                        err.kind(),
                        std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
                    ) => {}
                Err(Error::ConnectionClosed) | Err(Error::AlreadyClosed) => {
                    return Err(WsError::Closed)
                }
                Err(err) => return Err(classify_error(err)),
            }
            if Instant::now() >= deadline {
                return Err(WsError::Timeout);
            }
        }
    }

    pub fn is_alive(&self) -> bool {
        self.socket.can_write()
    }

    pub fn close(&mut self) {
        if let Err(err) = self.socket.close(None) {
            debug!(%err, "websocket close failed");
        }
        let _ = self.socket.flush();
    }
}

fn classify_error(err: Error) -> WsError {
    match err {
        Error::ConnectionClosed | Error::AlreadyClosed => WsError::Closed,
        Error::Io(io_err)
            if matches!(
                io_err.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut
            ) =>
        {
            WsError::Timeout
        }
        Error::Io(io_err) => WsError::Io(io_err.to_string()),
        other => WsError::Protocol(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn connect_to_silent_endpoint_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        // Hold accepted connections open without ever speaking WebSocket.
        let server = std::thread::spawn(move || listener.accept());

        let started = Instant::now();
        let result = WsClient::connect(
            &format!("ws://{addr}/devtools/page/1"),
            Duration::from_millis(300),
        );
        assert!(matches!(result, Err(WsError::Timeout)));
        assert!(started.elapsed() < Duration::from_secs(3));
        drop(server);
    }

    #[test]
    fn connect_to_closed_port_fails_fast() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let addr = listener.local_addr().expect("addr");
        drop(listener);

        let result = WsClient::connect(
            &format!("ws://{addr}/devtools/page/1"),
            Duration::from_millis(500),
        );
        assert!(result.is_err());
    }

    #[test]
    fn invalid_endpoint_is_rejected() {
        let result = WsClient::connect("not a url", Duration::from_millis(100));
        assert!(matches!(result, Err(WsError::Endpoint(_))));
    }
}
