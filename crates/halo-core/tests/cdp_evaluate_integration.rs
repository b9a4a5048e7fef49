use halo_core::adapter::{ProtocolAdapter, ProtocolKind};
use halo_core::cdp::CdpAdapter;
use halo_core::context::WireContext;
use serde_json::{json, Value};
use std::net::TcpListener;
use std::time::{Duration, Instant};
use tungstenite::Message;

/// WebSocket stub for one tab: answers `Runtime.evaluate` requests with the
/// canned result, after first emitting a frame with an unrelated id that the
/// client must discard.
fn stub_tab_socket(result: Value) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind tab socket");
    let addr = listener.local_addr().expect("addr");
    std::thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        let mut socket = tungstenite::accept(stream).expect("accept websocket");
        loop {
            let message = match socket.read() {
                Ok(Message::Text(text)) => text,
                Ok(Message::Close(_)) | Err(_) => return,
                Ok(_) => continue,
            };
            let request: Value = serde_json::from_str(&message).expect("request json");
            let id = request["id"].as_u64().expect("request id");
            assert_eq!(request["method"], json!("Runtime.evaluate"));

            // Unrelated frame first; correlation must skip it.
            let stray = json!({"id": 999_999, "result": {"result": {"type": "string", "value": "stray"}}});
            socket
                .send(Message::Text(stray.to_string()))
                .expect("send stray frame");

            let mut response = result.clone();
            response["id"] = json!(id);
            socket
                .send(Message::Text(response.to_string()))
                .expect("send response");
        }
    });
    format!("ws://{addr}/devtools/page/stub")
}

#[test]
fn evaluate_round_trip_discards_mismatched_frames() {
    let ws_url = stub_tab_socket(json!({
        "result": {"result": {"type": "string", "value": "ok"}},
    }));
    let mut context = WireContext::new(
        "tab-1",
        "https://a.example",
        "A",
        ProtocolKind::Cdp,
        Some(ws_url),
    );

    let outcome = context
        .evaluate("document.title", true, Duration::from_secs(5))
        .expect("evaluate");
    assert_eq!(outcome.kind, "string");
    assert_eq!(outcome.value, Some(json!("ok")));
    assert!(outcome.error.is_none());

    // The socket stays open; a second call reuses it with a fresh id.
    let outcome = context
        .evaluate("document.title", true, Duration::from_secs(5))
        .expect("second evaluate");
    assert_eq!(outcome.value, Some(json!("ok")));
}

#[test]
fn error_frames_become_error_outcomes_not_failures() {
    let ws_url = stub_tab_socket(json!({
        "error": {"message": "execution context destroyed"},
    }));
    let mut context = WireContext::new(
        "tab-1",
        "https://a.example",
        "A",
        ProtocolKind::Cdp,
        Some(ws_url),
    );

    let outcome = context
        .evaluate("1 + 1", false, Duration::from_secs(5))
        .expect("evaluate returns an outcome");
    assert_eq!(outcome.kind, "error");
    assert_eq!(outcome.error.as_deref(), Some("execution context destroyed"));
}

#[test]
fn silent_tab_socket_yields_timeout_within_bound() {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
    let addr = listener.local_addr().expect("addr");
    std::thread::spawn(move || {
        let Ok((stream, _)) = listener.accept() else {
            return;
        };
        // Complete the websocket handshake, then never answer anything.
        if let Ok(mut socket) = tungstenite::accept(stream) {
            while socket.read().is_ok() {}
        }
    });

    let mut context = WireContext::new(
        "tab-1",
        "https://a.example",
        "A",
        ProtocolKind::Cdp,
        Some(format!("ws://{addr}/devtools/page/stub")),
    );

    let started = Instant::now();
    let err = context
        .evaluate("1 + 1", false, Duration::from_millis(400))
        .expect_err("silent socket must time out");
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[test]
fn adapter_evaluate_uses_discovered_context() {
    let ws_url = stub_tab_socket(json!({
        "result": {"result": {"type": "number", "value": 2}},
    }));

    // Discovery stub handing out the tab above.
    let body = json!([
        {"id": "tab-1", "type": "page", "url": "https://a.example", "title": "A",
         "webSocketDebuggerUrl": ws_url},
    ])
    .to_string();
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind discovery");
    let addr = listener.local_addr().expect("addr");
    std::thread::spawn(move || {
        use std::io::{BufRead, BufReader, Write};
        let Ok((mut stream, _)) = listener.accept() else {
            return;
        };
        let mut reader = BufReader::new(stream.try_clone().expect("clone"));
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
    });

    let mut adapter = CdpAdapter::new(addr.ip().to_string(), addr.port());
    let contexts = adapter.get_contexts().expect("contexts");
    assert_eq!(contexts.len(), 1);

    let outcome = adapter
        .evaluate("tab-1", "1 + 1", false)
        .expect("adapter evaluate");
    assert_eq!(outcome.kind, "number");
    assert_eq!(outcome.value, Some(json!(2)));
}
