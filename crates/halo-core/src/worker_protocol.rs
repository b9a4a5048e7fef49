use crate::activity::ActivityPayload;
use crate::adapter::ProtocolKind;
use crate::context::WireContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Messages the manager pushes into a worker's stdin.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HostMessage {
    /// Full replacement snapshot of the browser contexts.
    Pages { pages: Vec<PageRecord> },
    /// Cooperative cancellation signal.
    Shutdown,
}

/// Messages a worker writes to its stdout for the manager.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkerMessage {
    Ready { pid: u32 },
    /// The worker's last published activity, mirrored for host UI display.
    /// `None` means the activity was cleared.
    Status { activity: Option<ActivityPayload> },
}

/// Value snapshot of one WireContext, safe to carry across the process
/// boundary: endpoints travel as plain strings, never as live sockets.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PageRecord {
    pub id: String,
    pub url: String,
    pub title: String,
    #[serde(default)]
    pub ws_url: Option<String>,
    #[serde(default)]
    pub media_session: Option<Value>,
}

impl PageRecord {
    pub fn from_context(context: &WireContext) -> Self {
        Self {
            id: context.id.clone(),
            url: context.url.clone(),
            title: context.title.clone(),
            ws_url: context.ws_url.clone(),
            media_session: context.prefetched_media_session().cloned(),
        }
    }

    /// Rebuild a context on the worker side. A record with a socket endpoint
    /// stays evaluable over the worker's own short-lived socket; one without
    /// becomes a shim context that cannot evaluate directly.
    pub fn into_context(self) -> WireContext {
        let kind = if self.ws_url.is_some() {
            ProtocolKind::Cdp
        } else {
            ProtocolKind::Shim
        };
        WireContext::new(self.id, self.url, self.title, kind, self.ws_url)
            .with_media_session(self.media_session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn host_messages_roundtrip() {
        let message = HostMessage::Pages {
            pages: vec![PageRecord {
                id: "A".to_string(),
                url: "https://a.example".to_string(),
                title: "A".to_string(),
                ws_url: Some("ws://127.0.0.1:9222/devtools/page/A".to_string()),
                media_session: None,
            }],
        };

        let encoded = serde_json::to_string(&message).expect("serialize pages");
        let decoded: HostMessage = serde_json::from_str(&encoded).expect("deserialize pages");
        assert_eq!(decoded, message);

        let shutdown = serde_json::to_string(&HostMessage::Shutdown).expect("serialize shutdown");
        assert_eq!(shutdown, r#"{"kind":"shutdown"}"#);
    }

    #[test]
    fn worker_status_roundtrips_with_and_without_activity() {
        let cleared = WorkerMessage::Status { activity: None };
        let encoded = serde_json::to_string(&cleared).expect("serialize cleared status");
        let decoded: WorkerMessage = serde_json::from_str(&encoded).expect("deserialize status");
        assert_eq!(decoded, cleared);

        let payload = ActivityPayload {
            state: Some("Idle".to_string()),
            ..ActivityPayload::default()
        };
        let status = WorkerMessage::Status {
            activity: Some(payload),
        };
        let encoded = serde_json::to_string(&status).expect("serialize status");
        let decoded: WorkerMessage = serde_json::from_str(&encoded).expect("deserialize status");
        assert_eq!(decoded, status);
    }

    #[test]
    fn record_with_endpoint_rebuilds_as_evaluable_context() {
        let record = PageRecord {
            id: "A".to_string(),
            url: "https://a.example".to_string(),
            title: "A".to_string(),
            ws_url: Some("ws://127.0.0.1:9222/devtools/page/A".to_string()),
            media_session: None,
        };
        let context = record.into_context();
        assert_eq!(context.kind, ProtocolKind::Cdp);
    }

    #[test]
    fn record_without_endpoint_rebuilds_as_shim_context() {
        let record = PageRecord {
            id: "A".to_string(),
            url: "https://a.example".to_string(),
            title: "A".to_string(),
            ws_url: None,
            media_session: Some(json!({"title": "Song"})),
        };
        let context = record.into_context();
        assert_eq!(context.kind, ProtocolKind::Shim);
        assert_eq!(
            context.prefetched_media_session(),
            Some(&json!({"title": "Song"}))
        );
    }
}
