use anyhow::Result;
use halo_core::activity::{ActivityKind, ActivityPayload};
use halo_core::plugin::{Presence, PresenceContext, PresenceRegistry};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info};

const MEDIA_PROBE_TIMEOUT: Duration = Duration::from_secs(3);

pub fn register_builtins(registry: &mut PresenceRegistry) {
    registry.register("media_session", "execute", || Box::new(MediaSessionPresence));
    registry.register("idle", "execute", || Box::new(IdlePresence));
    registry.register("stubborn", "execute", || Box::new(StubbornPresence));
}

/// Generic browser presence: mirrors the first tab with playing media,
/// using the page's media-session metadata.
struct MediaSessionPresence;

impl MediaSessionPresence {
    fn scan(&self, ctx: &mut PresenceContext) -> Option<ActivityPayload> {
        for mut page in ctx.pages() {
            let session = match page.media_session(MEDIA_PROBE_TIMEOUT) {
                Ok(Some(session)) => session,
                Ok(None) => continue,
                Err(err) => {
                    debug!(id = %page.id, %err, "media session probe failed");
                    continue;
                }
            };
            if session.get("playbackState").and_then(Value::as_str) != Some("playing") {
                continue;
            }

            let title = session.get("title").and_then(Value::as_str);
            let artist = session.get("artist").and_then(Value::as_str);
            if title.is_none() && artist.is_none() {
                continue;
            }
            return Some(ActivityPayload {
                details: title.map(str::to_string),
                state: artist.map(str::to_string),
                kind: Some(ActivityKind::Listening),
                large_image: session
                    .get("artwork")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                large_text: session
                    .get("album")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                ..ActivityPayload::default()
            });
        }
        None
    }
}

impl Presence for MediaSessionPresence {
    fn run(&mut self, ctx: &mut PresenceContext) -> Result<Option<ActivityPayload>> {
        let mut visible = false;
        loop {
            match self.scan(ctx) {
                Some(payload) => {
                    ctx.publish(&payload);
                    visible = true;
                }
                None if visible => {
                    ctx.clear();
                    visible = false;
                }
                None => {}
            }
            if !ctx.wait_interval() {
                return Ok(None);
            }
        }
    }
}

/// Publishes a fixed idle activity each tick until cancelled. Also serves
/// as the cooperative-lifecycle fixture for integration tests.
struct IdlePresence;

impl Presence for IdlePresence {
    fn run(&mut self, ctx: &mut PresenceContext) -> Result<Option<ActivityPayload>> {
        let payload = ActivityPayload {
            state: Some("Idle".to_string()),
            kind: Some(ActivityKind::Playing),
            ..ActivityPayload::default()
        };

        loop {
            ctx.publish(&payload);
            if !ctx.wait_interval() {
                return Ok(None);
            }
        }
    }
}

/// Lifecycle fixture that never checks its cancellation signal. Exists so
/// the supervisor's forced-termination backstop has something real to kill.
struct StubbornPresence;

impl Presence for StubbornPresence {
    fn run(&mut self, ctx: &mut PresenceContext) -> Result<Option<ActivityPayload>> {
        let payload = ActivityPayload {
            state: Some("Unstoppable".to_string()),
            ..ActivityPayload::default()
        };
        ctx.publish(&payload);
        info!("sleeping without watching the stop signal");
        std::thread::sleep(Duration::from_secs(600));
        Ok(None)
    }
}
