use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{json, Map, Value};

pub const MAX_TEXT_CHARS: usize = 128;
pub const MAX_BUTTON_LABEL_CHARS: usize = 32;
pub const MAX_BUTTON_URL_CHARS: usize = 512;
pub const MAX_BUTTONS: usize = 2;

/// Host activity categories, serialized as the host's integer codes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ActivityKind {
    Playing,
    Listening,
    Watching,
    Competing,
}

impl ActivityKind {
    pub const fn code(self) -> u8 {
        match self {
            Self::Playing => 0,
            Self::Listening => 2,
            Self::Watching => 3,
            Self::Competing => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Playing),
            2 => Some(Self::Listening),
            3 => Some(Self::Watching),
            5 => Some(Self::Competing),
            _ => None,
        }
    }
}

impl Serialize for ActivityKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for ActivityKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        Self::from_code(code).ok_or_else(|| D::Error::custom(format!("unknown activity kind {code}")))
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityButton {
    pub label: String,
    pub url: String,
}

impl ActivityButton {
    pub fn new(label: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            url: url.into(),
        }
    }
}

/// One activity update as a plugin describes it. Everything is optional; an
/// update with neither `state` nor `details` is not publishable.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ActivityPayload {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub details: Option<String>,
    #[serde(default)]
    pub kind: Option<ActivityKind>,
    #[serde(default)]
    pub start_time: Option<i64>,
    #[serde(default)]
    pub end_time: Option<i64>,
    #[serde(default)]
    pub large_image: Option<String>,
    #[serde(default)]
    pub large_text: Option<String>,
    #[serde(default)]
    pub small_image: Option<String>,
    #[serde(default)]
    pub small_text: Option<String>,
    #[serde(default)]
    pub buttons: Vec<ActivityButton>,
}

impl ActivityPayload {
    pub fn is_publishable(&self) -> bool {
        self.state.is_some() || self.details.is_some()
    }

    /// Build the activity object as the host expects it: nested
    /// timestamps/assets groups, fields truncated to the host limits, empty
    /// leaves stripped.
    pub fn to_wire(&self) -> Value {
        let mut activity = Map::new();

        if let Some(state) = &self.state {
            activity.insert("state".into(), json!(truncate_chars(state, MAX_TEXT_CHARS)));
        }
        if let Some(details) = &self.details {
            activity.insert(
                "details".into(),
                json!(truncate_chars(details, MAX_TEXT_CHARS)),
            );
        }
        if let Some(kind) = self.kind {
            activity.insert("type".into(), json!(kind.code()));
        }

        let mut timestamps = Map::new();
        if let Some(start) = self.start_time {
            timestamps.insert("start".into(), json!(start));
        }
        if let Some(end) = self.end_time {
            timestamps.insert("end".into(), json!(end));
        }
        activity.insert("timestamps".into(), Value::Object(timestamps));

        let mut assets = Map::new();
        if let Some(image) = &self.large_image {
            assets.insert("large_image".into(), json!(truncate_chars(image, MAX_TEXT_CHARS)));
        }
        if let Some(text) = &self.large_text {
            assets.insert("large_text".into(), json!(truncate_chars(text, MAX_TEXT_CHARS)));
        }
        if let Some(image) = &self.small_image {
            assets.insert("small_image".into(), json!(truncate_chars(image, MAX_TEXT_CHARS)));
        }
        if let Some(text) = &self.small_text {
            assets.insert("small_text".into(), json!(truncate_chars(text, MAX_TEXT_CHARS)));
        }
        activity.insert("assets".into(), Value::Object(assets));

        let buttons = self
            .buttons
            .iter()
            .take(MAX_BUTTONS)
            .map(|button| {
                json!({
                    "label": truncate_chars(&button.label, MAX_BUTTON_LABEL_CHARS),
                    "url": truncate_chars(&button.url, MAX_BUTTON_URL_CHARS),
                })
            })
            .collect::<Vec<_>>();
        activity.insert("buttons".into(), Value::Array(buttons));

        clean_value(Value::Object(activity))
    }
}

fn truncate_chars(input: &str, max_chars: usize) -> String {
    input.chars().take(max_chars).collect()
}

/// Strip empty leaves from a JSON tree: nulls, empty strings, and containers
/// that end up empty after their own children are stripped. The host rejects
/// empty-string and empty-object leaves, so they must never reach the wire.
/// Cleaning an already-clean tree is a no-op.
pub fn clean_value(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let cleaned = map
                .into_iter()
                .filter_map(|(key, child)| {
                    let child = clean_value(child);
                    if is_empty_leaf(&child) {
                        None
                    } else {
                        Some((key, child))
                    }
                })
                .collect::<Map<_, _>>();
            Value::Object(cleaned)
        }
        Value::Array(items) => {
            let cleaned = items
                .into_iter()
                .map(clean_value)
                .filter(|item| !is_empty_leaf(item))
                .collect::<Vec<_>>();
            Value::Array(cleaned)
        }
        other => other,
    }
}

fn is_empty_leaf(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::String(text) => text.is_empty(),
        Value::Object(map) => map.is_empty(),
        Value::Array(items) => items.is_empty(),
        _ => false,
    }
}
