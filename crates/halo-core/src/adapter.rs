use crate::context::WireContext;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which wire protocol a context or adapter speaks. `Shim` marks the
/// read-only, socket-less variant handed to worker processes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    Cdp,
    Bidi,
    Shim,
}

impl ProtocolKind {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::Cdp => "cdp",
            Self::Bidi => "bidi",
            Self::Shim => "shim",
        }
    }

    pub fn from_tag(input: &str) -> Option<Self> {
        match input.trim().to_ascii_lowercase().as_str() {
            "cdp" => Some(Self::Cdp),
            "bidi" => Some(Self::Bidi),
            "shim" => Some(Self::Shim),
            _ => None,
        }
    }
}

/// Outcome of one script evaluation. A response frame carrying an error
/// object is translated into `kind == "error"` rather than an `Err`, so
/// polling loops can treat every evaluate call uniformly.
#[derive(Clone, Debug, PartialEq)]
pub struct EvalOutcome {
    pub kind: String,
    pub value: Option<Value>,
    pub error: Option<String>,
}

impl EvalOutcome {
    pub fn error(detail: impl Into<String>) -> Self {
        Self {
            kind: "error".to_string(),
            value: None,
            error: Some(detail.into()),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EvalErrorCode {
    InvalidConfig,
    Timeout,
    Transport,
    ProtocolViolation,
}

impl EvalErrorCode {
    pub const fn as_tag(self) -> &'static str {
        match self {
            Self::InvalidConfig => "invalid_config",
            Self::Timeout => "timeout",
            Self::Transport => "transport",
            Self::ProtocolViolation => "protocol_violation",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EvalError {
    pub code: EvalErrorCode,
    pub detail: String,
}

impl EvalError {
    pub fn new(code: EvalErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    pub fn invalid_config(detail: impl Into<String>) -> Self {
        Self::new(EvalErrorCode::InvalidConfig, detail)
    }

    pub fn timeout(detail: impl Into<String>) -> Self {
        Self::new(EvalErrorCode::Timeout, detail)
    }

    pub fn transport(detail: impl Into<String>) -> Self {
        Self::new(EvalErrorCode::Transport, detail)
    }

    pub fn is_timeout(&self) -> bool {
        self.code == EvalErrorCode::Timeout
    }
}

impl std::fmt::Display for EvalError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code.as_tag(), self.detail)
    }
}

impl std::error::Error for EvalError {}

/// Capability surface over one browser endpoint: discover live contexts and
/// evaluate script snippets in them by context id.
pub trait ProtocolAdapter: Send {
    /// Cheap liveness probe; never raises.
    fn connect(&mut self) -> bool;

    /// Re-fetch the current context list. Returns a full replacement, not an
    /// incremental patch; a malformed discovery document is an error the
    /// caller decides how to handle.
    fn get_contexts(&mut self) -> Result<Vec<WireContext>, String>;

    fn evaluate(
        &mut self,
        context_id: &str,
        expression: &str,
        await_promise: bool,
    ) -> Result<EvalOutcome, EvalError>;

    fn close(&mut self);

    fn is_connected(&self) -> bool;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_tags_roundtrip() {
        for kind in [ProtocolKind::Cdp, ProtocolKind::Bidi, ProtocolKind::Shim] {
            assert_eq!(ProtocolKind::from_tag(kind.as_tag()), Some(kind));
        }
        assert_eq!(ProtocolKind::from_tag("gopher"), None);
        assert_eq!(ProtocolKind::from_tag(" CDP "), Some(ProtocolKind::Cdp));
    }

    #[test]
    fn eval_error_display_carries_code_tag() {
        let err = EvalError::timeout("no response to request 4");
        assert_eq!(err.to_string(), "timeout: no response to request 4");
        assert!(err.is_timeout());
    }
}
