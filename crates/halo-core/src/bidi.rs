use crate::adapter::{EvalError, EvalOutcome, ProtocolAdapter};
use crate::context::WireContext;
use tracing::debug;

/// WebDriver BiDi adapter. The variant is present so protocol selection has
/// a named fallthrough, but it is structurally disabled: `connect()` always
/// reports false and auto-detection moves on to "no protocol available".
pub struct BidiAdapter {
    host: String,
    port: u16,
}

impl BidiAdapter {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl ProtocolAdapter for BidiAdapter {
    fn connect(&mut self) -> bool {
        debug!(host = %self.host, port = self.port, "bidi protocol is disabled");
        false
    }

    fn get_contexts(&mut self) -> Result<Vec<WireContext>, String> {
        Ok(Vec::new())
    }

    fn evaluate(
        &mut self,
        _context_id: &str,
        _expression: &str,
        _await_promise: bool,
    ) -> Result<EvalOutcome, EvalError> {
        Err(EvalError::invalid_config("bidi protocol is disabled"))
    }

    fn close(&mut self) {}

    fn is_connected(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bidi_adapter_never_connects() {
        let mut adapter = BidiAdapter::new("localhost", 4444);
        assert!(!adapter.connect());
        assert!(!adapter.is_connected());
        assert!(adapter.get_contexts().expect("empty contexts").is_empty());
        assert!(adapter.evaluate("x", "1", false).is_err());
    }
}
