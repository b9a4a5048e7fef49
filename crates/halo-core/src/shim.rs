use crate::adapter::{EvalError, EvalOutcome, ProtocolAdapter};
use crate::context::WireContext;
use crate::worker_protocol::PageRecord;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const SHIM_EVALUATE_TIMEOUT: Duration = Duration::from_secs(5);

/// Shared snapshot slot the worker's stdin listener writes into.
pub type SharedPages = Arc<Mutex<Vec<PageRecord>>>;

/// Read-only, zero-socket adapter used inside worker processes. Contexts are
/// rebuilt from the manager-provided snapshot on every read; evaluation is
/// only possible where a record carried a socket endpoint, and then over a
/// socket this process opens itself.
pub struct ShimAdapter {
    snapshot: SharedPages,
}

impl ShimAdapter {
    pub fn new(snapshot: SharedPages) -> Self {
        Self { snapshot }
    }
}

impl ProtocolAdapter for ShimAdapter {
    fn connect(&mut self) -> bool {
        true
    }

    fn get_contexts(&mut self) -> Result<Vec<WireContext>, String> {
        let records = self.snapshot.lock().clone();
        Ok(records.into_iter().map(PageRecord::into_context).collect())
    }

    fn evaluate(
        &mut self,
        context_id: &str,
        expression: &str,
        await_promise: bool,
    ) -> Result<EvalOutcome, EvalError> {
        let record = {
            let snapshot = self.snapshot.lock();
            snapshot
                .iter()
                .find(|record| record.id == context_id)
                .cloned()
        }
        .ok_or_else(|| EvalError::invalid_config(format!("context {context_id} is not known")))?;

        let mut context = record.into_context();
        context.evaluate(expression, await_promise, SHIM_EVALUATE_TIMEOUT)
    }

    fn close(&mut self) {}

    fn is_connected(&self) -> bool {
        true
    }
}

/// Runtime facade handed to presences inside a worker process: the same
/// pages/evaluate surface the manager-side `Runtime` offers, backed by the
/// relayed snapshot instead of live discovery.
pub struct ShimRuntime {
    adapter: ShimAdapter,
}

impl ShimRuntime {
    pub fn new(snapshot: SharedPages) -> Self {
        Self {
            adapter: ShimAdapter::new(snapshot),
        }
    }

    pub fn pages(&mut self) -> Vec<WireContext> {
        self.adapter.get_contexts().unwrap_or_default()
    }

    pub fn evaluate_script(
        &mut self,
        context_id: &str,
        expression: &str,
        await_promise: bool,
    ) -> Result<EvalOutcome, EvalError> {
        self.adapter.evaluate(context_id, expression, await_promise)
    }

    pub fn is_connected(&self) -> bool {
        true
    }
}
