use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::Duration;

/// Cheaply clonable stop flag with an interruptible wait, shared between a
/// loop and whoever shuts it down.
#[derive(Clone, Default)]
pub struct StopSignal {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    stopped: Mutex<bool>,
    condvar: Condvar,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        let mut stopped = self.inner.stopped.lock();
        *stopped = true;
        self.inner.condvar.notify_all();
    }

    pub fn clear(&self) {
        *self.inner.stopped.lock() = false;
    }

    pub fn is_set(&self) -> bool {
        *self.inner.stopped.lock()
    }

    /// Sleep up to `timeout`, waking early when the signal is set. Returns
    /// true when the signal is set.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let mut stopped = self.inner.stopped.lock();
        if *stopped {
            return true;
        }
        self.inner.condvar.wait_for(&mut stopped, timeout);
        *stopped
    }
}
