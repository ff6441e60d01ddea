use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// Shared stop flag checked by the graph before each task runs.
///
/// Clones share the same flag, so whoever holds a clone can stop the session
/// at its next task boundary. Tasks already running are not interrupted.
#[derive(Clone, Debug, Default)]
pub struct StopSignal {
    raised: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.raised.store(true, Ordering::SeqCst);
    }

    pub fn is_raised(&self) -> bool {
        self.raised.load(Ordering::SeqCst)
    }
}
