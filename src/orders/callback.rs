use crate::models::OrderUpdate;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallbackMode {
    /// Once, when the order reaches FILLED, CANCELED or REJECTED
    Terminal,
    /// Every status update
    EveryUpdate,
}

/// User hook attached to an order
#[derive(Clone)]
pub struct OrderCallback {
    mode: CallbackMode,
    f: Arc<dyn Fn(&OrderUpdate) + Send + Sync>,
}

impl OrderCallback {
    pub fn on_terminal(f: impl Fn(&OrderUpdate) + Send + Sync + 'static) -> Self {
        Self {
            mode: CallbackMode::Terminal,
            f: Arc::new(f),
        }
    }

    pub fn on_every_update(f: impl Fn(&OrderUpdate) + Send + Sync + 'static) -> Self {
        Self {
            mode: CallbackMode::EveryUpdate,
            f: Arc::new(f),
        }
    }

    pub fn mode(&self) -> CallbackMode {
        self.mode
    }

    /// Invoke if this update matters for the callback's mode
    pub fn notify(&self, update: &OrderUpdate) {
        if self.mode == CallbackMode::EveryUpdate || update.status.is_terminal() {
            (self.f)(update);
        }
    }

    /// Invoke regardless of mode (aggregated completions)
    pub fn call(&self, update: &OrderUpdate) {
        (self.f)(update);
    }
}

impl fmt::Debug for OrderCallback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("OrderCallback").field("mode", &self.mode).finish()
    }
}
