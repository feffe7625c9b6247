use crate::models::TriggerBy;
use crate::orders::{OrderCallback, OrderRequest, DEFAULT_RETRY_MAKER};
use chrono::Duration;

/// How a triggered close is executed
#[derive(Debug, Clone, PartialEq)]
pub struct ExitExecution {
    pub split: u32,
    pub interval: Duration,
    pub chaser: bool,
    pub retry_maker: u32,
}

impl Default for ExitExecution {
    fn default() -> Self {
        Self {
            split: 1,
            interval: Duration::zero(),
            chaser: false,
            retry_maker: DEFAULT_RETRY_MAKER,
        }
    }
}

impl ExitExecution {
    /// Carry the execution parameters onto an order request
    pub fn apply(&self, request: OrderRequest) -> OrderRequest {
        request
            .with_split(self.split, self.interval)
            .with_chaser(self.chaser, self.retry_maker)
    }
}

/// Absolute quote-currency exits and a trailing stop.
/// Replaced wholesale by every `exit()` call.
#[derive(Debug, Clone, Default)]
pub struct ExitPolicy {
    /// Close when unrealized profit exceeds this much quote currency
    pub profit: f64,
    /// Close when unrealized loss exceeds this much quote currency
    pub loss: f64,
    /// Distance from the trail ratchet that triggers a close
    pub trail_offset: f64,
    pub profit_callback: Option<OrderCallback>,
    pub loss_callback: Option<OrderCallback>,
    pub trail_callback: Option<OrderCallback>,
    pub execution: ExitExecution,
}

impl ExitPolicy {
    pub fn new(profit: f64, loss: f64, trail_offset: f64) -> Self {
        Self {
            profit,
            loss,
            trail_offset,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.profit > 0.0 || self.loss > 0.0 || self.trail_offset > 0.0
    }

    pub fn with_callbacks(
        mut self,
        profit: Option<OrderCallback>,
        loss: Option<OrderCallback>,
        trail: Option<OrderCallback>,
    ) -> Self {
        self.profit_callback = profit;
        self.loss_callback = loss;
        self.trail_callback = trail;
        self
    }

    pub fn with_execution(mut self, execution: ExitExecution) -> Self {
        self.execution = execution;
        self
    }
}

/// Percentage take-profit and stop-loss per side, kept as resting reduce-only orders.
/// Values are fractions (0.02 = 2%).
#[derive(Debug, Clone, Default)]
pub struct SltpPolicy {
    pub profit_long: f64,
    pub profit_short: f64,
    pub stop_long: f64,
    pub stop_short: f64,
    /// Hold back the take-profit on the candle right after an entry
    pub eval_tp_next_candle: bool,
    pub profit_long_callback: Option<OrderCallback>,
    pub profit_short_callback: Option<OrderCallback>,
    pub stop_long_callback: Option<OrderCallback>,
    pub stop_short_callback: Option<OrderCallback>,
    pub trigger_by: TriggerBy,
    pub execution: ExitExecution,
}

impl SltpPolicy {
    /// Thresholds given in percent
    pub fn percent(profit_long: f64, profit_short: f64, stop_long: f64, stop_short: f64) -> Self {
        Self {
            profit_long: profit_long / 100.0,
            profit_short: profit_short / 100.0,
            stop_long: stop_long / 100.0,
            stop_short: stop_short / 100.0,
            ..Default::default()
        }
    }

    pub fn is_active(&self) -> bool {
        self.profit_long > 0.0 || self.profit_short > 0.0 || self.stop_long > 0.0 || self.stop_short > 0.0
    }

    pub fn eval_tp_next_candle(mut self, enabled: bool) -> Self {
        self.eval_tp_next_candle = enabled;
        self
    }

    pub fn with_trigger_by(mut self, trigger_by: TriggerBy) -> Self {
        self.trigger_by = trigger_by;
        self
    }

    pub fn with_execution(mut self, execution: ExitExecution) -> Self {
        self.execution = execution;
        self
    }

    pub fn with_take_profit_callbacks(
        mut self,
        long: Option<OrderCallback>,
        short: Option<OrderCallback>,
    ) -> Self {
        self.profit_long_callback = long;
        self.profit_short_callback = short;
        self
    }

    pub fn with_stop_loss_callbacks(
        mut self,
        long: Option<OrderCallback>,
        short: Option<OrderCallback>,
    ) -> Self {
        self.stop_long_callback = long;
        self.stop_short_callback = short;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_flags() {
        assert!(!ExitPolicy::default().is_active());
        assert!(ExitPolicy::new(0.0, 0.0, 5.0).is_active());
        assert!(!SltpPolicy::default().is_active());

        let sltp = SltpPolicy::percent(2.0, 0.0, 0.0, 1.0);
        assert!(sltp.is_active());
        assert_eq!(sltp.profit_long, 0.02);
        assert_eq!(sltp.stop_short, 0.01);
    }
}
