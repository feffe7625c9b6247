// Position and PnL accounting
pub mod live;
pub mod order_log;
pub mod simulated;

pub use live::LiveLedger;
pub use order_log::{OrderLog, OrderLogRecord};
pub use simulated::SimulatedLedger;

use crate::models::{Fill, PositionSnapshot, Side};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Return on the position's entry price from closing at `price`, net of commission.
/// Positive is a gain for either side.
pub fn close_rate(long: bool, avg_price: f64, price: f64, commission: f64) -> f64 {
    if avg_price == 0.0 {
        return 0.0;
    }
    let raw = if long {
        (price - avg_price) / avg_price
    } else {
        (avg_price - price) / avg_price
    };
    raw - commission
}

/// Quote-currency PnL of closing `qty` units opened at `avg_price` at `price`
pub fn position_pnl(
    long: bool,
    qty: f64,
    avg_price: f64,
    price: f64,
    commission: f64,
    qty_in_quote: bool,
) -> f64 {
    let rate = close_rate(long, avg_price, price, commission);
    qty.abs() * rate * if qty_in_quote { 1.0 } else { avg_price }
}

/// Price at which closing the whole position realizes exactly `pnl` (negative for a loss)
pub fn price_for_pnl(
    long: bool,
    qty: f64,
    avg_price: f64,
    pnl: f64,
    commission: f64,
    qty_in_quote: bool,
) -> Option<f64> {
    if qty == 0.0 || avg_price <= 0.0 {
        return None;
    }
    let notional = qty.abs() * if qty_in_quote { 1.0 } else { avg_price };
    let rate = pnl / notional + commission;
    let sign = if long { 1.0 } else { -1.0 };
    let price = avg_price * (1.0 + sign * rate);
    (price > 0.0).then_some(price)
}

/// Running session statistics, updated on every realizing fill
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LedgerStats {
    pub balance: f64,
    pub balance_ath: f64,
    pub win_count: u32,
    pub lose_count: u32,
    pub win_profit: f64,
    pub lose_loss: f64,
    /// Worst leveraged close rate of a losing trade (<= 0)
    pub max_drawdown: f64,
    /// Largest peak-to-balance drop recorded, in quote currency
    pub max_drawdown_session: f64,
    pub max_drawdown_session_pct: f64,
    /// Current drop from the peak, percent
    pub drawdown_pct: f64,
    pub order_count: u32,
}

impl LedgerStats {
    pub fn new(balance: f64) -> Self {
        Self {
            balance,
            balance_ath: balance,
            ..Default::default()
        }
    }

    /// Track a new balance against the running peak. The session maximum only moves
    /// when the percentage drop exceeds the one already recorded.
    pub fn record_balance(&mut self, balance: f64) {
        self.balance = balance;
        if balance > self.balance_ath {
            self.balance_ath = balance;
        }
        if self.balance_ath <= 0.0 {
            self.drawdown_pct = 0.0;
            return;
        }

        let drop = self.balance_ath - balance;
        let drop_pct = drop / self.balance_ath * 100.0;
        if drop > 0.0 && drop_pct > self.max_drawdown_session_pct {
            self.max_drawdown_session = drop;
            self.max_drawdown_session_pct = drop_pct;
        }
        self.drawdown_pct = drop_pct.max(0.0);
    }

    pub fn record_close(&mut self, profit: f64, close_rate: f64, leverage: f64) {
        if profit > 0.0 {
            self.win_profit += profit;
            self.win_count += 1;
        } else {
            self.lose_loss += -profit;
            self.lose_count += 1;
            if close_rate * leverage < self.max_drawdown {
                self.max_drawdown = close_rate * leverage;
            }
        }
    }

    pub fn trade_count(&self) -> u32 {
        self.win_count + self.lose_count
    }

    /// Percent of closing trades that made money
    pub fn win_rate(&self) -> f64 {
        let trades = self.trade_count();
        if trades == 0 {
            0.0
        } else {
            self.win_count as f64 / trades as f64 * 100.0
        }
    }

    /// One-line session summary
    pub fn summary(&self) -> String {
        format!(
            "balance {:.2}, trades {}, win rate {:.1}%, max drawdown {:.2}%",
            self.balance,
            self.trade_count(),
            self.win_rate(),
            self.max_drawdown_session_pct
        )
    }

    pub fn profit_factor(&self) -> f64 {
        if self.lose_loss == 0.0 {
            self.win_profit
        } else {
            self.win_profit / self.lose_loss
        }
    }
}

/// Result of committing one fill
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CommitOutcome {
    pub realized_pnl: f64,
    pub closed_qty: f64,
    pub opened_qty: f64,
    pub position_after: f64,
    pub reversal: bool,
}

/// One closing leg, kept for reporting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClosedTrade {
    pub time: DateTime<Utc>,
    pub order_id: String,
    /// Side of the position that was closed
    pub side: Side,
    pub qty: f64,
    pub entry_price: f64,
    pub exit_price: f64,
    pub pnl: f64,
    pub close_rate: f64,
}

/// Position size changed on the venue side
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionTransition {
    pub previous: f64,
    pub current: f64,
    pub avg_price: f64,
}

/// Single source of truth for position, average price and balance
pub trait PositionLedger: Send {
    fn position_size(&self) -> f64;

    /// Meaningless while flat
    fn avg_entry_price(&self) -> f64;

    fn balance(&self) -> f64;

    /// Account for a fill. The live ledger treats this as bookkeeping only.
    fn commit(&mut self, fill: &Fill) -> CommitOutcome;

    fn stats(&self) -> &LedgerStats;

    fn leverage(&self) -> f64;

    fn commission_rate(&self) -> f64;

    fn qty_in_quote(&self) -> bool;

    /// Venue position push; returns the transition when the size moved
    fn apply_position_snapshot(&mut self, _snapshot: &PositionSnapshot) -> Option<PositionTransition> {
        None
    }

    fn apply_wallet_balance(&mut self, _balance: f64) {}

    fn closed_trades(&self) -> &[ClosedTrade] {
        &[]
    }

    fn is_long(&self) -> bool {
        self.position_size() > 0.0
    }

    fn is_short(&self) -> bool {
        self.position_size() < 0.0
    }

    fn is_flat(&self) -> bool {
        self.position_size() == 0.0
    }

    /// Quote-currency PnL if the whole position were closed at `price`
    fn unrealized_pnl(&self, price: f64) -> f64 {
        let size = self.position_size();
        if size == 0.0 {
            return 0.0;
        }
        position_pnl(
            size > 0.0,
            size,
            self.avg_entry_price(),
            price,
            self.commission_rate(),
            self.qty_in_quote(),
        )
    }
}
