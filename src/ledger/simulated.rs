use crate::config::LedgerConfig;
use crate::ledger::{
    close_rate, ClosedTrade, CommitOutcome, LedgerStats, OrderLog, OrderLogRecord,
    PositionLedger,
};
use crate::models::Fill;

/// Quantities this close to zero are treated as flat
const QTY_EPSILON: f64 = 1e-9;

fn snap(qty: f64) -> f64 {
    if qty.abs() < QTY_EPSILON {
        0.0
    } else {
        qty
    }
}

/// Ledger that realizes PnL as fills are committed (backtests and paper trading)
pub struct SimulatedLedger {
    config: LedgerConfig,
    position_size: f64,
    avg_entry_price: f64,
    stats: LedgerStats,
    closed_trades: Vec<ClosedTrade>,
    order_log: OrderLog,
}

impl SimulatedLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self::with_order_log(config, OrderLog::in_memory())
    }

    pub fn with_order_log(config: LedgerConfig, order_log: OrderLog) -> Self {
        Self {
            stats: LedgerStats::new(config.initial_balance),
            config,
            position_size: 0.0,
            avg_entry_price: 0.0,
            closed_trades: Vec::new(),
            order_log,
        }
    }

    pub fn order_log(&self) -> &OrderLog {
        &self.order_log
    }

    fn close_leg(&mut self, fill: &Fill, closing_qty: f64, reversal: bool) -> f64 {
        let long_position = self.position_size > 0.0;
        let avg = self.avg_entry_price;
        let rate = close_rate(
            long_position,
            avg,
            fill.price,
            self.config.commission_rate,
        );
        let profit = closing_qty * rate * if self.config.qty_in_quote { 1.0 } else { avg };

        self.stats.record_close(profit, rate, self.config.leverage);
        self.stats.record_balance(self.stats.balance + profit);

        let order_qty = fill.qty * fill.side.sign();
        let after = if reversal {
            0.0
        } else {
            snap(self.position_size + order_qty)
        };

        self.order_log.append(OrderLogRecord {
            time: fill.time,
            side: fill.side,
            id: if reversal {
                "Reversal".to_string()
            } else {
                fill.order_id.clone()
            },
            price: fill.price,
            quantity: if reversal { -self.position_size } else { order_qty },
            avg_price: avg,
            position: after,
            pnl: Some(profit),
            balance: self.stats.balance,
            drawdown: self.stats.drawdown_pct,
        });

        self.closed_trades.push(ClosedTrade {
            time: fill.time,
            order_id: fill.order_id.clone(),
            side: fill.side.opposite(),
            qty: closing_qty,
            entry_price: avg,
            exit_price: fill.price,
            pnl: profit,
            close_rate: rate,
        });

        if self.config.enable_trade_log {
            tracing::info!(
                "Close position: id={} qty={} entry={:.4} exit={:.4} profit={:.4} balance={:.2} win_rate={:.1}% pf={:.2} max_dd_session={:.4} ({:.2}%)",
                if reversal { "Reversal" } else { fill.order_id.as_str() },
                closing_qty,
                avg,
                fill.price,
                profit,
                self.stats.balance,
                self.stats.win_rate(),
                self.stats.profit_factor(),
                self.stats.max_drawdown_session,
                self.stats.max_drawdown_session_pct
            );
        }

        self.position_size = after;
        profit
    }

    fn open_leg(&mut self, fill: &Fill, next_qty: f64) -> f64 {
        let current = self.position_size;
        let increasing = current != 0.0 && current.signum() == next_qty.signum();
        let opened = (next_qty - current).abs();

        self.avg_entry_price = if increasing {
            (self.avg_entry_price * current.abs() + fill.price * opened) / next_qty.abs()
        } else {
            fill.price
        };
        self.position_size = next_qty;

        self.order_log.append(OrderLogRecord {
            time: fill.time,
            side: fill.side,
            id: fill.order_id.clone(),
            price: fill.price,
            quantity: opened * fill.side.sign(),
            avg_price: self.avg_entry_price,
            position: self.position_size,
            pnl: None,
            balance: self.stats.balance,
            drawdown: self.stats.drawdown_pct,
        });

        if self.config.enable_trade_log {
            tracing::info!(
                "Create position: id={} price={:.4} size={} avg={:.4}",
                fill.order_id,
                fill.price,
                self.position_size,
                self.avg_entry_price
            );
        }

        opened
    }
}

impl PositionLedger for SimulatedLedger {
    fn position_size(&self) -> f64 {
        self.position_size
    }

    fn avg_entry_price(&self) -> f64 {
        self.avg_entry_price
    }

    fn balance(&self) -> f64 {
        self.stats.balance
    }

    fn commit(&mut self, fill: &Fill) -> CommitOutcome {
        let pos = self.position_size;
        let mut qty = fill.qty.abs();

        if fill.reduce_only {
            let reduces = pos != 0.0 && (pos > 0.0) != fill.side.is_long();
            if !reduces {
                tracing::debug!("Reduce-only fill {} ignored while position is {}", fill.order_id, pos);
                return CommitOutcome {
                    position_after: pos,
                    ..Default::default()
                };
            }
            qty = qty.min(pos.abs());
        }
        if qty == 0.0 {
            return CommitOutcome {
                position_after: pos,
                ..Default::default()
            };
        }

        let fill = Fill {
            qty,
            ..fill.clone()
        };
        let order_qty = qty * fill.side.sign();
        self.stats.order_count += 1;

        let same_direction = pos == 0.0 || pos.signum() == order_qty.signum();
        let next_qty = if same_direction || qty > pos.abs() {
            snap(pos + order_qty)
        } else {
            0.0
        };

        let mut outcome = CommitOutcome::default();

        if !same_direction {
            let closing_qty = pos.abs().min(qty);
            outcome.reversal = next_qty != 0.0;
            outcome.realized_pnl = self.close_leg(&fill, closing_qty, outcome.reversal);
            outcome.closed_qty = closing_qty;
        }

        if next_qty != 0.0 {
            outcome.opened_qty = self.open_leg(&fill, next_qty);
        }

        outcome.position_after = self.position_size;
        outcome
    }

    fn stats(&self) -> &LedgerStats {
        &self.stats
    }

    fn leverage(&self) -> f64 {
        self.config.leverage
    }

    fn commission_rate(&self) -> f64 {
        self.config.commission_rate
    }

    fn qty_in_quote(&self) -> bool {
        self.config.qty_in_quote
    }

    fn closed_trades(&self) -> &[ClosedTrade] {
        &self.closed_trades
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use chrono::Utc;

    fn ledger() -> SimulatedLedger {
        SimulatedLedger::new(LedgerConfig {
            commission_rate: 0.0,
            enable_trade_log: false,
            ..Default::default()
        })
    }

    fn fill(side: Side, qty: f64, price: f64) -> Fill {
        Fill {
            time: Utc::now(),
            order_id: "T".to_string(),
            side,
            qty,
            price,
            reduce_only: false,
        }
    }

    #[test]
    fn test_round_trip_realizes_pnl() {
        let mut l = ledger();
        l.commit(&fill(Side::Buy, 2.0, 100.0));
        assert_eq!(l.position_size(), 2.0);
        assert_eq!(l.avg_entry_price(), 100.0);

        let out = l.commit(&fill(Side::Sell, 2.0, 110.0));
        assert!((out.realized_pnl - 20.0).abs() < 1e-9);
        assert_eq!(out.position_after, 0.0);
        assert_eq!(l.position_size(), 0.0);
        assert!((l.balance() - 1020.0).abs() < 1e-9);
        assert_eq!(l.stats().win_count, 1);
    }

    #[test]
    fn test_reversal_splits_legs() {
        let mut l = ledger();
        l.commit(&fill(Side::Buy, 3.0, 100.0));

        let out = l.commit(&fill(Side::Sell, 5.0, 90.0));
        assert!(out.reversal);
        assert_eq!(out.closed_qty, 3.0);
        assert_eq!(out.opened_qty, 2.0);
        assert!((out.realized_pnl + 30.0).abs() < 1e-9);
        assert_eq!(l.position_size(), -2.0);
        assert_eq!(l.avg_entry_price(), 90.0);

        let log = l.order_log().records();
        assert_eq!(log.len(), 3);
        assert_eq!(log[1].id, "Reversal");
        assert_eq!(log[1].quantity, -3.0);
        assert_eq!(log[2].quantity, -2.0);
        assert_eq!(log[2].position, -2.0);
    }

    #[test]
    fn test_weighted_average_on_increase() {
        let mut l = ledger();
        l.commit(&fill(Side::Sell, 1.0, 100.0));
        l.commit(&fill(Side::Sell, 3.0, 120.0));
        assert_eq!(l.position_size(), -4.0);
        assert!((l.avg_entry_price() - 115.0).abs() < 1e-9);
    }

    #[test]
    fn test_partial_close_keeps_average() {
        let mut l = ledger();
        l.commit(&fill(Side::Buy, 4.0, 100.0));
        let out = l.commit(&fill(Side::Sell, 1.0, 120.0));
        assert!((out.realized_pnl - 20.0).abs() < 1e-9);
        assert_eq!(l.position_size(), 3.0);
        assert_eq!(l.avg_entry_price(), 100.0);
    }

    #[test]
    fn test_reduce_only_is_clamped() {
        let mut l = ledger();
        l.commit(&fill(Side::Buy, 1.0, 100.0));

        let mut f = fill(Side::Sell, 5.0, 105.0);
        f.reduce_only = true;
        let out = l.commit(&f);
        assert_eq!(out.closed_qty, 1.0);
        assert_eq!(l.position_size(), 0.0);

        // Nothing left to reduce
        let out = l.commit(&f);
        assert_eq!(out.closed_qty, 0.0);
        assert_eq!(l.position_size(), 0.0);
    }

    #[test]
    fn test_commission_and_quote_quantities() {
        let mut l = SimulatedLedger::new(LedgerConfig {
            commission_rate: 0.001,
            qty_in_quote: true,
            enable_trade_log: false,
            ..Default::default()
        });
        l.commit(&fill(Side::Buy, 500.0, 100.0));
        let out = l.commit(&fill(Side::Sell, 500.0, 110.0));
        // 500 * (0.1 - 0.001)
        assert!((out.realized_pnl - 49.5).abs() < 1e-9);
    }

    #[test]
    fn test_losing_trade_updates_drawdown() {
        let mut l = ledger();
        l.commit(&fill(Side::Buy, 1.0, 100.0));
        l.commit(&fill(Side::Sell, 1.0, 80.0));
        let stats = l.stats();
        assert_eq!(stats.lose_count, 1);
        assert!((stats.lose_loss - 20.0).abs() < 1e-9);
        assert!((stats.max_drawdown + 0.2).abs() < 1e-9);
        assert!((stats.max_drawdown_session - 20.0).abs() < 1e-9);
        assert!((stats.drawdown_pct - 2.0).abs() < 1e-9);
    }
}
