use crate::config::LedgerConfig;
use crate::ledger::{CommitOutcome, LedgerStats, PositionLedger, PositionTransition};
use crate::models::{Fill, PositionSnapshot};

/// Ledger mirrored from venue snapshots. The venue is authoritative; fills are only logged.
pub struct LiveLedger {
    config: LedgerConfig,
    position: PositionSnapshot,
    stats: LedgerStats,
}

impl LiveLedger {
    pub fn new(config: LedgerConfig) -> Self {
        Self {
            stats: LedgerStats::new(config.initial_balance),
            config,
            position: PositionSnapshot::default(),
        }
    }

    /// Seed from REST queries made at startup
    pub fn with_state(config: LedgerConfig, position: PositionSnapshot, balance: f64) -> Self {
        Self {
            stats: LedgerStats::new(balance),
            config,
            position,
        }
    }
}

impl PositionLedger for LiveLedger {
    fn position_size(&self) -> f64 {
        self.position.size
    }

    fn avg_entry_price(&self) -> f64 {
        self.position.avg_price
    }

    fn balance(&self) -> f64 {
        self.stats.balance
    }

    fn commit(&mut self, fill: &Fill) -> CommitOutcome {
        tracing::debug!(
            "Execution {} {} {} @ {} (position follows venue snapshot)",
            fill.order_id,
            fill.side,
            fill.qty,
            fill.price
        );
        self.stats.order_count += 1;
        CommitOutcome {
            position_after: self.position.size,
            ..Default::default()
        }
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

    fn apply_position_snapshot(&mut self, snapshot: &PositionSnapshot) -> Option<PositionTransition> {
        let previous = self.position.size;
        self.position = *snapshot;
        if previous == snapshot.size {
            return None;
        }

        if previous == 0.0 {
            tracing::info!(
                "Updated position: opened {} at {}",
                snapshot.size,
                snapshot.avg_price
            );
        } else if snapshot.size == 0.0 {
            tracing::info!("Updated position: closed (was {})", previous);
        } else if previous.signum() != snapshot.size.signum() {
            tracing::info!(
                "Updated position: reversed {} -> {} at {}",
                previous,
                snapshot.size,
                snapshot.avg_price
            );
        } else {
            tracing::info!(
                "Updated position: {} -> {} avg {}",
                previous,
                snapshot.size,
                snapshot.avg_price
            );
        }

        Some(PositionTransition {
            previous,
            current: snapshot.size,
            avg_price: snapshot.avg_price,
        })
    }

    fn apply_wallet_balance(&mut self, balance: f64) {
        self.stats.record_balance(balance);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Side;
    use chrono::Utc;

    #[test]
    fn test_commit_does_not_move_position() {
        let mut ledger = LiveLedger::new(LedgerConfig::default());
        let out = ledger.commit(&Fill {
            time: Utc::now(),
            order_id: "Long_abc".to_string(),
            side: Side::Buy,
            qty: 1.0,
            price: 100.0,
            reduce_only: false,
        });
        assert_eq!(out.position_after, 0.0);
        assert_eq!(ledger.position_size(), 0.0);
    }

    #[test]
    fn test_snapshot_diffing() {
        let mut ledger = LiveLedger::new(LedgerConfig::default());
        let t = ledger.apply_position_snapshot(&PositionSnapshot {
            size: 0.5,
            avg_price: 100.0,
        });
        assert_eq!(
            t,
            Some(PositionTransition {
                previous: 0.0,
                current: 0.5,
                avg_price: 100.0
            })
        );
        assert_eq!(ledger.avg_entry_price(), 100.0);

        // Same size again is not a transition
        assert!(ledger
            .apply_position_snapshot(&PositionSnapshot {
                size: 0.5,
                avg_price: 100.0
            })
            .is_none());
    }

    #[test]
    fn test_stats_follow_wallet_not_fills() {
        let mut ledger = LiveLedger::with_state(LedgerConfig::default(), PositionSnapshot::default(), 500.0);
        for (side, price) in [(Side::Buy, 100.0), (Side::Sell, 110.0)] {
            ledger.commit(&Fill {
                time: Utc::now(),
                order_id: "Long_abc".to_string(),
                side,
                qty: 1.0,
                price,
                reduce_only: side == Side::Sell,
            });
        }
        ledger.apply_wallet_balance(510.0);

        let stats = ledger.stats();
        assert_eq!(stats.order_count, 2);
        assert_eq!(stats.trade_count(), 0);
        assert_eq!(stats.balance, 510.0);
    }

    #[test]
    fn test_wallet_updates_drawdown() {
        let mut ledger = LiveLedger::with_state(LedgerConfig::default(), PositionSnapshot::default(), 500.0);
        ledger.apply_wallet_balance(600.0);
        ledger.apply_wallet_balance(540.0);
        assert_eq!(ledger.balance(), 540.0);
        assert_eq!(ledger.stats().balance_ath, 600.0);
        assert!((ledger.stats().max_drawdown_session_pct - 10.0).abs() < 1e-9);
    }
}
