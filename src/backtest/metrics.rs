use crate::engine::{Invocation, PlotSeries};
use crate::ledger::{ClosedTrade, LedgerStats};
use crate::orders::ChaserStats;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::Path;

/// Complete backtest performance report
#[derive(Debug, Clone, Serialize)]
pub struct BacktestReport {
    pub strategy: String,
    pub symbol: String,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub candles: usize,
    pub missing_candles: usize,

    // P&L
    pub initial_balance: f64,
    pub final_balance: f64,
    pub total_pnl: f64,
    pub total_return_pct: f64,

    // Trade statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    pub profit_factor: f64,

    // Risk
    /// Largest peak-to-trough drop of the closed-trade equity curve
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    /// Worst leveraged close rate of a single losing trade
    pub worst_close_rate: f64,
    pub sharpe_ratio: f64,

    pub order_count: u32,
    pub trades: Vec<ClosedTrade>,
    pub plots: BTreeMap<String, PlotSeries>,
    pub chaser_stats: Vec<ChaserStats>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub invocations: Vec<Invocation>,
}

impl BacktestReport {
    /// Summarize closing legs against the ledger's running statistics
    pub fn from_trades(
        strategy: &str,
        symbol: &str,
        trades: &[ClosedTrade],
        stats: &LedgerStats,
        initial_balance: f64,
    ) -> Self {
        let mut report = Self::empty(strategy, symbol, initial_balance, stats);
        if trades.is_empty() {
            return report;
        }

        let winning: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p > 0.0).collect();
        let losing: Vec<f64> = trades.iter().map(|t| t.pnl).filter(|p| *p <= 0.0).collect();
        let total_wins: f64 = winning.iter().sum();
        let total_losses: f64 = losing.iter().map(|p| p.abs()).sum();

        report.total_trades = trades.len();
        report.winning_trades = winning.len();
        report.losing_trades = losing.len();
        report.win_rate = winning.len() as f64 / trades.len() as f64 * 100.0;
        report.total_pnl = trades.iter().map(|t| t.pnl).sum();
        report.avg_win = if winning.is_empty() {
            0.0
        } else {
            total_wins / winning.len() as f64
        };
        report.avg_loss = if losing.is_empty() {
            0.0
        } else {
            total_losses / losing.len() as f64
        };
        report.largest_win = winning.iter().copied().fold(0.0, f64::max);
        report.largest_loss = losing.iter().copied().fold(0.0, f64::min);
        report.profit_factor = if total_losses > 0.0 {
            total_wins / total_losses
        } else if total_wins > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_pct) = Self::calculate_drawdown(trades, initial_balance);
        report.max_drawdown = max_drawdown;
        report.max_drawdown_pct = max_drawdown_pct;
        report.sharpe_ratio = Self::calculate_sharpe_ratio(trades);
        report.trades = trades.to_vec();
        report
    }

    fn empty(strategy: &str, symbol: &str, initial_balance: f64, stats: &LedgerStats) -> Self {
        let total_return_pct = if initial_balance > 0.0 {
            (stats.balance - initial_balance) / initial_balance * 100.0
        } else {
            0.0
        };
        Self {
            strategy: strategy.to_string(),
            symbol: symbol.to_string(),
            from: None,
            to: None,
            candles: 0,
            missing_candles: 0,
            initial_balance,
            final_balance: stats.balance,
            total_pnl: 0.0,
            total_return_pct,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            avg_win: 0.0,
            avg_loss: 0.0,
            largest_win: 0.0,
            largest_loss: 0.0,
            profit_factor: 0.0,
            max_drawdown: 0.0,
            max_drawdown_pct: 0.0,
            worst_close_rate: stats.max_drawdown,
            sharpe_ratio: 0.0,
            order_count: stats.order_count,
            trades: Vec::new(),
            plots: BTreeMap::new(),
            chaser_stats: Vec::new(),
            invocations: Vec::new(),
        }
    }

    /// Peak-to-trough on the closed-trade equity curve
    fn calculate_drawdown(trades: &[ClosedTrade], initial_balance: f64) -> (f64, f64) {
        let mut peak = initial_balance;
        let mut equity = initial_balance;
        let mut max_dd = 0.0;
        let mut max_dd_pct = 0.0;

        for trade in trades {
            equity += trade.pnl;
            if equity > peak {
                peak = equity;
            }
            let drawdown = peak - equity;
            if drawdown > max_dd {
                max_dd = drawdown;
                max_dd_pct = if peak > 0.0 { drawdown / peak * 100.0 } else { 0.0 };
            }
        }

        (max_dd, max_dd_pct)
    }

    /// Mean over standard deviation of per-trade close rates, risk-free rate 0
    fn calculate_sharpe_ratio(trades: &[ClosedTrade]) -> f64 {
        if trades.len() < 2 {
            return 0.0;
        }
        let returns: Vec<f64> = trades.iter().map(|t| t.close_rate).collect();
        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance = returns
            .iter()
            .map(|r| (r - mean) * (r - mean))
            .sum::<f64>()
            / returns.len() as f64;
        let std_dev = variance.sqrt();

        if std_dev > 0.0 {
            mean / std_dev
        } else {
            0.0
        }
    }

    pub fn write_json(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║              BACKTEST PERFORMANCE REPORT              ║");
        println!("╚═══════════════════════════════════════════════════════╝\n");

        println!("📋 RUN");
        println!("  Strategy:              {}", self.strategy);
        println!("  Symbol:                {}", self.symbol);
        if let (Some(from), Some(to)) = (self.from, self.to) {
            println!("  Period:                {} .. {}", from, to);
        }
        println!("  Candles:               {}", self.candles);
        println!("  Total Missing Candles: {}", self.missing_candles);

        println!("\n📊 P&L SUMMARY");
        println!("  Initial Balance:       {:.2}", self.initial_balance);
        println!("  Final Balance:         {:.2}", self.final_balance);
        println!(
            "  Realized P&L:          {:.2} ({:+.2}%)",
            self.total_pnl, self.total_return_pct
        );

        println!("\n📈 TRADE STATISTICS");
        println!("  Orders Filled:         {}", self.order_count);
        println!("  Total Trades:          {}", self.total_trades);
        println!(
            "  Winning Trades:        {} ({:.1}%)",
            self.winning_trades, self.win_rate
        );
        println!("  Losing Trades:         {}", self.losing_trades);

        if self.total_trades > 0 {
            println!("\n💰 WIN/LOSS ANALYSIS");
            println!("  Average Win:           {:.2}", self.avg_win);
            println!("  Average Loss:          {:.2}", self.avg_loss);
            println!("  Largest Win:           {:.2}", self.largest_win);
            println!("  Largest Loss:          {:.2}", self.largest_loss);
            println!("  Profit Factor:         {:.2}", self.profit_factor);

            println!("\n⚠️  RISK METRICS");
            println!(
                "  Max Drawdown:          {:.2} ({:.2}%)",
                self.max_drawdown, self.max_drawdown_pct
            );
            println!("  Worst Close Rate:      {:.2}%", self.worst_close_rate * 100.0);
            println!("  Sharpe Ratio:          {:.2}", self.sharpe_ratio);
        }

        if !self.chaser_stats.is_empty() {
            println!("\n🎯 LIMIT CHASER");
            for stats in &self.chaser_stats {
                println!(
                    "  {:<10} {} {} start={} avg={} slippage={:+.3}% legs={}",
                    stats.id,
                    stats.side,
                    stats.filled_qty,
                    stats.start_price,
                    stats.avg_price,
                    stats.slippage * 100.0,
                    stats.legs
                );
            }
        }

        if !self.plots.is_empty() {
            let names: Vec<&str> = self.plots.keys().map(String::as_str).collect();
            println!("\n📉 PLOTS: {}", names.join(", "));
        }

        println!("\n═══════════════════════════════════════════════════════\n");
    }
}
