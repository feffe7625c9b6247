use crate::exit::policy::{ExitExecution, ExitPolicy, SltpPolicy};
use crate::exit::trail::TrailState;
use crate::ledger::{position_pnl, price_for_pnl};
use crate::models::{Candle, Side};
use crate::orders::{OrderCallback, OrderRequest, TrackedOrder};
use crate::precision::round_to;

/// Client id prefix of the resting take-profit order
pub const TAKE_PROFIT_ID: &str = "TP";
/// Client id prefix of the resting stop-loss order
pub const STOP_LOSS_ID: &str = "SL";

const QTY_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    TrailingStop,
    StopLoss,
    TakeProfit,
}

impl std::fmt::Display for ExitReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ExitReason::TrailingStop => "trailing stop",
            ExitReason::StopLoss => "stop loss",
            ExitReason::TakeProfit => "take profit",
        };
        write!(f, "{}", s)
    }
}

/// A close instruction for the whole position
#[derive(Debug, Clone)]
pub struct ExitDecision {
    pub reason: ExitReason,
    /// Set when the close should fill exactly at this price (simulation only)
    pub price: Option<f64>,
    pub callback: Option<OrderCallback>,
    pub execution: ExitExecution,
}

#[derive(Debug, Clone)]
pub enum SltpAction {
    Cancel(String),
    Place(OrderRequest),
}

/// What the evaluator needs to know about the position
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PositionView {
    pub size: f64,
    pub avg_price: f64,
    pub market_price: f64,
    pub commission: f64,
    pub qty_in_quote: bool,
}

impl PositionView {
    pub fn is_long(&self) -> bool {
        self.size > 0.0
    }

    pub fn unrealized_pnl(&self, price: f64) -> f64 {
        if self.size == 0.0 {
            return 0.0;
        }
        position_pnl(
            self.is_long(),
            self.size,
            self.avg_price,
            price,
            self.commission,
            self.qty_in_quote,
        )
    }

    fn price_for_pnl(&self, pnl: f64) -> Option<f64> {
        price_for_pnl(
            self.is_long(),
            self.size,
            self.avg_price,
            pnl,
            self.commission,
            self.qty_in_quote,
        )
    }
}

fn decision(policy: &ExitPolicy, reason: ExitReason, price: Option<f64>) -> ExitDecision {
    let callback = match reason {
        ExitReason::TrailingStop => policy.trail_callback.clone(),
        ExitReason::StopLoss => policy.loss_callback.clone(),
        ExitReason::TakeProfit => policy.profit_callback.clone(),
    };
    ExitDecision {
        reason,
        price,
        callback,
        execution: policy.execution.clone(),
    }
}

/// Check the policy at the current market price. Trail first, then loss, then profit;
/// at most one close per evaluation.
pub fn evaluate_exit(policy: &ExitPolicy, view: &PositionView, trail: &TrailState) -> Option<ExitDecision> {
    if !policy.is_active() || view.size == 0.0 {
        return None;
    }

    if trail.is_triggered(view.size, policy.trail_offset, view.market_price) {
        tracing::info!("Loss cut by trailing stop: {}", policy.trail_offset);
        return Some(decision(policy, ExitReason::TrailingStop, None));
    }

    let pnl = view.unrealized_pnl(view.market_price);
    if pnl < 0.0 && 0.0 < policy.loss && policy.loss < pnl.abs() {
        tracing::info!("Loss cut by stop loss: {}", policy.loss);
        return Some(decision(policy, ExitReason::StopLoss, None));
    }
    if pnl > 0.0 && 0.0 < policy.profit && policy.profit < pnl.abs() {
        tracing::info!("Take profit by stop profit: {}", policy.profit);
        return Some(decision(policy, ExitReason::TakeProfit, None));
    }
    None
}

/// Check the policy against a bar's range, closing at the computed trigger price.
/// Loss is checked before the trail and profit so a bar touching both sides books the loss.
pub fn evaluate_intrabar(
    policy: &ExitPolicy,
    view: &PositionView,
    trail: &TrailState,
    bar: &Candle,
) -> Option<ExitDecision> {
    if !policy.is_active() || view.size == 0.0 {
        return None;
    }
    let long = view.is_long();
    let adverse = |price: f64| if long { bar.low <= price } else { bar.high >= price };
    let favourable = |price: f64| if long { bar.high >= price } else { bar.low <= price };

    if policy.loss > 0.0 {
        if let Some(price) = view.price_for_pnl(-policy.loss) {
            if adverse(price) {
                tracing::info!("Loss cut by stop loss: {} at {}", policy.loss, price);
                return Some(decision(policy, ExitReason::StopLoss, Some(price)));
            }
        }
    }
    if let Some(price) = trail.trigger_price(view.size, policy.trail_offset) {
        if adverse(price) {
            tracing::info!("Loss cut by trailing stop: {} at {}", policy.trail_offset, price);
            return Some(decision(policy, ExitReason::TrailingStop, Some(price)));
        }
    }
    if policy.profit > 0.0 {
        if let Some(price) = view.price_for_pnl(policy.profit) {
            if favourable(price) {
                tracing::info!("Take profit by stop profit: {} at {}", policy.profit, price);
                return Some(decision(policy, ExitReason::TakeProfit, Some(price)));
            }
        }
    }
    None
}

fn sized_for(order: Option<&TrackedOrder>, position: f64) -> bool {
    order.is_some_and(|o| (o.signed_qty() + position).abs() < QTY_TOLERANCE)
}

/// Bring the resting TP/SL orders in line with the position. Issues nothing when the
/// existing orders already cover the full position.
pub fn evaluate_sltp(
    policy: &SltpPolicy,
    view: &PositionView,
    take_profit: Option<&TrackedOrder>,
    stop_loss: Option<&TrackedOrder>,
    quote_decimals: u32,
    defer_take_profit: bool,
) -> Vec<SltpAction> {
    let mut actions = Vec::new();
    if !policy.is_active() || view.size == 0.0 {
        return actions;
    }
    let long = view.is_long();
    let qty = view.size.abs();
    let avg = view.avg_price;
    let close_side = Side::from_long(!long);

    let (tp_pct, tp_callback) = if long {
        (policy.profit_long, &policy.profit_long_callback)
    } else {
        (policy.profit_short, &policy.profit_short_callback)
    };
    if tp_pct > 0.0 && !sized_for(take_profit, view.size) {
        if defer_take_profit {
            tracing::debug!("Take profit deferred: entry on the previous candle");
        } else {
            let price = round_to(
                if long { avg + avg * tp_pct } else { avg - avg * tp_pct },
                quote_decimals,
            );
            if let Some(existing) = take_profit {
                actions.push(SltpAction::Cancel(existing.order.client_id.clone()));
            }
            let mut request = OrderRequest::new(TAKE_PROFIT_ID, close_side, qty)
                .with_limit(price)
                .reduce_only(true)
                .with_trigger_by(policy.trigger_by);
            request = policy.execution.apply(request);
            request.callback = tp_callback.clone();
            actions.push(SltpAction::Place(request));
        }
    }

    let (sl_pct, sl_callback) = if long {
        (policy.stop_long, &policy.stop_long_callback)
    } else {
        (policy.stop_short, &policy.stop_short_callback)
    };
    if sl_pct > 0.0 && !sized_for(stop_loss, view.size) {
        let price = round_to(
            if long { avg - avg * sl_pct } else { avg + avg * sl_pct },
            quote_decimals,
        );
        if let Some(existing) = stop_loss {
            actions.push(SltpAction::Cancel(existing.order.client_id.clone()));
        }
        let mut request = OrderRequest::new(STOP_LOSS_ID, close_side, qty)
            .with_stop(price)
            .reduce_only(true)
            .with_trigger_by(policy.trigger_by);
        request = policy.execution.apply(request);
        request.callback = sl_callback.clone();
        actions.push(SltpAction::Place(request));
    }

    actions
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{OrderStatus, TriggerBy};
    use crate::orders::{OrderHandler, OrderKind, OrderRegistry, WorkingOrder};
    use chrono::Utc;

    fn view(size: f64, avg: f64, market: f64) -> PositionView {
        PositionView {
            size,
            avg_price: avg,
            market_price: market,
            commission: 0.0,
            qty_in_quote: false,
        }
    }

    #[test]
    fn test_fixed_loss_and_profit() {
        let policy = ExitPolicy::new(30.0, 10.0, 0.0);
        let trail = TrailState::default();

        // 2 @ 100, market 94 -> -12
        let d = evaluate_exit(&policy, &view(2.0, 100.0, 94.0), &trail).unwrap();
        assert_eq!(d.reason, ExitReason::StopLoss);
        assert!(d.price.is_none());

        // -8 is inside the loss threshold
        assert!(evaluate_exit(&policy, &view(2.0, 100.0, 96.0), &trail).is_none());

        // Short 2 @ 100, market 80 -> +40
        let d = evaluate_exit(&policy, &view(-2.0, 100.0, 80.0), &trail).unwrap();
        assert_eq!(d.reason, ExitReason::TakeProfit);
    }

    #[test]
    fn test_trailing_takes_precedence() {
        let policy = ExitPolicy::new(0.0, 1.0, 2.0);
        let mut trail = TrailState::default();
        trail.reset(100.0);
        trail.ratchet(1.0, 105.0, 106.0);
        let d = evaluate_exit(&policy, &view(1.0, 100.0, 99.0), &trail).unwrap();
        assert_eq!(d.reason, ExitReason::TrailingStop);
    }

    #[test]
    fn test_intrabar_closes_at_trigger_price() {
        let policy = ExitPolicy::new(20.0, 10.0, 0.0);
        let trail = TrailState::default();
        let now = Utc::now();

        // 2 @ 100: loss of 10 at 95, profit of 20 at 110
        let bar = Candle::new(now, 99.0, 101.0, 94.0, 96.0, 1.0);
        let d = evaluate_intrabar(&policy, &view(2.0, 100.0, 96.0), &trail, &bar).unwrap();
        assert_eq!(d.reason, ExitReason::StopLoss);
        assert!((d.price.unwrap() - 95.0).abs() < 1e-9);

        let bar = Candle::new(now, 101.0, 111.0, 100.5, 108.0, 1.0);
        let d = evaluate_intrabar(&policy, &view(2.0, 100.0, 108.0), &trail, &bar).unwrap();
        assert_eq!(d.reason, ExitReason::TakeProfit);
        assert!((d.price.unwrap() - 110.0).abs() < 1e-9);

        let bar = Candle::new(now, 101.0, 104.0, 99.0, 102.0, 1.0);
        assert!(evaluate_intrabar(&policy, &view(2.0, 100.0, 102.0), &trail, &bar).is_none());
    }

    #[test]
    fn test_sltp_places_then_goes_quiet() {
        let policy = SltpPolicy::percent(2.0, 2.0, 1.0, 1.0);
        let v = view(1.5, 200.0, 201.0);

        let actions = evaluate_sltp(&policy, &v, None, None, 2, false);
        assert_eq!(actions.len(), 2);
        let mut registry = OrderRegistry::new();
        for action in &actions {
            let SltpAction::Place(req) = action else {
                panic!("expected placement");
            };
            assert!(req.reduce_only);
            assert_eq!(req.side, Side::Sell);
            assert_eq!(req.qty, 1.5);
            let kind = match (req.limit, req.stop) {
                (Some(price), None) => {
                    assert_eq!(price, 204.0);
                    OrderKind::Limit { price }
                }
                (None, Some(stop)) => {
                    assert_eq!(stop, 198.0);
                    OrderKind::StopMarket {
                        stop,
                        direction: crate::orders::TriggerDirection::Fall,
                    }
                }
                other => panic!("unexpected prices {:?}", other),
            };
            registry.insert(
                WorkingOrder {
                    client_id: format!("{}_000001", req.id),
                    side: req.side,
                    qty: req.qty,
                    kind,
                    reduce_only: true,
                    trigger_by: TriggerBy::LastPrice,
                    created_at: Utc::now(),
                },
                OrderHandler::Direct(None),
            );
        }

        let tp = registry.find_by_prefix(TAKE_PROFIT_ID).first().copied();
        let sl = registry.find_by_prefix(STOP_LOSS_ID).first().copied();
        assert!(evaluate_sltp(&policy, &v, tp, sl, 2, false).is_empty());

        // Position grew: cancel and re-place both
        let bigger = view(2.0, 200.0, 201.0);
        let actions = evaluate_sltp(&policy, &bigger, tp, sl, 2, false);
        assert_eq!(actions.len(), 4);
        assert!(matches!(&actions[0], SltpAction::Cancel(id) if id == "TP_000001"));
        assert_eq!(tp.unwrap().status, OrderStatus::Created);
    }

    #[test]
    fn test_sltp_defers_take_profit_only() {
        let policy = SltpPolicy::percent(2.0, 2.0, 1.0, 1.0).eval_tp_next_candle(true);
        let actions = evaluate_sltp(&policy, &view(-1.0, 100.0, 100.0), None, None, 2, true);
        assert_eq!(actions.len(), 1);
        let SltpAction::Place(req) = &actions[0] else {
            panic!("expected placement");
        };
        assert_eq!(req.id, STOP_LOSS_ID);
        assert_eq!(req.side, Side::Buy);
        assert_eq!(req.stop, Some(101.0));
    }
}
