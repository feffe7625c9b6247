use crate::market::{BookChange, OrderBookL1};
use crate::models::{OrderStatus, OrderUpdate, Side, TriggerBy};
use crate::orders::callback::OrderCallback;
use crate::orders::request::OrderRequest;
use crate::precision::round_to;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChaserPhase {
    /// First leg sent, waiting for the venue
    Idle,
    /// Resting at the limit until the market reaches it
    Tracking,
    /// Re-pegging to the best price on every move
    Chasing,
    /// Cancel requested by the engine; the next terminal leg ends the chase
    Stopping,
    Done,
}

/// Execution-quality record emitted when a chase ends
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChaserStats {
    pub id: String,
    pub side: Side,
    pub qty: f64,
    pub filled_qty: f64,
    pub start_price: f64,
    pub avg_price: f64,
    /// Fraction of the start price paid over it (positive is worse)
    pub slippage: f64,
    pub legs: usize,
}

#[derive(Debug, Clone)]
pub enum ChaserAction {
    Place(OrderRequest),
    Cancel(String),
    Finished { update: OrderUpdate, stats: ChaserStats },
}

/// Maker order re-pegged to the best bid/ask until the full quantity fills
#[derive(Debug, Clone)]
pub struct LimitChaser {
    id: String,
    side: Side,
    qty: f64,
    limit: Option<f64>,
    stop: Option<f64>,
    post_only: bool,
    reduce_only: bool,
    trigger_by: TriggerBy,
    retry_maker: u32,
    asset_decimals: u32,
    quote_decimals: u32,
    phase: ChaserPhase,
    count: u32,
    requotes: u32,
    filled: BTreeMap<String, (f64, f64)>,
    start_price: f64,
    current_order: Option<String>,
    subscribed: bool,
    callback: Option<OrderCallback>,
    created_at: DateTime<Utc>,
}

impl LimitChaser {
    pub fn new(
        request: &OrderRequest,
        qty: f64,
        asset_decimals: u32,
        quote_decimals: u32,
        now: DateTime<Utc>,
    ) -> Self {
        let limit = match (request.limit, request.stop) {
            (None, Some(stop)) => Some(stop),
            (limit, _) => limit,
        };
        Self {
            id: request.id.clone(),
            side: request.side,
            qty: qty.abs(),
            limit,
            stop: request.stop,
            post_only: request.post_only,
            reduce_only: request.reduce_only,
            trigger_by: request.trigger_by,
            retry_maker: request.retry_maker,
            asset_decimals,
            quote_decimals,
            phase: ChaserPhase::Idle,
            count: 0,
            requotes: 0,
            filled: BTreeMap::new(),
            start_price: limit.unwrap_or(0.0),
            current_order: None,
            subscribed: false,
            callback: request.callback.clone(),
            created_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn phase(&self) -> ChaserPhase {
        self.phase
    }

    pub fn callback(&self) -> Option<&OrderCallback> {
        self.callback.as_ref()
    }

    pub fn current_order(&self) -> Option<&str> {
        self.current_order.as_deref()
    }

    pub fn is_done(&self) -> bool {
        self.phase == ChaserPhase::Done
    }

    fn is_long(&self) -> bool {
        self.side.is_long()
    }

    pub fn filled_qty(&self) -> f64 {
        round_to(self.filled.values().map(|(q, _)| q).sum(), self.asset_decimals)
    }

    pub fn remaining_qty(&self) -> f64 {
        round_to(self.qty - self.filled_qty(), self.asset_decimals)
    }

    /// Quantity-weighted mean over every leg's fills
    pub fn avg_price(&self) -> f64 {
        let (qty, value) = self
            .filled
            .values()
            .filter(|(q, _)| *q > 0.0)
            .fold((0.0, 0.0), |(q, v), (fq, fp)| (q + fq, v + fq * fp));
        if qty > 0.0 {
            round_to(value / qty, self.quote_decimals)
        } else {
            0.0
        }
    }

    pub fn stats(&self) -> ChaserStats {
        let avg = self.avg_price();
        let slippage = if self.start_price > 0.0 && avg > 0.0 {
            let diff = if self.is_long() {
                avg - self.start_price
            } else {
                self.start_price - avg
            };
            diff / self.start_price
        } else {
            0.0
        };
        ChaserStats {
            id: self.id.clone(),
            side: self.side,
            qty: self.qty,
            filled_qty: self.filled_qty(),
            start_price: self.start_price,
            avg_price: avg,
            slippage,
            legs: self.filled.len(),
        }
    }

    /// Opening leg: at the limit (stop-limit when a stop is set) or at the passive price
    pub fn start(&mut self, book: &OrderBookL1) -> OrderRequest {
        let price = self.limit.unwrap_or_else(|| book.passive_price(self.is_long()));
        let mut leg = self.leg(self.qty, price);
        leg.stop = self.stop;
        leg.post_only = self.post_only && self.stop.is_none();
        leg
    }

    fn leg(&self, qty: f64, price: f64) -> OrderRequest {
        OrderRequest::new(format!("{}_{}", self.id, self.count), self.side, qty)
            .with_limit(round_to(price, self.quote_decimals))
            .post_only(self.post_only)
            .reduce_only(self.reduce_only)
            .with_trigger_by(self.trigger_by)
    }

    /// Engine reports the final client id of the leg it just submitted
    pub fn leg_placed(&mut self, client_id: &str) {
        self.current_order = Some(client_id.to_string());
    }

    fn begin_chase(&mut self, book: &OrderBookL1) {
        self.phase = ChaserPhase::Chasing;
        self.subscribed = true;
        self.start_price = book.passive_price(self.is_long());
        tracing::info!("Chaser active: {} @ {}", self.id, self.start_price);
    }

    fn requote(&mut self, book: &OrderBookL1, now: DateTime<Utc>) -> Vec<ChaserAction> {
        self.current_order = None;
        let remaining = self.remaining_qty();
        if remaining <= 0.0 {
            return vec![self.finish(OrderStatus::Filled, now)];
        }
        if self.requotes >= self.retry_maker {
            tracing::warn!(
                "Chaser {} gave up after {} re-quotes with {} unfilled",
                self.id,
                self.requotes,
                remaining
            );
            return vec![self.finish(OrderStatus::Canceled, now)];
        }
        let price = book.passive_price(self.is_long());
        if price <= 0.0 {
            tracing::warn!("Chaser {} has no book to re-quote against", self.id);
            return vec![self.finish(OrderStatus::Canceled, now)];
        }

        self.requotes += 1;
        self.count += 1;
        vec![ChaserAction::Place(self.leg(remaining, price))]
    }

    fn finish(&mut self, status: OrderStatus, now: DateTime<Utc>) -> ChaserAction {
        self.phase = ChaserPhase::Done;
        self.subscribed = false;
        self.current_order = None;
        let stats = self.stats();
        tracing::info!(
            "Chaser {} {}: start={} avg={} slippage={:.2}% legs={}",
            self.id,
            status,
            stats.start_price,
            stats.avg_price,
            stats.slippage * 100.0,
            stats.legs
        );
        let update = OrderUpdate {
            client_id: self.id.clone(),
            side: self.side,
            status,
            qty: self.qty,
            filled_qty: stats.filled_qty,
            avg_fill_price: stats.avg_price,
            limit_price: self.limit,
            stop_price: self.stop,
            reduce_only: self.reduce_only,
            post_only: self.post_only,
            reject_reason: None,
            created_at: self.created_at,
            updated_at: now,
        };
        ChaserAction::Finished { update, stats }
    }

    /// Feed an update for one of this chaser's legs
    pub fn on_order_update(
        &mut self,
        update: &OrderUpdate,
        book: &OrderBookL1,
        now: DateTime<Utc>,
    ) -> Vec<ChaserAction> {
        if self.is_done() {
            return Vec::new();
        }

        let fill_price = if update.avg_fill_price > 0.0 {
            update.avg_fill_price
        } else {
            update.limit_price.unwrap_or(0.0)
        };
        if update.filled_qty > 0.0 {
            self.filled
                .insert(update.client_id.clone(), (update.filled_qty, fill_price));
        }

        match update.status {
            OrderStatus::New => {
                tracing::debug!("Chaser leg accepted: {}", update.client_id);
                match self.phase {
                    ChaserPhase::Idle if self.stop.is_none() => {
                        if self.limit.is_none() {
                            self.begin_chase(book);
                        } else {
                            tracing::info!("Chaser limit tracker active: {}", self.id);
                            self.phase = ChaserPhase::Tracking;
                        }
                    }
                    ChaserPhase::Chasing => self.subscribed = true,
                    _ => {}
                }
                Vec::new()
            }
            OrderStatus::Triggered if self.stop.is_some() => {
                tracing::info!("Chaser leg {} triggered at {:?}", update.client_id, self.stop);
                if self.limit == self.stop {
                    self.begin_chase(book);
                } else {
                    self.phase = ChaserPhase::Tracking;
                }
                Vec::new()
            }
            OrderStatus::Filled => {
                if self.remaining_qty() > 0.0 && self.phase != ChaserPhase::Stopping {
                    self.requote(book, now)
                } else {
                    vec![self.finish(OrderStatus::Filled, now)]
                }
            }
            OrderStatus::Canceled => {
                tracing::info!("Chaser leg cancelled: {} @ {:?}", update.client_id, update.limit_price);
                if self.phase == ChaserPhase::Chasing {
                    self.requote(book, now)
                } else {
                    vec![self.finish(OrderStatus::Canceled, now)]
                }
            }
            OrderStatus::Rejected => {
                if update.post_only && self.phase != ChaserPhase::Stopping {
                    tracing::info!(
                        "Chaser leg {} rejected as post-only; re-quoting at best price",
                        update.client_id
                    );
                    self.limit = None;
                    if self.phase != ChaserPhase::Chasing {
                        self.begin_chase(book);
                    }
                    self.requote(book, now)
                } else {
                    tracing::warn!("Chaser leg rejected: {}", update.client_id);
                    vec![self.finish(OrderStatus::Rejected, now)]
                }
            }
            _ => Vec::new(),
        }
    }

    /// Best bid/ask moved
    pub fn on_book_change(&mut self, change: BookChange, book: &OrderBookL1) -> Vec<ChaserAction> {
        match self.phase {
            ChaserPhase::Tracking => {
                let reached = match self.limit {
                    Some(limit) if self.is_long() => book.best_bid() > 0.0 && book.best_bid() <= limit,
                    Some(limit) => book.best_ask() >= limit,
                    None => true,
                };
                if reached {
                    self.begin_chase(book);
                }
                Vec::new()
            }
            ChaserPhase::Chasing if self.subscribed && change.touches(self.is_long()) => {
                match self.current_order.take() {
                    Some(leg) => {
                        tracing::info!(
                            "Chaser {} price changed to {}; cancelling {}",
                            self.id,
                            book.passive_price(self.is_long()),
                            leg
                        );
                        self.subscribed = false;
                        vec![ChaserAction::Cancel(leg)]
                    }
                    None => Vec::new(),
                }
            }
            _ => Vec::new(),
        }
    }

    /// Engine-initiated stop. Finishes at once when no leg is live.
    pub fn cancel(&mut self, now: DateTime<Utc>) -> Vec<ChaserAction> {
        if self.is_done() {
            return Vec::new();
        }
        self.phase = ChaserPhase::Stopping;
        self.subscribed = false;
        match self.current_order.take() {
            Some(leg) => vec![ChaserAction::Cancel(leg)],
            None => vec![self.finish(OrderStatus::Canceled, now)],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::BookTicker;

    fn book(bid: f64, ask: f64) -> OrderBookL1 {
        let mut b = OrderBookL1::default();
        b.update(BookTicker {
            best_bid: bid,
            best_ask: ask,
        });
        b
    }

    fn leg_update(leg: &OrderRequest, client_id: &str, status: OrderStatus, filled: f64, price: f64) -> OrderUpdate {
        let now = Utc::now();
        OrderUpdate {
            client_id: client_id.to_string(),
            side: leg.side,
            status,
            qty: leg.qty,
            filled_qty: filled,
            avg_fill_price: price,
            limit_price: leg.limit,
            stop_price: leg.stop,
            reduce_only: leg.reduce_only,
            post_only: leg.post_only,
            reject_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn place(actions: &[ChaserAction]) -> OrderRequest {
        match actions.first() {
            Some(ChaserAction::Place(req)) => req.clone(),
            other => panic!("expected placement, got {:?}", other),
        }
    }

    #[test]
    fn test_unfilled_legs_not_counted() {
        let now = Utc::now();
        let req = OrderRequest::long("Long", 3.0).post_only(true).with_chaser(true, 10);
        let mut chaser = LimitChaser::new(&req, 3.0, 3, 2, now);
        let mut b = book(100.0, 100.5);

        let leg0 = chaser.start(&b);
        chaser.leg_placed("Long_0a");
        chaser.on_order_update(&leg_update(&leg0, "Long_0a", OrderStatus::New, 0.0, 0.0), &b, now);
        assert_eq!(chaser.stats().legs, 0);

        let change = b.update(BookTicker {
            best_bid: 101.0,
            best_ask: 101.5,
        });
        chaser.on_book_change(change, &b);
        let actions = chaser.on_order_update(
            &leg_update(&leg0, "Long_0a", OrderStatus::Canceled, 0.0, 0.0),
            &b,
            now,
        );
        let leg1 = place(&actions);
        assert_eq!(leg1.qty, 3.0);
        chaser.leg_placed("Long_1b");

        chaser.on_order_update(
            &leg_update(&leg1, "Long_1b", OrderStatus::Filled, 3.0, 101.0),
            &b,
            now,
        );
        let stats = chaser.stats();
        assert_eq!(stats.legs, 1);
        assert_eq!(stats.filled_qty, 3.0);
        assert_eq!(stats.avg_price, 101.0);
    }

    #[test]
    fn test_chase_converges_on_partial_fills() {
        let now = Utc::now();
        let req = OrderRequest::long("Long", 3.0).post_only(true).with_chaser(true, 10);
        let mut chaser = LimitChaser::new(&req, 3.0, 3, 2, now);
        let mut b = book(100.0, 100.5);

        let leg0 = chaser.start(&b);
        assert_eq!(leg0.id, "Long_0");
        assert_eq!(leg0.limit, Some(100.0));
        assert!(leg0.post_only);
        chaser.leg_placed("Long_0a");
        chaser.on_order_update(&leg_update(&leg0, "Long_0a", OrderStatus::New, 0.0, 0.0), &b, now);
        assert_eq!(chaser.phase(), ChaserPhase::Chasing);
        assert_eq!(chaser.stats().start_price, 100.0);

        // Bid moves up; the live leg is cancelled after a partial fill
        let change = b.update(BookTicker {
            best_bid: 101.0,
            best_ask: 101.5,
        });
        let actions = chaser.on_book_change(change, &b);
        assert!(matches!(&actions[0], ChaserAction::Cancel(id) if id == "Long_0a"));

        let actions = chaser.on_order_update(
            &leg_update(&leg0, "Long_0a", OrderStatus::Canceled, 1.0, 100.0),
            &b,
            now,
        );
        let leg1 = place(&actions);
        assert_eq!(leg1.id, "Long_1");
        assert_eq!(leg1.qty, 2.0);
        assert_eq!(leg1.limit, Some(101.0));
        chaser.leg_placed("Long_1b");

        let done = chaser.on_order_update(
            &leg_update(&leg1, "Long_1b", OrderStatus::Filled, 2.0, 101.0),
            &b,
            now,
        );
        match &done[0] {
            ChaserAction::Finished { update, stats } => {
                assert_eq!(update.status, OrderStatus::Filled);
                assert_eq!(update.client_id, "Long");
                assert_eq!(stats.filled_qty, 3.0);
                assert_eq!(stats.avg_price, 100.67);
                assert_eq!(stats.legs, 2);
                assert!((stats.slippage - 0.0067).abs() < 1e-9);
            }
            other => panic!("expected finish, got {:?}", other),
        }
        assert!(chaser.is_done());
    }

    #[test]
    fn test_limit_tracker_waits_for_price() {
        let now = Utc::now();
        let req = OrderRequest::short("Short", 1.0).with_limit(105.0).with_chaser(true, 10);
        let mut chaser = LimitChaser::new(&req, 1.0, 3, 2, now);
        let mut b = book(100.0, 100.5);

        let leg0 = chaser.start(&b);
        assert_eq!(leg0.limit, Some(105.0));
        chaser.leg_placed("Short_0");
        chaser.on_order_update(&leg_update(&leg0, "Short_0", OrderStatus::New, 0.0, 0.0), &b, now);
        assert_eq!(chaser.phase(), ChaserPhase::Tracking);

        let change = b.update(BookTicker {
            best_bid: 103.0,
            best_ask: 104.0,
        });
        assert!(chaser.on_book_change(change, &b).is_empty());
        assert_eq!(chaser.phase(), ChaserPhase::Tracking);

        let change = b.update(BookTicker {
            best_bid: 104.5,
            best_ask: 105.0,
        });
        chaser.on_book_change(change, &b);
        assert_eq!(chaser.phase(), ChaserPhase::Chasing);
        assert_eq!(chaser.stats().start_price, 105.0);
    }

    #[test]
    fn test_cancel_before_start_finishes() {
        let now = Utc::now();
        let req = OrderRequest::long("Long", 1.0).with_limit(90.0).with_chaser(true, 10);
        let mut chaser = LimitChaser::new(&req, 1.0, 3, 2, now);
        let b = book(100.0, 100.5);
        let leg0 = chaser.start(&b);
        chaser.leg_placed("Long_0");

        let actions = chaser.on_order_update(
            &leg_update(&leg0, "Long_0", OrderStatus::Canceled, 0.0, 0.0),
            &b,
            now,
        );
        assert!(matches!(
            &actions[0],
            ChaserAction::Finished { update, .. } if update.status == OrderStatus::Canceled
        ));
    }

    #[test]
    fn test_post_only_rejection_requotes_until_bound() {
        let now = Utc::now();
        let req = OrderRequest::long("Long", 1.0).post_only(true).with_chaser(true, 2);
        let mut chaser = LimitChaser::new(&req, 1.0, 3, 2, now);
        let b = book(100.0, 100.5);
        let mut leg = chaser.start(&b);

        for n in 1..=2 {
            let actions = chaser.on_order_update(
                &leg_update(&leg, &leg.id.clone(), OrderStatus::Rejected, 0.0, 0.0),
                &b,
                now,
            );
            leg = place(&actions);
            assert_eq!(leg.id, format!("Long_{}", n));
        }

        let actions = chaser.on_order_update(
            &leg_update(&leg, &leg.id.clone(), OrderStatus::Rejected, 0.0, 0.0),
            &b,
            now,
        );
        assert!(matches!(&actions[0], ChaserAction::Finished { .. }));
    }

    #[test]
    fn test_stop_chaser_starts_on_trigger() {
        let now = Utc::now();
        let req = OrderRequest::long("Long", 1.0).with_stop(110.0).with_chaser(true, 10);
        let mut chaser = LimitChaser::new(&req, 1.0, 3, 2, now);
        let b = book(111.0, 111.5);

        let leg0 = chaser.start(&b);
        assert_eq!(leg0.limit, Some(110.0));
        assert_eq!(leg0.stop, Some(110.0));
        assert!(!leg0.post_only);

        chaser.on_order_update(&leg_update(&leg0, "Long_0", OrderStatus::Untriggered, 0.0, 0.0), &b, now);
        assert_eq!(chaser.phase(), ChaserPhase::Idle);
        chaser.on_order_update(&leg_update(&leg0, "Long_0", OrderStatus::Triggered, 0.0, 0.0), &b, now);
        assert_eq!(chaser.phase(), ChaserPhase::Chasing);
    }

    #[test]
    fn test_engine_cancel() {
        let now = Utc::now();
        let req = OrderRequest::long("Long", 1.0).with_chaser(true, 10);
        let mut chaser = LimitChaser::new(&req, 1.0, 3, 2, now);
        let b = book(100.0, 100.5);
        let leg0 = chaser.start(&b);
        chaser.leg_placed("Long_0");
        chaser.on_order_update(&leg_update(&leg0, "Long_0", OrderStatus::New, 0.0, 0.0), &b, now);

        let actions = chaser.cancel(now);
        assert!(matches!(&actions[0], ChaserAction::Cancel(id) if id == "Long_0"));
        let actions = chaser.on_order_update(
            &leg_update(&leg0, "Long_0", OrderStatus::Canceled, 0.0, 0.0),
            &b,
            now,
        );
        assert!(matches!(&actions[0], ChaserAction::Finished { .. }));
    }
}
