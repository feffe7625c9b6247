use crate::backend::{BackendKind, ExecutionBackend, MarketContext, SimulatedBackend};
use crate::config::{EngineConfig, OrderIdMode};
use crate::engine::hooks::{Hook, HookPipeline};
use crate::error::EngineError;
use crate::exit::{
    evaluate_exit, evaluate_intrabar, evaluate_sltp, EntryHistory, ExitExecution, ExitPolicy,
    PositionView, SltpAction, SltpPolicy, TrailState, STOP_LOSS_ID, TAKE_PROFIT_ID,
};
use crate::ledger::{ClosedTrade, LedgerStats, OrderLog, PositionLedger, SimulatedLedger};
use crate::market::{BookChange, OrderBookL1};
use crate::models::{BookTicker, Candle, Fill, OrderStatus, OrderUpdate, PositionSnapshot, Side};
use crate::orders::{
    entry_qty, pyramiding_qty, Amendment, ChaserAction, ChaserStats, IcebergAction, IcebergOrder,
    LimitChaser, OrderCallback, OrderHandler, OrderKind, OrderRegistry, OrderRequest,
    TrackedOrder, WorkingOrder,
};
use crate::precision::{floor_to, round_to};
use crate::Result;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

/// Order id used by the close-all family
pub const CLOSE_ID: &str = "Close";

/// Named series recorded by the strategy, in bar order
pub type PlotSeries = Vec<(DateTime<Utc>, f64)>;

/// The strategy-facing trading API on top of a ledger and an execution backend.
///
/// Every public call settles the updates it causes before returning, so a strategy
/// reading the position right after an order sees the result of that order.
pub struct TradingEngine {
    config: EngineConfig,
    ledger: Box<dyn PositionLedger>,
    backend: Box<dyn ExecutionBackend>,
    hooks: HookPipeline,
    registry: OrderRegistry,
    icebergs: BTreeMap<String, IcebergOrder>,
    chasers: BTreeMap<String, LimitChaser>,
    book: OrderBookL1,
    market_price: f64,
    now: DateTime<Utc>,
    current_bar: Option<Candle>,
    bar_open_position: f64,
    exit_policy: ExitPolicy,
    sltp_policy: SltpPolicy,
    trail: TrailState,
    entries: EntryHistory,
    entered: bool,
    last_position: f64,
    exits_due: bool,
    order_seq: u64,
    execution_seq: u64,
    plots: BTreeMap<String, PlotSeries>,
    chaser_stats: Vec<ChaserStats>,
}

impl TradingEngine {
    pub fn new(
        config: EngineConfig,
        ledger: Box<dyn PositionLedger>,
        backend: Box<dyn ExecutionBackend>,
    ) -> Result<Self> {
        config.validate()?;
        let hooks = HookPipeline::for_backend(backend.kind(), config.exit_fill);
        let last_position = ledger.position_size();
        tracing::info!(
            "Trading engine ready: {} {:?} backend, balance {:.2}, position {}",
            config.symbol,
            backend.kind(),
            ledger.balance(),
            last_position
        );

        Ok(Self {
            config,
            ledger,
            backend,
            hooks,
            registry: OrderRegistry::new(),
            icebergs: BTreeMap::new(),
            chasers: BTreeMap::new(),
            book: OrderBookL1::default(),
            market_price: 0.0,
            now: DateTime::<Utc>::MIN_UTC,
            current_bar: None,
            bar_open_position: last_position,
            exit_policy: ExitPolicy::default(),
            sltp_policy: SltpPolicy::default(),
            trail: TrailState::default(),
            entries: EntryHistory::default(),
            entered: false,
            last_position,
            exits_due: false,
            order_seq: 0,
            execution_seq: 0,
            plots: BTreeMap::new(),
            chaser_stats: Vec::new(),
        })
    }

    /// Backtest engine: simulated ledger and OHLC-matched backend
    pub fn simulated(config: EngineConfig) -> Result<Self> {
        let order_log = match &config.ledger.order_log_path {
            Some(path) => OrderLog::to_file(path)?,
            None => OrderLog::in_memory(),
        };
        let ledger = SimulatedLedger::with_order_log(config.ledger.clone(), order_log);
        Self::new(config, Box::new(ledger), Box::new(SimulatedBackend::new()))
    }

    // ---- strategy API ----

    /// Place an order. Routed to an iceberg when `split > 1`, to a limit chaser when
    /// `chaser` is set, otherwise straight to the backend.
    pub fn order(&mut self, request: OrderRequest) -> Result<()> {
        if !request.when {
            return Ok(());
        }
        let decimals = request.round_decimals.unwrap_or(self.config.asset_decimals);
        let qty = round_to(request.qty.abs(), decimals);
        if qty <= 0.0 {
            tracing::warn!("Order {} skipped: quantity {} rounds to zero", request.id, request.qty);
            return Ok(());
        }

        if request.split > 1 {
            self.start_iceberg(request, qty)?;
        } else if request.chaser {
            self.start_chaser(request, qty)?;
        } else {
            let handler = OrderHandler::Direct(request.callback.clone());
            self.transmit(&OrderRequest { qty, ..request }, handler)?;
        }
        self.flush()
    }

    /// Enter in the request's direction unless already positioned that way.
    /// An opposite position is reversed in one order.
    pub fn entry(&mut self, request: OrderRequest) -> Result<()> {
        if !request.when {
            return Ok(());
        }
        let decimals = request.round_decimals.unwrap_or(self.config.asset_decimals);
        let position = self.ledger.position_size();
        let Some(qty) = entry_qty(request.side.is_long(), request.qty, position, decimals) else {
            tracing::debug!("Entry {} skipped: already {} {}", request.id, request.side, position);
            return Ok(());
        };
        self.entered = true;
        self.order(OrderRequest { qty, ..request })
    }

    /// Add to the position in steps of `request.qty`, up to `pyramiding` steps
    pub fn entry_pyramiding(
        &mut self,
        request: OrderRequest,
        pyramiding: u32,
        cancel_orders: bool,
    ) -> Result<()> {
        if !request.when {
            return Ok(());
        }
        let decimals = request.round_decimals.unwrap_or(self.config.asset_decimals);
        let position = self.ledger.position_size();
        let Some(qty) = pyramiding_qty(
            request.side.is_long(),
            request.qty,
            position,
            pyramiding,
            decimals,
        ) else {
            tracing::debug!(
                "Pyramiding {} skipped: position {} at cap {} x {}",
                request.id,
                position,
                pyramiding,
                request.qty
            );
            return Ok(());
        };
        if cancel_orders {
            self.cancel_all()?;
        }
        self.entered = true;
        self.order(OrderRequest { qty, ..request })
    }

    /// Flatten the position with a market order
    pub fn close_all(&mut self) -> Result<()> {
        self.close_all_with(None, &ExitExecution::default())
    }

    /// Flatten the position using the given execution style
    pub fn close_all_with(
        &mut self,
        callback: Option<OrderCallback>,
        execution: &ExitExecution,
    ) -> Result<()> {
        let position = self.ledger.position_size();
        if position == 0.0 {
            return Ok(());
        }
        let request = OrderRequest::new(CLOSE_ID, Side::from_long(position < 0.0), position.abs())
            .post_only(execution.chaser);
        let mut request = execution.apply(request);
        request.callback = callback;
        tracing::info!("Close all: {} {}", request.side, request.qty);
        self.order(request)
    }

    /// Flatten at an exact price. Simulation fills immediately at that price; live
    /// trading rests a reduce-only limit there.
    pub fn close_all_at_price(&mut self, price: f64, callback: Option<OrderCallback>) -> Result<()> {
        let position = self.ledger.position_size();
        if position == 0.0 {
            return Ok(());
        }
        let side = Side::from_long(position < 0.0);

        match self.backend.kind() {
            BackendKind::Simulated => {
                let order = WorkingOrder {
                    client_id: format!("{}_{}", CLOSE_ID, self.next_suffix()),
                    side,
                    qty: position.abs(),
                    kind: OrderKind::Limit { price },
                    reduce_only: true,
                    trigger_by: Default::default(),
                    created_at: self.now,
                };
                tracing::info!("Close all at {}: {} {}", price, side, order.qty);
                self.registry.insert(order.clone(), OrderHandler::Direct(callback));
                self.apply_update(order.update(OrderStatus::New, 0.0, 0.0, self.now))?;
                self.apply_update(order.update(OrderStatus::Filled, order.qty, price, self.now))?;
                self.flush()
            }
            BackendKind::Live => {
                let mut request = OrderRequest::new(CLOSE_ID, side, position.abs())
                    .with_limit(price)
                    .reduce_only(true);
                request.callback = callback;
                self.order(request)
            }
        }
    }

    /// Cancel every open order, chase and split order whose id starts with `id`
    pub fn cancel(&mut self, id: &str) -> Result<()> {
        let chasers: Vec<String> = self
            .chasers
            .iter()
            .filter(|(_, c)| c.id().starts_with(id))
            .map(|(key, _)| key.clone())
            .collect();
        let icebergs: Vec<String> = self
            .icebergs
            .iter()
            .filter(|(_, i)| i.id().starts_with(id))
            .map(|(key, _)| key.clone())
            .collect();
        let orders: Vec<String> = self
            .registry
            .find_by_prefix(id)
            .iter()
            .map(|t| t.order.client_id.clone())
            .collect();

        if chasers.is_empty() && icebergs.is_empty() && orders.is_empty() {
            tracing::info!("Couldn't find an order of which id string starts with: {}", id);
            return Ok(());
        }

        for key in chasers {
            self.stop_chaser(&key)?;
        }
        for key in icebergs {
            self.stop_iceberg(&key);
        }
        for client_id in orders {
            self.cancel_order_id(&client_id)?;
        }
        self.flush()
    }

    /// Cancel everything, including running chases and split orders
    pub fn cancel_all(&mut self) -> Result<()> {
        let chasers: Vec<String> = self.chasers.keys().cloned().collect();
        for key in chasers {
            self.stop_chaser(&key)?;
        }
        let icebergs: Vec<String> = self.icebergs.keys().cloned().collect();
        for key in icebergs {
            self.stop_iceberg(&key);
        }
        self.backend.cancel_all()?;
        self.flush()
    }

    /// Amend the oldest open order whose id starts with `id`
    pub fn amend_order(&mut self, id: &str, amendment: Amendment) -> Result<()> {
        if amendment.is_empty() {
            return Ok(());
        }
        let Some(client_id) = self
            .registry
            .find_by_prefix(id)
            .first()
            .map(|t| t.order.client_id.clone())
        else {
            tracing::warn!("Amend skipped: no open order starts with {}", id);
            return Ok(());
        };

        self.registry.amend(&client_id, &amendment);
        match self.backend.amend(&client_id, &amendment) {
            Err(EngineError::Exchange(e)) if e.is_benign() => {
                tracing::info!("Amend {}: {}", client_id, e);
            }
            other => other?,
        }
        self.flush()
    }

    /// Replace the threshold exit policy
    pub fn exit(&mut self, policy: ExitPolicy) {
        tracing::debug!(
            "Exit policy: profit={} loss={} trail_offset={}",
            policy.profit,
            policy.loss,
            policy.trail_offset
        );
        self.exit_policy = policy;
    }

    /// Replace the percentage take-profit / stop-loss policy
    pub fn sltp(&mut self, policy: SltpPolicy) {
        tracing::debug!(
            "SLTP policy: tp={}/{} sl={}/{}",
            policy.profit_long,
            policy.profit_short,
            policy.stop_long,
            policy.stop_short
        );
        self.sltp_policy = policy;
    }

    /// Largest order the free margin supports at the current price
    pub fn get_lot(&self, round_decimals: Option<u32>) -> f64 {
        let decimals = round_decimals.unwrap_or(self.config.asset_decimals);
        let capital = (1.0 - self.config.margin_retain_rate)
            * self.ledger.balance()
            * self.ledger.leverage();
        let lot = if self.ledger.qty_in_quote() {
            capital
        } else if self.market_price > 0.0 {
            capital / self.market_price
        } else {
            0.0
        };
        floor_to(lot, decimals)
    }

    pub fn get_balance(&self) -> f64 {
        self.ledger.balance()
    }

    pub fn get_position_size(&self) -> f64 {
        self.ledger.position_size()
    }

    pub fn get_position_avg_price(&self) -> f64 {
        self.ledger.avg_entry_price()
    }

    pub fn get_market_price(&self) -> f64 {
        self.market_price
    }

    /// Unrealized profit at the market price, net of the closing commission
    pub fn get_profit(&self) -> f64 {
        round_to(
            self.ledger.unrealized_pnl(self.market_price),
            self.config.quote_decimals,
        )
    }

    /// Record a value for the current bar under `name`
    pub fn plot(&mut self, name: &str, value: f64) {
        self.plots
            .entry(name.to_string())
            .or_default()
            .push((self.now, value));
    }

    pub fn open_orders(&self, prefix: &str) -> Vec<&TrackedOrder> {
        self.registry.find_by_prefix(prefix)
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.now
    }

    pub fn book(&self) -> &OrderBookL1 {
        &self.book
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn stats(&self) -> &LedgerStats {
        self.ledger.stats()
    }

    pub fn closed_trades(&self) -> &[ClosedTrade] {
        self.ledger.closed_trades()
    }

    pub fn plots(&self) -> &BTreeMap<String, PlotSeries> {
        &self.plots
    }

    pub fn chaser_stats(&self) -> &[ChaserStats] {
        &self.chaser_stats
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn active_chasers(&self) -> usize {
        self.chasers.len()
    }

    pub fn active_icebergs(&self) -> usize {
        self.icebergs.len()
    }

    // ---- bar lifecycle ----

    /// Run the pre-strategy hooks for a new base candle
    pub fn begin_bar(&mut self, bar: &Candle) -> Result<()> {
        self.current_bar = Some(bar.clone());
        let hooks = self.hooks.pre.clone();
        for hook in hooks {
            self.run_hook(hook, bar)?;
        }
        Ok(())
    }

    /// Run the post-strategy hooks for the bar opened by `begin_bar`
    pub fn end_bar(&mut self) -> Result<()> {
        let Some(bar) = self.current_bar.take() else {
            return Ok(());
        };
        let hooks = self.hooks.post.clone();
        for hook in hooks {
            self.run_hook(hook, &bar)?;
        }
        Ok(())
    }

    fn run_hook(&mut self, hook: Hook, bar: &Candle) -> Result<()> {
        match hook {
            Hook::MarketSnapshot => {
                self.now = bar.timestamp;
                self.market_price = bar.close;
                self.bar_open_position = self.ledger.position_size();
            }
            Hook::EvaluateRestingOrders => {
                let updates = self.backend.evaluate_bar(bar, self.ledger.position_size());
                for update in updates {
                    self.apply_update(update)?;
                }
                self.flush()?;
            }
            Hook::IntrabarExit => {
                // A position opened inside this bar has no known path through its range
                if self.ledger.position_size() != self.bar_open_position {
                    return Ok(());
                }
                let view = self.position_view();
                if let Some(decision) = evaluate_intrabar(&self.exit_policy, &view, &self.trail, bar) {
                    tracing::info!("Exit ({}) inside bar {}", decision.reason, bar.timestamp);
                    match decision.price {
                        Some(price) => self.close_all_at_price(price, decision.callback)?,
                        None => self.close_all_with(decision.callback, &decision.execution)?,
                    }
                }
            }
            Hook::TrailRatchet => {
                self.trail
                    .ratchet(self.ledger.position_size(), bar.low, bar.high);
            }
            Hook::SyncSimulatedBook => {
                self.on_book_ticker(BookTicker {
                    best_bid: bar.close,
                    best_ask: bar.close,
                })?;
            }
            Hook::RecordEntry => {
                self.entries.record(self.entered);
                self.entered = false;
            }
            Hook::ExitPolicy => self.evaluate_exit_policy()?,
            Hook::Sltp => self.evaluate_sltp_policy()?,
            Hook::IcebergTimers => self.release_iceberg_legs()?,
        }
        Ok(())
    }

    // ---- live events ----

    pub fn on_ticker(&mut self, price: f64) {
        if price > 0.0 {
            self.market_price = price;
        }
    }

    pub fn on_book_ticker(&mut self, ticker: BookTicker) -> Result<()> {
        let change = self.book.update(ticker);
        if change.any() {
            self.notify_chasers(change)?;
        }
        self.flush()
    }

    pub fn on_order_update(&mut self, update: OrderUpdate) -> Result<()> {
        self.apply_update(update)?;
        self.flush()?;
        self.after_fills()
    }

    /// Venue-reported position; the live ledger follows it
    pub fn on_position_snapshot(&mut self, snapshot: PositionSnapshot) -> Result<()> {
        if let Some(transition) = self.ledger.apply_position_snapshot(&snapshot) {
            tracing::info!(
                "Position changed: {} -> {} @ {}",
                transition.previous,
                transition.current,
                transition.avg_price
            );
            let price = if self.market_price > 0.0 {
                self.market_price
            } else {
                snapshot.avg_price
            };
            self.sync_position(price)?;
        }
        self.flush()?;
        self.after_fills()
    }

    pub fn on_wallet_update(&mut self, balance: f64) {
        self.ledger.apply_wallet_balance(balance);
    }

    /// Clock tick between candles; releases iceberg legs whose interval has passed
    pub fn on_timer(&mut self, now: DateTime<Utc>) -> Result<()> {
        if now > self.now {
            self.now = now;
        }
        self.release_iceberg_legs()
    }

    /// Cancel everything and log the session summary
    pub fn shutdown(&mut self) -> Result<()> {
        self.cancel_all()?;
        tracing::info!("Session closed: {}", self.ledger.stats().summary());
        Ok(())
    }

    // ---- internals ----

    fn next_suffix(&mut self) -> String {
        match self.config.order_ids {
            OrderIdMode::Random => {
                let hex = uuid::Uuid::new_v4().simple().to_string();
                hex[..15].to_string()
            }
            OrderIdMode::Sequential => {
                self.order_seq += 1;
                format!("{:08}", self.order_seq)
            }
        }
    }

    fn next_execution_key(&mut self, id: &str) -> String {
        self.execution_seq += 1;
        format!("{}#{}", id, self.execution_seq)
    }

    fn market_context(&self) -> MarketContext {
        MarketContext {
            time: self.now,
            price: self.market_price,
            position: self.ledger.position_size(),
            book: self.book,
        }
    }

    fn position_view(&self) -> PositionView {
        PositionView {
            size: self.ledger.position_size(),
            avg_price: self.ledger.avg_entry_price(),
            market_price: self.market_price,
            commission: self.ledger.commission_rate(),
            qty_in_quote: self.ledger.qty_in_quote(),
        }
    }

    /// Register and submit one order; returns its client id
    fn transmit(&mut self, request: &OrderRequest, handler: OrderHandler) -> Result<String> {
        let client_id = format!("{}_{}", request.id, self.next_suffix());
        let kind = OrderKind::select(
            request.limit,
            request.stop,
            request.post_only,
            request.side,
            self.market_price,
            &self.book,
        );
        let order = WorkingOrder {
            client_id: client_id.clone(),
            side: request.side,
            qty: request.qty,
            kind,
            reduce_only: request.reduce_only,
            trigger_by: request.trigger_by,
            created_at: self.now,
        };
        tracing::info!(
            "New order: {} {} {} {:?}{}",
            client_id,
            order.side,
            order.qty,
            order.kind,
            if order.reduce_only { " reduce-only" } else { "" }
        );

        self.registry.insert(order.clone(), handler);
        let market = self.market_context();
        if let Err(e) = self.backend.submit(order, &market) {
            tracing::error!("Submit {} failed: {}", client_id, e);
            self.registry.remove(&client_id);
            return Err(e);
        }
        Ok(client_id)
    }

    fn cancel_order_id(&mut self, client_id: &str) -> Result<()> {
        match self.backend.cancel(client_id) {
            Ok(()) => Ok(()),
            Err(EngineError::Exchange(e)) if e.is_benign() => {
                tracing::info!("Cancel {}: {}", client_id, e);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Apply updates produced by backend calls until none are left
    fn flush(&mut self) -> Result<()> {
        loop {
            let updates = self.backend.drain_updates();
            if updates.is_empty() {
                return Ok(());
            }
            for update in updates {
                self.apply_update(update)?;
            }
        }
    }

    fn apply_update(&mut self, update: OrderUpdate) -> Result<()> {
        let Some(dispatch) = self.registry.apply(&update) else {
            tracing::debug!(
                "Update for untracked order {} ({})",
                update.client_id,
                update.status
            );
            return Ok(());
        };
        let update = dispatch.update;
        if self.config.order_update_log {
            tracing::info!(
                "Order update: {} {} filled {}/{} @ {}",
                update.client_id,
                update.status,
                update.filled_qty,
                update.qty,
                update.avg_fill_price
            );
        }

        if dispatch.fill_qty > 0.0 {
            let fill = Fill {
                time: update.updated_at,
                order_id: update.client_id.clone(),
                side: update.side,
                qty: dispatch.fill_qty,
                price: dispatch.fill_price,
                reduce_only: update.reduce_only,
            };
            let outcome = self.ledger.commit(&fill);
            tracing::debug!("Fill committed: {:?}", outcome);
            self.sync_position(dispatch.fill_price)?;
        }

        match dispatch.handler {
            OrderHandler::Direct(callback) => {
                if let Some(callback) = callback {
                    callback.notify(&update);
                }
            }
            OrderHandler::IcebergLeg { parent } => {
                let now = self.now;
                if let Some(iceberg) = self.icebergs.get_mut(&parent) {
                    let actions = iceberg.on_leg_update(&update, now);
                    self.run_iceberg_actions(&parent, actions)?;
                }
            }
            OrderHandler::ChaserLeg { chaser } => {
                let (now, book) = (self.now, self.book);
                if let Some(state) = self.chasers.get_mut(&chaser) {
                    let actions = state.on_order_update(&update, &book, now);
                    self.run_chaser_actions(&chaser, actions)?;
                }
            }
        }
        Ok(())
    }

    /// React to a change in position size: restart the trail and, once flat,
    /// drop the resting take-profit and stop-loss
    fn sync_position(&mut self, reset_price: f64) -> Result<()> {
        let position = self.ledger.position_size();
        if position == self.last_position {
            return Ok(());
        }
        tracing::debug!("Position {} -> {}", self.last_position, position);
        self.last_position = position;
        self.trail.reset(reset_price);
        self.exits_due = true;

        if position == 0.0 {
            for prefix in [TAKE_PROFIT_ID, STOP_LOSS_ID] {
                let family = format!("{}_", prefix);
                let open: Vec<String> = self
                    .registry
                    .find_by_prefix(&family)
                    .iter()
                    .map(|t| t.order.client_id.clone())
                    .collect();
                for client_id in open {
                    self.cancel_order_id(&client_id)?;
                }
            }
        }
        Ok(())
    }

    /// Live exits are evaluated as soon as the position moves
    fn after_fills(&mut self) -> Result<()> {
        if !std::mem::take(&mut self.exits_due) || self.backend.kind() == BackendKind::Simulated {
            return Ok(());
        }
        self.evaluate_exit_policy()?;
        self.evaluate_sltp_policy()
    }

    /// A close (or TP) already working that a new decision must not duplicate
    fn execution_busy(&self, id: &str) -> bool {
        let family = format!("{}_", id);
        self.chasers.values().any(|c| c.id() == id)
            || self.icebergs.values().any(|i| i.id() == id)
            || !self.registry.find_by_prefix(&family).is_empty()
    }

    fn evaluate_exit_policy(&mut self) -> Result<()> {
        if !self.exit_policy.is_active() || self.execution_busy(CLOSE_ID) {
            return Ok(());
        }
        let view = self.position_view();
        if let Some(decision) = evaluate_exit(&self.exit_policy, &view, &self.trail) {
            tracing::info!("Exit ({}) at {}", decision.reason, self.market_price);
            self.close_all_with(decision.callback, &decision.execution)?;
        }
        Ok(())
    }

    fn evaluate_sltp_policy(&mut self) -> Result<()> {
        if !self.sltp_policy.is_active() {
            return Ok(());
        }
        let view = self.position_view();
        let defer = self.sltp_policy.eval_tp_next_candle && self.entries.entered_previous_candle();
        let tp_family = format!("{}_", TAKE_PROFIT_ID);
        let sl_family = format!("{}_", STOP_LOSS_ID);
        let tp_split = self.chasers.values().any(|c| c.id() == TAKE_PROFIT_ID)
            || self.icebergs.values().any(|i| i.id() == TAKE_PROFIT_ID);
        let sl_split = self.chasers.values().any(|c| c.id() == STOP_LOSS_ID)
            || self.icebergs.values().any(|i| i.id() == STOP_LOSS_ID);

        let actions = {
            let take_profit = self.registry.find_by_prefix(&tp_family).first().copied();
            let stop_loss = self.registry.find_by_prefix(&sl_family).first().copied();
            evaluate_sltp(
                &self.sltp_policy,
                &view,
                take_profit,
                stop_loss,
                self.config.quote_decimals,
                defer,
            )
        };

        for action in actions {
            match action {
                SltpAction::Cancel(client_id) => {
                    let busy = (client_id.starts_with(&tp_family) && tp_split)
                        || (client_id.starts_with(&sl_family) && sl_split);
                    if !busy {
                        self.cancel_order_id(&client_id)?;
                    }
                }
                SltpAction::Place(request) => {
                    let busy = (request.id == TAKE_PROFIT_ID && tp_split)
                        || (request.id == STOP_LOSS_ID && sl_split);
                    if !busy {
                        self.order(request)?;
                    }
                }
            }
        }
        self.flush()
    }

    fn start_iceberg(&mut self, request: OrderRequest, qty: f64) -> Result<()> {
        let key = self.next_execution_key(&request.id);
        let mut iceberg = IcebergOrder::new(&request, qty, self.config.asset_decimals, self.now);
        let leg = iceberg.start();
        tracing::info!(
            "Iceberg {}: {} {} in {} legs",
            request.id,
            request.side,
            qty,
            request.split
        );
        self.icebergs.insert(key.clone(), iceberg);
        if let Err(e) = self.transmit(&leg, OrderHandler::IcebergLeg { parent: key.clone() }) {
            self.icebergs.remove(&key);
            return Err(e);
        }
        Ok(())
    }

    fn start_chaser(&mut self, request: OrderRequest, qty: f64) -> Result<()> {
        let running: Vec<String> = self
            .chasers
            .iter()
            .filter(|(_, c)| c.id() == request.id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in running {
            tracing::info!("Replacing running chaser {}", request.id);
            self.stop_chaser(&key)?;
        }

        let key = self.next_execution_key(&request.id);
        let mut chaser = LimitChaser::new(
            &request,
            qty,
            self.config.asset_decimals,
            self.config.quote_decimals,
            self.now,
        );
        let leg = chaser.start(&self.book);
        let client_id = self.transmit(&leg, OrderHandler::ChaserLeg { chaser: key.clone() })?;
        chaser.leg_placed(&client_id);
        self.chasers.insert(key, chaser);
        Ok(())
    }

    fn stop_chaser(&mut self, key: &str) -> Result<()> {
        let now = self.now;
        if let Some(chaser) = self.chasers.get_mut(key) {
            let actions = chaser.cancel(now);
            self.run_chaser_actions(key, actions)?;
        }
        Ok(())
    }

    fn stop_iceberg(&mut self, key: &str) {
        let now = self.now;
        let Some(iceberg) = self.icebergs.get_mut(key) else {
            return;
        };
        if let Some(aggregate) = iceberg.cancel(now) {
            if let Some(callback) = iceberg.callback() {
                callback.call(&aggregate);
            }
        }
        self.icebergs.remove(key);
    }

    fn run_iceberg_actions(&mut self, key: &str, actions: Vec<IcebergAction>) -> Result<()> {
        for action in actions {
            match action {
                IcebergAction::Place(leg) => {
                    self.transmit(&leg, OrderHandler::IcebergLeg { parent: key.to_string() })?;
                }
                IcebergAction::Complete(aggregate) | IcebergAction::Abort(aggregate) => {
                    if let Some(iceberg) = self.icebergs.remove(key) {
                        tracing::info!(
                            "Iceberg {} {}: {} @ {}",
                            iceberg.id(),
                            aggregate.status,
                            aggregate.filled_qty,
                            aggregate.avg_fill_price
                        );
                        if let Some(callback) = iceberg.callback() {
                            callback.call(&aggregate);
                        }
                    }
                }
            }
        }
        Ok(())
    }

    fn run_chaser_actions(&mut self, key: &str, actions: Vec<ChaserAction>) -> Result<()> {
        for action in actions {
            match action {
                ChaserAction::Place(leg) => {
                    let client_id =
                        self.transmit(&leg, OrderHandler::ChaserLeg { chaser: key.to_string() })?;
                    if let Some(chaser) = self.chasers.get_mut(key) {
                        chaser.leg_placed(&client_id);
                    }
                }
                ChaserAction::Cancel(client_id) => self.cancel_order_id(&client_id)?,
                ChaserAction::Finished { update, stats } => {
                    if let Some(chaser) = self.chasers.remove(key) {
                        tracing::info!(
                            "Chaser {} {}: {} @ {} over {} legs",
                            stats.id,
                            update.status,
                            stats.filled_qty,
                            stats.avg_price,
                            stats.legs
                        );
                        if let Some(callback) = chaser.callback() {
                            callback.call(&update);
                        }
                    }
                    self.chaser_stats.push(stats);
                }
            }
        }
        Ok(())
    }

    fn notify_chasers(&mut self, change: BookChange) -> Result<()> {
        let keys: Vec<String> = self.chasers.keys().cloned().collect();
        for key in keys {
            let book = self.book;
            let actions = match self.chasers.get_mut(&key) {
                Some(chaser) => chaser.on_book_change(change, &book),
                None => continue,
            };
            self.run_chaser_actions(&key, actions)?;
        }
        Ok(())
    }

    fn release_iceberg_legs(&mut self) -> Result<()> {
        let now = self.now;
        let keys: Vec<String> = self.icebergs.keys().cloned().collect();
        for key in keys {
            let action = match self.icebergs.get_mut(&key) {
                Some(iceberg) => iceberg.on_timer(now),
                None => continue,
            };
            if let Some(action) = action {
                self.run_iceberg_actions(&key, vec![action])?;
            }
        }
        self.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::LiveBackend;
    use crate::backend::BackendCommand;
    use crate::ledger::LiveLedger;
    use chrono::{Duration, TimeZone};
    use std::sync::{Arc, Mutex};

    fn init_logging() {
        tracing_subscriber::fmt()
            .with_env_filter("perpbot=debug")
            .try_init()
            .ok();
    }

    fn config() -> EngineConfig {
        EngineConfig {
            order_ids: OrderIdMode::Sequential,
            order_update_log: false,
            ..Default::default()
        }
    }

    fn ts(min: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::minutes(min)
    }

    fn bar(min: i64, open: f64, high: f64, low: f64, close: f64) -> Candle {
        Candle::new(ts(min), open, high, low, close, 10.0)
    }

    fn step(engine: &mut TradingEngine, candle: &Candle) {
        engine.begin_bar(candle).unwrap();
        engine.end_bar().unwrap();
    }

    #[test]
    fn test_market_entry_and_close() {
        init_logging();
        let mut engine = TradingEngine::simulated(config()).unwrap();
        engine.begin_bar(&bar(1, 100.0, 101.0, 99.0, 100.0)).unwrap();

        engine.entry(OrderRequest::long("Long", 1.0)).unwrap();
        assert_eq!(engine.get_position_size(), 1.0);
        assert_eq!(engine.get_position_avg_price(), 100.0);

        // Same direction entry is ignored
        engine.entry(OrderRequest::long("Long", 1.0)).unwrap();
        assert_eq!(engine.get_position_size(), 1.0);

        // Reversal flattens and flips in one order
        engine.entry(OrderRequest::short("Short", 1.0)).unwrap();
        assert_eq!(engine.get_position_size(), -1.0);

        engine.close_all().unwrap();
        assert_eq!(engine.get_position_size(), 0.0);
        engine.end_bar().unwrap();
        assert_eq!(engine.stats().trade_count(), 2);
    }

    #[test]
    fn test_when_false_and_zero_qty_are_noops() {
        let mut engine = TradingEngine::simulated(config()).unwrap();
        engine.begin_bar(&bar(1, 100.0, 101.0, 99.0, 100.0)).unwrap();
        engine.order(OrderRequest::long("A", 1.0).when(false)).unwrap();
        engine.order(OrderRequest::long("B", 0.0001)).unwrap();
        assert_eq!(engine.get_position_size(), 0.0);
        assert!(engine.open_orders("").is_empty());
    }

    #[test]
    fn test_limit_order_fills_on_later_bar() {
        let mut engine = TradingEngine::simulated(config()).unwrap();
        engine.begin_bar(&bar(1, 100.0, 101.0, 99.0, 100.0)).unwrap();
        engine.order(OrderRequest::long("Dip", 1.0).with_limit(95.0)).unwrap();
        engine.end_bar().unwrap();
        assert_eq!(engine.get_position_size(), 0.0);
        assert_eq!(engine.open_orders("Dip").len(), 1);

        step(&mut engine, &bar(2, 100.0, 100.0, 94.0, 96.0));
        assert_eq!(engine.get_position_size(), 1.0);
        assert_eq!(engine.get_position_avg_price(), 95.0);
        assert!(engine.open_orders("Dip").is_empty());
    }

    #[test]
    fn test_pyramiding_respects_cap() {
        let mut engine = TradingEngine::simulated(config()).unwrap();
        engine.begin_bar(&bar(1, 100.0, 101.0, 99.0, 100.0)).unwrap();
        for _ in 0..5 {
            engine
                .entry_pyramiding(OrderRequest::long("Pyr", 1.0), 3, false)
                .unwrap();
        }
        assert_eq!(engine.get_position_size(), 3.0);
    }

    #[test]
    fn test_cancel_by_prefix_and_callback() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callback = OrderCallback::on_terminal(move |u: &OrderUpdate| {
            sink.lock().unwrap().push(u.status);
        });

        let mut engine = TradingEngine::simulated(config()).unwrap();
        engine.begin_bar(&bar(1, 100.0, 101.0, 99.0, 100.0)).unwrap();
        engine
            .order(OrderRequest::long("Grid1", 1.0).with_limit(90.0).with_callback(callback))
            .unwrap();
        engine.order(OrderRequest::long("Grid2", 1.0).with_limit(80.0)).unwrap();
        engine.order(OrderRequest::long("Other", 1.0).with_limit(70.0)).unwrap();

        engine.cancel("Grid").unwrap();
        assert!(engine.open_orders("Grid").is_empty());
        assert_eq!(engine.open_orders("Other").len(), 1);
        assert_eq!(*seen.lock().unwrap(), vec![OrderStatus::Canceled]);

        // Unknown prefix is only logged
        engine.cancel("Nothing").unwrap();
    }

    #[test]
    fn test_amend_moves_resting_limit() {
        let mut engine = TradingEngine::simulated(config()).unwrap();
        engine.begin_bar(&bar(1, 100.0, 101.0, 99.0, 100.0)).unwrap();
        engine.order(OrderRequest::long("Bid", 1.0).with_limit(90.0)).unwrap();
        engine
            .amend_order(
                "Bid",
                Amendment {
                    limit: Some(98.0),
                    ..Default::default()
                },
            )
            .unwrap();
        engine.end_bar().unwrap();

        step(&mut engine, &bar(2, 100.0, 100.0, 97.5, 99.0));
        assert_eq!(engine.get_position_size(), 1.0);
        assert_eq!(engine.get_position_avg_price(), 98.0);
    }

    #[test]
    fn test_sltp_placed_once_and_cleared_when_flat() {
        let mut engine = TradingEngine::simulated(config()).unwrap();
        engine.sltp(SltpPolicy::percent(5.0, 5.0, 2.0, 2.0));

        engine.begin_bar(&bar(1, 100.0, 101.0, 99.0, 100.0)).unwrap();
        engine.entry(OrderRequest::long("Long", 1.0)).unwrap();
        engine.end_bar().unwrap();
        assert_eq!(engine.open_orders("TP_").len(), 1);
        assert_eq!(engine.open_orders("SL_").len(), 1);
        let tp_id = engine.open_orders("TP_")[0].order.client_id.clone();

        // Already sized: nothing is re-quoted
        step(&mut engine, &bar(2, 100.0, 101.0, 99.5, 100.5));
        assert_eq!(engine.open_orders("TP_")[0].order.client_id, tp_id);

        // Stop triggers; the take-profit goes with the position
        step(&mut engine, &bar(3, 100.0, 100.0, 97.0, 97.5));
        assert_eq!(engine.get_position_size(), 0.0);
        assert!(engine.open_orders("TP_").is_empty());
        assert!(engine.open_orders("SL_").is_empty());
        assert!(engine.stats().balance < 1000.0);
    }

    #[test]
    fn test_trailing_stop_fills_at_trigger_price() {
        let mut engine = TradingEngine::simulated(config()).unwrap();
        engine.exit(ExitPolicy::new(0.0, 0.0, 5.0));

        engine.begin_bar(&bar(1, 100.0, 101.0, 99.0, 100.0)).unwrap();
        engine.entry(OrderRequest::long("Long", 1.0)).unwrap();
        engine.end_bar().unwrap();

        // Ratchet climbs to 110
        step(&mut engine, &bar(2, 100.0, 112.0, 110.0, 111.0));
        assert_eq!(engine.get_position_size(), 1.0);

        // Retrace below 105 closes at exactly 105
        step(&mut engine, &bar(3, 111.0, 111.0, 103.0, 104.0));
        assert_eq!(engine.get_position_size(), 0.0);
        let trade = engine.closed_trades().last().unwrap();
        assert_eq!(trade.exit_price, 105.0);
    }

    #[test]
    fn test_iceberg_legs_follow_fills() {
        let done = Arc::new(Mutex::new(None));
        let sink = done.clone();
        let callback = OrderCallback::on_terminal(move |u: &OrderUpdate| {
            *sink.lock().unwrap() = Some((u.status, u.filled_qty));
        });

        let mut engine = TradingEngine::simulated(config()).unwrap();
        engine.begin_bar(&bar(1, 100.0, 101.0, 99.0, 100.0)).unwrap();
        engine
            .order(
                OrderRequest::long("Split", 3.0)
                    .with_split(3, Duration::zero())
                    .with_callback(callback),
            )
            .unwrap();
        engine.end_bar().unwrap();

        assert_eq!(engine.get_position_size(), 3.0);
        assert_eq!(engine.active_icebergs(), 0);
        assert_eq!(*done.lock().unwrap(), Some((OrderStatus::Filled, 3.0)));
    }

    #[test]
    fn test_chaser_requotes_until_filled() {
        let mut engine = TradingEngine::simulated(config()).unwrap();
        step(&mut engine, &bar(1, 100.0, 101.0, 99.0, 100.0));

        engine.begin_bar(&bar(2, 100.0, 101.0, 99.0, 100.0)).unwrap();
        engine
            .order(OrderRequest::long("Chase", 1.0).with_chaser(true, 10))
            .unwrap();
        engine.end_bar().unwrap();
        assert_eq!(engine.active_chasers(), 1);

        // Market runs away; the chaser follows the new close
        step(&mut engine, &bar(3, 100.5, 102.0, 100.5, 101.5));
        assert_eq!(engine.get_position_size(), 0.0);
        assert_eq!(engine.open_orders("Chase").len(), 1);

        // Trades back through the quote
        step(&mut engine, &bar(4, 101.5, 101.5, 100.0, 100.5));
        assert_eq!(engine.get_position_size(), 1.0);
        assert_eq!(engine.active_chasers(), 0);
        assert_eq!(engine.chaser_stats().len(), 1);
        assert_eq!(engine.chaser_stats()[0].filled_qty, 1.0);
    }

    #[test]
    fn test_cancel_all_stops_chasers() {
        let mut engine = TradingEngine::simulated(config()).unwrap();
        step(&mut engine, &bar(1, 100.0, 101.0, 99.0, 100.0));
        engine.begin_bar(&bar(2, 100.0, 101.0, 99.0, 100.0)).unwrap();
        engine
            .order(OrderRequest::long("Chase", 1.0).with_chaser(true, 10))
            .unwrap();
        engine.cancel_all().unwrap();
        assert_eq!(engine.active_chasers(), 0);
        assert!(engine.open_orders("").is_empty());
    }

    #[test]
    fn test_get_lot_and_profit() {
        let mut engine = TradingEngine::simulated(EngineConfig {
            margin_retain_rate: 0.5,
            ..config()
        })
        .unwrap();
        engine.begin_bar(&bar(1, 300.0, 301.0, 299.0, 300.0)).unwrap();
        // 0.5 * 1000 / 300, truncated
        assert_eq!(engine.get_lot(None), 1.666);
        assert_eq!(engine.get_lot(Some(0)), 1.0);

        engine.entry(OrderRequest::long("Long", 1.0)).unwrap();
        engine.end_bar().unwrap();
        engine.begin_bar(&bar(2, 300.0, 331.0, 329.0, 330.0)).unwrap();
        assert!(engine.get_profit() > 29.0 && engine.get_profit() < 30.0);
    }

    #[test]
    fn test_plot_records_bar_time() {
        let mut engine = TradingEngine::simulated(config()).unwrap();
        engine.begin_bar(&bar(1, 100.0, 101.0, 99.0, 100.0)).unwrap();
        engine.plot("sma", 99.5);
        assert_eq!(engine.plots()["sma"], vec![(ts(1), 99.5)]);
    }

    #[test]
    fn test_sequential_client_ids() {
        let mut engine = TradingEngine::simulated(config()).unwrap();
        engine.begin_bar(&bar(1, 100.0, 101.0, 99.0, 100.0)).unwrap();
        engine.order(OrderRequest::long("Bid", 1.0).with_limit(90.0)).unwrap();
        assert_eq!(engine.open_orders("Bid")[0].order.client_id, "Bid_00000001");
    }

    #[test]
    fn test_live_orders_become_commands() {
        let (backend, mut commands) = LiveBackend::channel(8);
        let ledger = LiveLedger::new(config().ledger);
        let mut engine = TradingEngine::new(config(), Box::new(ledger), Box::new(backend)).unwrap();
        engine.on_ticker(100.0);

        engine.order(OrderRequest::long("Long", 1.0)).unwrap();
        let Ok(BackendCommand::Place(order)) = commands.try_recv() else {
            panic!("expected a place command");
        };
        assert_eq!(order.client_id, "Long_00000001");
        // Position only moves when the venue reports it
        assert_eq!(engine.get_position_size(), 0.0);

        engine
            .on_order_update(order.update(OrderStatus::Filled, 1.0, 100.0, ts(1)))
            .unwrap();
        engine
            .on_position_snapshot(PositionSnapshot {
                size: 1.0,
                avg_price: 100.0,
            })
            .unwrap();
        assert_eq!(engine.get_position_size(), 1.0);
        assert!(engine.open_orders("Long").is_empty());
    }

    #[test]
    fn test_live_sltp_follows_position_snapshot() {
        let (backend, mut commands) = LiveBackend::channel(8);
        let ledger = LiveLedger::new(config().ledger);
        let mut engine = TradingEngine::new(config(), Box::new(ledger), Box::new(backend)).unwrap();
        engine.sltp(SltpPolicy::percent(5.0, 5.0, 2.0, 2.0));
        engine.on_ticker(100.0);

        engine
            .on_position_snapshot(PositionSnapshot {
                size: 1.0,
                avg_price: 100.0,
            })
            .unwrap();

        let mut placed = Vec::new();
        while let Ok(command) = commands.try_recv() {
            if let BackendCommand::Place(order) = command {
                placed.push(order);
            }
        }
        assert_eq!(placed.len(), 2);
        assert_eq!(placed[0].kind, OrderKind::Limit { price: 105.0 });
        assert!(placed.iter().all(|o| o.reduce_only && o.side == Side::Sell));
        assert_eq!(placed[1].kind.stop_price(), Some(98.0));
    }
}
