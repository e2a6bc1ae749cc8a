use chrono::{DateTime, Utc};
use std::future::Future;
use std::sync::Arc;

use crate::api::ExchangeClient;
use crate::config::{BotConfig, TradingConfig};
use crate::error::{BotError, Result};
use crate::execution::position_manager::{Fill, PositionManager};
use crate::execution::price_feed::MarketDataFeed;
use crate::models::{Action, OrderInfo, OrderStatus, Side};
use crate::persistence::TradeLedger;
use crate::strategy::{MarketState, StrategyEngine};

/// Remaining size below this is treated as fully sold
const SIZE_EPSILON: f64 = 1e-9;

/// Status re-queries of an emergency market SELL before giving up on it
const EMERGENCY_SELL_QUERIES: usize = 3;
const EMERGENCY_SELL_QUERY_DELAY: std::time::Duration = std::time::Duration::from_millis(250);

/// Tunables of the order loop
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub poll_interval: std::time::Duration,
    /// Open orders older than this are cancelled
    pub cancel_timeout: chrono::Duration,
    pub buy_price_factor: f64,
    pub sell_price_factor: f64,
    /// Fraction of capital committed to a BUY
    pub size_buffer: f64,
}

impl LoopConfig {
    /// Expects `trading` to have passed `BotConfig::validate`
    pub fn from_trading(trading: &TradingConfig) -> Self {
        Self {
            poll_interval: std::time::Duration::from_secs(trading.poll_interval_secs),
            cancel_timeout: chrono::Duration::seconds(trading.cancel_timeout_secs as i64),
            buy_price_factor: trading.buy_price_factor,
            sell_price_factor: trading.sell_price_factor,
            size_buffer: trading.size_buffer,
        }
    }
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from_trading(&TradingConfig::default())
    }
}

/// The single order the loop is waiting on
#[derive(Debug, Clone, PartialEq)]
pub struct PendingOrder {
    pub id: String,
    pub side: Side,
    pub price: f64,
    pub size: f64,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum OrderState {
    NoOrder,
    Pending(PendingOrder),
}

/// What a tick did
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Market data could not be refreshed, nothing else was attempted
    DataUnavailable,
    /// No order pending and nothing submitted
    Idle(Action),
    OrderSubmitted { side: Side, order_id: String },
    SubmissionFailed(Side),
    StillPending,
    /// Status unknown this tick, the pending order is kept as is
    QueryFailed,
    Filled(Side),
    /// Order is gone; `filled_size` of it was executed before the cancel
    Cancelled { side: Side, filled_size: f64 },
    CancelFailed,
}

/// Polling state machine placing, tracking and cancelling limit orders
///
/// At most one order is pending at a time. A failed exchange call inside a
/// tick is logged and leaves both the pending order and the position as they
/// were, so the next tick picks up from the same state.
pub struct OrderLoop {
    client: Arc<dyn ExchangeClient>,
    feed: MarketDataFeed,
    engine: StrategyEngine,
    positions: PositionManager,
    ledger: TradeLedger,
    config: LoopConfig,
    state: OrderState,
}

impl OrderLoop {
    /// `feed` is expected to be initialized already
    pub fn new(
        client: Arc<dyn ExchangeClient>,
        feed: MarketDataFeed,
        engine: StrategyEngine,
        positions: PositionManager,
        ledger: TradeLedger,
        config: LoopConfig,
    ) -> Self {
        Self {
            client,
            feed,
            engine,
            positions,
            ledger,
            config,
            state: OrderState::NoOrder,
        }
    }

    pub fn state(&self) -> &OrderState {
        &self.state
    }

    pub fn positions(&self) -> &PositionManager {
        &self.positions
    }

    pub fn feed(&self) -> &MarketDataFeed {
        &self.feed
    }

    pub fn ledger(&self) -> &TradeLedger {
        &self.ledger
    }

    fn product_id(&self) -> &str {
        self.positions.product_id()
    }

    /// One poll: refresh data, then either follow up on the pending order or decide
    pub async fn tick(&mut self, now: DateTime<Utc>) -> TickOutcome {
        if let Err(e) = self.feed.update().await {
            tracing::warn!(
                product = %self.product_id(),
                state = ?self.state,
                position = ?self.positions.position_state(),
                error = %e,
                "Market data refresh failed, retrying next tick"
            );
            return TickOutcome::DataUnavailable;
        }

        match self.state.clone() {
            OrderState::Pending(pending) => self.follow_up(pending, now).await,
            OrderState::NoOrder => self.decide(now).await,
        }
    }

    async fn decide(&mut self, now: DateTime<Utc>) -> TickOutcome {
        let Some(latest) = self.feed.latest() else {
            return TickOutcome::DataUnavailable;
        };
        let close = latest.close();
        let position = self.positions.position_state();

        let market = MarketState::new(self.feed.history().rows());
        let action = self.engine.action(&market, &position);

        tracing::debug!(
            product = %self.product_id(),
            %action,
            close,
            candle = %latest.timestamp(),
            "Strategy decision"
        );

        let (side, price, size) = match action {
            Action::Buy => {
                let price = close * self.config.buy_price_factor;
                let size = self.positions.capital() * self.config.size_buffer / price;
                (Side::Buy, price, size)
            }
            Action::Sell => (
                Side::Sell,
                close * self.config.sell_price_factor,
                self.positions.held_size(),
            ),
            Action::NoTrade => return TickOutcome::Idle(action),
        };

        if !(size.is_finite() && size > 0.0) {
            tracing::warn!(
                product = %self.product_id(),
                %side,
                capital = self.positions.capital(),
                size,
                "Nothing to trade, skipping order"
            );
            return TickOutcome::Idle(action);
        }

        match self
            .client
            .place_limit_order(self.positions.product_id(), side, price, size)
            .await
        {
            Ok(order) => {
                tracing::info!(
                    product = %self.product_id(),
                    order_id = %order.id,
                    %side,
                    price,
                    size,
                    "📝 Limit order submitted"
                );
                let order_id = order.id.clone();
                self.state = OrderState::Pending(PendingOrder {
                    id: order.id,
                    side,
                    price,
                    size,
                    submitted_at: now,
                });
                TickOutcome::OrderSubmitted { side, order_id }
            }
            Err(e) => {
                tracing::error!(
                    product = %self.product_id(),
                    %side,
                    price,
                    size,
                    error = %e,
                    "Order submission failed"
                );
                TickOutcome::SubmissionFailed(side)
            }
        }
    }

    async fn follow_up(&mut self, pending: PendingOrder, now: DateTime<Utc>) -> TickOutcome {
        let info = match self.client.get_order(&pending.id).await {
            Ok(info) => info,
            Err(BotError::OrderNotFound(_)) => {
                tracing::warn!(order_id = %pending.id, side = %pending.side, "Order vanished, treating as cancelled without fill");
                self.state = OrderState::NoOrder;
                return TickOutcome::Cancelled {
                    side: pending.side,
                    filled_size: 0.0,
                };
            }
            Err(e) => {
                tracing::warn!(order_id = %pending.id, error = %e, "Order status query failed, keeping pending order");
                return TickOutcome::QueryFailed;
            }
        };

        match info.status {
            OrderStatus::Filled => {
                self.book_fill(&pending, &info, now);
                self.state = OrderState::NoOrder;
                TickOutcome::Filled(pending.side)
            }
            OrderStatus::Canceled => {
                self.book_fill(&pending, &info, now);
                self.state = OrderState::NoOrder;
                TickOutcome::Cancelled {
                    side: pending.side,
                    filled_size: info.filled_size,
                }
            }
            OrderStatus::Open if now - pending.submitted_at > self.config.cancel_timeout => {
                self.cancel_pending(&pending, now).await
            }
            OrderStatus::Open => TickOutcome::StillPending,
        }
    }

    /// Cancel, then re-query so a fill that raced the cancel is not lost
    async fn cancel_pending(&mut self, pending: &PendingOrder, now: DateTime<Utc>) -> TickOutcome {
        tracing::info!(
            order_id = %pending.id,
            side = %pending.side,
            age_secs = (now - pending.submitted_at).num_seconds(),
            "⏱️ Order timed out, cancelling"
        );

        if let Err(e) = self.client.cancel_order(&pending.id).await {
            tracing::warn!(order_id = %pending.id, error = %e, "Cancel failed, order stays pending");
            return TickOutcome::CancelFailed;
        }

        match self.client.get_order(&pending.id).await {
            Ok(info) => {
                self.book_fill(pending, &info, now);
                self.state = OrderState::NoOrder;
                match info.status {
                    OrderStatus::Filled => TickOutcome::Filled(pending.side),
                    _ => TickOutcome::Cancelled {
                        side: pending.side,
                        filled_size: info.filled_size,
                    },
                }
            }
            Err(BotError::OrderNotFound(_)) => {
                self.state = OrderState::NoOrder;
                TickOutcome::Cancelled {
                    side: pending.side,
                    filled_size: 0.0,
                }
            }
            // The order is cancelled on the exchange; its fill is read back next tick
            Err(e) => {
                tracing::warn!(order_id = %pending.id, error = %e, "Post-cancel query failed");
                TickOutcome::QueryFailed
            }
        }
    }

    /// Apply whatever part of `info` was executed to the position
    fn book_fill(&mut self, pending: &PendingOrder, info: &OrderInfo, now: DateTime<Utc>) {
        if info.filled_size <= 0.0 {
            return;
        }

        let fill = Fill {
            timestamp: now,
            price: info.average_fill_price().unwrap_or(pending.price),
            size: info.filled_size,
            fee: info.fill_fees,
            order_id: Some(info.id.clone()),
        };

        let booked = match pending.side {
            Side::Buy => self.positions.enter(fill),
            // A completed SELL closes the position even if size rounding left dust
            Side::Sell
                if info.status != OrderStatus::Filled
                    && fill.size + SIZE_EPSILON < self.positions.held_size() =>
            {
                self.positions.reduce(fill)
            }
            Side::Sell => self.close_position(fill),
        };

        if let Err(e) = booked {
            tracing::error!(
                order_id = %info.id,
                side = %pending.side,
                filled = info.filled_size,
                error = %e,
                "Could not book fill"
            );
        }
    }

    fn close_position(&mut self, fill: Fill) -> Result<()> {
        let record = self.positions.exit(fill)?.clone();
        if let Err(e) = self.ledger.append(&record) {
            tracing::warn!(error = %e, "Ledger append failed, will retry at shutdown");
        }
        Ok(())
    }

    /// Cancel what is pending, liquidate a pending SELL, and flush the ledger
    ///
    /// Every step runs even when an earlier one failed.
    pub async fn shutdown(&mut self, now: DateTime<Utc>) -> Result<()> {
        tracing::info!(
            product = %self.product_id(),
            state = ?self.state,
            position = ?self.positions.position_state(),
            "🛑 Shutting down order loop"
        );

        if let OrderState::Pending(pending) = self.state.clone() {
            if let Err(e) = self.client.cancel_order(&pending.id).await {
                tracing::warn!(order_id = %pending.id, error = %e, "Cancel at shutdown failed");
            }

            match self.client.get_order(&pending.id).await {
                Ok(info) => self.book_fill(&pending, &info, now),
                Err(BotError::OrderNotFound(_)) => {}
                Err(e) => {
                    tracing::warn!(order_id = %pending.id, error = %e, "Final status query failed")
                }
            }
            self.state = OrderState::NoOrder;

            if pending.side == Side::Sell && self.positions.is_entered() {
                self.emergency_sell(now).await;
            }
        }

        let written = self.ledger.flush_pending(self.positions.ledger())?;
        tracing::info!(
            trades = self.positions.ledger().len(),
            flushed = written,
            capital = self.positions.capital(),
            "Order loop stopped"
        );
        Ok(())
    }

    /// Market SELL of the whole held size
    ///
    /// Only what the exchange reports as executed is booked. An unconfirmed
    /// sale leaves the position ENTERED with the unsold size.
    async fn emergency_sell(&mut self, now: DateTime<Utc>) {
        let size = self.positions.held_size();
        tracing::warn!(product = %self.product_id(), size, "🚨 Emergency market sell");

        let mut order = match self
            .client
            .place_market_order(self.positions.product_id(), Side::Sell, size)
            .await
        {
            Ok(order) => order,
            Err(e) => {
                tracing::error!(size, error = %e, "Emergency market sell failed, position left open");
                return;
            }
        };

        // Market orders may report their fill only on a later query
        let order_id = order.id.clone();
        for _ in 0..EMERGENCY_SELL_QUERIES {
            if order.status != OrderStatus::Open {
                break;
            }
            tokio::time::sleep(EMERGENCY_SELL_QUERY_DELAY).await;
            match self.client.get_order(&order_id).await {
                Ok(latest) => order = latest,
                Err(e) => {
                    tracing::warn!(order_id = %order_id, error = %e, "Emergency sell status query failed")
                }
            }
        }

        let sold = order.filled_size.min(size);
        if sold <= 0.0 {
            tracing::error!(
                order_id = %order_id,
                status = ?order.status,
                unsold = size,
                "Emergency sell not confirmed, position left open"
            );
            return;
        }

        let price = match order.average_fill_price() {
            Some(price) => price,
            None => match self.feed.latest() {
                Some(row) => {
                    tracing::warn!(order_id = %order_id, "Fill price not reported, booking at last close");
                    row.close()
                }
                None => {
                    tracing::error!(order_id = %order_id, sold, "No price to book the emergency sell");
                    return;
                }
            },
        };

        let fill = Fill {
            timestamp: now,
            price,
            size: sold,
            fee: order.fill_fees,
            order_id: Some(order_id.clone()),
        };
        let complete = order.status == OrderStatus::Filled || sold + SIZE_EPSILON >= size;
        let booked = if complete {
            self.close_position(fill)
        } else {
            self.positions.reduce(fill)
        };
        if let Err(e) = booked {
            tracing::error!(order_id = %order_id, error = %e, "Could not book emergency sell");
            return;
        }

        if !complete {
            tracing::error!(
                order_id = %order_id,
                status = ?order.status,
                sold,
                unsold = self.positions.held_size(),
                "Emergency sell only partly confirmed, remainder left open"
            );
        }
    }

    /// Tick every poll interval until `deadline` or until `stop` resolves, then shut down
    ///
    /// A tick in progress always completes; `stop` is only observed between ticks.
    pub async fn run<F>(&mut self, deadline: DateTime<Utc>, stop: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);

        tracing::info!(
            product = %self.product_id(),
            strategy = self.engine.strategy_name(),
            %deadline,
            poll_secs = self.config.poll_interval.as_secs_f64(),
            "🔄 Order loop started"
        );

        loop {
            let now = Utc::now();
            if now >= deadline {
                tracing::info!("Running time exhausted");
                break;
            }

            let outcome = self.tick(now).await;
            tracing::debug!(?outcome, "Tick complete");

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = &mut stop => {
                    tracing::info!("Stop requested");
                    break;
                }
            }
        }

        self.shutdown(Utc::now()).await
    }
}

/// Starting position from configuration, completed from the exchange accounts
///
/// Capital is `trading.capital` or the available quote balance. With
/// `trading.start_entered` the held size is the base currency balance.
pub async fn initial_positions(
    client: &dyn ExchangeClient,
    config: &BotConfig,
    now: DateTime<Utc>,
) -> Result<PositionManager> {
    let market = &config.market;
    let trading = &config.trading;

    let needs_accounts = trading.capital.is_none() || trading.start_entered;
    let accounts = if needs_accounts {
        client.get_accounts().await?
    } else {
        Vec::new()
    };
    let available = |currency: &str| {
        accounts
            .iter()
            .find(|a| a.currency.eq_ignore_ascii_case(currency))
            .map(|a| a.available)
    };

    let capital = match trading.capital {
        Some(capital) => capital,
        None => available(market.quote_currency()).ok_or_else(|| {
            BotError::Configuration(format!(
                "No {} account to take capital from",
                market.quote_currency()
            ))
        })?,
    };

    if !trading.start_entered {
        return Ok(PositionManager::new(market.symbol.clone(), capital));
    }

    let entry_price = trading
        .entry_price
        .ok_or_else(|| BotError::Configuration("start_entered requires entry_price".to_string()))?;
    let size = available(market.base_currency()).unwrap_or(0.0);
    if size <= 0.0 {
        return Err(BotError::Configuration(format!(
            "start_entered set but no {} balance is held",
            market.base_currency()
        )));
    }

    tracing::info!(
        product = %market.symbol,
        entry_price,
        size,
        capital,
        "Starting with an open position"
    );
    Ok(PositionManager::with_open_position(
        market.symbol.clone(),
        capital,
        entry_price,
        size,
        now,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{PaperExchange, PaperOperation};
    use crate::models::{Candle, PositionState};
    use crate::strategy::testing::{FixedStrategy, ScriptedStrategy};
    use crate::strategy::Strategy;
    use chrono::{Duration, TimeZone};
    use tempfile::TempDir;

    const HISTORY: i64 = 30;

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0).unwrap()
    }

    fn flat_tape(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| Candle {
                timestamp: start() + Duration::minutes(i as i64),
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.0,
                volume: 5.0,
            })
            .collect()
    }

    fn loop_config() -> LoopConfig {
        LoopConfig {
            poll_interval: std::time::Duration::from_millis(10),
            cancel_timeout: Duration::minutes(5),
            buy_price_factor: 1.0,
            sell_price_factor: 1.0,
            size_buffer: 0.995,
        }
    }

    struct Harness {
        exchange: Arc<PaperExchange>,
        order_loop: OrderLoop,
        dir: TempDir,
    }

    impl Harness {
        async fn tick(&mut self) -> TickOutcome {
            let now = self.exchange.advance(Duration::minutes(1)).await;
            self.order_loop.tick(now).await
        }

        fn ledger_path(&self) -> std::path::PathBuf {
            self.dir.path().join("trades.csv")
        }
    }

    async fn harness_with(strategy: Box<dyn Strategy>, positions: PositionManager) -> Harness {
        let exchange = Arc::new(PaperExchange::new(
            "BTC-EUR",
            flat_tape(200),
            Duration::minutes(1),
            1000.0,
            0.0,
        ));
        exchange.set_time(start() + Duration::minutes(HISTORY)).await;

        let mut feed = MarketDataFeed::new(exchange.clone(), "BTC-EUR", 60, 300);
        feed.initialize(Duration::minutes(HISTORY)).await.unwrap();

        let dir = tempfile::tempdir().unwrap();
        let ledger = TradeLedger::new(dir.path().join("trades.csv"));
        let engine = StrategyEngine::new(strategy, 0.95);

        let order_loop = OrderLoop::new(exchange.clone(), feed, engine, positions, ledger, loop_config());
        Harness {
            exchange,
            order_loop,
            dir,
        }
    }

    async fn harness(strategy: Box<dyn Strategy>) -> Harness {
        harness_with(strategy, PositionManager::new("BTC-EUR", 1000.0)).await
    }

    fn always_buy() -> Box<dyn Strategy> {
        Box::new(FixedStrategy {
            buy: true,
            sell: false,
        })
    }

    fn pending_id(h: &Harness) -> String {
        match h.order_loop.state() {
            OrderState::Pending(p) => p.id.clone(),
            OrderState::NoOrder => panic!("expected a pending order"),
        }
    }

    #[tokio::test]
    async fn test_round_trip_is_booked_and_persisted() {
        // First decision is on row HISTORY, sell two rows later
        let h_idx = HISTORY as usize;
        let mut h = harness(Box::new(ScriptedStrategy::new(vec![h_idx], vec![h_idx + 2]))).await;

        assert!(matches!(h.tick().await, TickOutcome::OrderSubmitted { side: Side::Buy, .. }));
        assert_eq!(h.tick().await, TickOutcome::Filled(Side::Buy));
        assert!(h.order_loop.positions().is_entered());
        let held = h.order_loop.positions().held_size();
        assert!((held - 9.95).abs() < 1e-9);

        assert!(matches!(h.tick().await, TickOutcome::OrderSubmitted { side: Side::Sell, .. }));
        assert_eq!(h.tick().await, TickOutcome::Filled(Side::Sell));

        let positions = h.order_loop.positions();
        assert_eq!(positions.position_state(), PositionState::Flat);
        assert_eq!(positions.ledger().len(), 1);
        let trade = &positions.ledger()[0];
        assert!(trade.exit_time > trade.entry_time);
        assert_eq!(trade.entry_price, 100.0);
        assert_eq!(trade.exit_size, held);

        let persisted = TradeLedger::load(h.ledger_path()).unwrap();
        assert_eq!(persisted.len(), 1);
        assert_eq!(h.exchange.balance("BTC").await, 0.0);
    }

    #[tokio::test]
    async fn test_pending_buy_times_out_without_touching_position() {
        let mut h = harness(always_buy()).await;
        h.exchange.set_fills_enabled(false).await;

        assert!(matches!(h.tick().await, TickOutcome::OrderSubmitted { .. }));
        let id = pending_id(&h);

        // Elapsed 1..=5 minutes is within the timeout
        for _ in 0..5 {
            assert_eq!(h.tick().await, TickOutcome::StillPending);
            assert_eq!(pending_id(&h), id);
        }

        assert_eq!(
            h.tick().await,
            TickOutcome::Cancelled {
                side: Side::Buy,
                filled_size: 0.0
            }
        );
        assert_eq!(h.order_loop.state(), &OrderState::NoOrder);
        assert_eq!(h.order_loop.positions().capital(), 1000.0);
        assert_eq!(h.order_loop.positions().position_state(), PositionState::Flat);
        assert!(h.exchange.open_orders().await.is_empty());

        // Next tick re-evaluates and submits again
        assert!(matches!(h.tick().await, TickOutcome::OrderSubmitted { .. }));
        assert_ne!(pending_id(&h), id);
    }

    #[tokio::test]
    async fn test_fetch_failure_keeps_state() {
        let mut h = harness(always_buy()).await;
        h.exchange.set_fills_enabled(false).await;
        h.tick().await;
        let before = h.order_loop.state().clone();

        h.exchange.fail_next(PaperOperation::GetHistoricRates, 1).await;
        assert_eq!(h.tick().await, TickOutcome::DataUnavailable);
        assert_eq!(h.order_loop.state(), &before);
        assert_eq!(h.order_loop.positions().capital(), 1000.0);

        h.exchange.set_fills_enabled(true).await;
        assert_eq!(h.tick().await, TickOutcome::Filled(Side::Buy));
    }

    #[tokio::test]
    async fn test_query_failure_keeps_pending_order() {
        let mut h = harness(always_buy()).await;
        h.tick().await;
        let before = h.order_loop.state().clone();

        h.exchange.fail_next(PaperOperation::GetOrder, 1).await;
        assert_eq!(h.tick().await, TickOutcome::QueryFailed);
        assert_eq!(h.order_loop.state(), &before);
        assert!(!h.order_loop.positions().is_entered());

        assert_eq!(h.tick().await, TickOutcome::Filled(Side::Buy));
    }

    #[tokio::test]
    async fn test_submission_failure_returns_to_no_order() {
        let mut h = harness(always_buy()).await;
        h.exchange.fail_next(PaperOperation::PlaceOrder, 1).await;

        assert_eq!(h.tick().await, TickOutcome::SubmissionFailed(Side::Buy));
        assert_eq!(h.order_loop.state(), &OrderState::NoOrder);
        assert!(matches!(h.tick().await, TickOutcome::OrderSubmitted { .. }));
    }

    #[tokio::test]
    async fn test_cancel_failure_keeps_order_pending() {
        let mut h = harness(always_buy()).await;
        h.exchange.set_fills_enabled(false).await;
        h.tick().await;
        for _ in 0..5 {
            h.tick().await;
        }

        h.exchange.fail_next(PaperOperation::CancelOrder, 1).await;
        assert_eq!(h.tick().await, TickOutcome::CancelFailed);
        assert!(matches!(h.order_loop.state(), OrderState::Pending(_)));

        assert!(matches!(h.tick().await, TickOutcome::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_partial_buy_fill_is_applied_on_cancel() {
        let mut h = harness(always_buy()).await;
        h.exchange.set_fills_enabled(false).await;
        h.tick().await;
        let id = pending_id(&h);

        h.exchange.fill_partially(&id, 4.0).await.unwrap();
        for _ in 0..5 {
            assert_eq!(h.tick().await, TickOutcome::StillPending);
        }
        assert_eq!(
            h.tick().await,
            TickOutcome::Cancelled {
                side: Side::Buy,
                filled_size: 4.0
            }
        );

        let positions = h.order_loop.positions();
        assert!(positions.is_entered());
        assert_eq!(positions.held_size(), 4.0);
        assert_eq!(positions.capital(), 600.0);
    }

    #[tokio::test]
    async fn test_partial_sell_fill_reduces_position() {
        let positions = PositionManager::with_open_position("BTC-EUR", 0.0, 100.0, 2.0, start());
        let mut h = harness_with(
            Box::new(FixedStrategy {
                buy: false,
                sell: true,
            }),
            positions,
        )
        .await;
        h.exchange.deposit("BTC", 2.0).await;
        h.exchange.set_fills_enabled(false).await;

        assert!(matches!(h.tick().await, TickOutcome::OrderSubmitted { side: Side::Sell, .. }));
        h.exchange.fill_partially(&pending_id(&h), 0.5).await.unwrap();
        for _ in 0..6 {
            h.tick().await;
        }

        let positions = h.order_loop.positions();
        assert!(positions.is_entered());
        assert_eq!(positions.held_size(), 1.5);
        assert_eq!(positions.capital(), 50.0);
        assert!(positions.ledger().is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_cancels_pending_buy() {
        let mut h = harness(always_buy()).await;
        h.exchange.set_fills_enabled(false).await;
        h.tick().await;

        let now = h.exchange.now().await;
        h.order_loop.shutdown(now).await.unwrap();

        assert_eq!(h.order_loop.state(), &OrderState::NoOrder);
        assert!(h.exchange.open_orders().await.is_empty());
        assert!(!h.order_loop.positions().is_entered());
        assert_eq!(h.order_loop.positions().capital(), 1000.0);
    }

    #[tokio::test]
    async fn test_shutdown_liquidates_pending_sell() {
        let positions = PositionManager::with_open_position("BTC-EUR", 0.0, 90.0, 1.0, start());
        let mut h = harness_with(
            Box::new(FixedStrategy {
                buy: false,
                sell: true,
            }),
            positions,
        )
        .await;
        h.exchange.deposit("BTC", 1.0).await;
        h.exchange.set_fills_enabled(false).await;

        assert!(matches!(h.tick().await, TickOutcome::OrderSubmitted { side: Side::Sell, .. }));

        let now = h.exchange.now().await;
        h.order_loop.shutdown(now).await.unwrap();

        let positions = h.order_loop.positions();
        assert!(!positions.is_entered());
        assert_eq!(positions.ledger().len(), 1);
        assert_eq!(positions.ledger()[0].exit_price, 100.0);
        assert_eq!(h.exchange.balance("BTC").await, 0.0);
        assert!(h.exchange.open_orders().await.is_empty());
        assert_eq!(TradeLedger::load(h.ledger_path()).unwrap().len(), 1);
    }

    async fn entered_harness_with_pending_sell() -> Harness {
        let positions = PositionManager::with_open_position("BTC-EUR", 0.0, 90.0, 1.0, start());
        let mut h = harness_with(
            Box::new(FixedStrategy {
                buy: false,
                sell: true,
            }),
            positions,
        )
        .await;
        h.exchange.deposit("BTC", 1.0).await;
        h.exchange.set_fills_enabled(false).await;

        assert!(matches!(h.tick().await, TickOutcome::OrderSubmitted { side: Side::Sell, .. }));
        h
    }

    #[tokio::test]
    async fn test_unconfirmed_emergency_sell_keeps_position() {
        let mut h = entered_harness_with_pending_sell().await;
        h.exchange.set_market_fills_enabled(false).await;

        let now = h.exchange.now().await;
        h.order_loop.shutdown(now).await.unwrap();

        let positions = h.order_loop.positions();
        assert!(positions.is_entered());
        assert_eq!(positions.held_size(), 1.0);
        assert_eq!(positions.capital(), 0.0);
        assert!(positions.ledger().is_empty());
        assert!(!h.ledger_path().exists());

        // The exchange still holds the asset and the market order is visible
        assert_eq!(h.exchange.balance("BTC").await, 1.0);
        let open = h.exchange.open_orders().await;
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].side, Side::Sell);
    }

    #[tokio::test]
    async fn test_emergency_sell_query_failures_book_nothing() {
        let mut h = entered_harness_with_pending_sell().await;
        h.exchange.set_market_fills_enabled(false).await;
        // The final limit-order query and every market-order re-query fail
        h.exchange
            .fail_next(PaperOperation::GetOrder, 1 + EMERGENCY_SELL_QUERIES)
            .await;

        let now = h.exchange.now().await;
        h.order_loop.shutdown(now).await.unwrap();

        assert!(h.order_loop.positions().is_entered());
        assert_eq!(h.order_loop.positions().held_size(), 1.0);
        assert!(h.order_loop.positions().ledger().is_empty());
    }

    #[tokio::test]
    async fn test_partly_confirmed_emergency_sell_reduces_position() {
        let mut h = entered_harness_with_pending_sell().await;
        h.exchange.set_market_fills_enabled(false).await;
        let now = h.exchange.now().await;

        // paper-1 is the limit SELL, paper-2 the market SELL placed at shutdown
        let exchange = h.exchange.clone();
        let (result, _) = tokio::join!(h.order_loop.shutdown(now), async move {
            tokio::time::sleep(std::time::Duration::from_millis(100)).await;
            exchange.fill_partially("paper-2", 0.4).await.unwrap();
        });
        result.unwrap();

        let positions = h.order_loop.positions();
        assert!(positions.is_entered());
        assert!((positions.held_size() - 0.6).abs() < 1e-9);
        assert!((positions.capital() - 40.0).abs() < 1e-9);
        assert!(positions.ledger().is_empty());
        assert!((h.exchange.balance("BTC").await - 0.6).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_rejected_emergency_sell_still_flushes_and_returns_ok() {
        let mut h = entered_harness_with_pending_sell().await;
        h.exchange.fail_next(PaperOperation::PlaceOrder, 1).await;

        let now = h.exchange.now().await;
        h.order_loop.shutdown(now).await.unwrap();

        assert_eq!(h.order_loop.state(), &OrderState::NoOrder);
        let positions = h.order_loop.positions();
        assert!(positions.is_entered());
        assert_eq!(positions.held_size(), 1.0);
        assert_eq!(h.order_loop.ledger().persisted(), positions.ledger().len());
        assert_eq!(h.exchange.balance("BTC").await, 1.0);
        assert!(h.exchange.open_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_post_cancel_query_failure_books_fill_next_tick() {
        let mut h = harness(always_buy()).await;
        h.exchange.set_fills_enabled(false).await;
        h.tick().await;
        let id = pending_id(&h);
        h.exchange.fill_partially(&id, 3.0).await.unwrap();
        for _ in 0..5 {
            assert_eq!(h.tick().await, TickOutcome::StillPending);
        }

        // The status query passes, the cancel passes, the re-query after it fails
        h.exchange.fail_nth(PaperOperation::GetOrder, 2).await;
        assert_eq!(h.tick().await, TickOutcome::QueryFailed);
        assert_eq!(pending_id(&h), id);
        assert!(!h.order_loop.positions().is_entered());
        assert!(h.exchange.open_orders().await.is_empty());

        assert_eq!(
            h.tick().await,
            TickOutcome::Cancelled {
                side: Side::Buy,
                filled_size: 3.0
            }
        );
        assert_eq!(h.order_loop.state(), &OrderState::NoOrder);
        assert_eq!(h.order_loop.positions().held_size(), 3.0);
        assert_eq!(h.order_loop.positions().capital(), 700.0);
    }

    #[tokio::test]
    async fn test_run_stops_on_request_and_shuts_down() {
        let mut h = harness(always_buy()).await;
        h.exchange.set_fills_enabled(false).await;

        let deadline = Utc::now() + Duration::hours(1);
        h.order_loop.run(deadline, async {}).await.unwrap();

        // One tick placed an order, shutdown cancelled it
        assert_eq!(h.exchange.orders().await.len(), 1);
        assert!(h.exchange.open_orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_run_with_past_deadline_does_not_tick() {
        let mut h = harness(always_buy()).await;

        h.order_loop
            .run(Utc::now() - Duration::seconds(1), std::future::pending())
            .await
            .unwrap();
        assert!(h.exchange.orders().await.is_empty());
    }

    #[tokio::test]
    async fn test_initial_positions_from_accounts() {
        let exchange = PaperExchange::new("BTC-EUR", flat_tape(10), Duration::minutes(1), 750.0, 0.0);
        let mut config = BotConfig::default();
        config.trading.dry_run = true;

        let positions = initial_positions(&exchange, &config, start()).await.unwrap();
        assert_eq!(positions.capital(), 750.0);
        assert!(!positions.is_entered());

        config.trading.start_entered = true;
        config.trading.entry_price = Some(95.0);
        assert!(matches!(
            initial_positions(&exchange, &config, start()).await,
            Err(BotError::Configuration(_))
        ));

        exchange.deposit("BTC", 0.25).await;
        config.trading.capital = Some(10.0);
        let positions = initial_positions(&exchange, &config, start()).await.unwrap();
        assert_eq!(positions.capital(), 10.0);
        assert_eq!(positions.held_size(), 0.25);
        assert_eq!(positions.position_state().last_entry_price(), Some(95.0));
    }
}
