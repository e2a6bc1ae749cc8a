use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{BTreeMap, HashMap, VecDeque};
use tokio::sync::Mutex;
use tracing::{debug, info};

use super::ExchangeClient;
use crate::error::{BotError, FetchRange, Result};
use crate::models::{Account, Candle, HistoricRate, OrderInfo, OrderStatus, OrderType, Side};

/// Operations that can be made to fail on purpose
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaperOperation {
    GetTime,
    GetHistoricRates,
    GetOrder,
    PlaceOrder,
    CancelOrder,
    GetAccounts,
}

struct PaperState {
    /// Sorted by timestamp
    tape: Vec<Candle>,
    now: DateTime<Utc>,
    balances: HashMap<String, f64>,
    orders: BTreeMap<String, OrderInfo>,
    next_order_id: u64,
    /// Upcoming calls per operation, `true` for the ones that fail
    failures: HashMap<PaperOperation, VecDeque<bool>>,
    fills_enabled: bool,
    market_fills_enabled: bool,
}

/// Simulated exchange replaying a candle tape against a settable clock
///
/// Limit BUYs fill at their limit once a candle after submission trades at
/// or below it, limit SELLs once a candle trades at or above it. Market
/// orders fill immediately at the last close unless held back with
/// `set_market_fills_enabled`, in which case they stay open until released.
/// Like Coinbase, a cancelled
/// order with no fill is forgotten and later queries report it not found.
pub struct PaperExchange {
    product_id: String,
    base_currency: String,
    quote_currency: String,
    granularity: Duration,
    fee_rate: f64,
    max_rows_per_request: usize,
    state: Mutex<PaperState>,
}

impl PaperExchange {
    pub fn new(
        product_id: &str,
        tape: Vec<Candle>,
        granularity: Duration,
        quote_balance: f64,
        fee_rate: f64,
    ) -> Self {
        let mut tape = tape;
        tape.sort_by_key(|c| c.timestamp);

        let (base_currency, quote_currency) = match product_id.split_once('-') {
            Some((base, quote)) => (base.to_string(), quote.to_string()),
            None => (product_id.to_string(), "USD".to_string()),
        };

        // Start right after the last candle closes
        let now = tape
            .last()
            .map(|c| c.timestamp + granularity)
            .unwrap_or_else(Utc::now);

        let mut balances = HashMap::new();
        balances.insert(quote_currency.clone(), quote_balance);
        balances.insert(base_currency.clone(), 0.0);

        info!(
            product = product_id,
            candles = tape.len(),
            quote_balance,
            fee_rate,
            "PaperExchange initialized"
        );

        Self {
            product_id: product_id.to_string(),
            base_currency,
            quote_currency,
            granularity,
            fee_rate,
            max_rows_per_request: 300,
            state: Mutex::new(PaperState {
                tape,
                now,
                balances,
                orders: BTreeMap::new(),
                next_order_id: 1,
                failures: HashMap::new(),
                fills_enabled: true,
                market_fills_enabled: true,
            }),
        }
    }

    pub fn with_max_rows_per_request(mut self, max_rows: usize) -> Self {
        self.max_rows_per_request = max_rows.max(1);
        self
    }

    pub fn product_id(&self) -> &str {
        &self.product_id
    }

    pub async fn now(&self) -> DateTime<Utc> {
        self.state.lock().await.now
    }

    pub async fn set_time(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().await;
        state.now = now;
        self.settle(&mut state);
    }

    pub async fn advance(&self, by: Duration) -> DateTime<Utc> {
        let mut state = self.state.lock().await;
        state.now += by;
        self.settle(&mut state);
        state.now
    }

    /// Append candles to the tape
    pub async fn push_candles(&self, candles: impl IntoIterator<Item = Candle>) {
        let mut state = self.state.lock().await;
        state.tape.extend(candles);
        state.tape.sort_by_key(|c| c.timestamp);
    }

    /// Make the next `count` calls of `operation` fail
    pub async fn fail_next(&self, operation: PaperOperation, count: usize) {
        self.state
            .lock()
            .await
            .failures
            .insert(operation, std::iter::repeat(true).take(count).collect());
    }

    /// Let `n - 1` calls of `operation` through, then fail the next one
    pub async fn fail_nth(&self, operation: PaperOperation, n: usize) {
        let mut schedule: VecDeque<bool> = std::iter::repeat(false).take(n.saturating_sub(1)).collect();
        schedule.push_back(true);
        self.state.lock().await.failures.insert(operation, schedule);
    }

    /// When disabled, limit orders stay open regardless of price
    pub async fn set_fills_enabled(&self, enabled: bool) {
        self.state.lock().await.fills_enabled = enabled;
    }

    /// When disabled, market orders are accepted but stay open and unfilled
    pub async fn set_market_fills_enabled(&self, enabled: bool) {
        let mut state = self.state.lock().await;
        state.market_fills_enabled = enabled;
        self.settle(&mut state);
    }

    /// Fill `size` of an open order at its limit price, or the last close for market orders
    pub async fn fill_partially(&self, order_id: &str, size: f64) -> Result<()> {
        let mut state = self.state.lock().await;
        let order = state
            .orders
            .get(order_id)
            .cloned()
            .ok_or_else(|| BotError::OrderNotFound(order_id.to_string()))?;

        if order.status != OrderStatus::Open {
            return Err(BotError::Exchange(format!("Order {} is not open", order_id)));
        }
        let size = size.min(order.size - order.filled_size);
        let price = order
            .price
            .or_else(|| Self::last_price(&state))
            .ok_or_else(|| BotError::Exchange("No market price available".to_string()))?;
        self.apply_fill(&mut state, order_id, price, size);
        Ok(())
    }

    /// Credit a balance, e.g. base currency held from before the run
    pub async fn deposit(&self, currency: &str, amount: f64) {
        let mut state = self.state.lock().await;
        *state.balances.entry(currency.to_string()).or_default() += amount;
    }

    pub async fn balance(&self, currency: &str) -> f64 {
        let state = self.state.lock().await;
        state.balances.get(currency).copied().unwrap_or(0.0)
    }

    pub async fn orders(&self) -> Vec<OrderInfo> {
        self.state.lock().await.orders.values().cloned().collect()
    }

    pub async fn open_orders(&self) -> Vec<OrderInfo> {
        self.orders()
            .await
            .into_iter()
            .filter(|o| o.status == OrderStatus::Open)
            .collect()
    }

    fn take_failure(state: &mut PaperState, operation: PaperOperation) -> bool {
        state
            .failures
            .get_mut(&operation)
            .and_then(VecDeque::pop_front)
            .unwrap_or(false)
    }

    /// Last close at or before the clock
    fn last_price(state: &PaperState) -> Option<f64> {
        state
            .tape
            .iter()
            .rev()
            .find(|c| c.timestamp <= state.now)
            .map(|c| c.close)
    }

    fn apply_fill(&self, state: &mut PaperState, order_id: &str, price: f64, size: f64) {
        let Some(order) = state.orders.get_mut(order_id) else {
            return;
        };
        if size <= 0.0 {
            return;
        }

        let notional = price * size;
        let fee = notional * self.fee_rate;
        order.filled_size += size;
        order.executed_value += notional;
        order.fill_fees += fee;
        if order.filled_size + 1e-12 >= order.size {
            order.status = OrderStatus::Filled;
        }
        let side = order.side;

        let (base, quote) = (self.base_currency.clone(), self.quote_currency.clone());
        match side {
            Side::Buy => {
                *state.balances.entry(quote).or_default() -= notional + fee;
                *state.balances.entry(base).or_default() += size;
            }
            Side::Sell => {
                *state.balances.entry(base).or_default() -= size;
                *state.balances.entry(quote).or_default() += notional - fee;
            }
        }

        debug!(order_id, ?side, price, size, fee, "Paper fill");
    }

    /// Fill released market orders, then limit orders whose price was touched after submission
    fn settle(&self, state: &mut PaperState) {
        if state.market_fills_enabled {
            if let Some(price) = Self::last_price(state) {
                let waiting: Vec<(String, f64)> = state
                    .orders
                    .values()
                    .filter(|o| o.status == OrderStatus::Open && o.order_type == OrderType::Market)
                    .map(|o| (o.id.clone(), o.size - o.filled_size))
                    .collect();
                for (id, remaining) in waiting {
                    self.apply_fill(state, &id, price, remaining);
                }
            }
        }

        if !state.fills_enabled {
            return;
        }

        let now = state.now;
        let touched: Vec<(String, f64, f64)> = state
            .orders
            .values()
            .filter(|o| o.status == OrderStatus::Open && o.order_type == OrderType::Limit)
            .filter_map(|o| {
                let limit = o.price?;
                let hit = state
                    .tape
                    .iter()
                    .filter(|c| c.timestamp >= o.created_at && c.timestamp < now)
                    .any(|c| match o.side {
                        Side::Buy => c.low <= limit,
                        Side::Sell => c.high >= limit,
                    });
                hit.then(|| (o.id.clone(), limit, o.size - o.filled_size))
            })
            .collect();

        for (id, price, remaining) in touched {
            self.apply_fill(state, &id, price, remaining);
        }
    }

    fn check_funds(&self, state: &PaperState, side: Side, price: f64, size: f64) -> Result<()> {
        let (currency, needed) = match side {
            Side::Buy => (&self.quote_currency, price * size * (1.0 + self.fee_rate)),
            Side::Sell => (&self.base_currency, size),
        };
        let available = state.balances.get(currency).copied().unwrap_or(0.0);
        if needed > available + 1e-9 {
            return Err(BotError::OrderSubmission(format!(
                "Insufficient funds: need {:.8} {}, have {:.8}",
                needed, currency, available
            )));
        }
        Ok(())
    }

    fn new_order(
        &self,
        state: &mut PaperState,
        product_id: &str,
        side: Side,
        order_type: OrderType,
        price: Option<f64>,
        size: f64,
    ) -> Result<OrderInfo> {
        if product_id != self.product_id {
            return Err(BotError::OrderSubmission(format!(
                "Unknown product {}",
                product_id
            )));
        }
        if !(size.is_finite() && size > 0.0) {
            return Err(BotError::OrderSubmission(format!("Invalid size {}", size)));
        }

        let id = format!("paper-{}", state.next_order_id);
        state.next_order_id += 1;

        let order = OrderInfo {
            id: id.clone(),
            product_id: product_id.to_string(),
            side,
            order_type,
            status: OrderStatus::Open,
            price,
            size,
            filled_size: 0.0,
            fill_fees: 0.0,
            executed_value: 0.0,
            created_at: state.now,
        };
        state.orders.insert(id, order.clone());
        Ok(order)
    }
}

#[async_trait]
impl ExchangeClient for PaperExchange {
    async fn get_time(&self) -> Result<DateTime<Utc>> {
        let mut state = self.state.lock().await;
        if Self::take_failure(&mut state, PaperOperation::GetTime) {
            return Err(BotError::Exchange("Injected get_time failure".to_string()));
        }
        Ok(state.now)
    }

    async fn get_historic_rates(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity_secs: u32,
    ) -> Result<Vec<HistoricRate>> {
        let mut state = self.state.lock().await;
        let range = FetchRange { start, end };

        if Self::take_failure(&mut state, PaperOperation::GetHistoricRates) {
            return Err(BotError::Fetch {
                range,
                reason: "Injected historic rates failure".to_string(),
            });
        }
        if product_id != self.product_id
            || i64::from(granularity_secs) != self.granularity.num_seconds()
        {
            return Err(BotError::Fetch {
                range,
                reason: format!("Unsupported product/granularity {} {}", product_id, granularity_secs),
            });
        }

        let requested = (end - start).num_seconds() / i64::from(granularity_secs.max(1));
        if requested > self.max_rows_per_request as i64 {
            return Err(BotError::Fetch {
                range,
                reason: format!(
                    "Requested {} candles, limit is {}",
                    requested, self.max_rows_per_request
                ),
            });
        }

        // Newest first, the still-forming bucket included
        let now = state.now;
        Ok(state
            .tape
            .iter()
            .rev()
            .filter(|c| c.timestamp >= start && c.timestamp < end && c.timestamp <= now)
            .map(|c| HistoricRate {
                time: c.timestamp.timestamp(),
                low: c.low,
                high: c.high,
                open: c.open,
                close: c.close,
                volume: c.volume,
            })
            .collect())
    }

    async fn get_order(&self, order_id: &str) -> Result<OrderInfo> {
        let mut state = self.state.lock().await;
        if Self::take_failure(&mut state, PaperOperation::GetOrder) {
            return Err(BotError::OrderQuery {
                order_id: order_id.to_string(),
                reason: "Injected get_order failure".to_string(),
            });
        }
        self.settle(&mut state);

        match state.orders.get(order_id) {
            Some(order) if order.status == OrderStatus::Canceled && order.filled_size == 0.0 => {
                Err(BotError::OrderNotFound(order_id.to_string()))
            }
            Some(order) => Ok(order.clone()),
            None => Err(BotError::OrderNotFound(order_id.to_string())),
        }
    }

    async fn place_limit_order(
        &self,
        product_id: &str,
        side: Side,
        price: f64,
        size: f64,
    ) -> Result<OrderInfo> {
        let mut state = self.state.lock().await;
        if Self::take_failure(&mut state, PaperOperation::PlaceOrder) {
            return Err(BotError::OrderSubmission(
                "Injected order placement failure".to_string(),
            ));
        }
        if !(price.is_finite() && price > 0.0) {
            return Err(BotError::OrderSubmission(format!("Invalid price {}", price)));
        }
        self.check_funds(&state, side, price, size)?;

        let order = self.new_order(&mut state, product_id, side, OrderType::Limit, Some(price), size)?;
        info!(id = %order.id, %side, price, size, "Paper limit order placed");
        Ok(order)
    }

    async fn place_market_order(
        &self,
        product_id: &str,
        side: Side,
        size: f64,
    ) -> Result<OrderInfo> {
        let mut state = self.state.lock().await;
        if Self::take_failure(&mut state, PaperOperation::PlaceOrder) {
            return Err(BotError::OrderSubmission(
                "Injected order placement failure".to_string(),
            ));
        }
        let price = Self::last_price(&state).ok_or_else(|| {
            BotError::OrderSubmission("No market price available".to_string())
        })?;
        self.check_funds(&state, side, price, size)?;

        let order = self.new_order(&mut state, product_id, side, OrderType::Market, None, size)?;
        if state.market_fills_enabled {
            self.apply_fill(&mut state, &order.id, price, size);
            info!(id = %order.id, %side, price, size, "Paper market order filled");
        } else {
            info!(id = %order.id, %side, size, "Paper market order held open");
        }

        state
            .orders
            .get(&order.id)
            .cloned()
            .ok_or_else(|| BotError::OrderNotFound(order.id.clone()))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        if Self::take_failure(&mut state, PaperOperation::CancelOrder) {
            return Err(BotError::OrderCancel {
                order_id: order_id.to_string(),
                reason: "Injected cancel failure".to_string(),
            });
        }
        self.settle(&mut state);

        let order = state
            .orders
            .get_mut(order_id)
            .ok_or_else(|| BotError::OrderCancel {
                order_id: order_id.to_string(),
                reason: "Order not found".to_string(),
            })?;

        if order.status != OrderStatus::Open {
            return Err(BotError::OrderCancel {
                order_id: order_id.to_string(),
                reason: "Order already done".to_string(),
            });
        }

        order.status = OrderStatus::Canceled;
        info!(order_id, filled = order.filled_size, "Paper order cancelled");
        Ok(())
    }

    async fn get_accounts(&self) -> Result<Vec<Account>> {
        let mut state = self.state.lock().await;
        if Self::take_failure(&mut state, PaperOperation::GetAccounts) {
            return Err(BotError::Exchange("Injected get_accounts failure".to_string()));
        }

        let mut accounts: Vec<Account> = state
            .balances
            .iter()
            .map(|(currency, balance)| Account {
                currency: currency.clone(),
                balance: *balance,
                available: *balance,
            })
            .collect();
        accounts.sort_by(|a, b| a.currency.cmp(&b.currency));
        Ok(accounts)
    }
}
