use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// OHLCV candlestick for one time bucket
///
/// Candles are keyed by `timestamp` (bucket start) and never mutated once stored.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// Decision returned by a strategy for the latest market state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum Action {
    Buy,
    Sell,
    NoTrade,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Buy => write!(f, "BUY"),
            Action::Sell => write!(f, "SELL"),
            Action::NoTrade => write!(f, "NO_TRADE"),
        }
    }
}

/// Whether capital is currently deployed in the asset
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub enum PositionState {
    Flat,
    Entered { last_entry_price: f64 },
}

impl PositionState {
    pub fn is_entered(&self) -> bool {
        matches!(self, PositionState::Entered { .. })
    }

    pub fn last_entry_price(&self) -> Option<f64> {
        match self {
            PositionState::Flat => None,
            PositionState::Entered { last_entry_price } => Some(*last_entry_price),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "buy",
            Side::Sell => "sell",
        }
    }
}

impl std::fmt::Display for Side {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum OrderStatus {
    Open,
    Filled,
    Canceled,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Limit,
    Market,
}

/// Exchange-side view of an order
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct OrderInfo {
    pub id: String,
    pub product_id: String,
    pub side: Side,
    pub order_type: OrderType,
    pub status: OrderStatus,
    /// Limit price; `None` for market orders
    pub price: Option<f64>,
    pub size: f64,
    pub filled_size: f64,
    pub fill_fees: f64,
    /// Quote currency value of the filled part
    pub executed_value: f64,
    pub created_at: DateTime<Utc>,
}

impl OrderInfo {
    /// Average execution price of the filled part, falling back to the limit price
    pub fn average_fill_price(&self) -> Option<f64> {
        if self.filled_size > 0.0 && self.executed_value > 0.0 {
            Some(self.executed_value / self.filled_size)
        } else {
            self.price
        }
    }
}

/// Raw historic-rates row: `[time, low, high, open, close, volume]`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HistoricRate {
    pub time: i64,
    pub low: f64,
    pub high: f64,
    pub open: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Account {
    pub currency: String,
    pub balance: f64,
    pub available: f64,
}

/// One completed round trip (entry + exit)
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TradeRecord {
    pub product_id: String,
    pub entry_time: DateTime<Utc>,
    pub entry_price: f64,
    pub entry_size: f64,
    pub entry_order_id: Option<String>,
    pub exit_time: DateTime<Utc>,
    pub exit_price: f64,
    pub exit_size: f64,
    pub exit_order_id: Option<String>,
    pub start_capital: f64,
    pub end_capital: f64,
    /// Quote currency gained on the round trip (after fees)
    pub profit: f64,
    /// (exit_price - entry_price) / entry_price
    pub return_pct: f64,
}

impl TradeRecord {
    pub fn is_win(&self) -> bool {
        self.exit_price > self.entry_price
    }

    pub fn holding_period_minutes(&self) -> i64 {
        (self.exit_time - self.entry_time).num_minutes()
    }
}
