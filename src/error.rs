use chrono::{DateTime, Utc};
use thiserror::Error;

/// Half-open time range `[start, end)` of a historic-rates request
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FetchRange {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl std::fmt::Display for FetchRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} .. {}",
            self.start.format("%Y-%m-%d %H:%M:%S"),
            self.end.format("%Y-%m-%d %H:%M:%S")
        )
    }
}

#[derive(Debug, Error)]
pub enum BotError {
    /// Candle retrieval failed or returned malformed rows
    #[error("Fetch failed for range {range}: {reason}")]
    Fetch { range: FetchRange, reason: String },

    #[error("Order submission rejected: {0}")]
    OrderSubmission(String),

    #[error("Order status query failed for {order_id}: {reason}")]
    OrderQuery { order_id: String, reason: String },

    /// The exchange no longer knows the order (Coinbase purges cancelled, unfilled orders)
    #[error("Order {0} not found")]
    OrderNotFound(String),

    #[error("Order cancellation failed for {order_id}: {reason}")]
    OrderCancel { order_id: String, reason: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Exchange API error: {0}")]
    Exchange(String),

    #[error("Malformed exchange response: {0}")]
    Decode(String),

    #[error("Trade ledger error: {0}")]
    Ledger(String),

    #[error("Strategy error: {0}")]
    Strategy(String),

    /// A fill was applied against the wrong position state
    #[error("Invalid position transition: {0}")]
    Position(String),
}

impl From<std::io::Error> for BotError {
    fn from(e: std::io::Error) -> Self {
        BotError::Ledger(e.to_string())
    }
}

impl From<csv::Error> for BotError {
    fn from(e: csv::Error) -> Self {
        BotError::Ledger(e.to_string())
    }
}

impl From<serde_json::Error> for BotError {
    fn from(e: serde_json::Error) -> Self {
        BotError::Decode(e.to_string())
    }
}

impl From<config::ConfigError> for BotError {
    fn from(e: config::ConfigError) -> Self {
        BotError::Configuration(e.to_string())
    }
}

pub type Result<T, E = BotError> = std::result::Result<T, E>;
