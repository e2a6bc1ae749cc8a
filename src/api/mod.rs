// Exchange access: the client capability plus the Coinbase and simulated implementations
pub mod coinbase;
pub mod paper;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::models::{Account, HistoricRate, OrderInfo, Side};

pub use coinbase::CoinbaseClient;
pub use paper::{PaperExchange, PaperOperation};

/// Operations the bot needs from an exchange
///
/// `CoinbaseClient` talks to the live REST API, `PaperExchange` simulates one
/// in memory. The feed and the order loop receive an implementation at
/// construction and never look one up themselves.
///
/// Error kinds per operation:
/// - `get_historic_rates` -> `BotError::Fetch`
/// - `get_order` -> `BotError::OrderQuery`, or `BotError::OrderNotFound`
/// - `place_*` -> `BotError::OrderSubmission`
/// - `cancel_order` -> `BotError::OrderCancel`
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    /// Exchange server time
    async fn get_time(&self) -> Result<DateTime<Utc>>;

    /// Candles in `[start, end)`, at most one exchange page; order is not guaranteed
    async fn get_historic_rates(
        &self,
        product_id: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        granularity_secs: u32,
    ) -> Result<Vec<HistoricRate>>;

    async fn get_order(&self, order_id: &str) -> Result<OrderInfo>;

    async fn place_limit_order(
        &self,
        product_id: &str,
        side: Side,
        price: f64,
        size: f64,
    ) -> Result<OrderInfo>;

    async fn place_market_order(&self, product_id: &str, side: Side, size: f64)
        -> Result<OrderInfo>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;

    async fn get_accounts(&self) -> Result<Vec<Account>>;
}
