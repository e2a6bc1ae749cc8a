use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::api::coinbase::COINBASE_API_BASE;
use crate::error::{BotError, Result};
use crate::strategy::{PriceDirectionConfig, RsiSmaReturnConfig};

/// Candle sizes the Coinbase candles endpoint accepts
pub const SUPPORTED_GRANULARITIES: [u32; 6] = [60, 300, 900, 3600, 21600, 86400];

/// Upper bound of every configured interval, about ten years
pub const MAX_INTERVAL_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Environment variable prefix, e.g. `COINBOT_MARKET__SYMBOL=ETH-EUR`
pub const ENV_PREFIX: &str = "COINBOT";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    pub exchange: ExchangeConfig,
    pub market: MarketConfig,
    pub trading: TradingConfig,
    pub strategy: StrategySettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub api_key: Option<String>,
    /// Base64 secret as issued by Coinbase
    pub api_secret: Option<String>,
    pub passphrase: Option<String>,
    pub base_url: String,
    /// Row cap of one historic-rates request
    pub max_rows_per_request: usize,
    pub requests_per_second: u32,
    pub request_timeout_secs: u64,
    /// Decimals sent for limit prices (quote increment of the product)
    pub price_decimals: usize,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            api_secret: None,
            passphrase: None,
            base_url: COINBASE_API_BASE.to_string(),
            max_rows_per_request: 300,
            requests_per_second: 3,
            request_timeout_secs: 30,
            price_decimals: 2,
        }
    }
}

impl ExchangeConfig {
    pub fn has_credentials(&self) -> bool {
        self.api_key.is_some() && self.api_secret.is_some() && self.passphrase.is_some()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MarketConfig {
    /// Product id, e.g. "BTC-EUR"
    pub symbol: String,
    pub granularity_secs: u32,
    /// History loaded at start-up
    pub lookback_minutes: i64,
}

impl Default for MarketConfig {
    fn default() -> Self {
        Self {
            symbol: "BTC-EUR".to_string(),
            granularity_secs: 60,
            lookback_minutes: 24 * 60,
        }
    }
}

impl MarketConfig {
    pub fn base_currency(&self) -> &str {
        self.symbol.split('-').next().unwrap_or(&self.symbol)
    }

    pub fn quote_currency(&self) -> &str {
        self.symbol.split('-').nth(1).unwrap_or("")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TradingConfig {
    pub poll_interval_secs: u64,
    /// Wall-clock budget of one run
    pub running_time_secs: u64,
    /// Open orders older than this are cancelled
    pub cancel_timeout_secs: u64,
    /// Minimum tolerated close / entry price ratio
    pub stop_loss: f64,
    /// BUY limit = close * buy_price_factor
    pub buy_price_factor: f64,
    /// SELL limit = close * sell_price_factor
    pub sell_price_factor: f64,
    /// Fraction of capital spent on a BUY, leaves room for fees
    pub size_buffer: f64,
    /// Start with a position already open
    pub start_entered: bool,
    pub entry_price: Option<f64>,
    /// Quote capital; read from the exchange accounts when absent
    pub capital: Option<f64>,
    /// Trade against the simulated exchange
    pub dry_run: bool,
    /// Fee rate of the simulated exchange
    pub paper_fee_rate: f64,
    pub ledger_path: PathBuf,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 60,
            running_time_secs: 24 * 60 * 60,
            cancel_timeout_secs: 10 * 60,
            stop_loss: 0.95,
            buy_price_factor: 0.97,
            sell_price_factor: 1.0,
            size_buffer: 0.995,
            start_entered: false,
            entry_price: None,
            capital: None,
            dry_run: false,
            paper_fee_rate: 0.005,
            ledger_path: PathBuf::from("trades.csv"),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    #[default]
    RsiSmaReturn,
    PriceDirection,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategySettings {
    pub kind: StrategyKind,
    pub rsi_sma_return: RsiSmaReturnConfig,
    /// Required when `kind = "price_direction"`
    pub price_direction: Option<PriceDirectionConfig>,
}

impl BotConfig {
    /// Defaults, then the optional TOML file, then `COINBOT_*` environment variables
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = Self::from_sources(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Same layering as `load` without validation, for callers that apply overrides first
    pub fn from_sources(path: Option<&Path>) -> Result<Self> {
        dotenvy::dotenv().ok();

        let file = path.unwrap_or_else(|| Path::new("coinbot.toml"));
        let settings = config::Config::builder()
            .add_source(config::File::from(file).required(path.is_some()))
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    pub fn validate(&self) -> Result<()> {
        let fail = |msg: String| Err(BotError::Configuration(msg));

        if self.market.symbol.trim().is_empty() || !self.market.symbol.contains('-') {
            return fail(format!(
                "market.symbol must look like BASE-QUOTE, got '{}'",
                self.market.symbol
            ));
        }
        if !SUPPORTED_GRANULARITIES.contains(&self.market.granularity_secs) {
            return fail(format!(
                "market.granularity_secs must be one of {:?}, got {}",
                SUPPORTED_GRANULARITIES, self.market.granularity_secs
            ));
        }
        if self.market.lookback_minutes <= 0
            || self.market.lookback_minutes as u64 > MAX_INTERVAL_SECS / 60
        {
            return fail(format!(
                "market.lookback_minutes must be in 1..={}, got {}",
                MAX_INTERVAL_SECS / 60,
                self.market.lookback_minutes
            ));
        }
        if self.exchange.max_rows_per_request == 0 {
            return fail("exchange.max_rows_per_request must be positive".to_string());
        }

        let trading = &self.trading;
        for (name, secs) in [
            ("poll_interval_secs", trading.poll_interval_secs),
            ("running_time_secs", trading.running_time_secs),
            ("cancel_timeout_secs", trading.cancel_timeout_secs),
        ] {
            if secs == 0 || secs > MAX_INTERVAL_SECS {
                return fail(format!(
                    "trading.{} must be in 1..={}, got {}",
                    name, MAX_INTERVAL_SECS, secs
                ));
            }
        }
        if !(trading.stop_loss > 0.0 && trading.stop_loss <= 1.0) {
            return fail(format!(
                "trading.stop_loss must be in (0, 1], got {}",
                trading.stop_loss
            ));
        }
        for (name, factor) in [
            ("buy_price_factor", trading.buy_price_factor),
            ("sell_price_factor", trading.sell_price_factor),
        ] {
            if !(factor.is_finite() && factor > 0.0) {
                return fail(format!("trading.{} must be positive, got {}", name, factor));
            }
        }
        if !(trading.size_buffer > 0.0 && trading.size_buffer <= 1.0) {
            return fail(format!(
                "trading.size_buffer must be in (0, 1], got {}",
                trading.size_buffer
            ));
        }
        if trading.capital.is_some_and(|c| !(c.is_finite() && c >= 0.0)) {
            return fail("trading.capital must be non-negative".to_string());
        }
        if trading.start_entered && !trading.entry_price.is_some_and(|p| p > 0.0) {
            return fail("trading.start_entered requires a positive trading.entry_price".to_string());
        }
        if !trading.dry_run && !self.exchange.has_credentials() {
            return fail(
                "exchange api_key, api_secret and passphrase are required unless trading.dry_run is set"
                    .to_string(),
            );
        }

        if self.strategy.kind == StrategyKind::PriceDirection {
            match &self.strategy.price_direction {
                None => {
                    return fail(
                        "strategy.price_direction settings are required for the price_direction strategy"
                            .to_string(),
                    )
                }
                Some(pd) if pd.first_training_date > pd.last_training_date => {
                    return fail("strategy.price_direction training window is empty".to_string())
                }
                Some(_) => {}
            }
        }

        Ok(())
    }
}
