use super::{MarketState, Strategy};
use serde::{Deserialize, Serialize};

/// Thresholds for the RSI / SMA / cumulative-return strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RsiSmaReturnConfig {
    /// Buy if RSI < rsi_buy
    pub rsi_buy: f64,
    /// Sell if RSI > rsi_sell
    pub rsi_sell: f64,
    /// Buy if the 60-row cumulative return product > returns_buy
    pub returns_buy: f64,
}

impl Default for RsiSmaReturnConfig {
    fn default() -> Self {
        Self {
            rsi_buy: 40.0,
            rsi_sell: 70.0,
            returns_buy: 1.0,
        }
    }
}

/// Threshold rules on RSI, SMA and cumulative returns
///
/// Entry (ALL must hold):
/// - close above SMA60 (uptrend)
/// - RSI below `rsi_buy` (short-term dip)
/// - 60-row cumulative return above `returns_buy` (positive momentum)
///
/// Exit: RSI above `rsi_sell`.
#[derive(Debug, Clone, Default)]
pub struct RsiSmaReturnStrategy {
    config: RsiSmaReturnConfig,
}

impl RsiSmaReturnStrategy {
    pub fn new(config: RsiSmaReturnConfig) -> Self {
        Self { config }
    }
}

impl Strategy for RsiSmaReturnStrategy {
    fn name(&self) -> &str {
        "RsiSmaReturn"
    }

    fn buy_signal(&self, market: &MarketState<'_>) -> bool {
        let Some(row) = market.latest() else {
            return false;
        };

        let (Some(sma_60), Some(rsi), Some(cum_returns_60)) =
            (row.sma_60, row.rsi, row.cum_returns_60)
        else {
            return false;
        };

        let signal = row.close() > sma_60
            && rsi < self.config.rsi_buy
            && cum_returns_60 > self.config.returns_buy;

        tracing::debug!(
            close = row.close(),
            sma_60,
            rsi,
            cum_returns_60,
            signal,
            "RsiSmaReturn entry check"
        );

        signal
    }

    fn sell_signal(&self, market: &MarketState<'_>) -> bool {
        market
            .latest()
            .and_then(|row| row.rsi)
            .is_some_and(|rsi| rsi > self.config.rsi_sell)
    }
}
