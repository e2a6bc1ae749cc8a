// Trading strategy module
pub mod price_direction;
pub mod rsi_sma_return;

use crate::config::{StrategyKind, StrategySettings};
use crate::error::{BotError, Result};
use crate::indicators::IndicatorRow;
use crate::models::{Action, PositionState};

pub use price_direction::{PriceDirectionConfig, PriceDirectionStrategy};
pub use rsi_sma_return::{RsiSmaReturnConfig, RsiSmaReturnStrategy};

/// Market state visible to a strategy at one decision point
///
/// Holds the indicator history up to and including the current row and
/// nothing after it.
#[derive(Debug, Clone, Copy)]
pub struct MarketState<'a> {
    rows: &'a [IndicatorRow],
}

impl<'a> MarketState<'a> {
    pub fn new(rows: &'a [IndicatorRow]) -> Self {
        Self { rows }
    }

    /// Most recent row, `None` on an empty history
    pub fn latest(&self) -> Option<&'a IndicatorRow> {
        self.rows.last()
    }

    /// Full trailing window
    pub fn rows(&self) -> &'a [IndicatorRow] {
        self.rows
    }
}

/// Buy/sell predicates supplied by a strategy variant
///
/// The decision policy built on top of them lives in [`StrategyEngine`] and
/// cannot be changed by a variant.
pub trait Strategy: Send + Sync {
    /// Get strategy name
    fn name(&self) -> &str;

    /// Whether to enter a position now
    fn buy_signal(&self, market: &MarketState<'_>) -> bool;

    /// Whether to exit the current position now
    fn sell_signal(&self, market: &MarketState<'_>) -> bool;
}

/// Applies the fixed decision policy over a strategy's predicates
///
/// - flat and buy signal -> BUY
/// - entered and sell signal -> SELL
/// - entered and close / last entry price below the stop-loss ratio -> SELL
/// - otherwise -> NO_TRADE
pub struct StrategyEngine {
    strategy: Box<dyn Strategy>,
    stop_loss: f64,
}

impl StrategyEngine {
    /// `stop_loss` is the minimum tolerated ratio of current price to entry price (e.g. 0.95)
    pub fn new(strategy: Box<dyn Strategy>, stop_loss: f64) -> Self {
        Self {
            strategy,
            stop_loss,
        }
    }

    pub fn strategy_name(&self) -> &str {
        self.strategy.name()
    }

    pub fn stop_loss(&self) -> f64 {
        self.stop_loss
    }

    pub fn action(&self, market: &MarketState<'_>, position: &PositionState) -> Action {
        let Some(row) = market.latest() else {
            return Action::NoTrade;
        };

        match position {
            PositionState::Flat => {
                if self.strategy.buy_signal(market) {
                    return Action::Buy;
                }
            }
            PositionState::Entered { last_entry_price } => {
                if self.strategy.sell_signal(market) {
                    return Action::Sell;
                }

                if *last_entry_price > 0.0 {
                    let price_change_since_entry = row.close() / last_entry_price;
                    if price_change_since_entry < self.stop_loss {
                        tracing::info!(
                            strategy = self.strategy.name(),
                            close = row.close(),
                            entry = last_entry_price,
                            ratio = price_change_since_entry,
                            "🛑 Stop loss triggered"
                        );
                        return Action::Sell;
                    }
                }
            }
        }

        Action::NoTrade
    }
}

/// Build the configured strategy behind the stop-loss policy
///
/// `training` must cover the price-direction training window when that
/// variant is selected; the rule-based variant ignores it.
pub fn build_engine(
    settings: &StrategySettings,
    stop_loss: f64,
    training: &[IndicatorRow],
) -> Result<StrategyEngine> {
    let strategy: Box<dyn Strategy> = match settings.kind {
        StrategyKind::RsiSmaReturn => {
            Box::new(RsiSmaReturnStrategy::new(settings.rsi_sma_return.clone()))
        }
        StrategyKind::PriceDirection => {
            let config = settings.price_direction.clone().ok_or_else(|| {
                BotError::Configuration("price_direction settings missing".to_string())
            })?;
            Box::new(PriceDirectionStrategy::train(training, config)?)
        }
    };

    tracing::info!(strategy = strategy.name(), stop_loss, "Strategy ready");
    Ok(StrategyEngine::new(strategy, stop_loss))
}


#[cfg(test)]
mod tests {
    use super::testing::FixedStrategy;
    use super::*;
    use crate::indicators::compute_indicators;
    use crate::models::Candle;
    use chrono::Utc;

    fn rows_with_close(close: f64) -> Vec<IndicatorRow> {
        compute_indicators(&[Candle {
            timestamp: Utc::now(),
            open: close,
            high: close,
            low: close,
            close,
            volume: 1.0,
        }])
    }

    fn engine(buy: bool, sell: bool) -> StrategyEngine {
        StrategyEngine::new(Box::new(FixedStrategy { buy, sell }), 0.95)
    }

    #[test]
    fn test_buy_only_when_flat() {
        let rows = rows_with_close(100.0);
        let market = MarketState::new(&rows);

        assert_eq!(engine(true, false).action(&market, &PositionState::Flat), Action::Buy);
        let entered = PositionState::Entered {
            last_entry_price: 100.0,
        };
        assert_eq!(engine(true, false).action(&market, &entered), Action::NoTrade);
    }

    #[test]
    fn test_sell_only_when_entered() {
        let rows = rows_with_close(100.0);
        let market = MarketState::new(&rows);

        assert_eq!(engine(false, true).action(&market, &PositionState::Flat), Action::NoTrade);
        let entered = PositionState::Entered {
            last_entry_price: 100.0,
        };
        assert_eq!(engine(false, true).action(&market, &entered), Action::Sell);
    }

    #[test]
    fn test_stop_loss_overrides_missing_sell_signal() {
        let rows = rows_with_close(94.0);
        let market = MarketState::new(&rows);
        let entered = PositionState::Entered {
            last_entry_price: 100.0,
        };

        // 94 / 100 = 0.94 < 0.95
        assert_eq!(engine(false, false).action(&market, &entered), Action::Sell);
    }

    #[test]
    fn test_no_stop_loss_above_threshold() {
        let rows = rows_with_close(96.0);
        let market = MarketState::new(&rows);
        let entered = PositionState::Entered {
            last_entry_price: 100.0,
        };

        assert_eq!(engine(false, false).action(&market, &entered), Action::NoTrade);
    }

    #[test]
    fn test_empty_history_is_no_trade() {
        let market = MarketState::new(&[]);
        assert_eq!(engine(true, true).action(&market, &PositionState::Flat), Action::NoTrade);
    }

    #[test]
    fn test_build_engine_from_settings() {
        let settings = StrategySettings::default();
        let engine = build_engine(&settings, 0.9, &[]).unwrap();
        assert_eq!(engine.strategy_name(), "RsiSmaReturn");
        assert_eq!(engine.stop_loss(), 0.9);

        let settings = StrategySettings {
            kind: StrategyKind::PriceDirection,
            ..StrategySettings::default()
        };
        assert!(matches!(
            build_engine(&settings, 0.9, &[]),
            Err(BotError::Configuration(_))
        ));
    }
}
