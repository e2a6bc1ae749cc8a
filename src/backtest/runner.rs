use crate::backtest::metrics::BacktestMetrics;
use crate::error::Result;
use crate::execution::position_manager::{Fill, OpenEntry, PositionManager};
use crate::indicators::IndicatorRow;
use crate::models::{Action, TradeRecord};
use crate::strategy::{MarketState, StrategyEngine};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestConfig {
    pub initial_capital: f64,
    /// Fraction of notional charged on each fill (e.g. 0.005)
    pub fee_rate: f64,
    pub product_id: String,
}

impl Default for BacktestConfig {
    fn default() -> Self {
        Self {
            initial_capital: 1000.0,
            fee_rate: 0.0,
            product_id: "BTC-EUR".to_string(),
        }
    }
}

/// Outcome of one walk over a series
#[derive(Debug, Clone)]
pub struct BacktestReport {
    /// Completed round trips, oldest first
    pub trades: Vec<TradeRecord>,
    /// Entry still open when the series ended; not part of `trades`
    pub discarded_entry: Option<OpenEntry>,
    /// Decision taken at each step `i` (executed at row `i + 1`)
    pub actions: Vec<Action>,
    pub metrics: BacktestMetrics,
}

/// Walk-forward simulator with next-bar execution
///
/// At step `i` the engine sees rows `0..=i` only; whatever it decides is
/// filled at the open of row `i + 1`.
pub struct BacktestRunner {
    config: BacktestConfig,
}

impl BacktestRunner {
    pub fn new(config: BacktestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &BacktestConfig {
        &self.config
    }

    pub fn run(&self, engine: &StrategyEngine, rows: &[IndicatorRow]) -> Result<BacktestReport> {
        tracing::info!(
            strategy = engine.strategy_name(),
            rows = rows.len(),
            capital = self.config.initial_capital,
            "Starting backtest"
        );

        let mut book = PositionManager::new(&self.config.product_id, self.config.initial_capital);
        let mut actions = Vec::with_capacity(rows.len().saturating_sub(1));

        for i in 0..rows.len().saturating_sub(1) {
            let market = MarketState::new(&rows[..=i]);
            let action = engine.action(&market, &book.position_state());
            actions.push(action);

            let next = &rows[i + 1];
            let price = next.open();

            match action {
                Action::Buy if !book.is_entered() && book.capital() > 0.0 => {
                    let size = book.capital() / (price * (1.0 + self.config.fee_rate));
                    book.enter(Fill {
                        timestamp: next.timestamp(),
                        price,
                        size,
                        fee: price * size * self.config.fee_rate,
                        order_id: None,
                    })?;
                }
                Action::Sell if book.is_entered() => {
                    let size = book.held_size();
                    book.exit(Fill {
                        timestamp: next.timestamp(),
                        price,
                        size,
                        fee: price * size * self.config.fee_rate,
                        order_id: None,
                    })?;
                }
                Action::Buy | Action::Sell | Action::NoTrade => {}
            }
        }

        let discarded_entry = book.discard_open_entry();
        if let Some(entry) = &discarded_entry {
            tracing::warn!(
                entry_time = %entry.entry_time,
                entry_price = entry.entry_price,
                "Discarding unmatched final entry"
            );
        }

        let trades = book.ledger().to_vec();
        let metrics =
            BacktestMetrics::from_trades(&trades, self.config.initial_capital, book.capital());

        tracing::info!(
            trades = metrics.total_trades,
            compounded_return = metrics.compounded_return,
            win_rate = metrics.win_rate,
            "Backtest complete"
        );

        Ok(BacktestReport {
            trades,
            discarded_entry,
            actions,
            metrics,
        })
    }

    /// Run and print the report
    pub fn run_and_report(
        &self,
        engine: &StrategyEngine,
        rows: &[IndicatorRow],
        scenario_name: &str,
    ) -> Result<BacktestReport> {
        println!("\n🔬 Running backtest: {}", scenario_name);
        println!("   Strategy: {}", engine.strategy_name());
        println!("   Rows: {}", rows.len());
        println!("   Initial Capital: {:.2}", self.config.initial_capital);

        let report = self.run(engine, rows)?;
        if let Some(entry) = &report.discarded_entry {
            println!(
                "   Discarded open entry @ {:.2} ({})",
                entry.entry_price, entry.entry_time
            );
        }
        report.metrics.print_report();

        Ok(report)
    }
}
