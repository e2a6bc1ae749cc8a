use crate::models::Candle;
use chrono::{DateTime, Duration, TimeZone, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Market scenario types for synthetic data generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum MarketScenario {
    /// Steady uptrend with noise (+2% daily average)
    Uptrend,
    /// Steady downtrend with noise (-2% daily average)
    Downtrend,
    /// Choppy market pulled back to its starting price
    Sideways,
    /// ±5% swings per candle
    Volatile,
    /// Slow climb followed by a 25% slide
    Drawdown,
}

/// Seeded candle generator for backtests and dry runs
///
/// The same seed, scenario and start time always produce the same candles.
pub struct SyntheticDataGenerator {
    rng: StdRng,
    base_price: f64,
    base_volume: f64,
}

impl SyntheticDataGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
            base_price: 20_000.0,
            base_volume: 50.0,
        }
    }

    pub fn with_base_price(mut self, base_price: f64) -> Self {
        self.base_price = base_price;
        self
    }

    /// Start of the default tape, fixed so runs are reproducible
    pub fn default_start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2022, 1, 1, 0, 0, 0)
            .single()
            .unwrap_or(DateTime::UNIX_EPOCH)
    }

    /// Generate `num_candles` candles spaced `granularity` apart from the default start
    pub fn generate(
        &mut self,
        scenario: MarketScenario,
        num_candles: usize,
        granularity: Duration,
    ) -> Vec<Candle> {
        self.generate_from(Self::default_start(), scenario, num_candles, granularity)
    }

    pub fn generate_from(
        &mut self,
        start: DateTime<Utc>,
        scenario: MarketScenario,
        num_candles: usize,
        granularity: Duration,
    ) -> Vec<Candle> {
        let intervals_per_day = (Duration::days(1).num_seconds() as f64
            / granularity.num_seconds().max(1) as f64)
            .max(1.0);

        let mut candles = Vec::with_capacity(num_candles);
        let mut open = self.base_price;

        for i in 0..num_candles {
            let close = self.step(scenario, open, i, num_candles, intervals_per_day);
            let timestamp = start + granularity * i as i32;
            candles.push(self.create_candle(timestamp, open, close));
            open = close;
        }

        candles
    }

    /// Next close given the current price
    fn step(
        &mut self,
        scenario: MarketScenario,
        price: f64,
        index: usize,
        total: usize,
        intervals_per_day: f64,
    ) -> f64 {
        let next = match scenario {
            MarketScenario::Uptrend => {
                let drift = 0.02 / intervals_per_day;
                price * (1.0 + drift + self.rng.gen_range(-0.001..0.001))
            }
            MarketScenario::Downtrend => {
                let drift = -0.02 / intervals_per_day;
                price * (1.0 + drift + self.rng.gen_range(-0.001..0.001))
            }
            MarketScenario::Sideways => {
                let reversion = (self.base_price - price) * 0.1;
                price + reversion + price * self.rng.gen_range(-0.01..0.01)
            }
            MarketScenario::Volatile => {
                let moved = price * (1.0 + self.rng.gen_range(-0.05..0.05));
                moved.max(self.base_price * 0.5)
            }
            MarketScenario::Drawdown => {
                if index < total / 2 {
                    price * (1.0 + self.rng.gen_range(-0.005..0.01))
                } else {
                    let drop = -0.25 / (total as f64 / 2.0);
                    price * (1.0 + drop + self.rng.gen_range(-0.005..0.005))
                }
            }
        };

        // Keep prices strictly positive
        next.max(self.base_price * 0.01)
    }

    fn create_candle(&mut self, timestamp: DateTime<Utc>, open: f64, close: f64) -> Candle {
        let wick = 0.002; // ±0.2% beyond the body

        let body_high = open.max(close);
        let body_low = open.min(close);
        let high = body_high * (1.0 + self.rng.gen_range(0.0..wick));
        let low = body_low * (1.0 - self.rng.gen_range(0.0..wick));

        let volume = self.base_volume * self.rng.gen_range(0.7..1.3);

        Candle {
            timestamp,
            open,
            high,
            low,
            close,
            volume,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hourly(scenario: MarketScenario, n: usize) -> Vec<Candle> {
        SyntheticDataGenerator::new(42).generate(scenario, n, Duration::hours(1))
    }

    #[test]
    fn test_generate_uptrend() {
        let candles = hourly(MarketScenario::Uptrend, 500);

        assert_eq!(candles.len(), 500);

        let first_price = candles.first().unwrap().close;
        let last_price = candles.last().unwrap().close;
        assert!(
            last_price > first_price,
            "Uptrend should end higher: {} -> {}",
            first_price,
            last_price
        );
    }

    #[test]
    fn test_generate_downtrend() {
        let candles = hourly(MarketScenario::Downtrend, 500);

        let first_price = candles.first().unwrap().close;
        let last_price = candles.last().unwrap().close;
        assert!(
            last_price < first_price,
            "Downtrend should end lower: {} -> {}",
            first_price,
            last_price
        );
    }

    #[test]
    fn test_generate_sideways() {
        let candles = hourly(MarketScenario::Sideways, 500);

        for candle in &candles {
            assert!(
                candle.close > 20_000.0 * 0.9 && candle.close < 20_000.0 * 1.1,
                "Sideways should stay near base: {}",
                candle.close
            );
        }
    }

    #[test]
    fn test_drawdown_ends_below_midpoint() {
        let candles = hourly(MarketScenario::Drawdown, 400);
        let mid = candles[200].close;
        let last = candles.last().unwrap().close;
        assert!(last < mid * 0.9, "{} vs {}", last, mid);
    }

    #[test]
    fn test_same_seed_same_tape() {
        assert_eq!(
            hourly(MarketScenario::Volatile, 50),
            hourly(MarketScenario::Volatile, 50)
        );
    }

    #[test]
    fn test_timestamps_are_sequential() {
        let candles = hourly(MarketScenario::Uptrend, 100);

        for pair in candles.windows(2) {
            assert_eq!(pair[1].timestamp - pair[0].timestamp, Duration::hours(1));
        }
    }

    #[test]
    fn test_ohlc_consistency() {
        let candles = hourly(MarketScenario::Volatile, 200);

        for pair in candles.windows(2) {
            assert_eq!(pair[1].open, pair[0].close);
        }
        for candle in &candles {
            assert!(candle.high >= candle.close, "High should be >= close");
            assert!(candle.high >= candle.open, "High should be >= open");
            assert!(candle.low <= candle.close, "Low should be <= close");
            assert!(candle.low <= candle.open, "Low should be <= open");
            assert!(candle.low > 0.0);
        }
    }
}
