use super::{MarketState, Strategy};
use crate::error::{BotError, Result};
use crate::indicators::IndicatorRow;
use chrono::{DateTime, Days, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

const NUM_FEATURES: usize = 4;
const MIN_TRAINING_SAMPLES: usize = 20;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceDirectionConfig {
    /// First day (inclusive) of the training window
    pub first_training_date: NaiveDate,
    /// Last day (inclusive) of the training window
    pub last_training_date: NaiveDate,
    pub epochs: usize,
    pub learning_rate: f64,
    /// Buy when the predicted probability of an up move exceeds this
    pub buy_threshold: f64,
    /// Sell if RSI > rsi_sell
    pub rsi_sell: f64,
}

impl PriceDirectionConfig {
    /// Training window as a half-open UTC range `[first day 00:00, day after last day 00:00)`
    pub fn training_range(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        let start = self.first_training_date.and_time(chrono::NaiveTime::MIN).and_utc();
        let end = self
            .last_training_date
            .checked_add_days(Days::new(1))
            .unwrap_or(self.last_training_date)
            .and_time(chrono::NaiveTime::MIN)
            .and_utc();
        (start, end)
    }
}

/// Learned price-direction classifier
///
/// A logistic regression over (close, SMA50, SMA200, volume) of row t,
/// labelled with whether close[t+1] > close[t]. Trained once on a date window
/// of history; buys when an up move is predicted and sells on overbought RSI.
#[derive(Debug, Clone)]
pub struct PriceDirectionStrategy {
    config: PriceDirectionConfig,
    model: LogisticModel,
}

#[derive(Debug, Clone)]
struct LogisticModel {
    weights: [f64; NUM_FEATURES],
    bias: f64,
    means: [f64; NUM_FEATURES],
    stds: [f64; NUM_FEATURES],
}

fn features(row: &IndicatorRow) -> Option<[f64; NUM_FEATURES]> {
    Some([row.close(), row.sma_50?, row.sma_200?, row.candle.volume])
}

fn sigmoid(z: f64) -> f64 {
    1.0 / (1.0 + (-z).exp())
}

impl LogisticModel {
    fn fit(samples: &[([f64; NUM_FEATURES], f64)], epochs: usize, learning_rate: f64) -> Self {
        let n = samples.len() as f64;

        let mut means = [0.0; NUM_FEATURES];
        for (x, _) in samples {
            for k in 0..NUM_FEATURES {
                means[k] += x[k] / n;
            }
        }

        let mut stds = [0.0; NUM_FEATURES];
        for (x, _) in samples {
            for k in 0..NUM_FEATURES {
                stds[k] += (x[k] - means[k]).powi(2) / n;
            }
        }
        for std in stds.iter_mut() {
            *std = std.sqrt();
            if *std == 0.0 {
                *std = 1.0; // Constant feature carries no information
            }
        }

        let mut model = Self {
            weights: [0.0; NUM_FEATURES],
            bias: 0.0,
            means,
            stds,
        };

        let scaled: Vec<([f64; NUM_FEATURES], f64)> =
            samples.iter().map(|(x, y)| (model.scale(x), *y)).collect();

        for _ in 0..epochs {
            let mut grad_w = [0.0; NUM_FEATURES];
            let mut grad_b = 0.0;

            for (x, y) in &scaled {
                let error = model.raw_probability(x) - y;
                for k in 0..NUM_FEATURES {
                    grad_w[k] += error * x[k] / n;
                }
                grad_b += error / n;
            }

            for k in 0..NUM_FEATURES {
                model.weights[k] -= learning_rate * grad_w[k];
            }
            model.bias -= learning_rate * grad_b;
        }

        model
    }

    fn scale(&self, x: &[f64; NUM_FEATURES]) -> [f64; NUM_FEATURES] {
        let mut scaled = [0.0; NUM_FEATURES];
        for k in 0..NUM_FEATURES {
            scaled[k] = (x[k] - self.means[k]) / self.stds[k];
        }
        scaled
    }

    fn raw_probability(&self, scaled: &[f64; NUM_FEATURES]) -> f64 {
        let z: f64 = self
            .weights
            .iter()
            .zip(scaled.iter())
            .map(|(w, x)| w * x)
            .sum::<f64>()
            + self.bias;
        sigmoid(z)
    }

    fn predict(&self, x: &[f64; NUM_FEATURES]) -> f64 {
        self.raw_probability(&self.scale(x))
    }
}

impl PriceDirectionStrategy {
    /// Train the classifier on the rows that fall inside the configured date window
    pub fn train(rows: &[IndicatorRow], config: PriceDirectionConfig) -> Result<Self> {
        if config.first_training_date > config.last_training_date {
            return Err(BotError::Strategy(format!(
                "Training window is empty: {} > {}",
                config.first_training_date, config.last_training_date
            )));
        }

        let samples: Vec<([f64; NUM_FEATURES], f64)> = rows
            .windows(2)
            .filter(|w| {
                let day = w[0].timestamp().date_naive();
                day >= config.first_training_date && day <= config.last_training_date
            })
            .filter_map(|w| {
                let label = if w[1].close() > w[0].close() { 1.0 } else { 0.0 };
                features(&w[0]).map(|x| (x, label))
            })
            .collect();

        if samples.len() < MIN_TRAINING_SAMPLES {
            return Err(BotError::Strategy(format!(
                "Insufficient training data: {} samples between {} and {}, need {}",
                samples.len(),
                config.first_training_date,
                config.last_training_date,
                MIN_TRAINING_SAMPLES
            )));
        }

        let model = LogisticModel::fit(&samples, config.epochs, config.learning_rate);

        tracing::info!(
            samples = samples.len(),
            epochs = config.epochs,
            weights = ?model.weights,
            "Trained price direction classifier"
        );

        Ok(Self { config, model })
    }

    /// Probability that the next close is above the current one
    pub fn up_probability(&self, row: &IndicatorRow) -> Option<f64> {
        features(row).map(|x| self.model.predict(&x))
    }
}

impl Strategy for PriceDirectionStrategy {
    fn name(&self) -> &str {
        "PriceDirection"
    }

    fn buy_signal(&self, market: &MarketState<'_>) -> bool {
        market
            .latest()
            .and_then(|row| self.up_probability(row))
            .is_some_and(|p| p > self.config.buy_threshold)
    }

    fn sell_signal(&self, market: &MarketState<'_>) -> bool {
        market
            .latest()
            .and_then(|row| row.rsi)
            .is_some_and(|rsi| rsi > self.config.rsi_sell)
    }
}
