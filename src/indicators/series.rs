use super::moving_average::{calculate_sma, ema_step};
use super::returns::{cumulative_return, price_ratio};
use super::rsi::{wilder_step, WilderState};
use crate::models::Candle;
use chrono::{DateTime, Utc};

/// RSI lookback in rows
pub const RSI_PERIOD: usize = 10;

/// A candle enriched with trailing-window indicators
///
/// `None` marks a value that is unavailable because the window is not full yet.
#[derive(Debug, Clone, PartialEq)]
pub struct IndicatorRow {
    pub candle: Candle,
    pub rsi: Option<f64>,
    pub sma_50: Option<f64>,
    pub sma_60: Option<f64>,
    pub sma_100: Option<f64>,
    pub sma_200: Option<f64>,
    pub ema_50: Option<f64>,
    pub ema_60: Option<f64>,
    pub ema_100: Option<f64>,
    pub ema_200: Option<f64>,
    /// open / previous open
    pub pct_change: Option<f64>,
    pub cum_returns_50: Option<f64>,
    pub cum_returns_60: Option<f64>,
    pub cum_returns_100: Option<f64>,
    rsi_state: Option<WilderState>,
}

impl IndicatorRow {
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.candle.timestamp
    }

    pub fn close(&self) -> f64 {
        self.candle.close
    }

    pub fn open(&self) -> f64 {
        self.candle.open
    }

    /// Compute row `closes.len() - 1` from the price history up to and including it
    /// and the row before it.
    fn next(candle: Candle, closes: &[f64], opens: &[f64], prev: Option<&IndicatorRow>) -> Self {
        let rsi_state = wilder_step(prev.and_then(|p| p.rsi_state), closes, RSI_PERIOD);
        let ema = |period: usize, prev_ema: Option<f64>| ema_step(prev_ema, closes, period);

        let pct_change = match opens.len() {
            0 | 1 => None,
            n => price_ratio(opens[n - 2], opens[n - 1]),
        };

        Self {
            rsi: rsi_state.map(|s| s.rsi()),
            sma_50: calculate_sma(closes, 50),
            sma_60: calculate_sma(closes, 60),
            sma_100: calculate_sma(closes, 100),
            sma_200: calculate_sma(closes, 200),
            ema_50: ema(50, prev.and_then(|p| p.ema_50)),
            ema_60: ema(60, prev.and_then(|p| p.ema_60)),
            ema_100: ema(100, prev.and_then(|p| p.ema_100)),
            ema_200: ema(200, prev.and_then(|p| p.ema_200)),
            pct_change,
            cum_returns_50: cumulative_return(opens, 50),
            cum_returns_60: cumulative_return(opens, 60),
            cum_returns_100: cumulative_return(opens, 100),
            rsi_state,
            candle,
        }
    }
}

/// Append-only candle history with indicators
///
/// Every row is computed from the rows at or before it only, so extending the
/// series never changes a row that was already computed.
#[derive(Debug, Clone, Default)]
pub struct IndicatorSeries {
    rows: Vec<IndicatorRow>,
    closes: Vec<f64>,
    opens: Vec<f64>,
}

impl IndicatorSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_candles(candles: Vec<Candle>) -> Self {
        let mut series = Self::new();
        series.extend(candles);
        series
    }

    /// Append candles newer than the last stored one
    ///
    /// Input is sorted by timestamp; candles at or before the last stored
    /// timestamp (including duplicates) are skipped. Returns how many rows were added.
    pub fn extend(&mut self, candles: impl IntoIterator<Item = Candle>) -> usize {
        let mut incoming: Vec<Candle> = candles.into_iter().collect();
        incoming.sort_by_key(|c| c.timestamp);

        let mut added = 0;
        for candle in incoming {
            if let Some(last) = self.last_timestamp() {
                if candle.timestamp <= last {
                    continue;
                }
            }

            self.closes.push(candle.close);
            self.opens.push(candle.open);
            let row = IndicatorRow::next(candle, &self.closes, &self.opens, self.rows.last());
            self.rows.push(row);
            added += 1;
        }

        added
    }

    pub fn rows(&self) -> &[IndicatorRow] {
        &self.rows
    }

    pub fn latest(&self) -> Option<&IndicatorRow> {
        self.rows.last()
    }

    pub fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.rows.last().map(|r| r.timestamp())
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn candles(&self) -> Vec<Candle> {
        self.rows.iter().map(|r| r.candle.clone()).collect()
    }
}

/// Compute indicator rows for a full candle history
pub fn compute_indicators(candles: &[Candle]) -> Vec<IndicatorRow> {
    IndicatorSeries::from_candles(candles.to_vec()).rows
}
