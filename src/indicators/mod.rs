// Technical indicators module
// RSI, SMA/EMA and cumulative returns over an append-only candle history

pub mod moving_average;
pub mod returns;
pub mod rsi;
pub mod series;

pub use moving_average::{calculate_ema, calculate_sma};
pub use returns::{cumulative_return, price_ratio};
pub use rsi::{calculate_rsi, WilderState};
pub use series::{compute_indicators, IndicatorRow, IndicatorSeries, RSI_PERIOD};
