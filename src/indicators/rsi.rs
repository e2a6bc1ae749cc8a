/// Wilder-smoothed average gain and loss
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WilderState {
    pub avg_gain: f64,
    pub avg_loss: f64,
}

impl WilderState {
    /// RSI for this state
    ///
    /// Values:
    /// - RSI > 70: Overbought
    /// - RSI < 30: Oversold
    pub fn rsi(&self) -> f64 {
        if self.avg_loss == 0.0 {
            if self.avg_gain == 0.0 {
                return 50.0; // No movement at all
            }
            return 100.0;
        }

        let rs = self.avg_gain / self.avg_loss;
        100.0 - (100.0 / (1.0 + rs))
    }

    fn smooth(&self, change: f64, period: usize) -> Self {
        let (gain, loss) = split_change(change);
        let n = period as f64;
        Self {
            avg_gain: (self.avg_gain * (n - 1.0) + gain) / n,
            avg_loss: (self.avg_loss * (n - 1.0) + loss) / n,
        }
    }
}

fn split_change(change: f64) -> (f64, f64) {
    if change > 0.0 {
        (change, 0.0)
    } else {
        (0.0, -change)
    }
}

/// Wilder state over the whole of `prices`
///
/// The first average is the simple mean of the first `period` changes; every
/// later change is folded in with Wilder's smoothing.
pub fn wilder_state(prices: &[f64], period: usize) -> Option<WilderState> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    let changes: Vec<f64> = prices.windows(2).map(|w| w[1] - w[0]).collect();

    let (gain_sum, loss_sum) = changes[..period]
        .iter()
        .map(|&c| split_change(c))
        .fold((0.0, 0.0), |(g, l), (gain, loss)| (g + gain, l + loss));

    let mut state = WilderState {
        avg_gain: gain_sum / period as f64,
        avg_loss: loss_sum / period as f64,
    };

    for &change in &changes[period..] {
        state = state.smooth(change, period);
    }

    Some(state)
}

/// Advance a Wilder state by the last price in `prices`
///
/// `prev` is the state of `prices` without its last element.
pub fn wilder_step(
    prev: Option<WilderState>,
    prices: &[f64],
    period: usize,
) -> Option<WilderState> {
    if period == 0 || prices.len() < period + 1 {
        return None;
    }

    match prev {
        Some(state) => {
            let n = prices.len();
            Some(state.smooth(prices[n - 1] - prices[n - 2], period))
        }
        None => wilder_state(prices, period),
    }
}

/// Calculate Relative Strength Index (RSI) with Wilder smoothing
pub fn calculate_rsi(prices: &[f64], period: usize) -> Option<f64> {
    wilder_state(prices, period).map(|s| s.rsi())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rsi_calculation() {
        // Test with known values
        let prices = vec![
            44.0, 44.25, 44.5, 43.75, 44.0, 44.5, 45.0, 45.5, 45.25, 45.5, 46.0, 46.5, 46.25,
            46.0, 46.5,
        ];

        let rsi = calculate_rsi(&prices, 14);
        assert!(rsi.is_some());

        let rsi_value = rsi.unwrap();
        assert!(rsi_value > 0.0 && rsi_value < 100.0);
    }

    #[test]
    fn test_rsi_insufficient_data() {
        let prices = vec![100.0, 102.0, 101.0];
        let rsi = calculate_rsi(&prices, 14);
        assert!(rsi.is_none());
    }

    #[test]
    fn test_rsi_all_gains() {
        let prices = vec![100.0, 101.0, 102.0, 103.0, 104.0, 105.0];
        let rsi = calculate_rsi(&prices, 5);
        assert_eq!(rsi, Some(100.0)); // All gains = RSI 100
    }

    #[test]
    fn test_rsi_flat_is_neutral() {
        let prices = vec![100.0; 12];
        assert_eq!(calculate_rsi(&prices, 10), Some(50.0));
    }

    #[test]
    fn test_rsi_wilder_smoothing() {
        // Seed: 2 changes of +1 and -1 -> avg gain 0.5, avg loss 0.5
        // Next change +2 -> avg gain (0.5 + 2) / 2 = 1.25, avg loss 0.25
        let prices = vec![10.0, 11.0, 10.0, 12.0];
        let state = wilder_state(&prices, 2).unwrap();
        assert!((state.avg_gain - 1.25).abs() < 1e-12);
        assert!((state.avg_loss - 0.25).abs() < 1e-12);

        let rsi = state.rsi();
        assert!((rsi - 100.0 * 5.0 / 6.0).abs() < 1e-9);
    }

    #[test]
    fn test_wilder_step_matches_full_calculation() {
        let prices: Vec<f64> = (0..60).map(|i| 50.0 + ((i * 7) % 11) as f64).collect();

        let mut state = None;
        for end in 1..=prices.len() {
            state = wilder_step(state, &prices[..end], 10);
            assert_eq!(state, wilder_state(&prices[..end], 10));
            if let Some(s) = state {
                let rsi = s.rsi();
                assert!((0.0..=100.0).contains(&rsi));
            }
        }
    }
}
