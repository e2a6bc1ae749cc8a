/// Calculate Simple Moving Average (SMA)
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Calculate Exponential Moving Average (EMA)
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let multiplier = ema_multiplier(period);

    // Start with SMA
    let initial_sma = calculate_sma(&prices[0..period], period)?;

    // Calculate EMA
    let mut ema = initial_sma;
    for price in &prices[period..] {
        ema = (price - ema) * multiplier + ema;
    }

    Some(ema)
}

/// Advance an EMA by the last price in `prices`
///
/// `prev` is the EMA of `prices` without its last element. Without a
/// predecessor the EMA is computed from scratch, which yields the same value.
pub fn ema_step(prev: Option<f64>, prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    match (prev, prices.last()) {
        (Some(ema), Some(price)) => Some((price - ema) * ema_multiplier(period) + ema),
        _ => calculate_ema(prices, period),
    }
}

fn ema_multiplier(period: usize) -> f64 {
    2.0 / (period as f64 + 1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sma() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0];
        let sma = calculate_sma(&prices, 5);
        assert_eq!(sma, Some(104.0));
    }

    #[test]
    fn test_sma_insufficient_data() {
        let prices = vec![100.0, 102.0];
        let sma = calculate_sma(&prices, 5);
        assert!(sma.is_none());
    }

    #[test]
    fn test_ema() {
        let prices = vec![100.0, 102.0, 104.0, 106.0, 108.0, 110.0];
        let ema = calculate_ema(&prices, 5);
        assert!(ema.is_some());
        assert!(ema.unwrap() > 104.0); // EMA should be above initial SMA
    }

    #[test]
    fn test_ema_step_matches_full_calculation() {
        let prices: Vec<f64> = (0..40).map(|i| 100.0 + (i as f64 * 0.7).sin() * 5.0).collect();

        let mut ema = None;
        for end in 1..=prices.len() {
            ema = ema_step(ema, &prices[..end], 10);
            assert_eq!(ema, calculate_ema(&prices[..end], 10));
        }
    }

    #[test]
    fn test_ema_seeded_with_sma() {
        let prices = vec![1.0, 2.0, 3.0];
        assert_eq!(ema_step(None, &prices, 3), Some(2.0));
    }
}
