/// Period-over-period price ratio (`current / previous`)
///
/// A value of 1.0 means no change. Non-positive previous prices have no ratio.
pub fn price_ratio(previous: f64, current: f64) -> Option<f64> {
    if previous > 0.0 {
        Some(current / previous)
    } else {
        None
    }
}

/// Product of the last `window` price ratios of `prices`
///
/// Needs `window + 1` prices. Rows before that have no value.
pub fn cumulative_return(prices: &[f64], window: usize) -> Option<f64> {
    if window == 0 || prices.len() < window + 1 {
        return None;
    }

    prices[prices.len() - window - 1..]
        .windows(2)
        .try_fold(1.0, |acc, w| price_ratio(w[0], w[1]).map(|r| acc * r))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_price_ratio() {
        assert_eq!(price_ratio(10.0, 11.0), Some(1.1));
        assert_eq!(price_ratio(0.0, 11.0), None);
    }

    #[test]
    fn test_cumulative_return() {
        let prices = vec![100.0, 50.0, 100.0, 110.0];
        // 110 / 50 over the last two ratios
        let cum = cumulative_return(&prices, 2).unwrap();
        assert!((cum - 2.2).abs() < 1e-12);

        // Whole window telescopes to last / first
        let cum = cumulative_return(&prices, 3).unwrap();
        assert!((cum - 1.1).abs() < 1e-12);
    }

    #[test]
    fn test_cumulative_return_insufficient_data() {
        assert!(cumulative_return(&[100.0, 101.0], 2).is_none());
    }
}
