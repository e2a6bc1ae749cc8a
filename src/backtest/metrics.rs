use crate::models::TradeRecord;
use serde::{Deserialize, Serialize};

/// Summary statistics over a trade ledger
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestMetrics {
    // Capital
    pub start_capital: f64,
    pub end_capital: f64,
    pub total_profit: f64,

    // Returns (fractions, not percentages)
    pub total_return: f64,
    pub average_return: f64,
    pub compounded_return: f64,

    // Trade Statistics
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,

    // P&L Distribution
    pub largest_win: f64,
    pub largest_loss: f64,
    pub profit_factor: f64, // Gross profit / gross loss

    // Risk Metrics
    pub max_drawdown: f64,
    pub max_drawdown_pct: f64,
    pub sharpe_ratio: f64,

    // Holding Period
    pub avg_holding_period_minutes: f64,
}

impl BacktestMetrics {
    /// Calculate metrics from completed round trips
    pub fn from_trades(trades: &[TradeRecord], start_capital: f64, end_capital: f64) -> Self {
        let total_trades = trades.len();

        if total_trades == 0 {
            return Self::empty(start_capital, end_capital);
        }

        let returns: Vec<f64> = trades.iter().map(|t| t.return_pct).collect();
        let total_return: f64 = returns.iter().sum();
        let average_return = total_return / total_trades as f64;
        let compounded_return = returns.iter().map(|r| 1.0 + r).product::<f64>() - 1.0;

        // Win = positive price delta, independent of fees
        let winning_trades = trades.iter().filter(|t| t.is_win()).count();
        let losing_trades = total_trades - winning_trades;
        let win_rate = winning_trades as f64 / total_trades as f64;

        let gross_profit: f64 = trades.iter().map(|t| t.profit.max(0.0)).sum();
        let gross_loss: f64 = trades.iter().map(|t| (-t.profit).max(0.0)).sum();

        let largest_win = trades.iter().map(|t| t.profit).fold(0.0, f64::max);
        let largest_loss = trades.iter().map(|t| t.profit).fold(0.0, f64::min);

        let profit_factor = if gross_loss > 0.0 {
            gross_profit / gross_loss
        } else if gross_profit > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        let (max_drawdown, max_drawdown_pct) = Self::calculate_drawdown(trades, start_capital);
        let sharpe_ratio = Self::calculate_sharpe_ratio(&returns);

        let avg_holding_period_minutes = trades
            .iter()
            .map(|t| t.holding_period_minutes())
            .sum::<i64>() as f64
            / total_trades as f64;

        Self {
            start_capital,
            end_capital,
            total_profit: end_capital - start_capital,
            total_return,
            average_return,
            compounded_return,
            total_trades,
            winning_trades,
            losing_trades,
            win_rate,
            largest_win,
            largest_loss,
            profit_factor,
            max_drawdown,
            max_drawdown_pct,
            sharpe_ratio,
            avg_holding_period_minutes,
        }
    }

    /// Empty metrics for when no trades occurred
    fn empty(start_capital: f64, end_capital: f64) -> Self {
        Self {
            start_capital,
            end_capital,
            total_profit: end_capital - start_capital,
            total_return: 0.0,
            average_return: 0.0,
            compounded_return: 0.0,
            total_trades: 0,
            winning_trades: 0,
            losing_trades: 0,
            win_rate: 0.0,
            largest_win: 0.0,
            largest_loss: 0.0,
            profit_factor: 0.0,
            max_drawdown: 0.0,
            max_drawdown_pct: 0.0,
            sharpe_ratio: 0.0,
            avg_holding_period_minutes: 0.0,
        }
    }

    /// Maximum drawdown over the realized capital curve (capital after each exit)
    fn calculate_drawdown(trades: &[TradeRecord], start_capital: f64) -> (f64, f64) {
        let mut peak = start_capital;
        let mut max_dd = 0.0;
        let mut max_dd_pct = 0.0;

        for trade in trades {
            let capital = trade.end_capital;
            if capital > peak {
                peak = capital;
            }

            let drawdown = peak - capital;
            if drawdown > max_dd {
                max_dd = drawdown;
                max_dd_pct = if peak > 0.0 { drawdown / peak } else { 0.0 };
            }
        }

        (max_dd, max_dd_pct)
    }

    /// Per-trade Sharpe ratio, risk-free rate 0
    fn calculate_sharpe_ratio(returns: &[f64]) -> f64 {
        if returns.len() < 2 {
            return 0.0;
        }

        let mean = returns.iter().sum::<f64>() / returns.len() as f64;
        let variance =
            returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
        let std_dev = variance.sqrt();

        if std_dev > 0.0 {
            mean / std_dev
        } else {
            0.0
        }
    }

    /// Print a formatted report to stdout
    pub fn print_report(&self) {
        println!("\n╔═══════════════════════════════════════════════════════╗");
        println!("║              BACKTEST PERFORMANCE REPORT              ║");
        println!("╚═══════════════════════════════════════════════════════╝\n");

        println!("📊 CAPITAL");
        println!("  Starting Capital:      {:.2}", self.start_capital);
        println!("  Ending Capital:        {:.2}", self.end_capital);
        println!("  Profit:                {:+.2}", self.total_profit);

        println!("\n📈 RETURNS");
        println!("  Total Return:          {:+.2}%", self.total_return * 100.0);
        println!("  Average Return:        {:+.2}%", self.average_return * 100.0);
        println!(
            "  Compounded Return:     {:+.2}%",
            self.compounded_return * 100.0
        );

        println!("\n🔁 TRADE STATISTICS");
        println!("  Total Trades:          {}", self.total_trades);
        println!(
            "  Winning Trades:        {} ({:.1}%)",
            self.winning_trades,
            self.win_rate * 100.0
        );
        println!("  Losing Trades:         {}", self.losing_trades);

        if self.total_trades > 0 {
            println!("\n💰 WIN/LOSS ANALYSIS");
            println!("  Largest Win:           {:.2}", self.largest_win);
            println!("  Largest Loss:          {:.2}", self.largest_loss);
            println!("  Profit Factor:         {:.2}", self.profit_factor);

            println!("\n⚠️  RISK METRICS");
            println!(
                "  Max Drawdown:          {:.2} ({:.2}%)",
                self.max_drawdown,
                self.max_drawdown_pct * 100.0
            );
            println!("  Sharpe Ratio:          {:.2}", self.sharpe_ratio);

            println!("\n⏱️  HOLDING PERIOD");
            println!(
                "  Average:               {:.1} minutes ({:.1} hours)",
                self.avg_holding_period_minutes,
                self.avg_holding_period_minutes / 60.0
            );
        }

        println!("\n═══════════════════════════════════════════════════════\n");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};

    /// Round trip of one unit starting from `start_capital`, no fees
    fn create_test_trade(
        entry_price: f64,
        exit_price: f64,
        start_capital: f64,
        holding_minutes: i64,
    ) -> TradeRecord {
        let entry_time = Utc::now();
        let profit = exit_price - entry_price;
        TradeRecord {
            product_id: "BTC-EUR".to_string(),
            entry_time,
            entry_price,
            entry_size: 1.0,
            entry_order_id: None,
            exit_time: entry_time + Duration::minutes(holding_minutes),
            exit_price,
            exit_size: 1.0,
            exit_order_id: None,
            start_capital,
            end_capital: start_capital + profit,
            profit,
            return_pct: (exit_price - entry_price) / entry_price,
        }
    }

    #[test]
    fn test_metrics_with_winning_trades() {
        let trades = vec![
            create_test_trade(100.0, 200.0, 10000.0, 60), // +100
            create_test_trade(100.0, 150.0, 10100.0, 120), // +50
            create_test_trade(100.0, 70.0, 10150.0, 90),  // -30
        ];

        let metrics = BacktestMetrics::from_trades(&trades, 10000.0, 10120.0);

        assert_eq!(metrics.total_trades, 3);
        assert_eq!(metrics.winning_trades, 2);
        assert_eq!(metrics.losing_trades, 1);
        assert!((metrics.win_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((metrics.total_profit - 120.0).abs() < 0.01);
        assert!((metrics.avg_holding_period_minutes - 90.0).abs() < 1e-9);
    }

    #[test]
    fn test_metrics_with_no_trades() {
        let metrics = BacktestMetrics::from_trades(&[], 10000.0, 10000.0);

        assert_eq!(metrics.total_trades, 0);
        assert_eq!(metrics.win_rate, 0.0);
        assert_eq!(metrics.compounded_return, 0.0);
        assert_eq!(metrics.total_profit, 0.0);
    }

    #[test]
    fn test_compounded_and_average_return() {
        let trades = vec![
            create_test_trade(100.0, 110.0, 1000.0, 60), // +10%
            create_test_trade(100.0, 95.0, 1010.0, 60),  // -5%
        ];

        let metrics = BacktestMetrics::from_trades(&trades, 1000.0, 1005.0);

        assert!((metrics.total_return - 0.05).abs() < 1e-12);
        assert!((metrics.average_return - 0.025).abs() < 1e-12);
        // 1.10 * 0.95 - 1
        assert!((metrics.compounded_return - 0.045).abs() < 1e-12);
    }

    #[test]
    fn test_profit_factor_calculation() {
        let trades = vec![
            create_test_trade(100.0, 300.0, 10000.0, 60), // +200
            create_test_trade(100.0, 200.0, 10200.0, 60), // +100
            create_test_trade(100.0, 50.0, 10300.0, 60),  // -50
        ];

        let metrics = BacktestMetrics::from_trades(&trades, 10000.0, 10250.0);

        // 300 / 50
        assert!((metrics.profit_factor - 6.0).abs() < 0.01);
        assert_eq!(metrics.largest_win, 200.0);
        assert_eq!(metrics.largest_loss, -50.0);
    }

    #[test]
    fn test_drawdown_calculation() {
        let trades = vec![
            create_test_trade(100.0, 200.0, 10000.0, 60),  // Peak at 10100
            create_test_trade(300.0, 100.0, 10100.0, 60),  // Down to 9900
            create_test_trade(100.0, 150.0, 9900.0, 60),   // Back to 9950
        ];

        let metrics = BacktestMetrics::from_trades(&trades, 10000.0, 9950.0);

        assert!((metrics.max_drawdown - 200.0).abs() < 0.01);
        assert!((metrics.max_drawdown_pct - 200.0 / 10100.0).abs() < 1e-9);
    }

    #[test]
    fn test_win_is_price_delta_not_profit() {
        // Price went up but fees ate the profit
        let mut trade = create_test_trade(100.0, 100.5, 1000.0, 60);
        trade.profit = -1.0;

        let metrics = BacktestMetrics::from_trades(&[trade], 1000.0, 999.0);
        assert_eq!(metrics.winning_trades, 1);
        assert_eq!(metrics.win_rate, 1.0);
    }
}
