use anyhow::{Context, Result};
use chrono::Duration;
use clap::{Parser, ValueEnum};
use coinbot::api::{CoinbaseClient, ExchangeClient};
use coinbot::backtest::{BacktestConfig, BacktestMetrics, BacktestRunner, MarketScenario, SyntheticDataGenerator};
use coinbot::config::{BotConfig, StrategyKind};
use coinbot::execution::MarketDataFeed;
use coinbot::indicators::{compute_indicators, IndicatorRow};
use coinbot::persistence::TradeLedger;
use coinbot::strategy::build_engine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Source {
    /// Historic candles from the public Coinbase API
    Coinbase,
    /// Seeded synthetic scenarios
    Synthetic,
}

#[derive(Parser)]
#[command(name = "backtest")]
#[command(about = "Walk-forward backtest of the configured strategy")]
struct Cli {
    /// Configuration file for market and strategy settings
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, default_value_t = Source::Synthetic)]
    source: Source,

    /// Synthetic scenario; all scenarios are compared when omitted
    #[arg(long, value_enum)]
    scenario: Option<MarketScenario>,

    /// Number of synthetic candles
    #[arg(long, default_value_t = 2000)]
    candles: usize,

    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Days of Coinbase history to replay
    #[arg(long, default_value_t = 7)]
    days: i64,

    /// Override the configured strategy
    #[arg(long, value_enum)]
    strategy: Option<StrategyKind>,

    #[arg(long, default_value_t = 1000.0)]
    capital: f64,

    /// Fee charged on each fill, as a fraction of notional
    #[arg(long, default_value_t = 0.0)]
    fee_rate: f64,

    /// Write the trade ledger of a single run to this CSV file
    #[arg(short, long)]
    output: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coinbot=warn"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let mut config = BotConfig::from_sources(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(kind) = cli.strategy {
        config.strategy.kind = kind;
    }
    config.trading.dry_run = true;
    config.validate().context("Invalid configuration")?;

    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║               COINBOT BACKTEST                        ║");
    println!("╚═══════════════════════════════════════════════════════╝");

    let runner = BacktestRunner::new(BacktestConfig {
        initial_capital: cli.capital,
        fee_rate: cli.fee_rate,
        product_id: config.market.symbol.clone(),
    });
    let granularity = Duration::seconds(i64::from(config.market.granularity_secs));

    let runs: Vec<(String, Vec<IndicatorRow>)> = match (cli.source, cli.scenario) {
        (Source::Coinbase, _) => {
            let rows = fetch_coinbase_rows(&config, Duration::days(cli.days)).await?;
            vec![(format!("{} last {} days", config.market.symbol, cli.days), rows)]
        }
        (Source::Synthetic, Some(scenario)) => {
            let candles = SyntheticDataGenerator::new(cli.seed).generate(scenario, cli.candles, granularity);
            vec![(format!("{:?}", scenario), compute_indicators(&candles))]
        }
        (Source::Synthetic, None) => MarketScenario::value_variants()
            .iter()
            .map(|scenario| {
                let candles =
                    SyntheticDataGenerator::new(cli.seed).generate(*scenario, cli.candles, granularity);
                (format!("{:?}", scenario), compute_indicators(&candles))
            })
            .collect(),
    };

    let mut results = Vec::new();
    for (name, rows) in &runs {
        let engine = match build_engine(&config.strategy, config.trading.stop_loss, rows) {
            Ok(engine) => engine,
            Err(e) => {
                eprintln!("❌ Strategy unavailable for {}: {}", name, e);
                continue;
            }
        };

        match runner.run_and_report(&engine, rows, name) {
            Ok(report) => {
                if runs.len() == 1 {
                    if let Some(path) = &cli.output {
                        TradeLedger::write_all(path, &report.trades)
                            .with_context(|| format!("Failed to write {}", path.display()))?;
                        println!("💾 Ledger written to {}", path.display());
                    }
                }
                results.push((name.clone(), report.metrics));
            }
            Err(e) => eprintln!("❌ Backtest failed for {}: {}", name, e),
        }
    }

    if results.len() > 1 {
        print_summary_comparison(&results);
    }

    Ok(())
}

async fn fetch_coinbase_rows(config: &BotConfig, history: Duration) -> Result<Vec<IndicatorRow>> {
    let client: Arc<dyn ExchangeClient> = Arc::new(CoinbaseClient::public(&config.exchange.base_url)?);
    let feed = MarketDataFeed::new(
        client,
        config.market.symbol.clone(),
        config.market.granularity_secs,
        config.exchange.max_rows_per_request,
    );

    println!("📡 Fetching {} days of {} candles...", history.num_days(), config.market.symbol);
    let candles = feed
        .fetch_history(history)
        .await
        .context("Failed to fetch candle history")?;
    println!("   {} candles", candles.len());

    Ok(compute_indicators(&candles))
}

fn print_summary_comparison(results: &[(String, BacktestMetrics)]) {
    println!("\n╔═══════════════════════════════════════════════════════╗");
    println!("║              SCENARIO COMPARISON                      ║");
    println!("╚═══════════════════════════════════════════════════════╝\n");

    println!(
        "{:<20} {:>12} {:>10} {:>12} {:>8} {:>8}",
        "Scenario", "Profit", "Return%", "Compound%", "Trades", "Win%"
    );
    println!("{}", "─".repeat(75));

    for (name, metrics) in results {
        println!(
            "{:<20} {:>12.2} {:>10.2} {:>12.2} {:>8} {:>8.1}",
            name,
            metrics.total_profit,
            metrics.total_return * 100.0,
            metrics.compounded_return * 100.0,
            metrics.total_trades,
            metrics.win_rate * 100.0
        );
    }

    if let Some((best_name, best)) = results
        .iter()
        .max_by(|a, b| a.1.compounded_return.total_cmp(&b.1.compounded_return))
    {
        println!(
            "\n🏆 Best Scenario: {} ({:+.2}%)",
            best_name,
            best.compounded_return * 100.0
        );
    }

    if let Some((worst_name, worst)) = results
        .iter()
        .min_by(|a, b| a.1.compounded_return.total_cmp(&b.1.compounded_return))
    {
        println!(
            "⚠️  Worst Scenario: {} ({:+.2}%)",
            worst_name,
            worst.compounded_return * 100.0
        );
    }

    let total_trades: usize = results.iter().map(|(_, m)| m.total_trades).sum();
    println!("\n📊 Total Trades Across All Scenarios: {}", total_trades);
    println!("\n═══════════════════════════════════════════════════════\n");
}
