use anyhow::{bail, Context, Result};
use chrono::{Duration, Utc};
use clap::Parser;
use coinbot::api::{CoinbaseClient, ExchangeClient, PaperExchange};
use coinbot::backtest::{MarketScenario, SyntheticDataGenerator};
use coinbot::config::{BotConfig, StrategyKind};
use coinbot::execution::{initial_positions, LoopConfig, MarketDataFeed, OrderLoop};
use coinbot::indicators::compute_indicators;
use coinbot::persistence::TradeLedger;
use coinbot::strategy::build_engine;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Quote balance of the simulated exchange when no capital is configured
const DRY_RUN_CAPITAL: f64 = 1000.0;

#[derive(Parser)]
#[command(name = "coinbot")]
#[command(about = "Polling limit-order trading bot for Coinbase")]
struct Cli {
    /// Configuration file (default: ./coinbot.toml if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Trade against a simulated exchange replaying recent candles
    #[arg(long)]
    dry_run: bool,

    /// Running time budget in seconds
    #[arg(long)]
    running_time: Option<u64>,

    /// Dry run on a synthetic scenario instead of Coinbase history
    #[arg(long, value_enum)]
    synthetic: Option<MarketScenario>,

    /// Seed of the synthetic scenario
    #[arg(long, default_value_t = 42)]
    seed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();

    let mut config = BotConfig::from_sources(cli.config.as_deref())
        .context("Failed to load configuration")?;
    if cli.dry_run || cli.synthetic.is_some() {
        config.trading.dry_run = true;
    }
    if let Some(secs) = cli.running_time {
        config.trading.running_time_secs = secs;
    }
    config.validate().context("Invalid configuration")?;

    tracing::info!(
        product = %config.market.symbol,
        granularity = config.market.granularity_secs,
        strategy = ?config.strategy.kind,
        dry_run = config.trading.dry_run,
        running_time_secs = config.trading.running_time_secs,
        "🚀 coinbot starting"
    );

    if config.trading.dry_run {
        run_dry(&config, cli.synthetic, cli.seed).await
    } else {
        run_live(&config).await
    }
}

fn setup_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("coinbot=info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

/// Feed, strategy, starting position and ledger wired to one exchange client
async fn build_loop(client: Arc<dyn ExchangeClient>, config: &BotConfig) -> Result<OrderLoop> {
    let market = &config.market;
    let mut feed = MarketDataFeed::new(
        client.clone(),
        market.symbol.clone(),
        market.granularity_secs,
        config.exchange.max_rows_per_request,
    );
    feed.initialize(Duration::minutes(market.lookback_minutes))
        .await
        .context("Failed to load candle history")?;

    let training = match (&config.strategy.kind, &config.strategy.price_direction) {
        (StrategyKind::PriceDirection, Some(pd)) => {
            let (start, end) = pd.training_range();
            let candles = feed
                .fetch_window(start, end)
                .await
                .context("Failed to load training candles")?;
            compute_indicators(&candles)
        }
        _ => Vec::new(),
    };
    let engine = build_engine(&config.strategy, config.trading.stop_loss, &training)?;

    let now = client.get_time().await.unwrap_or_else(|_| Utc::now());
    let positions = initial_positions(client.as_ref(), config, now)
        .await
        .context("Failed to determine starting position")?;
    tracing::info!(
        capital = positions.capital(),
        position = ?positions.position_state(),
        "Starting position"
    );

    Ok(OrderLoop::new(
        client,
        feed,
        engine,
        positions,
        TradeLedger::new(&config.trading.ledger_path),
        LoopConfig::from_trading(&config.trading),
    ))
}

async fn run_live(config: &BotConfig) -> Result<()> {
    let client: Arc<dyn ExchangeClient> = Arc::new(CoinbaseClient::new(&config.exchange)?);
    let mut order_loop = build_loop(client, config).await?;

    let deadline = Utc::now() + Duration::seconds(config.trading.running_time_secs as i64);
    tracing::info!("Press Ctrl+C to stop");

    order_loop
        .run(deadline, async {
            if tokio::signal::ctrl_c().await.is_err() {
                std::future::pending::<()>().await;
            }
            tracing::info!("⚠️  Received Ctrl+C, shutting down...");
        })
        .await?;

    report(&order_loop);
    Ok(())
}

/// Replay `lookback + running_time` of candles through the paper exchange without sleeping
async fn run_dry(config: &BotConfig, synthetic: Option<MarketScenario>, seed: u64) -> Result<()> {
    let market = &config.market;
    let granularity = Duration::seconds(i64::from(market.granularity_secs));
    let lookback = Duration::minutes(market.lookback_minutes);
    let running_time = Duration::seconds(config.trading.running_time_secs as i64);
    let tape_rows = ((lookback + running_time).num_seconds() / granularity.num_seconds()) as usize;

    let tape = match synthetic {
        Some(scenario) => {
            SyntheticDataGenerator::new(seed).generate(scenario, tape_rows, granularity)
        }
        None => {
            let public: Arc<dyn ExchangeClient> =
                Arc::new(CoinbaseClient::public(&config.exchange.base_url)?);
            let feed = MarketDataFeed::new(
                public,
                market.symbol.clone(),
                market.granularity_secs,
                config.exchange.max_rows_per_request,
            );
            feed.fetch_history(lookback + running_time)
                .await
                .context("Failed to fetch replay history")?
        }
    };
    let Some(first) = tape.first().map(|c| c.timestamp) else {
        bail!("No candles to replay");
    };

    let capital = config.trading.capital.unwrap_or(DRY_RUN_CAPITAL);
    let paper = Arc::new(PaperExchange::new(
        &market.symbol,
        tape,
        granularity,
        capital,
        config.trading.paper_fee_rate,
    ));
    if let (true, Some(entry_price)) = (config.trading.start_entered, config.trading.entry_price) {
        paper.deposit(market.base_currency(), capital / entry_price).await;
    }
    paper.set_time(first + lookback).await;

    let mut order_loop = build_loop(paper.clone(), config).await?;

    let poll = Duration::seconds(config.trading.poll_interval_secs as i64);
    let end = first + lookback + running_time;
    let mut ticks = 0usize;
    let now = loop {
        let now = paper.advance(poll).await;
        if now >= end {
            break now;
        }
        let outcome = order_loop.tick(now).await;
        tracing::debug!(%now, ?outcome, "Dry-run tick");
        ticks += 1;
    };

    order_loop.shutdown(now).await?;
    tracing::info!(ticks, "Dry run finished");
    report(&order_loop);
    Ok(())
}

fn report(order_loop: &OrderLoop) {
    let positions = order_loop.positions();
    for trade in positions.ledger() {
        tracing::info!(
            entry = %trade.entry_time,
            entry_price = trade.entry_price,
            exit = %trade.exit_time,
            exit_price = trade.exit_price,
            return_pct = trade.return_pct * 100.0,
            profit = trade.profit,
            "Trade"
        );
    }
    tracing::info!(
        trades = positions.ledger().len(),
        capital = positions.capital(),
        position = ?positions.position_state(),
        ledger = %order_loop.ledger().path().display(),
        "👋 coinbot stopped"
    );
}
