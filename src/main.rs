use anyhow::{Context, Result};
use chrono::{Duration, Utc};
use clap::{Parser, Subcommand};
use perpbot::backtest::{
    BacktestRunner, CandleCache, MarketScenario, SyntheticDataGenerator,
};
use perpbot::config::AppConfig;
use perpbot::exchange::RestKlineSource;
use perpbot::models::Candle;
use perpbot::strategy::{SmaCross, StrategyParams};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

/// History fetched when the cache is empty and no start date is configured
const DEFAULT_HISTORY_DAYS: i64 = 30;

#[derive(Parser)]
#[command(name = "perpbot")]
#[command(about = "Perpetual futures strategy engine: backtest and candle cache tools", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file (TOML, YAML or JSON); PERPBOT__* variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Replay the SMA crossover strategy over cached or synthetic candles
    Backtest {
        /// Use generated data instead of the cache (uptrend, downtrend, sideways, volatile, gaps)
        #[arg(short, long)]
        synthetic: Option<MarketScenario>,

        /// Number of synthetic candles
        #[arg(short = 'n', long, default_value = "5000")]
        candles: usize,

        /// Seed for synthetic data
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Refresh the cache from the kline endpoint first
        #[arg(short, long)]
        update: bool,

        /// Record every strategy call in the report
        #[arg(long)]
        record_invocations: bool,

        /// Write the report as JSON
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Download or extend the candle cache without running a backtest
    Fetch,
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_logging();
    let cli = Cli::parse();
    let config = AppConfig::load(cli.config.as_deref()).context("Failed to load config")?;

    match cli.command {
        Commands::Backtest {
            synthetic,
            candles,
            seed,
            update,
            record_invocations,
            output,
        } => {
            let data = match synthetic {
                Some(scenario) => {
                    tracing::info!("Generating {} {:?} candles (seed {})", candles, scenario, seed);
                    SyntheticDataGenerator::new(seed).generate(
                        scenario,
                        candles,
                        &config.engine.base_timeframe,
                    )
                }
                None => load_candles(&config, update || config.backtest.update_data).await?,
            };

            let strategy = SmaCross::from_params(&StrategyParams::new(config.params.clone()));
            let mut runner = BacktestRunner::new(config.engine.clone(), config.backtest.clone());
            if record_invocations {
                runner = runner.record_invocations();
            }
            let report = runner.run(Box::new(strategy), &data)?;
            report.print_report();

            if let Some(path) = output {
                report
                    .write_json(&path)
                    .with_context(|| format!("Failed to write report to {}", path.display()))?;
                tracing::info!("Report written to {}", path.display());
            }
        }
        Commands::Fetch => {
            let candles = load_candles(&config, true).await?;
            tracing::info!("Cache holds {} candles", candles.len());
        }
    }

    Ok(())
}

async fn load_candles(config: &AppConfig, update: bool) -> Result<Vec<Candle>> {
    let engine = &config.engine;
    let backtest = &config.backtest;
    let cache = CandleCache::new(
        &backtest.cache_dir,
        &backtest.exchange,
        &engine.symbol,
        &engine.base_timeframe,
    );

    let end = backtest.to.unwrap_or_else(Utc::now);
    let start = backtest
        .from
        .map(|from| from - engine.warmup_duration())
        .unwrap_or_else(|| end - Duration::days(DEFAULT_HISTORY_DAYS));

    let source = RestKlineSource::new(&backtest.kline_url, &engine.symbol, config.live.retry.clone())?;
    let candles = cache.load_or_fetch(&source, start, end, update).await?;
    if candles.is_empty() {
        anyhow::bail!("No candles in {}", cache.path().display());
    }
    Ok(candles)
}

fn setup_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("perpbot=info")),
        )
        .init();
}
