//! Strategy Evolver: genetic parameter search over trading strategy families
//!
//! Usage:
//!   strategy-evolver evolve --rounds 5 --symbol BTCUSDT   # Run evolution rounds
//!   strategy-evolver top --n 10                           # Show best stored strategies
//!   strategy-evolver families                             # List strategy families

use anyhow::Context;
use chrono::{NaiveDate, TimeZone, Utc};
use clap::{Parser, Subcommand};
use engine::{
    BacktestAdapter, BarBacktester, BinanceClient, EvolutionConfig, EvolutionManager,
    EvolutionReport, MarketDataStore, RoundOutcome, StrategyRegistry, Timeframe,
};
use persistence::{AppendLog, Database, StrategyRecord, StrategyStore};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{info, warn};

const APP_VERSION: &str = concat!(env!("CARGO_PKG_VERSION"), "-", env!("GIT_HASH"));

#[derive(Parser)]
#[command(name = "strategy-evolver")]
#[command(about = "Genetic parameter search for trading strategies", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run evolution rounds and persist each round's winner
    Evolve {
        /// Number of rounds
        #[arg(short, long, default_value_t = 5)]
        rounds: usize,
        /// JSON config file; command-line flags override it
        #[arg(long)]
        config: Option<PathBuf>,
        #[arg(long)]
        symbol: Option<String>,
        /// First day of the backtest window (YYYY-MM-DD)
        #[arg(long)]
        start: Option<NaiveDate>,
        /// Last day of the backtest window (YYYY-MM-DD)
        #[arg(long)]
        end: Option<NaiveDate>,
        /// Bar size: D, W or M
        #[arg(long)]
        timeframe: Option<Timeframe>,
        #[arg(long)]
        population: Option<usize>,
        #[arg(long)]
        generations: Option<usize>,
        /// Seed for reproducible runs
        #[arg(long)]
        seed: Option<u64>,
        /// Families to pick from (comma-separated); default all
        #[arg(long, value_delimiter = ',')]
        strategies: Vec<String>,
        /// Load klines from a JSON file instead of Binance
        #[arg(long)]
        klines: Option<PathBuf>,
        /// Write the full run report as JSON
        #[arg(long)]
        export: Option<PathBuf>,
    },
    /// Show the best stored strategies
    Top {
        #[arg(short, long, default_value_t = 5)]
        n: usize,
    },
    /// List registered strategy families and their parameter spaces
    Families,
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = if verbose {
        EnvFilter::new("debug,engine=debug,persistence=debug,strategy_evolver=debug")
    } else {
        EnvFilter::new("info,engine=info,persistence=info,strategy_evolver=info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(false).compact())
        .with(filter)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    dotenvy::dotenv().ok();

    match cli.command {
        Commands::Evolve {
            rounds,
            config,
            symbol,
            start,
            end,
            timeframe,
            population,
            generations,
            seed,
            strategies,
            klines,
            export,
        } => {
            let mut cfg = load_config(config.as_deref()).await?;
            if let Some(symbol) = symbol {
                cfg.window.symbol = symbol.to_uppercase();
            }
            if let Some(start) = start {
                cfg.window.start_date = start;
            }
            if let Some(end) = end {
                cfg.window.end_date = end;
            }
            if let Some(timeframe) = timeframe {
                cfg.window.timeframe = timeframe;
            }
            if let Some(population) = population {
                cfg.genetic.population_size = population;
            }
            if let Some(generations) = generations {
                cfg.genetic.generations = generations;
            }
            if seed.is_some() {
                cfg.seed = seed;
            }
            if !strategies.is_empty() {
                cfg.strategies = strategies;
            }
            cfg.genetic = cfg.genetic.normalized();

            cmd_evolve(cfg, rounds, klines, export).await?;
        }
        Commands::Top { n } => {
            cmd_top(n).await?;
        }
        Commands::Families => {
            cmd_families()?;
        }
    }

    Ok(())
}

async fn load_config(path: Option<&Path>) -> anyhow::Result<EvolutionConfig> {
    let Some(path) = path else {
        return Ok(EvolutionConfig::default());
    };
    let raw = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read config {}", path.display()))?;
    let config = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid config {}", path.display()))?;
    info!(path = %path.display(), "Loaded config");
    Ok(config)
}

/// SQLite store, degrading to the fallback log alone if the database won't open
async fn open_store() -> StrategyStore {
    let db_path = std::env::var("EVOLVER_DB_PATH").unwrap_or_else(|_| "data/evolver.db".to_string());
    let log_path = std::env::var("EVOLVER_FALLBACK_LOG")
        .unwrap_or_else(|_| "data/strategies.jsonl".to_string());
    let fallback = AppendLog::new(&log_path);

    match Database::new(&db_path).await {
        Ok(db) => {
            info!(db = %db_path, fallback = %log_path, "Strategy store opened");
            StrategyStore::new(db.pool_clone(), fallback)
        }
        Err(e) => {
            warn!(db = %db_path, error = %e, "Database unavailable, using fallback log only");
            StrategyStore::fallback_only(fallback)
        }
    }
}

// ============================================================================
// evolve
// ============================================================================

async fn cmd_evolve(
    config: EvolutionConfig,
    rounds: usize,
    klines: Option<PathBuf>,
    export: Option<PathBuf>,
) -> anyhow::Result<()> {
    println!("\n=== Strategy Evolver v{} ===", APP_VERSION);

    let window = config.window.clone();
    println!(
        "Window: {} {} → {} ({})",
        window.symbol, window.start_date, window.end_date, window.timeframe
    );
    println!(
        "Rounds: {} | Population: {} | Generations: {} | Seed: {}",
        rounds,
        config.genetic.population_size,
        config.genetic.generations,
        config
            .seed
            .map(|s| s.to_string())
            .unwrap_or_else(|| "random".to_string())
    );
    println!();

    let mut market = MarketDataStore::new();
    let bars = match &klines {
        Some(path) => market.load_json(path, &window).await?,
        None => {
            print!("  Fetching market data from Binance...");
            std::io::stdout().flush().ok();
            let client = BinanceClient::new()?;
            let count = market.fetch_from_binance(&client, &window).await?;
            println!(" {} bars", count);
            count
        }
    };
    if market.slice(&window).is_empty() {
        anyhow::bail!(
            "No klines for {} between {} and {} ({} loaded)",
            window.symbol,
            window.start_date,
            window.end_date,
            bars
        );
    }

    let store = open_store().await;
    let adapter = Arc::new(BacktestAdapter::new(BarBacktester::new(Arc::new(market))));
    let mut manager = EvolutionManager::new(
        config,
        StrategyRegistry::with_defaults(),
        adapter.clone(),
        Arc::new(store),
    );
    let pool: Vec<&str> = if manager.config().strategies.is_empty() {
        manager.registry().ids().collect()
    } else {
        manager.config().strategies.iter().map(String::as_str).collect()
    };
    let weights = manager.config().fitness;
    println!(
        "Families: {} | Fitness: {}*return + {}*sharpe - {}*drawdown",
        pool.join(", "),
        weights.return_weight,
        weights.sharpe_weight,
        weights.drawdown_weight
    );
    let progress = manager.progress();

    let handle = tokio::spawn(async move { manager.run(rounds).await });

    // Progress display loop
    while !handle.is_finished() {
        tokio::time::sleep(tokio::time::Duration::from_millis(500)).await;

        let round = progress.current_round.load(Ordering::Relaxed);
        let generation = progress.current_generation.load(Ordering::Relaxed);
        let evaluations = progress.evaluations.load(Ordering::Relaxed);
        let strategy = progress.current_strategy().unwrap_or_default();
        let best = progress
            .best_score()
            .map(|s| format!("{s:.4}"))
            .unwrap_or_else(|| "-".to_string());

        let bar_len = 30;
        let filled = ((progress.progress_pct() as usize) * bar_len / 100).min(bar_len);
        let bar: String = "=".repeat(filled) + &" ".repeat(bar_len - filled);

        print!(
            "\r  Round {}/{} [{}] {:<20} gen {} | {} backtests | best {}   ",
            round, rounds, bar, strategy, generation, evaluations, best
        );
        std::io::stdout().flush().ok();
    }
    println!();

    let report = handle.await?;
    print_report(&report);
    println!(
        "\nBacktests: {} run, {} failed",
        adapter.run_count(),
        adapter.failure_count()
    );

    if let Some(path) = export {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(&path, json)?;
        println!("Report exported to {}", path.display());
    }

    Ok(())
}

fn print_report(report: &EvolutionReport) {
    println!(
        "\nRounds: {} completed, {} skipped, {} failed",
        report.completed(),
        report.skipped(),
        report.failed()
    );

    println!(
        "\n  {:>3}  {:<20} {:>9} {:>9} {:>8} {:>9}  {}",
        "#", "Strategy", "Score", "Return", "Sharpe", "Drawdown", "Params"
    );
    println!("  {}", "-".repeat(90));
    for outcome in &report.outcomes {
        match outcome {
            RoundOutcome::Completed(r) => println!(
                "  {:>3}  {:<20} {:>9.4} {:>+8.2}% {:>8.2} {:>8.2}%  {}",
                r.round,
                r.strategy_id,
                r.score,
                r.return_rate * 100.0,
                r.sharpe,
                r.drawdown * 100.0,
                r.params
            ),
            RoundOutcome::Skipped(r) => {
                println!("  {:>3}  {:<20} skipped (not registered)", r.round, r.strategy_id)
            }
            RoundOutcome::Failed {
                round,
                strategy_id,
                error,
            } => println!("  {:>3}  {:<20} FAILED: {}", round, strategy_id, error),
        }
    }

    print_records("Best stored strategies", &report.top_strategies);
}

fn print_records(title: &str, records: &[StrategyRecord]) {
    println!("\n{} ({}):", title, records.len());
    if records.is_empty() {
        println!("  (none)");
        return;
    }
    println!(
        "  {:>5}  {:<20} {:>9} {:>9} {:>8} {:>9}  {:<16}  {}",
        "Id", "Strategy", "Score", "Return", "Sharpe", "Drawdown", "Created", "Params"
    );
    println!("  {}", "-".repeat(110));
    for r in records {
        let created = Utc
            .timestamp_opt(r.created_at, 0)
            .single()
            .map(|t| t.format("%Y-%m-%d %H:%M").to_string())
            .unwrap_or_default();
        println!(
            "  {:>5}  {:<20} {:>9.4} {:>+8.2}% {:>8.2} {:>8.2}%  {:<16}  {}",
            r.id,
            r.strategy_id,
            r.score,
            r.return_rate * 100.0,
            r.sharpe,
            r.drawdown * 100.0,
            created,
            r.params
        );
    }
}

// ============================================================================
// top / families
// ============================================================================

async fn cmd_top(n: usize) -> anyhow::Result<()> {
    let store = open_store().await;
    let records = store
        .get_best(n)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to read strategies: {}", e))?;
    let stored = store.count().await.unwrap_or(0);

    println!("\n=== Strategy Evolver v{} ===", APP_VERSION);
    println!("{} strategies in database", stored);
    print_records("Top strategies", &records);
    Ok(())
}

fn cmd_families() -> anyhow::Result<()> {
    let registry = StrategyRegistry::with_defaults();
    println!("\nRegistered strategy families ({}):", registry.len());
    for family in registry.families() {
        println!(
            "  {:<22} {:<22} {}",
            family.id,
            family.label,
            serde_json::to_string(&family.space)?
        );
    }
    Ok(())
}
