//! Strategy Evolver Engine: genetic parameter search for trading strategies
//!
//! Provides:
//! - Parameter spaces with typed integer/real genes
//! - Genetic optimizer (elitism, blend crossover, type-aware mutation)
//! - Composite fitness over return, sharpe and drawdown
//! - Never-failing backtest adapter over a pluggable runner, plus a built-in
//!   bar-by-bar simulator for four indicator families
//! - Evolution manager running isolated optimize-and-persist rounds
//! - Binance public API client for historical klines

pub mod api;
pub mod backtest;
pub mod evolution;
pub mod fitness;
pub mod genetic;
pub mod indicators;
pub mod market_data;
pub mod params;
pub mod repository;
pub mod simulator;
pub mod strategies;
pub mod types;

// Re-exports for convenience
pub use api::BinanceClient;
pub use backtest::{
    sharpe_from_equity, BacktestAdapter, BacktestError, BacktestMetrics, BacktestOutcome,
    BacktestReport, BacktestRequest, BacktestRunner, BacktestWindow, Timeframe,
};
pub use evolution::{
    EvolutionConfig, EvolutionManager, EvolutionProgress, EvolutionReport, EvolutionStatus,
    RoundOutcome, RoundResult,
};
pub use fitness::{FitnessEvaluator, FitnessWeights};
pub use genetic::{
    GenerationState, GenerationSummary, GeneticConfig, GeneticOptimizer, OptimizationResult,
};
pub use indicators::{build_generator, SignalGenerator};
pub use market_data::MarketDataStore;
pub use params::{random_individual, Individual, ParamBounds, ParamValue, ParameterSpace};
pub use repository::{InMemoryStrategyRepository, StrategyRepository};
pub use simulator::BarBacktester;
pub use strategies::{StrategyFamily, StrategyRegistry};
pub use types::*;
