//! Evolution rounds
//!
//! A round picks one strategy family, runs a genetic search over its
//! parameter space against the backtest adapter, re-runs the winner once for
//! authoritative metrics and persists it. Rounds are independent and run one
//! after another:
//!
//! ```text
//! PENDING ──► SKIPPED    family not registered, zero-score placeholder
//!         ──► COMPLETED  optimized + final backtest + persisted (or not)
//!         ──► FAILED     optimize/final backtest panicked, round dropped
//! ```
//!
//! Neither SKIPPED nor FAILED stops the run.

use persistence::{NewStrategyRecord, StrategyRecord};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::{
    atomic::{AtomicU32, AtomicU64, Ordering},
    Arc, RwLock,
};
use tracing::{error, info, warn};

use crate::backtest::{BacktestAdapter, BacktestOutcome, BacktestWindow};
use crate::fitness::{FitnessEvaluator, FitnessWeights};
use crate::genetic::{GeneticConfig, GeneticOptimizer, OptimizationResult};
use crate::params::Individual;
use crate::repository::StrategyRepository;
use crate::strategies::{StrategyFamily, StrategyRegistry};

// ============================================================================
// Configuration
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvolutionConfig {
    pub genetic: GeneticConfig,
    pub window: BacktestWindow,
    /// Families to pick from; empty means every registered family
    pub strategies: Vec<String>,
    pub fitness: FitnessWeights,
    /// Seeds family picks and per-round optimizer seeds
    pub seed: Option<u64>,
    /// How many stored strategies to report after the run
    pub top_n: usize,
}

impl Default for EvolutionConfig {
    fn default() -> Self {
        Self {
            genetic: GeneticConfig::default(),
            window: BacktestWindow::default(),
            strategies: Vec::new(),
            fitness: FitnessWeights::default(),
            seed: None,
            top_n: 5,
        }
    }
}

// ============================================================================
// Progress
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvolutionStatus {
    Idle,
    Running,
    Complete,
}

/// Shared progress tracker between a running evolution and its observers
pub struct EvolutionProgress {
    pub status: RwLock<EvolutionStatus>,
    pub total_rounds: AtomicU32,
    pub current_round: AtomicU32,
    pub current_generation: AtomicU32,
    pub evaluations: AtomicU64,
    pub completed: AtomicU32,
    pub skipped: AtomicU32,
    pub failed: AtomicU32,
    pub current_strategy: RwLock<Option<String>>,
    pub best_score: RwLock<Option<f64>>,
}

impl EvolutionProgress {
    pub fn new() -> Self {
        Self {
            status: RwLock::new(EvolutionStatus::Idle),
            total_rounds: AtomicU32::new(0),
            current_round: AtomicU32::new(0),
            current_generation: AtomicU32::new(0),
            evaluations: AtomicU64::new(0),
            completed: AtomicU32::new(0),
            skipped: AtomicU32::new(0),
            failed: AtomicU32::new(0),
            current_strategy: RwLock::new(None),
            best_score: RwLock::new(None),
        }
    }

    /// Reset for a new run
    pub fn reset(&self, total_rounds: u32) {
        self.set_status(EvolutionStatus::Running);
        self.total_rounds.store(total_rounds, Ordering::Relaxed);
        self.current_round.store(0, Ordering::Relaxed);
        self.current_generation.store(0, Ordering::Relaxed);
        self.evaluations.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.skipped.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        if let Ok(mut s) = self.current_strategy.write() {
            *s = None;
        }
        if let Ok(mut b) = self.best_score.write() {
            *b = None;
        }
    }

    pub fn set_status(&self, status: EvolutionStatus) {
        if let Ok(mut s) = self.status.write() {
            *s = status;
        }
    }

    pub fn status(&self) -> EvolutionStatus {
        self.status
            .read()
            .map(|s| *s)
            .unwrap_or(EvolutionStatus::Idle)
    }

    pub fn is_running(&self) -> bool {
        self.status() == EvolutionStatus::Running
    }

    fn start_round(&self, round: u32, strategy: &str) {
        self.current_round.store(round, Ordering::Relaxed);
        self.current_generation.store(0, Ordering::Relaxed);
        if let Ok(mut s) = self.current_strategy.write() {
            *s = Some(strategy.to_string());
        }
    }

    fn record_score(&self, score: f64) {
        if let Ok(mut best) = self.best_score.write() {
            if best.map_or(true, |b| score > b) {
                *best = Some(score);
            }
        }
    }

    pub fn current_strategy(&self) -> Option<String> {
        self.current_strategy.read().ok().and_then(|s| s.clone())
    }

    pub fn best_score(&self) -> Option<f64> {
        self.best_score.read().ok().and_then(|b| *b)
    }

    /// Finished rounds (any outcome) as a percentage of the run
    pub fn progress_pct(&self) -> f32 {
        let total = self.total_rounds.load(Ordering::Relaxed);
        let done = self.completed.load(Ordering::Relaxed)
            + self.skipped.load(Ordering::Relaxed)
            + self.failed.load(Ordering::Relaxed);
        if total == 0 {
            0.0
        } else {
            (done as f32 / total as f32) * 100.0
        }
    }
}

impl Default for EvolutionProgress {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// Results
// ============================================================================

/// Summary row of one round
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RoundResult {
    pub round: usize,
    pub strategy_id: String,
    pub strategy_type: String,
    pub params: Individual,
    pub score: f64,
    #[serde(rename = "return")]
    pub return_rate: f64,
    pub sharpe: f64,
    pub drawdown: f64,
    /// Repository id; `None` when the round was not persisted
    pub record_id: Option<i64>,
}

impl RoundResult {
    fn placeholder(round: usize, strategy_id: &str) -> Self {
        Self {
            round,
            strategy_id: strategy_id.to_string(),
            strategy_type: String::new(),
            params: Individual::new(),
            score: 0.0,
            return_rate: 0.0,
            sharpe: 0.0,
            drawdown: 0.0,
            record_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum RoundOutcome {
    Completed(RoundResult),
    Skipped(RoundResult),
    Failed {
        round: usize,
        strategy_id: String,
        error: String,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct EvolutionReport {
    /// Completed rounds plus skip placeholders, in round order
    pub results: Vec<RoundResult>,
    pub outcomes: Vec<RoundOutcome>,
    /// Repository's best records after the run
    pub top_strategies: Vec<StrategyRecord>,
}

impl EvolutionReport {
    pub fn completed(&self) -> usize {
        self.count(|o| matches!(o, RoundOutcome::Completed(_)))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, RoundOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, RoundOutcome::Failed { .. }))
    }

    fn count(&self, pred: impl Fn(&RoundOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|o| pred(o)).count()
    }
}

// ============================================================================
// Manager
// ============================================================================

pub struct EvolutionManager {
    config: EvolutionConfig,
    registry: StrategyRegistry,
    adapter: Arc<BacktestAdapter>,
    repository: Arc<dyn StrategyRepository>,
    evaluator: FitnessEvaluator,
    progress: Arc<EvolutionProgress>,
    rng: StdRng,
}

impl EvolutionManager {
    pub fn new(
        config: EvolutionConfig,
        registry: StrategyRegistry,
        adapter: Arc<BacktestAdapter>,
        repository: Arc<dyn StrategyRepository>,
    ) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            evaluator: FitnessEvaluator::new(config.fitness),
            config,
            registry,
            adapter,
            repository,
            progress: Arc::new(EvolutionProgress::new()),
            rng,
        }
    }

    /// Report progress into an externally owned tracker
    pub fn with_progress(mut self, progress: Arc<EvolutionProgress>) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> Arc<EvolutionProgress> {
        self.progress.clone()
    }

    pub fn config(&self) -> &EvolutionConfig {
        &self.config
    }

    pub fn registry(&self) -> &StrategyRegistry {
        &self.registry
    }

    /// Run `rounds` rounds sequentially, then fetch the repository's top-N.
    /// Never fails: every round ends up COMPLETED, SKIPPED or FAILED.
    pub async fn run(&mut self, rounds: usize) -> EvolutionReport {
        self.progress.reset(rounds as u32);

        info!(
            rounds,
            symbol = %self.config.window.symbol,
            start = %self.config.window.start_date,
            end = %self.config.window.end_date,
            timeframe = %self.config.window.timeframe,
            population = self.config.genetic.population_size,
            generations = self.config.genetic.generations,
            "Starting evolution"
        );

        let mut outcomes = Vec::with_capacity(rounds);
        for round in 1..=rounds {
            let outcome = self.run_round(round).await;
            let counter = match &outcome {
                RoundOutcome::Completed(_) => &self.progress.completed,
                RoundOutcome::Skipped(_) => &self.progress.skipped,
                RoundOutcome::Failed { .. } => &self.progress.failed,
            };
            counter.fetch_add(1, Ordering::Relaxed);
            outcomes.push(outcome);
        }

        let results: Vec<RoundResult> = outcomes
            .iter()
            .filter_map(|o| match o {
                RoundOutcome::Completed(r) | RoundOutcome::Skipped(r) => Some(r.clone()),
                RoundOutcome::Failed { .. } => None,
            })
            .collect();

        let top_strategies = match self.repository.get_best(self.config.top_n).await {
            Ok(records) => records,
            Err(e) => {
                warn!(error = %e, "Could not fetch top strategies");
                Vec::new()
            }
        };

        self.progress.set_status(EvolutionStatus::Complete);

        let report = EvolutionReport {
            results,
            outcomes,
            top_strategies,
        };
        info!(
            completed = report.completed(),
            skipped = report.skipped(),
            failed = report.failed(),
            top = report.top_strategies.len(),
            best_score = ?self.progress.best_score(),
            "Evolution finished"
        );
        report
    }

    async fn run_round(&mut self, round: usize) -> RoundOutcome {
        // 1. Pick strategy
        let picked = self.registry.pick(&self.config.strategies, &mut self.rng);
        let round_seed: u64 = self.rng.gen();

        let Some(strategy_id) = picked else {
            warn!(round, "No strategy families available, skipping round");
            return RoundOutcome::Skipped(RoundResult::placeholder(round, ""));
        };
        self.progress.start_round(round as u32, &strategy_id);

        let Some(family) = self.registry.get(&strategy_id).cloned() else {
            warn!(round, strategy = %strategy_id, "Strategy family not registered, skipping round");
            return RoundOutcome::Skipped(RoundResult::placeholder(round, &strategy_id));
        };

        let genetic = GeneticConfig {
            seed: Some(self.config.genetic.seed.unwrap_or(round_seed)),
            ..self.config.genetic.clone()
        };

        info!(round, strategy = %family.id, params = family.space.len(), "Round started");

        // 2-3. Optimize + final backtest, isolated on a blocking worker
        let (result, final_outcome) = match self.optimize_family(&family, &genetic).await {
            Ok(v) => v,
            Err(message) => {
                error!(round, strategy = %family.id, error = %message, "Round failed");
                return RoundOutcome::Failed {
                    round,
                    strategy_id: family.id,
                    error: message,
                };
            }
        };

        let metrics = final_outcome.metrics();
        let score = self.evaluator.evaluate(&metrics);
        self.progress.record_score(score);

        // 4. Persist
        let record = NewStrategyRecord {
            strategy_id: family.id.clone(),
            strategy_type: family.label.clone(),
            params: result.best.to_json(),
            score,
            return_rate: metrics.return_rate,
            sharpe: metrics.sharpe,
            drawdown: metrics.drawdown,
            meta: json!({
                "round": round,
                "window": self.config.window,
                "genetic": genetic,
                "fitness": self.evaluator.weights(),
                "ga_best_fitness": result.best_fitness,
                "evaluations": result.evaluations,
                "history": result.history,
                "backtest_failed": final_outcome.is_failure(),
            }),
        };

        let record_id = match self.repository.save(record).await {
            Ok(id) => Some(id),
            Err(e) => {
                error!(round, strategy = %family.id, error = %e, "Could not persist round result");
                None
            }
        };

        info!(
            round,
            strategy = %family.id,
            params = %result.best,
            score,
            ret = metrics.return_rate,
            sharpe = metrics.sharpe,
            drawdown = metrics.drawdown,
            record_id = ?record_id,
            "Round completed"
        );

        // 5. Collect
        RoundOutcome::Completed(RoundResult {
            round,
            strategy_id: family.id,
            strategy_type: family.label,
            params: result.best,
            score,
            return_rate: metrics.return_rate,
            sharpe: metrics.sharpe,
            drawdown: metrics.drawdown,
            record_id,
        })
    }

    async fn optimize_family(
        &self,
        family: &StrategyFamily,
        genetic: &GeneticConfig,
    ) -> Result<(OptimizationResult, BacktestOutcome), String> {
        let adapter = self.adapter.clone();
        let progress = self.progress.clone();
        let evaluator = self.evaluator;
        let window = self.config.window.clone();
        let strategy_id = family.id.clone();
        let space = family.space.clone();
        let genetic = genetic.clone();

        let handle = tokio::task::spawn_blocking(move || {
            let mut optimizer = GeneticOptimizer::new(space, genetic);
            let fitness_fn = |individual: &Individual| {
                progress.evaluations.fetch_add(1, Ordering::Relaxed);
                evaluator.evaluate(&adapter.run_backtest(&strategy_id, individual, &window))
            };
            let result = optimizer.optimize_with_observer(fitness_fn, |state| {
                progress
                    .current_generation
                    .store(state.generation as u32 + 1, Ordering::Relaxed);
            });

            let final_outcome = adapter.evaluate(&strategy_id, &result.best, &window);
            (result, final_outcome)
        });

        handle.await.map_err(|e| {
            if e.is_panic() {
                let payload = e.into_panic();
                payload
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| payload.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "panic with non-string payload".to_string())
            } else {
                e.to_string()
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config: EvolutionConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.top_n, 5);
        assert_eq!(config.genetic.population_size, 20);
        assert_eq!(config.window.symbol, "BTCUSDT");
        assert!(config.strategies.is_empty());
    }

    #[test]
    fn test_config_partial_override() {
        let config: EvolutionConfig = serde_json::from_value(json!({
            "genetic": {"population_size": 6, "generations": 3},
            "strategies": ["dual_ma"],
            "fitness": {"sharpe": 0.5},
            "seed": 7,
        }))
        .unwrap();
        assert_eq!(config.genetic.population_size, 6);
        assert_eq!(config.genetic.crossover_rate, 0.8);
        assert_eq!(config.strategies, vec!["dual_ma".to_string()]);
        assert_eq!(config.fitness.sharpe_weight, 0.5);
        assert_eq!(config.seed, Some(7));
    }

    #[test]
    fn test_progress_tracking() {
        let progress = EvolutionProgress::new();
        assert!(!progress.is_running());

        progress.reset(4);
        assert!(progress.is_running());
        progress.completed.fetch_add(1, Ordering::Relaxed);
        progress.failed.fetch_add(1, Ordering::Relaxed);
        assert_eq!(progress.progress_pct(), 50.0);

        progress.record_score(0.2);
        progress.record_score(-0.1);
        assert_eq!(progress.best_score(), Some(0.2));

        progress.start_round(3, "macd_trend");
        assert_eq!(progress.current_strategy().as_deref(), Some("macd_trend"));
    }

    #[test]
    fn test_outcome_json_is_tagged() {
        let outcome = RoundOutcome::Failed {
            round: 2,
            strategy_id: "dual_ma".to_string(),
            error: "boom".to_string(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "failed");
        assert_eq!(value["round"], 2);
    }
}
