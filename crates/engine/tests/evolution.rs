//! End-to-end evolution runs against scripted backtest runners

use async_trait::async_trait;
use engine::{
    BacktestAdapter, BacktestError, BacktestReport, BacktestRequest, BacktestRunner,
    EvolutionConfig, EvolutionManager, GeneticConfig, InMemoryStrategyRepository,
    ParameterSpace, RoundOutcome, StrategyRegistry, StrategyRepository,
};
use persistence::{NewStrategyRecord, StrategyRecord};
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

const POPULATION: usize = 4;
const GENERATIONS: usize = 2;
/// GA evaluations plus the final backtest
const CALLS_PER_ROUND: u64 = (POPULATION * GENERATIONS) as u64 + 1;

/// Deterministic runner: return grows with `fast`, optionally panicking on
/// one specific call
struct ScriptedRunner {
    calls: AtomicU64,
    panic_on_call: Option<u64>,
}

impl ScriptedRunner {
    fn new() -> Self {
        Self {
            calls: AtomicU64::new(0),
            panic_on_call: None,
        }
    }

    fn panicking_on(call: u64) -> Self {
        Self {
            calls: AtomicU64::new(0),
            panic_on_call: Some(call),
        }
    }
}

impl BacktestRunner for ScriptedRunner {
    fn simulate(&self, request: &BacktestRequest<'_>) -> Result<BacktestReport, BacktestError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if self.panic_on_call == Some(call) {
            panic!("simulator crashed on call {call}");
        }
        let fast = request.params.get_f64("fast").unwrap_or(0.0);
        Ok(BacktestReport {
            total_return: fast / 100.0,
            max_drawdown: 0.1,
            sharpe: Some(1.0),
            equity_curve: Vec::new(),
        })
    }
}

struct BrokenRunner;

impl BacktestRunner for BrokenRunner {
    fn simulate(&self, _: &BacktestRequest<'_>) -> Result<BacktestReport, BacktestError> {
        Err(BacktestError::Runner("exchange data unavailable".to_string()))
    }
}

/// Repository whose writes always fail
struct UnwritableRepository;

#[async_trait]
impl StrategyRepository for UnwritableRepository {
    async fn save(&self, _: NewStrategyRecord) -> anyhow::Result<i64> {
        anyhow::bail!("disk full")
    }

    async fn get_best(&self, _: usize) -> anyhow::Result<Vec<StrategyRecord>> {
        Ok(Vec::new())
    }
}

fn registry() -> StrategyRegistry {
    let mut registry = StrategyRegistry::new();
    registry.register(
        "dual_ma",
        "Dual MA Crossover",
        ParameterSpace::new()
            .with_integer("fast", 5, 30)
            .with_integer("slow", 15, 60),
    );
    registry
}

fn config(seed: u64) -> EvolutionConfig {
    EvolutionConfig {
        genetic: GeneticConfig {
            population_size: POPULATION,
            generations: GENERATIONS,
            parallel: false,
            ..Default::default()
        },
        seed: Some(seed),
        ..Default::default()
    }
}

fn manager(
    config: EvolutionConfig,
    runner: impl BacktestRunner + 'static,
    repository: Arc<dyn StrategyRepository>,
) -> EvolutionManager {
    EvolutionManager::new(
        config,
        registry(),
        Arc::new(BacktestAdapter::new(runner)),
        repository,
    )
}

#[tokio::test]
async fn test_panicking_round_is_isolated() {
    let repo = Arc::new(InMemoryStrategyRepository::new());
    // Round 2's final backtest is the last call of its block
    let runner = ScriptedRunner::panicking_on(2 * CALLS_PER_ROUND);
    let mut manager = manager(config(1), runner, repo.clone());

    let report = manager.run(3).await;

    assert_eq!(report.results.len(), 2);
    assert_eq!(report.results[0].round, 1);
    assert_eq!(report.results[1].round, 3);
    assert!(matches!(
        &report.outcomes[1],
        RoundOutcome::Failed { round: 2, error, .. } if error.contains("simulator crashed")
    ));
    assert_eq!(report.failed(), 1);
    assert_eq!(repo.len(), 2);
    assert_eq!(report.top_strategies.len(), 2);
}

#[tokio::test]
async fn test_completed_rounds_are_persisted_and_ranked() {
    let repo = Arc::new(InMemoryStrategyRepository::new());
    let mut manager = manager(config(2), ScriptedRunner::new(), repo.clone());

    let report = manager.run(3).await;

    assert_eq!(report.completed(), 3);
    assert_eq!(repo.len(), 3);
    for result in &report.results {
        assert_eq!(result.strategy_id, "dual_ma");
        assert_eq!(result.strategy_type, "Dual MA Crossover");
        assert!(result.record_id.unwrap() > 0);
        // 0.4 * fast/100 + 0.3 * 1.0 - 0.3 * 0.1
        let fast = result.params.get_f64("fast").unwrap();
        let expected = ((0.4 * fast / 100.0 + 0.27) * 1e6).round() / 1e6;
        assert_eq!(result.score, expected);
    }

    let scores: Vec<f64> = report.top_strategies.iter().map(|r| r.score).collect();
    let mut sorted = scores.clone();
    sorted.sort_by(|a, b| b.total_cmp(a));
    assert_eq!(scores, sorted);

    let stored = repo.records();
    assert_eq!(stored[0].meta["round"], 1);
    assert_eq!(stored[0].meta["backtest_failed"], false);
    assert_eq!(stored[0].meta["fitness"]["return"], 0.4);
    assert_eq!(stored[0].meta["fitness"]["drawdown"], 0.3);
    assert_eq!(stored[0].meta["history"].as_array().unwrap().len(), GENERATIONS);
}

#[tokio::test]
async fn test_unregistered_family_is_skipped_with_placeholder() {
    let repo = Arc::new(InMemoryStrategyRepository::new());
    let mut config = config(3);
    config.strategies = vec!["martingale".to_string()];
    let mut manager = manager(config, ScriptedRunner::new(), repo.clone());

    let report = manager.run(2).await;

    assert_eq!(report.skipped(), 2);
    assert_eq!(report.results.len(), 2);
    for result in &report.results {
        assert_eq!(result.strategy_id, "martingale");
        assert_eq!(result.score, 0.0);
        assert!(result.params.is_empty());
        assert_eq!(result.record_id, None);
    }
    assert!(repo.is_empty());
}

#[tokio::test]
async fn test_failing_backtests_score_degenerate() {
    let repo = Arc::new(InMemoryStrategyRepository::new());
    let adapter = Arc::new(BacktestAdapter::new(BrokenRunner));
    let mut manager = EvolutionManager::new(config(4), registry(), adapter.clone(), repo.clone());

    let report = manager.run(1).await;

    assert_eq!(report.completed(), 1);
    let result = &report.results[0];
    assert_eq!(result.score, -0.3);
    assert_eq!(result.return_rate, 0.0);
    assert_eq!(result.drawdown, 1.0);
    assert_eq!(adapter.failure_count(), CALLS_PER_ROUND);
    assert_eq!(repo.records()[0].meta["backtest_failed"], true);
}

#[tokio::test]
async fn test_persistence_failure_still_completes_round() {
    let mut manager = manager(config(5), ScriptedRunner::new(), Arc::new(UnwritableRepository));

    let report = manager.run(2).await;

    assert_eq!(report.completed(), 2);
    assert!(report.results.iter().all(|r| r.record_id.is_none()));
    assert!(report.top_strategies.is_empty());
}

#[tokio::test]
async fn test_top_strategies_reflect_prior_state_when_all_rounds_fail() {
    let repo = Arc::new(InMemoryStrategyRepository::new());
    repo.save(NewStrategyRecord {
        strategy_id: "macd_trend".to_string(),
        strategy_type: "MACD Trend".to_string(),
        params: json!({"fast": 12, "slow": 26, "signal": 9}),
        score: 0.42,
        return_rate: 0.3,
        sharpe: 1.2,
        drawdown: 0.15,
        meta: json!({}),
    })
    .await
    .unwrap();

    // First call of every round panics
    struct AlwaysPanics;
    impl BacktestRunner for AlwaysPanics {
        fn simulate(&self, _: &BacktestRequest<'_>) -> Result<BacktestReport, BacktestError> {
            panic!("segfault in native simulator")
        }
    }

    let mut manager = manager(config(6), AlwaysPanics, repo.clone());
    let report = manager.run(2).await;

    assert!(report.results.is_empty());
    assert_eq!(report.failed(), 2);
    assert_eq!(report.top_strategies.len(), 1);
    assert_eq!(report.top_strategies[0].strategy_id, "macd_trend");
}

#[tokio::test]
async fn test_seeded_runs_are_reproducible() {
    let run = || async {
        let repo = Arc::new(InMemoryStrategyRepository::new());
        let mut registry = registry();
        registry.register(
            "rsi_reversion",
            "RSI Reversion",
            ParameterSpace::new()
                .with_integer("fast", 5, 30)
                .with_real("oversold", 15.0, 40.0),
        );
        let mut manager = EvolutionManager::new(
            config(77),
            registry,
            Arc::new(BacktestAdapter::new(ScriptedRunner::new())),
            repo,
        );
        manager.run(4).await.results
    };

    assert_eq!(run().await, run().await);
}

#[tokio::test]
async fn test_progress_reports_finished_run() {
    let repo = Arc::new(InMemoryStrategyRepository::new());
    let mut manager = manager(config(8), ScriptedRunner::new(), repo);
    let progress = manager.progress();

    manager.run(2).await;

    assert!(!progress.is_running());
    assert_eq!(progress.progress_pct(), 100.0);
    assert_eq!(
        progress.evaluations.load(Ordering::Relaxed),
        2 * (POPULATION * GENERATIONS) as u64
    );
    assert!(progress.best_score().is_some());
}

#[tokio::test]
async fn test_sqlite_store_backs_the_run() {
    let db = persistence::Database::in_memory().await.unwrap();
    let path = std::env::temp_dir().join(format!("evolver-it-{}.jsonl", std::process::id()));
    let _ = std::fs::remove_file(&path);
    let store = persistence::StrategyStore::new(db.pool_clone(), persistence::AppendLog::new(&path));

    let mut manager = manager(config(9), ScriptedRunner::new(), Arc::new(store));
    let report = manager.run(3).await;

    assert_eq!(report.completed(), 3);
    let ids: Vec<i64> = report.results.iter().filter_map(|r| r.record_id).collect();
    assert_eq!(ids, vec![1, 2, 3]);
    assert_eq!(report.top_strategies.len(), 3);
}
