//! Backtest adapter boundary
//!
//! The optimizer only ever sees `BacktestMetrics`. Whatever goes wrong inside
//! a runner is captured as a `BacktestOutcome::Failed` and surfaced to the
//! fitness function as the degenerate metrics
//! `{return: 0, sharpe: 0, drawdown: 1}`, so a broken backtest scores low
//! instead of aborting a generation.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

use crate::params::Individual;
use crate::types::EquityPoint;

/// Trading days per year used to annualize sharpe
pub const TRADING_DAYS_PER_YEAR: f64 = 252.0;

// ============================================================================
// Request types
// ============================================================================

/// Bar size of the historical data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Timeframe {
    #[default]
    #[serde(rename = "D")]
    Daily,
    #[serde(rename = "W")]
    Weekly,
    #[serde(rename = "M")]
    Monthly,
}

impl Timeframe {
    /// Binance kline interval for this timeframe
    pub fn interval(&self) -> &'static str {
        match self {
            Timeframe::Daily => "1d",
            Timeframe::Weekly => "1w",
            Timeframe::Monthly => "1M",
        }
    }
}

impl std::fmt::Display for Timeframe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Timeframe::Daily => write!(f, "D"),
            Timeframe::Weekly => write!(f, "W"),
            Timeframe::Monthly => write!(f, "M"),
        }
    }
}

impl FromStr for Timeframe {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "D" => Ok(Timeframe::Daily),
            "W" => Ok(Timeframe::Weekly),
            "M" => Ok(Timeframe::Monthly),
            other => Err(BacktestError::InvalidParameters(format!(
                "unknown timeframe '{other}', expected D, W or M"
            ))),
        }
    }
}

/// Fixed market context shared by every backtest of a round
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestWindow {
    pub symbol: String,
    /// Inclusive, `YYYY-MM-DD`
    pub start_date: NaiveDate,
    /// Inclusive, `YYYY-MM-DD`
    pub end_date: NaiveDate,
    pub timeframe: Timeframe,
}

impl Default for BacktestWindow {
    fn default() -> Self {
        Self {
            symbol: "BTCUSDT".to_string(),
            start_date: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or(NaiveDate::MIN),
            end_date: NaiveDate::from_ymd_opt(2024, 12, 31).unwrap_or(NaiveDate::MIN),
            timeframe: Timeframe::Daily,
        }
    }
}

/// One backtest invocation
#[derive(Debug, Clone, Copy)]
pub struct BacktestRequest<'a> {
    pub strategy_id: &'a str,
    pub params: &'a Individual,
    pub window: &'a BacktestWindow,
}

// ============================================================================
// Results
// ============================================================================

/// Normalized metrics consumed by the fitness evaluator
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BacktestMetrics {
    #[serde(rename = "return")]
    pub return_rate: f64,
    pub sharpe: f64,
    /// Peak-to-trough loss as a non-negative fraction
    pub drawdown: f64,
}

impl BacktestMetrics {
    /// Valid but low-scoring metrics reported for a failed backtest
    pub fn degenerate() -> Self {
        Self {
            return_rate: 0.0,
            sharpe: 0.0,
            drawdown: 1.0,
        }
    }
}

/// What a runner produces before normalization
#[derive(Debug, Clone, Default)]
pub struct BacktestReport {
    pub total_return: f64,
    pub max_drawdown: f64,
    /// When absent, sharpe is derived from `equity_curve`
    pub sharpe: Option<f64>,
    pub equity_curve: Vec<EquityPoint>,
}

#[derive(Error, Debug)]
pub enum BacktestError {
    #[error("Unknown strategy: {0}")]
    UnknownStrategy(String),

    #[error("Strategy {strategy} is missing parameter '{param}'")]
    MissingParameter { strategy: String, param: String },

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    #[error("No market data for {symbol} ({timeframe})")]
    NoMarketData { symbol: String, timeframe: Timeframe },

    #[error("Backtest produced a non-finite {0}")]
    NonFiniteMetric(&'static str),

    #[error("Backtest runner failed: {0}")]
    Runner(String),
}

/// Explicit result of one adapter call. `Failed` keeps the cause for
/// observability while still scoring as the degenerate metrics.
#[derive(Debug)]
pub enum BacktestOutcome {
    Completed(BacktestMetrics),
    Failed(BacktestError),
}

impl BacktestOutcome {
    pub fn metrics(&self) -> BacktestMetrics {
        match self {
            BacktestOutcome::Completed(m) => *m,
            BacktestOutcome::Failed(_) => BacktestMetrics::degenerate(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, BacktestOutcome::Failed(_))
    }
}

// ============================================================================
// Runner + adapter
// ============================================================================

/// Executes one simulation. Implementations may fail; the adapter absorbs it.
pub trait BacktestRunner: Send + Sync {
    fn simulate(&self, request: &BacktestRequest<'_>) -> Result<BacktestReport, BacktestError>;
}

/// Never-failing facade over a `BacktestRunner`
pub struct BacktestAdapter {
    runner: Arc<dyn BacktestRunner>,
    runs: AtomicU64,
    failures: AtomicU64,
}

impl BacktestAdapter {
    pub fn new(runner: impl BacktestRunner + 'static) -> Self {
        Self::from_arc(Arc::new(runner))
    }

    pub fn from_arc(runner: Arc<dyn BacktestRunner>) -> Self {
        Self {
            runner,
            runs: AtomicU64::new(0),
            failures: AtomicU64::new(0),
        }
    }

    /// Run a backtest and report success or failure explicitly
    pub fn evaluate(
        &self,
        strategy_id: &str,
        params: &Individual,
        window: &BacktestWindow,
    ) -> BacktestOutcome {
        self.runs.fetch_add(1, Ordering::Relaxed);

        let request = BacktestRequest {
            strategy_id,
            params,
            window,
        };
        let result = self.runner.simulate(&request).and_then(normalize);

        match result {
            Ok(metrics) => BacktestOutcome::Completed(metrics),
            Err(e) => {
                self.failures.fetch_add(1, Ordering::Relaxed);
                warn!(
                    strategy = strategy_id,
                    symbol = %window.symbol,
                    params = %params,
                    error = %e,
                    "Backtest failed, scoring as degenerate"
                );
                BacktestOutcome::Failed(e)
            }
        }
    }

    /// Run a backtest; failures come back as `BacktestMetrics::degenerate()`
    pub fn run_backtest(
        &self,
        strategy_id: &str,
        params: &Individual,
        window: &BacktestWindow,
    ) -> BacktestMetrics {
        self.evaluate(strategy_id, params, window).metrics()
    }

    pub fn run_count(&self) -> u64 {
        self.runs.load(Ordering::Relaxed)
    }

    pub fn failure_count(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }
}

fn normalize(report: BacktestReport) -> Result<BacktestMetrics, BacktestError> {
    let sharpe = report
        .sharpe
        .unwrap_or_else(|| sharpe_from_equity(&report.equity_curve));

    if !report.total_return.is_finite() {
        return Err(BacktestError::NonFiniteMetric("return"));
    }
    if !sharpe.is_finite() {
        return Err(BacktestError::NonFiniteMetric("sharpe"));
    }
    if !report.max_drawdown.is_finite() {
        return Err(BacktestError::NonFiniteMetric("drawdown"));
    }

    Ok(BacktestMetrics {
        return_rate: report.total_return,
        sharpe,
        drawdown: report.max_drawdown.abs(),
    })
}

/// Annualized sharpe of per-step simple returns of an equity curve.
///
/// Mean is scaled by 252 and the sample standard deviation by sqrt(252).
/// Fewer than two points or a flat return series yields 0.
pub fn sharpe_from_equity(curve: &[EquityPoint]) -> f64 {
    if curve.len() < 2 {
        return 0.0;
    }

    let returns: Vec<f64> = curve
        .windows(2)
        .map(|w| w[1].value / w[0].value - 1.0)
        .filter(|r| r.is_finite())
        .collect();

    if returns.len() < 2 {
        return 0.0;
    }

    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    let std_dev = variance.sqrt();

    if std_dev < 1e-12 {
        return 0.0;
    }

    (mean * TRADING_DAYS_PER_YEAR) / (std_dev * TRADING_DAYS_PER_YEAR.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::ParamValue;

    struct FailingRunner;

    impl BacktestRunner for FailingRunner {
        fn simulate(&self, _: &BacktestRequest<'_>) -> Result<BacktestReport, BacktestError> {
            Err(BacktestError::Runner("data source offline".to_string()))
        }
    }

    struct FixedRunner(BacktestReport);

    impl BacktestRunner for FixedRunner {
        fn simulate(&self, _: &BacktestRequest<'_>) -> Result<BacktestReport, BacktestError> {
            Ok(self.0.clone())
        }
    }

    fn curve(values: &[f64]) -> Vec<EquityPoint> {
        values
            .iter()
            .enumerate()
            .map(|(i, &value)| EquityPoint {
                time: i as i64,
                value,
            })
            .collect()
    }

    fn params() -> Individual {
        Individual::new().with("fast", ParamValue::Int(10))
    }

    #[test]
    fn test_failing_runner_yields_degenerate_metrics() {
        let adapter = BacktestAdapter::new(FailingRunner);
        let metrics = adapter.run_backtest("dual_ma", &params(), &BacktestWindow::default());

        assert_eq!(
            metrics,
            BacktestMetrics {
                return_rate: 0.0,
                sharpe: 0.0,
                drawdown: 1.0
            }
        );
        assert_eq!(adapter.failure_count(), 1);
        assert_eq!(adapter.run_count(), 1);
    }

    #[test]
    fn test_failure_is_distinguishable_from_poor_score() {
        let adapter = BacktestAdapter::new(FailingRunner);
        let outcome = adapter.evaluate("dual_ma", &params(), &BacktestWindow::default());
        assert!(outcome.is_failure());
        assert!(matches!(outcome, BacktestOutcome::Failed(BacktestError::Runner(_))));
    }

    #[test]
    fn test_given_sharpe_is_used_verbatim() {
        let adapter = BacktestAdapter::new(FixedRunner(BacktestReport {
            total_return: 0.25,
            max_drawdown: -0.1,
            sharpe: Some(1.7),
            equity_curve: curve(&[100.0, 50.0, 200.0]),
        }));
        let metrics = adapter.run_backtest("dual_ma", &params(), &BacktestWindow::default());
        assert_eq!(metrics.return_rate, 0.25);
        assert_eq!(metrics.sharpe, 1.7);
        assert_eq!(metrics.drawdown, 0.1);
        assert_eq!(adapter.failure_count(), 0);
    }

    #[test]
    fn test_missing_sharpe_is_derived_from_equity_curve() {
        let equity = curve(&[100.0, 110.0, 99.0, 118.8]);
        let adapter = BacktestAdapter::new(FixedRunner(BacktestReport {
            total_return: 0.188,
            max_drawdown: 0.1,
            sharpe: None,
            equity_curve: equity.clone(),
        }));

        let metrics = adapter.run_backtest("dual_ma", &params(), &BacktestWindow::default());

        // returns 0.1, -0.1, 0.2: mean/std * sqrt(252)
        assert!((metrics.sharpe - 6.9282).abs() < 1e-3, "sharpe {}", metrics.sharpe);
        assert_eq!(metrics.sharpe, sharpe_from_equity(&equity));
        assert_eq!(metrics.return_rate, 0.188);
        assert_eq!(adapter.failure_count(), 0);
    }

    #[test]
    fn test_non_finite_metrics_count_as_failure() {
        let adapter = BacktestAdapter::new(FixedRunner(BacktestReport {
            total_return: f64::NAN,
            ..Default::default()
        }));
        let outcome = adapter.evaluate("dual_ma", &params(), &BacktestWindow::default());
        assert!(matches!(
            outcome,
            BacktestOutcome::Failed(BacktestError::NonFiniteMetric("return"))
        ));
        assert_eq!(outcome.metrics(), BacktestMetrics::degenerate());
    }

    #[test]
    fn test_sharpe_short_or_flat_curve_is_zero() {
        assert_eq!(sharpe_from_equity(&[]), 0.0);
        assert_eq!(sharpe_from_equity(&curve(&[100.0])), 0.0);
        assert_eq!(sharpe_from_equity(&curve(&[100.0, 110.0])), 0.0);
        assert_eq!(sharpe_from_equity(&curve(&[100.0, 100.0, 100.0, 100.0])), 0.0);
    }

    #[test]
    fn test_sharpe_annualization() {
        // returns: +1%, +3%
        let s = sharpe_from_equity(&curve(&[100.0, 101.0, 104.03]));
        let expected = (0.02 * 252.0) / (0.0002f64.sqrt() * 252f64.sqrt());
        assert!((s - expected).abs() < 1e-6, "got {s}, expected {expected}");
    }

    #[test]
    fn test_timeframe_parsing() {
        assert_eq!("D".parse::<Timeframe>().unwrap(), Timeframe::Daily);
        assert_eq!("w".parse::<Timeframe>().unwrap(), Timeframe::Weekly);
        assert_eq!("M".parse::<Timeframe>().unwrap().interval(), "1M");
        assert!("H".parse::<Timeframe>().is_err());
    }

    #[test]
    fn test_window_json_shape() {
        let window: BacktestWindow = serde_json::from_value(serde_json::json!({
            "symbol": "ETHUSDT",
            "start_date": "2024-01-01",
            "end_date": "2024-06-30",
            "timeframe": "W",
        }))
        .unwrap();
        assert_eq!(window.timeframe, Timeframe::Weekly);
        assert_eq!(window.start_date, NaiveDate::from_ymd_opt(2024, 1, 1).unwrap());
    }
}
