//! Reduces backtest metrics to a single higher-is-better score

use serde::{Deserialize, Serialize};

use crate::backtest::BacktestMetrics;
use crate::params::round_to;

/// Linear weights of the composite score
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FitnessWeights {
    #[serde(rename = "return")]
    pub return_weight: f64,
    #[serde(rename = "sharpe")]
    pub sharpe_weight: f64,
    #[serde(rename = "drawdown")]
    pub drawdown_weight: f64,
}

impl Default for FitnessWeights {
    fn default() -> Self {
        Self {
            return_weight: 0.4,
            sharpe_weight: 0.3,
            drawdown_weight: 0.3,
        }
    }
}

/// `score = w_r * return + w_s * sharpe - w_d * drawdown`, rounded to 6 decimals
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct FitnessEvaluator {
    weights: FitnessWeights,
}

impl FitnessEvaluator {
    pub fn new(weights: FitnessWeights) -> Self {
        Self { weights }
    }

    pub fn weights(&self) -> FitnessWeights {
        self.weights
    }

    pub fn evaluate(&self, metrics: &BacktestMetrics) -> f64 {
        let w = &self.weights;
        let score = w.return_weight * metrics.return_rate + w.sharpe_weight * metrics.sharpe
            - w.drawdown_weight * metrics.drawdown;
        round_to(score, 6)
    }

    /// Score a loosely-typed metrics object; absent or non-numeric keys count as 0.0
    pub fn evaluate_json(&self, metrics: &serde_json::Value) -> f64 {
        let field = |key: &str| metrics.get(key).and_then(|v| v.as_f64()).unwrap_or(0.0);
        self.evaluate(&BacktestMetrics {
            return_rate: field("return"),
            sharpe: field("sharpe"),
            drawdown: field("drawdown"),
        })
    }
}
