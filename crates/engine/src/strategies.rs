//! Registry of optimizable strategy families

use rand::seq::SliceRandom;
use rand::Rng;
use serde::Serialize;
use std::collections::BTreeMap;

use crate::params::ParameterSpace;

pub const DUAL_MA: &str = "dual_ma";
pub const RSI_REVERSION: &str = "rsi_reversion";
pub const BOLLINGER_REVERSION: &str = "bollinger_reversion";
pub const MACD_TREND: &str = "macd_trend";

/// A parameterized trading rule and the space its genes are drawn from
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StrategyFamily {
    pub id: String,
    /// Display label persisted as `strategy_type`
    pub label: String,
    pub space: ParameterSpace,
}

#[derive(Debug, Clone, Default)]
pub struct StrategyRegistry {
    families: BTreeMap<String, StrategyFamily>,
}

impl StrategyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The four built-in families
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(
            DUAL_MA,
            "Dual MA Crossover",
            ParameterSpace::new()
                .with_integer("fast", 5, 30)
                .with_integer("slow", 15, 60),
        );
        registry.register(
            RSI_REVERSION,
            "RSI Reversion",
            ParameterSpace::new()
                .with_integer("period", 5, 30)
                .with_real("oversold", 15.0, 40.0)
                .with_real("overbought", 60.0, 85.0),
        );
        registry.register(
            BOLLINGER_REVERSION,
            "Bollinger Reversion",
            ParameterSpace::new()
                .with_integer("period", 10, 40)
                .with_real("multiplier", 1.0, 3.0),
        );
        registry.register(
            MACD_TREND,
            "MACD Trend",
            ParameterSpace::new()
                .with_integer("fast", 5, 15)
                .with_integer("slow", 20, 40)
                .with_integer("signal", 5, 12),
        );
        registry
    }

    /// Register or replace a family
    pub fn register(&mut self, id: &str, label: &str, space: ParameterSpace) {
        self.families.insert(
            id.to_string(),
            StrategyFamily {
                id: id.to_string(),
                label: label.to_string(),
                space,
            },
        );
    }

    pub fn get(&self, id: &str) -> Option<&StrategyFamily> {
        self.families.get(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.families.keys().map(String::as_str)
    }

    pub fn families(&self) -> impl Iterator<Item = &StrategyFamily> {
        self.families.values()
    }

    pub fn len(&self) -> usize {
        self.families.len()
    }

    pub fn is_empty(&self) -> bool {
        self.families.is_empty()
    }

    /// Draw a family id uniformly from `pool`, or from every registered id
    /// when `pool` is empty. The drawn id may be unregistered.
    pub fn pick<R: Rng + ?Sized>(&self, pool: &[String], rng: &mut R) -> Option<String> {
        if pool.is_empty() {
            let ids: Vec<&str> = self.ids().collect();
            ids.choose(rng).map(|id| id.to_string())
        } else {
            pool.choose(rng).cloned()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_defaults_registered() {
        let registry = StrategyRegistry::with_defaults();
        assert_eq!(registry.len(), 4);

        let dual = registry.get(DUAL_MA).unwrap();
        assert_eq!(dual.space.len(), 2);
        assert!(dual.space.get("fast").unwrap().is_integer());

        let rsi = registry.get(RSI_REVERSION).unwrap();
        assert!(!rsi.space.get("oversold").unwrap().is_integer());
    }

    #[test]
    fn test_pick_from_configured_pool() {
        let registry = StrategyRegistry::with_defaults();
        let pool = vec![MACD_TREND.to_string()];
        let mut rng = StdRng::seed_from_u64(1);
        for _ in 0..10 {
            assert_eq!(registry.pick(&pool, &mut rng).as_deref(), Some(MACD_TREND));
        }
    }

    #[test]
    fn test_pick_covers_all_registered_when_pool_empty() {
        let registry = StrategyRegistry::with_defaults();
        let mut rng = StdRng::seed_from_u64(7);
        let seen: std::collections::BTreeSet<String> =
            (0..200).filter_map(|_| registry.pick(&[], &mut rng)).collect();
        assert_eq!(seen.len(), 4);
    }

    #[test]
    fn test_empty_registry_picks_nothing() {
        let mut rng = StdRng::seed_from_u64(0);
        assert_eq!(StrategyRegistry::new().pick(&[], &mut rng), None);
    }
}
