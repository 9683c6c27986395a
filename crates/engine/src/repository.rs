//! Where evolved strategies are kept
//!
//! `StrategyRepository` is the seam between the evolution loop and storage.
//! The SQLite-backed `StrategyStore` is the production implementation;
//! `InMemoryStrategyRepository` is used by tests and dry runs.

use async_trait::async_trait;
use chrono::Utc;
use persistence::{NewStrategyRecord, StrategyRecord, StrategyStore};
use std::sync::Mutex;

#[async_trait]
pub trait StrategyRepository: Send + Sync {
    /// Persist a record and return its id (negative when only a fallback
    /// location received it)
    async fn save(&self, record: NewStrategyRecord) -> anyhow::Result<i64>;

    /// Best records by score, descending, at most `top_n`
    async fn get_best(&self, top_n: usize) -> anyhow::Result<Vec<StrategyRecord>>;
}

#[async_trait]
impl StrategyRepository for StrategyStore {
    async fn save(&self, record: NewStrategyRecord) -> anyhow::Result<i64> {
        Ok(StrategyStore::save(self, &record).await?)
    }

    async fn get_best(&self, top_n: usize) -> anyhow::Result<Vec<StrategyRecord>> {
        Ok(StrategyStore::get_best(self, top_n).await?)
    }
}

/// Process-local repository with monotonic ids starting at 1
#[derive(Debug, Default)]
pub struct InMemoryStrategyRepository {
    records: Mutex<Vec<StrategyRecord>>,
}

impl InMemoryStrategyRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.lock().map(|r| r.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn records(&self) -> Vec<StrategyRecord> {
        self.records.lock().map(|r| r.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl StrategyRepository for InMemoryStrategyRepository {
    async fn save(&self, record: NewStrategyRecord) -> anyhow::Result<i64> {
        let mut records = self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("strategy repository lock poisoned"))?;
        let id = records.len() as i64 + 1;
        records.push(StrategyRecord {
            id,
            created_at: Utc::now().timestamp(),
            strategy_id: record.strategy_id,
            strategy_type: record.strategy_type,
            params: record.params,
            score: record.score,
            return_rate: record.return_rate,
            sharpe: record.sharpe,
            drawdown: record.drawdown,
            meta: record.meta,
        });
        Ok(id)
    }

    async fn get_best(&self, top_n: usize) -> anyhow::Result<Vec<StrategyRecord>> {
        let mut records = self.records();
        records.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.id.cmp(&b.id)));
        records.truncate(top_n);
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(score: f64) -> NewStrategyRecord {
        NewStrategyRecord {
            strategy_id: "dual_ma".to_string(),
            strategy_type: "Dual MA Crossover".to_string(),
            params: json!({"fast": 10, "slow": 30}),
            score,
            return_rate: 0.1,
            sharpe: 1.0,
            drawdown: 0.2,
            meta: json!({}),
        }
    }

    #[tokio::test]
    async fn test_in_memory_ids_are_monotonic() {
        let repo = InMemoryStrategyRepository::new();
        assert_eq!(repo.save(record(0.1)).await.unwrap(), 1);
        assert_eq!(repo.save(record(0.2)).await.unwrap(), 2);
        assert_eq!(repo.len(), 2);
    }

    #[tokio::test]
    async fn test_in_memory_get_best_sorted_and_truncated() {
        let repo = InMemoryStrategyRepository::new();
        for score in [0.3, -0.1, 0.9, 0.3] {
            repo.save(record(score)).await.unwrap();
        }

        let best = repo.get_best(3).await.unwrap();
        let scores: Vec<f64> = best.iter().map(|r| r.score).collect();
        assert_eq!(scores, vec![0.9, 0.3, 0.3]);
        // equal scores keep insertion order
        assert!(best[1].id < best[2].id);
        assert!(repo.get_best(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_behind_trait() {
        let db = persistence::Database::in_memory().await.unwrap();
        let path = std::env::temp_dir().join(format!("evolver-trait-{}.jsonl", std::process::id()));
        let _ = std::fs::remove_file(&path);
        let log = persistence::AppendLog::new(path);
        let repo: Box<dyn StrategyRepository> = Box::new(StrategyStore::new(db.pool_clone(), log));

        let id = repo.save(record(0.5)).await.unwrap();
        assert!(id > 0);
        assert_eq!(repo.get_best(5).await.unwrap()[0].id, id);
    }
}
