//! Evolved strategies repository: one record per completed evolution round

use crate::repository::AppendLog;
use crate::{DbError, DbResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use tracing::{debug, warn};

/// Id returned when a record only reached the fallback log
pub const FALLBACK_RECORD_ID: i64 = -1;

/// A persisted strategy record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrategyRecord {
    pub id: i64,
    /// Unix seconds
    pub created_at: i64,
    /// Strategy family key
    pub strategy_id: String,
    /// Display label
    pub strategy_type: String,
    pub params: serde_json::Value,
    pub score: f64,
    #[serde(rename = "return")]
    pub return_rate: f64,
    pub sharpe: f64,
    pub drawdown: f64,
    pub meta: serde_json::Value,
}

/// Input to `StrategyStore::save`; id and timestamp are assigned on write
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NewStrategyRecord {
    pub strategy_id: String,
    pub strategy_type: String,
    pub params: serde_json::Value,
    pub score: f64,
    pub return_rate: f64,
    pub sharpe: f64,
    pub drawdown: f64,
    pub meta: serde_json::Value,
}

#[derive(Debug, FromRow)]
struct StrategyRow {
    id: i64,
    created_at: i64,
    strategy_id: String,
    strategy_type: String,
    params: String,
    score: f64,
    return_rate: f64,
    sharpe: f64,
    drawdown: f64,
    meta: String,
}

impl StrategyRow {
    fn into_record(self) -> StrategyRecord {
        StrategyRecord {
            id: self.id,
            created_at: self.created_at,
            strategy_id: self.strategy_id,
            strategy_type: self.strategy_type,
            params: serde_json::from_str(&self.params).unwrap_or(serde_json::Value::Null),
            score: self.score,
            return_rate: self.return_rate,
            sharpe: self.sharpe,
            drawdown: self.drawdown,
            meta: serde_json::from_str(&self.meta).unwrap_or(serde_json::Value::Null),
        }
    }
}

/// SQLite-backed store that degrades to an append-only log.
///
/// Ids are assigned by SQLite's AUTOINCREMENT and are monotonic within one
/// database file. Nothing coordinates id assignment across processes sharing
/// the fallback log.
pub struct StrategyStore {
    pool: Option<SqlitePool>,
    fallback: AppendLog,
}

impl StrategyStore {
    pub fn new(pool: SqlitePool, fallback: AppendLog) -> Self {
        Self {
            pool: Some(pool),
            fallback,
        }
    }

    /// Store without a database; every save lands in the fallback log
    pub fn fallback_only(fallback: AppendLog) -> Self {
        Self {
            pool: None,
            fallback,
        }
    }

    /// Persist a record. Returns the database id, or `FALLBACK_RECORD_ID` when
    /// only the fallback log could be written.
    pub async fn save(&self, record: &NewStrategyRecord) -> DbResult<i64> {
        if let Some(pool) = &self.pool {
            match insert(pool, record).await {
                Ok(id) => {
                    debug!(id, strategy = %record.strategy_id, score = record.score, "Saved strategy");
                    return Ok(id);
                }
                Err(e) => {
                    warn!(strategy = %record.strategy_id, error = %e, "Database save failed, writing to fallback log");
                }
            }
        }

        let fallback_record = StrategyRecord {
            id: FALLBACK_RECORD_ID,
            created_at: Utc::now().timestamp(),
            strategy_id: record.strategy_id.clone(),
            strategy_type: record.strategy_type.clone(),
            params: record.params.clone(),
            score: record.score,
            return_rate: record.return_rate,
            sharpe: record.sharpe,
            drawdown: record.drawdown,
            meta: record.meta.clone(),
        };
        self.fallback
            .append(&fallback_record)
            .await
            .map_err(|e| DbError::Fallback(e.to_string()))?;

        Ok(FALLBACK_RECORD_ID)
    }

    /// Best records by score, merged across the database and the fallback log
    pub async fn get_best(&self, top_n: usize) -> DbResult<Vec<StrategyRecord>> {
        let mut records = Vec::new();
        let mut db_failed = self.pool.is_none();

        if let Some(pool) = &self.pool {
            match query_best(pool, top_n).await {
                Ok(rows) => records.extend(rows),
                Err(e) => {
                    warn!(error = %e, "Database read failed, using fallback log only");
                    db_failed = true;
                }
            }
        }

        match self.fallback.read_all().await {
            Ok(logged) => records.extend(logged),
            Err(e) if db_failed => return Err(e),
            Err(e) => warn!(error = %e, "Fallback log unreadable, using database only"),
        }

        records.sort_by(|a, b| b.score.total_cmp(&a.score));
        records.truncate(top_n);
        Ok(records)
    }

    /// Number of records in the database (fallback log excluded)
    pub async fn count(&self) -> DbResult<i64> {
        let Some(pool) = &self.pool else {
            return Ok(0);
        };
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM evolved_strategies")
            .fetch_one(pool)
            .await?;
        Ok(row.0)
    }
}

async fn insert(pool: &SqlitePool, record: &NewStrategyRecord) -> DbResult<i64> {
    let params = serde_json::to_string(&record.params)?;
    let meta = serde_json::to_string(&record.meta)?;

    let result = sqlx::query(
        r#"
        INSERT INTO evolved_strategies (
            strategy_id, strategy_type, params, score,
            return_rate, sharpe, drawdown, meta
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&record.strategy_id)
    .bind(&record.strategy_type)
    .bind(params)
    .bind(record.score)
    .bind(record.return_rate)
    .bind(record.sharpe)
    .bind(record.drawdown)
    .bind(meta)
    .execute(pool)
    .await?;

    Ok(result.last_insert_rowid())
}

async fn query_best(pool: &SqlitePool, top_n: usize) -> DbResult<Vec<StrategyRecord>> {
    let rows = sqlx::query_as::<_, StrategyRow>(
        r#"
        SELECT id, created_at, strategy_id, strategy_type, params, score,
               return_rate, sharpe, drawdown, meta
        FROM evolved_strategies
        ORDER BY score DESC, id ASC
        LIMIT ?
        "#,
    )
    .bind(top_n as i64)
    .fetch_all(pool)
    .await?;

    Ok(rows.into_iter().map(StrategyRow::into_record).collect())
}
