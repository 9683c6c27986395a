//! Append-only JSON-lines log used when the database cannot be written

use crate::repository::StrategyRecord;
use crate::DbResult;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// One JSON object per line, never rewritten
#[derive(Debug, Clone)]
pub struct AppendLog {
    path: PathBuf,
}

impl AppendLog {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a record as a single line
    pub async fn append(&self, record: &StrategyRecord) -> DbResult<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;

        debug!(path = %self.path.display(), strategy = %record.strategy_id, "Appended record to fallback log");
        Ok(())
    }

    /// Read every parseable record. A missing file is an empty log.
    pub async fn read_all(&self) -> DbResult<Vec<StrategyRecord>> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut records = Vec::new();
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StrategyRecord>(line) {
                Ok(r) => records.push(r),
                Err(e) => {
                    warn!(path = %self.path.display(), line = lineno + 1, error = %e, "Skipping malformed fallback log line");
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_log(name: &str) -> AppendLog {
        let path = std::env::temp_dir().join(format!(
            "evolver-fallback-{}-{}.jsonl",
            name,
            std::process::id()
        ));
        let _ = std::fs::remove_file(&path);
        AppendLog::new(path)
    }

    fn record(strategy_id: &str, score: f64) -> StrategyRecord {
        StrategyRecord {
            id: -1,
            created_at: 1_700_000_000,
            strategy_id: strategy_id.to_string(),
            strategy_type: "Test".to_string(),
            params: json!({"fast": 10}),
            score,
            return_rate: 0.1,
            sharpe: 1.0,
            drawdown: 0.2,
            meta: json!({}),
        }
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let log = temp_log("missing");
        assert!(log.read_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_append_then_read_preserves_order() {
        let log = temp_log("order");
        log.append(&record("dual_ma", 0.5)).await.unwrap();
        log.append(&record("rsi_reversion", 0.7)).await.unwrap();

        let records = log.read_all().await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].strategy_id, "dual_ma");
        assert_eq!(records[1].strategy_id, "rsi_reversion");

        let _ = std::fs::remove_file(log.path());
    }

    #[tokio::test]
    async fn test_malformed_lines_are_skipped() {
        let log = temp_log("malformed");
        log.append(&record("dual_ma", 0.5)).await.unwrap();
        let mut contents = std::fs::read_to_string(log.path()).unwrap();
        contents.push_str("{not json\n");
        std::fs::write(log.path(), contents).unwrap();

        let records = log.read_all().await.unwrap();
        assert_eq!(records.len(), 1);

        let _ = std::fs::remove_file(log.path());
    }
}
