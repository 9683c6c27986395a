//! Database schema definitions

/// SQL to create all tables
/// NOTE: params and meta are stored as JSON TEXT
pub const CREATE_TABLES: &str = r#"
-- Winners of completed evolution rounds (one row per round)
CREATE TABLE IF NOT EXISTS evolved_strategies (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    strategy_id TEXT NOT NULL,
    strategy_type TEXT NOT NULL,
    params TEXT NOT NULL,
    score REAL NOT NULL DEFAULT 0,
    return_rate REAL NOT NULL DEFAULT 0,
    sharpe REAL NOT NULL DEFAULT 0,
    drawdown REAL NOT NULL DEFAULT 0,
    meta TEXT NOT NULL DEFAULT '{}',
    created_at INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
);

-- ========== INDEXES ==========

CREATE INDEX IF NOT EXISTS idx_evolved_score ON evolved_strategies(score DESC);
CREATE INDEX IF NOT EXISTS idx_evolved_strategy ON evolved_strategies(strategy_id)
"#;
