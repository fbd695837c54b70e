//! SQL migration definitions for the changewatch database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a batch of SQL statements.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![Migration {
        version: 1,
        description: "Initial schema: source_state, publish_patterns",
        sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version   INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Per-source detection baseline (one row per source, upserted)
CREATE TABLE IF NOT EXISTS source_state (
    source_id           TEXT PRIMARY KEY,
    last_known_item_id  TEXT,
    last_known_item_url TEXT,
    last_check_at       TEXT NOT NULL,
    last_item_at        TEXT,
    total_items_seen    INTEGER NOT NULL DEFAULT 0,
    updated_at          TEXT NOT NULL
);

-- Observed publish times (append-only, consumed by interval tuning)
CREATE TABLE IF NOT EXISTS publish_patterns (
    id                    TEXT PRIMARY KEY,
    source_id             TEXT NOT NULL,
    observed_publish_time TEXT NOT NULL,
    recorded_at           TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_publish_patterns_source
    ON publish_patterns(source_id, observed_publish_time);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
    }]
}
