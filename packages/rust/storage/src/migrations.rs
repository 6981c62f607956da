//! SQL migration definitions for the larder database.
//!
//! Migrations are applied in order on database open. Each migration has a
//! version number and a set of SQL statements executed as one batch.

/// A database migration with a version and SQL statements.
pub(crate) struct Migration {
    pub version: u32,
    pub description: &'static str,
    pub sql: &'static str,
}

/// All migrations, in ascending version order.
pub(crate) fn all_migrations() -> Vec<Migration> {
    vec![
        Migration {
            version: 1,
            description: "Initial schema: checkpoints, stage_cursors, failure_ledger, records",
            sql: r#"
-- Schema version tracking
CREATE TABLE IF NOT EXISTS schema_migrations (
    version    INTEGER PRIMARY KEY,
    applied_at TEXT NOT NULL DEFAULT (datetime('now'))
);

-- Per-stage, per-item progress
CREATE TABLE IF NOT EXISTS checkpoints (
    stage         TEXT NOT NULL,
    item_id       TEXT NOT NULL,
    state         TEXT NOT NULL,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    outcome       TEXT,
    updated_at    TEXT NOT NULL,
    PRIMARY KEY (stage, item_id)
);

CREATE INDEX IF NOT EXISTS idx_checkpoints_state ON checkpoints(stage, state);

-- Listing cursor per stage (Fetch only today)
CREATE TABLE IF NOT EXISTS stage_cursors (
    stage      TEXT PRIMARY KEY,
    cursor     INTEGER NOT NULL,
    updated_at TEXT NOT NULL
);

-- Permanently failed items, one row per (stage, item)
CREATE TABLE IF NOT EXISTS failure_ledger (
    stage       TEXT NOT NULL,
    item_id     TEXT NOT NULL,
    reason      TEXT NOT NULL,
    detail      TEXT NOT NULL DEFAULT '',
    retry_count INTEGER NOT NULL DEFAULT 0,
    recorded_at TEXT NOT NULL,
    PRIMARY KEY (stage, item_id)
);

-- Source Fetcher output
CREATE TABLE IF NOT EXISTS raw_records (
    id             TEXT PRIMARY KEY,
    schema_version INTEGER NOT NULL,
    content_hash   TEXT NOT NULL,
    payload_json   TEXT NOT NULL,
    fetched_at     TEXT NOT NULL
);

-- Transform Service output, rewritten in place by Validate
CREATE TABLE IF NOT EXISTS enriched_records (
    id             TEXT PRIMARY KEY,
    schema_version INTEGER NOT NULL,
    canonical_name TEXT NOT NULL,
    payload_json   TEXT NOT NULL,
    updated_at     TEXT NOT NULL
);

INSERT INTO schema_migrations (version) VALUES (1);
"#,
        },
        Migration {
            version: 2,
            description: "Run history and transform-service response cache",
            sql: r#"
CREATE TABLE IF NOT EXISTS runs (
    id           TEXT PRIMARY KEY,
    mode         TEXT NOT NULL,
    started_at   TEXT NOT NULL,
    finished_at  TEXT,
    summary_json TEXT
);

CREATE TABLE IF NOT EXISTS enrichment_cache (
    id          TEXT PRIMARY KEY,
    task        TEXT NOT NULL,
    prompt_hash TEXT NOT NULL,
    model_id    TEXT NOT NULL,
    result_json TEXT NOT NULL,
    created_at  TEXT NOT NULL,
    UNIQUE(task, prompt_hash, model_id)
);

INSERT INTO schema_migrations (version) VALUES (2);
"#,
        },
    ]
}
