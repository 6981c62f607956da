//! Turso Embedded / libSQL storage layer (offline mode).
//!
//! The [`Storage`] struct wraps a libSQL database holding stage checkpoints,
//! the failure ledger, raw and enriched records, run history and the
//! transform-service response cache.
//!
//! **Access rules:**
//! - pipeline runs: read-write (sole writer) via [`Storage::open`]
//! - `larder status`: read-only via [`Storage::open_readonly`]

mod memory;
mod migrations;

use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use larder_shared::{
    CheckpointEntry, CheckpointStore, EnrichedRecord, FailureLedger, ItemId, ItemState,
    LarderError, LedgerEntry, Outcome, RawRecord, ReasonCode, RecordStore, Result, Stage,
    StageCheckpoint,
};
use libsql::{Connection, Database, params};
use tokio::sync::Mutex;
use uuid::Uuid;

pub use memory::MemoryStore;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
    /// Serializes writers so batch transactions never interleave.
    write_lock: Mutex<()>,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| LarderError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LarderError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
            write_lock: Mutex::new(()),
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open a database at `path` in read-only mode.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| LarderError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
            write_lock: Mutex::new(()),
        })
    }

    /// Run pending schema migrations.
    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        LarderError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Get the current schema version, or 0 if no migrations have been applied.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0, // Table doesn't exist yet
        }
    }

    /// Ensure we're in read-write mode before writing.
    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(LarderError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Record the start of a pipeline run. Returns the generated run ID.
    pub async fn start_run(&self, mode: &str) -> Result<String> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO runs (id, mode, started_at) VALUES (?1, ?2, ?3)",
                params![id.as_str(), mode, now.as_str()],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        Ok(id)
    }

    /// Mark a run finished and attach its summary.
    pub async fn finish_run(&self, run_id: &str, summary_json: &str) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "UPDATE runs SET finished_at = ?1, summary_json = ?2 WHERE id = ?3",
                params![now.as_str(), summary_json, run_id],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Most recent runs, newest first.
    pub async fn recent_runs(&self, limit: u32) -> Result<Vec<RunRecord>> {
        let mut rows = self
            .conn
            .query(
                "SELECT id, mode, started_at, finished_at, summary_json
                 FROM runs ORDER BY started_at DESC, id DESC LIMIT ?1",
                params![limit],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let started: String = row
                .get(2)
                .map_err(|e| LarderError::Storage(e.to_string()))?;
            results.push(RunRecord {
                id: row
                    .get::<String>(0)
                    .map_err(|e| LarderError::Storage(e.to_string()))?,
                mode: row
                    .get::<String>(1)
                    .map_err(|e| LarderError::Storage(e.to_string()))?,
                started_at: parse_timestamp(&started)?,
                finished_at: match row.get::<String>(3).ok() {
                    Some(s) => Some(parse_timestamp(&s)?),
                    None => None,
                },
                summary_json: row.get::<String>(4).ok(),
            });
        }
        Ok(results)
    }

    // -----------------------------------------------------------------------
    // Enrichment cache operations
    // -----------------------------------------------------------------------

    /// Get a cached transform-service response.
    pub async fn get_enrichment_cache(
        &self,
        task: &str,
        prompt_hash: &str,
        model_id: &str,
    ) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT result_json FROM enrichment_cache
                 WHERE task = ?1 AND prompt_hash = ?2 AND model_id = ?3",
                params![task, prompt_hash, model_id],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let result: String = row
                    .get(0)
                    .map_err(|e| LarderError::Storage(e.to_string()))?;
                Ok(Some(result))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(LarderError::Storage(e.to_string())),
        }
    }

    /// Store a transform-service response in the cache (upserts).
    pub async fn set_enrichment_cache(
        &self,
        task: &str,
        prompt_hash: &str,
        model_id: &str,
        result_json: &str,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let id = Uuid::now_v7().to_string();
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO enrichment_cache (id, task, prompt_hash, model_id, result_json, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(task, prompt_hash, model_id) DO UPDATE SET
                   result_json = excluded.result_json,
                   created_at = excluded.created_at",
                params![id.as_str(), task, prompt_hash, model_id, result_json, now.as_str()],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Checkpoint store
// ---------------------------------------------------------------------------

#[async_trait]
impl CheckpointStore for Storage {
    async fn load(&self, stage: Stage) -> Result<StageCheckpoint> {
        let mut checkpoint = StageCheckpoint::default();

        let mut rows = self
            .conn
            .query(
                "SELECT item_id, state, attempt_count, outcome FROM checkpoints WHERE stage = ?1",
                params![stage.as_str()],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;

        while let Ok(Some(row)) = rows.next().await {
            let id: String = row
                .get(0)
                .map_err(|e| LarderError::Storage(e.to_string()))?;
            let state: String = row
                .get(1)
                .map_err(|e| LarderError::Storage(e.to_string()))?;
            let attempts: i64 = row
                .get(2)
                .map_err(|e| LarderError::Storage(e.to_string()))?;
            let outcome = match row.get::<String>(3).ok() {
                Some(s) => Some(s.parse::<Outcome>().map_err(corrupt)?),
                None => None,
            };
            checkpoint.entries.insert(
                ItemId(id),
                CheckpointEntry {
                    state: state.parse::<ItemState>().map_err(corrupt)?,
                    attempt_count: attempts as u32,
                    outcome,
                },
            );
        }

        let mut rows = self
            .conn
            .query(
                "SELECT cursor FROM stage_cursors WHERE stage = ?1",
                params![stage.as_str()],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        if let Ok(Some(row)) = rows.next().await {
            let cursor: i64 = row
                .get(0)
                .map_err(|e| LarderError::Storage(e.to_string()))?;
            checkpoint.cursor = Some(cursor as u64);
        }

        Ok(checkpoint)
    }

    async fn commit(&self, stage: Stage, id: &ItemId, entry: CheckpointEntry) -> Result<()> {
        self.commit_batch(stage, &[(id.clone(), entry)]).await
    }

    async fn commit_batch(
        &self,
        stage: Stage,
        entries: &[(ItemId, CheckpointEntry)],
    ) -> Result<()> {
        self.check_writable()?;
        if entries.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();

        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        for (id, entry) in entries {
            tx.execute(
                "INSERT INTO checkpoints (stage, item_id, state, attempt_count, outcome, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(stage, item_id) DO UPDATE SET
                   state = excluded.state,
                   attempt_count = excluded.attempt_count,
                   outcome = excluded.outcome,
                   updated_at = excluded.updated_at",
                params![
                    stage.as_str(),
                    id.as_str(),
                    entry.state.as_str(),
                    i64::from(entry.attempt_count),
                    entry.outcome.map(|o| o.as_str()),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        }
        tx.commit()
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;

        tracing::trace!(stage = %stage, count = entries.len(), "checkpoint batch committed");
        Ok(())
    }

    async fn set_cursor(&self, stage: Stage, cursor: u64) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO stage_cursors (stage, cursor, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(stage) DO UPDATE SET
                   cursor = excluded.cursor,
                   updated_at = excluded.updated_at",
                params![stage.as_str(), cursor as i64, now.as_str()],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        // Every write above is its own committed transaction; a checkpoint
        // merges the WAL into the main file.
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        if let Err(e) = self
            .conn
            .query("PRAGMA wal_checkpoint(PASSIVE)", params![])
            .await
        {
            tracing::warn!(error = %e, "WAL checkpoint failed");
        }
        Ok(())
    }

    async fn reset(&self, stage: Stage) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        tx.execute(
            "DELETE FROM checkpoints WHERE stage = ?1",
            params![stage.as_str()],
        )
        .await
        .map_err(|e| LarderError::Storage(e.to_string()))?;
        tx.execute(
            "DELETE FROM stage_cursors WHERE stage = ?1",
            params![stage.as_str()],
        )
        .await
        .map_err(|e| LarderError::Storage(e.to_string()))?;
        tx.commit()
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Failure ledger
// ---------------------------------------------------------------------------

#[async_trait]
impl FailureLedger for Storage {
    async fn record(
        &self,
        stage: Stage,
        id: &ItemId,
        reason: ReasonCode,
        detail: &str,
        retry_count: u32,
    ) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO failure_ledger (stage, item_id, reason, detail, retry_count, recorded_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                 ON CONFLICT(stage, item_id) DO UPDATE SET
                   reason = excluded.reason,
                   detail = excluded.detail,
                   retry_count = excluded.retry_count,
                   recorded_at = excluded.recorded_at",
                params![
                    stage.as_str(),
                    id.as_str(),
                    reason.as_str(),
                    detail,
                    i64::from(retry_count),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn resolve(&self, stage: Stage, id: &ItemId) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "DELETE FROM failure_ledger WHERE stage = ?1 AND item_id = ?2",
                params![stage.as_str(), id.as_str()],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn entries(&self, stage: Option<Stage>) -> Result<Vec<LedgerEntry>> {
        let mut rows = match stage {
            Some(stage) => self
                .conn
                .query(
                    "SELECT stage, item_id, reason, detail, retry_count, recorded_at
                     FROM failure_ledger WHERE stage = ?1 ORDER BY item_id",
                    params![stage.as_str()],
                )
                .await,
            None => self
                .conn
                .query(
                    "SELECT stage, item_id, reason, detail, retry_count, recorded_at
                     FROM failure_ledger ORDER BY stage, item_id",
                    params![],
                )
                .await,
        }
        .map_err(|e| LarderError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(row_to_ledger_entry(&row)?);
        }
        Ok(results)
    }

    async fn clear(&self, stage: Stage) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "DELETE FROM failure_ledger WHERE stage = ?1",
                params![stage.as_str()],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Record store
// ---------------------------------------------------------------------------

#[async_trait]
impl RecordStore for Storage {
    async fn put_raw(&self, record: &RawRecord) -> Result<()> {
        self.check_writable()?;
        let payload =
            serde_json::to_string(record).map_err(|e| LarderError::Storage(e.to_string()))?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "INSERT INTO raw_records (id, schema_version, content_hash, payload_json, fetched_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   schema_version = excluded.schema_version,
                   content_hash = excluded.content_hash,
                   payload_json = excluded.payload_json,
                   fetched_at = excluded.fetched_at",
                params![
                    record.id.as_str(),
                    i64::from(record.schema_version),
                    record.content_hash.as_str(),
                    payload.as_str(),
                    record.fetched_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn raw(&self, id: &ItemId) -> Result<Option<RawRecord>> {
        let payload = self
            .payload("SELECT payload_json FROM raw_records WHERE id = ?1", id)
            .await?;
        payload
            .map(|json| serde_json::from_str(&json).map_err(corrupt))
            .transpose()
    }

    async fn raw_ids(&self) -> Result<Vec<ItemId>> {
        self.ids("SELECT id FROM raw_records ORDER BY id").await
    }

    async fn put_enriched(&self, record: &EnrichedRecord) -> Result<()> {
        self.check_writable()?;
        let payload =
            serde_json::to_string(record).map_err(|e| LarderError::Storage(e.to_string()))?;
        let _guard = self.write_lock.lock().await;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO enriched_records (id, schema_version, canonical_name, payload_json, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   schema_version = excluded.schema_version,
                   canonical_name = excluded.canonical_name,
                   payload_json = excluded.payload_json,
                   updated_at = excluded.updated_at",
                params![
                    record.id.as_str(),
                    i64::from(record.schema_version),
                    record.canonical_name.as_str(),
                    payload.as_str(),
                    now.as_str(),
                ],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn enriched(&self, id: &ItemId) -> Result<Option<EnrichedRecord>> {
        let payload = self
            .payload("SELECT payload_json FROM enriched_records WHERE id = ?1", id)
            .await?;
        payload
            .map(|json| serde_json::from_str(&json).map_err(corrupt))
            .transpose()
    }

    async fn enriched_ids(&self) -> Result<Vec<ItemId>> {
        self.ids("SELECT id FROM enriched_records ORDER BY id").await
    }

    async fn delete_enriched(&self, id: &ItemId) -> Result<()> {
        self.check_writable()?;
        let _guard = self.write_lock.lock().await;
        self.conn
            .execute(
                "DELETE FROM enriched_records WHERE id = ?1",
                params![id.as_str()],
            )
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;
        Ok(())
    }
}

impl Storage {
    async fn payload(&self, sql: &str, id: &ItemId) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(sql, params![id.as_str()])
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(
                row.get::<String>(0)
                    .map_err(|e| LarderError::Storage(e.to_string()))?,
            )),
            Ok(None) => Ok(None),
            Err(e) => Err(LarderError::Storage(e.to_string())),
        }
    }

    async fn ids(&self, sql: &str) -> Result<Vec<ItemId>> {
        let mut rows = self
            .conn
            .query(sql, params![])
            .await
            .map_err(|e| LarderError::Storage(e.to_string()))?;

        let mut results = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            results.push(ItemId(
                row.get::<String>(0)
                    .map_err(|e| LarderError::Storage(e.to_string()))?,
            ));
        }
        Ok(results)
    }
}

/// One row of run history.
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: String,
    /// `fresh`, `resume` or `retry-failed`.
    pub mode: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub summary_json: Option<String>,
}

/// Convert a database row to a [`LedgerEntry`].
fn row_to_ledger_entry(row: &libsql::Row) -> Result<LedgerEntry> {
    let stage: String = row
        .get(0)
        .map_err(|e| LarderError::Storage(e.to_string()))?;
    let reason: String = row
        .get(2)
        .map_err(|e| LarderError::Storage(e.to_string()))?;
    let recorded: String = row
        .get(5)
        .map_err(|e| LarderError::Storage(e.to_string()))?;
    Ok(LedgerEntry {
        stage: stage.parse().map_err(corrupt)?,
        id: ItemId(
            row.get::<String>(1)
                .map_err(|e| LarderError::Storage(e.to_string()))?,
        ),
        reason: reason.parse().map_err(corrupt)?,
        detail: row.get::<String>(3).unwrap_or_default(),
        retry_count: row.get::<i64>(4).unwrap_or(0) as u32,
        recorded_at: parse_timestamp(&recorded)?,
    })
}

fn parse_timestamp(s: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| LarderError::Storage(format!("invalid date: {e}")))
}

/// Stored data that no longer parses is a storage fault, not a validation one.
fn corrupt(e: impl std::fmt::Display) -> LarderError {
    LarderError::Storage(format!("corrupt row: {e}"))
}
