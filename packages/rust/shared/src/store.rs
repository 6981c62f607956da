//! Persistence seams used by the stage controller.
//!
//! Both the libsql-backed `Storage` and the in-memory `MemoryStore` in
//! `larder-storage` implement these traits.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{
    CheckpointEntry, EnrichedRecord, ItemId, LedgerEntry, RawRecord, ReasonCode, Stage,
    StageCheckpoint,
};

/// Durable per-stage, per-item progress.
///
/// A successful `commit_batch` or `flush` return means the written states
/// survive a crash.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Load the whole checkpoint for `stage`. An absent checkpoint is empty.
    async fn load(&self, stage: Stage) -> Result<StageCheckpoint>;

    /// Record one item's state.
    async fn commit(&self, stage: Stage, id: &ItemId, entry: CheckpointEntry) -> Result<()>;

    /// Record several items atomically: either all entries are visible after
    /// a crash or none are.
    async fn commit_batch(&self, stage: Stage, entries: &[(ItemId, CheckpointEntry)])
    -> Result<()>;

    /// Persist the Fetch listing cursor.
    async fn set_cursor(&self, stage: Stage, cursor: u64) -> Result<()>;

    /// Force pending writes to durable storage.
    async fn flush(&self) -> Result<()>;

    /// Drop all entries and the cursor for `stage`.
    async fn reset(&self, stage: Stage) -> Result<()>;
}

/// Record of permanently failed items, one entry per (stage, id).
#[async_trait]
pub trait FailureLedger: Send + Sync {
    /// Upsert the entry for (stage, id).
    async fn record(
        &self,
        stage: Stage,
        id: &ItemId,
        reason: ReasonCode,
        detail: &str,
        retry_count: u32,
    ) -> Result<()>;

    /// Remove the entry for (stage, id) after a successful retry.
    async fn resolve(&self, stage: Stage, id: &ItemId) -> Result<()>;

    /// List entries, optionally restricted to one stage.
    async fn entries(&self, stage: Option<Stage>) -> Result<Vec<LedgerEntry>>;

    /// Drop all entries for `stage`.
    async fn clear(&self, stage: Stage) -> Result<()>;
}

/// Stage payloads: fetched raw records and enriched records.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn put_raw(&self, record: &RawRecord) -> Result<()>;
    async fn raw(&self, id: &ItemId) -> Result<Option<RawRecord>>;
    async fn raw_ids(&self) -> Result<Vec<ItemId>>;

    async fn put_enriched(&self, record: &EnrichedRecord) -> Result<()>;
    async fn enriched(&self, id: &ItemId) -> Result<Option<EnrichedRecord>>;
    async fn enriched_ids(&self) -> Result<Vec<ItemId>>;
    async fn delete_enriched(&self, id: &ItemId) -> Result<()>;
}
