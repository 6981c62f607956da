//! In-memory store for dry runs and tests.
//!
//! Implements the same three traits as [`Storage`](crate::Storage). Nothing
//! survives the process, but a `MemoryStore` shared between two pipeline runs
//! behaves like a database reopened after a crash.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use larder_shared::{
    CheckpointEntry, CheckpointStore, EnrichedRecord, FailureLedger, ItemId, LarderError,
    LedgerEntry, RawRecord, ReasonCode, RecordStore, Result, Stage, StageCheckpoint,
};

#[derive(Default)]
struct Inner {
    checkpoints: HashMap<Stage, StageCheckpoint>,
    ledger: BTreeMap<(Stage, ItemId), LedgerEntry>,
    raw: BTreeMap<ItemId, RawRecord>,
    enriched: BTreeMap<ItemId, EnrichedRecord>,
}

/// Thread-safe in-memory implementation of the store traits.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
    /// Remaining checkpoint batches allowed before commits start failing.
    commit_budget: Mutex<Option<usize>>,
    commits: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every checkpoint commit after the first `batches` fail with a
    /// storage error, as an unwritable store would.
    pub fn fail_commits_after(&self, batches: usize) {
        *self
            .commit_budget
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(batches);
    }

    /// Restore normal commit behaviour.
    pub fn heal(&self) {
        *self
            .commit_budget
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
    }

    /// Number of successful checkpoint commits so far.
    pub fn commit_count(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    fn inner(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_commit_slot(&self) -> Result<()> {
        let mut budget = self
            .commit_budget
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match budget.as_mut() {
            Some(0) => Err(LarderError::Storage("checkpoint store is unwritable".into())),
            Some(n) => {
                *n -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

#[async_trait]
impl CheckpointStore for MemoryStore {
    async fn load(&self, stage: Stage) -> Result<StageCheckpoint> {
        Ok(self
            .inner()
            .checkpoints
            .get(&stage)
            .cloned()
            .unwrap_or_default())
    }

    async fn commit(&self, stage: Stage, id: &ItemId, entry: CheckpointEntry) -> Result<()> {
        self.commit_batch(stage, &[(id.clone(), entry)]).await
    }

    async fn commit_batch(
        &self,
        stage: Stage,
        entries: &[(ItemId, CheckpointEntry)],
    ) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.take_commit_slot()?;
        let mut inner = self.inner();
        let checkpoint = inner.checkpoints.entry(stage).or_default();
        for (id, entry) in entries {
            checkpoint.entries.insert(id.clone(), *entry);
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_cursor(&self, stage: Stage, cursor: u64) -> Result<()> {
        self.take_commit_slot()?;
        self.inner().checkpoints.entry(stage).or_default().cursor = Some(cursor);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn reset(&self, stage: Stage) -> Result<()> {
        self.inner().checkpoints.remove(&stage);
        Ok(())
    }
}

#[async_trait]
impl FailureLedger for MemoryStore {
    async fn record(
        &self,
        stage: Stage,
        id: &ItemId,
        reason: ReasonCode,
        detail: &str,
        retry_count: u32,
    ) -> Result<()> {
        self.inner().ledger.insert(
            (stage, id.clone()),
            LedgerEntry {
                id: id.clone(),
                stage,
                reason,
                detail: detail.to_string(),
                retry_count,
                recorded_at: Utc::now(),
            },
        );
        Ok(())
    }

    async fn resolve(&self, stage: Stage, id: &ItemId) -> Result<()> {
        self.inner().ledger.remove(&(stage, id.clone()));
        Ok(())
    }

    async fn entries(&self, stage: Option<Stage>) -> Result<Vec<LedgerEntry>> {
        Ok(self
            .inner()
            .ledger
            .values()
            .filter(|e| stage.is_none_or(|s| e.stage == s))
            .cloned()
            .collect())
    }

    async fn clear(&self, stage: Stage) -> Result<()> {
        self.inner().ledger.retain(|(s, _), _| *s != stage);
        Ok(())
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    async fn put_raw(&self, record: &RawRecord) -> Result<()> {
        self.inner().raw.insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn raw(&self, id: &ItemId) -> Result<Option<RawRecord>> {
        Ok(self.inner().raw.get(id).cloned())
    }

    async fn raw_ids(&self) -> Result<Vec<ItemId>> {
        Ok(self.inner().raw.keys().cloned().collect())
    }

    async fn put_enriched(&self, record: &EnrichedRecord) -> Result<()> {
        self.inner()
            .enriched
            .insert(record.id.clone(), record.clone());
        Ok(())
    }

    async fn enriched(&self, id: &ItemId) -> Result<Option<EnrichedRecord>> {
        Ok(self.inner().enriched.get(id).cloned())
    }

    async fn enriched_ids(&self) -> Result<Vec<ItemId>> {
        Ok(self.inner().enriched.keys().cloned().collect())
    }

    async fn delete_enriched(&self, id: &ItemId) -> Result<()> {
        self.inner().enriched.remove(id);
        Ok(())
    }
}
