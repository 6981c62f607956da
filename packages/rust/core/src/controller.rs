//! Stage controller: sequences the stages and owns every checkpoint write.
//!
//! Per batch the controller
//! 1. loads each item's input from the record store,
//! 2. marks the batch in-progress,
//! 3. hands copies to the [`WorkerPool`],
//! 4. persists each success's payload, then records failures in the ledger,
//! 5. commits the batch to the checkpoint store and flushes.
//!
//! A crash therefore loses at most the batch in flight, and re-running that
//! batch overwrites the same records.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use larder_shared::{
    AssetStore, BundleDetector, CheckpointEntry, CheckpointStore, EnrichedRecord, FailureLedger,
    ItemId, ItemRef, ItemState, LarderError, LedgerEntry, NameValidator, Outcome, PipelineConfig,
    RawRecord, ReasonCode, RecordStore, Result, SourceFetcher, Stage, StageCheckpoint,
    TransformService, Verdict,
};

use crate::filter::{self, AssetStatus, FilterCandidate};
use crate::partition;
use crate::pool::{Pacer, WorkOutcome, WorkerPool};
use crate::progress::{ProgressReporter, SilentProgress};
use crate::retry::{Attempt, ErrorClass, RetryPolicy, classify};
use crate::stage::StageMachine;

// ---------------------------------------------------------------------------
// Wiring
// ---------------------------------------------------------------------------

/// External collaborators, one per stage operation.
#[derive(Clone)]
pub struct Collaborators {
    pub source: Arc<dyn SourceFetcher>,
    pub transform: Arc<dyn TransformService>,
    pub validator: Arc<dyn NameValidator>,
    pub bundles: Arc<dyn BundleDetector>,
    pub assets: Arc<dyn AssetStore>,
}

/// Durable state the controller reads and writes.
#[derive(Clone)]
pub struct Stores {
    pub checkpoints: Arc<dyn CheckpointStore>,
    pub ledger: Arc<dyn FailureLedger>,
    pub records: Arc<dyn RecordStore>,
}

impl Stores {
    /// Use one backend for all three stores.
    pub fn shared<S>(store: Arc<S>) -> Self
    where
        S: CheckpointStore + FailureLedger + RecordStore + 'static,
    {
        Self {
            checkpoints: store.clone(),
            ledger: store.clone(),
            records: store,
        }
    }
}

/// How a run treats existing checkpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Reset checkpoints and ledger entries from the starting stage onward.
    Fresh,
    /// Continue from the checkpoints.
    Resume,
    /// Re-attempt the failed ids of one stage, then resume downstream.
    RetryFailed(Stage),
}

impl RunMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Resume => "resume",
            Self::RetryFailed(_) => "retry-failed",
        }
    }
}

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

/// Per-stage counts after a stage ran (or as currently checkpointed).
#[derive(Debug, Clone, Serialize)]
pub struct StageReport {
    pub stage: Stage,
    /// Items handed to workers during this run.
    pub processed: usize,
    pub done: usize,
    pub failed: usize,
    pub deleted: usize,
    /// Items in the stage's input set that still need work.
    pub pending: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cursor: Option<u64>,
    pub interrupted: bool,
    /// Filter exclusion counts by reason.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub exclusions: BTreeMap<String, usize>,
}

impl StageReport {
    fn from_checkpoint(stage: Stage, checkpoint: &StageCheckpoint, universe: &[ItemId]) -> Self {
        Self {
            stage,
            processed: 0,
            done: checkpoint.count(ItemState::Done),
            failed: checkpoint.count(ItemState::Failed),
            deleted: checkpoint.count(ItemState::Deleted),
            pending: partition::pending(checkpoint, universe.iter().cloned()).len(),
            cursor: checkpoint.cursor,
            interrupted: false,
            exclusions: BTreeMap::new(),
        }
    }

    /// Whether the stage may hand over to the next one.
    pub fn is_drained(&self) -> bool {
        !self.interrupted && self.pending == 0
    }
}

/// End-of-run summary, also stored as run history.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub mode: &'static str,
    pub stages: Vec<StageReport>,
    /// Unresolved failure ledger entries across all stages.
    pub ledger_entries: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_size: Option<usize>,
    pub interrupted: bool,
}

impl RunSummary {
    pub fn has_unresolved_failures(&self) -> bool {
        self.ledger_entries > 0
    }
}

// ---------------------------------------------------------------------------
// Stage inputs and payloads
// ---------------------------------------------------------------------------

/// Copy of what a worker needs for one item.
#[derive(Debug, Clone)]
enum Input {
    Detail,
    Raw(Arc<RawRecord>),
    Name(Arc<EnrichedRecord>),
    Bundle {
        title: Arc<str>,
        record: Arc<EnrichedRecord>,
    },
    Asset(Option<String>),
    /// Upstream payload that should exist but does not.
    Missing(String),
}

/// What a worker hands back on success.
#[derive(Debug)]
enum Payload {
    Raw(RawRecord),
    Enriched(EnrichedRecord),
    Verdict(Verdict),
    Bundle(bool),
    AssetStored,
}

impl Collaborators {
    async fn call(&self, id: &ItemId, input: Input) -> Result<Payload> {
        match input {
            Input::Detail => Ok(Payload::Raw(self.source.fetch_detail(id).await?)),
            Input::Raw(raw) => Ok(Payload::Enriched(self.transform.transform(&raw).await?)),
            Input::Name(record) => Ok(Payload::Verdict(self.validator.validate(&record).await?)),
            Input::Bundle { title, record } => {
                Ok(Payload::Bundle(self.bundles.is_bundle(&title, &record).await?))
            }
            Input::Asset(url) => {
                if self.assets.exists(id).await? {
                    return Ok(Payload::AssetStored);
                }
                let url = url.ok_or_else(|| LarderError::NotFound(format!("{id}: no asset url")))?;
                let bytes = self.assets.fetch(&url).await?;
                self.assets.save(id, &url, &bytes).await?;
                Ok(Payload::AssetStored)
            }
            Input::Missing(what) => Err(LarderError::validation(format!("{id}: {what}"))),
        }
    }
}

/// Resolved per-item input: either work for the pool, or an item whose
/// upstream record is already gone.
enum Loaded {
    Work(Input),
    Vanished(Option<Outcome>),
}

// ---------------------------------------------------------------------------
// Stage inputs from checkpoints
// ---------------------------------------------------------------------------

/// Per-stage counts as currently checkpointed. Needs no collaborators, so it
/// works against a read-only store.
pub async fn stage_status(checkpoints: &dyn CheckpointStore) -> Result<Vec<StageReport>> {
    let mut reports = Vec::with_capacity(Stage::ALL.len());
    for stage in Stage::ALL {
        let checkpoint = checkpoints.load(stage).await?;
        let ids = universe(checkpoints, stage, &checkpoint).await?;
        reports.push(StageReport::from_checkpoint(stage, &checkpoint, &ids));
    }
    Ok(reports)
}

/// Input set of `stage`, derived from upstream checkpoints.
async fn universe(
    checkpoints: &dyn CheckpointStore,
    stage: Stage,
    own: &StageCheckpoint,
) -> Result<Vec<ItemId>> {
    let ids = match stage {
        Stage::Fetch => {
            let mut ids: Vec<ItemId> = own.entries.keys().cloned().collect();
            ids.sort();
            ids
        }
        Stage::Enrich => checkpoints.load(Stage::Fetch).await?.ids_in(ItemState::Done),
        Stage::Validate => checkpoints.load(Stage::Enrich).await?.ids_in(ItemState::Done),
        Stage::Revalidate => checkpoints
            .load(Stage::Validate)
            .await?
            .ids_with_outcome(Outcome::Modify),
        Stage::AssetFetch => {
            let validate = checkpoints.load(Stage::Validate).await?;
            let revalidate = checkpoints.load(Stage::Revalidate).await?;
            validate
                .ids_in(ItemState::Done)
                .into_iter()
                .filter(|id| {
                    let modified = validate
                        .entries
                        .get(id)
                        .is_some_and(|e| e.outcome == Some(Outcome::Modify));
                    !modified || revalidate.is_done(id)
                })
                .collect()
        }
        Stage::Filter => checkpoints.load(Stage::AssetFetch).await?.ids_in(ItemState::Done),
    };
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

/// Drives the pipeline stage by stage.
pub struct StageController {
    config: PipelineConfig,
    collab: Collaborators,
    stores: Stores,
    policy: RetryPolicy,
    cancel: CancellationToken,
    progress: Arc<dyn ProgressReporter>,
}

impl StageController {
    pub fn new(config: PipelineConfig, collab: Collaborators, stores: Stores) -> Self {
        Self {
            policy: RetryPolicy::from(&config.retry),
            config,
            collab,
            stores,
            cancel: CancellationToken::new(),
            progress: Arc::new(SilentProgress),
        }
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Asset-missing entries a fresh run from `start` would clear although the
    /// deleted record stays deleted. Only a run from Enrich or earlier
    /// rebuilds those records.
    async fn unrecoverable_failures(&self, start: Stage) -> Result<Vec<LedgerEntry>> {
        if start <= Stage::Enrich || start > Stage::AssetFetch {
            return Ok(Vec::new());
        }
        let mut kept = Vec::new();
        for entry in self.stores.ledger.entries(Some(Stage::AssetFetch)).await? {
            if entry.reason == ReasonCode::AssetMissing
                && self.stores.records.enriched(&entry.id).await?.is_none()
            {
                kept.push(entry);
            }
        }
        Ok(kept)
    }

    /// Token that stops the run between batches when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Run from `from` (or the retried stage) through to `Done`.
    #[instrument(skip_all, fields(mode = mode.as_str(), from = %from))]
    pub async fn run(&self, mode: RunMode, from: Stage) -> Result<RunSummary> {
        let start = match mode {
            RunMode::RetryFailed(stage) => stage,
            RunMode::Fresh | RunMode::Resume => from,
        };

        if mode == RunMode::Fresh {
            let kept = self.unrecoverable_failures(start).await?;
            for stage in Stage::ALL.into_iter().filter(|s| *s >= start) {
                self.stores.checkpoints.reset(stage).await?;
                self.stores.ledger.clear(stage).await?;
            }
            for entry in &kept {
                self.stores
                    .ledger
                    .record(entry.stage, &entry.id, entry.reason, &entry.detail, entry.retry_count)
                    .await?;
            }
            info!(from = %start, kept = kept.len(), "checkpoints reset");
        }

        let mut machine = StageMachine::starting_at(start);
        let mut summary = RunSummary {
            mode: mode.as_str(),
            stages: Vec::new(),
            ledger_entries: 0,
            dataset_size: None,
            interrupted: false,
        };

        while let Some(stage) = machine.current() {
            if self.cancel.is_cancelled() {
                summary.interrupted = true;
                break;
            }
            let retry_failed = mode == RunMode::RetryFailed(stage);
            let report = self.run_stage(stage, retry_failed).await?;
            let drained = report.is_drained();
            if stage == Stage::Filter {
                summary.dataset_size = Some(report.done);
            }
            summary.stages.push(report);

            if !drained {
                summary.interrupted = true;
                break;
            }
            machine.advance(drained)?;
        }

        summary.ledger_entries = self.stores.ledger.entries(None).await?.len();
        info!(
            interrupted = summary.interrupted,
            ledger = summary.ledger_entries,
            "run finished"
        );
        Ok(summary)
    }

    /// Run one stage. With `retry_failed`, failed ids are re-attempted
    /// alongside anything still pending.
    #[instrument(skip_all, fields(stage = %stage, retry_failed))]
    pub async fn run_stage(&self, stage: Stage, retry_failed: bool) -> Result<StageReport> {
        match stage {
            Stage::Fetch if !retry_failed => self.run_fetch().await,
            Stage::Filter => self.run_filter().await,
            _ => {
                let mut checkpoint = self.stores.checkpoints.load(stage).await?;
                let inputs = universe(self.stores.checkpoints.as_ref(), stage, &checkpoint).await?;
                let ids = if retry_failed {
                    partition::remaining(&checkpoint, inputs.iter().cloned())
                } else {
                    partition::pending(&checkpoint, inputs.iter().cloned())
                };

                info!(total = ids.len(), "stage started");
                self.progress.stage_started(stage, ids.len());
                let pool = self.pool(stage);
                let mut processed = 0;
                for batch in partition::batches(&ids, self.config.batch_size) {
                    if self.cancel.is_cancelled() {
                        break;
                    }
                    processed += self.run_batch(stage, &pool, &mut checkpoint, batch).await?;
                    self.progress.batch_committed(stage, processed, ids.len());
                }

                let mut report = StageReport::from_checkpoint(stage, &checkpoint, &inputs);
                report.processed = processed;
                report.interrupted = self.cancel.is_cancelled();
                self.finish(&report);
                Ok(report)
            }
        }
    }

    /// Current per-stage counts without running anything.
    pub async fn status(&self) -> Result<Vec<StageReport>> {
        stage_status(self.stores.checkpoints.as_ref()).await
    }

    fn pool(&self, stage: Stage) -> WorkerPool {
        WorkerPool::new(&self.config.stage(stage), self.policy, self.cancel.clone())
    }

    fn finish(&self, report: &StageReport) {
        info!(
            stage = %report.stage,
            processed = report.processed,
            done = report.done,
            failed = report.failed,
            deleted = report.deleted,
            pending = report.pending,
            interrupted = report.interrupted,
            "stage finished"
        );
        self.progress.stage_finished(report);
    }

    // -----------------------------------------------------------------------
    // Fetch: paged discovery
    // -----------------------------------------------------------------------

    async fn run_fetch(&self) -> Result<StageReport> {
        let stage = Stage::Fetch;
        let mut checkpoint = self.stores.checkpoints.load(stage).await?;
        let pool = self.pool(stage);
        let mut pacer = Pacer::new(self.config.stage(stage).min_interval());
        let mut page = checkpoint.cursor.map_or(1, |c| c + 1);
        let mut processed = 0;

        info!(start_page = page, "stage started");
        self.progress.stage_started(stage, 0);

        loop {
            if self.cancel.is_cancelled() {
                break;
            }
            if self.config.max_pages.is_some_and(|max| page > max) {
                debug!(page, "page limit reached");
                break;
            }

            let (listing, _) = self
                .policy
                .run(
                    &self.cancel,
                    || tokio::time::sleep_until(pacer.reserve()),
                    || self.collab.source.fetch_page(page),
                )
                .await;
            let refs: Vec<ItemRef> = match listing? {
                Attempt::Success(refs) => refs,
                Attempt::Interrupted => break,
                Attempt::TransientFailure(e) | Attempt::PermanentFailure(e) => {
                    // Cursor stays put, so the next resume retries this page.
                    warn!(page, error = %e, "listing page failed, stopping discovery");
                    break;
                }
            };
            if refs.is_empty() {
                debug!(page, "listing exhausted");
                break;
            }

            let ids = partition::pending(&checkpoint, refs.into_iter().map(|r| r.id));
            debug!(page, new = ids.len(), "listing page");
            for batch in partition::batches(&ids, self.config.batch_size) {
                if self.cancel.is_cancelled() {
                    break;
                }
                processed += self.run_batch(stage, &pool, &mut checkpoint, batch).await?;
                self.progress.batch_committed(stage, processed, 0);
            }
            if self.cancel.is_cancelled() {
                // Page may be partial; leave the cursor so it is listed again.
                break;
            }

            self.stores.checkpoints.set_cursor(stage, page).await?;
            self.stores.checkpoints.flush().await?;
            checkpoint.cursor = Some(page);
            page += 1;
        }

        let universe: Vec<ItemId> = checkpoint.entries.keys().cloned().collect();
        let mut report = StageReport::from_checkpoint(stage, &checkpoint, &universe);
        report.processed = processed;
        report.interrupted = self.cancel.is_cancelled();
        self.finish(&report);
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Filter: pure predicate pass plus export
    // -----------------------------------------------------------------------

    async fn run_filter(&self) -> Result<StageReport> {
        let stage = Stage::Filter;
        let input = self.stores.checkpoints.load(Stage::AssetFetch).await?;
        let universe = input.ids_in(ItemState::Done);
        self.progress.stage_started(stage, universe.len());

        let mut candidates = Vec::with_capacity(universe.len());
        let mut entries = Vec::with_capacity(universe.len());
        for id in &universe {
            let Some(record) = self.stores.records.enriched(id).await? else {
                entries.push((id.clone(), CheckpointEntry::new(ItemState::Deleted, 0)));
                continue;
            };
            let asset = match self.collab.assets.exists(id).await {
                Ok(true) => AssetStatus::Present,
                Ok(false) => AssetStatus::Missing,
                Err(e) if classify(&e) == ErrorClass::Fatal => return Err(e),
                Err(e) => {
                    warn!(%id, error = %e, "asset check failed");
                    AssetStatus::Unchecked
                }
            };
            candidates.push(FilterCandidate { record, asset });
        }

        let result = filter::consistency_filter(candidates);
        filter::write_dataset(&self.config.dataset_path(), &result.retained)?;

        entries.extend(
            result
                .retained
                .iter()
                .map(|r| (r.id.clone(), CheckpointEntry::new(ItemState::Done, 1))),
        );
        entries.extend(
            result
                .excluded
                .iter()
                .map(|(id, _)| (id.clone(), CheckpointEntry::new(ItemState::Deleted, 1))),
        );

        // Always recomputed over the full input, so start from a clean slate.
        self.stores.checkpoints.reset(stage).await?;
        self.stores.checkpoints.commit_batch(stage, &entries).await?;
        self.stores.checkpoints.flush().await?;

        let checkpoint = self.stores.checkpoints.load(stage).await?;
        let mut report = StageReport::from_checkpoint(stage, &checkpoint, &universe);
        report.processed = universe.len();
        report.exclusions = result
            .reason_counts
            .iter()
            .map(|(reason, n)| (reason.as_str().to_string(), *n))
            .collect();
        self.progress.batch_committed(stage, universe.len(), universe.len());
        info!(
            retained = result.retained.len(),
            excluded = result.excluded.len(),
            path = %self.config.dataset_path().display(),
            "dataset written"
        );
        self.finish(&report);
        Ok(report)
    }

    // -----------------------------------------------------------------------
    // Batches
    // -----------------------------------------------------------------------

    /// Process one batch end to end. Returns the number of items settled or
    /// failed. A fatal error returns before anything but the in-progress marks
    /// is committed.
    async fn run_batch(
        &self,
        stage: Stage,
        pool: &WorkerPool,
        checkpoint: &mut StageCheckpoint,
        ids: &[ItemId],
    ) -> Result<usize> {
        let prior = |id: &ItemId| checkpoint.entries.get(id).copied();
        let mut entries: Vec<(ItemId, CheckpointEntry)> = Vec::with_capacity(ids.len());
        let mut work = Vec::with_capacity(ids.len());

        for id in ids {
            match self.load_input(stage, id).await? {
                Loaded::Work(input) => work.push((id.clone(), input)),
                Loaded::Vanished(outcome) => {
                    debug!(%id, "upstream record gone, marking deleted");
                    let attempts = prior(id).map_or(0, |e| e.attempt_count);
                    let mut entry = CheckpointEntry::new(ItemState::Deleted, attempts);
                    entry.outcome = outcome;
                    entries.push((id.clone(), entry));
                }
            }
        }

        let in_progress: Vec<(ItemId, CheckpointEntry)> = work
            .iter()
            .map(|(id, _)| {
                let attempts = prior(id).map_or(0, |e| e.attempt_count);
                (id.clone(), CheckpointEntry::new(ItemState::InProgress, attempts))
            })
            .collect();
        self.stores.checkpoints.commit_batch(stage, &in_progress).await?;

        let collab = self.collab.clone();
        let outcomes = pool
            .run(work, move |id, input| {
                let collab = collab.clone();
                async move { collab.call(&id, input).await }
            })
            .await?;

        let mut settled = 0;
        let mut reported = HashSet::new();
        for outcome in outcomes {
            reported.insert(outcome.id.clone());
            let before = prior(&outcome.id);
            let (id, entry) = self.settle(stage, outcome, before).await?;
            if entry.state != ItemState::Pending {
                settled += 1;
            }
            entries.push((id, entry));
        }
        // Items the pool never pulled because of cancellation.
        for (id, _) in &in_progress {
            if !reported.contains(id) {
                let attempts = prior(id).map_or(0, |e| e.attempt_count);
                entries.push((id.clone(), CheckpointEntry::new(ItemState::Pending, attempts)));
            }
        }

        self.stores.checkpoints.commit_batch(stage, &entries).await?;
        self.stores.checkpoints.flush().await?;
        for (id, entry) in entries {
            checkpoint.entries.insert(id, entry);
        }
        debug!(stage = %stage, settled, "batch committed");
        Ok(settled)
    }

    async fn load_input(&self, stage: Stage, id: &ItemId) -> Result<Loaded> {
        let records = &self.stores.records;
        let loaded = match stage {
            Stage::Fetch => Loaded::Work(Input::Detail),
            Stage::Enrich => match records.raw(id).await? {
                Some(raw) => Loaded::Work(Input::Raw(Arc::new(raw))),
                None => Loaded::Work(Input::Missing("raw record missing".into())),
            },
            Stage::Validate => match records.enriched(id).await? {
                // Always judge the name Enrich produced, so a re-run after a
                // crash sees the same input as the first attempt.
                Some(mut record) => {
                    if let Some(original) = record.enriched_name.take() {
                        record.canonical_name = original;
                    }
                    Loaded::Work(Input::Name(Arc::new(record)))
                }
                None => Loaded::Vanished(Some(Outcome::Delete)),
            },
            Stage::Revalidate => match records.enriched(id).await? {
                Some(record) => {
                    let title = match records.raw(id).await? {
                        Some(raw) => raw.title,
                        None => record
                            .enriched_name
                            .clone()
                            .unwrap_or_else(|| record.canonical_name.clone()),
                    };
                    Loaded::Work(Input::Bundle {
                        title: title.into(),
                        record: Arc::new(record),
                    })
                }
                None => Loaded::Vanished(Some(Outcome::Delete)),
            },
            Stage::AssetFetch => match records.enriched(id).await? {
                Some(record) => Loaded::Work(Input::Asset(record.asset_url)),
                None => Loaded::Vanished(None),
            },
            Stage::Filter => Loaded::Vanished(None),
        };
        Ok(loaded)
    }

    /// Turn one worker outcome into a checkpoint entry, persisting the payload
    /// or the ledger entry first.
    async fn settle(
        &self,
        stage: Stage,
        outcome: WorkOutcome<Payload>,
        before: Option<CheckpointEntry>,
    ) -> Result<(ItemId, CheckpointEntry)> {
        let WorkOutcome {
            id,
            attempts,
            result,
        } = outcome;
        let total_attempts = before.map_or(0, |e| e.attempt_count) + attempts;
        let ledger = &self.stores.ledger;

        let reason = result.reason();
        let entry = match result {
            Attempt::Success(payload) => {
                let (state, tag) = self.apply(&id, payload).await?;
                if before.is_some_and(|e| e.state == ItemState::Failed) {
                    ledger.resolve(stage, &id).await?;
                }
                let mut entry = CheckpointEntry::new(state, total_attempts);
                entry.outcome = tag;
                entry
            }
            Attempt::TransientFailure(err) | Attempt::PermanentFailure(err) => {
                if stage == Stage::AssetFetch && err.is_not_found() {
                    warn!(%id, error = %err, "asset missing, dropping item");
                    ledger
                        .record(stage, &id, ReasonCode::AssetMissing, &err.to_string(), total_attempts)
                        .await?;
                    self.stores.records.delete_enriched(&id).await?;
                    CheckpointEntry::new(ItemState::Deleted, total_attempts)
                } else {
                    let reason = reason.unwrap_or(ReasonCode::Rejected);
                    warn!(%id, %reason, attempts = total_attempts, error = %err, "item failed");
                    ledger
                        .record(stage, &id, reason, &err.to_string(), total_attempts)
                        .await?;
                    CheckpointEntry::new(ItemState::Failed, total_attempts)
                }
            }
            Attempt::Interrupted => CheckpointEntry::new(ItemState::Pending, total_attempts),
        };
        Ok((id, entry))
    }

    /// Persist a success payload. Returns the resulting state and outcome tag.
    async fn apply(&self, id: &ItemId, payload: Payload) -> Result<(ItemState, Option<Outcome>)> {
        let records = &self.stores.records;
        match payload {
            Payload::Raw(raw) => {
                records.put_raw(&raw).await?;
                Ok((ItemState::Done, None))
            }
            Payload::Enriched(record) => {
                records.put_enriched(&record).await?;
                Ok((ItemState::Done, None))
            }
            Payload::Verdict(Verdict::Keep) => self.settle_name(id, None).await,
            Payload::Verdict(Verdict::Modify(name)) => self.settle_name(id, Some(name)).await,
            Payload::Verdict(Verdict::Delete) | Payload::Bundle(true) => {
                records.delete_enriched(id).await?;
                Ok((ItemState::Deleted, Some(Outcome::Delete)))
            }
            Payload::Bundle(false) => Ok((ItemState::Done, Some(Outcome::Confirm))),
            Payload::AssetStored => Ok((ItemState::Done, None)),
        }
    }

    /// Write the validated name. `None` or an unchanged name keeps the name
    /// Enrich produced.
    async fn settle_name(
        &self,
        id: &ItemId,
        new_name: Option<String>,
    ) -> Result<(ItemState, Option<Outcome>)> {
        let records = &self.stores.records;
        let Some(mut record) = records.enriched(id).await? else {
            return Ok((ItemState::Deleted, Some(Outcome::Delete)));
        };
        let original = record
            .enriched_name
            .clone()
            .unwrap_or_else(|| record.canonical_name.clone());

        match new_name {
            Some(name) if name != original => {
                if record.canonical_name != name || record.enriched_name.is_none() {
                    record.enriched_name = Some(original);
                    record.canonical_name = name;
                    records.put_enriched(&record).await?;
                }
                Ok((ItemState::Done, Some(Outcome::Modify)))
            }
            _ => {
                if record.enriched_name.is_some() {
                    record.canonical_name = original;
                    record.enriched_name = None;
                    records.put_enriched(&record).await?;
                }
                Ok((ItemState::Done, Some(Outcome::Keep)))
            }
        }
    }
}
