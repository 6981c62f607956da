//! Core domain types for the larder pipeline.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::LarderError;

/// Current schema version for stored [`RawRecord`]s.
pub const RAW_SCHEMA_VERSION: u32 = 1;

/// Current schema version for stored [`EnrichedRecord`]s.
pub const ENRICHED_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// ItemId
// ---------------------------------------------------------------------------

/// Immutable external key of an item (the source's recipe id).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub String);

impl ItemId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One phase of the pipeline, each with its own checkpoint and worker pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Fetch,
    Enrich,
    Validate,
    Revalidate,
    AssetFetch,
    Filter,
}

impl Stage {
    /// All stages in execution order.
    pub const ALL: [Stage; 6] = [
        Stage::Fetch,
        Stage::Enrich,
        Stage::Validate,
        Stage::Revalidate,
        Stage::AssetFetch,
        Stage::Filter,
    ];

    /// Storage key for this stage.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fetch => "fetch",
            Self::Enrich => "enrich",
            Self::Validate => "validate",
            Self::Revalidate => "revalidate",
            Self::AssetFetch => "asset_fetch",
            Self::Filter => "filter",
        }
    }

    /// The stage that follows this one, or `None` after `Filter`.
    pub fn next(&self) -> Option<Stage> {
        match self {
            Self::Fetch => Some(Self::Enrich),
            Self::Enrich => Some(Self::Validate),
            Self::Validate => Some(Self::Revalidate),
            Self::Revalidate => Some(Self::AssetFetch),
            Self::AssetFetch => Some(Self::Filter),
            Self::Filter => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = LarderError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "fetch" => Ok(Self::Fetch),
            "enrich" => Ok(Self::Enrich),
            "validate" => Ok(Self::Validate),
            "revalidate" => Ok(Self::Revalidate),
            "asset_fetch" | "asset-fetch" | "assets" => Ok(Self::AssetFetch),
            "filter" => Ok(Self::Filter),
            other => Err(LarderError::validation(format!("unknown stage '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// ItemState
// ---------------------------------------------------------------------------

/// Per-stage processing state of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ItemState {
    Pending,
    InProgress,
    Done,
    Failed,
    Deleted,
}

impl ItemState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in-progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Deleted => "deleted",
        }
    }

    /// Settled items are never handed to a worker again for that stage.
    pub fn is_settled(&self) -> bool {
        matches!(self, Self::Done | Self::Deleted)
    }
}

impl fmt::Display for ItemState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemState {
    type Err = LarderError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "in-progress" => Ok(Self::InProgress),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            "deleted" => Ok(Self::Deleted),
            other => Err(LarderError::validation(format!("unknown item state '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Stage outcomes
// ---------------------------------------------------------------------------

/// Verdict of the Validate stage for one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// Canonical name is fine as is.
    Keep,
    /// Canonical name must be rewritten to the given value.
    Modify(String),
    /// Record is not a usable single recipe.
    Delete,
}

/// Outcome tag persisted alongside a checkpoint entry.
///
/// Validate records keep/modify/delete, Revalidate records confirm/delete. The
/// Revalidate input set is derived from the `Modify` tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    Keep,
    Modify,
    Delete,
    Confirm,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Keep => "keep",
            Self::Modify => "modify",
            Self::Delete => "delete",
            Self::Confirm => "confirm",
        }
    }
}

impl FromStr for Outcome {
    type Err = LarderError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "keep" => Ok(Self::Keep),
            "modify" => Ok(Self::Modify),
            "delete" => Ok(Self::Delete),
            "confirm" => Ok(Self::Confirm),
            other => Err(LarderError::validation(format!("unknown outcome '{other}'"))),
        }
    }
}

// ---------------------------------------------------------------------------
// Checkpoint
// ---------------------------------------------------------------------------

/// One persisted checkpoint row: `{id, state, attempt_count}` plus an outcome tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckpointEntry {
    pub state: ItemState,
    pub attempt_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<Outcome>,
}

impl CheckpointEntry {
    pub fn new(state: ItemState, attempt_count: u32) -> Self {
        Self {
            state,
            attempt_count,
            outcome: None,
        }
    }

    pub fn with_outcome(mut self, outcome: Outcome) -> Self {
        self.outcome = Some(outcome);
        self
    }
}

/// Snapshot of one stage's checkpoint: per-item entries plus the listing cursor.
#[derive(Debug, Clone, Default)]
pub struct StageCheckpoint {
    pub entries: HashMap<ItemId, CheckpointEntry>,
    /// Last fully committed listing page (Fetch only).
    pub cursor: Option<u64>,
}

impl StageCheckpoint {
    pub fn state_of(&self, id: &ItemId) -> Option<ItemState> {
        self.entries.get(id).map(|e| e.state)
    }

    pub fn is_settled(&self, id: &ItemId) -> bool {
        self.state_of(id).is_some_and(|s| s.is_settled())
    }

    pub fn is_done(&self, id: &ItemId) -> bool {
        self.state_of(id) == Some(ItemState::Done)
    }

    /// Ids in `state`, sorted for deterministic dispatch.
    pub fn ids_in(&self, state: ItemState) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.state == state)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Ids whose outcome tag equals `outcome`, sorted.
    pub fn ids_with_outcome(&self, outcome: Outcome) -> Vec<ItemId> {
        let mut ids: Vec<ItemId> = self
            .entries
            .iter()
            .filter(|(_, e)| e.outcome == Some(outcome))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn count(&self, state: ItemState) -> usize {
        self.entries.values().filter(|e| e.state == state).count()
    }
}

// ---------------------------------------------------------------------------
// Failure ledger
// ---------------------------------------------------------------------------

/// Why an item was permanently dropped from a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReasonCode {
    /// Source reported the item missing.
    NotFound,
    /// Asset host reported the image missing, or the record has no asset.
    AssetMissing,
    /// Transient failures used up the retry budget.
    RetriesExhausted,
    /// Collaborator rejected the item outright.
    Rejected,
}

impl ReasonCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::NotFound => "not-found",
            Self::AssetMissing => "asset-missing",
            Self::RetriesExhausted => "retries-exhausted",
            Self::Rejected => "rejected",
        }
    }
}

impl fmt::Display for ReasonCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReasonCode {
    type Err = LarderError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "not-found" => Ok(Self::NotFound),
            "asset-missing" => Ok(Self::AssetMissing),
            "retries-exhausted" => Ok(Self::RetriesExhausted),
            "rejected" => Ok(Self::Rejected),
            other => Err(LarderError::validation(format!("unknown reason code '{other}'"))),
        }
    }
}

/// A permanently failed item. At most one entry exists per (stage, id).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: ItemId,
    pub stage: Stage,
    pub reason: ReasonCode,
    /// Last error message seen for the item.
    pub detail: String,
    pub retry_count: u32,
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Records
// ---------------------------------------------------------------------------

/// An entry discovered on a listing page.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemRef {
    pub id: ItemId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// One ingredient line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingredient {
    pub name: String,
    #[serde(default)]
    pub amount: String,
}

/// Output of the Source Fetcher. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawRecord {
    pub schema_version: u32,
    pub id: ItemId,
    /// Detail page URL.
    pub url: String,
    /// Title exactly as published by the source.
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    /// Step texts in source order.
    #[serde(default)]
    pub steps: Vec<String>,
    /// Asset locators; the first one is the main image.
    #[serde(default)]
    pub asset_urls: Vec<String>,
    #[serde(default, skip_serializing_if = "RecipeCategories::is_empty")]
    pub categories: RecipeCategories,
    /// SHA-256 of the fetched detail body.
    pub content_hash: String,
    pub fetched_at: DateTime<Utc>,
}

/// The source files every recipe under one value per axis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeCategories {
    /// Dish type (soup, side dish, ...).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub situation: Option<String>,
    /// Main ingredient.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingredient: Option<String>,
    /// Cooking method.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
}

impl RecipeCategories {
    pub fn is_empty(&self) -> bool {
        self.kind.is_none()
            && self.situation.is_none()
            && self.ingredient.is_none()
            && self.method.is_none()
    }
}

/// Structured metadata subset carried by an [`EnrichedRecord`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecipeMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub servings: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cook_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<String>,
}

/// Output of the Transform Service, possibly rewritten by Validate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnrichedRecord {
    pub schema_version: u32,
    pub id: ItemId,
    /// Derived canonical dish name.
    pub canonical_name: String,
    /// Name as Enrich produced it, kept once Validate rewrites `canonical_name`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enriched_name: Option<String>,
    /// Well-known author the recipe is attributed to, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attribution: Option<String>,
    /// Structured body: the ingredient list.
    #[serde(default)]
    pub ingredients: Vec<Ingredient>,
    /// Normalized step sequence.
    #[serde(default)]
    pub steps: Vec<String>,
    #[serde(default)]
    pub meta: RecipeMeta,
    #[serde(default, skip_serializing_if = "RecipeCategories::is_empty")]
    pub categories: RecipeCategories,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asset_url: Option<String>,
    pub source_url: String,
    pub enriched_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stage_order_is_linear() {
        let mut stage = Stage::Fetch;
        let mut seen = vec![stage];
        while let Some(next) = stage.next() {
            seen.push(next);
            stage = next;
        }
        assert_eq!(seen, Stage::ALL.to_vec());
    }

    #[test]
    fn stage_parse_roundtrip() {
        for stage in Stage::ALL {
            let parsed: Stage = stage.as_str().parse().expect("parse stage");
            assert_eq!(parsed, stage);
        }
        assert_eq!("asset-fetch".parse::<Stage>().unwrap(), Stage::AssetFetch);
        assert!("bake".parse::<Stage>().is_err());
    }

    #[test]
    fn only_done_and_deleted_are_settled() {
        assert!(ItemState::Done.is_settled());
        assert!(ItemState::Deleted.is_settled());
        assert!(!ItemState::Failed.is_settled());
        assert!(!ItemState::Pending.is_settled());
        assert!(!ItemState::InProgress.is_settled());
    }

    #[test]
    fn checkpoint_queries() {
        let mut cp = StageCheckpoint::default();
        cp.entries.insert(
            "b".into(),
            CheckpointEntry::new(ItemState::Done, 1).with_outcome(Outcome::Modify),
        );
        cp.entries.insert(
            "a".into(),
            CheckpointEntry::new(ItemState::Done, 1).with_outcome(Outcome::Modify),
        );
        cp.entries
            .insert("c".into(), CheckpointEntry::new(ItemState::Failed, 3));

        assert_eq!(cp.ids_with_outcome(Outcome::Modify), vec![ItemId::from("a"), ItemId::from("b")]);
        assert_eq!(cp.ids_in(ItemState::Failed), vec![ItemId::from("c")]);
        assert!(cp.is_settled(&"a".into()));
        assert!(!cp.is_settled(&"c".into()));
        assert!(!cp.is_settled(&"zzz".into()));
        assert_eq!(cp.count(ItemState::Done), 2);
    }

    #[test]
    fn reason_code_serializes_kebab() {
        let json = serde_json::to_string(&ReasonCode::AssetMissing).unwrap();
        assert_eq!(json, r#""asset-missing""#);
        assert_eq!("asset-missing".parse::<ReasonCode>().unwrap(), ReasonCode::AssetMissing);
    }

    #[test]
    fn enriched_record_serialization() {
        let record = EnrichedRecord {
            schema_version: ENRICHED_SCHEMA_VERSION,
            id: "128671".into(),
            canonical_name: "김치찌개".into(),
            enriched_name: None,
            attribution: None,
            ingredients: vec![Ingredient {
                name: "김치".into(),
                amount: "1/4포기".into(),
            }],
            steps: vec!["김치를 썰어요.".into()],
            meta: RecipeMeta {
                servings: Some("2인분".into()),
                ..Default::default()
            },
            categories: RecipeCategories {
                kind: Some("찌개".into()),
                ingredient: Some("김치".into()),
                ..Default::default()
            },
            asset_url: Some("https://recipe1.ezmember.co.kr/cache/recipe/main.jpg".into()),
            source_url: "https://www.10000recipe.com/recipe/128671".into(),
            enriched_at: Utc::now(),
        };

        let json = serde_json::to_string(&record).expect("serialize");
        assert!(!json.contains("attribution"));
        let parsed: EnrichedRecord = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(parsed, record);
    }

    #[test]
    fn records_without_categories_still_load() {
        let json = r#"{
            "schema_version": 1,
            "id": "1",
            "url": "https://www.10000recipe.com/recipe/1",
            "title": "김치찌개",
            "content_hash": "abc",
            "fetched_at": "2025-01-01T00:00:00Z"
        }"#;
        let raw: RawRecord = serde_json::from_str(json).expect("deserialize");
        assert!(raw.categories.is_empty());
        assert!(!serde_json::to_string(&raw).unwrap().contains("categories"));
    }
}
