//! External collaborators: the recipe source, the transform service, and the
//! asset host. Production implementations live in `larder-crawler` and
//! `larder-core`; tests substitute fakes.

use async_trait::async_trait;

use crate::error::Result;
use crate::types::{EnrichedRecord, ItemId, ItemRef, RawRecord, Verdict};

/// Paged listing plus per-item detail retrieval.
#[async_trait]
pub trait SourceFetcher: Send + Sync {
    /// Fetch listing page `cursor`. An empty result means the listing is exhausted.
    async fn fetch_page(&self, cursor: u64) -> Result<Vec<ItemRef>>;

    /// Fetch one item's detail. A missing item yields `LarderError::NotFound`.
    async fn fetch_detail(&self, id: &ItemId) -> Result<RawRecord>;
}

/// Turns a raw record into an enriched one.
#[async_trait]
pub trait TransformService: Send + Sync {
    async fn transform(&self, raw: &RawRecord) -> Result<EnrichedRecord>;
}

/// Decides keep/modify/delete for an enriched record's canonical name.
#[async_trait]
pub trait NameValidator: Send + Sync {
    async fn validate(&self, record: &EnrichedRecord) -> Result<Verdict>;
}

/// Flags records whose published title describes a bundle of dishes rather
/// than one recipe.
#[async_trait]
pub trait BundleDetector: Send + Sync {
    async fn is_bundle(&self, original_title: &str, record: &EnrichedRecord) -> Result<bool>;
}

/// Retrieves and stores item assets (the main image).
#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Whether an asset for `id` is already stored.
    async fn exists(&self, id: &ItemId) -> Result<bool>;

    /// Download `url`. A missing asset yields `LarderError::NotFound`.
    async fn fetch(&self, url: &str) -> Result<Vec<u8>>;

    /// Store `bytes` as the asset for `id`.
    async fn save(&self, id: &ItemId, url: &str, bytes: &[u8]) -> Result<()>;
}
