//! Shared types, error model, configuration, and store/collaborator seams for larder.
//!
//! This crate is the foundation depended on by all other larder crates.
//! It provides:
//! - [`LarderError`]: the unified error type
//! - Domain types ([`ItemId`], [`ItemState`], [`Stage`], [`RawRecord`], [`EnrichedRecord`])
//! - Configuration ([`AppConfig`], [`PipelineConfig`], config loading)
//! - The injected interfaces the pipeline runs against ([`CheckpointStore`],
//!   [`FailureLedger`], [`RecordStore`], and the external collaborators)

pub mod collab;
pub mod config;
pub mod error;
pub mod store;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use collab::{AssetStore, BundleDetector, NameValidator, SourceFetcher, TransformService};
pub use config::{
    AppConfig, DefaultsConfig, OpenRouterConfig, PipelineConfig, RetryConfig, RevalidatorKind,
    SourceConfig, StageConfig, StagesConfig, StrategyConfig, ValidatorKind, config_dir,
    config_file_path, init_config, init_config_in, load_config, load_config_from,
    validate_api_key,
};
pub use error::{LarderError, Result};
pub use store::{CheckpointStore, FailureLedger, RecordStore};
pub use types::{
    CheckpointEntry, ENRICHED_SCHEMA_VERSION, EnrichedRecord, Ingredient, ItemId, ItemRef,
    ItemState, LedgerEntry, Outcome, RAW_SCHEMA_VERSION, RawRecord, ReasonCode, RecipeCategories,
    RecipeMeta, Stage, StageCheckpoint, Verdict,
};
