//! HTTP collaborators for the larder pipeline.
//!
//! This crate provides:
//! - [`HttpSource`]: paged listing, detail-page and category extraction ([`SourceFetcher`])
//! - [`HttpAssetStore`]: image download with atomic writes ([`AssetStore`])
//!
//! Both refuse private and loopback targets unless built for tests.
//!
//! [`SourceFetcher`]: larder_shared::SourceFetcher
//! [`AssetStore`]: larder_shared::AssetStore

pub mod assets;
mod net;
pub mod source;

pub use assets::HttpAssetStore;
pub use net::compute_hash;
pub use source::{
    CATEGORY_AXES, CategoryCatalog, CategoryEntry, HttpSource, clean_image_url, extract_recipe_id,
};
