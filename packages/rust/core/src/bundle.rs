//! Heuristic detection of bundle titles collapsed into a single dish name.

use std::sync::LazyLock;

use async_trait::async_trait;
use regex::Regex;

use larder_shared::{BundleDetector, EnrichedRecord, Result};

/// Title fragments that mark a multi-dish post: "6종세트", "반찬 3가지",
/// "세가지", "모음", "세트".
static INDICATORS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"\d+\s*종",
        r"\d+\s*가지",
        r"(?:두|세|네|다섯|여섯|일곱|여덟|아홉|열)\s*가지",
        r"모음",
        r"세트",
    ]
    .iter()
    .filter_map(|p| Regex::new(p).ok())
    .collect()
});

fn has_indicator(text: &str) -> bool {
    INDICATORS.iter().any(|re| re.is_match(text))
}

/// Flags a record when its published title carries a bundle indicator that
/// the rewritten canonical name no longer does.
///
/// `"가지요리 6종세트"` → `"돼지고기 가지볶음"` is a bundle; `"반찬 3가지"` kept
/// as `"반찬 3가지"` is not, since Validate already saw the collection form.
#[derive(Debug, Default, Clone, Copy)]
pub struct HeuristicBundleDetector;

#[async_trait]
impl BundleDetector for HeuristicBundleDetector {
    async fn is_bundle(&self, original_title: &str, record: &EnrichedRecord) -> Result<bool> {
        Ok(has_indicator(original_title) && !has_indicator(&record.canonical_name))
    }
}
