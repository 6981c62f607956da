//! Final completeness pass and dataset export.

use std::collections::BTreeMap;
use std::io::Write;
use std::path::Path;

use serde::Serialize;

use larder_shared::{EnrichedRecord, ItemId, LarderError, Result};

/// Why a record was left out of the final dataset. Not mutually exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExclusionReason {
    MissingAsset,
    /// The asset store could not say whether the asset is there.
    AssetUnchecked,
    EmptyBody,
    EmptySteps,
    EmptyName,
}

impl ExclusionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::MissingAsset => "missing-asset",
            Self::AssetUnchecked => "asset-unchecked",
            Self::EmptyBody => "empty-body",
            Self::EmptySteps => "empty-steps",
            Self::EmptyName => "empty-name",
        }
    }
}

/// What the asset store said about a record's asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetStatus {
    Present,
    Missing,
    /// The lookup itself failed.
    Unchecked,
}

/// A record entering the filter, with the state of its asset on disk.
#[derive(Debug, Clone)]
pub struct FilterCandidate {
    pub record: EnrichedRecord,
    pub asset: AssetStatus,
}

/// Partition produced by [`consistency_filter`].
#[derive(Debug, Default)]
pub struct FilterReport {
    pub retained: Vec<EnrichedRecord>,
    /// Excluded ids with every predicate they failed.
    pub excluded: Vec<(ItemId, Vec<ExclusionReason>)>,
    /// Per-reason counts; an item failing two predicates counts under both.
    pub reason_counts: BTreeMap<ExclusionReason, usize>,
}

/// Predicates `record` fails. Empty means it is kept.
pub fn failed_predicates(candidate: &FilterCandidate) -> Vec<ExclusionReason> {
    let record = &candidate.record;
    let mut reasons = Vec::new();
    match candidate.asset {
        AssetStatus::Present => {}
        AssetStatus::Missing => reasons.push(ExclusionReason::MissingAsset),
        AssetStatus::Unchecked => reasons.push(ExclusionReason::AssetUnchecked),
    }
    if record.ingredients.iter().all(|i| i.name.trim().is_empty()) {
        reasons.push(ExclusionReason::EmptyBody);
    }
    if record.steps.iter().all(|s| s.trim().is_empty()) {
        reasons.push(ExclusionReason::EmptySteps);
    }
    if record.canonical_name.trim().is_empty() {
        reasons.push(ExclusionReason::EmptyName);
    }
    reasons
}

/// Keep a record iff its asset exists and its body, steps and name are all
/// non-empty.
pub fn consistency_filter(candidates: Vec<FilterCandidate>) -> FilterReport {
    let mut report = FilterReport::default();
    for candidate in candidates {
        let reasons = failed_predicates(&candidate);
        if reasons.is_empty() {
            report.retained.push(candidate.record);
            continue;
        }
        for reason in &reasons {
            *report.reason_counts.entry(*reason).or_default() += 1;
        }
        report.excluded.push((candidate.record.id, reasons));
    }
    report
}

/// Write `records` as JSON Lines, replacing `path` atomically.
pub fn write_dataset(path: &Path, records: &[EnrichedRecord]) -> Result<()> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| LarderError::io(parent, e))?;

    let tmp = path.with_extension("jsonl.tmp");
    {
        let file = std::fs::File::create(&tmp).map_err(|e| LarderError::io(&tmp, e))?;
        let mut out = std::io::BufWriter::new(file);
        for record in records {
            let line = serde_json::to_string(record)
                .map_err(|e| LarderError::parse(format!("failed to serialize {}: {e}", record.id)))?;
            writeln!(out, "{line}").map_err(|e| LarderError::io(&tmp, e))?;
        }
        out.flush().map_err(|e| LarderError::io(&tmp, e))?;
        out.get_ref()
            .sync_all()
            .map_err(|e| LarderError::io(&tmp, e))?;
    }
    std::fs::rename(&tmp, path).map_err(|e| LarderError::io(path, e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use larder_shared::{ENRICHED_SCHEMA_VERSION, Ingredient, RecipeMeta};

    fn record(id: &str, name: &str, ingredients: usize, steps: &[&str]) -> EnrichedRecord {
        EnrichedRecord {
            schema_version: ENRICHED_SCHEMA_VERSION,
            id: id.into(),
            canonical_name: name.into(),
            enriched_name: None,
            attribution: None,
            ingredients: (0..ingredients)
                .map(|i| Ingredient {
                    name: format!("재료{i}"),
                    amount: "1개".into(),
                })
                .collect(),
            steps: steps.iter().map(|s| s.to_string()).collect(),
            meta: RecipeMeta::default(),
            categories: Default::default(),
            asset_url: None,
            source_url: format!("https://www.10000recipe.com/recipe/{id}"),
            enriched_at: Utc::now(),
        }
    }

    fn candidate(record: EnrichedRecord, asset_exists: bool) -> FilterCandidate {
        FilterCandidate {
            record,
            asset: if asset_exists {
                AssetStatus::Present
            } else {
                AssetStatus::Missing
            },
        }
    }

    #[test]
    fn complete_record_is_retained() {
        let report = consistency_filter(vec![candidate(
            record("1", "김치찌개", 2, &["끓인다"]),
            true,
        )]);
        assert_eq!(report.retained.len(), 1);
        assert!(report.excluded.is_empty());
        assert!(report.reason_counts.is_empty());
    }

    #[test]
    fn reasons_are_not_mutually_exclusive() {
        let report = consistency_filter(vec![
            candidate(record("1", "", 0, &[]), false),
            candidate(record("2", "된장국", 1, &["  "]), true),
            candidate(record("3", "계란말이", 1, &["말기"]), true),
        ]);

        assert_eq!(report.retained.len(), 1);
        assert_eq!(report.excluded.len(), 2);
        assert_eq!(report.excluded[0].1.len(), 4);
        assert_eq!(report.reason_counts[&ExclusionReason::EmptySteps], 2);
        assert_eq!(report.reason_counts[&ExclusionReason::MissingAsset], 1);
    }

    #[test]
    fn unchecked_asset_is_its_own_reason() {
        let report = consistency_filter(vec![FilterCandidate {
            record: record("1", "김치찌개", 2, &["끓인다"]),
            asset: AssetStatus::Unchecked,
        }]);
        assert!(report.retained.is_empty());
        assert_eq!(report.excluded[0].1, vec![ExclusionReason::AssetUnchecked]);
        assert!(!report.reason_counts.contains_key(&ExclusionReason::MissingAsset));
    }

    #[test]
    fn every_excluded_item_fails_something() {
        let inputs = vec![
            candidate(record("1", "a", 1, &["x"]), true),
            candidate(record("2", "b", 0, &["x"]), true),
            candidate(record("3", "c", 1, &["x"]), false),
            candidate(record("4", " ", 1, &["x"]), true),
        ];
        let report = consistency_filter(inputs.clone());
        for kept in &report.retained {
            let input = inputs.iter().find(|c| c.record.id == kept.id).unwrap();
            assert!(failed_predicates(input).is_empty());
        }
        for (_, reasons) in &report.excluded {
            assert!(!reasons.is_empty());
        }
        assert_eq!(report.retained.len() + report.excluded.len(), inputs.len());
    }

    #[test]
    fn dataset_written_as_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out").join("dataset.jsonl");
        let records = vec![
            record("1", "김치찌개", 1, &["a"]),
            record("2", "된장찌개", 1, &["b"]),
        ];

        write_dataset(&path, &records).unwrap();
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        let first: EnrichedRecord = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first.canonical_name, "김치찌개");
        assert!(!path.with_extension("jsonl.tmp").exists());

        // Rewriting replaces, never appends
        write_dataset(&path, &records[..1]).unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1);
    }
}
