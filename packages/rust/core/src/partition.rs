//! Remaining-work computation for a stage.

use std::collections::HashSet;

use larder_shared::{ItemId, ItemState, StageCheckpoint};

/// `universe` minus every id the checkpoint marks done or deleted.
///
/// Order follows `universe`; duplicates are dropped.
pub fn remaining<I>(checkpoint: &StageCheckpoint, universe: I) -> Vec<ItemId>
where
    I: IntoIterator<Item = ItemId>,
{
    let mut seen = HashSet::new();
    universe
        .into_iter()
        .filter(|id| !checkpoint.is_settled(id))
        .filter(|id| seen.insert(id.clone()))
        .collect()
}

/// Work for a normal run: [`remaining`] without the ids that already failed
/// permanently. Those wait for an explicit retry.
pub fn pending<I>(checkpoint: &StageCheckpoint, universe: I) -> Vec<ItemId>
where
    I: IntoIterator<Item = ItemId>,
{
    remaining(checkpoint, universe)
        .into_iter()
        .filter(|id| checkpoint.state_of(id) != Some(ItemState::Failed))
        .collect()
}

/// Split `ids` into batches of at most `size`.
pub fn batches(ids: &[ItemId], size: usize) -> impl Iterator<Item = &[ItemId]> {
    ids.chunks(size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use larder_shared::CheckpointEntry;

    fn checkpoint(entries: &[(&str, ItemState)]) -> StageCheckpoint {
        let mut cp = StageCheckpoint::default();
        for (id, state) in entries {
            cp.entries
                .insert(ItemId::from(*id), CheckpointEntry::new(*state, 1));
        }
        cp
    }

    fn ids(raw: &[&str]) -> Vec<ItemId> {
        raw.iter().map(|s| ItemId::from(*s)).collect()
    }

    #[test]
    fn settled_ids_are_excluded() {
        let cp = checkpoint(&[
            ("1", ItemState::Done),
            ("2", ItemState::Deleted),
            ("3", ItemState::Failed),
            ("4", ItemState::InProgress),
        ]);
        let left = remaining(&cp, ids(&["1", "2", "3", "4", "5"]));
        assert_eq!(left, ids(&["3", "4", "5"]));
    }

    #[test]
    fn pending_skips_failed() {
        let cp = checkpoint(&[("3", ItemState::Failed), ("4", ItemState::InProgress)]);
        assert_eq!(pending(&cp, ids(&["3", "4", "5"])), ids(&["4", "5"]));
    }

    #[test]
    fn duplicates_collapse() {
        let cp = StageCheckpoint::default();
        assert_eq!(remaining(&cp, ids(&["a", "b", "a"])), ids(&["a", "b"]));
    }

    #[test]
    fn batching() {
        let all = ids(&["1", "2", "3", "4", "5"]);
        let sizes: Vec<usize> = batches(&all, 2).map(|b| b.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_eq!(batches(&all, 0).count(), 5);
    }
}
