use std::collections::HashMap;

use crate::molecule::MolId;
use crate::reply::ErasedReply;
use crate::value::{MolData, MolValue};
use std::sync::Arc;

/// Position of one value inside the bag: which emitter, and which slot of
/// that emitter's multiset. Only meaningful against the bag state it was
/// computed from; the scheduler resolves and consumes refs under the site
/// lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BagRef {
    pub(crate) mol: MolId,
    pub(crate) slot: usize,
}

/// Per-site multiset of pending molecule values.
///
/// Not a queue: slots are positional only for the duration of one matching
/// pass and removal may reorder them. All mutation happens under the owning
/// site's lock.
#[derive(Default)]
pub(crate) struct MolBag {
    contents: HashMap<MolId, Vec<MolValue>>,
}

impl MolBag {
    pub(crate) fn new() -> MolBag {
        MolBag::default()
    }

    pub(crate) fn add(&mut self, mol: MolId, value: MolValue) {
        self.contents.entry(mol).or_default().push(value);
    }

    pub(crate) fn count(&self, mol: MolId) -> usize {
        self.contents.get(&mol).map_or(0, |values| values.len())
    }

    pub(crate) fn count_value(&self, mol: MolId, value: &dyn MolData) -> usize {
        self.values(mol)
            .iter()
            .filter(|v| v.payload_eq(value))
            .count()
    }

    pub(crate) fn values(&self, mol: MolId) -> &[MolValue] {
        match self.contents.get(&mol) {
            Some(values) => values,
            None => &[],
        }
    }

    /// Removes one occurrence equal to `value`. Returns whether anything was
    /// removed.
    pub(crate) fn remove_one(&mut self, mol: MolId, value: &dyn MolData) -> bool {
        let Some(values) = self.contents.get_mut(&mol) else {
            return false;
        };
        let Some(pos) = values.iter().position(|v| v.payload_eq(value)) else {
            return false;
        };
        values.swap_remove(pos);
        if values.is_empty() {
            self.contents.remove(&mol);
        }
        true
    }

    /// Removes the blocking value carrying `slot`, if it is still present.
    /// Used when a blocking emission times out before being consumed.
    pub(crate) fn remove_by_reply_slot(&mut self, mol: MolId, slot: &Arc<dyn ErasedReply>) -> bool {
        let Some(values) = self.contents.get_mut(&mol) else {
            return false;
        };
        let Some(pos) = values.iter().position(|v| v.same_reply_slot(slot)) else {
            return false;
        };
        values.swap_remove(pos);
        if values.is_empty() {
            self.contents.remove(&mol);
        }
        true
    }

    /// Atomically removes a chosen assignment. `refs` is aligned with the
    /// reaction's input order; the returned values keep that order. Slots
    /// are resolved before any removal so that `swap_remove` cannot shift a
    /// ref out from under a later one.
    pub(crate) fn take(&mut self, refs: &[BagRef]) -> Vec<MolValue> {
        let values: Vec<MolValue> = refs
            .iter()
            .map(|r| self.contents[&r.mol][r.slot].clone())
            .collect();
        let mut by_mol: HashMap<MolId, Vec<usize>> = HashMap::new();
        for r in refs {
            by_mol.entry(r.mol).or_default().push(r.slot);
        }
        for (mol, mut slots) in by_mol {
            slots.sort_unstable_by(|a, b| b.cmp(a));
            let entries = self.contents.get_mut(&mol).expect("ref into empty bag");
            for slot in slots {
                entries.swap_remove(slot);
            }
            if entries.is_empty() {
                self.contents.remove(&mol);
            }
        }
        values
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.contents.is_empty()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = (MolId, &[MolValue])> {
        self.contents.iter().map(|(&mol, values)| (mol, &values[..]))
    }
}
