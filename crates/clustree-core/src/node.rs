use serde::{Deserialize, Serialize};

use crate::constants::NUMBER_ENTRIES;
use crate::entry::Entry;
use crate::kernel::Kernel;

/// Handle of a node in the tree's arena.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeId(pub(crate) usize);

impl NodeId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// Location of one entry: (node, slot).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EntryRef {
    pub node: NodeId,
    pub slot: usize,
}

/// Closest pair of occupied entries in a node. `pos1 < pos2`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BestMerge {
    pub pos1: usize,
    pub pos2: usize,
    pub distance: f64,
}

/// Fixed three-slot container; one level of the tree.
///
/// Occupied slots always form a prefix: entries are added to the first free
/// slot and merges shift later entries left.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Node {
    entries: [Entry; NUMBER_ENTRIES],
    /// Raw level. Leaves created before any root split have level 0; each new
    /// root sits one above the old one. Depth = root splits - level.
    level: usize,
    parent: Option<EntryRef>,
}

impl Node {
    pub fn new(dimensions: usize, level: usize) -> Self {
        Self {
            entries: std::array::from_fn(|_| Entry::empty(dimensions)),
            level,
            parent: None,
        }
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entry(&self, slot: usize) -> &Entry {
        &self.entries[slot]
    }

    pub fn entry_mut(&mut self, slot: usize) -> &mut Entry {
        &mut self.entries[slot]
    }

    pub fn level(&self) -> usize {
        self.level
    }

    /// Depth below the root given how often the root has split.
    pub fn depth(&self, num_root_splits: usize) -> usize {
        num_root_splits.saturating_sub(self.level)
    }

    /// The entry one level up whose child is this node. `None` for the root.
    pub fn parent(&self) -> Option<EntryRef> {
        self.parent
    }

    pub fn set_parent(&mut self, parent: Option<EntryRef>) {
        self.parent = parent;
    }

    pub fn is_leaf(&self) -> bool {
        self.entries.iter().all(|e| e.child().is_none())
    }

    /// Number of used slots.
    pub fn occupied(&self) -> usize {
        self.entries.iter().take_while(|e| !e.is_empty()).count()
    }

    pub fn num_free_entries(&self) -> usize {
        self.entries.iter().filter(|e| e.is_empty()).count()
    }

    /// Slot whose center is closest to `kernel`. First seen wins on ties.
    pub fn nearest_entry(&self, kernel: &Kernel) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for (i, entry) in self.entries.iter().enumerate() {
            if entry.is_empty() {
                break;
            }
            let distance = entry.calc_distance(kernel);
            match best {
                Some((_, min)) if distance >= min => {}
                _ => best = Some((i, distance)),
            }
        }
        best.map(|(i, _)| i)
    }

    /// First occupied slot lighter than `threshold`.
    pub fn get_irrelevant_entry(&self, threshold: f64) -> Option<usize> {
        self.entries
            .iter()
            .take_while(|e| !e.is_empty())
            .position(|e| e.is_irrelevant(threshold))
    }

    /// Copy `new_entry` into the first free slot and return the slot.
    pub fn add_entry(&mut self, new_entry: &Entry, now: u64) -> usize {
        let slot = self
            .entries
            .iter()
            .position(|e| e.is_empty())
            .expect("entry added to a node which is already full");
        self.entries[slot].initialize_from(new_entry, now);
        slot
    }

    /// Merge slot `pos2` into `pos1`, shift later slots left and empty the
    /// trailing slot. Only valid on leaf entries.
    pub fn merge_entries(&mut self, pos1: usize, pos2: usize) {
        debug_assert!(pos1 < pos2, "merge_entries requires pos1 < pos2");
        let (head, tail) = self.entries.split_at_mut(pos2);
        head[pos1].merge_with(&tail[0]);

        self.entries[pos2..].rotate_left(1);
        let dropped = self.entries[NUMBER_ENTRIES - 1].clear();
        debug_assert!(dropped.is_none(), "merged an internal entry");
    }

    /// Closest pair among the occupied slots.
    pub fn best_merge(&self) -> Option<BestMerge> {
        let occupied = self.occupied();
        let mut best: Option<BestMerge> = None;
        for i in 0..occupied {
            for j in (i + 1)..occupied {
                let distance = self.entries[i].calc_distance_entry(&self.entries[j]);
                if best.is_none_or(|b| distance < b.distance) {
                    best = Some(BestMerge {
                        pos1: i,
                        pos2: j,
                        distance,
                    });
                }
            }
        }
        best
    }

    /// Age every occupied entry to `now`.
    pub fn make_older(&mut self, now: u64, decay_rate: f64) {
        for entry in self.entries.iter_mut().take_while(|e| !e.is_empty()) {
            entry.make_older(now, decay_rate);
        }
    }

    /// Empty every slot and hand back the previous contents.
    pub fn take_entries(&mut self, dimensions: usize) -> [Entry; NUMBER_ENTRIES] {
        std::mem::replace(
            &mut self.entries,
            std::array::from_fn(|_| Entry::empty(dimensions)),
        )
    }

    /// Sum of all occupied entries' data.
    pub fn summary(&self, dimensions: usize) -> Kernel {
        let mut sum = Kernel::empty(dimensions);
        for entry in self.entries.iter().take_while(|e| !e.is_empty()) {
            sum.add(entry.data());
        }
        sum
    }
}
