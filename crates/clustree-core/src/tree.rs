//! The ClusTree index: a height-limited tree of decaying micro-clusters.
//!
//! Nodes live in an arena and are addressed by [`NodeId`]. Every node has
//! exactly three slots. An internal slot's `data` summarizes its child node;
//! a child node records the slot that owns it, so walking up is an index
//! lookup rather than a pointer chase.
//!
//! Insertion comes in two flavours selected by [`InsertionStrategy`]:
//!
//! - **Path-following**: descend along the nearest entry, updating every
//!   ancestor's summary on the way. Buffers left behind by earlier, budget-cut
//!   insertions are picked up and carried one level further. If the budget
//!   runs out mid-descent the point is parked in the current entry's buffer.
//! - **Breadth-first**: pick the leaf holding the globally nearest entry,
//!   insert there, then rebuild the summaries of every ancestor.
//!
//! A full node is handled, in order, by: using a free slot, overwriting an
//! irrelevant (decayed) entry, merging the two closest leaf entries when the
//! tree cannot grow, or a (2,2) split whose residual half moves one level up.

use std::collections::VecDeque;

use crate::budget::{Budget, SimpleBudget};
use crate::clustering::{Clustering, TargetLevel};
use crate::config::{ClusTreeConfig, InsertionStrategy};
use crate::entry::Entry;
use crate::error::{ClusTreeError, Result};
use crate::kernel::Kernel;
use crate::node::{EntryRef, Node, NodeId};

/// The three ways to split four entries into two pairs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SplitPairing {
    /// 01 | 23
    Adjacent,
    /// 02 | 13
    Alternating,
    /// 03 | 12
    Nested,
}

impl SplitPairing {
    /// Pairing with the smallest summed intra-pair distance.
    pub fn select(distance: impl Fn(usize, usize) -> f64) -> Self {
        let adjacent = distance(0, 1) + distance(2, 3);
        let alternating = distance(0, 2) + distance(1, 3);
        let nested = distance(0, 3) + distance(1, 2);

        if adjacent < alternating {
            if adjacent < nested {
                Self::Adjacent
            } else {
                Self::Nested
            }
        } else if alternating < nested {
            Self::Alternating
        } else {
            Self::Nested
        }
    }

    /// (pair kept in the split node, pair moved to the residual node).
    /// Entry 0 always stays.
    pub fn groups(self) -> ([usize; 2], [usize; 2]) {
        match self {
            Self::Adjacent => ([0, 1], [2, 3]),
            Self::Alternating => ([0, 2], [1, 3]),
            Self::Nested => ([0, 3], [1, 2]),
        }
    }
}

pub struct ClusTree {
    config: ClusTreeConfig,
    decay_rate: f64,
    nodes: Vec<Node>,
    free_nodes: Vec<NodeId>,
    root: Option<NodeId>,
    dimensions: Option<usize>,
    height: usize,
    num_root_splits: usize,
    num_insertions: u64,
    timestamp: u64,
}

impl ClusTree {
    pub fn new(config: ClusTreeConfig) -> Result<Self> {
        config.validate()?;
        let decay_rate = config.decay_rate();
        Ok(Self {
            config,
            decay_rate,
            nodes: Vec::new(),
            free_nodes: Vec::new(),
            root: None,
            dimensions: None,
            height: 0,
            num_root_splits: 0,
            num_insertions: 0,
            timestamp: 0,
        })
    }

    pub fn config(&self) -> &ClusTreeConfig {
        &self.config
    }

    pub fn decay_rate(&self) -> f64 {
        self.decay_rate
    }

    /// Fixed by the first inserted point.
    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn num_root_splits(&self) -> usize {
        self.num_root_splits
    }

    pub fn num_insertions(&self) -> u64 {
        self.num_insertions
    }

    /// Latest time seen by `insert` or `train`.
    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn root(&self) -> Option<NodeId> {
        self.root
    }

    pub fn node(&self, id: NodeId) -> &Node {
        &self.nodes[id.0]
    }

    /// Number of nodes reachable from the root.
    pub fn node_count(&self) -> usize {
        self.reachable_nodes().len()
    }

    /// Occupied entries across all leaf nodes.
    pub fn leaf_entry_count(&self) -> usize {
        self.reachable_nodes()
            .into_iter()
            .map(|id| self.node(id))
            .filter(|n| n.is_leaf())
            .map(Node::occupied)
            .sum()
    }

    // --- Insertion ---

    /// Insert a point at `timestamp` with a fresh budget of `config.budget`.
    pub fn insert(&mut self, point: &[f64], timestamp: u64) -> Result<()> {
        let mut budget = SimpleBudget::new(self.config.budget);
        self.insert_with_budget(point, timestamp, &mut budget)
    }

    /// Advance the internal clock by one and insert there.
    pub fn train(&mut self, point: &[f64]) -> Result<()> {
        let next = self.timestamp + 1;
        self.insert(point, next)
    }

    pub fn insert_with_budget(
        &mut self,
        point: &[f64],
        timestamp: u64,
        budget: &mut impl Budget,
    ) -> Result<()> {
        self.validate_point(point)?;
        self.dimensions.get_or_insert(point.len());
        if self.root.is_none() {
            let root = self.alloc_node(0);
            self.root = Some(root);
        }
        self.timestamp = self.timestamp.max(timestamp);

        let kernel = Kernel::from_point(point);
        match self.config.strategy {
            InsertionStrategy::PathFollowing => self.insert_path_following(kernel, budget, timestamp),
            InsertionStrategy::BreadthFirst => self.insert_breadth_first(kernel, budget, timestamp),
        }

        self.num_insertions += 1;
        if self.num_insertions % self.config.cleanup_interval == 0 {
            self.clean_up();
        }
        Ok(())
    }

    fn validate_point(&self, point: &[f64]) -> Result<()> {
        if point.is_empty() {
            return Err(ClusTreeError::EmptyPoint);
        }
        if let Some(index) = point.iter().position(|x| !x.is_finite()) {
            return Err(ClusTreeError::NonFinite { index });
        }
        match self.dimensions {
            Some(expected) if expected != point.len() => Err(ClusTreeError::DimensionMismatch {
                expected,
                found: point.len(),
            }),
            _ => Ok(()),
        }
    }

    fn insert_path_following(&mut self, point: Kernel, budget: &mut impl Budget, now: u64) {
        let Some(root) = self.root else {
            return;
        };
        let mut carried = Kernel::empty(point.dimensions());
        if let Some(residual) = self.descend(&point, &mut carried, root, budget, now) {
            self.grow_root(residual, now);
        }
    }

    /// One level of path-following insertion. Returns an entry that must be
    /// placed in the parent node because this node split.
    fn descend(
        &mut self,
        point: &Kernel,
        carried: &mut Kernel,
        id: NodeId,
        budget: &mut impl Budget,
        now: u64,
    ) -> Option<Entry> {
        let ops = self.age_node(id, now);
        budget.spend(ops);

        let to_insert_here = if self.node(id).is_leaf() {
            Entry::from_kernel(point.clone(), now)
        } else {
            let rate = self.decay_rate;
            let node = &mut self.nodes[id.0];

            let best = node
                .nearest_entry(point)
                .expect("internal node has occupied entries");
            node.entry_mut(best).aggregate_cluster(point, now, rate);
            budget.spend(1);

            let best_buffer = if carried.is_empty() {
                None
            } else {
                let slot = node
                    .nearest_entry(carried)
                    .expect("internal node has occupied entries");
                node.entry_mut(slot).aggregate_cluster(carried, now, rate);
                budget.spend(1);
                Some(slot)
            };

            if !budget.has_more_time() {
                node.entry_mut(best).aggregate_to_buffer(point, now, rate);
                if let Some(slot) = best_buffer {
                    node.entry_mut(slot).aggregate_to_buffer(carried, now, rate);
                    carried.clear();
                }
                tracing::trace!("budget exhausted at node {}, point parked in buffer", id.0);
                return None;
            }

            // The carried buffer stays here if it would go down another path.
            if let Some(slot) = best_buffer
                && slot != best
            {
                node.entry_mut(slot).aggregate_to_buffer(carried, now, rate);
                carried.clear();
            }

            let taken = node.entry_mut(best).empty_buffer(now, rate);
            carried.add(&taken);

            let child = node
                .entry(best)
                .child()
                .expect("entries of an internal node have children");
            self.descend(point, carried, child, budget, now)?
        };

        self.insert_here(to_insert_here, id, carried, budget, now)
    }

    /// Place `new_entry` (and, at a leaf, the carried buffer) into node `id`.
    fn insert_here(
        &mut self,
        mut new_entry: Entry,
        id: NodeId,
        carried: &mut Kernel,
        budget: &mut impl Budget,
        now: u64,
    ) -> Option<Entry> {
        if !carried.is_empty() {
            debug_assert!(self.node(id).is_leaf(), "carried buffer reached an internal node");
            let buffer_entry = Entry::from_kernel(carried.clone(), now);
            carried.clear();
            self.place_carried_buffer(buffer_entry, &mut new_entry, id, now);
        }
        self.place(new_entry, id, budget, now)
    }

    /// Find room for a carried buffer in a leaf. With fewer than two free
    /// slots, do whichever of three merges is cheapest: buffer into its
    /// nearest entry, buffer into the new entry, or the two closest entries
    /// of the node together.
    fn place_carried_buffer(
        &mut self,
        buffer_entry: Entry,
        new_entry: &mut Entry,
        id: NodeId,
        now: u64,
    ) {
        let rate = self.decay_rate;
        let node = &mut self.nodes[id.0];
        if node.num_free_entries() >= 2 {
            self.place_entry(id, &buffer_entry, now);
            return;
        }

        let nearest = node
            .nearest_entry(buffer_entry.data())
            .expect("leaf with at most one free slot has entries");
        let to_nearest = node.entry(nearest).calc_distance_entry(&buffer_entry);
        let to_new = new_entry.calc_distance_entry(&buffer_entry);
        let best_merge = node.best_merge();
        let in_node = best_merge.map_or(f64::INFINITY, |b| b.distance);

        if to_nearest <= to_new && to_nearest <= in_node {
            node.entry_mut(nearest).aggregate_entry(&buffer_entry, now, rate);
        } else if to_new <= to_nearest && to_new <= in_node {
            new_entry.merge_with(&buffer_entry);
        } else if let Some(b) = best_merge {
            node.merge_entries(b.pos1, b.pos2);
            self.place_entry(id, &buffer_entry, now);
        }
    }

    /// Free slot, irrelevant slot, merge-without-split, or split.
    fn place(
        &mut self,
        new_entry: Entry,
        id: NodeId,
        budget: &mut impl Budget,
        now: u64,
    ) -> Option<Entry> {
        let node = self.node(id);
        if node.num_free_entries() > 0 {
            self.place_entry(id, &new_entry, now);
            return None;
        }
        if let Some(slot) = node.get_irrelevant_entry(self.config.weight_threshold) {
            self.overwrite_entry(EntryRef { node: id, slot }, &new_entry, now);
            return None;
        }
        if node.is_leaf() && (self.has_maximal_size() || !budget.has_more_time()) {
            self.merge_entry_without_split(id, &new_entry, now);
            return None;
        }
        Some(self.split(new_entry, id, now))
    }

    fn insert_breadth_first(&mut self, point: Kernel, budget: &mut impl Budget, now: u64) {
        let leaf = self.find_best_leaf_node(&point);
        let ops = self.age_node(leaf, now);
        budget.spend(ops);

        let new_entry = Entry::from_kernel(point, now);
        let node = self.node(leaf);
        if node.num_free_entries() > 0 {
            self.place_entry(leaf, &new_entry, now);
        } else if let Some(slot) = node.get_irrelevant_entry(self.config.weight_threshold) {
            self.overwrite_entry(EntryRef { node: leaf, slot }, &new_entry, now);
        } else if self.exists_outdated_entry_on_path(leaf, now, budget) || !self.has_maximal_size()
        {
            self.insert_here_with_split(new_entry, leaf, now, budget);
        } else {
            self.merge_entry_without_split(leaf, &new_entry, now);
        }

        self.update_to_top(leaf, now);
    }

    /// Leaf whose nearest entry is globally closest to `point`.
    fn find_best_leaf_node(&self, point: &Kernel) -> NodeId {
        let mut best: Option<(NodeId, f64)> = None;
        for id in self.reachable_nodes() {
            let node = self.node(id);
            if !node.is_leaf() {
                continue;
            }
            let Some(slot) = node.nearest_entry(point) else {
                continue;
            };
            let distance = node.entry(slot).calc_distance(point);
            if best.is_none_or(|(_, min)| distance < min) {
                best = Some((id, distance));
            }
        }
        match (best, self.root) {
            (Some((id, _)), _) => id,
            (None, Some(root)) => root,
            (None, None) => unreachable!("insertion always creates a root first"),
        }
    }

    /// Whether some ancestor of `leaf` has a free or irrelevant slot that
    /// would absorb a split.
    fn exists_outdated_entry_on_path(
        &mut self,
        leaf: NodeId,
        now: u64,
        budget: &mut impl Budget,
    ) -> bool {
        let threshold = self.config.weight_threshold;
        if self.node(leaf).parent().is_none() {
            return self.node(leaf).get_irrelevant_entry(threshold).is_some();
        }

        let mut current = leaf;
        while let Some(parent) = self.node(current).parent() {
            current = parent.node;
            let ops = self.age_node(current, now);
            budget.spend(ops);
            self.refresh_node(current, now);

            let node = self.node(current);
            if node.num_free_entries() > 0 || node.get_irrelevant_entry(threshold).is_some() {
                return true;
            }
        }
        false
    }

    /// Insert at `id`, splitting upwards until some node has room.
    fn insert_here_with_split(
        &mut self,
        mut entry: Entry,
        mut id: NodeId,
        now: u64,
        budget: &mut impl Budget,
    ) {
        loop {
            let ops = self.age_node(id, now);
            budget.spend(ops);

            let node = self.node(id);
            if node.num_free_entries() > 0 {
                self.place_entry(id, &entry, now);
                return;
            }
            if let Some(slot) = node.get_irrelevant_entry(self.config.weight_threshold) {
                self.overwrite_entry(EntryRef { node: id, slot }, &entry, now);
                return;
            }

            let residual = self.split(entry, id, now);
            match self.node(id).parent() {
                Some(parent) => {
                    id = parent.node;
                    entry = residual;
                }
                None => {
                    self.grow_root(residual, now);
                    return;
                }
            }
        }
    }

    /// Rebuild every ancestor summary from `leaf` to the root.
    fn update_to_top(&mut self, leaf: NodeId, now: u64) {
        let mut current = leaf;
        while let Some(parent) = self.node(current).parent() {
            self.refresh_node(parent.node, now);
            current = parent.node;
        }
    }

    /// Recompute every entry of `id` from its child node.
    fn refresh_node(&mut self, id: NodeId, now: u64) {
        for slot in 0..self.node(id).occupied() {
            self.recalculate_entry(EntryRef { node: id, slot }, now);
        }
    }

    /// Recompute the owning entry of `id` and of each of its ancestors.
    fn refresh_ancestors(&mut self, id: NodeId, now: u64) {
        let mut current = id;
        while let Some(parent) = self.node(current).parent() {
            self.recalculate_entry(parent, now);
            current = parent.node;
        }
    }

    /// Fold `new_entry` into the nearest entry of a full leaf, or merge the
    /// two closest entries to make room for it, whichever is closer.
    fn merge_entry_without_split(&mut self, id: NodeId, new_entry: &Entry, now: u64) {
        let rate = self.decay_rate;
        let node = &mut self.nodes[id.0];
        let nearest = node
            .nearest_entry(new_entry.data())
            .expect("merge target node has entries");
        let distance = node.entry(nearest).calc_distance_entry(new_entry);

        match node.best_merge() {
            Some(b) if b.distance <= distance => {
                node.merge_entries(b.pos1, b.pos2);
                self.place_entry(id, new_entry, now);
            }
            _ => node.entry_mut(nearest).aggregate_entry(new_entry, now, rate),
        }
        tracing::trace!("merged without split at node {}", id.0);
    }

    fn has_maximal_size(&self) -> bool {
        self.height >= self.config.max_height
    }

    // --- Structure ---

    /// (2,2) split of the full node `id` plus `new_entry`. One pair stays in
    /// `id`, the other goes to a fresh node whose entry is returned for
    /// insertion one level up.
    fn split(&mut self, new_entry: Entry, id: NodeId, now: u64) -> Entry {
        debug_assert_eq!(self.node(id).num_free_entries(), 0, "split of a non-full node");
        let dimensions = new_entry.data().dimensions();
        let level = self.node(id).level();

        let [e0, e1, e2] = self.nodes[id.0].take_entries(dimensions);
        let all = [e0, e1, e2, new_entry];
        let pairing = SplitPairing::select(|a, b| all[a].calc_distance_entry(&all[b]));
        let (keep, moved) = pairing.groups();

        for i in keep {
            self.place_entry(id, &all[i], now);
        }
        let residual = self.alloc_node(level);
        for i in moved {
            self.place_entry(residual, &all[i], now);
        }

        if let Some(parent) = self.node(id).parent() {
            self.recalculate_entry(parent, now);
        }
        Entry::with_child(self.node(residual).summary(dimensions), residual, now)
    }

    /// New root holding the old root and `residual`.
    fn grow_root(&mut self, residual: Entry, now: u64) {
        let Some(old_root) = self.root else {
            return;
        };
        let dimensions = residual.data().dimensions();
        let level = self.node(old_root).level() + 1;
        let new_root = self.alloc_node(level);

        let old_root_entry =
            Entry::with_child(self.node(old_root).summary(dimensions), old_root, now);
        self.place_entry(new_root, &old_root_entry, now);
        self.place_entry(new_root, &residual, now);

        self.root = Some(new_root);
        self.num_root_splits += 1;
        if self.height < self.config.max_height {
            self.height += 1;
        }
        tracing::debug!(
            "root split #{}, height now {}",
            self.num_root_splits,
            self.height
        );
    }

    /// Every `cleanup_interval` insertions, cut all links below max height.
    fn clean_up(&mut self) {
        let Some(root) = self.root else {
            return;
        };
        let max_height = self.config.max_height;
        let mut released = 0;
        let mut stack = vec![(root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            for slot in 0..self.node(id).occupied() {
                if depth >= max_height {
                    if let Some(child) = self.nodes[id.0].entry_mut(slot).detach_child() {
                        released += self.release_subtree(child);
                    }
                } else if let Some(child) = self.node(id).entry(slot).child() {
                    stack.push((child, depth + 1));
                }
            }
        }
        tracing::debug!(
            "cleanup after {} insertions released {released} nodes",
            self.num_insertions
        );
    }

    fn alloc_node(&mut self, level: usize) -> NodeId {
        let dimensions = self.dimensions.unwrap_or_default();
        match self.free_nodes.pop() {
            Some(id) => {
                self.nodes[id.0] = Node::new(dimensions, level);
                id
            }
            None => {
                self.nodes.push(Node::new(dimensions, level));
                NodeId(self.nodes.len() - 1)
            }
        }
    }

    /// Return a detached subtree to the free list. Returns the node count.
    fn release_subtree(&mut self, id: NodeId) -> usize {
        let mut stack = vec![id];
        let mut released = 0;
        while let Some(current) = stack.pop() {
            let node = &mut self.nodes[current.0];
            for slot in 0..node.occupied() {
                if let Some(child) = node.entry_mut(slot).clear() {
                    stack.push(child);
                }
            }
            node.set_parent(None);
            self.free_nodes.push(current);
            released += 1;
        }
        released
    }

    /// Initialize the first free slot of `id` from `entry`.
    fn place_entry(&mut self, id: NodeId, entry: &Entry, now: u64) {
        let slot = self.nodes[id.0].add_entry(entry, now);
        self.adopt(EntryRef { node: id, slot });
    }

    /// Recycle an irrelevant slot. The evicted mass is also removed from
    /// every ancestor summary.
    fn overwrite_entry(&mut self, at: EntryRef, entry: &Entry, now: u64) {
        let dropped = self.nodes[at.node.0]
            .entry_mut(at.slot)
            .overwrite_old_entry(entry);
        if let Some(child) = dropped
            && Some(child) != entry.child()
        {
            self.release_subtree(child);
        }
        self.adopt(at);
        self.refresh_ancestors(at.node, now);
    }

    /// Point the child of the entry at `at` back at it.
    fn adopt(&mut self, at: EntryRef) {
        if let Some(child) = self.node(at.node).entry(at.slot).child() {
            self.nodes[child.0].set_parent(Some(at));
        }
    }

    /// Age the entry at `at` and its child node to `now`, then rebuild the
    /// entry's data from the child.
    fn recalculate_entry(&mut self, at: EntryRef, now: u64) {
        let Some(child) = self.node(at.node).entry(at.slot).child() else {
            return;
        };
        self.age_node(child, now);
        let children = self.node(child).entries().to_vec();
        let rate = self.decay_rate;
        let entry = self.nodes[at.node.0].entry_mut(at.slot);
        entry.make_older(now, rate);
        entry.recalculate_data(&children);
        entry.set_timestamp(now);
    }

    /// Age all occupied entries of `id`. Returns the operations spent.
    fn age_node(&mut self, id: NodeId, now: u64) -> u64 {
        let node = &mut self.nodes[id.0];
        node.make_older(now, self.decay_rate);
        node.occupied() as u64
    }

    fn reachable_nodes(&self) -> Vec<NodeId> {
        let mut out = Vec::new();
        let Some(root) = self.root else {
            return out;
        };
        let mut stack = vec![root];
        while let Some(id) = stack.pop() {
            out.push(id);
            stack.extend(self.node(id).entries().iter().filter_map(Entry::child));
        }
        out
    }

    // --- Query ---

    /// Leaf-level clustering at the latest inserted time.
    pub fn micro_clustering(&mut self) -> Clustering {
        self.get_clustering(self.timestamp, TargetLevel::Leaves)
    }

    /// Breadth-first read of the tree at `at`. Entries are aged to `at`;
    /// irrelevant ones are neither emitted nor descended into.
    pub fn get_clustering(&mut self, at: u64, target: TargetLevel) -> Clustering {
        let Some(root) = self.root else {
            return Clustering::default();
        };
        let threshold = self.config.weight_threshold;
        let max_height = self.config.max_height;
        let mut kernels = Vec::new();
        let mut queue = VecDeque::from([root]);

        while let Some(id) = queue.pop_front() {
            let rate = self.decay_rate;
            let depth = self.node(id).depth(self.num_root_splits);
            let node = &mut self.nodes[id.0];
            let node_is_leaf = node.is_leaf();
            let at_leaf_level = (node_is_leaf && depth <= max_height) || depth == max_height;
            let emit = match target {
                TargetLevel::Depth(d) => depth == d,
                TargetLevel::Leaves => at_leaf_level,
            };
            if !emit && node_is_leaf {
                continue;
            }

            for slot in 0..node.occupied() {
                let entry = node.entry_mut(slot);
                entry.make_older(at, rate);
                if entry.is_irrelevant(threshold) {
                    continue;
                }
                if emit {
                    kernels.push(entry.data().clone());
                } else if let Some(child) = entry.child() {
                    queue.push_back(child);
                }
            }
        }

        Clustering::new(kernels)
    }

    // --- Diagnostics ---

    /// Verify the structural invariants of the whole tree.
    pub fn check_invariants(&self) -> std::result::Result<(), String> {
        let Some(root) = self.root else {
            return Ok(());
        };
        if self.node(root).parent().is_some() {
            return Err("root has a parent link".into());
        }
        if self.node(root).level() != self.num_root_splits {
            return Err(format!(
                "root level {} != root splits {}",
                self.node(root).level(),
                self.num_root_splits
            ));
        }

        let mut leaf_depth: Option<usize> = None;
        let mut stack = vec![(root, 0usize)];
        while let Some((id, depth)) = stack.pop() {
            let node = self.node(id);
            if node.depth(self.num_root_splits) != depth {
                return Err(format!("node {} has wrong level for depth {depth}", id.0));
            }
            let occupied = node.occupied();
            if node.entries()[occupied..].iter().any(|e| !e.is_empty()) {
                return Err(format!("node {} has a gap between entries", id.0));
            }
            let with_child = node.entries().iter().filter(|e| e.child().is_some()).count();
            if with_child != 0 && with_child != occupied {
                return Err(format!("node {} mixes leaf and internal entries", id.0));
            }

            if node.is_leaf() {
                match leaf_depth {
                    None => leaf_depth = Some(depth),
                    Some(d) if d != depth => {
                        return Err(format!("leaves at depths {d} and {depth}"));
                    }
                    _ => {}
                }
                continue;
            }

            for (slot, entry) in node.entries().iter().enumerate() {
                let Some(child) = entry.child() else {
                    continue;
                };
                if self.node(child).parent() != Some(EntryRef { node: id, slot }) {
                    return Err(format!("child {} does not point back at its entry", child.0));
                }
                if self.node(child).occupied() == 0 {
                    return Err(format!("internal entry points at empty node {}", child.0));
                }
                if !self.summarizes(entry, self.node(child)) {
                    return Err(format!(
                        "entry {slot} of node {} does not match child {}",
                        id.0, child.0
                    ));
                }
                stack.push((child, depth + 1));
            }
        }
        if leaf_depth.unwrap_or(0) > self.config.max_height {
            return Err("tree deeper than max height".into());
        }
        Ok(())
    }

    /// Whether `entry.data` equals its buffer plus the data of `child`, once
    /// everything is aged to a common time.
    fn summarizes(&self, entry: &Entry, child: &Node) -> bool {
        let rate = self.decay_rate;
        let children = &child.entries()[..child.occupied()];
        let at = children
            .iter()
            .map(Entry::timestamp)
            .fold(entry.timestamp(), u64::max);
        let aged = |kernel: &Kernel, since: u64| {
            let mut kernel = kernel.clone();
            kernel.make_older(at - since, rate);
            kernel
        };

        let actual = aged(entry.data(), entry.timestamp());
        let mut expected = aged(entry.buffer(), entry.timestamp());
        for c in children {
            expected.add(&aged(c.data(), c.timestamp()));
        }

        let close = |a: f64, b: f64| (a - b).abs() <= 1e-9 + 1e-6 * a.abs().max(b.abs());
        close(actual.weight(), expected.weight())
            && actual
                .linear_sum()
                .iter()
                .zip(expected.linear_sum())
                .all(|(a, b)| close(*a, *b))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::budget::UnlimitedBudget;
    use approx::assert_relative_eq;

    fn no_decay(max_height: usize) -> ClusTreeConfig {
        ClusTreeConfig {
            max_height,
            decay_rate: Some(0.0),
            ..Default::default()
        }
    }

    fn tree(config: ClusTreeConfig) -> ClusTree {
        ClusTree::new(config).unwrap()
    }

    fn line_points(n: usize) -> Vec<Vec<f64>> {
        (0..n).map(|i| vec![i as f64 * 3.0, (i % 5) as f64]).collect()
    }

    fn leaf_weight(t: &mut ClusTree) -> f64 {
        let at = t.timestamp();
        t.get_clustering(at, TargetLevel::Leaves).total_weight()
    }

    #[test]
    fn test_split_pairing_prefers_close_pairs() {
        let d = |a: usize, b: usize| match (a.min(b), a.max(b)) {
            (0, 1) | (2, 3) => 1.0,
            _ => 100.0,
        };
        assert_eq!(SplitPairing::select(d), SplitPairing::Adjacent);
    }

    #[test]
    fn test_split_pairing_other_groupings() {
        let alternating = |a: usize, b: usize| match (a.min(b), a.max(b)) {
            (0, 2) | (1, 3) => 1.0,
            _ => 100.0,
        };
        assert_eq!(SplitPairing::select(alternating), SplitPairing::Alternating);

        let nested = |a: usize, b: usize| match (a.min(b), a.max(b)) {
            (0, 3) | (1, 2) => 1.0,
            _ => 100.0,
        };
        assert_eq!(SplitPairing::select(nested), SplitPairing::Nested);
        assert_eq!(SplitPairing::Nested.groups(), ([0, 3], [1, 2]));
    }

    #[test]
    fn test_first_insert_fixes_dimensions() {
        let mut t = tree(ClusTreeConfig::default());
        assert_eq!(t.dimensions(), None);
        t.insert(&[1.0, 2.0, 3.0], 1).unwrap();
        assert_eq!(t.dimensions(), Some(3));
        assert_eq!(t.node_count(), 1);
    }

    #[test]
    fn test_dimension_mismatch_rejected() {
        let mut t = tree(ClusTreeConfig::default());
        t.insert(&[1.0, 2.0], 1).unwrap();
        let err = t.insert(&[1.0, 2.0, 3.0], 2).unwrap_err();
        assert_eq!(
            err,
            ClusTreeError::DimensionMismatch {
                expected: 2,
                found: 3
            }
        );
        assert_eq!(t.num_insertions(), 1);
        assert_eq!(t.leaf_entry_count(), 1);
    }

    #[test]
    fn test_bad_points_rejected() {
        let mut t = tree(ClusTreeConfig::default());
        assert_eq!(t.insert(&[], 1), Err(ClusTreeError::EmptyPoint));
        assert_eq!(
            t.insert(&[0.0, f64::NAN], 1),
            Err(ClusTreeError::NonFinite { index: 1 })
        );
        assert!(t.root().is_none());
    }

    #[test]
    fn test_fourth_point_splits_root() {
        let mut t = tree(no_decay(8));
        for (i, p) in [[0.0, 0.0], [0.1, 0.0], [10.0, 10.0], [10.1, 10.0]]
            .iter()
            .enumerate()
        {
            t.insert(p, i as u64 + 1).unwrap();
        }
        assert_eq!(t.height(), 1);
        assert_eq!(t.num_root_splits(), 1);
        assert_eq!(t.node_count(), 3);
        t.check_invariants().unwrap();

        // Close pairs end up together
        let mut top = t.get_clustering(4, TargetLevel::Depth(0)).into_kernels();
        top.sort_by(|a, b| a.center()[0].total_cmp(&b.center()[0]));
        assert_eq!(top.len(), 2);
        assert_relative_eq!(top[0].center()[0], 0.05, epsilon = 1e-12);
        assert_relative_eq!(top[1].center()[0], 10.05, epsilon = 1e-12);
    }

    #[test]
    fn test_weight_conserved_without_decay() {
        let mut t = tree(no_decay(8));
        for (i, p) in line_points(200).iter().enumerate() {
            t.insert(p, i as u64 + 1).unwrap();
        }
        assert_relative_eq!(leaf_weight(&mut t), 200.0, epsilon = 1e-9);
        t.check_invariants().unwrap();
    }

    #[test]
    fn test_root_summary_matches_leaves() {
        let mut t = tree(no_decay(8));
        for (i, p) in line_points(50).iter().enumerate() {
            t.insert(p, i as u64 + 1).unwrap();
        }
        let top = t.get_clustering(50, TargetLevel::Depth(0)).total_weight();
        assert_relative_eq!(top, 50.0, epsilon = 1e-9);
    }

    #[test]
    fn test_max_height_zero_stays_single_node() {
        let mut t = tree(no_decay(0));
        for (i, p) in line_points(100).iter().enumerate() {
            t.insert(p, i as u64 + 1).unwrap();
        }
        assert_eq!(t.node_count(), 1);
        assert_eq!(t.height(), 0);
        assert_eq!(t.leaf_entry_count(), 3);
        assert_relative_eq!(leaf_weight(&mut t), 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_height_never_exceeds_max() {
        let mut t = tree(no_decay(2));
        for (i, p) in line_points(300).iter().enumerate() {
            t.insert(p, i as u64 + 1).unwrap();
        }
        assert_eq!(t.height(), 2);
        t.check_invariants().unwrap();
        assert!(t.leaf_entry_count() <= 27);
    }

    #[test]
    fn test_zero_budget_never_grows() {
        let mut t = tree(no_decay(8));
        for (i, p) in line_points(40).iter().enumerate() {
            t.insert_with_budget(p, i as u64 + 1, &mut SimpleBudget::new(0))
                .unwrap();
        }
        assert_eq!(t.node_count(), 1);
        assert_relative_eq!(leaf_weight(&mut t), 40.0, epsilon = 1e-9);
    }

    #[test]
    fn test_exhausted_budget_parks_point_in_buffer() {
        let mut t = tree(no_decay(8));
        for (i, p) in [[0.0, 0.0], [0.1, 0.0], [10.0, 10.0], [10.1, 10.0]]
            .iter()
            .enumerate()
        {
            t.insert(p, i as u64 + 1).unwrap();
        }
        // Root aging costs 2 ops, the aggregation 1 more.
        t.insert_with_budget(&[0.05, 0.0], 5, &mut SimpleBudget::new(3))
            .unwrap();

        assert_relative_eq!(leaf_weight(&mut t), 4.0, epsilon = 1e-9);
        let top = t.get_clustering(5, TargetLevel::Depth(0)).total_weight();
        assert_relative_eq!(top, 5.0, epsilon = 1e-9);

        let root = t.root().unwrap();
        let buffered: f64 = t
            .node(root)
            .entries()
            .iter()
            .map(|e| e.buffer().weight())
            .sum();
        assert_relative_eq!(buffered, 1.0);

        // The next insertion down the same path carries the buffer to the leaf.
        t.insert_with_budget(&[0.02, 0.0], 6, &mut UnlimitedBudget)
            .unwrap();
        assert_relative_eq!(leaf_weight(&mut t), 6.0, epsilon = 1e-9);
        let buffered: f64 = t
            .node(root)
            .entries()
            .iter()
            .map(|e| e.buffer().weight())
            .sum();
        assert_eq!(buffered, 0.0);
        t.check_invariants().unwrap();
    }

    #[test]
    fn test_query_is_idempotent() {
        let mut t = tree(ClusTreeConfig::default());
        for (i, p) in line_points(120).iter().enumerate() {
            t.insert(p, i as u64 + 1).unwrap();
        }
        let a = t.get_clustering(200, TargetLevel::Leaves);
        let b = t.get_clustering(200, TargetLevel::Leaves);
        assert_eq!(a.kernels(), b.kernels());
    }

    #[test]
    fn test_decayed_entries_are_pruned() {
        let config = ClusTreeConfig {
            horizon: 10,
            ..Default::default()
        };
        let mut t = tree(config);
        t.insert(&[0.0, 0.0], 1).unwrap();
        t.insert(&[50.0, 50.0], 100).unwrap();

        let c = t.get_clustering(100, TargetLevel::Leaves);
        assert_eq!(c.len(), 1);
        assert_eq!(c.kernels()[0].center(), vec![50.0, 50.0]);
        assert!(t.get_clustering(1000, TargetLevel::Leaves).is_empty());
    }

    /// Two leaves under one root, all filled at t=1: the left leaf holds
    /// points near x=0, the right one points near x=100.
    fn two_leaf_tree(horizon: u64) -> (ClusTree, NodeId) {
        let config = ClusTreeConfig {
            horizon,
            ..Default::default()
        };
        let mut t = tree(config);
        for p in [[0.0, 0.0], [0.1, 0.0], [100.0, 100.0], [100.1, 100.0]] {
            t.insert(&p, 1).unwrap();
        }
        assert_eq!(t.height(), 1);
        let root = t.node(t.root().unwrap());
        let left = root
            .entries()
            .iter()
            .find(|e| !e.is_empty() && e.data().center()[0] < 50.0)
            .and_then(Entry::child)
            .unwrap();
        (t, left)
    }

    #[test]
    fn test_irrelevant_subtree_is_not_visited() {
        let (mut t, left) = two_leaf_tree(10);
        t.insert(&[100.2, 100.0], 60).unwrap();

        // Only the fresh point survives; its decayed neighbours are hidden too.
        let c = t.get_clustering(60, TargetLevel::Leaves);
        assert_eq!(c.len(), 1);
        assert!(c.iter().all(|k| k.center()[0] > 50.0));

        // The stale leaf was neither emitted nor aged.
        let stale = t.node(left);
        assert_eq!(stale.occupied(), 2);
        for e in &stale.entries()[..2] {
            assert_eq!(e.timestamp(), 1);
            assert_eq!(e.data().weight(), 1.0);
        }
        t.check_invariants().unwrap();
    }

    #[test]
    fn test_overwrite_removes_evicted_mass_from_ancestors() {
        let (mut t, left) = two_leaf_tree(10);
        t.insert(&[0.2, 0.0], 1).unwrap();
        assert_eq!(t.node(left).num_free_entries(), 0);

        // Every entry of the full left leaf is irrelevant by t=60.
        t.insert(&[0.05, 0.0], 60).unwrap();

        let leaf = t.node(left);
        let leaf_weight: f64 = leaf.entries().iter().map(|e| e.data().weight()).sum();
        let owner = leaf.parent().unwrap();
        let owner_weight = t.node(owner.node).entry(owner.slot).data().weight();
        assert_relative_eq!(owner_weight, leaf_weight, epsilon = 1e-12);
        assert!(leaf_weight > 1.0);
        t.check_invariants().unwrap();
    }

    #[test]
    fn test_irrelevant_entry_is_overwritten() {
        let config = ClusTreeConfig {
            horizon: 10,
            max_height: 0,
            ..Default::default()
        };
        let mut t = tree(config);
        t.insert(&[0.0, 0.0], 1).unwrap();
        t.insert(&[5.0, 5.0], 50).unwrap();
        t.insert(&[9.0, 9.0], 50).unwrap();
        // Full node; the entry from t=1 is irrelevant by t=50.
        t.insert(&[20.0, 20.0], 50).unwrap();

        let mut centers: Vec<f64> = t
            .get_clustering(50, TargetLevel::Leaves)
            .iter()
            .map(|k| k.center()[0])
            .collect();
        centers.sort_by(f64::total_cmp);
        assert_eq!(centers, vec![5.0, 9.0, 20.0]);
    }

    #[test]
    fn test_breadth_first_conserves_weight() {
        let config = ClusTreeConfig {
            strategy: InsertionStrategy::BreadthFirst,
            ..no_decay(8)
        };
        let mut t = tree(config);
        for (i, p) in line_points(150).iter().enumerate() {
            t.insert(p, i as u64 + 1).unwrap();
        }
        assert_relative_eq!(leaf_weight(&mut t), 150.0, epsilon = 1e-9);
        let top = t.get_clustering(150, TargetLevel::Depth(0)).total_weight();
        assert_relative_eq!(top, 150.0, epsilon = 1e-9);
        t.check_invariants().unwrap();
    }

    #[test]
    fn test_breadth_first_respects_max_height() {
        let config = ClusTreeConfig {
            strategy: InsertionStrategy::BreadthFirst,
            ..no_decay(1)
        };
        let mut t = tree(config);
        for (i, p) in line_points(60).iter().enumerate() {
            t.insert(p, i as u64 + 1).unwrap();
        }
        assert!(t.height() <= 1);
        t.check_invariants().unwrap();
        assert_relative_eq!(leaf_weight(&mut t), 60.0, epsilon = 1e-9);
    }

    #[test]
    fn test_cleanup_runs_on_interval() {
        let config = ClusTreeConfig {
            cleanup_interval: 25,
            ..no_decay(3)
        };
        let mut t = tree(config);
        for (i, p) in line_points(100).iter().enumerate() {
            t.insert(p, i as u64 + 1).unwrap();
        }
        assert_eq!(t.num_insertions(), 100);
        t.check_invariants().unwrap();
        assert_relative_eq!(leaf_weight(&mut t), 100.0, epsilon = 1e-9);
    }

    #[test]
    fn test_train_advances_clock() {
        let mut t = tree(ClusTreeConfig::default());
        t.train(&[1.0]).unwrap();
        t.train(&[2.0]).unwrap();
        assert_eq!(t.timestamp(), 2);
        assert_eq!(t.micro_clustering().len(), 2);
    }

    #[test]
    fn test_empty_tree_query() {
        let mut t = tree(ClusTreeConfig::default());
        assert!(t.get_clustering(10, TargetLevel::Leaves).is_empty());
        t.check_invariants().unwrap();
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = ClusTreeConfig {
            weight_threshold: 0.0,
            ..Default::default()
        };
        assert!(ClusTree::new(config).is_err());
    }
}
