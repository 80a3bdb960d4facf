use serde::{Deserialize, Serialize};

use crate::kernel::Kernel;
use crate::node::NodeId;

/// One slot of a [`crate::node::Node`].
///
/// `data` summarizes everything below this slot; `buffer` holds mass that was
/// counted in `data` but not yet pushed down to `child`. An entry is unused
/// iff `data` is empty, and an unused entry always has an empty buffer.
/// The slot that owns a child node is recorded on the child
/// ([`crate::node::Node::parent`]), not here.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entry {
    data: Kernel,
    buffer: Kernel,
    child: Option<NodeId>,
    timestamp: u64,
}

impl Entry {
    pub fn empty(dimensions: usize) -> Self {
        Self {
            data: Kernel::empty(dimensions),
            buffer: Kernel::empty(dimensions),
            child: None,
            timestamp: 0,
        }
    }

    /// Detached leaf entry holding `kernel`, waiting to be placed in a node.
    pub fn from_kernel(kernel: Kernel, timestamp: u64) -> Self {
        let dimensions = kernel.dimensions();
        Self {
            data: kernel,
            buffer: Kernel::empty(dimensions),
            child: None,
            timestamp,
        }
    }

    /// Detached internal entry over `child`, whose summary is `data`.
    pub fn with_child(data: Kernel, child: NodeId, timestamp: u64) -> Self {
        let mut entry = Self::from_kernel(data, timestamp);
        entry.child = Some(child);
        entry
    }

    pub fn data(&self) -> &Kernel {
        &self.data
    }

    pub fn buffer(&self) -> &Kernel {
        &self.buffer
    }

    pub fn child(&self) -> Option<NodeId> {
        self.child
    }

    pub fn timestamp(&self) -> u64 {
        self.timestamp
    }

    pub fn is_empty(&self) -> bool {
        debug_assert!(
            !self.data.is_empty() || self.buffer.is_empty(),
            "unused entry with a non-empty buffer"
        );
        self.data.is_empty()
    }

    pub fn is_irrelevant(&self, threshold: f64) -> bool {
        self.data.weight() < threshold
    }

    pub fn calc_distance(&self, kernel: &Kernel) -> f64 {
        self.data.distance(kernel)
    }

    pub fn calc_distance_entry(&self, other: &Entry) -> f64 {
        self.data.distance(&other.data)
    }

    /// Age `data` and `buffer` to `now`.
    pub fn make_older(&mut self, now: u64, decay_rate: f64) {
        let dt = now.saturating_sub(self.timestamp);
        self.data.make_older(dt, decay_rate);
        self.buffer.make_older(dt, decay_rate);
        self.timestamp = self.timestamp.max(now);
    }

    /// Age `data` to `now` and fold `kernel` into it.
    pub fn aggregate_cluster(&mut self, kernel: &Kernel, now: u64, decay_rate: f64) {
        let dt = now.saturating_sub(self.timestamp);
        self.data.aggregate(kernel, dt, decay_rate);
        self.timestamp = self.timestamp.max(now);
    }

    /// Age `buffer` to `now` and fold `kernel` into it.
    pub fn aggregate_to_buffer(&mut self, kernel: &Kernel, now: u64, decay_rate: f64) {
        let dt = now.saturating_sub(self.timestamp);
        self.buffer.aggregate(kernel, dt, decay_rate);
        self.timestamp = self.timestamp.max(now);
    }

    pub fn aggregate_entry(&mut self, other: &Entry, now: u64, decay_rate: f64) {
        self.aggregate_cluster(&other.data, now, decay_rate);
    }

    /// Age the buffer to `now`, detach and return it.
    pub fn empty_buffer(&mut self, now: u64, decay_rate: f64) -> Kernel {
        let dt = now.saturating_sub(self.timestamp);
        self.buffer.make_older(dt, decay_rate);
        let taken = self.buffer.clone();
        self.buffer.clear();
        taken
    }

    /// Fold another leaf entry into this one, keeping the later timestamp.
    pub fn merge_with(&mut self, other: &Entry) {
        debug_assert!(self.child.is_none() && other.child.is_none());
        self.data.add(&other.data);
        self.buffer.add(&other.buffer);
        self.timestamp = self.timestamp.max(other.timestamp);
    }

    /// Fill an unused slot with `other`'s state.
    pub fn initialize_from(&mut self, other: &Entry, now: u64) {
        debug_assert!(self.is_empty(), "initializing a used entry");
        self.data.add(&other.data);
        self.buffer.add(&other.buffer);
        self.child = other.child;
        self.timestamp = now;
    }

    /// Forget this slot's state and take `other`'s instead. Returns the child
    /// that was dropped, if any, so its subtree can be released.
    pub fn overwrite_old_entry(&mut self, other: &Entry) -> Option<NodeId> {
        self.data.overwrite_with(&other.data);
        self.buffer.overwrite_with(&other.buffer);
        self.timestamp = self.timestamp.max(other.timestamp);
        std::mem::replace(&mut self.child, other.child)
    }

    /// Rebuild `data` as the sum of the child node's entries plus whatever
    /// is still parked in the buffer.
    pub fn recalculate_data(&mut self, children: &[Entry]) {
        debug_assert!(self.child.is_some());
        self.data.clear();
        for entry in children {
            self.data.add(&entry.data);
        }
        self.data.add(&self.buffer);
    }

    pub fn set_timestamp(&mut self, timestamp: u64) {
        self.timestamp = timestamp;
    }

    /// Cut the link to the child node, keeping the accumulated summary.
    pub fn detach_child(&mut self) -> Option<NodeId> {
        self.buffer.clear();
        self.child.take()
    }

    /// Reset to an unused slot. Returns the dropped child, if any.
    pub fn clear(&mut self) -> Option<NodeId> {
        self.data.clear();
        self.buffer.clear();
        self.timestamp = 0;
        self.child.take()
    }
}
