//! ClusTree: anytime stream clustering over a bounded-height index.
//!
//! Points are absorbed into micro-clusters ([`Kernel`]s) held in a balanced
//! tree with fanout three. Every kernel decays exponentially with time, so
//! stale mass fades out and its slot is reused. Insertion does as much work
//! as its [`Budget`] allows; unfinished work is parked in entry buffers and
//! carried down by later insertions.
//!
//! Zero I/O. The CLI crate handles files, config and output formats.

pub mod budget;
pub mod clustering;
pub mod config;
pub mod constants;
pub mod entry;
pub mod error;
pub mod kernel;
pub mod node;
pub mod stream;
pub mod tree;

pub use budget::{Budget, SimpleBudget, UnlimitedBudget};
pub use clustering::{Clustering, MicroCluster, TargetLevel};
pub use config::{ClusTreeConfig, InsertionStrategy};
pub use constants::{EPSILON, MIN_VARIANCE, NUMBER_ENTRIES, RADIUS_FACTOR};
pub use entry::Entry;
pub use error::{ClusTreeError, Result};
pub use kernel::Kernel;
pub use node::{BestMerge, EntryRef, Node, NodeId};
pub use stream::GaussianStream;
pub use tree::{ClusTree, SplitPairing};
