use serde::{Deserialize, Serialize};

use crate::kernel::Kernel;

/// Which level of the tree a query reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum TargetLevel {
    /// Every leaf, plus any node sitting at max height.
    #[default]
    Leaves,
    /// Nodes at exactly this depth (root = 0).
    Depth(usize),
}

/// (center, radius, weight) view of one output kernel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MicroCluster {
    pub center: Vec<f64>,
    pub radius: f64,
    pub weight: f64,
}

impl From<&Kernel> for MicroCluster {
    fn from(kernel: &Kernel) -> Self {
        Self {
            center: kernel.center(),
            radius: kernel.radius(),
            weight: kernel.weight(),
        }
    }
}

/// Flat list of kernels read from the tree, in breadth-first order.
#[derive(Clone, Debug, Default)]
pub struct Clustering {
    kernels: Vec<Kernel>,
}

impl Clustering {
    pub fn new(kernels: Vec<Kernel>) -> Self {
        Self { kernels }
    }

    pub fn len(&self) -> usize {
        self.kernels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.kernels.is_empty()
    }

    pub fn kernels(&self) -> &[Kernel] {
        &self.kernels
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Kernel> {
        self.kernels.iter()
    }

    pub fn total_weight(&self) -> f64 {
        self.kernels.iter().map(Kernel::weight).sum()
    }

    pub fn summaries(&self) -> Vec<MicroCluster> {
        self.kernels.iter().map(MicroCluster::from).collect()
    }

    pub fn into_kernels(self) -> Vec<Kernel> {
        self.kernels
    }
}

impl IntoIterator for Clustering {
    type Item = Kernel;
    type IntoIter = std::vec::IntoIter<Kernel>;

    fn into_iter(self) -> Self::IntoIter {
        self.kernels.into_iter()
    }
}

impl<'a> IntoIterator for &'a Clustering {
    type Item = &'a Kernel;
    type IntoIter = std::slice::Iter<'a, Kernel>;

    fn into_iter(self) -> Self::IntoIter {
        self.kernels.iter()
    }
}
