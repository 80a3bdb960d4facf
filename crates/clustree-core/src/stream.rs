//! Synthetic point streams for demos, tests and benchmarks.

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use rand_distr::{Distribution, Normal};

use crate::error::{ClusTreeError, Result};

/// Endless, seeded mixture of isotropic Gaussian clusters. Each point picks
/// its component uniformly at random.
#[derive(Clone, Debug)]
pub struct GaussianStream {
    centers: Vec<Vec<f64>>,
    noise: Normal<f64>,
    rng: SmallRng,
}

impl GaussianStream {
    pub fn new(centers: Vec<Vec<f64>>, std_dev: f64, seed: u64) -> Result<Self> {
        let Some(first) = centers.first() else {
            return Err(ClusTreeError::InvalidConfig(
                "at least one center is required".into(),
            ));
        };
        if first.is_empty() {
            return Err(ClusTreeError::EmptyPoint);
        }
        if let Some(bad) = centers.iter().find(|c| c.len() != first.len()) {
            return Err(ClusTreeError::DimensionMismatch {
                expected: first.len(),
                found: bad.len(),
            });
        }
        let noise = Normal::new(0.0, std_dev).map_err(|e| {
            ClusTreeError::InvalidConfig(format!("bad standard deviation {std_dev}: {e}"))
        })?;

        Ok(Self {
            centers,
            noise,
            rng: SmallRng::seed_from_u64(seed),
        })
    }

    pub fn centers(&self) -> &[Vec<f64>] {
        &self.centers
    }

    pub fn dimensions(&self) -> usize {
        self.centers[0].len()
    }

    /// Next point together with the index of the component that produced it.
    pub fn next_labeled(&mut self) -> (usize, Vec<f64>) {
        let label = self.rng.random_range(0..self.centers.len());
        let point = self.centers[label]
            .iter()
            .map(|c| c + self.noise.sample(&mut self.rng))
            .collect();
        (label, point)
    }
}

impl Iterator for GaussianStream {
    type Item = Vec<f64>;

    fn next(&mut self) -> Option<Vec<f64>> {
        Some(self.next_labeled().1)
    }
}
