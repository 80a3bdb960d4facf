use serde::{Deserialize, Serialize};

use crate::constants::{
    DEFAULT_BUDGET, DEFAULT_HORIZON, DEFAULT_MAX_HEIGHT, DEFAULT_WEIGHT_THRESHOLD,
    INSERTIONS_BETWEEN_CLEANUPS,
};
use crate::error::{ClusTreeError, Result};

/// How a new point finds its leaf.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum InsertionStrategy {
    /// Descend along the nearest entry at every level, carrying buffers down.
    #[default]
    PathFollowing,
    /// Scan every leaf and insert into the globally closest one.
    BreadthFirst,
}

impl InsertionStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PathFollowing => "path-following",
            Self::BreadthFirst => "breadth-first",
        }
    }
}

/// Construction-time parameters of a [`crate::ClusTree`].
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusTreeConfig {
    /// Time units until an unrefreshed entry decays to `weight_threshold`.
    pub horizon: u64,
    pub max_height: usize,
    /// Entries lighter than this are irrelevant: overwritten on insert,
    /// hidden from queries.
    pub weight_threshold: f64,
    /// Operations allowed per call to `insert`.
    pub budget: u64,
    pub strategy: InsertionStrategy,
    /// Overrides the rate derived from horizon and threshold. Must be <= 0.
    pub decay_rate: Option<f64>,
    pub cleanup_interval: u64,
}

impl Default for ClusTreeConfig {
    fn default() -> Self {
        Self {
            horizon: DEFAULT_HORIZON,
            max_height: DEFAULT_MAX_HEIGHT,
            weight_threshold: DEFAULT_WEIGHT_THRESHOLD,
            budget: DEFAULT_BUDGET,
            strategy: InsertionStrategy::default(),
            decay_rate: None,
            cleanup_interval: INSERTIONS_BETWEEN_CLEANUPS,
        }
    }
}

impl ClusTreeConfig {
    /// Negative exponent applied per time unit: `log2(threshold) / horizon`,
    /// so an entry untouched for `horizon` units has weight `threshold`.
    pub fn decay_rate(&self) -> f64 {
        match self.decay_rate {
            Some(rate) => rate,
            None => self.weight_threshold.log2() / self.horizon as f64,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.horizon == 0 {
            return Err(ClusTreeError::InvalidConfig(
                "horizon must be positive".into(),
            ));
        }
        if !(self.weight_threshold > 0.0 && self.weight_threshold < 1.0) {
            return Err(ClusTreeError::InvalidConfig(format!(
                "weight threshold must lie in (0, 1), got {}",
                self.weight_threshold
            )));
        }
        if let Some(rate) = self.decay_rate
            && !(rate.is_finite() && rate <= 0.0)
        {
            return Err(ClusTreeError::InvalidConfig(format!(
                "decay rate must be finite and <= 0, got {rate}"
            )));
        }
        if self.cleanup_interval == 0 {
            return Err(ClusTreeError::InvalidConfig(
                "cleanup interval must be positive".into(),
            ));
        }
        Ok(())
    }
}
