/// Numerical epsilon for near-zero comparisons
pub const EPSILON: f64 = 1e-8;

/// Floor for per-dimension variance. Cancellation in `ss/n - (ls/n)²` can
/// produce tiny negative values.
pub const MIN_VARIANCE: f64 = 1e-50;

/// Radius = mean per-dimension standard deviation × RADIUS_FACTOR
pub const RADIUS_FACTOR: f64 = 1.8;

/// Fixed node fanout. The (2,2) split only works for three entries.
pub const NUMBER_ENTRIES: usize = 3;

/// Insertions between two passes that detach children below max height.
pub const INSERTIONS_BETWEEN_CLEANUPS: u64 = 10_000;

/// Time units until an unrefreshed entry decays to the weight threshold
pub const DEFAULT_HORIZON: u64 = 1000;

/// Maximal tree height
pub const DEFAULT_MAX_HEIGHT: usize = 8;

/// Entries whose decayed weight falls below this are irrelevant
pub const DEFAULT_WEIGHT_THRESHOLD: f64 = 0.05;

/// Per-insertion operation budget
pub const DEFAULT_BUDGET: u64 = 1000;
