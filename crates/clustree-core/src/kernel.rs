use serde::{Deserialize, Serialize};

use crate::constants::{EPSILON, MIN_VARIANCE, RADIUS_FACTOR};

/// Sufficient statistics of a weighted point set.
///
/// `weight` is the decayed mass, `count` the undecayed number of absorbed
/// points. A kernel is empty iff `count == 0`, in which case both vectors
/// are all-zero. Center and variance are only defined on non-empty kernels.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Kernel {
    count: f64,
    weight: f64,
    linear_sum: Vec<f64>,
    sum_of_squares: Vec<f64>,
}

impl PartialEq for Kernel {
    fn eq(&self, other: &Self) -> bool {
        let close = |a: &[f64], b: &[f64]| {
            a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < EPSILON)
        };
        (self.count - other.count).abs() < EPSILON
            && (self.weight - other.weight).abs() < EPSILON
            && close(&self.linear_sum, &other.linear_sum)
            && close(&self.sum_of_squares, &other.sum_of_squares)
    }
}

impl Kernel {
    /// Empty kernel of the given dimensionality.
    pub fn empty(dimensions: usize) -> Self {
        Self {
            count: 0.0,
            weight: 0.0,
            linear_sum: vec![0.0; dimensions],
            sum_of_squares: vec![0.0; dimensions],
        }
    }

    /// Kernel representing exactly one point with weight 1.
    pub fn from_point(point: &[f64]) -> Self {
        Self {
            count: 1.0,
            weight: 1.0,
            linear_sum: point.to_vec(),
            sum_of_squares: point.iter().map(|x| x * x).collect(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.linear_sum.len()
    }

    /// Decayed mass.
    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Number of points absorbed, ignoring decay.
    pub fn count(&self) -> f64 {
        self.count
    }

    pub fn linear_sum(&self) -> &[f64] {
        &self.linear_sum
    }

    pub fn sum_of_squares(&self) -> &[f64] {
        &self.sum_of_squares
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0.0
    }

    /// Summarizes a single point. Keyed on `count`, not `weight`, so a
    /// decayed single-point kernel stays trivial.
    pub fn is_trivial(&self) -> bool {
        self.count == 1.0
    }

    pub fn clear(&mut self) {
        self.count = 0.0;
        self.weight = 0.0;
        self.linear_sum.fill(0.0);
        self.sum_of_squares.fill(0.0);
    }

    /// Fold `other` into this kernel without aging either side.
    pub fn add(&mut self, other: &Kernel) {
        debug_assert_eq!(self.dimensions(), other.dimensions());
        self.count += other.count;
        self.weight += other.weight;
        for (ls, o) in self.linear_sum.iter_mut().zip(&other.linear_sum) {
            *ls += o;
        }
        for (ss, o) in self.sum_of_squares.iter_mut().zip(&other.sum_of_squares) {
            *ss += o;
        }
    }

    /// Age this kernel by `time_difference`, then fold `other` in.
    pub fn aggregate(&mut self, other: &Kernel, time_difference: u64, decay_rate: f64) {
        self.make_older(time_difference, decay_rate);
        self.add(other);
    }

    /// Scale weight and both sums by `2^(decay_rate · Δt)`.
    /// `decay_rate` is non-positive, so this only ever shrinks the kernel.
    pub fn make_older(&mut self, time_difference: u64, decay_rate: f64) {
        if time_difference == 0 || decay_rate == 0.0 {
            return;
        }
        debug_assert!(decay_rate < 0.0, "decay rate must be negative: {decay_rate}");

        let factor = 2f64.powf(decay_rate * time_difference as f64);
        self.weight *= factor;
        for ls in &mut self.linear_sum {
            *ls *= factor;
        }
        for ss in &mut self.sum_of_squares {
            *ss *= factor;
        }
    }

    /// Replace all statistics with a copy of `other`. No accumulation.
    pub fn overwrite_with(&mut self, other: &Kernel) {
        debug_assert_eq!(self.dimensions(), other.dimensions());
        self.count = other.count;
        self.weight = other.weight;
        self.linear_sum.copy_from_slice(&other.linear_sum);
        self.sum_of_squares.copy_from_slice(&other.sum_of_squares);
    }

    pub fn center(&self) -> Vec<f64> {
        debug_assert!(!self.is_empty(), "center of an empty kernel");
        self.linear_sum.iter().map(|ls| ls / self.weight).collect()
    }

    /// Per-dimension variance, floored at MIN_VARIANCE.
    pub fn variance(&self) -> Vec<f64> {
        debug_assert!(!self.is_empty(), "variance of an empty kernel");
        self.linear_sum
            .iter()
            .zip(&self.sum_of_squares)
            .map(|(ls, ss)| {
                let mean = ls / self.weight;
                let v = ss / self.weight - mean * mean;
                if v <= 0.0 { MIN_VARIANCE } else { v }
            })
            .collect()
    }

    /// Mean per-dimension standard deviation × RADIUS_FACTOR.
    /// Single-point kernels have radius 0.
    pub fn radius(&self) -> f64 {
        if self.is_trivial() {
            return 0.0;
        }
        let variance = self.variance();
        let deviation = variance.iter().map(|v| v.sqrt()).sum::<f64>() / variance.len() as f64;
        deviation * RADIUS_FACTOR
    }

    /// Euclidean distance between the two centers.
    pub fn distance(&self, other: &Kernel) -> f64 {
        debug_assert!(!self.is_empty() && !other.is_empty());
        self.linear_sum
            .iter()
            .zip(&other.linear_sum)
            .map(|(a, b)| {
                let d = a / self.weight - b / other.weight;
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    /// Euclidean distance from the center to a raw point.
    pub fn distance_to_point(&self, point: &[f64]) -> f64 {
        debug_assert!(!self.is_empty());
        self.linear_sum
            .iter()
            .zip(point)
            .map(|(ls, p)| {
                let d = ls / self.weight - p;
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }

    /// 1.0 if `point` lies within the radius, else 0.0.
    /// Trivial kernels only include their own point.
    pub fn inclusion_probability(&self, point: &[f64]) -> f64 {
        let distance = self.distance_to_point(point);
        let inside = if self.is_trivial() {
            distance < EPSILON
        } else {
            distance <= self.radius()
        };
        if inside { 1.0 } else { 0.0 }
    }
}
