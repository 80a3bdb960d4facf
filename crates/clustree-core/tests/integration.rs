//! End-to-end scenarios over synthetic streams: insert, age, query.

use approx::assert_relative_eq;
use clustree_core::{
    ClusTree, ClusTreeConfig, GaussianStream, InsertionStrategy, Kernel, SimpleBudget,
    TargetLevel,
};

fn two_blobs(seed: u64) -> GaussianStream {
    GaussianStream::new(vec![vec![0.0, 0.0], vec![10.0, 10.0]], 0.5, seed).unwrap()
}

fn dist(a: &[f64], b: &[f64]) -> f64 {
    a.iter().zip(b).map(|(x, y)| (x - y).powi(2)).sum::<f64>().sqrt()
}

fn nearest_kernel_distance(kernels: &[Kernel], target: &[f64]) -> f64 {
    kernels
        .iter()
        .map(|k| dist(&k.center(), target))
        .fold(f64::INFINITY, f64::min)
}

fn run_two_blobs(strategy: InsertionStrategy) {
    let config = ClusTreeConfig {
        horizon: 1_000_000,
        strategy,
        ..Default::default()
    };
    let mut tree = ClusTree::new(config).unwrap();
    for (t, p) in two_blobs(42).take(1000).enumerate() {
        tree.insert(&p, t as u64 + 1).unwrap();
    }
    tree.check_invariants().unwrap();

    let clustering = tree.get_clustering(1000, TargetLevel::Leaves);
    assert!(clustering.len() >= 2);
    assert!(nearest_kernel_distance(clustering.kernels(), &[0.0, 0.0]) < 1.0);
    assert!(nearest_kernel_distance(clustering.kernels(), &[10.0, 10.0]) < 1.0);

    let total = clustering.total_weight();
    assert!((950.0..=1000.0).contains(&total), "total weight {total}");
}

/// Two well separated blobs are both found, and almost no mass is lost.
#[test]
fn two_gaussians_path_following() {
    run_two_blobs(InsertionStrategy::PathFollowing);
}

#[test]
fn two_gaussians_breadth_first() {
    run_two_blobs(InsertionStrategy::BreadthFirst);
}

/// A cluster that stops receiving points fades below the threshold while a
/// fresh one takes over.
#[test]
fn old_cluster_decays_away() {
    let config = ClusTreeConfig {
        horizon: 100,
        ..Default::default()
    };
    let mut tree = ClusTree::new(config).unwrap();
    let mut old = GaussianStream::new(vec![vec![0.0, 0.0]], 0.5, 1).unwrap();
    let mut new = GaussianStream::new(vec![vec![10.0, 10.0]], 0.5, 2).unwrap();

    for t in 1..=200u64 {
        tree.insert(&old.next().unwrap(), t).unwrap();
    }
    for t in 201..=400u64 {
        tree.insert(&new.next().unwrap(), t).unwrap();
    }

    let clustering = tree.get_clustering(400, TargetLevel::Leaves);
    let (mut old_mass, mut new_mass) = (0.0, 0.0);
    for k in &clustering {
        if dist(&k.center(), &[0.0, 0.0]) < dist(&k.center(), &[10.0, 10.0]) {
            old_mass += k.weight();
        } else {
            new_mass += k.weight();
        }
    }
    assert!(old_mass < 0.1, "old mass {old_mass}");
    assert!(new_mass > 15.0, "new mass {new_mass}");
}

/// With no room to grow the tree degenerates to a single node whose three
/// entries absorb the whole stream.
#[test]
fn max_height_zero_keeps_everything_in_root() {
    let config = ClusTreeConfig {
        max_height: 0,
        decay_rate: Some(0.0),
        ..Default::default()
    };
    let mut tree = ClusTree::new(config).unwrap();
    for (t, p) in two_blobs(9).take(500).enumerate() {
        tree.insert(&p, t as u64 + 1).unwrap();
    }
    assert_eq!(tree.node_count(), 1);
    let clustering = tree.micro_clustering();
    assert!(clustering.len() <= 3);
    assert_relative_eq!(clustering.total_weight(), 500.0, epsilon = 1e-6);
}

/// A tight budget parks work in buffers but never loses mass at the top.
#[test]
fn tight_budget_keeps_root_mass_exact() {
    let config = ClusTreeConfig {
        decay_rate: Some(0.0),
        ..Default::default()
    };
    let mut tree = ClusTree::new(config).unwrap();
    for (t, p) in two_blobs(5).take(400).enumerate() {
        let mut budget = SimpleBudget::new(4);
        tree.insert_with_budget(&p, t as u64 + 1, &mut budget).unwrap();
    }
    tree.check_invariants().unwrap();

    let at = tree.timestamp();
    let top = tree.get_clustering(at, TargetLevel::Depth(0)).total_weight();
    assert_relative_eq!(top, 400.0, epsilon = 1e-6);
    let leaves = tree.get_clustering(at, TargetLevel::Leaves).total_weight();
    assert!(leaves <= 400.0 + 1e-6);
}

/// Long streams with frequent cleanup keep a valid, bounded tree.
#[test]
fn long_stream_with_cleanup() {
    let config = ClusTreeConfig {
        max_height: 4,
        cleanup_interval: 500,
        ..Default::default()
    };
    let mut tree = ClusTree::new(config).unwrap();
    let stream = GaussianStream::new(
        vec![vec![0.0, 0.0, 0.0], vec![5.0, 0.0, 5.0], vec![-5.0, 5.0, 0.0]],
        1.0,
        77,
    )
    .unwrap();
    for (t, p) in stream.take(5000).enumerate() {
        tree.insert(&p, t as u64 + 1).unwrap();
    }
    tree.check_invariants().unwrap();
    assert_eq!(tree.num_insertions(), 5000);
    assert!(tree.height() <= 4);
    assert!(tree.leaf_entry_count() <= 3usize.pow(5));
}

/// `train` drives the same tree with an internal clock.
#[test]
fn train_matches_explicit_timestamps() {
    let mut explicit = ClusTree::new(ClusTreeConfig::default()).unwrap();
    let mut trained = ClusTree::new(ClusTreeConfig::default()).unwrap();
    for (t, p) in two_blobs(11).take(300).enumerate() {
        explicit.insert(&p, t as u64 + 1).unwrap();
        trained.train(&p).unwrap();
    }
    assert_eq!(trained.timestamp(), 300);
    let a = explicit.get_clustering(300, TargetLevel::Leaves);
    let b = trained.micro_clustering();
    assert_eq!(a.kernels(), b.kernels());
}
