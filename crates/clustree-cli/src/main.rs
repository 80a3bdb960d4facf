mod input;

use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use clustree_core::{
    ClusTree, ClusTreeConfig, GaussianStream, InsertionStrategy, MicroCluster, TargetLevel,
};
use serde::Serialize;

#[derive(Parser)]
#[command(name = "clustree", about = "Anytime stream clustering with a ClusTree index")]
struct Cli {
    /// Enable verbose debug output
    #[arg(long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Cluster a CSV point stream and print the resulting micro-clusters
    Cluster(ClusterArgs),

    /// Write a synthetic Gaussian mixture stream as CSV
    Generate {
        /// Cluster centers, e.g. "0,0;10,10"
        #[arg(long)]
        centers: String,

        /// Standard deviation of every component
        #[arg(long, default_value_t = 1.0)]
        std: f64,

        /// Number of points
        #[arg(long, default_value_t = 1000)]
        count: usize,

        #[arg(long, default_value_t = 42)]
        seed: u64,
    },
}

#[derive(Args)]
struct ClusterArgs {
    /// Input file, one point per line (stdin if omitted)
    file: Option<PathBuf>,

    /// TOML file with tree parameters
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long)]
    horizon: Option<u64>,

    #[arg(long)]
    max_height: Option<usize>,

    /// Irrelevance weight threshold
    #[arg(long)]
    threshold: Option<f64>,

    /// Operations allowed per insertion
    #[arg(long)]
    budget: Option<u64>,

    /// Insert into the globally nearest leaf instead of following one path
    #[arg(long)]
    breadth_first: bool,

    /// Report nodes at this depth instead of the leaves
    #[arg(long)]
    level: Option<usize>,

    /// Print JSON instead of a table
    #[arg(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    points: usize,
    height: usize,
    strategy: &'static str,
    clusters: Vec<MicroCluster>,
}

fn init_tracing(verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(tracing::Level::WARN.into())
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match &cli.command {
        Commands::Cluster(args) => cmd_cluster(args),
        Commands::Generate {
            centers,
            std,
            count,
            seed,
        } => cmd_generate(centers, *std, *count, *seed),
    }
}

fn load_config(args: &ClusterArgs) -> Result<ClusTreeConfig> {
    let mut config = match &args.config {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&content)
                .with_context(|| format!("failed to parse {}", path.display()))?
        }
        None => ClusTreeConfig::default(),
    };

    if let Some(horizon) = args.horizon {
        config.horizon = horizon;
    }
    if let Some(max_height) = args.max_height {
        config.max_height = max_height;
    }
    if let Some(threshold) = args.threshold {
        config.weight_threshold = threshold;
    }
    if let Some(budget) = args.budget {
        config.budget = budget;
    }
    if args.breadth_first {
        config.strategy = InsertionStrategy::BreadthFirst;
    }
    Ok(config)
}

fn read_input(file: Option<&Path>) -> Result<String> {
    match file {
        Some(path) => std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display())),
        None => {
            let mut content = String::new();
            std::io::stdin()
                .read_to_string(&mut content)
                .context("failed to read stdin")?;
            Ok(content)
        }
    }
}

fn cmd_cluster(args: &ClusterArgs) -> Result<()> {
    let config = load_config(args)?;
    let strategy = config.strategy;
    let mut tree = ClusTree::new(config).context("invalid configuration")?;

    let content = read_input(args.file.as_deref())?;
    let points = input::parse_points(&content)?;
    for (t, point) in points.iter().enumerate() {
        tree.insert(&point.coords, t as u64 + 1)
            .with_context(|| format!("line {}", point.line))?;
    }

    let target = match args.level {
        Some(depth) => TargetLevel::Depth(depth),
        None => TargetLevel::Leaves,
    };
    let clustering = tree.get_clustering(tree.timestamp(), target);
    tracing::info!(
        "clustered {} points into {} kernels (height {})",
        points.len(),
        clustering.len(),
        tree.height()
    );

    let report = Report {
        points: points.len(),
        height: tree.height(),
        strategy: strategy.as_str(),
        clusters: clustering.summaries(),
    };

    if args.json {
        let json = serde_json::to_string_pretty(&report).context("failed to serialize report")?;
        println!("{json}");
    } else {
        print_table(&report);
    }
    Ok(())
}

fn print_table(report: &Report) {
    println!(
        "{} clusters from {} points (height {}, {})",
        report.clusters.len(),
        report.points,
        report.height,
        report.strategy
    );
    for (i, c) in report.clusters.iter().enumerate() {
        let center: Vec<String> = c.center.iter().map(|x| format!("{x:.4}")).collect();
        println!(
            "{:>4}  weight={:<10.3} radius={:<10.4} center=[{}]",
            i + 1,
            c.weight,
            c.radius,
            center.join(", ")
        );
    }
}

fn cmd_generate(centers: &str, std: f64, count: usize, seed: u64) -> Result<()> {
    let centers = input::parse_centers(centers).context("invalid --centers")?;
    let stream = GaussianStream::new(centers, std, seed).context("invalid stream parameters")?;

    let stdout = std::io::stdout();
    let mut out = std::io::BufWriter::new(stdout.lock());
    for point in stream.take(count) {
        let line: Vec<String> = point.iter().map(f64::to_string).collect();
        writeln!(out, "{}", line.join(",")).context("failed to write output")?;
    }
    out.flush().context("failed to write output")?;
    Ok(())
}
