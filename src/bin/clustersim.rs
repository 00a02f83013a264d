//! Simulator command line
//!
//! ```text
//! clustersim -t 1 -w workload.txt -n topology.txt -c system.txt -g 16 -r results/
//! ```
//!
//! Environment: `AS_LOG_LEVEL` feeds the tracing filter, `AS_NVLS_ENABLE`
//! turns on NVLS plans in NCCL-accurate mode. Exit code is non-zero on any
//! configuration or simulation error.

use anyhow::{Context, Result};
use clap::Parser;
use clustersim_core::config::{NetworkConfig, SystemConfig};
use clustersim_engine::report;
use clustersim_engine::workload::WorkloadSpec;
use clustersim_engine::Cluster;
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "clustersim", about = "Distributed training cluster simulator")]
struct Args {
    /// Network backend worker threads (the analytical backend is
    /// single-threaded)
    #[arg(short = 't', long = "threads", default_value_t = 1)]
    threads: usize,

    /// Workload file
    #[arg(short = 'w', long = "workload")]
    workload: PathBuf,

    /// Network topology file
    #[arg(short = 'n', long = "network")]
    network: PathBuf,

    /// System configuration file
    #[arg(short = 'c', long = "system")]
    system: PathBuf,

    /// Number of simulated GPUs
    #[arg(short = 'g', long = "gpus")]
    gpus: usize,

    /// Directory for the summary and utilization CSV reports
    #[arg(short = 'r', long = "result-dir")]
    result_dir: Option<PathBuf>,

    /// Training iterations to simulate
    #[arg(long = "passes", default_value_t = 1)]
    passes: u64,
}

fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false)
}

fn main() -> Result<()> {
    let filter =
        EnvFilter::try_from_env("AS_LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let args = Args::parse();
    if args.threads > 1 {
        warn!(
            threads = args.threads,
            "analytical backend is single-threaded; extra threads are ignored"
        );
    }

    let workload = WorkloadSpec::from_file(&args.workload)
        .with_context(|| format!("loading workload {}", args.workload.display()))?;
    let system = SystemConfig::from_file(&args.system)
        .with_context(|| format!("loading system config {}", args.system.display()))?;
    let network = NetworkConfig::from_file(&args.network)
        .with_context(|| format!("loading network config {}", args.network.display()))?;

    let nvls = env_flag("AS_NVLS_ENABLE");
    let mut cluster = Cluster::new(&workload, &system, &network, args.gpus, args.passes, nvls)
        .context("building cluster")?;

    info!(
        gpus = args.gpus,
        layers = workload.layers.len(),
        passes = args.passes,
        "starting simulation"
    );
    let summary = cluster.run().context("simulation failed")?;

    println!(
        "all passes finished at time {} ns ({:.6} s)",
        summary.finish_time_ns,
        summary.finish_time_ns as f64 / 1e9
    );

    if let Some(dir) = &args.result_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating result dir {}", dir.display()))?;
        let node0 = &cluster.nodes[0];
        report::write_summary(dir.join("summary.csv"), &node0.workload)
            .context("writing summary report")?;
        report::write_utilization(
            dir.join("dim_utilization.csv"),
            &node0.comm.scheduler,
            summary.finish_time_ns,
        )
        .context("writing utilization report")?;
        info!(dir = %dir.display(), "reports written");
    }

    Ok(())
}
