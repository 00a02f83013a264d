//! ClusterSim
//!
//! A discrete-event simulator for distributed deep-learning training. A
//! cluster of accelerators executes a layered workload under hybrid
//! parallelism (data, tensor, expert, pipeline); the simulator predicts
//! wall-clock training time by replaying compute delays and chunked
//! collective communication against a pluggable network backend.
//!
//! This crate re-exports the workspace members:
//!
//! - [`clustersim_core`] — types, topology, configuration, backend trait
//! - [`clustersim_collectives`] — phase generation and collective algorithms
//! - [`clustersim_backends`] — the analytical network backend
//! - [`clustersim_engine`] — per-node orchestration and the cluster driver

pub use clustersim_backends as backends;
pub use clustersim_collectives as collectives;
pub use clustersim_engine as engine;

pub use clustersim_core::prelude::*;
pub use clustersim_engine::workload::WorkloadSpec;
pub use clustersim_engine::{Cluster, RunSummary};
