//! ClusterSim Engine
//!
//! Per-node execution engine of the training simulator: the `Sys`
//! orchestrator, chunk-stream scheduling, the workload FSM, and the
//! cluster driver that drains the backend's event queue until every node
//! finishes its passes.
//!
//! # Example
//!
//! ```rust,no_run
//! use clustersim_engine::prelude::*;
//! use clustersim_core::prelude::*;
//!
//! fn main() -> SimResult<()> {
//!     let workload = WorkloadSpec::from_file("workload.txt")?;
//!     let system = SystemConfig::from_file("system.txt")?;
//!     let network = NetworkConfig::from_file("network.txt")?;
//!     let mut cluster = Cluster::new(&workload, &system, &network, network.num_nodes(), 1, false)?;
//!     let summary = cluster.run()?;
//!     println!("finished at {} ns", summary.finish_time_ns);
//!     Ok(())
//! }
//! ```

pub mod report;
pub mod scheduler;
pub mod stream;
pub mod sys;
pub mod workload;

pub use scheduler::StreamScheduler;
pub use stream::{CollectivePhase, Stream, StreamArena, StreamBatch, StreamState};
pub use sys::{CommEngine, Notification, Sys};
pub use workload::{default_group, Layer, LayerSpec, PhaseSpec, TickCause, Workload, WorkloadSpec};

use clustersim_backends::AnalyticalNetwork;
use clustersim_core::backend::NetworkApi;
use clustersim_core::config::{NetworkConfig, SystemConfig};
use clustersim_core::error::{SimError, SimResult};
use clustersim_core::event::EventKind;
use clustersim_core::topology::{GroupMap, TopologyMap};
use tracing::{info, warn};

/// Prelude for common engine imports
pub mod prelude {
    pub use crate::report::{write_summary, write_utilization};
    pub use crate::sys::{CommEngine, Notification, Sys};
    pub use crate::workload::{Workload, WorkloadSpec};
    pub use crate::{Cluster, RunSummary};
}

/// Aggregate outcome of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    pub finish_time_ns: u64,
    pub streams_injected: u64,
    pub streams_finished: u64,
}

/// The whole simulated cluster: every node plus the network backend that
/// owns event order and time.
pub struct Cluster {
    pub nodes: Vec<Sys>,
    pub net: Box<dyn NetworkApi>,
}

impl Cluster {
    /// Build a cluster over the analytical backend. Group sizes from the
    /// workload header that do not align with a dimension boundary split
    /// the physical dimensions before any node is constructed.
    pub fn new(
        workload: &WorkloadSpec,
        system: &SystemConfig,
        network: &NetworkConfig,
        num_gpus: usize,
        total_pass: u64,
        nvls_enabled: bool,
    ) -> SimResult<Self> {
        let mut network = network.clone();
        if network.num_nodes() != num_gpus {
            return Err(SimError::config(format!(
                "topology describes {} nodes but {num_gpus} GPUs were requested",
                network.num_nodes()
            )));
        }
        if let Some(all_gpus) = workload.all_gpus {
            if all_gpus != num_gpus {
                warn!(all_gpus, num_gpus, "workload header disagrees with GPU count");
            }
        }

        let tp = workload.tp_size();
        let ep = workload.ep_size();
        let pp = workload.pp_size();

        // Align every group boundary, mirroring splits into the link table.
        let mut proto = TopologyMap::new(0, network.dims.clone(), system.per_op_algorithms())?;
        for target in [tp, tp * ep, num_gpus / pp.max(1)] {
            if target > 1 && target <= num_gpus {
                if let Some((dim, a)) = proto.break_dimension(target)? {
                    network.split_dim(dim, a)?;
                }
            }
        }
        let dims = proto.dims().to_vec();
        let groups = GroupMap::derive(&dims, tp, ep, pp)?;
        info!(?dims, tp, ep, pp, "cluster topology resolved");

        let net = AnalyticalNetwork::new(&network, system.loggp)?;
        let nodes = (0..num_gpus)
            .map(|id| {
                let topo = TopologyMap::new(id, dims.clone(), system.per_op_algorithms())?;
                let comm = CommEngine::new(
                    id,
                    system.clone(),
                    topo,
                    groups.clone(),
                    network.bandwidth.clone(),
                    nvls_enabled,
                );
                let wl = Workload::new(id, workload, total_pass);
                Ok(Sys::new(id, comm, wl))
            })
            .collect::<SimResult<Vec<_>>>()?;

        Ok(Self {
            nodes,
            net: Box::new(net),
        })
    }

    /// Drain the event queue until the simulation completes. Every node
    /// must retire with all injected streams finished; a drained queue
    /// with unfinished nodes is a hang.
    pub fn run(&mut self) -> SimResult<RunSummary> {
        for node in &self.nodes {
            self.net.schedule(0, node.id, EventKind::WorkloadWait);
        }

        while let Some(ev) = self.net.pop_event() {
            let sys = self
                .nodes
                .get_mut(ev.target)
                .ok_or_else(|| SimError::Backend(format!("event for unknown node {}", ev.target)))?;
            sys.handle_event(ev.kind, self.net.as_mut())?;
        }

        let mut summary = RunSummary {
            finish_time_ns: 0,
            streams_injected: 0,
            streams_finished: 0,
        };
        for node in &self.nodes {
            if !node.workload.finished {
                return Err(SimError::DependencyViolation(format!(
                    "node {} hung in pass {} with {} of {} streams finished",
                    node.id,
                    node.workload.pass,
                    node.comm.streams_finished,
                    node.comm.streams_injected
                )));
            }
            summary.finish_time_ns = summary.finish_time_ns.max(node.workload.finish_time_ns);
            summary.streams_injected += node.comm.streams_injected;
            summary.streams_finished += node.comm.streams_finished;
        }
        info!(
            time_ns = summary.finish_time_ns,
            streams = summary.streams_finished,
            "simulation complete"
        );
        Ok(summary)
    }
}
