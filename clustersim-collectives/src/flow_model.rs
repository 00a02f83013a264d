//! NCCL flow-model executor
//!
//! A phase in NCCL-accurate mode is a pre-planned DAG of single flows for
//! one rank. A flow fires only when all its parents have completed; the
//! DAG is acyclic and every flow terminates.

use crate::algorithm::{AlgoCtx, CollectiveAlgorithm, PhaseStatus};
use clustersim_core::error::{SimError, SimResult};
use clustersim_core::types::NodeId;
use serde::{Deserialize, Serialize};

/// One directed flow of a planned collective.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SingleFlow {
    pub id: usize,
    pub src: NodeId,
    pub dst: NodeId,
    pub bytes: u64,
    pub parents: Vec<usize>,
    pub children: Vec<usize>,
    pub channel: u32,
    /// The flow combines data before leaving its source.
    pub reduce: bool,
}

/// The per-rank flow DAG of one phase.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowModel {
    pub flows: Vec<SingleFlow>,
}

impl FlowModel {
    /// Check the plan: ids are dense, every flow touches `rank`, and the
    /// parent relation is acyclic.
    pub fn validate(&self, rank: NodeId) -> SimResult<()> {
        for (i, flow) in self.flows.iter().enumerate() {
            if flow.id != i {
                return Err(SimError::Backend(format!("flow ids not dense at {i}")));
            }
            if flow.src != rank && flow.dst != rank {
                return Err(SimError::Backend(format!(
                    "flow {i} does not touch rank {rank}"
                )));
            }
        }
        // Kahn's algorithm over parent edges.
        let n = self.flows.len();
        let mut indegree: Vec<usize> = self.flows.iter().map(|f| f.parents.len()).collect();
        let mut queue: Vec<usize> = (0..n).filter(|&i| indegree[i] == 0).collect();
        let mut visited = 0;
        while let Some(i) = queue.pop() {
            visited += 1;
            for f in &self.flows {
                if f.parents.contains(&i) {
                    indegree[f.id] -= 1;
                    if indegree[f.id] == 0 {
                        queue.push(f.id);
                    }
                }
            }
        }
        if visited != n {
            return Err(SimError::Backend("flow plan contains a cycle".to_string()));
        }
        Ok(())
    }

    pub fn total_bytes(&self) -> u64 {
        self.flows.iter().map(|f| f.bytes).sum()
    }
}

/// Executes one rank's flow DAG.
#[derive(Debug)]
pub struct NcclFlowAlgorithm {
    me: NodeId,
    flows: Vec<SingleFlow>,
    done: Vec<bool>,
    launched: Vec<bool>,
}

impl NcclFlowAlgorithm {
    pub fn new(me: NodeId, model: FlowModel) -> Self {
        let n = model.flows.len();
        Self {
            me,
            flows: model.flows,
            done: vec![false; n],
            launched: vec![false; n],
        }
    }

    fn parents_done(&self, flow: &SingleFlow) -> bool {
        flow.parents.iter().all(|&p| self.done[p])
    }

    /// Launch every send flow whose parents have completed.
    fn launch_ready(&mut self, ctx: &mut AlgoCtx) {
        for i in 0..self.flows.len() {
            if self.launched[i] || self.done[i] {
                continue;
            }
            let flow = &self.flows[i];
            if flow.src != self.me || !self.parents_done(flow) {
                continue;
            }
            let delay = if flow.reduce {
                ctx.mem.access_ns(flow.bytes, flow.bytes) + ctx.cost.local_reduction_delay_ns
            } else {
                ctx.mem.access_ns(flow.bytes, 0)
            };
            ctx.send_tagged(flow.dst, flow.bytes, delay, flow.channel as u64);
            self.launched[i] = true;
        }
    }

    fn status(&self) -> PhaseStatus {
        if self.done.iter().all(|&d| d) {
            PhaseStatus::Finished
        } else {
            PhaseStatus::InProgress
        }
    }
}

impl CollectiveAlgorithm for NcclFlowAlgorithm {
    fn name(&self) -> &'static str {
        "ncclFlowModel"
    }

    fn run(&mut self, ctx: &mut AlgoCtx) -> PhaseStatus {
        if self.flows.is_empty() {
            return PhaseStatus::Finished;
        }
        // Receives are matched in plan order per (src, channel).
        for flow in &self.flows {
            if flow.dst == self.me {
                ctx.recv_tagged(flow.src, flow.bytes, flow.channel as u64);
            }
        }
        self.launch_ready(ctx);
        PhaseStatus::InProgress
    }

    fn on_recv(&mut self, ctx: &mut AlgoCtx, src: NodeId, _bytes: u64, sub_tag: u64) -> PhaseStatus {
        let idx = self.flows.iter().position(|f| {
            !self.done[f.id] && f.dst == self.me && f.src == src && f.channel as u64 == sub_tag
        });
        if let Some(idx) = idx {
            self.done[idx] = true;
            self.launch_ready(ctx);
        } else {
            tracing::warn!(node = self.me, src, sub_tag, "unmatched flow receive");
        }
        self.status()
    }

    fn on_send_done(&mut self, ctx: &mut AlgoCtx, dst: NodeId, sub_tag: u64) -> PhaseStatus {
        let idx = self.flows.iter().position(|f| {
            self.launched[f.id]
                && !self.done[f.id]
                && f.src == self.me
                && f.dst == dst
                && f.channel as u64 == sub_tag
        });
        if let Some(idx) = idx {
            self.done[idx] = true;
            self.launch_ready(ctx);
        } else {
            tracing::warn!(node = self.me, dst, sub_tag, "unmatched flow send completion");
        }
        self.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{CostModel, NetOp};
    use clustersim_core::membus::MemBus;

    fn flow(id: usize, src: NodeId, dst: NodeId, parents: Vec<usize>) -> SingleFlow {
        SingleFlow {
            id,
            src,
            dst,
            bytes: 1024,
            parents,
            children: vec![],
            channel: 0,
            reduce: false,
        }
    }

    #[test]
    fn test_validate_rejects_cycle() {
        let mut model = FlowModel {
            flows: vec![flow(0, 0, 1, vec![1]), flow(1, 1, 0, vec![0])],
        };
        assert!(model.validate(0).is_err());
        model.flows[0].parents.clear();
        assert!(model.validate(0).is_ok());
    }

    #[test]
    fn test_flows_fire_only_after_parents() {
        // recv(1 -> me), then send(me -> 2) gated on it.
        let model = FlowModel {
            flows: vec![flow(0, 1, 0, vec![]), flow(1, 0, 2, vec![0])],
        };
        model.validate(0).unwrap();
        let mut algo = NcclFlowAlgorithm::new(0, model);
        let mut c = AlgoCtx::new(0, 0, CostModel::default(), MemBus::new(0.0, false));

        assert_eq!(algo.run(&mut c), PhaseStatus::InProgress);
        let ops = c.take_ops();
        assert!(ops.iter().all(|op| matches!(op, NetOp::Recv { .. })));

        assert_eq!(algo.on_recv(&mut c, 1, 1024, 0), PhaseStatus::InProgress);
        let ops = c.take_ops();
        assert!(matches!(ops[0], NetOp::Send { dst: 2, .. }));

        assert_eq!(algo.on_send_done(&mut c, 2, 0), PhaseStatus::Finished);
    }
}
