//! Ring algorithm
//!
//! N−1 steps of reduce-scatter followed by N−1 steps of all-gather for
//! AllReduce semantics; AllGather and ReduceScatter run only the relevant
//! half. At step k, node i sends to `(i+1) mod N` and receives from
//! `(i−1) mod N`; a step advances when both its send and its receive have
//! completed.

use crate::algorithm::{AlgoCtx, CollectiveAlgorithm, PhaseStatus};
use clustersim_core::topology::RingTopology;
use clustersim_core::types::{CollectiveKind, NodeId};

#[derive(Debug)]
pub struct RingAlgorithm {
    op: CollectiveKind,
    next: NodeId,
    prev: NodeId,
    per_step_bytes: u64,
    total_steps: u32,
    /// Steps that combine received data before forwarding.
    reduce_steps: u32,
    step: u32,
    send_done: bool,
    recv_done: bool,
}

impl RingAlgorithm {
    pub fn new(op: CollectiveKind, ring: &RingTopology, data_bytes: u64) -> Self {
        let n = ring.size() as u32;
        let steps = n.saturating_sub(1);
        let (total_steps, reduce_steps, per_step_bytes) = match op {
            CollectiveKind::AllReduce => (2 * steps, steps, data_bytes / n.max(1) as u64),
            CollectiveKind::ReduceScatter => (steps, steps, data_bytes / n.max(1) as u64),
            // An all-gather circulates each node's shard around the ring.
            CollectiveKind::AllGather => (steps, 0, data_bytes),
            CollectiveKind::AllToAll => (steps, 0, data_bytes / n.max(1) as u64),
            CollectiveKind::None => (0, 0, 0),
        };
        Self {
            op,
            next: ring.next(),
            prev: ring.prev(),
            per_step_bytes: per_step_bytes.max(1),
            total_steps,
            reduce_steps,
            step: 0,
            send_done: false,
            recv_done: false,
        }
    }

    fn step_delay(&self, ctx: &AlgoCtx) -> u64 {
        let b = self.per_step_bytes;
        if self.step == 0 {
            ctx.mem.access_ns(b, 0)
        } else if self.step <= self.reduce_steps {
            ctx.mem.access_ns(b, b) + ctx.cost.local_reduction_delay_ns
        } else {
            ctx.mem.access_ns(b, b)
        }
    }

    fn issue_step(&mut self, ctx: &mut AlgoCtx) {
        self.send_done = false;
        self.recv_done = false;
        let delay = self.step_delay(ctx);
        ctx.recv(self.prev, self.per_step_bytes);
        ctx.send(self.next, self.per_step_bytes, delay);
    }

    fn try_advance(&mut self, ctx: &mut AlgoCtx) -> PhaseStatus {
        if !(self.send_done && self.recv_done) {
            return PhaseStatus::InProgress;
        }
        self.step += 1;
        if self.step >= self.total_steps {
            return PhaseStatus::Finished;
        }
        self.issue_step(ctx);
        PhaseStatus::InProgress
    }
}

impl CollectiveAlgorithm for RingAlgorithm {
    fn name(&self) -> &'static str {
        "ring"
    }

    fn run(&mut self, ctx: &mut AlgoCtx) -> PhaseStatus {
        if self.total_steps == 0 {
            return PhaseStatus::Finished;
        }
        tracing::trace!(
            node = ctx.node,
            op = self.op.as_str(),
            steps = self.total_steps,
            "ring phase start"
        );
        self.issue_step(ctx);
        PhaseStatus::InProgress
    }

    fn on_recv(&mut self, ctx: &mut AlgoCtx, src: NodeId, _bytes: u64, _sub_tag: u64) -> PhaseStatus {
        debug_assert_eq!(src, self.prev);
        self.recv_done = true;
        self.try_advance(ctx)
    }

    fn on_send_done(&mut self, ctx: &mut AlgoCtx, dst: NodeId, _sub_tag: u64) -> PhaseStatus {
        debug_assert_eq!(dst, self.next);
        self.send_done = true;
        self.try_advance(ctx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{CostModel, NetOp};
    use clustersim_core::membus::MemBus;

    fn ring4() -> RingTopology {
        RingTopology {
            dim: 0,
            members: vec![0, 1, 2, 3],
            index: 0,
        }
    }

    fn ctx() -> AlgoCtx {
        AlgoCtx::new(0, 0, CostModel::default(), MemBus::new(0.0, false))
    }

    /// Drive one node's view to completion, acknowledging every send and
    /// receive in lockstep.
    fn drive(algo: &mut RingAlgorithm) -> u32 {
        let mut c = ctx();
        let mut status = algo.run(&mut c);
        let mut rounds = 0;
        while status == PhaseStatus::InProgress {
            let ops = c.take_ops();
            assert!(!ops.is_empty(), "stalled ring phase");
            for op in ops {
                match op {
                    NetOp::Send { dst, .. } => {
                        status = algo.on_send_done(&mut c, dst, 0);
                    }
                    NetOp::Recv { src, bytes, .. } => {
                        status = algo.on_recv(&mut c, src, bytes, 0);
                    }
                }
            }
            rounds += 1;
            assert!(rounds < 100, "ring phase did not terminate");
        }
        rounds
    }

    #[test]
    fn test_all_reduce_runs_2n_minus_2_steps() {
        let mut algo = RingAlgorithm::new(CollectiveKind::AllReduce, &ring4(), 4096);
        let rounds = drive(&mut algo);
        assert_eq!(rounds, 6);
    }

    #[test]
    fn test_all_gather_runs_n_minus_1_steps() {
        let mut algo = RingAlgorithm::new(CollectiveKind::AllGather, &ring4(), 4096);
        assert_eq!(algo.per_step_bytes, 4096);
        let rounds = drive(&mut algo);
        assert_eq!(rounds, 3);
    }

    #[test]
    fn test_single_member_finishes_immediately() {
        let ring = RingTopology {
            dim: 0,
            members: vec![0],
            index: 0,
        };
        let mut algo = RingAlgorithm::new(CollectiveKind::AllReduce, &ring, 4096);
        let mut c = ctx();
        assert_eq!(algo.run(&mut c), PhaseStatus::Finished);
        assert!(c.take_ops().is_empty());
    }

    #[test]
    fn test_reduce_steps_charge_reduction_delay() {
        let mut algo = RingAlgorithm::new(CollectiveKind::AllReduce, &ring4(), 4096);
        let c = AlgoCtx::new(
            0,
            0,
            CostModel {
                local_reduction_delay_ns: 7,
            },
            MemBus::new(0.0, false),
        );
        algo.step = 1;
        assert_eq!(algo.step_delay(&c), 7);
        algo.step = 4; // all-gather half
        assert_eq!(algo.step_delay(&c), 0);
    }
}
