//! Recursive halving/doubling algorithm
//!
//! log2(N) exchange steps; at step k node i pairs with `i XOR (1<<k)`.
//! Data halves during reduce-scatter and doubles during all-gather.
//! Requires a power-of-two group size; the phase generator falls back to
//! ring otherwise.

use crate::algorithm::{AlgoCtx, CollectiveAlgorithm, PhaseStatus};
use clustersim_core::topology::RingTopology;
use clustersim_core::types::{CollectiveKind, NodeId};

#[derive(Debug)]
pub struct HalvingDoubling {
    members: Vec<NodeId>,
    index: usize,
    data_bytes: u64,
    rounds: u32,
    total_steps: u32,
    reduce_steps: u32,
    step: u32,
    send_done: bool,
    recv_done: bool,
}

impl HalvingDoubling {
    /// `group` must have power-of-two size.
    pub fn new(op: CollectiveKind, group: &RingTopology, data_bytes: u64) -> Self {
        let n = group.size();
        assert!(n.is_power_of_two(), "halving/doubling needs a power-of-two group");
        let rounds = n.trailing_zeros();
        let (total_steps, reduce_steps) = match op {
            CollectiveKind::AllReduce => (2 * rounds, rounds),
            CollectiveKind::ReduceScatter => (rounds, rounds),
            _ => (rounds, 0),
        };
        Self {
            members: group.members.clone(),
            index: group.index,
            data_bytes,
            rounds,
            total_steps,
            reduce_steps,
            step: 0,
            send_done: false,
            recv_done: false,
        }
    }

    fn partner(&self) -> NodeId {
        // Halving walks the bits up; doubling walks them back down.
        let bit = if self.step < self.reduce_steps || self.reduce_steps == 0 {
            self.step % self.rounds
        } else {
            let gather_step = self.step - self.reduce_steps;
            self.rounds - 1 - gather_step
        };
        self.members[self.index ^ (1 << bit)]
    }

    fn step_bytes(&self) -> u64 {
        let b = if self.reduce_steps > 0 && self.step < self.reduce_steps {
            // Reduce-scatter half: data halves every exchange.
            self.data_bytes >> (self.step + 1)
        } else if self.reduce_steps > 0 {
            // All-gather half of an all-reduce: doubling back up.
            self.data_bytes >> (self.total_steps - self.step)
        } else {
            // Pure all-gather from a shard: doubles every exchange.
            self.data_bytes << self.step
        };
        b.max(1)
    }

    fn issue_step(&mut self, ctx: &mut AlgoCtx) {
        self.send_done = false;
        self.recv_done = false;
        let peer = self.partner();
        let bytes = self.step_bytes();
        let reduce = self.step < self.reduce_steps;
        let delay = if reduce {
            ctx.mem.access_ns(bytes, bytes) + ctx.cost.local_reduction_delay_ns
        } else {
            ctx.mem.access_ns(bytes, bytes)
        };
        ctx.recv(peer, bytes);
        ctx.send(peer, bytes, delay);
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

impl CollectiveAlgorithm for HalvingDoubling {
    fn name(&self) -> &'static str {
        "halvingDoubling"
    }

    fn run(&mut self, ctx: &mut AlgoCtx) -> PhaseStatus {
        if self.total_steps == 0 {
            return PhaseStatus::Finished;
        }
        self.issue_step(ctx);
        PhaseStatus::InProgress
    }

    fn on_recv(&mut self, ctx: &mut AlgoCtx, _src: NodeId, _bytes: u64, _sub: u64) -> PhaseStatus {
        self.recv_done = true;
        self.try_advance(ctx)
    }

    fn on_send_done(&mut self, ctx: &mut AlgoCtx, _dst: NodeId, _sub: u64) -> PhaseStatus {
        self.send_done = true;
        self.try_advance(ctx)
    }
}
