//! Direct all-to-all algorithm
//!
//! N−1 pairwise exchanges; node i targets `(i+1) mod N, (i+2) mod N, …` so
//! partner load spreads around the group. A window bounds how many partner
//! sends are outstanding at once (0 = unbounded).

use crate::algorithm::{AlgoCtx, CollectiveAlgorithm, PhaseStatus};
use clustersim_core::topology::DirectTopology;
use clustersim_core::types::NodeId;

#[derive(Debug)]
pub struct AllToAllDirect {
    members: Vec<NodeId>,
    index: usize,
    per_peer_bytes: u64,
    window: usize,
    next_offset: usize,
    inflight_sends: usize,
    sends_done: usize,
    recvs_done: usize,
}

impl AllToAllDirect {
    pub fn new(topo: &DirectTopology, data_bytes: u64, window: usize) -> Self {
        let n = topo.members.len();
        Self {
            members: topo.members.clone(),
            index: topo.index,
            per_peer_bytes: (data_bytes / n.max(1) as u64).max(1),
            window,
            next_offset: 1,
            inflight_sends: 0,
            sends_done: 0,
            recvs_done: 0,
        }
    }

    fn peers(&self) -> usize {
        self.members.len() - 1
    }

    fn fill_window(&mut self, ctx: &mut AlgoCtx) {
        let n = self.members.len();
        let limit = if self.window == 0 {
            usize::MAX
        } else {
            self.window
        };
        while self.next_offset < n && self.inflight_sends < limit {
            let peer = self.members[(self.index + self.next_offset) % n];
            let delay = ctx.mem.access_ns(self.per_peer_bytes, 0);
            ctx.send(peer, self.per_peer_bytes, delay);
            self.next_offset += 1;
            self.inflight_sends += 1;
        }
    }

    fn status(&self) -> PhaseStatus {
        if self.sends_done == self.peers() && self.recvs_done == self.peers() {
            PhaseStatus::Finished
        } else {
            PhaseStatus::InProgress
        }
    }
}

impl CollectiveAlgorithm for AllToAllDirect {
    fn name(&self) -> &'static str {
        "allToAllDirect"
    }

    fn run(&mut self, ctx: &mut AlgoCtx) -> PhaseStatus {
        if self.members.len() < 2 {
            return PhaseStatus::Finished;
        }
        // Receives are unserialized; post them all upfront.
        let n = self.members.len();
        for offset in 1..n {
            let peer = self.members[(self.index + n - offset) % n];
            ctx.recv(peer, self.per_peer_bytes);
        }
        self.fill_window(ctx);
        PhaseStatus::InProgress
    }

    fn on_recv(&mut self, _ctx: &mut AlgoCtx, _src: NodeId, _bytes: u64, _sub: u64) -> PhaseStatus {
        self.recvs_done += 1;
        self.status()
    }

    fn on_send_done(&mut self, ctx: &mut AlgoCtx, _dst: NodeId, _sub: u64) -> PhaseStatus {
        self.sends_done += 1;
        self.inflight_sends -= 1;
        self.fill_window(ctx);
        self.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{CostModel, NetOp};
    use clustersim_core::membus::MemBus;

    fn topo4(index: usize) -> DirectTopology {
        DirectTopology {
            dim: 0,
            members: vec![0, 1, 2, 3],
            index,
        }
    }

    fn ctx() -> AlgoCtx {
        AlgoCtx::new(0, 0, CostModel::default(), MemBus::new(0.0, false))
    }

    #[test]
    fn test_unbounded_window_sends_all_partners() {
        let mut algo = AllToAllDirect::new(&topo4(0), 4096, 0);
        let mut c = ctx();
        algo.run(&mut c);
        let ops = c.take_ops();
        let sends: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                NetOp::Send { dst, .. } => Some(*dst),
                _ => None,
            })
            .collect();
        assert_eq!(sends, vec![1, 2, 3]);
        assert_eq!(ops.len() - sends.len(), 3); // three posted receives
    }

    #[test]
    fn test_window_bounds_concurrent_partners() {
        let mut algo = AllToAllDirect::new(&topo4(0), 4096, 1);
        let mut c = ctx();
        algo.run(&mut c);
        let sends = |ops: &[NetOp]| {
            ops.iter()
                .filter(|op| matches!(op, NetOp::Send { .. }))
                .count()
        };
        assert_eq!(sends(&c.take_ops()), 1);

        assert_eq!(algo.on_send_done(&mut c, 1, 0), PhaseStatus::InProgress);
        assert_eq!(sends(&c.take_ops()), 1);
        assert_eq!(algo.on_send_done(&mut c, 2, 0), PhaseStatus::InProgress);
        assert_eq!(sends(&c.take_ops()), 1);
        assert_eq!(algo.on_send_done(&mut c, 3, 0), PhaseStatus::InProgress);

        for src in [1, 2] {
            assert_eq!(algo.on_recv(&mut c, src, 1024, 0), PhaseStatus::InProgress);
        }
        assert_eq!(algo.on_recv(&mut c, 3, 1024, 0), PhaseStatus::Finished);
    }

    #[test]
    fn test_per_peer_slice() {
        let algo = AllToAllDirect::new(&topo4(1), 8192, 0);
        assert_eq!(algo.per_peer_bytes, 2048);
    }
}
