//! Double binary tree algorithm
//!
//! Two overlaid binary trees each carry half the message: a reduce sweep
//! towards the root followed by a broadcast sweep back down. The mirror
//! tree reverses the rank order so interior nodes of one tree are leaves of
//! the other, giving bandwidth parity. AllReduce runs both sweeps,
//! ReduceScatter only the reduce sweep, AllGather only the broadcast sweep.

use crate::algorithm::{AlgoCtx, CollectiveAlgorithm, PhaseStatus};
use clustersim_core::topology::{BinaryTree, DoubleBinaryTree};
use clustersim_core::types::{CollectiveKind, NodeId};

#[derive(Debug)]
struct TreeExec {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    bytes: u64,
    sub_tag: u64,
    do_reduce: bool,
    do_bcast: bool,
    reduce_recvs_pending: usize,
    reduce_sent: bool,
    bcast_recv_pending: bool,
    bcast_sends_pending: usize,
}

impl TreeExec {
    fn new(tree: &BinaryTree, op: CollectiveKind, bytes: u64, sub_tag: u64) -> Self {
        let do_reduce = matches!(
            op,
            CollectiveKind::AllReduce | CollectiveKind::ReduceScatter
        );
        let do_bcast = matches!(op, CollectiveKind::AllReduce | CollectiveKind::AllGather);
        Self {
            parent: tree.parent,
            children: tree.children.clone(),
            bytes,
            sub_tag,
            do_reduce,
            do_bcast,
            reduce_recvs_pending: if do_reduce { tree.children.len() } else { 0 },
            reduce_sent: !(do_reduce && tree.parent.is_some()),
            bcast_recv_pending: do_bcast && tree.parent.is_some(),
            bcast_sends_pending: if do_bcast { tree.children.len() } else { 0 },
        }
    }

    fn start(&mut self, ctx: &mut AlgoCtx) {
        if self.do_reduce {
            for &child in &self.children {
                ctx.recv_tagged(child, self.bytes, self.sub_tag);
            }
        }
        if self.bcast_recv_pending {
            ctx.recv_tagged(self.parent.unwrap(), self.bytes, self.sub_tag);
        }
        if self.do_reduce && self.reduce_recvs_pending == 0 && !self.reduce_sent {
            // Leaf: feed the reduction immediately.
            let delay = ctx.mem.access_ns(self.bytes, 0);
            ctx.send_tagged(self.parent.unwrap(), self.bytes, delay, self.sub_tag);
        }
        if !self.do_reduce && self.do_bcast && self.parent.is_none() {
            // Pure broadcast sweep starts at the root.
            self.start_bcast(ctx);
        }
    }

    fn start_bcast(&mut self, ctx: &mut AlgoCtx) {
        let delay = ctx.mem.access_ns(self.bytes, 0);
        for &child in &self.children {
            ctx.send_tagged(child, self.bytes, delay, self.sub_tag);
        }
    }

    fn on_recv(&mut self, ctx: &mut AlgoCtx, src: NodeId) -> bool {
        if self.reduce_recvs_pending > 0 && self.children.contains(&src) {
            self.reduce_recvs_pending -= 1;
            if self.reduce_recvs_pending == 0 {
                let delay =
                    ctx.mem.access_ns(self.bytes, self.bytes) + ctx.cost.local_reduction_delay_ns;
                match self.parent {
                    Some(parent) => {
                        ctx.send_tagged(parent, self.bytes, delay, self.sub_tag);
                    }
                    None => {
                        // Root holds the full reduction; turn around.
                        if self.do_bcast {
                            self.start_bcast(ctx);
                        }
                    }
                }
            }
            return true;
        }
        if self.bcast_recv_pending && self.parent == Some(src) {
            self.bcast_recv_pending = false;
            if !self.children.is_empty() {
                self.start_bcast(ctx);
            }
            return true;
        }
        false
    }

    fn on_send_done(&mut self, dst: NodeId) -> bool {
        if !self.reduce_sent && self.parent == Some(dst) {
            self.reduce_sent = true;
            return true;
        }
        if self.bcast_sends_pending > 0 && self.children.contains(&dst) {
            self.bcast_sends_pending -= 1;
            return true;
        }
        false
    }

    fn done(&self) -> bool {
        self.reduce_recvs_pending == 0
            && self.reduce_sent
            && !self.bcast_recv_pending
            && self.bcast_sends_pending == 0
    }
}

#[derive(Debug)]
pub struct DoubleBinaryTreeAlgorithm {
    trees: [TreeExec; 2],
}

impl DoubleBinaryTreeAlgorithm {
    pub fn new(op: CollectiveKind, dbt: &DoubleBinaryTree, data_bytes: u64) -> Self {
        // Each tree carries half the message.
        let half = (data_bytes / 2).max(1);
        Self {
            trees: [
                TreeExec::new(&dbt.primary, op, half, 0),
                TreeExec::new(&dbt.mirror, op, half, 1),
            ],
        }
    }

    fn status(&self) -> PhaseStatus {
        if self.trees.iter().all(TreeExec::done) {
            PhaseStatus::Finished
        } else {
            PhaseStatus::InProgress
        }
    }
}

impl CollectiveAlgorithm for DoubleBinaryTreeAlgorithm {
    fn name(&self) -> &'static str {
        "doubleBinaryTree"
    }

    fn run(&mut self, ctx: &mut AlgoCtx) -> PhaseStatus {
        for tree in &mut self.trees {
            tree.start(ctx);
        }
        self.status()
    }

    fn on_recv(&mut self, ctx: &mut AlgoCtx, src: NodeId, _bytes: u64, sub_tag: u64) -> PhaseStatus {
        let tree = &mut self.trees[(sub_tag as usize).min(1)];
        let matched = tree.on_recv(ctx, src);
        debug_assert!(matched, "unmatched tree receive from {src}");
        self.status()
    }

    fn on_send_done(&mut self, _ctx: &mut AlgoCtx, dst: NodeId, sub_tag: u64) -> PhaseStatus {
        let tree = &mut self.trees[(sub_tag as usize).min(1)];
        let matched = tree.on_send_done(dst);
        debug_assert!(matched, "unmatched tree send to {dst}");
        self.status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::algorithm::{CostModel, NetOp};
    use clustersim_core::membus::MemBus;

    fn ctx(node: NodeId) -> AlgoCtx {
        AlgoCtx::new(node, 0, CostModel::default(), MemBus::new(0.0, false))
    }

    #[test]
    fn test_leaf_sends_reduction_immediately() {
        // Four ranks; rank 3 is a leaf of the primary tree (parent 1) and
        // the root of the mirror tree.
        let dbt = DoubleBinaryTree::build(0, vec![0, 1, 2, 3], 3);
        let mut algo = DoubleBinaryTreeAlgorithm::new(CollectiveKind::AllReduce, &dbt, 8192);
        let mut c = ctx(3);
        assert_eq!(algo.run(&mut c), PhaseStatus::InProgress);

        let ops = c.take_ops();
        let sends: Vec<_> = ops
            .iter()
            .filter_map(|op| match op {
                NetOp::Send { dst, sub_tag, .. } => Some((*dst, *sub_tag)),
                _ => None,
            })
            .collect();
        // Primary-tree leaf pushes its half to parent 1 right away.
        assert_eq!(sends, vec![(1, 0)]);
    }

    #[test]
    fn test_root_turns_reduction_into_broadcast() {
        let dbt = DoubleBinaryTree::build(0, vec![0, 1, 2, 3], 0);
        let mut algo = DoubleBinaryTreeAlgorithm::new(CollectiveKind::AllReduce, &dbt, 8192);
        let mut c = ctx(0);
        algo.run(&mut c);
        c.take_ops();

        // Primary root (children 1, 2) gathers both halves.
        assert_eq!(algo.on_recv(&mut c, 1, 4096, 0), PhaseStatus::InProgress);
        assert_eq!(algo.on_recv(&mut c, 2, 4096, 0), PhaseStatus::InProgress);
        let sends: Vec<_> = c
            .take_ops()
            .into_iter()
            .filter_map(|op| match op {
                NetOp::Send { dst, sub_tag, .. } => Some((dst, sub_tag)),
                _ => None,
            })
            .collect();
        assert_eq!(sends, vec![(1, 0), (2, 0)]);
    }

    #[test]
    fn test_all_gather_only_broadcasts() {
        let dbt = DoubleBinaryTree::build(0, vec![0, 1, 2, 3], 0);
        let mut algo = DoubleBinaryTreeAlgorithm::new(CollectiveKind::AllGather, &dbt, 8192);
        let mut c = ctx(0);
        algo.run(&mut c);
        let ops = c.take_ops();
        // Primary root broadcasts immediately; no reduce receives posted
        // for the primary tree.
        assert!(ops.iter().any(|op| matches!(
            op,
            NetOp::Send {
                dst: 1,
                sub_tag: 0,
                ..
            }
        )));
    }
}
