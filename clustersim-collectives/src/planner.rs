//! NCCL flow planner
//!
//! Produces per-rank send/recv plans reproducing NCCL's ring, tree, and
//! NVLS schedules. Plans are pure functions of their inputs: the same
//! operation, rank set, channel count, and size always yield an identical
//! plan.

use crate::flow_model::{FlowModel, SingleFlow};
use clustersim_core::types::{CollectiveKind, NodeId, WorkloadPhase};
use serde::{Deserialize, Serialize};

/// Protocol/algorithm family chosen for one collective.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NcclAlgoChoice {
    Ring,
    Tree,
    Nvls,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NcclFlowPlanner {
    pub channels: u32,
    pub nvls_enabled: bool,
    /// Messages up to this size ride the LL/LL128 tree path.
    pub ll_max_bytes: u64,
    /// AllReduce messages of at least this size use NVLS when enabled.
    pub nvls_min_bytes: u64,
}

impl Default for NcclFlowPlanner {
    fn default() -> Self {
        Self {
            channels: 2,
            nvls_enabled: false,
            ll_max_bytes: 1 << 16,
            nvls_min_bytes: 4 << 20,
        }
    }
}

impl NcclFlowPlanner {
    /// Pick the schedule family for one collective. During the weight
    /// gradient the tree window shrinks so large backward all-reduces
    /// stay on rings.
    pub fn choose(&self, op: CollectiveKind, bytes: u64, phase: WorkloadPhase) -> NcclAlgoChoice {
        if op != CollectiveKind::AllReduce {
            return NcclAlgoChoice::Ring;
        }
        if self.nvls_enabled && bytes >= self.nvls_min_bytes {
            return NcclAlgoChoice::Nvls;
        }
        let tree_max = if phase == WorkloadPhase::WeightGrad {
            self.ll_max_bytes / 4
        } else {
            self.ll_max_bytes
        };
        if bytes <= tree_max {
            NcclAlgoChoice::Tree
        } else {
            NcclAlgoChoice::Ring
        }
    }

    /// Plan one rank's flows for `op` over `ranks`.
    pub fn plan(
        &self,
        op: CollectiveKind,
        ranks: &[NodeId],
        me_index: usize,
        bytes: u64,
        phase: WorkloadPhase,
    ) -> FlowModel {
        if ranks.len() < 2 {
            return FlowModel::default();
        }
        match self.choose(op, bytes, phase) {
            NcclAlgoChoice::Ring => self.plan_ring(op, ranks, me_index, bytes),
            NcclAlgoChoice::Tree => self.plan_tree(ranks, me_index, bytes),
            NcclAlgoChoice::Nvls => self.plan_nvls(ranks, me_index, bytes),
        }
    }

    /// Per-channel ring: 2(N−1) chunk sends for AllReduce, N−1 for the
    /// one-sided operations. A send depends on the previous step's send
    /// and receive on the same channel, and the first send of a channel
    /// on the previous channel's terminal chunk.
    fn plan_ring(
        &self,
        op: CollectiveKind,
        ranks: &[NodeId],
        me_index: usize,
        bytes: u64,
    ) -> FlowModel {
        let n = ranks.len();
        let next = ranks[(me_index + 1) % n];
        let prev = ranks[(me_index + n - 1) % n];
        let steps = match op {
            CollectiveKind::AllReduce => 2 * (n - 1),
            _ => n - 1,
        };
        let reduce_steps = match op {
            CollectiveKind::AllReduce | CollectiveKind::ReduceScatter => n - 1,
            _ => 0,
        };
        let chunk = (bytes / self.channels as u64 / n as u64).max(1);

        let mut flows = Vec::new();
        let mut prev_terminal_send: Option<usize> = None;
        for c in 0..self.channels {
            let mut last_send: Option<usize> = None;
            let mut last_recv: Option<usize> = None;
            for s in 0..steps {
                let recv_id = flows.len();
                flows.push(SingleFlow {
                    id: recv_id,
                    src: prev,
                    dst: ranks[me_index],
                    bytes: chunk,
                    parents: last_recv.into_iter().collect(),
                    children: vec![],
                    channel: c,
                    reduce: false,
                });
                let send_id = flows.len();
                let mut parents: Vec<usize> = last_send.into_iter().collect();
                if let Some(r) = last_recv {
                    parents.push(r);
                }
                if s == 0 {
                    if let Some(t) = prev_terminal_send {
                        parents.push(t);
                    }
                }
                flows.push(SingleFlow {
                    id: send_id,
                    src: ranks[me_index],
                    dst: next,
                    bytes: chunk,
                    parents,
                    children: vec![],
                    channel: c,
                    reduce: s > 0 && s <= reduce_steps,
                });
                last_recv = Some(recv_id);
                last_send = Some(send_id);
            }
            prev_terminal_send = last_send;
        }
        Self::link_children(&mut flows);
        FlowModel { flows }
    }

    /// Balanced binary tree over rank positions: up-phase flows depend on
    /// the receives from this rank's children, down-phase flows on the
    /// up-phase send (or, at the root, the up-phase receives). Odd
    /// channels use the mirrored tree for bandwidth parity.
    fn plan_tree(&self, ranks: &[NodeId], me_index: usize, bytes: u64) -> FlowModel {
        let n = ranks.len();
        let per_channel = (bytes / self.channels as u64).max(1);
        let mut flows = Vec::new();
        for c in 0..self.channels {
            let pos = if c % 2 == 0 { me_index } else { n - 1 - me_index };
            let at = |p: usize| -> NodeId {
                if c % 2 == 0 {
                    ranks[p]
                } else {
                    ranks[n - 1 - p]
                }
            };
            let parent = if pos == 0 { None } else { Some(at((pos - 1) / 2)) };
            let children: Vec<NodeId> = [2 * pos + 1, 2 * pos + 2]
                .into_iter()
                .filter(|&child| child < n)
                .map(at)
                .collect();

            let mut up_recv_ids = Vec::new();
            for &child in &children {
                let id = flows.len();
                flows.push(SingleFlow {
                    id,
                    src: child,
                    dst: ranks[me_index],
                    bytes: per_channel,
                    parents: vec![],
                    children: vec![],
                    channel: c,
                    reduce: false,
                });
                up_recv_ids.push(id);
            }
            let mut down_parents = up_recv_ids.clone();
            if let Some(parent) = parent {
                let up_send = flows.len();
                flows.push(SingleFlow {
                    id: up_send,
                    src: ranks[me_index],
                    dst: parent,
                    bytes: per_channel,
                    parents: up_recv_ids,
                    children: vec![],
                    channel: c,
                    reduce: true,
                });
                let down_recv = flows.len();
                flows.push(SingleFlow {
                    id: down_recv,
                    src: parent,
                    dst: ranks[me_index],
                    bytes: per_channel,
                    parents: vec![up_send],
                    children: vec![],
                    channel: c,
                    reduce: false,
                });
                down_parents = vec![down_recv];
            }
            for &child in &children {
                let id = flows.len();
                flows.push(SingleFlow {
                    id,
                    src: ranks[me_index],
                    dst: child,
                    bytes: per_channel,
                    parents: down_parents.clone(),
                    children: vec![],
                    channel: c,
                    reduce: false,
                });
            }
        }
        Self::link_children(&mut flows);
        FlowModel { flows }
    }

    /// Single-hop fan-in/fan-out through the lowest rank acting as the
    /// logical switch.
    fn plan_nvls(&self, ranks: &[NodeId], me_index: usize, bytes: u64) -> FlowModel {
        let switch = *ranks.iter().min().unwrap();
        let me = ranks[me_index];
        let mut flows = Vec::new();
        if me == switch {
            let mut fan_in = Vec::new();
            for &r in ranks {
                if r == switch {
                    continue;
                }
                let id = flows.len();
                flows.push(SingleFlow {
                    id,
                    src: r,
                    dst: switch,
                    bytes,
                    parents: vec![],
                    children: vec![],
                    channel: 0,
                    reduce: false,
                });
                fan_in.push(id);
            }
            for &r in ranks {
                if r == switch {
                    continue;
                }
                let id = flows.len();
                flows.push(SingleFlow {
                    id,
                    src: switch,
                    dst: r,
                    bytes,
                    parents: fan_in.clone(),
                    children: vec![],
                    channel: 0,
                    reduce: true,
                });
            }
        } else {
            flows.push(SingleFlow {
                id: 0,
                src: me,
                dst: switch,
                bytes,
                parents: vec![],
                children: vec![],
                channel: 0,
                reduce: false,
            });
            flows.push(SingleFlow {
                id: 1,
                src: switch,
                dst: me,
                bytes,
                parents: vec![0],
                children: vec![],
                channel: 0,
                reduce: false,
            });
        }
        Self::link_children(&mut flows);
        FlowModel { flows }
    }

    fn link_children(flows: &mut [SingleFlow]) {
        for i in 0..flows.len() {
            let parents = flows[i].parents.clone();
            for p in parents {
                flows[p].children.push(i);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_choice_by_size_and_phase() {
        let planner = NcclFlowPlanner {
            nvls_enabled: true,
            ..Default::default()
        };
        let fwd = WorkloadPhase::Forward;
        let wg = WorkloadPhase::WeightGrad;
        assert_eq!(
            planner.choose(CollectiveKind::AllReduce, 1024, fwd),
            NcclAlgoChoice::Tree
        );
        assert_eq!(
            planner.choose(CollectiveKind::AllReduce, 1 << 20, fwd),
            NcclAlgoChoice::Ring
        );
        assert_eq!(
            planner.choose(CollectiveKind::AllReduce, 8 << 20, fwd),
            NcclAlgoChoice::Nvls
        );
        // The tree window shrinks in the weight gradient.
        assert_eq!(
            planner.choose(CollectiveKind::AllReduce, 1 << 15, wg),
            NcclAlgoChoice::Ring
        );
        assert_eq!(
            planner.choose(CollectiveKind::AllGather, 1024, fwd),
            NcclAlgoChoice::Ring
        );
    }

    #[test]
    fn test_ring_plan_shape_and_determinism() {
        let planner = NcclFlowPlanner::default();
        let ranks = vec![0, 1, 2, 3];
        let a = planner.plan(
            CollectiveKind::AllReduce,
            &ranks,
            1,
            1 << 20,
            WorkloadPhase::Forward,
        );
        let b = planner.plan(
            CollectiveKind::AllReduce,
            &ranks,
            1,
            1 << 20,
            WorkloadPhase::Forward,
        );
        assert_eq!(a, b);
        a.validate(1).unwrap();
        // 2 channels x 2(N-1) steps x (send + recv).
        assert_eq!(a.flows.len(), 2 * 6 * 2);
        // First send of channel 1 depends on channel 0's terminal send.
        let first_c1_send = a
            .flows
            .iter()
            .find(|f| f.channel == 1 && f.src == 1)
            .unwrap();
        let terminal_c0_send = a
            .flows
            .iter()
            .filter(|f| f.channel == 0 && f.src == 1)
            .last()
            .unwrap();
        assert!(first_c1_send.parents.contains(&terminal_c0_send.id));
    }

    #[test]
    fn test_tree_plan_validates_everywhere() {
        let planner = NcclFlowPlanner::default();
        let ranks: Vec<NodeId> = (0..8).collect();
        for me in 0..8 {
            let plan = planner.plan(
                CollectiveKind::AllReduce,
                &ranks,
                me,
                1024,
                WorkloadPhase::Forward,
            );
            plan.validate(me).unwrap();
            assert!(!plan.flows.is_empty());
        }
    }

    #[test]
    fn test_nvls_switch_fans_in_and_out() {
        let planner = NcclFlowPlanner {
            nvls_enabled: true,
            ..Default::default()
        };
        let ranks = vec![4, 5, 6, 7];
        let hub = planner.plan(
            CollectiveKind::AllReduce,
            &ranks,
            0,
            8 << 20,
            WorkloadPhase::Forward,
        );
        hub.validate(4).unwrap();
        // Three in, three out.
        assert_eq!(hub.flows.len(), 6);
        let leaf = planner.plan(
            CollectiveKind::AllReduce,
            &ranks,
            2,
            8 << 20,
            WorkloadPhase::Forward,
        );
        assert_eq!(leaf.flows.len(), 2);
        assert_eq!(leaf.flows[0].dst, 4);
    }
}
