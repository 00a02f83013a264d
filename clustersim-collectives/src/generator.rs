//! Phase generation
//!
//! Decomposes one logical collective over the involved dimensions into
//! chunks, a dimension traversal order, and per-chunk phase lists, and
//! instantiates the algorithm bound to each phase.

use crate::algorithm::CollectiveAlgorithm;
use crate::all_to_all::AllToAllDirect;
use crate::double_binary_tree::DoubleBinaryTreeAlgorithm;
use crate::flow_model::NcclFlowAlgorithm;
use crate::halving_doubling::HalvingDoubling;
use crate::planner::NcclFlowPlanner;
use crate::ring::RingAlgorithm;
use clustersim_core::error::{SimError, SimResult};
use clustersim_core::topology::{LogicalTopology, TopologyMap};
use clustersim_core::types::{
    AlgorithmKind, CollectiveKind, CollectiveOptimization, DimId, InterDimPolicy, WorkloadPhase,
    MIN_CHUNK_BYTES,
};
use tracing::trace;

/// One single-dimension phase of a chunk, before algorithm binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhasePlan {
    pub dim: DimId,
    pub op: CollectiveKind,
    pub input_bytes: u64,
}

pub struct PhaseGenerator;

impl PhaseGenerator {
    /// Split a message into chunks that sum back to the original size.
    /// The chunk count follows `preferred_splits` but chunks never drop
    /// below the minimum chunk size.
    pub fn split_chunks(total_bytes: u64, preferred_splits: usize) -> Vec<u64> {
        if total_bytes == 0 {
            return Vec::new();
        }
        let max_chunks = (total_bytes / MIN_CHUNK_BYTES).max(1);
        let count = (preferred_splits.max(1) as u64).min(max_chunks);
        let base = total_bytes / count;
        let rem = total_bytes % count;
        (0..count)
            .map(|i| if i < rem { base + 1 } else { base })
            .collect()
    }

    /// Involved dimensions with their sizes, skipping dimensions whose
    /// size is 1 or that the mask excludes.
    pub fn involved_dims(topo: &TopologyMap, mask: &[bool]) -> Vec<(DimId, usize)> {
        topo.dims()
            .iter()
            .enumerate()
            .filter(|&(d, &size)| size > 1 && mask.get(d).copied().unwrap_or(false))
            .map(|(d, &size)| (d, size))
            .collect()
    }

    /// Dimension traversal order for one chunk stream.
    ///
    /// `bandwidth` is indexed by physical dimension; an empty slice means
    /// uniform links.
    pub fn traversal_order(
        kind: CollectiveKind,
        policy: InterDimPolicy,
        mut dims: Vec<(DimId, usize)>,
        stream_index: u64,
        bandwidth: &[f64],
    ) -> Vec<(DimId, usize)> {
        if dims.len() <= 1 {
            return dims;
        }
        // All-gathers walk the dimensions outside-in.
        if kind == CollectiveKind::AllGather {
            dims.reverse();
        }
        let bw = |d: DimId| bandwidth.get(d).copied().unwrap_or(1.0);
        match policy {
            InterDimPolicy::Ascending => dims,
            InterDimPolicy::RoundRobin => {
                let k = (stream_index as usize) % dims.len();
                dims.rotate_left(k);
                dims
            }
            InterDimPolicy::OfflineGreedy => {
                dims.sort_by(|a, b| bw(b.0).total_cmp(&bw(a.0)));
                dims
            }
            InterDimPolicy::OfflineGreedyFlex => {
                dims.sort_by(|a, b| bw(b.0).total_cmp(&bw(a.0)));
                // Rotate within runs of equal bandwidth so concurrent
                // streams spread over equivalent dimensions.
                let mut start = 0;
                while start < dims.len() {
                    let mut end = start + 1;
                    while end < dims.len() && (bw(dims[end].0) - bw(dims[start].0)).abs() < 1e-9 {
                        end += 1;
                    }
                    let run = end - start;
                    if run > 1 {
                        dims[start..end].rotate_left((stream_index as usize) % run);
                    }
                    start = end;
                }
                dims
            }
        }
    }

    /// Build the ordered phase list of one chunk.
    pub fn plan_chunk(
        kind: CollectiveKind,
        chunk_bytes: u64,
        ordered: &[(DimId, usize)],
        optimization: CollectiveOptimization,
    ) -> Vec<PhasePlan> {
        let mut phases = Vec::new();
        if ordered.is_empty() || chunk_bytes == 0 {
            return phases;
        }
        let push = |phases: &mut Vec<PhasePlan>, dim, op, bytes: u64| {
            phases.push(PhasePlan {
                dim,
                op,
                input_bytes: bytes.max(1),
            });
        };
        match (kind, optimization) {
            (CollectiveKind::AllReduce, CollectiveOptimization::LocalBwAware) => {
                let mut cur = chunk_bytes;
                for &(dim, size) in ordered {
                    push(&mut phases, dim, CollectiveKind::ReduceScatter, cur);
                    cur /= size as u64;
                }
                for &(dim, size) in ordered.iter().rev() {
                    push(&mut phases, dim, CollectiveKind::AllGather, cur);
                    cur *= size as u64;
                }
            }
            (CollectiveKind::AllReduce, CollectiveOptimization::Hierarchical)
                if ordered.len() > 1 =>
            {
                let (last, firsts) = ordered.split_last().unwrap();
                let mut cur = chunk_bytes;
                for &(dim, size) in firsts {
                    push(&mut phases, dim, CollectiveKind::ReduceScatter, cur);
                    cur /= size as u64;
                }
                push(&mut phases, last.0, CollectiveKind::AllReduce, cur);
                for &(dim, size) in firsts.iter().rev() {
                    push(&mut phases, dim, CollectiveKind::AllGather, cur);
                    cur *= size as u64;
                }
            }
            (CollectiveKind::AllReduce, _) => {
                for &(dim, _) in ordered {
                    push(&mut phases, dim, CollectiveKind::AllReduce, chunk_bytes);
                }
            }
            (CollectiveKind::AllGather, _) => {
                let mut cur = chunk_bytes;
                for &(dim, size) in ordered {
                    push(&mut phases, dim, CollectiveKind::AllGather, cur);
                    cur *= size as u64;
                }
            }
            (CollectiveKind::ReduceScatter, _) => {
                let mut cur = chunk_bytes;
                for &(dim, size) in ordered {
                    push(&mut phases, dim, CollectiveKind::ReduceScatter, cur);
                    cur /= size as u64;
                }
            }
            (CollectiveKind::AllToAll, _) => {
                for &(dim, _) in ordered {
                    push(&mut phases, dim, CollectiveKind::AllToAll, chunk_bytes);
                }
            }
            (CollectiveKind::None, _) => {}
        }
        trace!(kind = kind.as_str(), phases = phases.len(), "planned chunk");
        phases
    }

    /// Bind a phase to its algorithm instance according to the
    /// per-dimension implementation configuration.
    pub fn instantiate(
        phase: &PhasePlan,
        topo: &TopologyMap,
        planner: &NcclFlowPlanner,
        workload_phase: WorkloadPhase,
    ) -> SimResult<Box<dyn CollectiveAlgorithm>> {
        let algo = topo.algorithm(phase.op, phase.dim);
        let logical = topo.logical(phase.op, phase.dim);
        match (algo, logical) {
            (AlgorithmKind::Ring, LogicalTopology::Ring(ring)) => {
                Ok(Box::new(RingAlgorithm::new(phase.op, ring, phase.input_bytes)))
            }
            (AlgorithmKind::HalvingDoubling, LogicalTopology::Ring(ring)) => {
                if ring.size().is_power_of_two() {
                    Ok(Box::new(HalvingDoubling::new(
                        phase.op,
                        ring,
                        phase.input_bytes,
                    )))
                } else {
                    // Non-power-of-two groups fall back to the ring.
                    Ok(Box::new(RingAlgorithm::new(phase.op, ring, phase.input_bytes)))
                }
            }
            (AlgorithmKind::DoubleBinaryTree, LogicalTopology::Tree(dbt)) => Ok(Box::new(
                DoubleBinaryTreeAlgorithm::new(phase.op, dbt, phase.input_bytes),
            )),
            (AlgorithmKind::Direct, LogicalTopology::Direct(direct)) => {
                Ok(Box::new(AllToAllDirect::new(direct, phase.input_bytes, 0)))
            }
            (AlgorithmKind::NcclFlowModel, LogicalTopology::Direct(direct)) => {
                if phase.op == CollectiveKind::AllToAll {
                    // NCCL runs all-to-all as direct point-to-points.
                    return Ok(Box::new(AllToAllDirect::new(direct, phase.input_bytes, 0)));
                }
                let model = planner.plan(
                    phase.op,
                    &direct.members,
                    direct.index,
                    phase.input_bytes,
                    workload_phase,
                );
                model.validate(direct.members[direct.index])?;
                Ok(Box::new(NcclFlowAlgorithm::new(
                    direct.members[direct.index],
                    model,
                )))
            }
            (algo, _) => Err(SimError::config(format!(
                "implementation '{}' does not match the logical topology on dim {}",
                algo.as_str(),
                phase.dim
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clustersim_core::topology::PerOpAlgorithms;
    use std::collections::HashMap;

    #[test]
    fn test_chunks_sum_to_total_and_respect_minimum() {
        let chunks = PhaseGenerator::split_chunks(100_000, 8);
        assert_eq!(chunks.iter().sum::<u64>(), 100_000);
        assert_eq!(chunks.len(), 8);

        // A tiny message cannot split below the minimum chunk.
        let chunks = PhaseGenerator::split_chunks(6000, 8);
        assert_eq!(chunks, vec![6000]);

        let chunks = PhaseGenerator::split_chunks(16384, 8);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|&c| c >= MIN_CHUNK_BYTES));
        assert_eq!(chunks.iter().sum::<u64>(), 16384);
    }

    #[test]
    fn test_traversal_orders() {
        let dims = vec![(0, 2), (1, 4), (2, 8)];
        let fwd = PhaseGenerator::traversal_order(
            CollectiveKind::ReduceScatter,
            InterDimPolicy::Ascending,
            dims.clone(),
            0,
            &[],
        );
        assert_eq!(fwd, dims);

        let rev = PhaseGenerator::traversal_order(
            CollectiveKind::AllGather,
            InterDimPolicy::Ascending,
            dims.clone(),
            0,
            &[],
        );
        assert_eq!(rev, vec![(2, 8), (1, 4), (0, 2)]);

        let rot = PhaseGenerator::traversal_order(
            CollectiveKind::AllReduce,
            InterDimPolicy::RoundRobin,
            dims.clone(),
            4,
            &[],
        );
        assert_eq!(rot, vec![(1, 4), (2, 8), (0, 2)]);

        let greedy = PhaseGenerator::traversal_order(
            CollectiveKind::AllReduce,
            InterDimPolicy::OfflineGreedy,
            dims.clone(),
            0,
            &[25.0, 400.0, 100.0],
        );
        assert_eq!(greedy, vec![(1, 4), (2, 8), (0, 2)]);
    }

    #[test]
    fn test_local_bw_aware_rewrite() {
        let phases = PhaseGenerator::plan_chunk(
            CollectiveKind::AllReduce,
            1 << 20,
            &[(0, 4), (1, 2)],
            CollectiveOptimization::LocalBwAware,
        );
        let ops: Vec<_> = phases.iter().map(|p| (p.dim, p.op, p.input_bytes)).collect();
        assert_eq!(
            ops,
            vec![
                (0, CollectiveKind::ReduceScatter, 1 << 20),
                (1, CollectiveKind::ReduceScatter, 1 << 18),
                (1, CollectiveKind::AllGather, 1 << 17),
                (0, CollectiveKind::AllGather, 1 << 18),
            ]
        );
    }

    #[test]
    fn test_hierarchical_rewrite() {
        let phases = PhaseGenerator::plan_chunk(
            CollectiveKind::AllReduce,
            1 << 20,
            &[(0, 4), (1, 2)],
            CollectiveOptimization::Hierarchical,
        );
        let ops: Vec<_> = phases.iter().map(|p| (p.dim, p.op)).collect();
        assert_eq!(
            ops,
            vec![
                (0, CollectiveKind::ReduceScatter),
                (1, CollectiveKind::AllReduce),
                (0, CollectiveKind::AllGather),
            ]
        );
    }

    /// Bytes one node moves for a single ring phase.
    fn ring_moved_bytes(op: CollectiveKind, n: u64, input: u64) -> f64 {
        match op {
            CollectiveKind::AllReduce => (2 * (n - 1)) as f64 * (input as f64 / n as f64),
            CollectiveKind::ReduceScatter => (n - 1) as f64 * (input as f64 / n as f64),
            CollectiveKind::AllGather => (n - 1) as f64 * input as f64,
            _ => 0.0,
        }
    }

    #[test]
    fn test_local_bw_aware_moves_direct_all_reduce_bytes() {
        // The staged reduce-scatter/all-gather sweep moves the same bytes
        // as one direct all-reduce ring over the full group.
        let bytes = 1 << 20;
        let dims = [(0usize, 4usize), (1usize, 2usize)];
        let phases = PhaseGenerator::plan_chunk(
            CollectiveKind::AllReduce,
            bytes,
            &dims,
            CollectiveOptimization::LocalBwAware,
        );
        let staged: f64 = phases
            .iter()
            .map(|p| {
                let size = dims.iter().find(|d| d.0 == p.dim).unwrap().1 as u64;
                ring_moved_bytes(p.op, size, p.input_bytes)
            })
            .sum();
        let direct = ring_moved_bytes(CollectiveKind::AllReduce, 8, bytes);
        approx::assert_relative_eq!(staged, direct, max_relative = 1e-9);
    }

    #[test]
    fn test_involved_dims_skips_singletons() {
        let mut per_op: PerOpAlgorithms = HashMap::new();
        for op in [
            CollectiveKind::AllReduce,
            CollectiveKind::AllGather,
            CollectiveKind::ReduceScatter,
            CollectiveKind::AllToAll,
        ] {
            per_op.insert(op, vec![AlgorithmKind::Ring]);
        }
        let topo = TopologyMap::new(0, vec![4, 1, 2], per_op).unwrap();
        let dims = PhaseGenerator::involved_dims(&topo, &[true, true, true]);
        assert_eq!(dims, vec![(0, 4), (2, 2)]);
        let dims = PhaseGenerator::involved_dims(&topo, &[false, true, true]);
        assert_eq!(dims, vec![(2, 2)]);
    }
}
