//! Shared identifiers, enumerations, and wire constants

use crate::error::{SimError, SimResult};
use serde::{Deserialize, Serialize};

/// Node (accelerator) identifier
pub type NodeId = usize;

/// Index of a physical topology dimension
pub type DimId = usize;

/// Index of a workload layer
pub type LayerId = usize;

/// Identifier of a chunk stream
pub type StreamId = u64;

/// Identifier of a stream batch
pub type BatchId = u64;

/// Message tag on the network wire
pub type Tag = u64;

/// Simulation cycles
pub type Cycles = u64;

/// Nanoseconds per simulation cycle. Backend time is nanoseconds; the
/// engine converts through this single constant.
pub const CLOCK_PERIOD_NS: u64 = 1;

/// Tag offset signalling a rendezvous control message.
/// Real tags must stay below this offset.
pub const RENDEZVOUS_TAG_OFFSET: Tag = 500_000_000;

/// Fixed payload of a rendezvous control message, in bytes.
pub const RENDEZVOUS_CONTROL_BYTES: u64 = 8192;

/// Minimum chunk size produced by message splitting, in bytes.
pub const MIN_CHUNK_BYTES: u64 = 4096;

/// Tag space reserved per stream; sub-tags address per-channel flows.
pub const TAG_STRIDE: u64 = 64;

/// Logical collective operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CollectiveKind {
    None,
    AllReduce,
    AllGather,
    ReduceScatter,
    AllToAll,
}

impl CollectiveKind {
    pub fn as_str(&self) -> &str {
        match self {
            CollectiveKind::None => "NONE",
            CollectiveKind::AllReduce => "ALLREDUCE",
            CollectiveKind::AllGather => "ALLGATHER",
            CollectiveKind::ReduceScatter => "REDUCESCATTER",
            CollectiveKind::AllToAll => "ALLTOALL",
        }
    }

    /// Parse a workload-file collective token, stripping an optional
    /// `_EP` or `_DP_EP` group suffix. Returns the kind and the group
    /// override if one was present.
    pub fn parse_token(token: &str) -> SimResult<(Self, Option<GroupKind>)> {
        let (base, group) = if let Some(stripped) = token.strip_suffix("_DP_EP") {
            (stripped, Some(GroupKind::DpEp))
        } else if let Some(stripped) = token.strip_suffix("_EP") {
            (stripped, Some(GroupKind::Ep))
        } else {
            (token, None)
        };

        let kind = match base {
            "NONE" => CollectiveKind::None,
            "ALLREDUCE" => CollectiveKind::AllReduce,
            "ALLGATHER" => CollectiveKind::AllGather,
            "REDUCESCATTER" => CollectiveKind::ReduceScatter,
            "ALLTOALL" => CollectiveKind::AllToAll,
            _ => return Err(SimError::config(format!("unknown collective kind '{token}'"))),
        };
        Ok((kind, group))
    }
}

/// Parallelism group a collective runs over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GroupKind {
    Tp,
    Dp,
    Ep,
    DpEp,
    Pp,
}

impl GroupKind {
    pub fn as_str(&self) -> &str {
        match self {
            GroupKind::Tp => "TP",
            GroupKind::Dp => "DP",
            GroupKind::Ep => "EP",
            GroupKind::DpEp => "DP_EP",
            GroupKind::Pp => "PP",
        }
    }
}

/// Priority policy attached to a collective issuance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SchedulingPolicy {
    Lifo,
    Fifo,
    Highest,
    /// Defer to the system-wide default policy.
    None,
}

impl SchedulingPolicy {
    pub fn parse(s: &str) -> SimResult<Self> {
        match s {
            "LIFO" => Ok(SchedulingPolicy::Lifo),
            "FIFO" => Ok(SchedulingPolicy::Fifo),
            "HIGHEST" => Ok(SchedulingPolicy::Highest),
            "None" | "NONE" => Ok(SchedulingPolicy::None),
            _ => Err(SimError::config(format!("unknown scheduling policy '{s}'"))),
        }
    }
}

/// Intra-dimension queue ordering
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IntraDimPolicy {
    Fifo,
    Rg,
    SmallestFirst,
    LessRemainingPhaseFirst,
}

impl IntraDimPolicy {
    pub fn parse(s: &str) -> SimResult<Self> {
        match s {
            "FIFO" => Ok(IntraDimPolicy::Fifo),
            "RG" => Ok(IntraDimPolicy::Rg),
            "smallestFirst" => Ok(IntraDimPolicy::SmallestFirst),
            "lessRemainingPhaseFirst" => Ok(IntraDimPolicy::LessRemainingPhaseFirst),
            _ => Err(SimError::config(format!(
                "unknown intra-dimension scheduling '{s}'"
            ))),
        }
    }
}

/// Inter-dimension traversal order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InterDimPolicy {
    Ascending,
    RoundRobin,
    OfflineGreedy,
    OfflineGreedyFlex,
}

impl InterDimPolicy {
    pub fn parse(s: &str) -> SimResult<Self> {
        match s {
            "ascending" => Ok(InterDimPolicy::Ascending),
            "roundRobin" => Ok(InterDimPolicy::RoundRobin),
            "offlineGreedy" => Ok(InterDimPolicy::OfflineGreedy),
            "offlineGreedyFlex" => Ok(InterDimPolicy::OfflineGreedyFlex),
            _ => Err(SimError::config(format!(
                "unknown inter-dimension scheduling '{s}'"
            ))),
        }
    }
}

/// Multi-dimension collective rewrite strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectiveOptimization {
    Baseline,
    LocalBwAware,
    Hierarchical,
}

impl CollectiveOptimization {
    pub fn parse(s: &str) -> SimResult<Self> {
        match s {
            "baseline" => Ok(CollectiveOptimization::Baseline),
            "localBWAware" => Ok(CollectiveOptimization::LocalBwAware),
            "hierarchical" => Ok(CollectiveOptimization::Hierarchical),
            _ => Err(SimError::config(format!(
                "unknown collective-optimization '{s}'"
            ))),
        }
    }
}

/// Single-dimension collective algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlgorithmKind {
    Ring,
    HalvingDoubling,
    DoubleBinaryTree,
    Direct,
    NcclFlowModel,
}

impl AlgorithmKind {
    pub fn as_str(&self) -> &str {
        match self {
            AlgorithmKind::Ring => "ring",
            AlgorithmKind::HalvingDoubling => "halvingDoubling",
            AlgorithmKind::DoubleBinaryTree => "doubleBinaryTree",
            AlgorithmKind::Direct => "direct",
            AlgorithmKind::NcclFlowModel => "nccl",
        }
    }

    pub fn parse(s: &str) -> SimResult<Self> {
        match s {
            "ring" => Ok(AlgorithmKind::Ring),
            "halvingDoubling" => Ok(AlgorithmKind::HalvingDoubling),
            "doubleBinaryTree" => Ok(AlgorithmKind::DoubleBinaryTree),
            "direct" => Ok(AlgorithmKind::Direct),
            "nccl" => Ok(AlgorithmKind::NcclFlowModel),
            _ => Err(SimError::config(format!(
                "unknown collective implementation '{s}'"
            ))),
        }
    }

    /// Parse a per-dimension implementation string such as
    /// `ring_doubleBinaryTree_direct`.
    pub fn parse_per_dim(s: &str) -> SimResult<Vec<Self>> {
        s.split('_').map(Self::parse).collect()
    }
}

/// Phase of a training iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WorkloadPhase {
    Forward,
    InputGrad,
    WeightGrad,
}

impl WorkloadPhase {
    pub const ALL: [WorkloadPhase; 3] = [
        WorkloadPhase::Forward,
        WorkloadPhase::InputGrad,
        WorkloadPhase::WeightGrad,
    ];

    pub fn index(&self) -> usize {
        match self {
            WorkloadPhase::Forward => 0,
            WorkloadPhase::InputGrad => 1,
            WorkloadPhase::WeightGrad => 2,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            WorkloadPhase::Forward => "forward",
            WorkloadPhase::InputGrad => "input_grad",
            WorkloadPhase::WeightGrad => "weight_grad",
        }
    }
}

/// Workload parallelization strategy from the header line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParallelStrategy {
    Data,
    HybridTransformer,
    HybridTransformerFwdInBckwd,
    HybridDlrm,
    HybridDlrmEnhanced,
    Model,
    HybridDataModel,
    HybridModelData,
    HybridCustomized,
    Micro,
    DistributedInference,
}

impl ParallelStrategy {
    pub fn as_str(&self) -> &str {
        match self {
            ParallelStrategy::Data => "DATA",
            ParallelStrategy::HybridTransformer => "HYBRID_TRANSFORMER",
            ParallelStrategy::HybridTransformerFwdInBckwd => "HYBRID_TRANSFORMER_FWD_IN_BCKWD",
            ParallelStrategy::HybridDlrm => "HYBRID_DLRM",
            ParallelStrategy::HybridDlrmEnhanced => "HYBRID_DLRM_ENHANCED",
            ParallelStrategy::Model => "MODEL",
            ParallelStrategy::HybridDataModel => "HYBRID_DATA_MODEL",
            ParallelStrategy::HybridModelData => "HYBRID_MODEL_DATA",
            ParallelStrategy::HybridCustomized => "HYBRID_CUSTOMIZED",
            ParallelStrategy::Micro => "MICRO",
            ParallelStrategy::DistributedInference => "DISTRIBUTED_INFERENCE",
        }
    }

    pub fn parse(s: &str) -> SimResult<Self> {
        match s {
            "DATA" => Ok(ParallelStrategy::Data),
            "HYBRID_TRANSFORMER" => Ok(ParallelStrategy::HybridTransformer),
            "HYBRID_TRANSFORMER_FWD_IN_BCKWD" => Ok(ParallelStrategy::HybridTransformerFwdInBckwd),
            "HYBRID_DLRM" => Ok(ParallelStrategy::HybridDlrm),
            "HYBRID_DLRM_ENHANCED" => Ok(ParallelStrategy::HybridDlrmEnhanced),
            "MODEL" => Ok(ParallelStrategy::Model),
            "HYBRID_DATA_MODEL" => Ok(ParallelStrategy::HybridDataModel),
            "HYBRID_MODEL_DATA" => Ok(ParallelStrategy::HybridModelData),
            "HYBRID_CUSTOMIZED" => Ok(ParallelStrategy::HybridCustomized),
            "MICRO" => Ok(ParallelStrategy::Micro),
            "DISTRIBUTED_INFERENCE" => Ok(ParallelStrategy::DistributedInference),
            _ => Err(SimError::config(format!("unknown workload policy '{s}'"))),
        }
    }

    /// True when the workload has a backward pass.
    pub fn has_backward(&self) -> bool {
        !matches!(
            self,
            ParallelStrategy::Micro | ParallelStrategy::DistributedInference
        )
    }
}
