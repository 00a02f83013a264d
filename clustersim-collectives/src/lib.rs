//! ClusterSim Collective Algorithms
//!
//! This crate decomposes logical collectives over a multi-dimensional
//! topology into per-dimension phases and provides the algorithms that
//! execute one phase:
//!
//! - **Ring**: N−1 step reduce-scatter / all-gather rings
//! - **HalvingDoubling**: log2(N) recursive halving/doubling exchanges
//! - **DoubleBinaryTree**: two overlaid binary trees with bandwidth parity
//! - **AllToAllDirect**: pairwise exchanges with an optional partner window
//! - **NcclFlowModel**: pre-planned flow DAGs reproducing NCCL ring, tree,
//!   and NVLS behavior
//!
//! Algorithms are micro state machines: the engine feeds them completion
//! events and drains the send/receive requests they emit.

pub mod algorithm;
pub mod all_to_all;
pub mod double_binary_tree;
pub mod flow_model;
pub mod generator;
pub mod halving_doubling;
pub mod planner;
pub mod ring;

pub use algorithm::{AlgoCtx, CollectiveAlgorithm, CostModel, NetOp, PhaseStatus};
pub use all_to_all::AllToAllDirect;
pub use double_binary_tree::DoubleBinaryTreeAlgorithm;
pub use flow_model::{FlowModel, NcclFlowAlgorithm, SingleFlow};
pub use generator::{PhaseGenerator, PhasePlan};
pub use halving_doubling::HalvingDoubling;
pub use planner::{NcclAlgoChoice, NcclFlowPlanner};
pub use ring::RingAlgorithm;

/// Prelude for common collective imports
pub mod prelude {
    pub use crate::algorithm::{AlgoCtx, CollectiveAlgorithm, CostModel, NetOp, PhaseStatus};
    pub use crate::generator::{PhaseGenerator, PhasePlan};
    pub use crate::planner::{NcclAlgoChoice, NcclFlowPlanner};
}
