//! ClusterSim Core Library
//!
//! This crate provides the core types, traits, and utilities for the
//! ClusterSim distributed-training simulator. It defines the network backend
//! abstraction that allows the simulation engine to run against multiple
//! network models:
//!
//! - Analytical LogGP-style link model (default)
//! - Packet-level simulators implementing the same trait
//!
//! # Architecture
//!
//! The core consists of:
//!
//! - **Network Trait**: abstract interface for network backends, which own
//!   the event queue and the simulated clock
//! - **Topology**: physical dimension vector plus per-operation logical
//!   topologies (ring, binary tree, double binary tree, direct)
//! - **Memory Bus**: scalar cost model for local reads and writes
//! - **Configuration**: system and network configuration files
//! - **Errors**: the single fatal-error surface of the simulator

pub mod backend;
pub mod config;
pub mod error;
pub mod event;
pub mod membus;
pub mod sync;
pub mod topology;
pub mod types;

// Re-exports for convenience
pub use backend::{NetworkApi, RecvRequest, SendRequest};
pub use config::{LogGpParams, NetworkConfig, SystemConfig};
pub use error::{SimError, SimResult};
pub use event::{Event, EventKind};
pub use membus::MemBus;
pub use sync::CriticalSection;
pub use topology::{
    BinaryTree, DirectTopology, DoubleBinaryTree, LogicalTopology, RingTopology, TopologyMap,
};
pub use types::{
    AlgorithmKind, BatchId, CollectiveKind, CollectiveOptimization, Cycles, DimId, GroupKind,
    IntraDimPolicy, InterDimPolicy, LayerId, NodeId, ParallelStrategy, SchedulingPolicy, StreamId,
    Tag, WorkloadPhase, CLOCK_PERIOD_NS, MIN_CHUNK_BYTES, RENDEZVOUS_CONTROL_BYTES,
    RENDEZVOUS_TAG_OFFSET, TAG_STRIDE,
};

/// Prelude module for common imports
pub mod prelude {
    pub use crate::backend::{NetworkApi, RecvRequest, SendRequest};
    pub use crate::config::{LogGpParams, NetworkConfig, SystemConfig};
    pub use crate::error::{SimError, SimResult};
    pub use crate::event::{Event, EventKind};
    pub use crate::membus::MemBus;
    pub use crate::topology::{LogicalTopology, TopologyMap};
    pub use crate::types::*;
}
