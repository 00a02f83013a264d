//! ClusterSim Network Backends
//!
//! Implementations of the `NetworkApi` trait:
//!
//! - **Analytical**: LogGP-style link model with per-dimension bandwidth
//!   and latency, serialized links, and a timestamped event queue. The
//!   default backend and the time authority of a run.
//! - **Shared**: a thread-safe adapter that guards any backend with the
//!   process-wide critical section for multi-threaded network models.

pub mod analytical;
pub mod shared;

pub use analytical::AnalyticalNetwork;
pub use shared::SharedNetwork;
