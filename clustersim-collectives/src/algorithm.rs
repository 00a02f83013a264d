//! The collective-algorithm contract
//!
//! Each algorithm drives one phase of one stream. The engine constructs an
//! [`AlgoCtx`] per entry, calls `run` once to start the phase and the
//! completion hooks as the backend reports progress, then drains the
//! network operations the algorithm queued. The algorithm never touches
//! the backend directly.

use clustersim_core::membus::MemBus;
use clustersim_core::types::NodeId;

/// Per-step scalar costs charged by algorithms before a send fires.
/// Endpoint overhead and wire costs belong to the engine and backend.
#[derive(Debug, Clone, Copy, Default)]
pub struct CostModel {
    pub local_reduction_delay_ns: u64,
}

/// A network operation requested by an algorithm. `sub_tag` addresses
/// per-channel flows within the owning stream's tag space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetOp {
    Send {
        dst: NodeId,
        bytes: u64,
        delay_ns: u64,
        sub_tag: u64,
    },
    Recv {
        src: NodeId,
        bytes: u64,
        sub_tag: u64,
    },
}

/// Progress of a phase after handling one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseStatus {
    InProgress,
    Finished,
}

/// Execution context handed to an algorithm for one entry.
#[derive(Debug)]
pub struct AlgoCtx {
    pub node: NodeId,
    pub now_ns: u64,
    pub cost: CostModel,
    pub mem: MemBus,
    ops: Vec<NetOp>,
}

impl AlgoCtx {
    pub fn new(node: NodeId, now_ns: u64, cost: CostModel, mem: MemBus) -> Self {
        Self {
            node,
            now_ns,
            cost,
            mem,
            ops: Vec::new(),
        }
    }

    pub fn send(&mut self, dst: NodeId, bytes: u64, delay_ns: u64) {
        self.send_tagged(dst, bytes, delay_ns, 0);
    }

    pub fn send_tagged(&mut self, dst: NodeId, bytes: u64, delay_ns: u64, sub_tag: u64) {
        self.ops.push(NetOp::Send {
            dst,
            bytes,
            delay_ns,
            sub_tag,
        });
    }

    pub fn recv(&mut self, src: NodeId, bytes: u64) {
        self.recv_tagged(src, bytes, 0);
    }

    pub fn recv_tagged(&mut self, src: NodeId, bytes: u64, sub_tag: u64) {
        self.ops.push(NetOp::Recv {
            src,
            bytes,
            sub_tag,
        });
    }

    /// Drain the operations queued so far.
    pub fn take_ops(&mut self) -> Vec<NetOp> {
        std::mem::take(&mut self.ops)
    }
}

/// One phase's state machine.
///
/// Contract: `run` is called exactly once when the stream is initialized in
/// its queue. Completion hooks return [`PhaseStatus::Finished`] when the
/// phase is done, after which the algorithm is not entered again.
pub trait CollectiveAlgorithm: std::fmt::Debug + Send {
    fn name(&self) -> &'static str;

    /// Start the phase. May finish immediately for degenerate inputs.
    fn run(&mut self, ctx: &mut AlgoCtx) -> PhaseStatus;

    /// A message from `src` matched one of this phase's receives.
    fn on_recv(&mut self, ctx: &mut AlgoCtx, src: NodeId, bytes: u64, sub_tag: u64) -> PhaseStatus;

    /// A send to `dst` fully left this node.
    fn on_send_done(&mut self, ctx: &mut AlgoCtx, dst: NodeId, sub_tag: u64) -> PhaseStatus;
}
