//! Network backend abstraction
//!
//! The backend owns the timestamped event queue and the simulated clock.
//! The engine advances by draining events; sends and receives are handed to
//! the backend, which reports completions as `PacketSent` and
//! `PacketReceived` events targeted at the owning node.

use crate::error::SimResult;
use crate::event::{Event, EventKind};
use crate::types::{NodeId, Tag};

/// A send handed to the backend. Carries the wire tuple plus an opaque
/// request id for completion bookkeeping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SendRequest {
    pub src: NodeId,
    pub dst: NodeId,
    pub tag: Tag,
    pub bytes: u64,
    pub request_id: u64,
}

/// A posted receive. The backend matches arrivals by `(src, tag)`;
/// receives are never serialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecvRequest {
    pub src: NodeId,
    pub dst: NodeId,
    pub tag: Tag,
    pub bytes: u64,
}

/// Main network backend trait.
///
/// Implementations own simulated time; `now_ns` is the single time
/// authority of a run.
pub trait NetworkApi {
    /// Name of this backend.
    fn name(&self) -> &str;

    /// Current simulated time in nanoseconds.
    fn now_ns(&self) -> u64;

    /// Inject a message. Completion surfaces later as
    /// `PacketSent { dst, tag }` at the source and, once matched with a
    /// posted receive, `PacketReceived { src, tag, bytes }` at the
    /// destination.
    fn sim_send(&mut self, req: SendRequest) -> SimResult<()>;

    /// Post a receive expectation for `(src, tag)` at `dst`.
    fn sim_recv(&mut self, req: RecvRequest) -> SimResult<()>;

    /// Schedule an event at `now + delay_ns` targeted at `target`.
    fn schedule(&mut self, delay_ns: u64, target: NodeId, kind: EventKind);

    /// Pop the next event and advance the clock to it. `None` means the
    /// simulation has drained.
    fn pop_event(&mut self) -> Option<Event>;
}
