//! Thread-safe backend adapter
//!
//! Wraps any backend so it can be driven from backend-owned threads. Every
//! call takes the process-wide critical section before touching the inner
//! backend, matching the engine's locking discipline.

use clustersim_core::backend::{NetworkApi, RecvRequest, SendRequest};
use clustersim_core::error::SimResult;
use clustersim_core::event::{Event, EventKind};
use clustersim_core::sync::CriticalSection;
use clustersim_core::types::NodeId;
use parking_lot::Mutex;
use std::sync::Arc;

pub struct SharedNetwork<B: NetworkApi> {
    inner: Arc<Mutex<B>>,
    cs: Arc<CriticalSection>,
}

impl<B: NetworkApi> SharedNetwork<B> {
    pub fn new(inner: B, cs: Arc<CriticalSection>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(inner)),
            cs,
        }
    }

    pub fn handle(&self) -> Arc<Mutex<B>> {
        self.inner.clone()
    }
}

impl<B: NetworkApi> NetworkApi for SharedNetwork<B> {
    fn name(&self) -> &str {
        "shared"
    }

    fn now_ns(&self) -> u64 {
        let _guard = self.cs.enter();
        self.inner.lock().now_ns()
    }

    fn sim_send(&mut self, req: SendRequest) -> SimResult<()> {
        let _guard = self.cs.enter();
        self.inner.lock().sim_send(req)
    }

    fn sim_recv(&mut self, req: RecvRequest) -> SimResult<()> {
        let _guard = self.cs.enter();
        self.inner.lock().sim_recv(req)
    }

    fn schedule(&mut self, delay_ns: u64, target: NodeId, kind: EventKind) {
        let _guard = self.cs.enter();
        self.inner.lock().schedule(delay_ns, target, kind)
    }

    fn pop_event(&mut self) -> Option<Event> {
        let _guard = self.cs.enter();
        self.inner.lock().pop_event()
    }
}
