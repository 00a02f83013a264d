//! Per-node orchestration
//!
//! `Sys` owns one node's communication engine and workload FSM. The
//! communication engine turns collective issuances into chunk streams,
//! schedules them per dimension, serializes sends per `(dst, tag)`, runs
//! the rendezvous handshake for large messages, and advances streams as
//! the backend reports completions.

use crate::scheduler::StreamScheduler;
use crate::stream::{CollectivePhase, Stream, StreamArena, StreamBatch, StreamState};
use crate::workload::{TickCause, Workload};
use clustersim_collectives::algorithm::{AlgoCtx, CostModel, NetOp, PhaseStatus};
use clustersim_collectives::generator::PhaseGenerator;
use clustersim_collectives::planner::NcclFlowPlanner;
use clustersim_core::backend::{NetworkApi, RecvRequest, SendRequest};
use clustersim_core::config::SystemConfig;
use clustersim_core::error::{SimError, SimResult};
use clustersim_core::event::EventKind;
use clustersim_core::membus::MemBus;
use clustersim_core::topology::{GroupMap, TopologyMap};
use clustersim_core::types::{
    BatchId, GroupKind, LayerId, NodeId, SchedulingPolicy, StreamId, Tag, WorkloadPhase,
    CollectiveKind, RENDEZVOUS_CONTROL_BYTES, RENDEZVOUS_TAG_OFFSET, TAG_STRIDE,
};
use std::collections::{HashMap, VecDeque};
use tracing::{debug, trace, warn};

/// A batch completed; wake the owning layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub layer: LayerId,
    pub phase: WorkloadPhase,
    pub batch: BatchId,
    pub created_ns: u64,
    pub finished_ns: u64,
}

#[derive(Debug, Clone, Copy)]
struct PendingSend {
    bytes: u64,
    ready_at_ns: u64,
    request_id: u64,
    inflight: bool,
}

#[derive(Debug, Clone, Copy)]
struct StashedSend {
    bytes: u64,
    delay_ns: u64,
}

/// How a stream's current algorithm is entered.
enum Entry {
    Run,
    Recv { src: NodeId, bytes: u64, sub: u64 },
    SendDone { dst: NodeId, sub: u64 },
}

#[derive(Debug)]
pub struct CommEngine {
    pub node: NodeId,
    pub cfg: SystemConfig,
    pub topo: TopologyMap,
    pub groups: GroupMap,
    pub mem: MemBus,
    cost: CostModel,
    pub planner: NcclFlowPlanner,
    pub scheduler: StreamScheduler,
    pub streams: StreamArena,
    batches: HashMap<BatchId, StreamBatch>,
    ready_list: VecDeque<StreamId>,
    tag_to_stream: HashMap<Tag, StreamId>,
    pending_sends: HashMap<(NodeId, Tag), VecDeque<PendingSend>>,
    rendezvous_stash: HashMap<(NodeId, Tag), StashedSend>,
    init_queue: VecDeque<StreamId>,
    notifications: Vec<Notification>,
    /// Per-dimension link bandwidth for greedy traversal ordering.
    bandwidth: Vec<f64>,
    stream_seq: u64,
    batch_seq: u64,
    request_seq: u64,
    pub streams_injected: u64,
    pub streams_finished: u64,
}

impl CommEngine {
    pub fn new(
        node: NodeId,
        cfg: SystemConfig,
        topo: TopologyMap,
        groups: GroupMap,
        bandwidth: Vec<f64>,
        nvls_enabled: bool,
    ) -> Self {
        let num_dims = topo.dims().len();
        let mem = MemBus::new(cfg.local_mem_bw, cfg.model_shared_bus);
        let cost = CostModel {
            local_reduction_delay_ns: cfg.local_reduction_delay_ns,
        };
        let planner = NcclFlowPlanner {
            nvls_enabled,
            ..Default::default()
        };
        let scheduler = StreamScheduler::new(
            num_dims,
            cfg.intra_dimension_scheduling,
            cfg.active_chunks_per_dimension,
            cfg.max_running_streams,
        );
        Self {
            node,
            cfg,
            topo,
            groups,
            mem,
            cost,
            planner,
            scheduler,
            streams: StreamArena::new(),
            batches: HashMap::new(),
            ready_list: VecDeque::new(),
            tag_to_stream: HashMap::new(),
            pending_sends: HashMap::new(),
            rendezvous_stash: HashMap::new(),
            init_queue: VecDeque::new(),
            notifications: Vec::new(),
            bandwidth,
            stream_seq: 0,
            batch_seq: 0,
            request_seq: 0,
            streams_injected: 0,
            streams_finished: 0,
        }
    }

    /// One-shot dimension split during initialization. Mirrors the split
    /// into the traversal bandwidth table and rebuilds the queue layout.
    pub fn break_dimension(&mut self, target: usize) -> SimResult<Option<(usize, usize)>> {
        assert!(
            self.streams.is_empty(),
            "break_dimension with active streams"
        );
        let split = self.topo.break_dimension(target)?;
        if let Some((k, _)) = split {
            let bw = self.bandwidth[k];
            self.bandwidth.insert(k, bw);
            self.scheduler.rebuild(self.topo.dims().len());
        }
        Ok(split)
    }

    /// Replace the group masks after dimension splits.
    pub fn set_groups(&mut self, groups: GroupMap) {
        self.groups = groups;
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.notifications)
    }

    /// Outstanding sends queued on `(dst, tag)`; test hook.
    pub fn pending_sends_len(&self, dst: NodeId, tag: Tag) -> usize {
        self.pending_sends
            .get(&(dst, tag))
            .map_or(0, VecDeque::len)
    }

    /// Decompose a collective into chunk streams and hand them to the
    /// scheduler. Returns `None` for an inactive issuance (nothing to
    /// move), which callers treat as immediately complete.
    #[allow(clippy::too_many_arguments)]
    pub fn generate_collective(
        &mut self,
        net: &mut dyn NetworkApi,
        kind: CollectiveKind,
        bytes: u64,
        group: GroupKind,
        policy: SchedulingPolicy,
        workload_phase: WorkloadPhase,
        notifier: Option<(LayerId, WorkloadPhase)>,
    ) -> SimResult<Option<BatchId>> {
        if kind == CollectiveKind::None || bytes == 0 {
            trace!(node = self.node, "inactive collective issuance");
            return Ok(None);
        }
        let mask = self.groups.mask(group).to_vec();
        let dims = PhaseGenerator::involved_dims(&self.topo, &mask);
        if dims.is_empty() {
            debug!(
                node = self.node,
                group = group.as_str(),
                "collective with no participating dimension"
            );
            return Ok(None);
        }

        let now = net.now_ns();
        let batch_id = self.batch_seq;
        self.batch_seq += 1;
        let chunks = PhaseGenerator::split_chunks(bytes, self.cfg.preferred_dataset_splits);
        let effective_policy = match policy {
            SchedulingPolicy::None => self.cfg.scheduling_policy,
            other => other,
        };

        let mut live = 0usize;
        for (chunk_index, &chunk_bytes) in chunks.iter().enumerate() {
            let seq = self.stream_seq;
            self.stream_seq += 1;
            let order = PhaseGenerator::traversal_order(
                kind,
                self.cfg.inter_dimension_scheduling,
                dims.clone(),
                seq,
                &self.bandwidth,
            );
            let plans = PhaseGenerator::plan_chunk(
                kind,
                chunk_bytes,
                &order,
                self.cfg.collective_optimization,
            );
            if plans.is_empty() {
                warn!(node = self.node, chunk_bytes, "zero-phase chunk skipped");
                continue;
            }
            let mut phases = VecDeque::with_capacity(plans.len());
            for plan in &plans {
                let algorithm =
                    PhaseGenerator::instantiate(plan, &self.topo, &self.planner, workload_phase)?;
                phases.push_back(CollectivePhase {
                    queue_id: plan.dim,
                    op: plan.op,
                    input_bytes: plan.input_bytes,
                    algorithm,
                });
            }
            let priority = match effective_policy {
                SchedulingPolicy::Lifo => seq as i64,
                SchedulingPolicy::Fifo => -(seq as i64),
                SchedulingPolicy::Highest => i64::MAX,
                SchedulingPolicy::None => 0,
            };
            let total_phases = phases.len();
            let tag_base = seq * TAG_STRIDE;
            let id = self.streams.insert(Stream {
                id: 0,
                tag_base,
                batch: batch_id,
                chunk_index: chunk_index as u32,
                initial_data_size: chunk_bytes,
                priority,
                state: StreamState::Created,
                phases,
                total_phases,
                steps_finished: 0,
                created_ns: now,
                phase_started_ns: now,
                pair_key: (batch_id, chunk_index as u32),
            });
            self.tag_to_stream.insert(tag_base, id);
            self.ready_list.push_back(id);
            self.streams_injected += 1;
            live += 1;
        }

        if live == 0 {
            return Ok(None);
        }
        self.batches.insert(
            batch_id,
            StreamBatch {
                id: batch_id,
                created_ns: now,
                finished_ns: now,
                live_streams: live,
                notifier,
            },
        );
        debug!(
            node = self.node,
            batch = batch_id,
            kind = kind.as_str(),
            bytes,
            chunks = live,
            "collective issued"
        );
        self.try_promote(now);
        self.pump(net)?;
        Ok(Some(batch_id))
    }

    /// Promote ready-list streams into their first dimension queue while
    /// the first-phase gate and the global running bound leave room.
    fn try_promote(&mut self, now_ns: u64) {
        while let Some(&id) = self.ready_list.front() {
            if self.scheduler.first_phase_streams >= self.cfg.ready_list_threshold
                || self.scheduler.total_running_streams >= self.cfg.max_running_streams
            {
                break;
            }
            self.ready_list.pop_front();
            let Some(stream) = self.streams.get_mut(id) else {
                continue;
            };
            stream.state = StreamState::Ready;
            let dim = stream
                .current_phase()
                .expect("promoted stream without phases")
                .queue_id;
            self.scheduler.add_stream(dim, id, &self.streams);
            let started = self.scheduler.admit(dim, now_ns, &mut self.streams);
            self.init_queue.extend(started);
        }
    }

    /// Drain deferred algorithm starts.
    fn pump(&mut self, net: &mut dyn NetworkApi) -> SimResult<()> {
        while let Some(id) = self.init_queue.pop_front() {
            self.enter_stream(net, id, Entry::Run)?;
        }
        Ok(())
    }

    /// Feed one event into a stream's current algorithm and execute the
    /// network operations it produces.
    fn enter_stream(&mut self, net: &mut dyn NetworkApi, id: StreamId, entry: Entry) -> SimResult<()> {
        let (tag_base, ops, status) = {
            let Some(stream) = self.streams.get_mut(id) else {
                warn!(node = self.node, "event for a dead stream");
                return Ok(());
            };
            debug_assert_eq!(stream.state, StreamState::Executing);
            let tag_base = stream.tag_base;
            let mut ctx = AlgoCtx::new(self.node, net.now_ns(), self.cost, self.mem);
            let phase = stream
                .current_phase_mut()
                .expect("executing stream without a phase");
            let status = match entry {
                Entry::Run => phase.algorithm.run(&mut ctx),
                Entry::Recv { src, bytes, sub } => phase.algorithm.on_recv(&mut ctx, src, bytes, sub),
                Entry::SendDone { dst, sub } => phase.algorithm.on_send_done(&mut ctx, dst, sub),
            };
            (tag_base, ctx.take_ops(), status)
        };

        for op in ops {
            match op {
                NetOp::Send {
                    dst,
                    bytes,
                    delay_ns,
                    sub_tag,
                } => {
                    // Endpoint overhead is charged once per message.
                    self.send_message(
                        net,
                        dst,
                        tag_base + sub_tag,
                        bytes,
                        delay_ns + self.cfg.endpoint_delay_ns,
                    )?;
                }
                NetOp::Recv { src, bytes, sub_tag } => {
                    self.post_recv(net, src, tag_base + sub_tag, bytes)?;
                }
            }
        }

        if status == PhaseStatus::Finished {
            self.advance_stream(net, id)?;
        }
        Ok(())
    }

    /// Move a stream past its completed phase: requeue it on the next
    /// dimension or retire it and settle its batch.
    fn advance_stream(&mut self, net: &mut dyn NetworkApi, id: StreamId) -> SimResult<()> {
        let now = net.now_ns();
        let (dim, elapsed, was_first, batch_id, tag_base, next_dim) = {
            let stream = self.streams.get_mut(id).expect("advancing a dead stream");
            let phase = stream.advance().expect("advancing past the last phase");
            let was_first = stream.steps_finished == 1;
            let elapsed = now.saturating_sub(stream.phase_started_ns);
            let next_dim = stream.current_phase().map(|p| p.queue_id);
            (
                phase.queue_id,
                elapsed,
                was_first,
                stream.batch,
                stream.tag_base,
                next_dim,
            )
        };

        self.scheduler.remove_stream(dim, id, now, elapsed, was_first);

        match next_dim {
            Some(next) => {
                let stream = self.streams.get_mut(id).expect("stream vanished");
                stream.state = StreamState::Ready;
                self.scheduler.add_stream(next, id, &self.streams);
                let started = self.scheduler.admit(next, now, &mut self.streams);
                self.init_queue.extend(started);
            }
            None => {
                if let Some(stream) = self.streams.get_mut(id) {
                    stream.state = StreamState::Finished;
                }
                self.streams.remove(id);
                self.tag_to_stream.remove(&tag_base);
                self.streams_finished += 1;
                let batch = self
                    .batches
                    .get_mut(&batch_id)
                    .expect("stream without a batch");
                batch.live_streams -= 1;
                if batch.live_streams == 0 {
                    let mut batch = self.batches.remove(&batch_id).unwrap();
                    batch.finished_ns = now;
                    trace!(node = self.node, batch = batch_id, "batch drained");
                    if let Some((layer, phase)) = batch.notifier {
                        self.notifications.push(Notification {
                            layer,
                            phase,
                            batch: batch_id,
                            created_ns: batch.created_ns,
                            finished_ns: now,
                        });
                    }
                }
            }
        }

        // The finished phase freed a slot in its dimension.
        let started = self.scheduler.admit(dim, now, &mut self.streams);
        self.init_queue.extend(started);
        self.try_promote(now);
        Ok(())
    }

    /// Send path used by algorithms: rendezvous stashing for large
    /// messages, otherwise the serialized per-(dst, tag) path.
    fn send_message(
        &mut self,
        net: &mut dyn NetworkApi,
        dst: NodeId,
        tag: Tag,
        bytes: u64,
        delay_ns: u64,
    ) -> SimResult<()> {
        if bytes >= self.cfg.rendezvous_threshold && tag < RENDEZVOUS_TAG_OFFSET {
            // Hold the payload until the receiver's control message.
            self.rendezvous_stash
                .insert((dst, tag), StashedSend { bytes, delay_ns });
            net.sim_recv(RecvRequest {
                src: dst,
                dst: self.node,
                tag: tag + RENDEZVOUS_TAG_OFFSET,
                bytes: RENDEZVOUS_CONTROL_BYTES,
            })?;
            return Ok(());
        }
        self.send_serialized(net, dst, tag, bytes, delay_ns)
    }

    /// Receive path used by algorithms: a large expected message pings the
    /// sender with the 8 KB control first.
    fn post_recv(
        &mut self,
        net: &mut dyn NetworkApi,
        src: NodeId,
        tag: Tag,
        bytes: u64,
    ) -> SimResult<()> {
        if bytes >= self.cfg.rendezvous_threshold && tag < RENDEZVOUS_TAG_OFFSET {
            self.send_serialized(net, src, tag + RENDEZVOUS_TAG_OFFSET, RENDEZVOUS_CONTROL_BYTES, 0)?;
        }
        net.sim_recv(RecvRequest {
            src,
            dst: self.node,
            tag,
            bytes,
        })
    }

    /// At most one inflight send per `(dst, tag)`; later sends queue and
    /// fire on `PacketSent`.
    fn send_serialized(
        &mut self,
        net: &mut dyn NetworkApi,
        dst: NodeId,
        tag: Tag,
        bytes: u64,
        delay_ns: u64,
    ) -> SimResult<()> {
        let now = net.now_ns();
        self.request_seq += 1;
        let request_id = self.request_seq;
        let queue = self.pending_sends.entry((dst, tag)).or_default();
        if queue.is_empty() && delay_ns == 0 {
            queue.push_back(PendingSend {
                bytes,
                ready_at_ns: now,
                request_id,
                inflight: true,
            });
            net.sim_send(SendRequest {
                src: self.node,
                dst,
                tag,
                bytes,
                request_id,
            })?;
        } else {
            let was_empty = queue.is_empty();
            queue.push_back(PendingSend {
                bytes,
                ready_at_ns: now + delay_ns,
                request_id,
                inflight: false,
            });
            if was_empty {
                net.schedule(delay_ns, self.node, EventKind::PendingSendReady { dst, tag });
            }
        }
        Ok(())
    }

    /// A queued send's delay expired.
    pub fn handle_pending_ready(
        &mut self,
        net: &mut dyn NetworkApi,
        dst: NodeId,
        tag: Tag,
    ) -> SimResult<()> {
        let now = net.now_ns();
        let node = self.node;
        if let Some(queue) = self.pending_sends.get_mut(&(dst, tag)) {
            if let Some(head) = queue.front_mut() {
                if !head.inflight && head.ready_at_ns <= now {
                    head.inflight = true;
                    let req = SendRequest {
                        src: node,
                        dst,
                        tag,
                        bytes: head.bytes,
                        request_id: head.request_id,
                    };
                    net.sim_send(req)?;
                }
            }
        }
        Ok(())
    }

    /// A send fully left this node: release the serialization slot, fire
    /// the next queued send, and feed the owning algorithm.
    pub fn handle_packet_sent(
        &mut self,
        net: &mut dyn NetworkApi,
        dst: NodeId,
        tag: Tag,
    ) -> SimResult<()> {
        let now = net.now_ns();
        let node = self.node;
        let mut relaunch = None;
        let mut wake_in = None;
        let drained = {
            let queue = self.pending_sends.get_mut(&(dst, tag)).ok_or_else(|| {
                SimError::Backend(format!("send completion for unknown ({dst}, {tag})"))
            })?;
            let done = queue.pop_front().expect("send completion with empty queue");
            assert!(done.inflight, "send completion for a send that never fired");
            if let Some(next) = queue.front_mut() {
                if next.ready_at_ns <= now {
                    next.inflight = true;
                    relaunch = Some(SendRequest {
                        src: node,
                        dst,
                        tag,
                        bytes: next.bytes,
                        request_id: next.request_id,
                    });
                } else {
                    wake_in = Some(next.ready_at_ns - now);
                }
            }
            queue.is_empty()
        };
        if drained {
            self.pending_sends.remove(&(dst, tag));
        }
        if let Some(req) = relaunch {
            net.sim_send(req)?;
        }
        if let Some(delay) = wake_in {
            net.schedule(delay, node, EventKind::PendingSendReady { dst, tag });
        }

        if tag < RENDEZVOUS_TAG_OFFSET {
            let base = (tag / TAG_STRIDE) * TAG_STRIDE;
            if let Some(&sid) = self.tag_to_stream.get(&base) {
                self.enter_stream(net, sid, Entry::SendDone {
                    dst,
                    sub: tag - base,
                })?;
            }
        }
        self.pump(net)
    }

    /// A message arrived: either a rendezvous control unlocking a stashed
    /// payload, or data for a stream's algorithm.
    pub fn handle_packet_received(
        &mut self,
        net: &mut dyn NetworkApi,
        src: NodeId,
        tag: Tag,
        bytes: u64,
    ) -> SimResult<()> {
        if tag >= RENDEZVOUS_TAG_OFFSET {
            let real_tag = tag - RENDEZVOUS_TAG_OFFSET;
            match self.rendezvous_stash.remove(&(src, real_tag)) {
                Some(stash) => {
                    trace!(node = self.node, src, tag = real_tag, "rendezvous unlocked");
                    self.send_serialized(net, src, real_tag, stash.bytes, stash.delay_ns)?;
                }
                None => {
                    warn!(node = self.node, src, tag, "control message without stashed payload");
                }
            }
        } else {
            let base = (tag / TAG_STRIDE) * TAG_STRIDE;
            match self.tag_to_stream.get(&base).copied() {
                Some(sid) => {
                    self.enter_stream(net, sid, Entry::Recv {
                        src,
                        bytes,
                        sub: tag - base,
                    })?;
                }
                None => {
                    warn!(node = self.node, src, tag, "receive for a retired stream");
                }
            }
        }
        self.pump(net)
    }
}

/// One simulated node: orchestration plus its workload FSM.
pub struct Sys {
    pub id: NodeId,
    pub comm: CommEngine,
    pub workload: Workload,
}

impl Sys {
    pub fn new(id: NodeId, comm: CommEngine, workload: Workload) -> Self {
        Self { id, comm, workload }
    }

    /// Kernel event entry point. Batch completions surface as
    /// notifications after the triggering event and are fed back into the
    /// FSM before returning.
    pub fn handle_event(&mut self, kind: EventKind, net: &mut dyn NetworkApi) -> SimResult<()> {
        match kind {
            EventKind::WorkloadWait => {
                self.workload.tick(TickCause::Event, &mut self.comm, net)?;
            }
            EventKind::PacketSent { dst, tag } => {
                self.comm.handle_packet_sent(net, dst, tag)?;
            }
            EventKind::PacketReceived { src, tag, bytes } => {
                self.comm.handle_packet_received(net, src, tag, bytes)?;
            }
            EventKind::PendingSendReady { dst, tag } => {
                self.comm.handle_pending_ready(net, dst, tag)?;
            }
        }
        loop {
            let notes = self.comm.take_notifications();
            if notes.is_empty() {
                break;
            }
            for note in notes {
                self.workload
                    .tick(TickCause::CommFinished(note), &mut self.comm, net)?;
            }
        }
        Ok(())
    }
}
