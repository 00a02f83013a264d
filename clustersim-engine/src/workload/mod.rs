//! Per-node workload FSM
//!
//! Walks the layers of a training iteration through `total_pass`
//! iterations: forward passes ascending, then input-gradient and
//! weight-gradient passes descending, with activation recomputation from
//! the nearest checkpoint where the workload marks a trigger layer.
//!
//! The FSM is cooperative: `tick` is re-entered by kernel events and
//! returns at its suspension points — after scheduling a compute delay,
//! after issuing a blocking collective, and when a dependency check fails.

pub mod parser;

pub use parser::{default_group, LayerSpec, PhaseSpec, WorkloadSpec};

use crate::sys::{CommEngine, Notification};
use clustersim_core::backend::NetworkApi;
use clustersim_core::error::{SimError, SimResult};
use clustersim_core::event::EventKind;
use clustersim_core::types::{
    BatchId, GroupKind, LayerId, NodeId, ParallelStrategy, SchedulingPolicy, WorkloadPhase,
    CLOCK_PERIOD_NS, MIN_CHUNK_BYTES,
};
use std::collections::HashMap;
use tracing::{debug, info};

/// One workload layer with its runtime bookkeeping.
#[derive(Debug)]
pub struct Layer {
    pub name: String,
    pub phases: [PhaseSpec; 3],
    pub weight_grad_update_cycles: u64,
    pub is_checkpoint: bool,
    pub needs_recompute_trigger: bool,
    /// Outstanding batches per phase, batch id to issue time.
    outstanding: [HashMap<BatchId, u64>; 3],
    /// At most one phase has an active waiter at any time.
    waiting_since: [Option<u64>; 3],
    pub exposed_comm_ns: [u64; 3],
    pub total_comm_ns: [u64; 3],
    pub total_compute_ns: [u64; 3],
}

impl Layer {
    fn from_spec(spec: &LayerSpec, is_checkpoint: bool, needs_recompute_trigger: bool) -> Self {
        Self {
            name: spec.name.clone(),
            phases: spec.phases,
            weight_grad_update_cycles: spec.weight_grad_update_cycles,
            is_checkpoint,
            needs_recompute_trigger,
            outstanding: Default::default(),
            waiting_since: [None; 3],
            exposed_comm_ns: [0; 3],
            total_comm_ns: [0; 3],
            total_compute_ns: [0; 3],
        }
    }

    pub fn comm_finished(&self, phase: WorkloadPhase) -> bool {
        self.outstanding[phase.index()].is_empty()
    }

    pub fn group(&self, phase: WorkloadPhase) -> GroupKind {
        self.phases[phase.index()].group
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsmState {
    ForwardPass,
    InputGradient,
    WeightGradient,
    ForwardInBackPass { trigger: usize },
    WaitForSimFinish,
}

/// What re-entered the FSM.
#[derive(Debug, Clone, Copy)]
pub enum TickCause {
    /// A kernel event (initial kick or an expired compute delay).
    Event,
    /// A collective batch drained.
    CommFinished(Notification),
}

#[derive(Debug)]
pub struct Workload {
    node: NodeId,
    pub layers: Vec<Layer>,
    pub strategy: ParallelStrategy,
    pub state: FsmState,
    index: i64,
    pub pass: u64,
    pub total_pass: u64,
    delay_loaded: bool,
    collective_issued: bool,
    checkpoint_initiated: bool,
    awaiting_compute: bool,
    waiting_for: Option<(LayerId, WorkloadPhase)>,
    pub finished: bool,
    pub finish_time_ns: u64,
    pub pp_stages: usize,
    pub num_microbatches: usize,
}

impl Workload {
    pub fn new(node: NodeId, spec: &WorkloadSpec, total_pass: u64) -> Self {
        let layers = spec
            .layers
            .iter()
            .enumerate()
            .map(|(i, l)| {
                Layer::from_spec(
                    l,
                    spec.checkpoints.contains(&i),
                    spec.checkpoint_initiates.contains(&i),
                )
            })
            .collect();
        Self {
            node,
            layers,
            strategy: spec.strategy,
            state: FsmState::ForwardPass,
            index: 0,
            pass: 0,
            total_pass: total_pass.max(1),
            delay_loaded: false,
            collective_issued: false,
            checkpoint_initiated: false,
            awaiting_compute: false,
            waiting_for: None,
            finished: false,
            finish_time_ns: 0,
            pp_stages: spec.pp_size(),
            num_microbatches: spec.num_microbatches(),
        }
    }

    /// Single FSM entry point, driven by kernel callbacks.
    pub fn tick(
        &mut self,
        cause: TickCause,
        comm: &mut CommEngine,
        net: &mut dyn NetworkApi,
    ) -> SimResult<()> {
        match cause {
            TickCause::Event => {
                if self.waiting_for.is_some() {
                    return Ok(());
                }
                self.awaiting_compute = false;
            }
            TickCause::CommFinished(note) => {
                let resumed = self.on_comm_finished(note);
                if !resumed {
                    if matches!(self.state, FsmState::WaitForSimFinish) {
                        self.check_finish(comm, net);
                    }
                    return Ok(());
                }
            }
        }
        if self.awaiting_compute {
            return Ok(());
        }
        self.advance(comm, net)
    }

    /// Record a drained batch; true when it satisfied the active wait.
    fn on_comm_finished(&mut self, note: Notification) -> bool {
        let layer = &mut self.layers[note.layer];
        let pi = note.phase.index();
        layer.outstanding[pi].remove(&note.batch);
        layer.total_comm_ns[pi] += note.finished_ns.saturating_sub(note.created_ns);

        if let Some((wl, wp)) = self.waiting_for {
            if wl == note.layer && wp == note.phase && layer.outstanding[pi].is_empty() {
                if let Some(since) = layer.waiting_since[pi].take() {
                    layer.exposed_comm_ns[pi] += note.finished_ns.saturating_sub(since);
                }
                self.waiting_for = None;
                return true;
            }
        }
        false
    }

    fn advance(&mut self, comm: &mut CommEngine, net: &mut dyn NetworkApi) -> SimResult<()> {
        if self.finished {
            return Ok(());
        }
        loop {
            let keep_going = match self.state {
                FsmState::ForwardPass => self.step_forward(comm, net, None)?,
                FsmState::ForwardInBackPass { trigger } => {
                    self.step_forward(comm, net, Some(trigger))?
                }
                FsmState::InputGradient => self.step_input_grad(comm, net)?,
                FsmState::WeightGradient => self.step_weight_grad(comm, net)?,
                FsmState::WaitForSimFinish => {
                    self.check_finish(comm, net);
                    false
                }
            };
            if !keep_going {
                return Ok(());
            }
        }
    }

    fn layer_index(&self) -> usize {
        let s = self.layers.len();
        assert!(
            self.index >= 0 && (self.index as usize) < s,
            "layer index {} out of range 0..{s}",
            self.index
        );
        self.index as usize
    }

    fn begin_wait(&mut self, layer: LayerId, phase: WorkloadPhase, net: &dyn NetworkApi) {
        debug_assert!(self.waiting_for.is_none(), "second concurrent waiter");
        self.waiting_for = Some((layer, phase));
        self.layers[layer].waiting_since[phase.index()] = Some(net.now_ns());
    }

    fn load_delay(&mut self, cycles: u64, phase: WorkloadPhase, net: &mut dyn NetworkApi) {
        let li = self.layer_index();
        self.delay_loaded = true;
        self.awaiting_compute = true;
        let delay_ns = cycles * CLOCK_PERIOD_NS;
        self.layers[li].total_compute_ns[phase.index()] += delay_ns;
        net.schedule(delay_ns, self.node, EventKind::WorkloadWait);
    }

    /// Forward walk, both in the forward pass and during checkpoint
    /// recomputation. Returns false at a suspension point.
    fn step_forward(
        &mut self,
        comm: &mut CommEngine,
        net: &mut dyn NetworkApi,
        recompute_trigger: Option<usize>,
    ) -> SimResult<bool> {
        let s = self.layers.len();
        let li = self.layer_index();

        if !self.delay_loaded {
            let cycles = self.layers[li].phases[0].compute_cycles;
            self.load_delay(cycles, WorkloadPhase::Forward, net);
            return Ok(false);
        }

        if !self.collective_issued {
            // The forward of iteration n uses weights updated by the
            // weight-gradient all-reduce of iteration n-1.
            if recompute_trigger.is_none()
                && !self.layers[li].comm_finished(WorkloadPhase::WeightGrad)
            {
                self.begin_wait(li, WorkloadPhase::WeightGrad, net);
                return Ok(false);
            }
            self.collective_issued = true;
            let p = self.layers[li].phases[0];
            let mut bytes = p.bytes;
            if bytes > 0 && bytes < MIN_CHUNK_BYTES {
                // Small-message protocol floor.
                bytes = MIN_CHUNK_BYTES;
            }
            let batch = comm.generate_collective(
                net,
                p.kind,
                bytes,
                p.group,
                SchedulingPolicy::None,
                WorkloadPhase::Forward,
                Some((li, WorkloadPhase::Forward)),
            )?;
            if let Some(batch) = batch {
                self.layers[li].outstanding[0].insert(batch, net.now_ns());
                self.begin_wait(li, WorkloadPhase::Forward, net);
                return Ok(false);
            }
        }

        self.delay_loaded = false;
        self.collective_issued = false;
        self.index += 1;
        match recompute_trigger {
            None => {
                if self.index as usize == s {
                    if self.strategy.has_backward() {
                        self.state = FsmState::InputGradient;
                        self.index = s as i64 - 1;
                    } else {
                        self.complete_pass();
                    }
                }
            }
            Some(trigger) => {
                if self.index as usize == trigger {
                    self.state = FsmState::InputGradient;
                }
            }
        }
        Ok(true)
    }

    fn step_input_grad(
        &mut self,
        comm: &mut CommEngine,
        net: &mut dyn NetworkApi,
    ) -> SimResult<bool> {
        let li = self.layer_index();

        if !self.delay_loaded {
            if self.layers[li].needs_recompute_trigger && !self.checkpoint_initiated {
                let checkpoint = (0..li).rev().find(|&j| self.layers[j].is_checkpoint);
                let Some(checkpoint) = checkpoint else {
                    return Err(SimError::config(format!(
                        "recompute trigger at layer {li} has no earlier checkpoint"
                    )));
                };
                debug!(
                    node = self.node,
                    trigger = li,
                    checkpoint,
                    "recomputing activations"
                );
                self.checkpoint_initiated = true;
                self.state = FsmState::ForwardInBackPass { trigger: li };
                self.index = checkpoint as i64;
                return Ok(true);
            }
            let cycles = self.layers[li].phases[1].compute_cycles;
            self.load_delay(cycles, WorkloadPhase::InputGrad, net);
            return Ok(false);
        }

        if !self.collective_issued {
            self.collective_issued = true;
            let p = self.layers[li].phases[1];
            let batch = comm.generate_collective(
                net,
                p.kind,
                p.bytes,
                p.group,
                SchedulingPolicy::Lifo,
                WorkloadPhase::InputGrad,
                Some((li, WorkloadPhase::InputGrad)),
            )?;
            if let Some(batch) = batch {
                self.layers[li].outstanding[1].insert(batch, net.now_ns());
                self.begin_wait(li, WorkloadPhase::InputGrad, net);
                return Ok(false);
            }
        }

        self.delay_loaded = false;
        self.collective_issued = false;
        self.checkpoint_initiated = false;
        self.state = FsmState::WeightGradient;
        Ok(true)
    }

    fn step_weight_grad(
        &mut self,
        comm: &mut CommEngine,
        net: &mut dyn NetworkApi,
    ) -> SimResult<bool> {
        let li = self.layer_index();

        if !self.delay_loaded {
            let layer = &self.layers[li];
            let cycles = layer.phases[2].compute_cycles + layer.weight_grad_update_cycles;
            self.load_delay(cycles, WorkloadPhase::WeightGrad, net);
            return Ok(false);
        }

        if !self.collective_issued {
            self.collective_issued = true;
            let p = self.layers[li].phases[2];
            let batch = comm.generate_collective(
                net,
                p.kind,
                p.bytes,
                p.group,
                SchedulingPolicy::Fifo,
                WorkloadPhase::WeightGrad,
                Some((li, WorkloadPhase::WeightGrad)),
            )?;
            if let Some(batch) = batch {
                // Non-blocking barrier: completion is checked by the next
                // iteration's forward pass.
                self.layers[li].outstanding[2].insert(batch, net.now_ns());
            }
        }

        // The gradient consumed by the all-reduce must be available.
        if !self.layers[li].comm_finished(WorkloadPhase::InputGrad) {
            self.begin_wait(li, WorkloadPhase::InputGrad, net);
            return Ok(false);
        }

        self.delay_loaded = false;
        self.collective_issued = false;
        self.index -= 1;
        if self.index < 0 {
            self.complete_pass();
        } else {
            self.state = FsmState::InputGradient;
        }
        Ok(true)
    }

    fn complete_pass(&mut self) {
        self.pass += 1;
        debug!(node = self.node, pass = self.pass, "pass finished");
        if self.pass >= self.total_pass {
            self.state = FsmState::WaitForSimFinish;
        } else {
            self.index = 0;
            self.state = FsmState::ForwardPass;
        }
    }

    /// All passes are done; the node retires once every injected stream
    /// has finished. A persistent mismatch surfaces as a hang reported by
    /// the driver when the event queue drains.
    fn check_finish(&mut self, comm: &CommEngine, net: &dyn NetworkApi) {
        if self.finished {
            return;
        }
        if comm.streams_injected == comm.streams_finished {
            self.finished = true;
            self.finish_time_ns = net.now_ns();
            info!(
                node = self.node,
                time_ns = self.finish_time_ns,
                passes = self.pass,
                "all passes finished"
            );
        }
    }

    /// Analytic pipeline bubble fraction for this node's stage:
    /// `(P - 1) / (M + P - 1)` spread over warmup and drain.
    pub fn bubble_fraction(&self) -> f64 {
        if self.pp_stages <= 1 {
            return 0.0;
        }
        let p = self.pp_stages as f64;
        let m = self.num_microbatches as f64;
        (p - 1.0) / (m + p - 1.0)
    }
}
