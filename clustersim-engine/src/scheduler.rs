//! Stream scheduler
//!
//! Governs concurrency across and within dimensions: per-dimension queues
//! with a pluggable insertion policy, admission of head streams up to the
//! per-dimension threshold, and the global running-stream bound. Also
//! accumulates per-dimension latency and busy time for the utilization
//! report.
//!
//! Invariants: `running_streams[d] <= queue_threshold` for every dimension,
//! the sum of running streams never exceeds `max_running_streams`, and an
//! initialized stream is never overtaken by a newly inserted stream of
//! equal priority.

use crate::stream::{StreamArena, StreamState};
use clustersim_core::types::{CollectiveKind, DimId, IntraDimPolicy, StreamId};
use std::collections::VecDeque;
use tracing::trace;

#[derive(Debug)]
pub struct StreamScheduler {
    pub intra: IntraDimPolicy,
    pub queue_threshold: usize,
    pub max_running_streams: usize,
    queues: Vec<VecDeque<StreamId>>,
    pub running_streams: Vec<usize>,
    pub total_active_chunks: Vec<usize>,
    pub total_running_streams: usize,
    /// Streams currently executing their first phase.
    pub first_phase_streams: usize,
    latency_sum_ns: Vec<u64>,
    latency_samples: Vec<u64>,
    busy_segments: Vec<Vec<(u64, u64)>>,
    busy_since: Vec<Option<u64>>,
}

impl StreamScheduler {
    pub fn new(num_dims: usize, intra: IntraDimPolicy, queue_threshold: usize, max_running_streams: usize) -> Self {
        Self {
            intra,
            queue_threshold,
            max_running_streams,
            queues: vec![VecDeque::new(); num_dims],
            running_streams: vec![0; num_dims],
            total_active_chunks: vec![0; num_dims],
            total_running_streams: 0,
            first_phase_streams: 0,
            latency_sum_ns: vec![0; num_dims],
            latency_samples: vec![0; num_dims],
            busy_segments: vec![Vec::new(); num_dims],
            busy_since: vec![None; num_dims],
        }
    }

    pub fn num_dims(&self) -> usize {
        self.queues.len()
    }

    /// Rebuild the per-dimension layout after `break_dimension`. Only
    /// legal while no stream is queued.
    pub fn rebuild(&mut self, num_dims: usize) {
        assert!(
            self.queues.iter().all(VecDeque::is_empty),
            "cannot rebuild queue layout with active streams"
        );
        *self = Self::new(num_dims, self.intra, self.queue_threshold, self.max_running_streams);
    }

    pub fn queue_len(&self, dim: DimId) -> usize {
        self.queues[dim].len()
    }

    /// Insert a stream into its dimension queue at the policy's position.
    pub fn add_stream(&mut self, dim: DimId, id: StreamId, arena: &StreamArena) {
        self.total_active_chunks[dim] += 1;
        let pos = self.insertion_point(dim, id, arena);
        self.queues[dim].insert(pos, id);
        trace!(dim, pos, "stream queued");
    }

    fn insertion_point(&self, dim: DimId, id: StreamId, arena: &StreamArena) -> usize {
        let queue = &self.queues[dim];
        let new = arena.get(id).expect("inserting a dead stream");

        // Initialized streams form a prefix that is never overtaken.
        let mut start = 0;
        while start < queue.len() {
            let s = arena.get(queue[start]).expect("dead stream in queue");
            if s.state != StreamState::Executing {
                break;
            }
            start += 1;
        }

        match self.intra {
            IntraDimPolicy::Fifo => self.fifo_point(queue, start, new.priority, arena),
            IntraDimPolicy::Rg => {
                // FIFO, but an all-gather settles right behind the
                // reduce-scatter of the same decomposition.
                if new.current_phase().map(|p| p.op) == Some(CollectiveKind::AllGather) {
                    for i in (start..queue.len()).rev() {
                        let s = arena.get(queue[i]).expect("dead stream in queue");
                        if s.pair_key == new.pair_key
                            && s.current_phase().map(|p| p.op)
                                == Some(CollectiveKind::ReduceScatter)
                        {
                            return i + 1;
                        }
                    }
                }
                self.fifo_point(queue, start, new.priority, arena)
            }
            IntraDimPolicy::SmallestFirst => {
                let mut pos = start;
                while pos < queue.len() {
                    let s = arena.get(queue[pos]).expect("dead stream in queue");
                    if s.initial_data_size > new.initial_data_size {
                        break;
                    }
                    pos += 1;
                }
                pos
            }
            IntraDimPolicy::LessRemainingPhaseFirst => {
                let mut pos = start;
                while pos < queue.len() {
                    let s = arena.get(queue[pos]).expect("dead stream in queue");
                    if s.remaining_phases() > new.remaining_phases() {
                        break;
                    }
                    pos += 1;
                }
                pos
            }
        }
    }

    /// After all streams of priority >= the new stream's priority.
    fn fifo_point(
        &self,
        queue: &VecDeque<StreamId>,
        start: usize,
        priority: i64,
        arena: &StreamArena,
    ) -> usize {
        let mut pos = start;
        while pos < queue.len() {
            let s = arena.get(queue[pos]).expect("dead stream in queue");
            if s.priority < priority {
                break;
            }
            pos += 1;
        }
        pos
    }

    /// Initialize head streams up to the dimension threshold and the
    /// global bound. Returns the ids to run; their state is flipped to
    /// `Executing` here.
    pub fn admit(&mut self, dim: DimId, now_ns: u64, arena: &mut StreamArena) -> Vec<StreamId> {
        let mut started = Vec::new();
        for i in 0..self.queues[dim].len().min(self.queue_threshold) {
            if self.running_streams[dim] >= self.queue_threshold
                || self.total_running_streams >= self.max_running_streams
            {
                break;
            }
            let id = self.queues[dim][i];
            let stream = arena.get_mut(id).expect("dead stream in queue");
            if stream.state == StreamState::Executing {
                continue;
            }
            debug_assert_eq!(stream.state, StreamState::Ready);
            stream.state = StreamState::Executing;
            stream.phase_started_ns = now_ns;
            if stream.steps_finished == 0 {
                self.first_phase_streams += 1;
            }
            self.running_streams[dim] += 1;
            self.total_running_streams += 1;
            if self.running_streams[dim] == 1 {
                self.busy_since[dim] = Some(now_ns);
            }
            started.push(id);
        }
        debug_assert!(self.running_streams[dim] <= self.queue_threshold);
        started
    }

    /// Drop a stream from its queue after its phase completed.
    pub fn remove_stream(&mut self, dim: DimId, id: StreamId, now_ns: u64, elapsed_ns: u64, was_first_phase: bool) {
        let pos = self.queues[dim]
            .iter()
            .position(|&s| s == id)
            .expect("removing a stream that is not queued");
        self.queues[dim].remove(pos);

        self.running_streams[dim] -= 1;
        self.total_running_streams -= 1;
        self.total_active_chunks[dim] -= 1;
        if was_first_phase {
            self.first_phase_streams -= 1;
        }
        self.latency_sum_ns[dim] += elapsed_ns;
        self.latency_samples[dim] += 1;
        if self.running_streams[dim] == 0 {
            if let Some(since) = self.busy_since[dim].take() {
                self.busy_segments[dim].push((since, now_ns));
            }
        }
    }

    pub fn mean_latency_ns(&self, dim: DimId) -> f64 {
        if self.latency_samples[dim] == 0 {
            0.0
        } else {
            self.latency_sum_ns[dim] as f64 / self.latency_samples[dim] as f64
        }
    }

    /// Busy intervals of one dimension, closing any open interval at
    /// `end_ns`.
    pub fn busy_segments(&self, dim: DimId, end_ns: u64) -> Vec<(u64, u64)> {
        let mut segments = self.busy_segments[dim].clone();
        if let Some(since) = self.busy_since[dim] {
            segments.push((since, end_ns));
        }
        segments
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::Stream;
    use std::collections::VecDeque as Deque;

    fn stream(arena: &mut StreamArena, priority: i64, size: u64) -> StreamId {
        arena.insert(Stream {
            id: 0,
            tag_base: 0,
            batch: 0,
            chunk_index: 0,
            initial_data_size: size,
            priority,
            state: StreamState::Ready,
            phases: Deque::new(),
            total_phases: 1,
            steps_finished: 0,
            created_ns: 0,
            phase_started_ns: 0,
            pair_key: (0, 0),
        })
    }

    #[test]
    fn test_fifo_orders_by_priority() {
        let mut arena = StreamArena::new();
        let mut sched = StreamScheduler::new(1, IntraDimPolicy::Fifo, 1, usize::MAX);
        let low = stream(&mut arena, 1, 4096);
        let high = stream(&mut arena, 5, 4096);
        sched.add_stream(0, low, &arena);
        sched.add_stream(0, high, &arena);
        // Higher priority goes first; equal priorities keep FIFO order.
        assert_eq!(sched.queues[0], [high, low]);
    }

    #[test]
    fn test_admission_respects_threshold() {
        let mut arena = StreamArena::new();
        let mut sched = StreamScheduler::new(1, IntraDimPolicy::Fifo, 2, usize::MAX);
        let ids: Vec<_> = (0..4).map(|_| stream(&mut arena, 0, 4096)).collect();
        for &id in &ids {
            sched.add_stream(0, id, &arena);
        }
        let started = sched.admit(0, 0, &mut arena);
        assert_eq!(started.len(), 2);
        assert_eq!(sched.running_streams[0], 2);

        // A second admit is a no-op while the threshold is reached.
        assert!(sched.admit(0, 0, &mut arena).is_empty());

        sched.remove_stream(0, started[0], 10, 10, true);
        assert_eq!(sched.admit(0, 10, &mut arena).len(), 1);
    }

    #[test]
    fn test_initialized_streams_are_not_overtaken() {
        let mut arena = StreamArena::new();
        let mut sched = StreamScheduler::new(1, IntraDimPolicy::Fifo, 1, usize::MAX);
        let first = stream(&mut arena, 0, 4096);
        sched.add_stream(0, first, &arena);
        sched.admit(0, 0, &mut arena);

        // Same priority, later arrival: lands behind the executing head.
        let second = stream(&mut arena, 0, 4096);
        sched.add_stream(0, second, &arena);
        assert_eq!(sched.queues[0], [first, second]);

        // Even a higher-priority stream cannot overtake the running head.
        let urgent = stream(&mut arena, 100, 4096);
        sched.add_stream(0, urgent, &arena);
        assert_eq!(sched.queues[0], [first, urgent, second]);
    }

    #[test]
    fn test_smallest_first_ordering() {
        let mut arena = StreamArena::new();
        let mut sched = StreamScheduler::new(1, IntraDimPolicy::SmallestFirst, 0, usize::MAX);
        let big = stream(&mut arena, 0, 1 << 20);
        let small = stream(&mut arena, 0, 4096);
        sched.add_stream(0, big, &arena);
        sched.add_stream(0, small, &arena);
        assert_eq!(sched.queues[0], [small, big]);
    }

    #[test]
    fn test_busy_accounting() {
        let mut arena = StreamArena::new();
        let mut sched = StreamScheduler::new(1, IntraDimPolicy::Fifo, 1, usize::MAX);
        let id = stream(&mut arena, 0, 4096);
        sched.add_stream(0, id, &arena);
        sched.admit(0, 100, &mut arena);
        sched.remove_stream(0, id, 250, 150, true);
        assert_eq!(sched.busy_segments(0, 300), vec![(100, 250)]);
        assert!((sched.mean_latency_ns(0) - 150.0).abs() < f64::EPSILON);
    }
}
