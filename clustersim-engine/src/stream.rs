//! Streams, batches, and the stream arena
//!
//! A stream is one chunk of a collective together with its ordered phase
//! list. Streams are owned by a generational arena; everything else refers
//! to them through `StreamId` handles, so stale handles are detected
//! instead of dereferenced.

use clustersim_collectives::algorithm::CollectiveAlgorithm;
use clustersim_core::types::{BatchId, CollectiveKind, DimId, LayerId, StreamId, Tag, WorkloadPhase};
use std::collections::VecDeque;

/// One single-dimension phase bound to its algorithm instance. Owned by
/// exactly one stream and consumed as the stream advances.
#[derive(Debug)]
pub struct CollectivePhase {
    pub queue_id: DimId,
    pub op: CollectiveKind,
    pub input_bytes: u64,
    pub algorithm: Box<dyn CollectiveAlgorithm>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    Created,
    Ready,
    Executing,
    Finished,
}

#[derive(Debug)]
pub struct Stream {
    pub id: StreamId,
    /// Start of this stream's wire-tag space; identical on every node
    /// because issuance order is identical.
    pub tag_base: Tag,
    pub batch: BatchId,
    pub chunk_index: u32,
    pub initial_data_size: u64,
    pub priority: i64,
    pub state: StreamState,
    /// Remaining phases; the front is the current one while executing.
    pub phases: VecDeque<CollectivePhase>,
    pub total_phases: usize,
    pub steps_finished: usize,
    pub created_ns: u64,
    pub phase_started_ns: u64,
    /// ReduceScatter/AllGather pairing key for the RG queue policy.
    pub pair_key: (BatchId, u32),
}

impl Stream {
    pub fn remaining_phases(&self) -> usize {
        self.phases.len()
    }

    pub fn current_phase(&self) -> Option<&CollectivePhase> {
        self.phases.front()
    }

    pub fn current_phase_mut(&mut self) -> Option<&mut CollectivePhase> {
        self.phases.front_mut()
    }

    /// Consume the current phase and move the cursor forward.
    pub fn advance(&mut self) -> Option<CollectivePhase> {
        let phase = self.phases.pop_front()?;
        self.steps_finished += 1;
        debug_assert!(self.steps_finished <= self.total_phases);
        Some(phase)
    }
}

/// A set of chunk streams generated from one collective issuance.
#[derive(Debug, Clone)]
pub struct StreamBatch {
    pub id: BatchId,
    pub created_ns: u64,
    pub finished_ns: u64,
    pub live_streams: usize,
    /// Layer and workload phase to wake when the batch drains.
    pub notifier: Option<(LayerId, WorkloadPhase)>,
}

/// Generational arena owning all live streams of one node.
#[derive(Debug, Default)]
pub struct StreamArena {
    slots: Vec<Slot>,
    free: Vec<u32>,
    live: usize,
}

#[derive(Debug, Default)]
struct Slot {
    gen: u32,
    stream: Option<Stream>,
}

fn encode(slot: u32, gen: u32) -> StreamId {
    ((gen as u64) << 32) | slot as u64
}

fn decode(id: StreamId) -> (u32, u32) {
    (id as u32, (id >> 32) as u32)
}

impl StreamArena {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Insert a stream; its `id` field is overwritten with the handle.
    pub fn insert(&mut self, mut stream: Stream) -> StreamId {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.slots.push(Slot::default());
                (self.slots.len() - 1) as u32
            }
        };
        let gen = self.slots[slot as usize].gen;
        let id = encode(slot, gen);
        stream.id = id;
        self.slots[slot as usize].stream = Some(stream);
        self.live += 1;
        id
    }

    pub fn get(&self, id: StreamId) -> Option<&Stream> {
        let (slot, gen) = decode(id);
        let entry = self.slots.get(slot as usize)?;
        if entry.gen != gen {
            return None;
        }
        entry.stream.as_ref()
    }

    pub fn get_mut(&mut self, id: StreamId) -> Option<&mut Stream> {
        let (slot, gen) = decode(id);
        let entry = self.slots.get_mut(slot as usize)?;
        if entry.gen != gen {
            return None;
        }
        entry.stream.as_mut()
    }

    /// Free a slot; the generation bump invalidates outstanding handles.
    pub fn remove(&mut self, id: StreamId) -> Option<Stream> {
        let (slot, gen) = decode(id);
        let entry = self.slots.get_mut(slot as usize)?;
        if entry.gen != gen {
            return None;
        }
        let stream = entry.stream.take()?;
        entry.gen = entry.gen.wrapping_add(1);
        self.free.push(slot);
        self.live -= 1;
        Some(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream() -> Stream {
        Stream {
            id: 0,
            tag_base: 0,
            batch: 0,
            chunk_index: 0,
            initial_data_size: 4096,
            priority: 0,
            state: StreamState::Created,
            phases: VecDeque::new(),
            total_phases: 0,
            steps_finished: 0,
            created_ns: 0,
            phase_started_ns: 0,
            pair_key: (0, 0),
        }
    }

    #[test]
    fn test_arena_handles_survive_reuse() {
        let mut arena = StreamArena::new();
        let a = arena.insert(stream());
        assert!(arena.get(a).is_some());
        arena.remove(a).unwrap();
        assert!(arena.get(a).is_none());

        // The slot is reused with a new generation; the old handle stays
        // dead.
        let b = arena.insert(stream());
        assert_ne!(a, b);
        assert!(arena.get(a).is_none());
        assert!(arena.get(b).is_some());
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn test_cursor_is_monotonic() {
        let mut s = stream();
        s.phases.push_back(CollectivePhase {
            queue_id: 0,
            op: CollectiveKind::AllReduce,
            input_bytes: 4096,
            algorithm: Box::new(clustersim_collectives::ring::RingAlgorithm::new(
                CollectiveKind::AllReduce,
                &clustersim_core::topology::RingTopology {
                    dim: 0,
                    members: vec![0, 1],
                    index: 0,
                },
                4096,
            )),
        });
        s.total_phases = 1;
        assert_eq!(s.remaining_phases(), 1);
        assert!(s.advance().is_some());
        assert_eq!(s.steps_finished, 1);
        assert!(s.advance().is_none());
        assert_eq!(s.steps_finished, 1);
    }
}
