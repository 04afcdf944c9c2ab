//! Shared state of the queue: the slot table, the frame FIFO, the free
//! pools and the connection bookkeeping, all behind one coarse lock.

use std::collections::{BTreeSet, VecDeque};
use std::fmt::Write;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, error};

use super::item::FrameItem;
use super::slot::{Slot, SlotState};
use super::{ConnectedApi, NUM_SLOTS};
use crate::buffer::{BufferAllocator, SidebandStream};
use crate::fence::Fence;
use crate::listener::{ConsumerListener, ProducerListener};
use crate::timeline::OccupancyTracker;
use crate::{monotonic_now, Dataspace, PixelFormat, Transform, UsageFlags};

pub(super) struct QueueCore {
    pub(super) allocator: Arc<dyn BufferAllocator>,
    pub(super) state: Mutex<CoreState>,
    /// Signaled on every transition that could unblock a producer waiting
    /// in dequeue: acquire, release, detach, frame drop, disconnect,
    /// abandon, buffer-count increase.
    pub(super) dequeue_cond: Condvar,
}

pub(super) struct CoreState {
    pub(super) slots: Vec<Slot>,
    pub(super) queue: VecDeque<FrameItem>,
    /// Free slots with no resident buffer, ordered by index.
    pub(super) free_slots: BTreeSet<usize>,
    /// Free slots whose buffer is kept for reuse, oldest first.
    pub(super) free_buffers: VecDeque<usize>,
    pub(super) consumer_listener: Option<Arc<dyn ConsumerListener>>,
    pub(super) producer_listener: Option<Arc<dyn ProducerListener>>,
    pub(super) connected_api: Option<ConnectedApi>,
    /// Sticky; set by consumer disconnect. Once true, gated operations fail
    /// until the queue is dropped.
    pub(super) abandoned: bool,
    pub(super) max_acquired_buffer_count: usize,
    /// When set, the FIFO never holds more than one entry; the producer
    /// replaces the resident entry on queue.
    pub(super) use_async_buffer: bool,
    pub(super) default_width: u32,
    pub(super) default_height: u32,
    pub(super) default_format: PixelFormat,
    pub(super) default_dataspace: Dataspace,
    pub(super) default_max_buffer_count: usize,
    pub(super) consumer_usage_bits: UsageFlags,
    pub(super) transform_hint: Transform,
    pub(super) consumer_name: String,
    pub(super) generation: u32,
    pub(super) sideband_stream: Option<SidebandStream>,
    pub(super) frame_counter: u64,
    pub(super) occupancy_tracker: OccupancyTracker,
}

impl QueueCore {
    pub(super) fn new(allocator: Arc<dyn BufferAllocator>) -> QueueCore {
        QueueCore {
            allocator,
            state: Mutex::new(CoreState::new()),
            dequeue_cond: Condvar::new(),
        }
    }
}

impl CoreState {
    fn new() -> CoreState {
        CoreState {
            slots: (0..NUM_SLOTS).map(|_| Slot::new()).collect(),
            queue: VecDeque::new(),
            free_slots: (0..NUM_SLOTS).collect(),
            free_buffers: VecDeque::new(),
            consumer_listener: None,
            producer_listener: None,
            connected_api: None,
            abandoned: false,
            max_acquired_buffer_count: 1,
            use_async_buffer: true,
            default_width: 1,
            default_height: 1,
            default_format: PixelFormat::RGBA_8888,
            default_dataspace: Dataspace::default(),
            default_max_buffer_count: NUM_SLOTS,
            consumer_usage_bits: UsageFlags::empty(),
            transform_hint: Transform::empty(),
            consumer_name: String::from("unnamed"),
            generation: 0,
            sideband_stream: None,
            frame_counter: 0,
            occupancy_tracker: OccupancyTracker::new(),
        }
    }

    /// Number of slots currently held by the consumer.
    pub(super) fn acquired_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Acquired)
            .count()
    }

    /// Whether the slot an item refers to still holds the item's buffer.
    /// False once the slot was freed or its buffer reallocated under a
    /// still-pending FIFO entry.
    pub(super) fn still_tracking(&self, item: &FrameItem) -> bool {
        let slot = &self.slots[item.slot];
        match (&slot.buffer, &item.graphic_buffer) {
            (Some(resident), Some(queued)) => Arc::ptr_eq(resident, queued),
            _ => false,
        }
    }

    /// Returns the slot to the empty free pool, discarding its buffer.
    pub(super) fn free_buffer_locked(&mut self, index: usize) {
        debug!("freeing slot {}", index);
        let had_buffer = self.slots[index].buffer.is_some();
        self.slots[index].buffer = None;
        if self.slots[index].state == SlotState::Acquired {
            self.slots[index].needs_cleanup_on_release = true;
        }
        if self.slots[index].state != SlotState::Free {
            self.free_slots.insert(index);
        } else if had_buffer {
            self.free_buffers.retain(|&s| s != index);
            self.free_slots.insert(index);
        }
        let slot = &mut self.slots[index];
        slot.state = SlotState::Free;
        slot.frame_number = 0;
        slot.acquire_called = false;
        slot.attached_by_consumer = false;
        slot.fence = Fence::signaled();
        slot.egl_display = None;
        slot.egl_fence = None;
    }

    pub(super) fn free_all_buffers_locked(&mut self) {
        for index in 0..NUM_SLOTS {
            self.free_buffer_locked(index);
        }
    }

    /// Records the current FIFO depth with the occupancy tracker.
    pub(super) fn register_occupancy_change(&mut self) {
        let occupancy = self.queue.len();
        self.occupancy_tracker
            .register_occupancy_change(occupancy, monotonic_now());
    }

    /// Checks the structural invariants of the slot table, the FIFO and the
    /// free pools. Runs at the end of every mutating operation, under the
    /// lock. Violations abort in debug builds and log in release builds;
    /// they are never surfaced to callers.
    pub(super) fn validate_consistency(&self) {
        let mut violations: Vec<String> = Vec::new();

        let acquired = self.acquired_count();
        if acquired > self.max_acquired_buffer_count + 1 {
            violations.push(format!(
                "{} slots acquired, limit is {} + 1",
                acquired, self.max_acquired_buffer_count
            ));
        }

        for (index, slot) in self.slots.iter().enumerate() {
            let tracked_entries = self
                .queue
                .iter()
                .filter(|item| {
                    item.slot == index
                        && match (&slot.buffer, &item.graphic_buffer) {
                            (Some(resident), Some(queued)) => Arc::ptr_eq(resident, queued),
                            _ => false,
                        }
                })
                .count();
            if slot.state == SlotState::Queued && tracked_entries != 1 {
                violations.push(format!(
                    "slot {} is queued but has {} tracked FIFO entries",
                    index, tracked_entries
                ));
            }
            if slot.state != SlotState::Queued && tracked_entries != 0 {
                violations.push(format!(
                    "slot {} is {:?} but {} FIFO entries track it",
                    index, slot.state, tracked_entries
                ));
            }

            if slot.state.needs_buffer() && slot.buffer.is_none() {
                violations.push(format!("slot {} is {:?} without a buffer", index, slot.state));
            }

            let in_free_slots = self.free_slots.contains(&index);
            let in_free_buffers = self.free_buffers.contains(&index);
            if in_free_slots && in_free_buffers {
                violations.push(format!("slot {} is in both free pools", index));
            }
            if in_free_slots && (slot.state != SlotState::Free || slot.buffer.is_some()) {
                violations.push(format!(
                    "slot {} is in free_slots but is {:?} with buffer={}",
                    index,
                    slot.state,
                    slot.buffer.is_some()
                ));
            }
            if in_free_buffers && (slot.state != SlotState::Free || slot.buffer.is_none()) {
                violations.push(format!(
                    "slot {} is in free_buffers but is {:?} with buffer={}",
                    index,
                    slot.state,
                    slot.buffer.is_some()
                ));
            }
        }

        let mut previous_frame = 0u64;
        for item in &self.queue {
            if item.frame_number <= previous_frame {
                violations.push(format!(
                    "FIFO frame numbers not increasing: {} after {}",
                    item.frame_number, previous_frame
                ));
            }
            previous_frame = item.frame_number;
        }

        if !violations.is_empty() {
            for violation in &violations {
                error!("[{}] consistency check failed: {}", self.consumer_name, violation);
            }
            debug_assert!(
                violations.is_empty(),
                "queue state is inconsistent: {:?}",
                violations
            );
        }
    }

    pub(super) fn dump(&self, prefix: &str) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "{}- queue '{}' abandoned={} api={:?} generation={}",
            prefix, self.consumer_name, self.abandoned, self.connected_api, self.generation
        );
        let _ = writeln!(
            out,
            "{}  default={}x{} {:?} dataspace={:?} max_buffers={} max_acquired={} async={} hint={:?} FIFO({}):",
            prefix,
            self.default_width,
            self.default_height,
            self.default_format,
            self.default_dataspace,
            self.default_max_buffer_count,
            self.max_acquired_buffer_count,
            self.use_async_buffer,
            self.transform_hint,
            self.queue.len()
        );
        for item in &self.queue {
            let _ = writeln!(
                out,
                "{}    slot={} frame={} time={}ns auto={} droppable={}",
                prefix,
                item.slot,
                item.frame_number,
                item.timestamp,
                item.is_auto_timestamp,
                item.is_droppable
            );
        }
        for (index, slot) in self.slots.iter().enumerate() {
            // Untouched free slots are not worth a line each.
            if slot.state == SlotState::Free && slot.buffer.is_none() && slot.frame_number == 0 {
                continue;
            }
            let _ = writeln!(
                out,
                "{}  [{:02}] state={:?} frame={} acquire_called={} attached={} cleanup={} fence={} egl={}/{}",
                prefix,
                index,
                slot.state,
                slot.frame_number,
                slot.acquire_called,
                slot.attached_by_consumer,
                slot.needs_cleanup_on_release,
                slot.fence.signal_time(),
                slot.egl_display.is_some(),
                slot.egl_fence.is_some()
            );
        }
        out
    }
}
