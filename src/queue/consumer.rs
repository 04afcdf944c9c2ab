//! The consumer endpoint: frame acquisition, release, and the
//! configuration surface exposed to the displaying side.

use std::sync::Arc;

use log::{debug, error};
use thiserror::Error;

use super::core::QueueCore;
use super::item::FrameItem;
use super::slot::SlotState;
use super::{MAX_MAX_ACQUIRED_BUFFERS, NUM_SLOTS};
use crate::buffer::{GraphicBuffer, SidebandStream};
use crate::fence::Fence;
use crate::listener::ConsumerListener;
use crate::timeline::Segment;
use crate::{
    monotonic_now, Dataspace, EglDisplay, EglFence, Nsecs, PixelFormat, Transform, UsageFlags,
};

/// Timestamps farther than this from the expected present time are treated
/// as garbage: the frame is shown immediately rather than held.
const MAX_REASONABLE_NSEC: Nsecs = 1_000_000_000;

/// Reasons `acquire` declines to hand out a frame. None of them mutate any
/// state.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AcquireError {
    /// The consumer already holds the maximum number of buffers (plus the
    /// one-buffer slack that lets it set up a new acquisition before
    /// releasing the old one).
    #[error("maximum acquired buffer count reached")]
    MaxAcquiredBufferCount,
    #[error("no buffer is available")]
    NoBufferAvailable,
    /// The front frame is not due yet, or the caller is not ready for its
    /// frame number. Retry at the next refresh.
    #[error("the frame should be presented later")]
    PresentLater,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReleaseError {
    #[error("slot index out of range")]
    SlotOutOfRange,
    /// The slot was requeued while the consumer held its previous contents;
    /// releasing it now would corrupt the FIFO.
    #[error("the slot is currently queued")]
    StillQueued,
    #[error("the slot is not held by the consumer")]
    NotAcquired,
    /// The frame number does not match: the buffer was reallocated under
    /// the consumer and this release refers to the old contents.
    #[error("stale buffer slot")]
    StaleBufferSlot,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DetachError {
    #[error("the queue has been abandoned")]
    Abandoned,
    #[error("slot index out of range")]
    SlotOutOfRange,
    #[error("the slot is not held by the consumer")]
    NotAcquired,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AttachError {
    #[error("buffer generation {buffer} does not match queue generation {queue}")]
    GenerationMismatch { buffer: u32, queue: u32 },
    #[error("maximum acquired buffer count reached")]
    MaxAcquiredBufferCount,
    /// Neither free pool has a slot to spare.
    #[error("no free slot available")]
    NoFreeSlot,
}

/// The queue was abandoned by a consumer disconnect.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("the queue has been abandoned")]
pub struct Abandoned;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DisconnectError {
    #[error("no consumer is connected")]
    NoConsumer,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("value out of range")]
    InvalidValue,
    #[error("a producer is connected")]
    ProducerConnected,
    #[error("a consumer is connected")]
    ConsumerConnected,
}

/// Consumer-side handle to a queue created by [`super::create`].
pub struct Consumer {
    core: Arc<QueueCore>,
}

impl Consumer {
    pub(super) fn new(core: Arc<QueueCore>) -> Consumer {
        Consumer { core }
    }

    /// Acquires the next due frame.
    ///
    /// `expected_present` is the nanosecond timestamp at which the next
    /// refresh will reach the display; zero acquires greedily with no
    /// timing consideration. `max_frame_number` caps which frames the
    /// caller is ready for; zero means no cap. When a timing decision is
    /// requested, stale droppable frames at the front of the FIFO are
    /// discarded, with one producer notification per drop.
    pub fn acquire(
        &self,
        expected_present: Nsecs,
        max_frame_number: u64,
    ) -> Result<FrameItem, AcquireError> {
        let mut dropped_frames = 0;
        let mut listener = None;

        let item = {
            let mut core = self.core.state.lock().unwrap();

            let acquired_count = core.acquired_count();
            if acquired_count >= core.max_acquired_buffer_count + 1 {
                error!(
                    "acquire: max acquired buffer count reached: {} (max {})",
                    acquired_count, core.max_acquired_buffer_count
                );
                return Err(AcquireError::MaxAcquiredBufferCount);
            }

            if core.queue.is_empty() {
                return Err(AcquireError::NoBufferAvailable);
            }

            if expected_present != 0 {
                // Frames whose timestamps were auto-generated carry no
                // intent, so they are never dropped on timing grounds.
                while core.queue.len() > 1 && !core.queue[0].is_auto_timestamp {
                    let (second_frame, desired) = {
                        let second = &core.queue[1];
                        (second.frame_number, second.timestamp)
                    };

                    // Dropping the front must not leave a frame the caller
                    // is not ready for.
                    if max_frame_number != 0 && second_frame > max_frame_number {
                        break;
                    }

                    // Only drop if the successor is timely; a desired
                    // present outside one second of the expected present is
                    // garbage and no reason to lose the front frame.
                    if desired < expected_present - MAX_REASONABLE_NSEC
                        || desired > expected_present
                    {
                        debug!(
                            "acquire: nodrop desire={} expect={} ({})",
                            desired,
                            expected_present,
                            desired - expected_present
                        );
                        break;
                    }

                    debug!(
                        "acquire: drop desire={} expect={} size={}",
                        desired,
                        expected_present,
                        core.queue.len()
                    );
                    if let Some(front) = core.queue.pop_front() {
                        if core.still_tracking(&front) {
                            core.slots[front.slot].state = SlotState::Free;
                            core.free_buffers.push_back(front.slot);
                            listener = core.producer_listener.clone();
                            dropped_frames += 1;
                        }
                    }
                }

                if let Some(front) = core.queue.front() {
                    let desired = front.timestamp;
                    // A desired present far beyond the expected present is
                    // an unknown timestamp: show the frame now.
                    let buffer_is_due = desired <= expected_present
                        || desired > expected_present + MAX_REASONABLE_NSEC;
                    let consumer_is_ready =
                        max_frame_number == 0 || front.frame_number <= max_frame_number;
                    if !buffer_is_due || !consumer_is_ready {
                        debug!(
                            "acquire: defer desire={} expect={} frame={} consumer={}",
                            desired, expected_present, front.frame_number, max_frame_number
                        );
                        return Err(AcquireError::PresentLater);
                    }
                    debug!(
                        "acquire: accept desire={} expect={} ({})",
                        desired,
                        expected_present,
                        desired - expected_present
                    );
                }
            }

            let mut item = match core.queue.pop_front() {
                Some(item) => item,
                None => unreachable!("FIFO emptiness was checked above"),
            };
            debug!(
                "acquire: acquiring slot={} frame={}",
                item.slot, item.frame_number
            );

            if core.still_tracking(&item) {
                let slot = &mut core.slots[item.slot];
                slot.acquire_called = true;
                slot.needs_cleanup_on_release = false;
                slot.state = SlotState::Acquired;
                slot.fence = Fence::signaled();
            }

            // The consumer already caches this slot's mapping; skip the
            // handle to keep the marshalled item small.
            if item.acquire_called {
                item.graphic_buffer = None;
            }

            core.register_occupancy_change();
            self.core.dequeue_cond.notify_all();
            core.validate_consistency();
            item
        };

        if let Some(listener) = listener {
            for _ in 0..dropped_frames {
                listener.on_buffer_released();
            }
        }

        Ok(item)
    }

    /// Returns an acquired slot to the free pool, handing the producer the
    /// release fence to wait on before writing again.
    pub fn release(
        &self,
        slot: usize,
        frame_number: u64,
        release_fence: Fence,
        egl_display: Option<EglDisplay>,
        egl_fence: Option<EglFence>,
    ) -> Result<(), ReleaseError> {
        if slot >= NUM_SLOTS {
            error!("release: slot {} out of range [0, {})", slot, NUM_SLOTS);
            return Err(ReleaseError::SlotOutOfRange);
        }

        let listener = {
            let mut core = self.core.state.lock().unwrap();

            // The buffer was reallocated under the consumer; this release
            // refers to contents that no longer exist.
            if frame_number != core.slots[slot].frame_number {
                return Err(ReleaseError::StaleBufferSlot);
            }

            if core.queue.iter().any(|item| item.slot == slot) {
                error!("release: slot {} pending release is currently queued", slot);
                return Err(ReleaseError::StillQueued);
            }

            if core.slots[slot].state == SlotState::Acquired {
                let row = &mut core.slots[slot];
                row.egl_display = egl_display;
                row.egl_fence = egl_fence;
                row.fence = release_fence;
                row.state = SlotState::Free;
                core.free_buffers.push_back(slot);
                debug!("release: releasing slot {}", slot);
            } else if core.slots[slot].needs_cleanup_on_release {
                debug!(
                    "release: releasing a stale buffer slot {} (state = {:?})",
                    slot, core.slots[slot].state
                );
                core.slots[slot].needs_cleanup_on_release = false;
                return Err(ReleaseError::StaleBufferSlot);
            } else {
                error!(
                    "release: attempted to release slot {} but its state was {:?}",
                    slot, core.slots[slot].state
                );
                return Err(ReleaseError::NotAcquired);
            }

            self.core.dequeue_cond.notify_all();
            core.validate_consistency();
            core.producer_listener.clone()
        };

        if let Some(listener) = listener {
            listener.on_buffer_released();
        }

        Ok(())
    }

    /// Removes an acquired buffer from the queue entirely. The slot returns
    /// to the empty free pool.
    pub fn detach(&self, slot: usize) -> Result<(), DetachError> {
        let mut core = self.core.state.lock().unwrap();

        if core.abandoned {
            error!("detach: the queue has been abandoned");
            return Err(DetachError::Abandoned);
        }
        if slot >= NUM_SLOTS {
            error!("detach: slot {} out of range [0, {})", slot, NUM_SLOTS);
            return Err(DetachError::SlotOutOfRange);
        }
        if core.slots[slot].state != SlotState::Acquired {
            error!(
                "detach: slot {} is not owned by the consumer (state = {:?})",
                slot, core.slots[slot].state
            );
            return Err(DetachError::NotAcquired);
        }

        core.free_buffer_locked(slot);
        self.core.dequeue_cond.notify_all();
        core.validate_consistency();
        Ok(())
    }

    /// Inserts a buffer directly into an acquired slot, as if it had just
    /// been acquired. Returns the chosen slot.
    pub fn attach(&self, buffer: &Arc<GraphicBuffer>) -> Result<usize, AttachError> {
        let mut core = self.core.state.lock().unwrap();

        let acquired_count = core.acquired_count();
        if acquired_count >= core.max_acquired_buffer_count + 1 {
            error!(
                "attach: max acquired buffer count reached: {} (max {})",
                acquired_count, core.max_acquired_buffer_count
            );
            return Err(AttachError::MaxAcquiredBufferCount);
        }

        if buffer.generation() != core.generation {
            error!(
                "attach: generation number mismatch [buffer {}] [queue {}]",
                buffer.generation(),
                core.generation
            );
            return Err(AttachError::GenerationMismatch {
                buffer: buffer.generation(),
                queue: core.generation,
            });
        }

        // Prefer an empty slot; otherwise steal the oldest reusable buffer
        // and discard its contents.
        let empty = core.free_slots.iter().next().copied();
        let found = match empty {
            Some(slot) => {
                core.free_slots.remove(&slot);
                Some(slot)
            }
            None => core.free_buffers.pop_front(),
        };
        let Some(slot) = found else {
            error!("attach: could not find free buffer slot");
            return Err(AttachError::NoFreeSlot);
        };
        debug!("attach: returning slot {}", slot);

        let row = &mut core.slots[slot];
        row.buffer = Some(Arc::clone(buffer));
        row.state = SlotState::Acquired;
        row.attached_by_consumer = true;
        row.needs_cleanup_on_release = false;
        row.fence = Fence::signaled();
        row.frame_number = 0;
        // Attached buffers always travel with the full handle on the next
        // acquire; clients that attach and detach every frame keep no
        // slot-to-buffer mappings to rely on.
        row.acquire_called = false;

        core.validate_consistency();
        Ok(slot)
    }

    /// Registers the consumer listener. At most one consumer may be
    /// connected at a time.
    pub fn connect(&self, listener: Arc<dyn ConsumerListener>) -> Result<(), Abandoned> {
        let mut core = self.core.state.lock().unwrap();
        if core.abandoned {
            error!("connect: the queue has been abandoned");
            return Err(Abandoned);
        }
        core.consumer_listener = Some(listener);
        Ok(())
    }

    /// Abandons the queue: drops the listener, clears the FIFO, frees every
    /// slot and wakes any blocked producer. All gated operations fail from
    /// here on.
    pub fn disconnect(&self) -> Result<(), DisconnectError> {
        let mut core = self.core.state.lock().unwrap();
        if core.consumer_listener.is_none() {
            error!("disconnect: no consumer is connected");
            return Err(DisconnectError::NoConsumer);
        }

        core.abandoned = true;
        core.consumer_listener = None;
        core.queue.clear();
        core.free_all_buffers_locked();
        self.core.dequeue_cond.notify_all();
        Ok(())
    }

    /// Mask of slots whose cached slot-to-buffer mapping is no longer
    /// valid: bit `s` is set iff the consumer has never seen slot `s`
    /// through acquire and no queued entry for `s` was acquired before.
    pub fn get_released_buffers(&self) -> Result<u64, Abandoned> {
        let core = self.core.state.lock().unwrap();
        if core.abandoned {
            error!("get_released_buffers: the queue has been abandoned");
            return Err(Abandoned);
        }

        let mut mask: u64 = 0;
        for s in 0..NUM_SLOTS {
            if !core.slots[s].acquire_called {
                mask |= 1 << s;
            }
        }
        // Queued entries that were acquired before will not carry their
        // buffer handle again, so the consumer must keep their mappings.
        for item in &core.queue {
            if item.acquire_called {
                mask &= !(1 << item.slot);
            }
        }

        debug!("get_released_buffers: returning mask {:#x}", mask);
        Ok(mask)
    }

    pub fn set_default_buffer_size(&self, width: u32, height: u32) -> Result<(), ConfigError> {
        if width == 0 || height == 0 {
            debug!(
                "set_default_buffer_size: dimensions cannot be 0 (width={} height={})",
                width, height
            );
            return Err(ConfigError::InvalidValue);
        }
        let mut core = self.core.state.lock().unwrap();
        core.default_width = width;
        core.default_height = height;
        Ok(())
    }

    pub fn set_default_max_buffer_count(&self, count: usize) -> Result<(), ConfigError> {
        if !(2..=NUM_SLOTS).contains(&count) {
            error!("set_default_max_buffer_count: invalid count {}", count);
            return Err(ConfigError::InvalidValue);
        }
        let mut core = self.core.state.lock().unwrap();
        core.default_max_buffer_count = count;
        Ok(())
    }

    /// Forces every queued frame to wait its turn in the FIFO. Only
    /// callable before a consumer connects.
    pub fn disable_async_buffer(&self) -> Result<(), ConfigError> {
        let mut core = self.core.state.lock().unwrap();
        if core.consumer_listener.is_some() {
            error!("disable_async_buffer: consumer already connected");
            return Err(ConfigError::ConsumerConnected);
        }
        core.use_async_buffer = false;
        Ok(())
    }

    /// Only callable while no producer is connected.
    pub fn set_max_acquired_buffer_count(&self, count: usize) -> Result<(), ConfigError> {
        if count < 1 || count > MAX_MAX_ACQUIRED_BUFFERS {
            error!("set_max_acquired_buffer_count: invalid count {}", count);
            return Err(ConfigError::InvalidValue);
        }
        let mut core = self.core.state.lock().unwrap();
        if core.connected_api.is_some() {
            error!("set_max_acquired_buffer_count: producer is already connected");
            return Err(ConfigError::ProducerConnected);
        }
        core.max_acquired_buffer_count = count;
        Ok(())
    }

    pub fn set_consumer_name(&self, name: &str) {
        let mut core = self.core.state.lock().unwrap();
        core.consumer_name = name.to_string();
    }

    pub fn set_default_buffer_format(&self, format: PixelFormat) {
        let mut core = self.core.state.lock().unwrap();
        core.default_format = format;
    }

    pub fn set_default_buffer_dataspace(&self, dataspace: Dataspace) {
        let mut core = self.core.state.lock().unwrap();
        core.default_dataspace = dataspace;
    }

    pub fn set_consumer_usage_bits(&self, usage: UsageFlags) {
        let mut core = self.core.state.lock().unwrap();
        core.consumer_usage_bits = usage;
    }

    pub fn set_transform_hint(&self, hint: Transform) {
        let mut core = self.core.state.lock().unwrap();
        core.transform_hint = hint;
    }

    pub fn get_sideband_stream(&self) -> Option<SidebandStream> {
        self.core.state.lock().unwrap().sideband_stream.clone()
    }

    /// Drains completed queue-occupancy segments. `force_flush` also closes
    /// and returns the segment currently accumulating.
    pub fn get_occupancy_history(&self, force_flush: bool) -> Vec<Segment> {
        let mut core = self.core.state.lock().unwrap();
        core.occupancy_tracker
            .take_history(force_flush, monotonic_now())
    }

    /// Human-readable state of the whole queue. Available even after the
    /// queue was abandoned.
    pub fn dump(&self, prefix: &str) -> String {
        self.core.state.lock().unwrap().dump(prefix)
    }
}
