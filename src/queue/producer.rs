//! The producer endpoint.
//!
//! Only the behavior the consumer observes is load-bearing here: frames are
//! queued in strictly increasing frame-number order, every entry carries a
//! fence, async mode never leaves more than one entry in the FIFO, and a
//! released buffer only becomes dequeuable once its release fence is stored
//! in the slot.

use std::sync::Arc;

use log::{debug, error};
use thiserror::Error;

use super::core::QueueCore;
use super::item::FrameItem;
use super::slot::SlotState;
use super::{ConnectedApi, NUM_SLOTS};
use crate::buffer::{AllocationError, GraphicBuffer, SidebandStream};
use crate::fence::Fence;
use crate::listener::ProducerListener;
use crate::{Dataspace, Nsecs, PixelFormat, Rect, ScalingMode, Transform, UsageFlags};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConnectError {
    #[error("the queue has been abandoned")]
    Abandoned,
    #[error("no consumer is connected")]
    NoConsumer,
    #[error("a producer is already connected")]
    AlreadyConnected,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DequeueError {
    #[error("the queue has been abandoned")]
    Abandoned,
    #[error("no producer is connected")]
    NotConnected,
    #[error("buffer allocation failed")]
    Allocation(#[from] AllocationError),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum QueueFrameError {
    #[error("the queue has been abandoned")]
    Abandoned,
    #[error("no producer is connected")]
    NotConnected,
    #[error("slot index out of range")]
    SlotOutOfRange,
    #[error("the slot is not dequeued")]
    NotDequeued,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ProducerAttachError {
    #[error("the queue has been abandoned")]
    Abandoned,
    #[error("no producer is connected")]
    NotConnected,
    #[error("buffer generation {buffer} does not match queue generation {queue}")]
    GenerationMismatch { buffer: u32, queue: u32 },
    #[error("no free slot available")]
    NoFreeSlot,
}

/// Per-frame metadata supplied when queueing.
#[derive(Debug, Clone)]
pub struct QueueFrameInput {
    /// Desired present time; ignored by the consumer when auto-generated.
    pub timestamp: Nsecs,
    pub is_auto_timestamp: bool,
    /// The consumer may skip this frame without waiting for its fence.
    pub is_droppable: bool,
    /// Signals when the producer's writes are visible.
    pub fence: Fence,
    pub crop: Rect,
    pub transform: Transform,
    pub scaling_mode: ScalingMode,
    pub dataspace: Dataspace,
}

impl Default for QueueFrameInput {
    fn default() -> QueueFrameInput {
        QueueFrameInput {
            timestamp: 0,
            is_auto_timestamp: true,
            is_droppable: false,
            fence: Fence::signaled(),
            crop: Rect::default(),
            transform: Transform::empty(),
            scaling_mode: ScalingMode::Freeze,
            dataspace: Dataspace::default(),
        }
    }
}

/// Producer-side handle to a queue created by [`super::create`].
pub struct Producer {
    core: Arc<QueueCore>,
}

impl Producer {
    pub(super) fn new(core: Arc<QueueCore>) -> Producer {
        Producer { core }
    }

    pub fn connect(
        &self,
        api: ConnectedApi,
        listener: Arc<dyn ProducerListener>,
    ) -> Result<(), ConnectError> {
        let mut core = self.core.state.lock().unwrap();
        if core.abandoned {
            error!("connect(P): the queue has been abandoned");
            return Err(ConnectError::Abandoned);
        }
        if core.consumer_listener.is_none() {
            error!("connect(P): no consumer is connected");
            return Err(ConnectError::NoConsumer);
        }
        if core.connected_api.is_some() {
            error!(
                "connect(P): already connected (cur={:?} req={:?})",
                core.connected_api, api
            );
            return Err(ConnectError::AlreadyConnected);
        }
        core.connected_api = Some(api);
        core.producer_listener = Some(listener);
        Ok(())
    }

    /// Detaches the producer, returning every slot to the empty free pool
    /// and clearing the FIFO. The consumer is told to drop its cached
    /// mappings.
    pub fn disconnect(&self) {
        let listener = {
            let mut core = self.core.state.lock().unwrap();
            if core.connected_api.is_none() {
                return;
            }
            core.connected_api = None;
            core.producer_listener = None;
            core.queue.clear();
            core.free_all_buffers_locked();
            self.core.dequeue_cond.notify_all();
            core.validate_consistency();
            core.consumer_listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_buffers_released();
        }
    }

    /// Obtains a free slot for rendering, blocking until one is available
    /// or the queue is abandoned. Returns the slot index and the fence the
    /// producer must wait on before writing.
    ///
    /// Zero width or height selects the queue defaults. The consumer's
    /// usage bits are merged into the request before allocation.
    pub fn dequeue(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: UsageFlags,
    ) -> Result<(usize, Fence), DequeueError> {
        let mut core = self.core.state.lock().unwrap();

        let width = if width == 0 { core.default_width } else { width };
        let height = if height == 0 {
            core.default_height
        } else {
            height
        };
        let format = if format == PixelFormat::NONE {
            core.default_format
        } else {
            format
        };
        let usage = usage | core.consumer_usage_bits;

        loop {
            if core.abandoned {
                error!("dequeue: the queue has been abandoned");
                return Err(DequeueError::Abandoned);
            }
            if core.connected_api.is_none() {
                error!("dequeue: no producer is connected");
                return Err(DequeueError::NotConnected);
            }

            // A resident free buffer with matching parameters is the cheap
            // path: no allocation at all.
            let matching = core.free_buffers.iter().position(|&s| {
                core.slots[s]
                    .buffer
                    .as_ref()
                    .is_some_and(|b| !b.needs_reallocation(width, height, format, usage))
            });
            if let Some(position) = matching {
                let slot = core.free_buffers.remove(position).unwrap();
                core.slots[slot].state = SlotState::Dequeued;
                let fence = core.slots[slot].fence.clone();
                debug!("dequeue: reusing slot {}", slot);
                core.validate_consistency();
                return Ok((slot, fence));
            }

            // Otherwise allocate into an empty slot, or reallocate the
            // oldest resident buffer.
            let empty = core.free_slots.iter().next().copied();
            let slot = match empty {
                Some(slot) => {
                    core.free_slots.remove(&slot);
                    Some(slot)
                }
                None => core.free_buffers.pop_front(),
            };
            if let Some(slot) = slot {
                let buffer = match self.core.allocator.allocate(width, height, format, usage) {
                    Ok(buffer) => buffer,
                    Err(e) => {
                        error!("dequeue: buffer allocation failed: {}", e);
                        // The request must leave the queue unchanged.
                        core.slots[slot].buffer = None;
                        core.free_slots.insert(slot);
                        core.validate_consistency();
                        return Err(e.into());
                    }
                };
                buffer.set_generation(core.generation);
                let fence = core.slots[slot].fence.clone();
                let row = &mut core.slots[slot];
                row.buffer = Some(buffer);
                row.state = SlotState::Dequeued;
                row.acquire_called = false;
                row.frame_number = 0;
                debug!("dequeue: allocated into slot {}", slot);
                core.validate_consistency();
                return Ok((slot, fence));
            }

            core = self.core.dequeue_cond.wait(core).unwrap();
        }
    }

    /// The buffer handle resident in a dequeued slot, for producers that do
    /// not keep their own mapping.
    pub fn request_buffer(&self, slot: usize) -> Result<Arc<GraphicBuffer>, QueueFrameError> {
        let core = self.core.state.lock().unwrap();
        if core.abandoned {
            return Err(QueueFrameError::Abandoned);
        }
        if slot >= NUM_SLOTS {
            return Err(QueueFrameError::SlotOutOfRange);
        }
        if core.slots[slot].state != SlotState::Dequeued {
            return Err(QueueFrameError::NotDequeued);
        }
        match &core.slots[slot].buffer {
            Some(buffer) => Ok(Arc::clone(buffer)),
            None => unreachable!("dequeued slot without a buffer"),
        }
    }

    /// Submits a rendered frame. Assigns the next frame number, appends to
    /// the FIFO (or replaces the resident entry in async mode) and notifies
    /// the consumer listener with no lock held.
    pub fn queue(&self, slot: usize, input: QueueFrameInput) -> Result<u64, QueueFrameError> {
        let (listener, item, replaced) = {
            let mut core = self.core.state.lock().unwrap();
            if core.abandoned {
                error!("queue: the queue has been abandoned");
                return Err(QueueFrameError::Abandoned);
            }
            if core.connected_api.is_none() {
                error!("queue: no producer is connected");
                return Err(QueueFrameError::NotConnected);
            }
            if slot >= NUM_SLOTS {
                error!("queue: slot {} out of range [0, {})", slot, NUM_SLOTS);
                return Err(QueueFrameError::SlotOutOfRange);
            }
            if core.slots[slot].state != SlotState::Dequeued {
                error!(
                    "queue: slot {} is not dequeued (state = {:?})",
                    slot, core.slots[slot].state
                );
                return Err(QueueFrameError::NotDequeued);
            }

            core.frame_counter += 1;
            let frame_number = core.frame_counter;
            let row = &mut core.slots[slot];
            row.frame_number = frame_number;
            row.fence = input.fence.clone();
            row.state = SlotState::Queued;

            let item = FrameItem {
                slot,
                graphic_buffer: core.slots[slot].buffer.clone(),
                frame_number,
                timestamp: input.timestamp,
                is_auto_timestamp: input.is_auto_timestamp,
                // Async frames are droppable, but only while the consumer
                // has not forbidden async behavior.
                is_droppable: input.is_droppable && core.use_async_buffer,
                acquire_called: core.slots[slot].acquire_called,
                fence: input.fence,
                crop: input.crop,
                transform: input.transform,
                scaling_mode: input.scaling_mode,
                dataspace: input.dataspace,
            };

            // A droppable entry at the tail is an async frame that was
            // never picked up: the new frame takes its place and its slot
            // returns straight to the free pool.
            let last = core.queue.back().cloned();
            let replaced = match last {
                Some(last) if last.is_droppable => {
                    if core.still_tracking(&last) {
                        core.slots[last.slot].state = SlotState::Free;
                        core.free_buffers.push_back(last.slot);
                    }
                    if let Some(back) = core.queue.back_mut() {
                        *back = item.clone();
                    }
                    true
                }
                _ => {
                    core.queue.push_back(item.clone());
                    false
                }
            };

            debug!(
                "queue: slot={} frame={} time={} async={}",
                slot, frame_number, input.timestamp, replaced
            );
            core.register_occupancy_change();
            self.core.dequeue_cond.notify_all();
            core.validate_consistency();
            (core.consumer_listener.clone(), item, replaced)
        };

        if let Some(listener) = listener {
            if replaced {
                listener.on_frame_replaced(&item);
            } else {
                listener.on_frame_available(&item);
            }
        }

        Ok(item.frame_number)
    }

    /// Returns a dequeued slot to the free pool unrendered.
    pub fn cancel(&self, slot: usize, fence: Fence) -> Result<(), QueueFrameError> {
        let mut core = self.core.state.lock().unwrap();
        if core.abandoned {
            error!("cancel: the queue has been abandoned");
            return Err(QueueFrameError::Abandoned);
        }
        if slot >= NUM_SLOTS {
            error!("cancel: slot {} out of range [0, {})", slot, NUM_SLOTS);
            return Err(QueueFrameError::SlotOutOfRange);
        }
        if core.slots[slot].state != SlotState::Dequeued {
            error!(
                "cancel: slot {} is not dequeued (state = {:?})",
                slot, core.slots[slot].state
            );
            return Err(QueueFrameError::NotDequeued);
        }

        core.slots[slot].fence = fence;
        core.slots[slot].state = SlotState::Free;
        core.free_buffers.push_back(slot);
        self.core.dequeue_cond.notify_all();
        core.validate_consistency();
        Ok(())
    }

    /// Removes the buffer from a dequeued slot; the producer keeps the
    /// handle and the slot returns to the empty free pool.
    pub fn detach(&self, slot: usize) -> Result<Arc<GraphicBuffer>, QueueFrameError> {
        let mut core = self.core.state.lock().unwrap();
        if core.abandoned {
            error!("detach(P): the queue has been abandoned");
            return Err(QueueFrameError::Abandoned);
        }
        if slot >= NUM_SLOTS {
            error!("detach(P): slot {} out of range [0, {})", slot, NUM_SLOTS);
            return Err(QueueFrameError::SlotOutOfRange);
        }
        if core.slots[slot].state != SlotState::Dequeued {
            error!(
                "detach(P): slot {} is not dequeued (state = {:?})",
                slot, core.slots[slot].state
            );
            return Err(QueueFrameError::NotDequeued);
        }
        let buffer = match core.slots[slot].buffer.clone() {
            Some(buffer) => buffer,
            None => unreachable!("dequeued slot without a buffer"),
        };

        core.free_buffer_locked(slot);
        self.core.dequeue_cond.notify_all();
        core.validate_consistency();
        Ok(buffer)
    }

    /// Inserts a buffer the producer obtained elsewhere into a dequeued
    /// slot. The buffer must belong to the queue's current generation.
    pub fn attach(&self, buffer: &Arc<GraphicBuffer>) -> Result<usize, ProducerAttachError> {
        let mut core = self.core.state.lock().unwrap();
        if core.abandoned {
            error!("attach(P): the queue has been abandoned");
            return Err(ProducerAttachError::Abandoned);
        }
        if core.connected_api.is_none() {
            error!("attach(P): no producer is connected");
            return Err(ProducerAttachError::NotConnected);
        }
        if buffer.generation() != core.generation {
            error!(
                "attach(P): generation number mismatch [buffer {}] [queue {}]",
                buffer.generation(),
                core.generation
            );
            return Err(ProducerAttachError::GenerationMismatch {
                buffer: buffer.generation(),
                queue: core.generation,
            });
        }

        let empty = core.free_slots.iter().next().copied();
        let found = match empty {
            Some(slot) => {
                core.free_slots.remove(&slot);
                Some(slot)
            }
            None => core.free_buffers.pop_front(),
        };
        let Some(slot) = found else {
            error!("attach(P): could not find free buffer slot");
            return Err(ProducerAttachError::NoFreeSlot);
        };

        let row = &mut core.slots[slot];
        row.buffer = Some(Arc::clone(buffer));
        row.state = SlotState::Dequeued;
        row.fence = Fence::signaled();
        row.acquire_called = false;
        row.frame_number = 0;
        debug!("attach(P): returning slot {}", slot);

        core.validate_consistency();
        Ok(slot)
    }

    /// Publishes an out-of-band stream handle; frames from it bypass the
    /// FIFO entirely.
    pub fn set_sideband_stream(&self, stream: Option<SidebandStream>) {
        let listener = {
            let mut core = self.core.state.lock().unwrap();
            core.sideband_stream = stream;
            core.consumer_listener.clone()
        };
        if let Some(listener) = listener {
            listener.on_sideband_stream_changed();
        }
    }
}
