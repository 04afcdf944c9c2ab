//! Rows of the slot table.

use std::sync::Arc;

use crate::buffer::GraphicBuffer;
use crate::fence::Fence;
use crate::{EglDisplay, EglFence};

/// Lifecycle of a slot. Exactly one state holds at any instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    /// Owned by the queue, available to the producer.
    Free,
    /// Handed to the producer for rendering.
    Dequeued,
    /// Rendered, waiting in the frame FIFO.
    Queued,
    /// Held by the consumer for display.
    Acquired,
    /// Pinned by the producer's shared-buffer mode; the slot never travels
    /// through the FIFO while in this state.
    Shared,
}

impl SlotState {
    /// States in which the slot must own a buffer.
    pub fn needs_buffer(self) -> bool {
        !matches!(self, SlotState::Free)
    }
}

/// One row of the slot table.
pub(super) struct Slot {
    pub(super) buffer: Option<Arc<GraphicBuffer>>,
    pub(super) state: SlotState,
    /// Last fence observed for this slot: the acquire fence while queued,
    /// the release fence once the consumer lets go.
    pub(super) fence: Fence,
    /// Assigned at queue time; 0 before first use.
    pub(super) frame_number: u64,
    /// Once set, acquires for this slot may omit the buffer handle since
    /// the consumer caches the mapping.
    pub(super) acquire_called: bool,
    /// The buffer was inserted through consumer-side attach.
    pub(super) attached_by_consumer: bool,
    /// The slot was invalidated while the consumer held it; the next
    /// release is a no-op beyond clearing this flag.
    pub(super) needs_cleanup_on_release: bool,
    pub(super) egl_display: Option<EglDisplay>,
    pub(super) egl_fence: Option<EglFence>,
}

impl Slot {
    pub(super) fn new() -> Slot {
        Slot {
            buffer: None,
            state: SlotState::Free,
            fence: Fence::signaled(),
            frame_number: 0,
            acquire_called: false,
            attached_by_consumer: false,
            needs_cleanup_on_release: false,
            egl_display: None,
            egl_fence: None,
        }
    }
}
