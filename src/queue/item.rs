//! Entries of the frame FIFO.

use std::sync::Arc;

use crate::buffer::GraphicBuffer;
use crate::fence::Fence;
use crate::{Dataspace, Nsecs, Rect, ScalingMode, Transform};

/// Everything the consumer needs to know about one queued frame.
///
/// The buffer handle is carried redundantly so a marshaller can flatten the
/// item as a unit; once the consumer has cached the slot-to-buffer mapping
/// (`acquire_called`), acquires return the item with the handle omitted.
#[derive(Debug, Clone)]
pub struct FrameItem {
    /// Slot the frame lives in.
    pub slot: usize,
    pub graphic_buffer: Option<Arc<GraphicBuffer>>,
    /// Producer-assigned, strictly increasing per connection generation.
    pub frame_number: u64,
    /// The producer's desired present time, in nanoseconds.
    pub timestamp: Nsecs,
    /// The producer did not set an explicit timestamp.
    pub is_auto_timestamp: bool,
    /// The consumer may skip this frame on timing grounds without waiting
    /// for its fence.
    pub is_droppable: bool,
    /// Snapshot of the slot's flag at queue time.
    pub acquire_called: bool,
    /// Must signal before the frame contents are readable.
    pub fence: Fence,
    pub crop: Rect,
    pub transform: Transform,
    pub scaling_mode: ScalingMode,
    pub dataspace: Dataspace,
}

impl Default for FrameItem {
    fn default() -> FrameItem {
        FrameItem {
            slot: 0,
            graphic_buffer: None,
            frame_number: 0,
            timestamp: 0,
            is_auto_timestamp: false,
            is_droppable: false,
            acquire_called: false,
            fence: Fence::signaled(),
            crop: Rect::default(),
            transform: Transform::empty(),
            scaling_mode: ScalingMode::Freeze,
            dataspace: Dataspace::default(),
        }
    }
}
