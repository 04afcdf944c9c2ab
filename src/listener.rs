//! Notification interfaces between the queue and its two clients.
//!
//! Every method here is invoked with no queue lock held: the endpoints
//! capture the listener reference and the number of notifications to
//! deliver under the lock, release it, then call out. A listener is
//! therefore free to re-enter any endpoint operation.

use crate::queue::FrameItem;

/// Implemented by the consumer side (typically a layer driver) to learn
/// about producer activity.
pub trait ConsumerListener: Send + Sync {
    /// A new frame was queued. Delivered once per queued frame, in strictly
    /// increasing frame-number order.
    fn on_frame_available(&self, item: &FrameItem);

    /// An async-mode frame replaced the previous queue entry in place.
    fn on_frame_replaced(&self, item: &FrameItem);

    /// One or more slots were released wholesale; the released-slot mask
    /// should be polled to invalidate cached slot-to-buffer mappings.
    fn on_buffers_released(&self);

    /// The out-of-band stream handle changed.
    fn on_sideband_stream_changed(&self);
}

/// Implemented by the producer side to learn when buffers return to the
/// free pool.
pub trait ProducerListener: Send + Sync {
    /// One call per buffer released or dropped by the consumer.
    fn on_buffer_released(&self);
}
