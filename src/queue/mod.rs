//! The buffer queue: a fixed table of slots whose ownership is mediated
//! between a producer and a consumer endpoint.
//!
//! Both endpoints are cheap handles over the same shared core and can live
//! on different threads (or, through a marshaller, in different processes).
//! All state is guarded by one coarse lock; a condition variable wakes
//! producers blocked in `dequeue` on every transition that reduces
//! occupancy or grows the free pool.

pub mod consumer;
mod core;
pub mod item;
pub mod producer;
mod slot;

use std::sync::Arc;

use enumn::N;

use crate::buffer::BufferAllocator;

pub use consumer::Consumer;
pub use item::FrameItem;
pub use producer::Producer;
pub use slot::SlotState;

/// Number of rows in the slot table. The released-buffers mask carries one
/// bit per slot, so this is pinned to 64.
pub const NUM_SLOTS: usize = 64;

/// Upper bound accepted by `Consumer::set_max_acquired_buffer_count`.
pub const MAX_MAX_ACQUIRED_BUFFERS: usize = NUM_SLOTS;

/// Producer APIs that can connect to the queue, one at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N)]
#[repr(u32)]
pub enum ConnectedApi {
    Cpu = 1,
    Gl = 2,
    Media = 3,
    Camera = 4,
}

/// Creates a connected producer/consumer endpoint pair over a fresh queue.
///
/// The allocator is consulted by the producer whenever a dequeue cannot
/// reuse a resident buffer.
pub fn create(allocator: Arc<dyn BufferAllocator>) -> (Producer, Consumer) {
    let core = Arc::new(core::QueueCore::new(allocator));
    (
        Producer::new(Arc::clone(&core)),
        Consumer::new(core),
    )
}
