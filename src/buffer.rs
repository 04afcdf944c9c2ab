//! Graphics buffer handles and the allocator seam.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::{PixelFormat, UsageFlags};

/// A buffer owned by the graphics allocator.
///
/// The queue tracks identity and allocation parameters only; pixel contents
/// never transit through this crate. Identity is `Arc` pointer identity, so
/// two handles compare equal exactly when they name the same allocation.
#[derive(Debug)]
pub struct GraphicBuffer {
    width: u32,
    height: u32,
    format: PixelFormat,
    usage: UsageFlags,
    generation: AtomicU32,
}

impl GraphicBuffer {
    pub fn new(
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: UsageFlags,
        generation: u32,
    ) -> Arc<GraphicBuffer> {
        Arc::new(GraphicBuffer {
            width,
            height,
            format,
            usage,
            generation: AtomicU32::new(generation),
        })
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn format(&self) -> PixelFormat {
        self.format
    }

    pub fn usage(&self) -> UsageFlags {
        self.usage
    }

    /// The queue generation this buffer belongs to. A buffer whose
    /// generation differs from the queue's is rejected on attach.
    pub fn generation(&self) -> u32 {
        self.generation.load(Ordering::Acquire)
    }

    pub fn set_generation(&self, generation: u32) {
        self.generation.store(generation, Ordering::Release);
    }

    /// Whether a dequeue request with the given parameters can reuse this
    /// buffer as-is.
    pub fn needs_reallocation(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: UsageFlags,
    ) -> bool {
        self.width != width
            || self.height != height
            || self.format != format
            || !self.usage.contains(usage)
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum AllocationError {
    #[error("the allocator is out of graphics memory")]
    NoMemory,
}

/// The seam to the graphics-memory allocator. Called by the producer
/// endpoint whenever a dequeue cannot reuse a resident buffer.
pub trait BufferAllocator: Send + Sync {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: UsageFlags,
    ) -> Result<Arc<GraphicBuffer>, AllocationError>;
}

/// Allocator that hands out plain handles with no backing store. Suitable
/// wherever buffer identity is all that matters.
#[derive(Debug, Default)]
pub struct DefaultAllocator;

impl BufferAllocator for DefaultAllocator {
    fn allocate(
        &self,
        width: u32,
        height: u32,
        format: PixelFormat,
        usage: UsageFlags,
    ) -> Result<Arc<GraphicBuffer>, AllocationError> {
        Ok(GraphicBuffer::new(width, height, format, usage, 0))
    }
}

/// Handle to an out-of-band buffer source whose frames bypass the queue.
/// The core only tracks the handle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SidebandStream(pub u64);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reallocation_check() {
        let usage = UsageFlags::GPU_TEXTURE | UsageFlags::CPU_WRITE;
        let buffer = GraphicBuffer::new(640, 480, PixelFormat::RGBA_8888, usage, 0);

        assert!(!buffer.needs_reallocation(640, 480, PixelFormat::RGBA_8888, usage));
        // A subset of the allocated usage is still satisfiable.
        assert!(!buffer.needs_reallocation(
            640,
            480,
            PixelFormat::RGBA_8888,
            UsageFlags::GPU_TEXTURE
        ));
        assert!(buffer.needs_reallocation(640, 481, PixelFormat::RGBA_8888, usage));
        assert!(buffer.needs_reallocation(640, 480, PixelFormat::RGB_565, usage));
        assert!(buffer.needs_reallocation(
            640,
            480,
            PixelFormat::RGBA_8888,
            usage | UsageFlags::PROTECTED
        ));
    }

    #[test]
    fn generation_is_updatable() {
        let buffer = GraphicBuffer::new(1, 1, PixelFormat::RGBA_8888, UsageFlags::empty(), 3);
        assert_eq!(buffer.generation(), 3);
        buffer.set_generation(4);
        assert_eq!(buffer.generation(), 4);
    }
}
