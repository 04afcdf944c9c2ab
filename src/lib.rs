//! Slot-based exchange of image frames between a single producer and the
//! compositing consumer that displays them.
//!
//! * The `queue` module provides the exchange itself: a fixed table of 64
//!   slots whose buffers travel between the two sides through the
//!   [`queue::Producer`] and [`queue::Consumer`] endpoints. Exactly one side
//!   holds write or read rights to a buffer at any instant, and frames flow
//!   without copies, with precise timing, dropping and back-pressure
//!   semantics.
//!
//! * The `layer` module drives the consumer endpoint on behalf of a
//!   compositor: it decides when to pick up the next frame against the
//!   display clock, tracks frame numbers across drops, and hands release
//!   fences back to the producer.
//!
//! External collaborators (the buffer allocator, texture binding, the
//! display-sync estimator, the hardware composer) are reached through traits
//! so that both state machines can be exercised hermetically.

pub mod buffer;
pub mod fence;
pub mod layer;
pub mod listener;
pub mod queue;
pub mod timeline;

use std::fmt;

use bitflags::bitflags;
use enumn::N;

/// Nanosecond timestamp in the monotonic clock.
pub type Nsecs = i64;

/// Current monotonic time, in nanoseconds.
pub fn monotonic_now() -> Nsecs {
    // CLOCK_MONOTONIC is always available on the platforms we run on.
    let ts = nix::time::clock_gettime(nix::time::ClockId::CLOCK_MONOTONIC)
        .expect("CLOCK_MONOTONIC must be readable");
    ts.tv_sec() * 1_000_000_000 + ts.tv_nsec()
}

/// An opaque pixel format token. The queue passes it through to the
/// allocator untouched; the only property it interprets is whether the
/// format carries an alpha channel.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct PixelFormat(u32);

impl PixelFormat {
    pub const NONE: PixelFormat = PixelFormat(0);
    pub const RGBA_8888: PixelFormat = PixelFormat(1);
    pub const RGBX_8888: PixelFormat = PixelFormat(2);
    pub const RGB_888: PixelFormat = PixelFormat(3);
    pub const RGB_565: PixelFormat = PixelFormat(4);
    pub const BGRA_8888: PixelFormat = PixelFormat(5);
    pub const RGBA_FP16: PixelFormat = PixelFormat(0x16);
    pub const RGBA_1010102: PixelFormat = PixelFormat(0x2b);

    pub const fn from_u32(v: u32) -> Self {
        Self(v)
    }

    pub const fn to_u32(self) -> u32 {
        self.0
    }

    /// Whether pixels in this format are known to be fully opaque.
    ///
    /// Formats in the device-specific range `0x100..=0x1ff` have no alpha
    /// channel. Unknown formats are treated as opaque.
    ///
    /// # Examples
    ///
    /// ```
    /// # use framequeue::PixelFormat;
    /// assert!(!PixelFormat::RGBA_8888.is_opaque());
    /// assert!(PixelFormat::RGBX_8888.is_opaque());
    /// ```
    pub fn is_opaque(self) -> bool {
        if (0x100..=0x1ff).contains(&self.0) {
            return true;
        }
        !matches!(
            self,
            PixelFormat::RGBA_8888
                | PixelFormat::BGRA_8888
                | PixelFormat::RGBA_FP16
                | PixelFormat::RGBA_1010102
        )
    }
}

impl From<u32> for PixelFormat {
    fn from(v: u32) -> Self {
        Self::from_u32(v)
    }
}

impl From<PixelFormat> for u32 {
    fn from(format: PixelFormat) -> Self {
        format.to_u32()
    }
}

impl fmt::Debug for PixelFormat {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_fmt(format_args!("0x{:08x}", self.0))
    }
}

/// An opaque dataspace token, carried alongside each frame and passed
/// through to the compositor untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dataspace(pub u32);

/// A rectangle in buffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub left: i32,
    pub top: i32,
    pub width: u32,
    pub height: u32,
}

impl Rect {
    pub fn new(left: i32, top: i32, width: u32, height: u32) -> Rect {
        Rect {
            left,
            top,
            width,
            height,
        }
    }

    /// A zero-sized rectangle covers nothing.
    ///
    /// # Examples
    ///
    /// ```
    /// # use framequeue::Rect;
    /// assert!(Rect::default().is_empty());
    /// assert!(!Rect::new(0, 0, 640, 480).is_empty());
    /// ```
    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }
}

impl fmt::Display for Rect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {}), {}x{}",
            self.left, self.top, self.width, self.height
        )
    }
}

bitflags! {
    /// Orientation applied to a buffer before it reaches the display.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Transform: u32 {
        const FLIP_H = 1;
        const FLIP_V = 2;
        const ROT_90 = 4;
    }
}

impl Transform {
    /// Maps a rectangle anchored at the origin through this transform.
    /// A 90 degree rotation swaps the extents.
    pub fn transform_rect(self, rect: Rect) -> Rect {
        if self.contains(Transform::ROT_90) {
            Rect::new(rect.left, rect.top, rect.height, rect.width)
        } else {
            rect
        }
    }
}

bitflags! {
    /// Access patterns a buffer must support, combined from both sides of
    /// the queue before allocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct UsageFlags: u32 {
        const CPU_READ = 1;
        const CPU_WRITE = 1 << 1;
        const GPU_TEXTURE = 1 << 8;
        const GPU_RENDER_TARGET = 1 << 9;
        const COMPOSER_OVERLAY = 1 << 11;
        const PROTECTED = 1 << 14;
    }
}

/// How the producer intends a buffer to be fitted to the window it is
/// displayed in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, N, Default)]
#[repr(u32)]
pub enum ScalingMode {
    /// The window size must match the buffer size.
    #[default]
    Freeze = 0,
    ScaleToWindow = 1,
    ScaleCrop = 2,
    NoScaleCrop = 3,
}

/// Opaque handle to the display a release fence was created on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EglDisplay(pub u64);

/// Opaque handle to a GL-side sync object attached on release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EglFence(pub u64);
