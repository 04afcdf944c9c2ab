//! Transaction gating against frames produced by another surface.
//!
//! A sync point pairs a frame number with two independently settable
//! conditions: the frame has become available, and the remote transaction
//! depending on it has been applied. The latcher refuses to latch past a
//! point whose conditions are not both met, and prunes points once the
//! frame they guard has been latched.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct SyncPoint {
    frame_number: u64,
    frame_available: AtomicBool,
    transaction_applied: AtomicBool,
}

impl SyncPoint {
    pub fn new(frame_number: u64) -> SyncPoint {
        SyncPoint {
            frame_number,
            frame_available: AtomicBool::new(false),
            transaction_applied: AtomicBool::new(false),
        }
    }

    pub fn frame_number(&self) -> u64 {
        self.frame_number
    }

    pub fn set_frame_available(&self) {
        self.frame_available.store(true, Ordering::Release);
    }

    pub fn frame_is_available(&self) -> bool {
        self.frame_available.load(Ordering::Acquire)
    }

    pub fn set_transaction_applied(&self) {
        self.transaction_applied.store(true, Ordering::Release);
    }

    pub fn transaction_is_applied(&self) -> bool {
        self.transaction_applied.load(Ordering::Acquire)
    }
}
