//! Per-surface driver over the consumer endpoint.
//!
//! The latcher keeps a shadow copy of the frame FIFO (fed by the queue's
//! notifications), decides once per compositor cycle whether the next frame
//! is due against the display clock, binds acquired buffers to a texture,
//! and returns displaced buffers to the producer with the hardware
//! composer's release fence attached.
//!
//! Lock discipline: the shadow queue and the latched state live behind
//! separate locks, and neither is held while calling into the consumer
//! endpoint. The queue core likewise never holds its lock while invoking
//! the listener entry points here, so either side may re-enter the other.

pub mod sync_point;

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, Weak};
use std::time::Duration;

use lazy_static::lazy_static;
use log::{debug, error, warn};
use thiserror::Error;

use crate::buffer::{GraphicBuffer, SidebandStream};
use crate::fence::{Fence, FenceTime, SIGNAL_TIME_PENDING};
use crate::listener::ConsumerListener;
use crate::queue::consumer::{Abandoned, AcquireError};
use crate::queue::{Consumer, FrameItem, NUM_SLOTS};
use crate::timeline::{FrameEventHistory, FrameTracker, ReleaseTimeline};
use crate::{monotonic_now, Dataspace, Nsecs, Rect, ScalingMode, Transform};

pub use sync_point::SyncPoint;

/// Timestamps more than a second past the expected present are implausible
/// and treated as "present now".
const MAX_REASONABLE_NSEC: Nsecs = 1_000_000_000;

/// Bounded wait for the in-order predecessor of an out-of-order frame
/// notification.
const QUEUE_ITEM_TIMEOUT: Duration = Duration::from_millis(500);

lazy_static! {
    /// Process-wide toggle that permits latching buffers whose acquire
    /// fence has not signaled. Read once, on first use.
    static ref LATCH_UNSIGNALED: bool = std::env::var("FRAMEQUEUE_LATCH_UNSIGNALED")
        .ok()
        .and_then(|value| value.parse::<i64>().ok())
        .map(|value| value != 0)
        .unwrap_or(false);
}

/// Estimates when the next refresh will reach the display.
pub trait DisplaySync {
    fn expected_present(&self) -> Nsecs;
}

/// Lets the latcher request another compositor cycle.
pub trait CompositorSignal: Send + Sync {
    fn signal_layer_update(&self);
}

/// Pre-promotion veto over an acquired frame (wrong dimensions, frozen
/// geometry, ...). A rejected frame is released immediately and its shadow
/// entry discarded.
pub trait FrameRejecter {
    fn reject(&mut self, buffer: &GraphicBuffer, item: &FrameItem) -> bool;
}

/// A rejecter that accepts everything.
#[derive(Debug, Default)]
pub struct AcceptAll;

impl FrameRejecter for AcceptAll {
    fn reject(&mut self, _buffer: &GraphicBuffer, _item: &FrameItem) -> bool {
        false
    }
}

#[derive(Debug, Error)]
#[error("texture binding failed: {0}")]
pub struct BindError(pub String);

/// Binds an acquired buffer to the texture sampled at composition time.
pub trait TextureImage: Send {
    fn bind(&mut self, buffer: &Arc<GraphicBuffer>, acquire_fence: &Fence) -> Result<(), BindError>;
}

enum UpdateError {
    PresentLater,
    Rejected,
    Failed,
}

struct PendingRelease {
    slot: usize,
    frame_number: u64,
}

#[derive(Default)]
struct ShadowState {
    items: VecDeque<FrameItem>,
    last_frame_number_received: u64,
}

struct LatchState {
    active_buffer: Option<Arc<GraphicBuffer>>,
    active_slot: Option<usize>,
    /// Cached slot-to-buffer mappings, so acquires may omit the handle.
    slot_buffers: Vec<Option<Arc<GraphicBuffer>>>,
    current_frame_number: u64,
    previous_frame_number: u64,
    current_fence: Fence,
    current_timestamp: Nsecs,
    current_crop: Rect,
    current_transform: Transform,
    current_scaling_mode: ScalingMode,
    current_dataspace: Dataspace,
    current_opacity: bool,
    buffer_latched: bool,
    /// True between a successful latch and the next pre-composition.
    refresh_pending: bool,
    frame_latency_needed: bool,
    /// Sticky: once a texture update fails, the shadow queue can no longer
    /// be trusted and further latches are refused.
    update_tex_image_failed: bool,
    pending_release: Option<PendingRelease>,
    /// Hardware composer release fence for the next pending release.
    release_fence: Fence,
    sideband_stream: Option<SidebandStream>,
    bounds: (u32, u32),
    transform: Transform,
}

impl LatchState {
    fn new() -> LatchState {
        LatchState {
            active_buffer: None,
            active_slot: None,
            slot_buffers: vec![None; NUM_SLOTS],
            current_frame_number: 0,
            previous_frame_number: 0,
            current_fence: Fence::signaled(),
            current_timestamp: 0,
            current_crop: Rect::default(),
            current_transform: Transform::empty(),
            current_scaling_mode: ScalingMode::Freeze,
            current_dataspace: Dataspace::default(),
            current_opacity: true,
            buffer_latched: false,
            refresh_pending: false,
            frame_latency_needed: false,
            update_tex_image_failed: false,
            pending_release: None,
            release_fence: Fence::signaled(),
            sideband_stream: None,
            bounds: (0, 0),
            transform: Transform::empty(),
        }
    }
}

/// Drives one surface's consumer endpoint on behalf of a compositor.
pub struct LayerLatcher {
    name: String,
    consumer: Consumer,
    compositor: Arc<dyn CompositorSignal>,
    texture: Mutex<Box<dyn TextureImage>>,
    shadow: Mutex<ShadowState>,
    shadow_cond: Condvar,
    queued_frames: AtomicI32,
    sideband_stream_changed: AtomicBool,
    auto_refresh: AtomicBool,
    opaque_layer: AtomicBool,
    current: Mutex<LatchState>,
    /// Kept in frame-number order; points are registered as transactions
    /// are created, which follows frame order.
    sync_points: Mutex<Vec<Arc<SyncPoint>>>,
    frame_events: Mutex<FrameEventHistory>,
    release_timeline: Mutex<ReleaseTimeline>,
    frame_tracker: Mutex<FrameTracker>,
}

impl LayerLatcher {
    /// Connects a latcher to the consumer side of a queue. The latcher
    /// registers itself as the queue's consumer listener.
    pub fn new(
        name: &str,
        consumer: Consumer,
        compositor: Arc<dyn CompositorSignal>,
        texture: Box<dyn TextureImage>,
    ) -> Result<Arc<LayerLatcher>, Abandoned> {
        consumer.set_consumer_name(name);
        let latcher = Arc::new(LayerLatcher {
            name: name.to_string(),
            consumer,
            compositor,
            texture: Mutex::new(texture),
            shadow: Mutex::new(ShadowState::default()),
            shadow_cond: Condvar::new(),
            queued_frames: AtomicI32::new(0),
            sideband_stream_changed: AtomicBool::new(false),
            auto_refresh: AtomicBool::new(false),
            opaque_layer: AtomicBool::new(false),
            current: Mutex::new(LatchState::new()),
            sync_points: Mutex::new(Vec::new()),
            frame_events: Mutex::new(FrameEventHistory::new()),
            release_timeline: Mutex::new(ReleaseTimeline::new()),
            frame_tracker: Mutex::new(FrameTracker::new()),
        });
        let proxy = Arc::new(LatcherListener {
            layer: Arc::downgrade(&latcher),
        });
        latcher.consumer.connect(proxy)?;
        Ok(latcher)
    }

    pub fn consumer(&self) -> &Consumer {
        &self.consumer
    }

    /// Sets the layer extents used for the dirty region.
    pub fn set_bounds(&self, width: u32, height: u32) {
        self.current.lock().unwrap().bounds = (width, height);
    }

    /// Sets the layer transform applied to the dirty region.
    pub fn set_transform(&self, transform: Transform) {
        self.current.lock().unwrap().transform = transform;
    }

    /// Marks the layer as opaque regardless of its buffer format.
    pub fn set_opaque(&self, opaque: bool) {
        self.opaque_layer.store(opaque, Ordering::Relaxed);
    }

    /// Producer-requested continuous redraw.
    pub fn set_auto_refresh(&self, auto_refresh: bool) {
        self.auto_refresh.store(auto_refresh, Ordering::Relaxed);
    }

    pub fn active_buffer(&self) -> Option<Arc<GraphicBuffer>> {
        self.current.lock().unwrap().active_buffer.clone()
    }

    pub fn current_frame_number(&self) -> u64 {
        self.current.lock().unwrap().current_frame_number
    }

    pub fn current_fence(&self) -> Fence {
        self.current.lock().unwrap().current_fence.clone()
    }

    pub fn current_dataspace(&self) -> Dataspace {
        self.current.lock().unwrap().current_dataspace
    }

    pub fn queued_frame_count(&self) -> i32 {
        self.queued_frames.load(Ordering::Acquire)
    }

    /// Whether texture updates have failed and the layer stopped latching.
    pub fn texture_update_failed(&self) -> bool {
        self.current.lock().unwrap().update_tex_image_failed
    }

    /// Whether this layer will cover every pixel it occupies. False until
    /// a buffer or sideband stream is present.
    pub fn is_opaque(&self) -> bool {
        let current = self.current.lock().unwrap();
        self.is_opaque_locked(&current)
    }

    fn is_opaque_locked(&self, current: &LatchState) -> bool {
        if current.sideband_stream.is_none() && current.active_buffer.is_none() {
            return false;
        }
        self.opaque_layer.load(Ordering::Relaxed) || current.current_opacity
    }

    /// Whether the head of the shadow queue should reach the display at the
    /// next refresh.
    pub fn should_present_now(&self, display_sync: &dyn DisplaySync) -> bool {
        if self.sideband_stream_changed.load(Ordering::Acquire)
            || self.auto_refresh.load(Ordering::Relaxed)
        {
            return true;
        }

        let shadow = self.shadow.lock().unwrap();
        let Some(head) = shadow.items.front() else {
            return false;
        };
        let timestamp = head.timestamp;
        let expected_present = display_sync.expected_present();

        // Timestamps more than a second in the future carry no intent.
        let is_plausible = timestamp < expected_present + MAX_REASONABLE_NSEC;
        if !is_plausible {
            warn!(
                "[{}] timestamp {} seems implausible relative to expected present {}",
                self.name, timestamp, expected_present
            );
        }

        let is_due = timestamp < expected_present;
        is_due || !is_plausible
    }

    /// Frame number at the head of the shadow queue, or the latched frame
    /// number once the queue has drained.
    pub fn head_frame_number(&self) -> u64 {
        let shadow = self.shadow.lock().unwrap();
        match shadow.items.front() {
            Some(head) => head.frame_number,
            None => self.current.lock().unwrap().current_frame_number,
        }
    }

    /// Whether the head frame is readable. An empty shadow queue and a
    /// droppable head both count as signaled.
    pub fn head_fence_has_signaled(&self) -> bool {
        if *LATCH_UNSIGNALED {
            return true;
        }

        let shadow = self.shadow.lock().unwrap();
        let Some(head) = shadow.items.front() else {
            return true;
        };
        if head.is_droppable {
            // The head may be replaced before its fence fires; waiting for
            // it could leave the layer with no latchable frame at all.
            return true;
        }
        head.fence.signal_time() != SIGNAL_TIME_PENDING
    }

    /// Registers a transaction gate. Points must be added in frame order.
    pub fn add_sync_point(&self, point: Arc<SyncPoint>) {
        self.sync_points.lock().unwrap().push(point);
    }

    /// Sync points not yet settled by a latch.
    pub fn pending_sync_points(&self) -> usize {
        self.sync_points.lock().unwrap().len()
    }

    /// Marks sync points satisfied by the current head frame, if readable.
    pub fn notify_available_frames(&self) {
        let head_frame_number = self.head_frame_number();
        let head_fence_signaled = self.head_fence_has_signaled();
        let points = self.sync_points.lock().unwrap();
        for point in points.iter() {
            if head_frame_number >= point.frame_number() && head_fence_signaled {
                point.set_frame_available();
            }
        }
    }

    fn all_transactions_signaled(&self) -> bool {
        let head_frame_number = self.head_frame_number();
        let mut matching_frames_found = false;
        let mut all_applied = true;

        let points = self.sync_points.lock().unwrap();
        for point in points.iter() {
            if point.frame_number() > head_frame_number {
                break;
            }
            matching_frames_found = true;

            if !point.frame_is_available() {
                // The remote side has not heard that its frame arrived;
                // tell it now and retry this cycle later.
                point.set_frame_available();
                all_applied = false;
                break;
            }
            all_applied = all_applied && point.transaction_is_applied();
        }
        !matching_frames_found || all_applied
    }

    /// Picks up the next due frame, if any, and promotes it to the active
    /// buffer. Returns the dirty region to recompose; empty whenever
    /// nothing was latched. Called once per compositor cycle.
    pub fn latch(
        &self,
        recompute_visible_regions: &mut bool,
        latch_time: Nsecs,
        display_sync: &dyn DisplaySync,
        rejecter: &mut dyn FrameRejecter,
    ) -> Rect {
        // An out-of-band stream takeover short-circuits the whole cycle.
        if self
            .sideband_stream_changed
            .compare_exchange(true, false, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let stream = self.consumer.get_sideband_stream();
            let mut current = self.current.lock().unwrap();
            current.sideband_stream = stream;
            *recompute_visible_regions = true;
            let (width, height) = current.bounds;
            return current.transform.transform_rect(Rect::new(0, 0, width, height));
        }

        if self.queued_frames.load(Ordering::Acquire) <= 0
            && !self.auto_refresh.load(Ordering::Relaxed)
        {
            return Rect::default();
        }

        // A latched frame must go through a full composition cycle before
        // the next one can be picked up.
        if self.current.lock().unwrap().refresh_pending {
            return Rect::default();
        }

        if !self.head_fence_has_signaled() {
            self.compositor.signal_layer_update();
            return Rect::default();
        }

        let (old_opacity, old_buffer, old_crop, old_transform, old_scaling_mode) = {
            let current = self.current.lock().unwrap();
            (
                self.is_opaque_locked(&current),
                current.active_buffer.clone(),
                current.current_crop,
                current.current_transform,
                current.current_scaling_mode,
            )
        };

        if !self.all_transactions_signaled() {
            self.compositor.signal_layer_update();
            return Rect::default();
        }

        let item = match self.update_tex_image(display_sync, rejecter) {
            Ok(Some(item)) => item,
            Ok(None) => return Rect::default(),
            Err(UpdateError::PresentLater) => {
                // The producer does not want this frame on screen yet.
                self.compositor.signal_layer_update();
                return Rect::default();
            }
            Err(UpdateError::Rejected) => {
                let mut shadow = self.shadow.lock().unwrap();
                if shadow.items.pop_front().is_some() {
                    self.queued_frames.fetch_sub(1, Ordering::AcqRel);
                }
                return Rect::default();
            }
            Err(UpdateError::Failed) => {
                // The shadow queue no longer reflects the FIFO; ignoring
                // all further updates is the only safe course.
                let mut shadow = self.shadow.lock().unwrap();
                shadow.items.clear();
                self.queued_frames.store(0, Ordering::Release);
                drop(shadow);
                self.current.lock().unwrap().update_tex_image_failed = true;
                return Rect::default();
            }
        };

        let current_frame_number = item.frame_number;

        {
            // The producer may have dropped frames between notification and
            // acquisition; the shadow queue follows suit.
            let mut shadow = self.shadow.lock().unwrap();
            while let Some(front) = shadow.items.front() {
                if front.frame_number == current_frame_number {
                    break;
                }
                shadow.items.pop_front();
                self.queued_frames.fetch_sub(1, Ordering::AcqRel);
            }
            shadow.items.pop_front();
        }

        if self.queued_frames.fetch_sub(1, Ordering::AcqRel) > 1
            || self.auto_refresh.load(Ordering::Relaxed)
        {
            self.compositor.signal_layer_update();
        }

        let dirty = {
            let mut current = self.current.lock().unwrap();
            if current.active_buffer.is_none() {
                // Only possible if the very first frame was rejected.
                return Rect::default();
            }

            current.buffer_latched = true;
            current.previous_frame_number = current.current_frame_number;
            current.current_frame_number = current_frame_number;
            current.refresh_pending = true;
            current.frame_latency_needed = true;

            if old_buffer.is_none() {
                // First frame; geometry was never computed.
                *recompute_visible_regions = true;
            }
            if item.crop != old_crop
                || item.transform != old_transform
                || item.scaling_mode != old_scaling_mode
            {
                *recompute_visible_regions = true;
            }
            if let (Some(old), Some(new)) = (&old_buffer, &current.active_buffer) {
                if new.width() != old.width() || new.height() != old.height() {
                    *recompute_visible_regions = true;
                }
            }

            current.current_opacity = current
                .active_buffer
                .as_ref()
                .map(|b| b.format().is_opaque())
                .unwrap_or(false);
            if old_opacity != self.is_opaque_locked(&current) {
                *recompute_visible_regions = true;
            }

            let (width, height) = current.bounds;
            current.transform.transform_rect(Rect::new(0, 0, width, height))
        };

        self.frame_events
            .lock()
            .unwrap()
            .add_latch(current_frame_number, latch_time);

        // Sync points guarding frames up to the latched one are settled.
        {
            let mut points = self.sync_points.lock().unwrap();
            points.retain(|point| {
                if !point.frame_is_available() || !point.transaction_is_applied() {
                    // Added since latching began; not ours to drop yet.
                    return true;
                }
                point.frame_number() > current_frame_number
            });
        }

        dirty
    }

    /// Acquires the next frame and binds it to the texture. On success the
    /// acquired item is returned and the displaced buffer parked for
    /// release.
    fn update_tex_image(
        &self,
        display_sync: &dyn DisplaySync,
        rejecter: &mut dyn FrameRejecter,
    ) -> Result<Option<FrameItem>, UpdateError> {
        if self.current.lock().unwrap().update_tex_image_failed {
            return Err(UpdateError::Failed);
        }

        // Only accept frames the notification path has told us about, so
        // the shadow queue stays coherent.
        let max_frame_number = self.shadow.lock().unwrap().last_frame_number_received;

        let item = match self
            .consumer
            .acquire(display_sync.expected_present(), max_frame_number)
        {
            Ok(item) => item,
            Err(AcquireError::PresentLater) => return Err(UpdateError::PresentLater),
            Err(AcquireError::NoBufferAvailable) => return Ok(None),
            Err(e @ AcquireError::MaxAcquiredBufferCount) => {
                warn!("[{}] acquire failed: {}", self.name, e);
                return Err(UpdateError::Failed);
            }
        };

        let buffer = {
            let mut current = self.current.lock().unwrap();
            if let Some(buffer) = &item.graphic_buffer {
                current.slot_buffers[item.slot] = Some(Arc::clone(buffer));
            }
            current.slot_buffers[item.slot].clone()
        };
        let Some(buffer) = buffer else {
            error!(
                "[{}] acquired slot {} with no cached buffer",
                self.name, item.slot
            );
            let _ = self
                .consumer
                .release(item.slot, item.frame_number, Fence::signaled(), None, None);
            return Err(UpdateError::Failed);
        };

        if rejecter.reject(&buffer, &item) {
            debug!("[{}] frame {} rejected", self.name, item.frame_number);
            let _ = self
                .consumer
                .release(item.slot, item.frame_number, Fence::signaled(), None, None);
            return Err(UpdateError::Rejected);
        }

        if let Err(e) = self.texture.lock().unwrap().bind(&buffer, &item.fence) {
            warn!("[{}] {}", self.name, e);
            let _ = self
                .consumer
                .release(item.slot, item.frame_number, Fence::signaled(), None, None);
            return Err(UpdateError::Failed);
        }

        let mut current = self.current.lock().unwrap();
        if let Some(previous_slot) = current.active_slot {
            current.pending_release = Some(PendingRelease {
                slot: previous_slot,
                frame_number: current.current_frame_number,
            });
        }
        current.active_slot = Some(item.slot);
        current.active_buffer = Some(buffer);
        current.current_fence = item.fence.clone();
        current.current_timestamp = item.timestamp;
        current.current_crop = item.crop;
        current.current_transform = item.transform;
        current.current_scaling_mode = item.scaling_mode;
        current.current_dataspace = item.dataspace;

        Ok(Some(item))
    }

    /// Releases the buffer displaced by the last latch, handing the
    /// hardware composer's release fence back to the producer. Returns
    /// false when no release was pending.
    pub fn release_pending_buffer(&self, dequeue_ready_time: Nsecs) -> bool {
        let (pending, release_fence, previous_frame_number) = {
            let mut current = self.current.lock().unwrap();
            let Some(pending) = current.pending_release.take() else {
                return false;
            };
            (
                pending,
                current.release_fence.clone(),
                current.previous_frame_number,
            )
        };

        if let Err(e) =
            self.consumer
                .release(pending.slot, pending.frame_number, release_fence.clone(), None, None)
        {
            debug!("[{}] releasing slot {}: {}", self.name, pending.slot, e);
        }

        let release_fence_time = Arc::new(FenceTime::new(release_fence));
        {
            let mut timeline = self.release_timeline.lock().unwrap();
            timeline.update_signal_times();
            timeline.push(Arc::clone(&release_fence_time));
        }
        if previous_frame_number != 0 {
            self.frame_events.lock().unwrap().add_release(
                previous_frame_number,
                dequeue_ready_time,
                release_fence_time,
            );
        }
        true
    }

    /// Stores the hardware composer's release fence for the next pending
    /// release.
    pub fn on_layer_displayed(&self, release_fence: Fence) {
        self.current.lock().unwrap().release_fence = release_fence;
    }

    /// Records the pre-composition event and reopens latching. Returns
    /// whether another cycle is already warranted.
    pub fn on_pre_composition(&self, refresh_start_time: Nsecs) -> bool {
        let mut current = self.current.lock().unwrap();
        if current.buffer_latched {
            self.frame_events
                .lock()
                .unwrap()
                .add_pre_composition(current.current_frame_number, refresh_start_time);
        }
        current.refresh_pending = false;
        drop(current);

        self.queued_frames.load(Ordering::Acquire) > 0
            || self.sideband_stream_changed.load(Ordering::Acquire)
            || self.auto_refresh.load(Ordering::Relaxed)
    }

    /// Records post-composition timing and feeds the frame tracker.
    /// Returns false when no new frame was latched for this composition.
    pub fn on_post_composition(
        &self,
        gpu_done: Arc<FenceTime>,
        present: Arc<FenceTime>,
        refresh_time: Nsecs,
    ) -> bool {
        let mut current = self.current.lock().unwrap();
        if !current.frame_latency_needed {
            return false;
        }

        self.frame_events.lock().unwrap().add_post_composition(
            current.current_frame_number,
            Arc::clone(&gpu_done),
            Arc::clone(&present),
        );

        let mut tracker = self.frame_tracker.lock().unwrap();
        tracker.set_desired_present_time(current.current_timestamp);

        let frame_ready = Arc::new(FenceTime::new(current.current_fence.clone()));
        if frame_ready.is_valid() {
            tracker.set_frame_ready_fence(frame_ready);
        } else {
            // No fence for this frame; assume it was ready at its desired
            // present time.
            tracker.set_frame_ready_time(current.current_timestamp);
        }

        if present.is_valid() {
            tracker.set_actual_present_fence(present);
        } else {
            // Without a present fence the refresh timestamp is the best
            // estimate available.
            tracker.set_actual_present_time(refresh_time);
        }

        tracker.advance_frame();
        current.frame_latency_needed = false;
        true
    }

    /// Whether any pipeline timestamps are still on record for a frame.
    pub fn has_frame_events(&self, frame_number: u64) -> bool {
        self.frame_events.lock().unwrap().get(frame_number).is_some()
    }

    /// Listener entry point: a frame was queued. Admits frames in
    /// ascending frame-number order, waiting a bounded time for stragglers.
    pub fn on_frame_available(&self, item: &FrameItem) {
        {
            let mut shadow = self.shadow.lock().unwrap();
            // The first frame after a producer restart resets the tracker.
            if item.frame_number == 1 {
                shadow.last_frame_number_received = 0;
            }
            shadow = self.wait_for_predecessor(shadow, item.frame_number);
            shadow.items.push_back(item.clone());
            self.queued_frames.fetch_add(1, Ordering::AcqRel);
            shadow.last_frame_number_received = item.frame_number;
            self.shadow_cond.notify_all();
        }

        self.frame_events
            .lock()
            .unwrap()
            .add_queue(item.frame_number, monotonic_now());
        self.compositor.signal_layer_update();
    }

    /// Listener entry point: an async frame replaced the shadow tail.
    pub fn on_frame_replaced(&self, item: &FrameItem) {
        let mut shadow = self.shadow.lock().unwrap();
        shadow = self.wait_for_predecessor(shadow, item.frame_number);
        let Some(back) = shadow.items.back_mut() else {
            error!("[{}] cannot replace a frame on an empty queue", self.name);
            return;
        };
        *back = item.clone();
        shadow.last_frame_number_received = item.frame_number;
        self.shadow_cond.notify_all();
    }

    fn wait_for_predecessor<'a>(
        &self,
        mut shadow: MutexGuard<'a, ShadowState>,
        frame_number: u64,
    ) -> MutexGuard<'a, ShadowState> {
        while frame_number != shadow.last_frame_number_received + 1 {
            let (guard, timeout) = self
                .shadow_cond
                .wait_timeout(shadow, QUEUE_ITEM_TIMEOUT)
                .unwrap();
            shadow = guard;
            if timeout.timed_out() {
                error!(
                    "[{}] timed out waiting for in-order frame callback (frame {}, last {})",
                    self.name, frame_number, shadow.last_frame_number_received
                );
                break;
            }
        }
        shadow
    }

    fn buffers_released(&self) {
        let Ok(mask) = self.consumer.get_released_buffers() else {
            return;
        };
        let mut current = self.current.lock().unwrap();
        for slot in 0..NUM_SLOTS {
            if mask & (1u64 << slot) != 0 {
                current.slot_buffers[slot] = None;
            }
        }
    }

    fn notify_sideband_changed(&self) {
        if self
            .sideband_stream_changed
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.compositor.signal_layer_update();
        }
    }
}

/// Forwards queue notifications to the latcher without keeping it alive.
struct LatcherListener {
    layer: Weak<LayerLatcher>,
}

impl ConsumerListener for LatcherListener {
    fn on_frame_available(&self, item: &FrameItem) {
        if let Some(layer) = self.layer.upgrade() {
            layer.on_frame_available(item);
        }
    }

    fn on_frame_replaced(&self, item: &FrameItem) {
        if let Some(layer) = self.layer.upgrade() {
            layer.on_frame_replaced(item);
        }
    }

    fn on_buffers_released(&self) {
        if let Some(layer) = self.layer.upgrade() {
            layer.buffers_released();
        }
    }

    fn on_sideband_stream_changed(&self) {
        if let Some(layer) = self.layer.upgrade() {
            layer.notify_sideband_changed();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    use super::*;
    use crate::buffer::DefaultAllocator;
    use crate::listener::ProducerListener;
    use crate::queue::producer::QueueFrameInput;
    use crate::queue::{create, ConnectedApi, Producer};
    use crate::{PixelFormat, UsageFlags};

    struct FixedSync(Nsecs);

    impl DisplaySync for FixedSync {
        fn expected_present(&self) -> Nsecs {
            self.0
        }
    }

    #[derive(Default)]
    struct SignalCounter {
        updates: AtomicUsize,
    }

    impl CompositorSignal for SignalCounter {
        fn signal_layer_update(&self) {
            self.updates.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[derive(Default)]
    struct TextureProbe {
        binds: AtomicUsize,
        fail_next: AtomicBool,
    }

    struct RecordingTexture {
        probe: Arc<TextureProbe>,
    }

    impl TextureImage for RecordingTexture {
        fn bind(&mut self, _buffer: &Arc<GraphicBuffer>, _fence: &Fence) -> Result<(), BindError> {
            self.probe.binds.fetch_add(1, Ordering::SeqCst);
            if self.probe.fail_next.load(Ordering::SeqCst) {
                return Err(BindError("forced failure".into()));
            }
            Ok(())
        }
    }

    struct NullProducerListener;

    impl ProducerListener for NullProducerListener {
        fn on_buffer_released(&self) {}
    }

    struct RejectAll;

    impl FrameRejecter for RejectAll {
        fn reject(&mut self, _buffer: &GraphicBuffer, _item: &FrameItem) -> bool {
            true
        }
    }

    struct Harness {
        producer: Producer,
        latcher: Arc<LayerLatcher>,
        signals: Arc<SignalCounter>,
        texture: Arc<TextureProbe>,
    }

    fn harness() -> Harness {
        let (producer, consumer) = create(Arc::new(DefaultAllocator));
        let signals = Arc::new(SignalCounter::default());
        let probe = Arc::new(TextureProbe::default());
        let latcher = LayerLatcher::new(
            "test-layer",
            consumer,
            Arc::clone(&signals) as Arc<dyn CompositorSignal>,
            Box::new(RecordingTexture {
                probe: Arc::clone(&probe),
            }),
        )
        .unwrap();
        latcher.set_bounds(640, 480);
        producer
            .connect(ConnectedApi::Gl, Arc::new(NullProducerListener))
            .unwrap();
        Harness {
            producer,
            latcher,
            signals,
            texture: probe,
        }
    }

    fn queue_frame(harness: &Harness, timestamp: Nsecs, fence: Fence) -> (usize, u64) {
        queue_frame_input(
            harness,
            QueueFrameInput {
                timestamp,
                is_auto_timestamp: false,
                fence,
                ..QueueFrameInput::default()
            },
        )
    }

    fn queue_frame_input(harness: &Harness, input: QueueFrameInput) -> (usize, u64) {
        let (slot, _) = harness
            .producer
            .dequeue(0, 0, PixelFormat::NONE, UsageFlags::empty())
            .unwrap();
        let frame = harness.producer.queue(slot, input).unwrap();
        (slot, frame)
    }

    fn latch(harness: &Harness, expected_present: Nsecs) -> (Rect, bool) {
        let mut recompute = false;
        let dirty = harness.latcher.latch(
            &mut recompute,
            expected_present,
            &FixedSync(expected_present),
            &mut AcceptAll,
        );
        (dirty, recompute)
    }

    #[test]
    fn latch_happy_path() {
        let harness = harness();
        let (slot, frame) = queue_frame(&harness, 1_000, Fence::signaled());
        assert_eq!(harness.latcher.queued_frame_count(), 1);
        assert!(harness.latcher.should_present_now(&FixedSync(2_000)));

        let (dirty, recompute) = latch(&harness, 2_000);
        assert_eq!(dirty, Rect::new(0, 0, 640, 480));
        // The first buffer invalidates the layer geometry.
        assert!(recompute);
        assert_eq!(harness.latcher.current_frame_number(), frame);
        assert!(harness.latcher.active_buffer().is_some());
        assert_eq!(harness.latcher.queued_frame_count(), 0);
        assert_eq!(harness.texture.binds.load(Ordering::SeqCst), 1);

        // No composition happened yet: the next frame has to wait.
        queue_frame(&harness, 1_500, Fence::signaled());
        let (dirty, _) = latch(&harness, 2_000);
        assert!(dirty.is_empty());

        assert!(harness.latcher.on_pre_composition(2_100));
        let (dirty, _) = latch(&harness, 3_000);
        assert!(!dirty.is_empty());

        // The displaced buffer goes back through the release path.
        harness.latcher.on_layer_displayed(Fence::signaled());
        assert!(harness.latcher.release_pending_buffer(3_100));
        assert!(!harness.latcher.release_pending_buffer(3_200));
        let (reused, _) = harness
            .producer
            .dequeue(0, 0, PixelFormat::NONE, UsageFlags::empty())
            .unwrap();
        assert_eq!(reused, slot);
    }

    #[test]
    fn latch_waits_for_head_fence() {
        let harness = harness();
        let fence = Fence::new();
        queue_frame(&harness, 1_000, fence.clone());

        assert!(!harness.latcher.head_fence_has_signaled());
        let before = harness.signals.updates.load(Ordering::SeqCst);
        let (dirty, _) = latch(&harness, 2_000);
        assert!(dirty.is_empty());
        assert_eq!(harness.latcher.queued_frame_count(), 1);
        // Another cycle was requested to retry.
        assert!(harness.signals.updates.load(Ordering::SeqCst) > before);

        fence.signal(1_500);
        let (dirty, _) = latch(&harness, 2_000);
        assert!(!dirty.is_empty());
    }

    #[test]
    fn droppable_head_counts_as_signaled() {
        let harness = harness();
        queue_frame_input(
            &harness,
            QueueFrameInput {
                timestamp: 1_000,
                is_auto_timestamp: false,
                is_droppable: true,
                fence: Fence::new(),
                ..QueueFrameInput::default()
            },
        );
        // The pending fence does not gate a droppable head.
        assert!(harness.latcher.head_fence_has_signaled());
        let (dirty, _) = latch(&harness, 2_000);
        assert!(!dirty.is_empty());
    }

    #[test]
    fn present_later_schedules_retry() {
        let harness = harness();
        queue_frame(&harness, 1_500_000_000, Fence::signaled());

        let before = harness.signals.updates.load(Ordering::SeqCst);
        let (dirty, _) = latch(&harness, 1_000_000_000);
        assert!(dirty.is_empty());
        assert_eq!(harness.latcher.queued_frame_count(), 1);
        assert!(harness.signals.updates.load(Ordering::SeqCst) > before);

        // Once due, the frame latches.
        let (dirty, _) = latch(&harness, 1_600_000_000);
        assert!(!dirty.is_empty());
    }

    #[test]
    fn rejected_frame_is_dropped_from_shadow_queue() {
        let harness = harness();
        let (slot, _frame) = queue_frame(&harness, 1_000, Fence::signaled());

        let mut recompute = false;
        let dirty =
            harness
                .latcher
                .latch(&mut recompute, 2_000, &FixedSync(2_000), &mut RejectAll);
        assert!(dirty.is_empty());
        assert_eq!(harness.latcher.queued_frame_count(), 0);
        assert!(harness.latcher.active_buffer().is_none());

        // The rejected buffer was released; the producer gets it back.
        let (reused, _) = harness
            .producer
            .dequeue(0, 0, PixelFormat::NONE, UsageFlags::empty())
            .unwrap();
        assert_eq!(reused, slot);

        // The layer still works for the next frame.
        queue_frame(&harness, 1_200, Fence::signaled());
        let (dirty, _) = latch(&harness, 2_000);
        assert!(!dirty.is_empty());
        assert!(!harness.latcher.texture_update_failed());
    }

    #[test]
    fn bind_failure_is_sticky() {
        let harness = harness();
        harness.texture.fail_next.store(true, Ordering::SeqCst);
        queue_frame(&harness, 1_000, Fence::signaled());

        let (dirty, _) = latch(&harness, 2_000);
        assert!(dirty.is_empty());
        assert!(harness.latcher.texture_update_failed());
        assert_eq!(harness.latcher.queued_frame_count(), 0);

        // Even after binding recovers, the shadow queue is untrustworthy
        // and latching stays off.
        harness.texture.fail_next.store(false, Ordering::SeqCst);
        queue_frame(&harness, 1_200, Fence::signaled());
        assert_eq!(harness.latcher.queued_frame_count(), 1);
        let (dirty, _) = latch(&harness, 2_000);
        assert!(dirty.is_empty());
        assert_eq!(harness.latcher.queued_frame_count(), 0);
    }

    #[test]
    fn dropped_frames_are_reconciled_with_shadow_queue() {
        let harness = harness();
        queue_frame(&harness, 1_000_000_000, Fence::signaled());
        let (_slot2, frame2) = queue_frame(&harness, 2_000_000_000, Fence::signaled());
        assert_eq!(harness.latcher.queued_frame_count(), 2);

        // The consumer drops the stale front on acquire; the shadow queue
        // follows.
        let (dirty, _) = latch(&harness, 2_000_000_000);
        assert!(!dirty.is_empty());
        assert_eq!(harness.latcher.current_frame_number(), frame2);
        assert_eq!(harness.latcher.queued_frame_count(), 0);
    }

    #[test]
    fn frame_notifications_are_reordered() {
        let harness = harness();

        let latcher = Arc::clone(&harness.latcher);
        let straggler = thread::spawn(move || {
            latcher.on_frame_available(&FrameItem {
                frame_number: 2,
                ..FrameItem::default()
            });
        });

        thread::sleep(Duration::from_millis(50));
        assert_eq!(harness.latcher.queued_frame_count(), 0);
        harness.latcher.on_frame_available(&FrameItem {
            frame_number: 1,
            ..FrameItem::default()
        });
        straggler.join().unwrap();

        assert_eq!(harness.latcher.queued_frame_count(), 2);
        assert_eq!(harness.latcher.head_frame_number(), 1);
    }

    #[test]
    fn ordering_wait_gives_up_after_timeout() {
        let harness = harness();
        let start = std::time::Instant::now();
        harness.latcher.on_frame_available(&FrameItem {
            frame_number: 3,
            ..FrameItem::default()
        });
        // The predecessor never arrives; the frame is admitted after the
        // bounded wait.
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert_eq!(harness.latcher.queued_frame_count(), 1);
        assert_eq!(harness.latcher.head_frame_number(), 3);
    }

    #[test]
    fn sideband_stream_takes_over() {
        let harness = harness();
        harness
            .producer
            .set_sideband_stream(Some(SidebandStream(7)));

        assert!(harness.latcher.should_present_now(&FixedSync(0)));
        let (dirty, recompute) = latch(&harness, 0);
        assert_eq!(dirty, Rect::new(0, 0, 640, 480));
        assert!(recompute);

        // The takeover is consumed; with no queued frames the next cycle
        // is a no-op.
        let (dirty, _) = latch(&harness, 0);
        assert!(dirty.is_empty());
    }

    #[test]
    fn sync_points_gate_latching() {
        let harness = harness();
        queue_frame(&harness, 1_000, Fence::signaled());
        let point = Arc::new(SyncPoint::new(1));
        harness.latcher.add_sync_point(Arc::clone(&point));

        // First attempt marks the frame available for the remote side and
        // backs off.
        let (dirty, _) = latch(&harness, 2_000);
        assert!(dirty.is_empty());
        assert!(point.frame_is_available());

        // Still gated: the transaction has not been applied.
        let (dirty, _) = latch(&harness, 2_000);
        assert!(dirty.is_empty());

        point.set_transaction_applied();
        let (dirty, _) = latch(&harness, 2_000);
        assert!(!dirty.is_empty());
        // The settled point was pruned.
        assert_eq!(harness.latcher.pending_sync_points(), 0);
    }

    #[test]
    fn notify_available_frames_requires_signaled_head() {
        let harness = harness();
        let fence = Fence::new();
        queue_frame(&harness, 1_000, fence.clone());
        let point = Arc::new(SyncPoint::new(1));
        harness.latcher.add_sync_point(Arc::clone(&point));

        harness.latcher.notify_available_frames();
        assert!(!point.frame_is_available());

        fence.signal(500);
        harness.latcher.notify_available_frames();
        assert!(point.frame_is_available());
    }

    #[test]
    fn release_records_frame_events() {
        let harness = harness();
        let (_slot1, frame1) = queue_frame(&harness, 1_000, Fence::signaled());
        let (dirty, _) = latch(&harness, 2_000);
        assert!(!dirty.is_empty());
        harness.latcher.on_pre_composition(2_100);

        queue_frame(&harness, 1_500, Fence::signaled());
        let (dirty, _) = latch(&harness, 3_000);
        assert!(!dirty.is_empty());

        harness.latcher.on_layer_displayed(Fence::signaled());
        assert!(harness.latcher.release_pending_buffer(3_100));
        assert!(harness.latcher.has_frame_events(frame1));
    }

    #[test]
    fn post_composition_feeds_frame_tracker_once() {
        let harness = harness();
        queue_frame(&harness, 1_000, Fence::signaled());
        let (dirty, _) = latch(&harness, 2_000);
        assert!(!dirty.is_empty());

        let gpu_done = Arc::new(FenceTime::new(Fence::signaled()));
        let present_fence = Fence::new();
        present_fence.signal(2_500);
        let present = Arc::new(FenceTime::new(present_fence));

        assert!(harness
            .latcher
            .on_post_composition(Arc::clone(&gpu_done), Arc::clone(&present), 2_600));
        // The same composition is not accounted twice.
        assert!(!harness.latcher.on_post_composition(gpu_done, present, 2_600));
    }

    #[test]
    fn auto_refresh_always_presents() {
        let harness = harness();
        assert!(!harness.latcher.should_present_now(&FixedSync(1_000)));
        harness.latcher.set_auto_refresh(true);
        assert!(harness.latcher.should_present_now(&FixedSync(1_000)));

        // With nothing queued the latch is still a no-op.
        let (dirty, _) = latch(&harness, 1_000);
        assert!(dirty.is_empty());
    }

    #[test]
    fn implausible_head_timestamp_presents_now() {
        let harness = harness();
        queue_frame(&harness, 5_000_000_000, Fence::signaled());
        // More than a second in the future: ignore the timestamp.
        assert!(harness.latcher.should_present_now(&FixedSync(1_000_000_000)));
    }

    #[test]
    fn opacity_follows_buffer_format() {
        let harness = harness();
        assert!(!harness.latcher.is_opaque());

        queue_frame(&harness, 1_000, Fence::signaled());
        let (dirty, _) = latch(&harness, 2_000);
        assert!(!dirty.is_empty());
        // The default allocator format carries alpha.
        assert!(!harness.latcher.is_opaque());

        harness.latcher.set_opaque(true);
        assert!(harness.latcher.is_opaque());
    }

    #[test]
    fn transformed_dirty_region_swaps_extents() {
        let harness = harness();
        harness.latcher.set_transform(Transform::ROT_90);
        queue_frame(&harness, 1_000, Fence::signaled());
        let (dirty, _) = latch(&harness, 2_000);
        assert_eq!(dirty, Rect::new(0, 0, 480, 640));
    }
}
