//! Auxiliary frame bookkeeping: per-frame event history, the release-fence
//! timeline, queue-occupancy segments and the frame-latency tracker.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::fence::FenceTime;
use crate::Nsecs;

/// Frames of history kept per layer.
const MAX_FRAME_HISTORY: usize = 8;

/// Timestamps collected for one frame as it moves through the pipeline.
/// Fence-backed entries resolve opportunistically once their fence signals.
#[derive(Debug, Default)]
pub struct FrameEvents {
    pub frame_number: u64,
    pub queue_time: Option<Nsecs>,
    pub latch_time: Option<Nsecs>,
    pub pre_composition_time: Option<Nsecs>,
    pub dequeue_ready_time: Option<Nsecs>,
    pub gpu_done: Option<Arc<FenceTime>>,
    pub present: Option<Arc<FenceTime>>,
    pub release: Option<Arc<FenceTime>>,
}

/// Fixed ring of recent frame events, keyed by frame number.
#[derive(Debug, Default)]
pub struct FrameEventHistory {
    frames: VecDeque<FrameEvents>,
}

impl FrameEventHistory {
    pub fn new() -> FrameEventHistory {
        FrameEventHistory::default()
    }

    fn entry(&mut self, frame_number: u64) -> &mut FrameEvents {
        let position = self
            .frames
            .iter()
            .position(|f| f.frame_number == frame_number);
        let index = match position {
            Some(index) => index,
            None => {
                if self.frames.len() == MAX_FRAME_HISTORY {
                    self.frames.pop_front();
                }
                self.frames.push_back(FrameEvents {
                    frame_number,
                    ..FrameEvents::default()
                });
                self.frames.len() - 1
            }
        };
        &mut self.frames[index]
    }

    pub fn add_queue(&mut self, frame_number: u64, when: Nsecs) {
        self.entry(frame_number).queue_time = Some(when);
    }

    pub fn add_latch(&mut self, frame_number: u64, when: Nsecs) {
        self.entry(frame_number).latch_time = Some(when);
    }

    pub fn add_pre_composition(&mut self, frame_number: u64, when: Nsecs) {
        self.entry(frame_number).pre_composition_time = Some(when);
    }

    pub fn add_post_composition(
        &mut self,
        frame_number: u64,
        gpu_done: Arc<FenceTime>,
        present: Arc<FenceTime>,
    ) {
        let events = self.entry(frame_number);
        events.gpu_done = Some(gpu_done);
        events.present = Some(present);
    }

    pub fn add_release(
        &mut self,
        frame_number: u64,
        dequeue_ready_time: Nsecs,
        release: Arc<FenceTime>,
    ) {
        let events = self.entry(frame_number);
        events.dequeue_ready_time = Some(dequeue_ready_time);
        events.release = Some(release);
    }

    pub fn get(&self, frame_number: u64) -> Option<&FrameEvents> {
        self.frames.iter().find(|f| f.frame_number == frame_number)
    }
}

/// Most release fences kept in flight before the oldest is dropped.
const MAX_PENDING_RELEASES: usize = 64;

/// Sliding window of recent release fences whose signal times are polled
/// opportunistically.
#[derive(Debug, Default)]
pub struct ReleaseTimeline {
    pending: VecDeque<Arc<FenceTime>>,
}

impl ReleaseTimeline {
    pub fn new() -> ReleaseTimeline {
        ReleaseTimeline::default()
    }

    /// Polls pending fences, retiring every leading entry that signaled.
    pub fn update_signal_times(&mut self) {
        while let Some(front) = self.pending.front() {
            if !front.has_signaled() {
                break;
            }
            self.pending.pop_front();
        }
    }

    pub fn push(&mut self, fence: Arc<FenceTime>) {
        if self.pending.len() == MAX_PENDING_RELEASES {
            self.pending.pop_front();
        }
        self.pending.push_back(fence);
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

/// One contiguous stretch of queue activity, from the first frame queued to
/// the queue draining empty.
#[derive(Debug, Clone, PartialEq)]
pub struct Segment {
    /// Total time the queue was non-empty.
    pub total_time: Nsecs,
    /// Frames queued during the segment.
    pub num_frames: usize,
    /// Time-weighted mean occupancy.
    pub occupancy_average: f32,
    /// Occupancy reached three buffers at some point.
    pub used_third_buffer: bool,
}

#[derive(Debug, Default)]
struct PendingSegment {
    total_time: Nsecs,
    weighted_occupancy: i128,
    num_frames: usize,
    used_third_buffer: bool,
}

/// Aggregates queue-occupancy changes into [`Segment`]s.
#[derive(Debug, Default)]
pub struct OccupancyTracker {
    pending: PendingSegment,
    history: Vec<Segment>,
    last_occupancy: usize,
    last_change_time: Nsecs,
}

impl OccupancyTracker {
    pub fn new() -> OccupancyTracker {
        OccupancyTracker::default()
    }

    pub fn register_occupancy_change(&mut self, occupancy: usize, now: Nsecs) {
        if self.last_occupancy != 0 {
            let elapsed = now - self.last_change_time;
            self.pending.total_time += elapsed;
            self.pending.weighted_occupancy += elapsed as i128 * self.last_occupancy as i128;
        }
        if occupancy > self.last_occupancy {
            self.pending.num_frames += occupancy - self.last_occupancy;
            if occupancy >= 3 {
                self.pending.used_third_buffer = true;
            }
        }
        if occupancy == 0 {
            self.flush_pending();
        }
        self.last_occupancy = occupancy;
        self.last_change_time = now;
    }

    fn flush_pending(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        if pending.num_frames == 0 {
            return;
        }
        let occupancy_average = if pending.total_time > 0 {
            (pending.weighted_occupancy as f64 / pending.total_time as f64) as f32
        } else {
            0.0
        };
        self.history.push(Segment {
            total_time: pending.total_time,
            num_frames: pending.num_frames,
            occupancy_average,
            used_third_buffer: pending.used_third_buffer,
        });
    }

    /// Drains completed segments. With `force_flush`, the segment still
    /// accumulating is closed at `now` and returned as well.
    pub fn take_history(&mut self, force_flush: bool, now: Nsecs) -> Vec<Segment> {
        if force_flush {
            if self.last_occupancy != 0 {
                let elapsed = now - self.last_change_time;
                self.pending.total_time += elapsed;
                self.pending.weighted_occupancy += elapsed as i128 * self.last_occupancy as i128;
                self.last_change_time = now;
            }
            self.flush_pending();
        }
        std::mem::take(&mut self.history)
    }
}

/// Frame records kept by the latency tracker.
const NUM_FRAME_RECORDS: usize = 128;

#[derive(Debug, Clone, Default)]
enum TimeSource {
    #[default]
    Unknown,
    Time(Nsecs),
    Fence(Arc<FenceTime>),
}

impl TimeSource {
    fn resolve(&mut self) {
        if let TimeSource::Fence(fence) = self {
            if fence.has_signaled() {
                *self = TimeSource::Time(fence.signal_time());
            }
        }
    }

    fn time(&self) -> Option<Nsecs> {
        match self {
            TimeSource::Time(t) => Some(*t),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default)]
struct FrameRecord {
    desired_present: Option<Nsecs>,
    frame_ready: TimeSource,
    actual_present: TimeSource,
}

/// Per-frame desired/ready/present triples for latency accounting.
#[derive(Debug)]
pub struct FrameTracker {
    records: Vec<FrameRecord>,
    offset: usize,
}

impl Default for FrameTracker {
    fn default() -> FrameTracker {
        FrameTracker {
            records: vec![FrameRecord::default(); NUM_FRAME_RECORDS],
            offset: 0,
        }
    }
}

impl FrameTracker {
    pub fn new() -> FrameTracker {
        FrameTracker::default()
    }

    pub fn set_desired_present_time(&mut self, when: Nsecs) {
        self.records[self.offset].desired_present = Some(when);
    }

    pub fn set_frame_ready_time(&mut self, when: Nsecs) {
        self.records[self.offset].frame_ready = TimeSource::Time(when);
    }

    pub fn set_frame_ready_fence(&mut self, fence: Arc<FenceTime>) {
        self.records[self.offset].frame_ready = TimeSource::Fence(fence);
    }

    pub fn set_actual_present_time(&mut self, when: Nsecs) {
        self.records[self.offset].actual_present = TimeSource::Time(when);
    }

    pub fn set_actual_present_fence(&mut self, fence: Arc<FenceTime>) {
        self.records[self.offset].actual_present = TimeSource::Fence(fence);
    }

    /// Closes the current record and starts the next one, resolving any
    /// fence-backed times that have signaled since.
    pub fn advance_frame(&mut self) {
        for record in &mut self.records {
            record.frame_ready.resolve();
            record.actual_present.resolve();
        }
        self.offset = (self.offset + 1) % NUM_FRAME_RECORDS;
        self.records[self.offset] = FrameRecord::default();
    }

    /// Present latency of the most recently closed record, once both its
    /// desired and actual present times are known.
    pub fn latest_frame_latency(&self) -> Option<Nsecs> {
        let index = (self.offset + NUM_FRAME_RECORDS - 1) % NUM_FRAME_RECORDS;
        let record = &self.records[index];
        match (record.desired_present, record.actual_present.time()) {
            (Some(desired), Some(actual)) => Some(actual - desired),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fence::Fence;

    #[test]
    fn frame_event_history_is_bounded() {
        let mut history = FrameEventHistory::new();
        for frame in 1..=20u64 {
            history.add_queue(frame, frame as Nsecs * 100);
        }
        assert!(history.get(1).is_none());
        let newest = history.get(20).unwrap();
        assert_eq!(newest.queue_time, Some(2_000));
        // Exactly the last MAX_FRAME_HISTORY frames survive.
        assert!(history.get(12).is_none());
        assert!(history.get(13).is_some());
    }

    #[test]
    fn frame_event_history_merges_stages() {
        let mut history = FrameEventHistory::new();
        history.add_queue(5, 100);
        history.add_latch(5, 200);
        history.add_pre_composition(5, 300);

        let fence = Fence::new();
        fence.signal(400);
        let release = Arc::new(FenceTime::new(fence));
        history.add_release(5, 350, release);

        let events = history.get(5).unwrap();
        assert_eq!(events.queue_time, Some(100));
        assert_eq!(events.latch_time, Some(200));
        assert_eq!(events.pre_composition_time, Some(300));
        assert_eq!(events.dequeue_ready_time, Some(350));
        assert_eq!(events.release.as_ref().unwrap().signal_time(), 400);
    }

    #[test]
    fn release_timeline_retires_signaled_fences() {
        let mut timeline = ReleaseTimeline::new();
        let first = Fence::new();
        let second = Fence::new();
        timeline.push(Arc::new(FenceTime::new(first.clone())));
        timeline.push(Arc::new(FenceTime::new(second.clone())));
        assert_eq!(timeline.pending_count(), 2);

        // The second fence signaling does not unblock the window: retiring
        // is in order from the front.
        second.signal(10);
        timeline.update_signal_times();
        assert_eq!(timeline.pending_count(), 2);

        first.signal(20);
        timeline.update_signal_times();
        assert_eq!(timeline.pending_count(), 0);
    }

    #[test]
    fn occupancy_segments_complete_on_drain() {
        let mut tracker = OccupancyTracker::new();
        tracker.register_occupancy_change(1, 1_000);
        tracker.register_occupancy_change(2, 2_000);
        tracker.register_occupancy_change(1, 3_000);
        tracker.register_occupancy_change(0, 4_000);

        let history = tracker.take_history(false, 5_000);
        assert_eq!(history.len(), 1);
        let segment = &history[0];
        assert_eq!(segment.total_time, 3_000);
        assert_eq!(segment.num_frames, 2);
        assert!(!segment.used_third_buffer);
        // 1000ns at occupancy 1, 1000 at 2, 1000 at 1.
        assert!((segment.occupancy_average - 4.0 / 3.0).abs() < 1e-6);

        // Drained history does not come back.
        assert!(tracker.take_history(false, 6_000).is_empty());
    }

    #[test]
    fn occupancy_force_flush_closes_open_segment() {
        let mut tracker = OccupancyTracker::new();
        tracker.register_occupancy_change(3, 1_000);

        let history = tracker.take_history(true, 2_000);
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].total_time, 1_000);
        assert_eq!(history[0].num_frames, 3);
        assert!(history[0].used_third_buffer);
    }

    #[test]
    fn frame_tracker_resolves_fences_on_advance() {
        let mut tracker = FrameTracker::new();
        tracker.set_desired_present_time(1_000);

        let present = Fence::new();
        tracker.set_actual_present_fence(Arc::new(FenceTime::new(present.clone())));
        tracker.advance_frame();
        // Present has not signaled; latency unknown.
        assert_eq!(tracker.latest_frame_latency(), None);

        // A later advance picks up the signal time.
        present.signal(1_750);
        tracker.set_desired_present_time(2_000);
        tracker.advance_frame();
        assert_eq!(tracker.latest_frame_latency(), None);

        let mut tracker = FrameTracker::new();
        tracker.set_desired_present_time(1_000);
        let present = Fence::new();
        present.signal(1_750);
        tracker.set_actual_present_fence(Arc::new(FenceTime::new(present)));
        tracker.advance_frame();
        assert_eq!(tracker.latest_frame_latency(), Some(750));
    }
}
