// ABOUTME: Bounded FIFO of encoded frames shared between producer and consumer threads
// ABOUTME: Implements the overflow drop policies, underflow accounting and flush/discard semantics

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::time::Instant;

/// One unit of streamed data
#[derive(Debug, Clone)]
pub struct Frame {
    /// Encoded payload
    pub payload: Vec<u8>,
    /// Number of codec frames the payload represents
    pub frame_count: u16,
    /// When the frame was produced or received
    pub timestamp: Instant,
}

impl Frame {
    /// Create a new frame stamped with the given instant
    pub fn new(payload: Vec<u8>, frame_count: u16, timestamp: Instant) -> Self {
        Self {
            payload,
            frame_count,
            timestamp,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Whether the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// What to do when a frame arrives at a full queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Drop the entire queue contents, then admit the new frame (outbound/source side)
    DropAll,
    /// Evict the single oldest frame to admit the new one (inbound/sink side)
    DropOldest,
}

/// Result of an enqueue attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// Frame admitted without dropping anything
    Queued,
    /// Frame admitted after an overflow dropped `dropped` queued frames
    Overflowed {
        /// Number of queued items dropped
        dropped: usize,
    },
    /// Queue is discarding; the frame was dropped and the queue drained
    Discarded,
}

/// Accounting counters, readable as a snapshot
#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueCounters {
    /// Frames admitted
    pub enqueued: u64,
    /// Frames handed to a consumer
    pub dequeued: u64,
    /// Overflow events (one per policy application)
    pub overflow_events: u64,
    /// Queue items dropped by overflow
    pub dropped_items: u64,
    /// Codec frames dropped by overflow
    pub dropped_frames: u64,
    /// Bytes dropped by overflow
    pub dropped_bytes: u64,
    /// Underflow events recorded by the consumer
    pub underflow_events: u64,
    /// Flushes that actually removed something
    pub flushes: u64,
    /// Items removed by flushes and discarding
    pub flushed_items: u64,
    /// Highest queue depth observed
    pub high_water: usize,
    /// Microseconds since the last underflow, at snapshot time
    pub last_underflow_age_us: Option<u64>,
}

struct QueueState {
    frames: VecDeque<Frame>,
    discarding: bool,
    counters: QueueCounters,
    last_underflow: Option<Instant>,
}

/// Bounded, mutex-protected FIFO of frames
pub struct FrameQueue {
    state: Mutex<QueueState>,
    capacity: usize,
    policy: OverflowPolicy,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1)
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                frames: VecDeque::with_capacity(capacity),
                discarding: false,
                counters: QueueCounters::default(),
                last_underflow: None,
            }),
            capacity,
            policy,
        }
    }

    /// Push a frame at the tail, applying the overflow policy if full
    pub fn enqueue(&self, frame: Frame) -> EnqueueOutcome {
        let mut state = self.state.lock();

        if state.discarding {
            Self::drain_locked(&mut state);
            return EnqueueOutcome::Discarded;
        }

        let mut outcome = EnqueueOutcome::Queued;
        if state.frames.len() >= self.capacity {
            let dropped: Vec<Frame> = match self.policy {
                OverflowPolicy::DropAll => state.frames.drain(..).collect(),
                OverflowPolicy::DropOldest => state.frames.pop_front().into_iter().collect(),
            };

            let counters = &mut state.counters;
            counters.overflow_events += 1;
            counters.dropped_items += dropped.len() as u64;
            for old in &dropped {
                counters.dropped_frames += u64::from(old.frame_count);
                counters.dropped_bytes += old.len() as u64;
            }

            log::debug!(
                "Frame queue overflow ({:?}): dropped {} items, {} overflows so far",
                self.policy,
                dropped.len(),
                counters.overflow_events
            );
            outcome = EnqueueOutcome::Overflowed {
                dropped: dropped.len(),
            };
        }

        state.frames.push_back(frame);
        state.counters.enqueued += 1;
        let depth = state.frames.len();
        if depth > state.counters.high_water {
            state.counters.high_water = depth;
        }

        outcome
    }

    /// Pop the oldest frame; returns None when empty or discarding (which drains)
    pub fn dequeue(&self) -> Option<Frame> {
        let mut state = self.state.lock();

        if state.discarding {
            Self::drain_locked(&mut state);
            return None;
        }

        let frame = state.frames.pop_front();
        if frame.is_some() {
            state.counters.dequeued += 1;
        }
        frame
    }

    /// Put a frame back at the head after a failed hand-off
    pub fn requeue_front(&self, frame: Frame) {
        let mut state = self.state.lock();
        if state.discarding {
            return;
        }
        state.counters.dequeued = state.counters.dequeued.saturating_sub(1);
        state.frames.push_front(frame);
    }

    /// Record that the consumer found nothing to send
    pub fn record_underflow(&self, now: Instant) {
        let mut state = self.state.lock();
        state.counters.underflow_events += 1;
        state.last_underflow = Some(now);
    }

    /// Drain the queue without processing; returns the number of items removed
    pub fn flush(&self) -> usize {
        let mut state = self.state.lock();
        Self::drain_locked(&mut state)
    }

    /// Toggle discard mode; entering it drains the queue
    pub fn set_discarding(&self, discarding: bool) {
        let mut state = self.state.lock();
        state.discarding = discarding;
        if discarding {
            Self::drain_locked(&mut state);
        }
    }

    /// Whether discard mode is on
    pub fn is_discarding(&self) -> bool {
        self.state.lock().discarding
    }

    /// Current number of queued frames
    pub fn len(&self) -> usize {
        self.state.lock().frames.len()
    }

    /// Whether the queue is empty
    pub fn is_empty(&self) -> bool {
        self.state.lock().frames.is_empty()
    }

    /// Maximum number of frames
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Overflow policy in effect
    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Snapshot of the accounting counters
    pub fn counters(&self) -> QueueCounters {
        let state = self.state.lock();
        let mut counters = state.counters.clone();
        counters.last_underflow_age_us = state
            .last_underflow
            .map(|at| at.elapsed().as_micros() as u64);
        counters
    }

    fn drain_locked(state: &mut QueueState) -> usize {
        let removed = state.frames.len();
        if removed > 0 {
            state.frames.clear();
            state.counters.flushes += 1;
            state.counters.flushed_items += removed as u64;
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8) -> Frame {
        Frame::new(vec![tag; 4], 2, Instant::now())
    }

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new(4, OverflowPolicy::DropAll);
        queue.enqueue(frame(1));
        queue.enqueue(frame(2));
        queue.enqueue(frame(3));

        assert_eq!(queue.dequeue().unwrap().payload[0], 1);
        assert_eq!(queue.dequeue().unwrap().payload[0], 2);
        assert_eq!(queue.dequeue().unwrap().payload[0], 3);
        assert!(queue.dequeue().is_none());
    }

    #[test]
    fn test_drop_all_on_overflow() {
        let queue = FrameQueue::new(3, OverflowPolicy::DropAll);
        for tag in 0..3 {
            assert_eq!(queue.enqueue(frame(tag)), EnqueueOutcome::Queued);
        }

        let outcome = queue.enqueue(frame(9));
        assert_eq!(outcome, EnqueueOutcome::Overflowed { dropped: 3 });
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.dequeue().unwrap().payload[0], 9);

        let counters = queue.counters();
        assert_eq!(counters.overflow_events, 1);
        assert_eq!(counters.dropped_items, 3);
        assert_eq!(counters.dropped_frames, 6);
        assert_eq!(counters.dropped_bytes, 12);
    }

    #[test]
    fn test_drop_oldest_on_overflow() {
        let queue = FrameQueue::new(3, OverflowPolicy::DropOldest);
        for tag in 0..4 {
            queue.enqueue(frame(tag));
        }

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().unwrap().payload[0], 1);
        assert_eq!(queue.counters().overflow_events, 1);
        assert_eq!(queue.counters().dropped_items, 1);
    }

    #[test]
    fn test_flush_empty_is_noop() {
        let queue = FrameQueue::new(2, OverflowPolicy::DropAll);
        assert_eq!(queue.flush(), 0);
        assert_eq!(queue.flush(), 0);

        let counters = queue.counters();
        assert_eq!(counters.flushes, 0);
        assert_eq!(counters.flushed_items, 0);
    }

    #[test]
    fn test_flush_twice_same_as_once() {
        let queue = FrameQueue::new(4, OverflowPolicy::DropAll);
        queue.enqueue(frame(1));
        queue.enqueue(frame(2));

        assert_eq!(queue.flush(), 2);
        let once = queue.counters();
        assert_eq!(queue.flush(), 0);
        let twice = queue.counters();

        assert_eq!(once.flushes, twice.flushes);
        assert_eq!(once.flushed_items, twice.flushed_items);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_discarding_drains_and_drops() {
        let queue = FrameQueue::new(4, OverflowPolicy::DropOldest);
        queue.enqueue(frame(1));
        queue.set_discarding(true);
        assert!(queue.is_empty());

        assert_eq!(queue.enqueue(frame(2)), EnqueueOutcome::Discarded);
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());

        queue.set_discarding(false);
        queue.enqueue(frame(3));
        assert_eq!(queue.dequeue().unwrap().payload[0], 3);
    }

    #[test]
    fn test_high_water_and_underflow() {
        let queue = FrameQueue::new(8, OverflowPolicy::DropAll);
        for tag in 0..5 {
            queue.enqueue(frame(tag));
        }
        queue.flush();
        queue.record_underflow(Instant::now());

        let counters = queue.counters();
        assert_eq!(counters.high_water, 5);
        assert_eq!(counters.underflow_events, 1);
        assert!(counters.last_underflow_age_us.is_some());
    }

    #[test]
    fn test_requeue_front() {
        let queue = FrameQueue::new(4, OverflowPolicy::DropAll);
        queue.enqueue(frame(1));
        queue.enqueue(frame(2));

        let first = queue.dequeue().unwrap();
        queue.requeue_front(first);
        assert_eq!(queue.dequeue().unwrap().payload[0], 1);
    }
}
