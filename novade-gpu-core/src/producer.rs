//! Bounded hand-off from a frame-producer thread to the render thread.
//!
//! The producer (e.g. a camera decoder) pushes decoded frames; when the ring
//! is full the oldest frame is dropped. The render thread blocks on
//! [`FrameRing::next`] and uploads frames itself, so no GPU object is ever
//! touched from the producer thread.

use ash::vk;
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::Duration;
use tracing::trace;

/// Default capacity for camera-style producers.
pub const DEFAULT_CAPACITY: usize = 5;

/// A decoded frame ready for upload with [`Image::upload`](crate::image::Image::upload).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedFrame {
    pub width: u32,
    pub height: u32,
    pub format: vk::Format,
    /// Tightly packed rows.
    pub pixels: Vec<u8>,
}

impl DecodedFrame {
    pub fn extent(&self) -> vk::Extent2D {
        vk::Extent2D {
            width: self.width,
            height: self.height,
        }
    }
}

struct State<T> {
    frames: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

pub struct FrameRing<T = DecodedFrame> {
    capacity: usize,
    state: Mutex<State<T>>,
    available: Condvar,
}

impl<T> FrameRing<T> {
    /// A ring holding at most `capacity` frames (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            state: Mutex::new(State {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().frames.is_empty()
    }

    /// Frames discarded because the ring was full.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Queues `frame`, returning the oldest frame if it had to be evicted.
    /// Frames pushed after [`FrameRing::close`] are handed straight back.
    pub fn push(&self, frame: T) -> Option<T> {
        let mut state = self.lock();
        if state.closed {
            return Some(frame);
        }
        let evicted = if state.frames.len() == self.capacity {
            state.dropped += 1;
            trace!(dropped = state.dropped, "frame ring full, dropping oldest frame");
            state.frames.pop_front()
        } else {
            None
        };
        state.frames.push_back(frame);
        drop(state);
        self.available.notify_one();
        evicted
    }

    /// Blocks until a frame is available. Returns `None` once the ring is
    /// closed and drained.
    pub fn next(&self) -> Option<T> {
        let mut state = self.lock();
        loop {
            if let Some(frame) = state.frames.pop_front() {
                return Some(frame);
            }
            if state.closed {
                return None;
            }
            state = self
                .available
                .wait(state)
                .unwrap_or_else(|poisoned| poisoned.into_inner());
        }
    }

    pub fn try_next(&self) -> Option<T> {
        self.lock().frames.pop_front()
    }

    /// Like [`FrameRing::next`] but gives up after `timeout`.
    pub fn next_timeout(&self, timeout: Duration) -> Option<T> {
        let state = self.lock();
        let (mut state, _) = self
            .available
            .wait_timeout_while(state, timeout, |s| s.frames.is_empty() && !s.closed)
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        state.frames.pop_front()
    }

    /// Stops accepting frames and wakes every waiting consumer.
    pub fn close(&self) {
        self.lock().closed = true;
        self.available.notify_all();
    }
}

impl<T> Default for FrameRing<T> {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn fifo_order() {
        let ring = FrameRing::new(3);
        ring.push(1);
        ring.push(2);
        assert_eq!(ring.next(), Some(1));
        assert_eq!(ring.try_next(), Some(2));
        assert_eq!(ring.try_next(), None);
    }

    #[test]
    fn full_ring_drops_oldest() {
        let ring = FrameRing::new(2);
        assert_eq!(ring.push('a'), None);
        assert_eq!(ring.push('b'), None);
        assert_eq!(ring.push('c'), Some('a'));
        assert_eq!(ring.dropped(), 1);
        assert_eq!(ring.len(), 2);
        assert_eq!(ring.next(), Some('b'));
        assert_eq!(ring.next(), Some('c'));
    }

    #[test]
    fn consumer_blocks_until_producer_pushes() {
        let ring = Arc::new(FrameRing::new(DEFAULT_CAPACITY));
        let producer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || {
                for i in 0..3 {
                    thread::sleep(Duration::from_millis(5));
                    ring.push(i);
                }
            })
        };
        let received: Vec<i32> = (0..3).filter_map(|_| ring.next()).collect();
        producer.join().unwrap();
        assert_eq!(received, vec![0, 1, 2]);
    }

    #[test]
    fn close_wakes_consumer_and_rejects_frames() {
        let ring: Arc<FrameRing<u8>> = Arc::new(FrameRing::new(1));
        let consumer = {
            let ring = Arc::clone(&ring);
            thread::spawn(move || ring.next())
        };
        thread::sleep(Duration::from_millis(10));
        ring.close();
        assert_eq!(consumer.join().unwrap(), None);
        assert_eq!(ring.push(9), Some(9));
        assert!(ring.is_closed());
    }

    #[test]
    fn timeout_returns_none_when_idle() {
        let ring: FrameRing<u8> = FrameRing::default();
        assert_eq!(ring.capacity(), DEFAULT_CAPACITY);
        assert_eq!(ring.next_timeout(Duration::from_millis(10)), None);
    }

    #[test]
    fn decoded_frame_extent() {
        let frame = DecodedFrame {
            width: 4,
            height: 2,
            format: vk::Format::R8G8B8A8_UNORM,
            pixels: vec![0; 32],
        };
        assert_eq!(frame.extent().width, 4);
        assert_eq!(frame.extent().height, 2);
    }
}
