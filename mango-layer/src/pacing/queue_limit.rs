//! Maximum-frames-in-flight control.
//!
//! Instead of relying on the application's own fencing, a tiny empty
//! submission with a fence is appended after every real submit on a present
//! queue. Before the next submit the oldest fences are drained until at most
//! `max_in_flight` markers remain outstanding, which is where the CPU gets
//! held back when it runs ahead of the GPU.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use rustc_hash::FxHashSet;

use metrics::clock;

const FENCE_POOL_SIZE: usize = 8;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FenceStatus {
    Ready,
    NotReady,
    Error,
}

/// The driver operations the limiter needs, one device's worth.
pub trait DeviceOps {
    /// Create an unsignaled fence; `None` on failure (the limiter then uses
    /// a null sentinel and skips marking that frame).
    fn create_fence(&self) -> Option<vk::Fence>;
    fn fence_status(&self, fence: vk::Fence) -> FenceStatus;
    /// Block until `fence` signals.
    fn wait_for_fence(&self, fence: vk::Fence);
    fn reset_fence(&self, fence: vk::Fence);
    /// Submit an empty `VkSubmitInfo` on `queue` signaling `fence`.
    fn submit_marker(&self, queue: vk::Queue, fence: vk::Fence) -> vk::Result;
}

struct FencePool {
    fences: Vec<vk::Fence>,
    cursor: usize,
}

struct Inner {
    in_flight: VecDeque<vk::Fence>,
    pool: FencePool,
}

pub struct QueueLimiter {
    max_in_flight: AtomicU32,
    inner: Mutex<Inner>,
    present_queues: Mutex<FxHashSet<u64>>,

    // Diagnostics, published relaxed.
    waits: AtomicU64,
    waited_ns: AtomicU64,
    max_depth_seen: AtomicU64,
}

impl Default for QueueLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl QueueLimiter {
    pub fn new() -> Self {
        Self {
            max_in_flight: AtomicU32::new(0),
            inner: Mutex::new(Inner {
                in_flight: VecDeque::new(),
                pool: FencePool {
                    fences: Vec::new(),
                    cursor: 0,
                },
            }),
            present_queues: Mutex::new(FxHashSet::default()),
            waits: AtomicU64::new(0),
            waited_ns: AtomicU64::new(0),
            max_depth_seen: AtomicU64::new(0),
        }
    }

    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::Relaxed)
    }

    pub fn set_max_in_flight(&self, value: u32) {
        self.max_in_flight.store(value, Ordering::Relaxed);
    }

    pub fn add_present_queue(&self, queue: vk::Queue) {
        self.present_queues.lock().insert(queue.as_raw());
    }

    pub fn is_present_queue(&self, queue: vk::Queue) -> bool {
        self.present_queues.lock().contains(&queue.as_raw())
    }

    fn note_depth(&self, depth: u64) {
        let mut prev = self.max_depth_seen.load(Ordering::Relaxed);
        while depth > prev {
            match self.max_depth_seen.compare_exchange_weak(
                prev,
                depth,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => prev = actual,
            }
        }
    }

    /// Drain oldest markers until the in-flight depth is below the bound.
    /// Called strictly before the inner submit.
    pub fn throttle_before_submit(&self, ops: &dyn DeviceOps) {
        let max = self.max_in_flight();
        if max == 0 {
            return;
        }

        let mut inner = self.inner.lock();
        self.note_depth(inner.in_flight.len() as u64);

        while inner.in_flight.len() >= max as usize {
            let oldest = inner.in_flight.front().copied().unwrap();
            if oldest == vk::Fence::null() {
                // Sentinel from a failed fence creation.
                inner.in_flight.pop_front();
                continue;
            }

            if ops.fence_status(oldest) == FenceStatus::NotReady {
                profiling::scope!("queue_limiter_wait");
                let t0 = clock::now_ns();
                ops.wait_for_fence(oldest);
                let t1 = clock::now_ns();
                self.waits.fetch_add(1, Ordering::Relaxed);
                self.waited_ns.fetch_add(t1 - t0, Ordering::Relaxed);
            }

            ops.reset_fence(oldest);
            inner.in_flight.pop_front();
        }
    }

    /// Append the marker submission after a successful real submit.
    pub fn mark_after_submit(&self, ops: &dyn DeviceOps, queue: vk::Queue) -> vk::Result {
        if self.max_in_flight() == 0 {
            return vk::Result::SUCCESS;
        }

        let mut inner = self.inner.lock();
        let fence = Self::next_fence(&mut inner.pool, ops);
        if fence == vk::Fence::null() {
            return vk::Result::SUCCESS;
        }

        let result = ops.submit_marker(queue, fence);
        if result == vk::Result::SUCCESS {
            inner.in_flight.push_back(fence);
            let depth = inner.in_flight.len() as u64;
            drop(inner);
            self.note_depth(depth);
        }
        result
    }

    fn next_fence(pool: &mut FencePool, ops: &dyn DeviceOps) -> vk::Fence {
        if pool.fences.is_empty() {
            pool.fences = (0..FENCE_POOL_SIZE)
                .map(|_| ops.create_fence().unwrap_or(vk::Fence::null()))
                .collect();
        }
        let fence = pool.fences[pool.cursor % pool.fences.len()];
        pool.cursor = pool.cursor.wrapping_add(1);
        fence
    }

    pub fn in_flight_len(&self) -> usize {
        self.inner.lock().in_flight.len()
    }

    /// `(waits, waited_ns, max_depth_seen)` diagnostics.
    pub fn wait_stats(&self) -> (u64, u64, u64) {
        (
            self.waits.load(Ordering::Relaxed),
            self.waited_ns.load(Ordering::Relaxed),
            self.max_depth_seen.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// Mock device: fences are handles into a signaled/reset table.
    struct MockDevice {
        state: RefCell<MockState>,
    }

    #[derive(Default)]
    struct MockState {
        next_handle: u64,
        /// fence -> signaled
        fences: rustc_hash::FxHashMap<u64, bool>,
        create_fails: bool,
        submit_result: Option<vk::Result>,
        waits: u32,
        resets_of_unreset: u32,
    }

    impl MockDevice {
        fn new() -> Self {
            Self {
                state: RefCell::new(MockState {
                    next_handle: 1,
                    submit_result: Some(vk::Result::SUCCESS),
                    ..Default::default()
                }),
            }
        }

        /// Signal the oldest unsignaled fence, as GPU progress would.
        fn complete_one(&self) {
            let mut state = self.state.borrow_mut();
            let mut handles: Vec<u64> = state
                .fences
                .iter()
                .filter(|(_, signaled)| !**signaled)
                .map(|(h, _)| *h)
                .collect();
            handles.sort_unstable();
            if let Some(h) = handles.first() {
                state.fences.insert(*h, true);
            }
        }
    }

    impl DeviceOps for MockDevice {
        fn create_fence(&self) -> Option<vk::Fence> {
            let mut state = self.state.borrow_mut();
            if state.create_fails {
                return None;
            }
            let handle = state.next_handle;
            state.next_handle += 1;
            state.fences.insert(handle, false);
            Some(vk::Fence::from_raw(handle))
        }

        fn fence_status(&self, fence: vk::Fence) -> FenceStatus {
            match self.state.borrow().fences.get(&fence.as_raw()) {
                Some(true) => FenceStatus::Ready,
                Some(false) => FenceStatus::NotReady,
                None => FenceStatus::Error,
            }
        }

        fn wait_for_fence(&self, fence: vk::Fence) {
            let mut state = self.state.borrow_mut();
            state.waits += 1;
            state.fences.insert(fence.as_raw(), true);
        }

        fn reset_fence(&self, fence: vk::Fence) {
            let mut state = self.state.borrow_mut();
            let raw = fence.as_raw();
            if state.fences.get(&raw) == Some(&false) {
                state.resets_of_unreset += 1;
            }
            state.fences.insert(raw, false);
        }

        fn submit_marker(&self, _queue: vk::Queue, fence: vk::Fence) -> vk::Result {
            let state = self.state.borrow();
            let result = state.submit_result.unwrap_or(vk::Result::SUCCESS);
            drop(state);
            if result == vk::Result::SUCCESS {
                // The fence will signal later, when the mock GPU advances.
                let _ = fence;
            }
            result
        }
    }

    fn queue() -> vk::Queue {
        vk::Queue::from_raw(0x51)
    }

    #[test]
    fn disabled_limiter_is_a_no_op() {
        let limiter = QueueLimiter::new();
        let device = MockDevice::new();
        limiter.throttle_before_submit(&device);
        assert_eq!(
            limiter.mark_after_submit(&device, queue()),
            vk::Result::SUCCESS
        );
        assert_eq!(limiter.in_flight_len(), 0);
    }

    #[test]
    fn in_flight_depth_never_exceeds_the_bound() {
        for max in 1..=3u32 {
            let limiter = QueueLimiter::new();
            limiter.set_max_in_flight(max);
            let device = MockDevice::new();

            for _ in 0..20 {
                limiter.throttle_before_submit(&device);
                assert!(limiter.in_flight_len() < max as usize);
                limiter.mark_after_submit(&device, queue());
                // At the point of the outer submit return, depth <= max.
                assert!(limiter.in_flight_len() <= max as usize);
                device.complete_one();
            }
        }
    }

    #[test]
    fn throttle_waits_on_unsignaled_oldest() {
        let limiter = QueueLimiter::new();
        limiter.set_max_in_flight(1);
        let device = MockDevice::new();

        limiter.mark_after_submit(&device, queue());
        assert_eq!(limiter.in_flight_len(), 1);

        // The GPU has not advanced: the next throttle must block.
        limiter.throttle_before_submit(&device);
        assert_eq!(device.state.borrow().waits, 1);
        assert_eq!(limiter.in_flight_len(), 0);

        let (waits, _, max_depth) = limiter.wait_stats();
        assert_eq!(waits, 1);
        assert_eq!(max_depth, 1);
    }

    #[test]
    fn fences_are_reset_before_reuse() {
        let limiter = QueueLimiter::new();
        limiter.set_max_in_flight(1);
        let device = MockDevice::new();

        // Cycle more frames than the pool holds so every fence is reused.
        for _ in 0..(FENCE_POOL_SIZE * 3) {
            limiter.throttle_before_submit(&device);
            limiter.mark_after_submit(&device, queue());
            device.complete_one();
        }
        // `reset_fence` on an already-unsignaled fence would mean a fence
        // was consumed twice without an intervening reset.
        assert_eq!(device.state.borrow().resets_of_unreset, 0);
    }

    #[test]
    fn failed_fence_creation_yields_null_sentinels() {
        let limiter = QueueLimiter::new();
        limiter.set_max_in_flight(1);
        let device = MockDevice::new();
        device.state.borrow_mut().create_fails = true;

        // Marking silently skips; nothing enters the in-flight list.
        assert_eq!(
            limiter.mark_after_submit(&device, queue()),
            vk::Result::SUCCESS
        );
        assert_eq!(limiter.in_flight_len(), 0);
        limiter.throttle_before_submit(&device);
        assert_eq!(device.state.borrow().waits, 0);
    }

    #[test]
    fn failed_marker_submit_keeps_fence_out_of_flight() {
        let limiter = QueueLimiter::new();
        limiter.set_max_in_flight(2);
        let device = MockDevice::new();
        device.state.borrow_mut().submit_result = Some(vk::Result::ERROR_DEVICE_LOST);

        assert_eq!(
            limiter.mark_after_submit(&device, queue()),
            vk::Result::ERROR_DEVICE_LOST
        );
        assert_eq!(limiter.in_flight_len(), 0);
    }

    #[test]
    fn present_queue_membership() {
        let limiter = QueueLimiter::new();
        let q = queue();
        assert!(!limiter.is_present_queue(q));
        limiter.add_present_queue(q);
        assert!(limiter.is_present_queue(q));
    }
}
