//! Driver-side present throttling via `VK_KHR_present_wait`.
//!
//! Every present gets a monotonically increasing id per swapchain; ids only
//! advance to "queued" when the driver accepted the present. Throttling
//! waits on the id that trails the newest queued one by `allowed_ahead`,
//! first with a zero-timeout poll and then with a short bounded wait.

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

/// 2 ms bounded retry after the zero-timeout poll.
const RETRY_TIMEOUT_NS: u64 = 2_000_000;

/// The single driver call this limiter needs.
pub trait PresentWaitOps {
    fn wait_for_present(
        &self,
        swapchain: vk::SwapchainKHR,
        present_id: u64,
        timeout_ns: u64,
    ) -> vk::Result;
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PresentState {
    pub next_id: u64,
    pub last_assigned: u64,
    pub last_queued: u64,
    pub last_completed: u64,
}

#[derive(Default)]
pub struct PresentLimiter {
    states: Mutex<FxHashMap<u64, PresentState>>,
}

/// Ids assigned for one present call, one per swapchain, in call order.
pub type PresentIds = SmallVec<[u64; 2]>;

impl PresentLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Assign an id per swapchain in the present call.
    pub fn on_present(&self, swapchains: &[vk::SwapchainKHR]) -> PresentIds {
        let mut states = self.states.lock();
        swapchains
            .iter()
            .map(|swapchain| {
                let state = states.entry(swapchain.as_raw()).or_default();
                state.next_id += 1;
                let id = state.next_id;
                state.last_assigned = id;
                id
            })
            .collect()
    }

    /// Advance queued ids once the driver reported the present result.
    pub fn on_present_result(
        &self,
        swapchains: &[vk::SwapchainKHR],
        ids: &[u64],
        result: vk::Result,
    ) {
        if result != vk::Result::SUCCESS && result != vk::Result::SUBOPTIMAL_KHR {
            return;
        }
        let mut states = self.states.lock();
        for (swapchain, &id) in swapchains.iter().zip(ids) {
            if id == 0 {
                continue;
            }
            let state = states.entry(swapchain.as_raw()).or_default();
            state.last_queued = state.last_queued.max(id);
            state.next_id = state.next_id.max(id);
        }
    }

    /// Hold the CPU until at most `allowed_ahead` presents separate the
    /// newest queued id from the newest completed one.
    pub fn throttle(
        &self,
        ops: &dyn PresentWaitOps,
        swapchain: vk::SwapchainKHR,
        allowed_ahead: u64,
    ) {
        if swapchain == vk::SwapchainKHR::null() {
            return;
        }

        let (queued, completed) = {
            let states = self.states.lock();
            let Some(state) = states.get(&swapchain.as_raw()) else {
                return;
            };
            (state.last_queued, state.last_completed)
        };

        let depth = queued.saturating_sub(completed);
        if depth <= allowed_ahead {
            return;
        }
        let wait_id = queued - allowed_ahead;
        if wait_id <= completed {
            return;
        }

        let mut result = ops.wait_for_present(swapchain, wait_id, 0);
        if result == vk::Result::TIMEOUT {
            result = ops.wait_for_present(swapchain, wait_id, RETRY_TIMEOUT_NS);
        }
        if result != vk::Result::SUCCESS {
            // TIMEOUT again or a transient error: try again next frame.
            return;
        }

        let mut states = self.states.lock();
        if let Some(state) = states.get_mut(&swapchain.as_raw()) {
            state.last_completed = state.last_completed.max(wait_id);
        }
    }

    pub fn state(&self, swapchain: vk::SwapchainKHR) -> Option<PresentState> {
        self.states.lock().get(&swapchain.as_raw()).copied()
    }

    /// Forget a destroyed swapchain.
    pub fn remove_swapchain(&self, swapchain: vk::SwapchainKHR) {
        self.states.lock().remove(&swapchain.as_raw());
    }

    /// Newest completed id for one swapchain, for the frame-hook contract.
    pub fn last_completed(&self, swapchain: vk::SwapchainKHR) -> u64 {
        self.state(swapchain).map(|s| s.last_completed).unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    fn sc(raw: u64) -> vk::SwapchainKHR {
        vk::SwapchainKHR::from_raw(raw)
    }

    struct MockWait {
        calls: RefCell<Vec<(u64, u64, u64)>>,
        results: RefCell<Vec<vk::Result>>,
    }

    impl MockWait {
        fn returning(results: &[vk::Result]) -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                results: RefCell::new(results.to_vec()),
            }
        }
    }

    impl PresentWaitOps for MockWait {
        fn wait_for_present(
            &self,
            swapchain: vk::SwapchainKHR,
            present_id: u64,
            timeout_ns: u64,
        ) -> vk::Result {
            self.calls
                .borrow_mut()
                .push((swapchain.as_raw(), present_id, timeout_ns));
            let mut results = self.results.borrow_mut();
            if results.is_empty() {
                vk::Result::SUCCESS
            } else {
                results.remove(0)
            }
        }
    }

    #[test]
    fn ids_are_strictly_monotonic_per_swapchain() {
        let limiter = PresentLimiter::new();
        let mut previous = 0;
        for _ in 0..100 {
            let ids = limiter.on_present(&[sc(1)]);
            assert_eq!(ids.len(), 1);
            assert!(ids[0] > previous);
            previous = ids[0];
        }
        // A second swapchain numbers independently.
        let ids = limiter.on_present(&[sc(2)]);
        assert_eq!(ids[0], 1);
    }

    #[test]
    fn queued_advances_only_on_success_or_suboptimal() {
        let limiter = PresentLimiter::new();
        let swapchains = [sc(1)];

        let ids = limiter.on_present(&swapchains);
        limiter.on_present_result(&swapchains, &ids, vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert_eq!(limiter.state(sc(1)).unwrap().last_queued, 0);

        let ids = limiter.on_present(&swapchains);
        limiter.on_present_result(&swapchains, &ids, vk::Result::SUBOPTIMAL_KHR);
        assert_eq!(limiter.state(sc(1)).unwrap().last_queued, 2);

        let state = limiter.state(sc(1)).unwrap();
        assert!(state.last_completed <= state.last_queued);
        assert!(state.last_queued <= state.last_assigned);
    }

    #[test]
    fn throttle_waits_on_the_trailing_id() {
        // allowed_ahead = 1, last_queued = 10, last_completed = 7:
        // wait id must be 9; TIMEOUT retries with the 2 ms timeout.
        let limiter = PresentLimiter::new();
        {
            let mut states = limiter.states.lock();
            states.insert(
                sc(1).as_raw(),
                PresentState {
                    next_id: 10,
                    last_assigned: 10,
                    last_queued: 10,
                    last_completed: 7,
                },
            );
        }

        let ops = MockWait::returning(&[vk::Result::TIMEOUT, vk::Result::SUCCESS]);
        limiter.throttle(&ops, sc(1), 1);

        let calls = ops.calls.borrow();
        assert_eq!(calls.as_slice(), &[(1, 9, 0), (1, 9, RETRY_TIMEOUT_NS)]);
        assert_eq!(limiter.state(sc(1)).unwrap().last_completed, 9);
    }

    #[test]
    fn throttle_gives_up_on_double_timeout() {
        let limiter = PresentLimiter::new();
        {
            let mut states = limiter.states.lock();
            states.insert(
                sc(1).as_raw(),
                PresentState {
                    next_id: 10,
                    last_assigned: 10,
                    last_queued: 10,
                    last_completed: 7,
                },
            );
        }
        let ops = MockWait::returning(&[vk::Result::TIMEOUT, vk::Result::TIMEOUT]);
        limiter.throttle(&ops, sc(1), 1);
        // last_completed untouched; retried next frame instead.
        assert_eq!(limiter.state(sc(1)).unwrap().last_completed, 7);
    }

    #[test]
    fn throttle_is_a_no_op_within_the_allowance() {
        let limiter = PresentLimiter::new();
        let swapchains = [sc(1)];
        let ids = limiter.on_present(&swapchains);
        limiter.on_present_result(&swapchains, &ids, vk::Result::SUCCESS);

        let ops = MockWait::returning(&[]);
        limiter.throttle(&ops, sc(1), 1);
        assert!(ops.calls.borrow().is_empty());

        // Unknown swapchains and null handles are ignored.
        limiter.throttle(&ops, sc(99), 0);
        limiter.throttle(&ops, vk::SwapchainKHR::null(), 0);
        assert!(ops.calls.borrow().is_empty());
    }

    #[test]
    fn multi_swapchain_present_assigns_one_id_each() {
        let limiter = PresentLimiter::new();
        let swapchains = [sc(1), sc(2), sc(3)];
        let ids = limiter.on_present(&swapchains);
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|&id| id == 1));
        limiter.on_present_result(&swapchains, &ids, vk::Result::SUCCESS);
        for swapchain in swapchains {
            assert_eq!(limiter.state(swapchain).unwrap().last_queued, 1);
        }
    }

    #[test]
    fn destroyed_swapchain_state_is_dropped() {
        let limiter = PresentLimiter::new();
        limiter.on_present(&[sc(1)]);
        assert!(limiter.state(sc(1)).is_some());
        limiter.remove_swapchain(sc(1));
        assert!(limiter.state(sc(1)).is_none());
    }
}
