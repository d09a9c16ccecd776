//! Frame pacing.
//!
//! Three cooperating limiters:
//! - [`QueueLimiter`] bounds GPU-side submissions in flight with tiny marker
//!   submissions fenced per frame,
//! - [`PresentLimiter`] bounds presents queued ahead of scanout through
//!   `VK_KHR_present_wait`,
//! - [`FpsLimiter`] enforces a wall-clock frame time with early/late CPU
//!   sleeps and overhead compensation.
//!
//! Driver access goes through the [`DeviceOps`] and [`PresentWaitOps`]
//! traits; the layer implements them on its dispatch tables and the tests
//! on mocks.

mod fps_limit;
mod present_limit;
mod queue_limit;

pub use fps_limit::FpsLimiter;
pub use present_limit::{PresentLimiter, PresentWaitOps};
pub use queue_limit::{DeviceOps, FenceStatus, QueueLimiter};
