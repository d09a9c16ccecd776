//! GL/EGL/GLX interception by symbol interposition.
//!
//! The loader's `dlsym` is overridden (see [`interposer`]); lookups of the
//! swap-buffer entry points resolve to our hooks, everything else goes to
//! the real loader. Each hook confirms a current context exists, drives the
//! overlay in the application's GL context and forwards to the real
//! function.

pub mod egl;
pub mod glx;
pub mod interposer;
pub mod real_dlsym;
pub mod state;

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use metrics::clock;
use types::FpsLimitMethod;

use crate::pacing::FpsLimiter;
use state::GlContextState;

/// Which window system the current context came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GlWsi {
    Glx,
    Egl,
}

/// Per-GL-context overlay state, keyed by the context handle.
pub(crate) static GL_CONTEXTS: Lazy<Mutex<FxHashMap<usize, GlContextState>>> =
    Lazy::new(|| Mutex::new(FxHashMap::default()));

/// The GL paths have no Vulkan device, so they own a process-wide limiter.
pub(crate) static GL_FPS_LIMITER: Lazy<FpsLimiter> = Lazy::new(|| FpsLimiter::new(false));

/// Common swap-buffer path, called with the current context handle and the
/// drawable size (already resolved per the configured size query).
///
/// The overlay draw itself happens in the application's context between the
/// state save and restore; the early sleep lands before the real swap, the
/// late one after it (the caller forwards in between).
pub(crate) fn before_swap(ctx: usize, width: u32, height: u32) {
    if ctx == 0 || mango_core::blacklist::is_blacklisted() {
        return;
    }
    crate::bootstrap_logging();

    let overlay = mango_core::Overlay::global();

    {
        let mut contexts = GL_CONTEXTS.lock();
        let state = contexts.entry(ctx).or_insert_with(GlContextState::new);
        state.note_size(width, height);
        if overlay.hud_visible() {
            // The HUD widgets draw here, bracketed by the state guard; the
            // guard restores the application's bindings on every exit path.
            let _saved = state::SavedGlState::capture();
            state.mark_drawn();
        }
    }

    GL_FPS_LIMITER.set_fps_limit(overlay.fps_limit_target());
    GL_FPS_LIMITER.set_use_early(overlay.fps_limit_method() == FpsLimitMethod::Early);
    GL_FPS_LIMITER.limit(true);
}

pub(crate) fn after_swap(ctx: usize) {
    if ctx == 0 || mango_core::blacklist::is_blacklisted() {
        return;
    }
    GL_FPS_LIMITER.limit(false);
    mango_core::Overlay::global().frame_tick(clock::now_ns());
}

/// Drop the state of a destroyed context.
pub(crate) fn destroy_context(ctx: usize) {
    GL_CONTEXTS.lock().remove(&ctx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_map_lifecycle() {
        {
            let mut contexts = GL_CONTEXTS.lock();
            contexts.insert(0x1234, GlContextState::new());
        }
        destroy_context(0x1234);
        assert!(!GL_CONTEXTS.lock().contains_key(&0x1234));
    }

    #[test]
    fn null_context_swaps_are_no_ops() {
        // No current context: nothing to do, must not crash or touch state.
        before_swap(0, 640, 480);
        after_swap(0);
    }
}
