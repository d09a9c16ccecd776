//! Keybind polling.
//!
//! Bindings are checked once per present by comparing the current keyboard
//! state against each configured combination. Every action carries a
//! rising-edge filter so holding a combination fires exactly once.
//!
//! Keyboard access goes through the [`KeySource`] trait; the production
//! implementation polls the X server with `XQueryKeymap` through a
//! dynamically loaded libX11. The caller must not hold any rendering locks
//! while polling.

use crate::params::{Keybind, Params};

/// Something that can answer "are all of these keys down right now".
pub trait KeySource {
    fn pressed(&self, keys: &[String]) -> bool;
}

/// Actions a keybind can trigger.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Action {
    ToggleLogging,
    CycleFpsLimit,
    CyclePreset,
    ToggleHud,
    ReloadConfig,
    UploadLastLog,
    UploadAllLogs,
    CycleHudPosition,
    ResetFpsMetrics,
}

const ACTION_COUNT: usize = 9;

fn bind_for<'p>(params: &'p Params, action: Action) -> &'p Keybind {
    match action {
        Action::ToggleLogging => &params.toggle_logging,
        Action::CycleFpsLimit => &params.toggle_fps_limit,
        Action::CyclePreset => &params.toggle_preset,
        Action::ToggleHud => &params.toggle_hud,
        Action::ReloadConfig => &params.reload_cfg,
        Action::UploadLastLog => &params.upload_log,
        Action::UploadAllLogs => &params.upload_logs,
        Action::CycleHudPosition => &params.toggle_hud_position,
        Action::ResetFpsMetrics => &params.reset_fps_metrics,
    }
}

const ALL_ACTIONS: [Action; ACTION_COUNT] = [
    Action::ToggleLogging,
    Action::CycleFpsLimit,
    Action::CyclePreset,
    Action::ToggleHud,
    Action::ReloadConfig,
    Action::UploadLastLog,
    Action::UploadAllLogs,
    Action::CycleHudPosition,
    Action::ResetFpsMetrics,
];

/// Per-action previous poll state.
#[derive(Default)]
pub struct KeybindState {
    prev: [bool; ACTION_COUNT],
}

impl KeybindState {
    /// One poll: returns the actions whose combination transitioned from
    /// released to pressed since the previous poll.
    pub fn poll(&mut self, params: &Params, source: &dyn KeySource) -> Vec<Action> {
        let mut fired = Vec::new();
        for (i, action) in ALL_ACTIONS.iter().enumerate() {
            let bind = bind_for(params, *action);
            let pressed = !bind.is_empty() && source.pressed(bind.keys());
            if pressed && !self.prev[i] {
                fired.push(*action);
            }
            self.prev[i] = pressed;
        }
        fired
    }
}

/// Gates for upload actions: they additionally require `permit_upload`.
pub fn permitted(action: Action, params: &Params) -> bool {
    match action {
        Action::UploadLastLog | Action::UploadAllLogs => params.permit_upload,
        _ => true,
    }
}

#[cfg(unix)]
pub use x11::X11KeySource;

#[cfg(unix)]
mod x11 {
    use std::os::raw::{c_char, c_int, c_ulong, c_void};

    use super::KeySource;

    type Display = c_void;
    type KeySym = c_ulong;

    struct X11Fns {
        open_display: unsafe extern "C" fn(*const c_char) -> *mut Display,
        close_display: unsafe extern "C" fn(*mut Display) -> c_int,
        query_keymap: unsafe extern "C" fn(*mut Display, *mut [c_char; 32]) -> c_int,
        string_to_keysym: unsafe extern "C" fn(*const c_char) -> KeySym,
        keysym_to_keycode: unsafe extern "C" fn(*mut Display, KeySym) -> u8,
    }

    /// Keyboard polling against the X server.
    pub struct X11KeySource {
        fns: X11Fns,
        _lib: libloading::Library,
        display: *mut Display,
    }

    // The display connection is only ever used from the present thread, but
    // the overlay context holding it is shared.
    unsafe impl Send for X11KeySource {}
    unsafe impl Sync for X11KeySource {}

    impl X11KeySource {
        /// Connect to `$DISPLAY`. Returns `None` on headless systems or when
        /// libX11 is not present; keybinds are then simply inactive.
        pub fn connect() -> Option<Self> {
            std::env::var_os("DISPLAY")?;
            let lib = unsafe { libloading::Library::new("libX11.so.6") }.ok()?;
            let fns = unsafe {
                X11Fns {
                    open_display: *lib.get(b"XOpenDisplay\0").ok()?,
                    close_display: *lib.get(b"XCloseDisplay\0").ok()?,
                    query_keymap: *lib.get(b"XQueryKeymap\0").ok()?,
                    string_to_keysym: *lib.get(b"XStringToKeysym\0").ok()?,
                    keysym_to_keycode: *lib.get(b"XKeysymToKeycode\0").ok()?,
                }
            };
            let display = unsafe { (fns.open_display)(std::ptr::null()) };
            if display.is_null() {
                return None;
            }
            Some(Self {
                fns,
                _lib: lib,
                display,
            })
        }

        fn keycode(&self, name: &str) -> Option<u8> {
            let c_name = std::ffi::CString::new(name).ok()?;
            let keysym = unsafe { (self.fns.string_to_keysym)(c_name.as_ptr()) };
            if keysym == 0 {
                return None;
            }
            let keycode = unsafe { (self.fns.keysym_to_keycode)(self.display, keysym) };
            (keycode != 0).then_some(keycode)
        }
    }

    impl KeySource for X11KeySource {
        fn pressed(&self, keys: &[String]) -> bool {
            if keys.is_empty() {
                return false;
            }
            let mut keymap: [c_char; 32] = [0; 32];
            unsafe { (self.fns.query_keymap)(self.display, &mut keymap) };
            keys.iter().all(|key| {
                let Some(code) = self.keycode(key) else {
                    return false;
                };
                let byte = keymap[(code / 8) as usize] as u8;
                byte & (1 << (code % 8)) != 0
            })
        }
    }

    impl Drop for X11KeySource {
        fn drop(&mut self) {
            unsafe { (self.fns.close_display)(self.display) };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::params::Params;
    use std::collections::HashSet;

    struct FakeKeys {
        down: HashSet<String>,
    }

    impl FakeKeys {
        fn none() -> Self {
            Self {
                down: HashSet::new(),
            }
        }

        fn holding(keys: &[&str]) -> Self {
            Self {
                down: keys.iter().map(|k| k.to_string()).collect(),
            }
        }
    }

    impl KeySource for FakeKeys {
        fn pressed(&self, keys: &[String]) -> bool {
            keys.iter().all(|k| self.down.contains(k))
        }
    }

    #[test]
    fn rising_edge_fires_once() {
        let params = Params::default();
        let mut state = KeybindState::default();

        let released = FakeKeys::none();
        let held = FakeKeys::holding(&["Shift_R", "F12"]);

        assert!(state.poll(&params, &released).is_empty());
        assert_eq!(state.poll(&params, &held), vec![Action::ToggleHud]);
        // Still held: no retrigger.
        assert!(state.poll(&params, &held).is_empty());
        // Release and press again: fires again.
        assert!(state.poll(&params, &released).is_empty());
        assert_eq!(state.poll(&params, &held), vec![Action::ToggleHud]);
    }

    #[test]
    fn partial_combination_does_not_fire() {
        let params = Params::default();
        let mut state = KeybindState::default();
        let partial = FakeKeys::holding(&["Shift_R"]);
        assert!(state.poll(&params, &partial).is_empty());
    }

    #[test]
    fn empty_bind_never_fires() {
        let mut params = Params::default();
        params.toggle_hud = Keybind::parse("");
        let mut state = KeybindState::default();
        // A source that claims everything is pressed.
        struct AllDown;
        impl KeySource for AllDown {
            fn pressed(&self, _: &[String]) -> bool {
                true
            }
        }
        let fired = state.poll(&params, &AllDown);
        assert!(!fired.contains(&Action::ToggleHud));
    }

    #[test]
    fn upload_requires_permit() {
        let mut params = Params::default();
        assert!(!permitted(Action::UploadLastLog, &params));
        params.permit_upload = true;
        assert!(permitted(Action::UploadLastLog, &params));
        assert!(permitted(Action::ToggleHud, &Params::default()));
    }
}
