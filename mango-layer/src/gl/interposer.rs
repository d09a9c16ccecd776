//! The `dlsym` override.
//!
//! Applications (and GL loaders like GLEW or SDL) look their entry points
//! up with `dlsym`; we answer for the swap-buffer symbols and pass every
//! other name to the real implementation. A symbol is only shadowed when
//! the real loader also provides it, so probing code keeps working.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};

use super::real_dlsym::real_dlsym;
use super::{egl, glx};

/// Interposed `dlsym`.
///
/// # Safety
/// Same contract as libc `dlsym`.
#[no_mangle]
pub unsafe extern "C" fn dlsym(handle: *mut c_void, name: *const c_char) -> *mut c_void {
    let real = real_dlsym(handle, name);
    if name.is_null() || real.is_null() {
        return real;
    }

    let symbol = CStr::from_ptr(name);
    let ours = {
        let glx_ptr = glx::find_glx_ptr(symbol);
        if glx_ptr.is_null() {
            egl::find_egl_ptr(symbol)
        } else {
            glx_ptr
        }
    };
    if !ours.is_null() {
        return ours;
    }
    real
}
