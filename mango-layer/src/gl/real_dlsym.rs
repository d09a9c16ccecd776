//! Access to the loader's real `dlsym` from underneath our own override.
//!
//! Calling `dlsym` by name from this DSO would resolve right back to the
//! exported hook, so the genuine libc entry is fetched through `dlvsym`
//! with the known glibc version tags. When none resolves (musl, exotic
//! libc) the interposer stays inert rather than recursing.

use std::ffi::CString;
use std::os::raw::{c_char, c_void};

use once_cell::sync::Lazy;

type DlsymFn = unsafe extern "C" fn(*mut c_void, *const c_char) -> *mut c_void;

#[cfg(all(unix, target_env = "gnu"))]
fn resolve_real_dlsym() -> Option<DlsymFn> {
    // One of these matches any glibc this library can load into.
    const VERSIONS: &[&[u8]] = &[
        b"GLIBC_2.2.5\0", // x86_64
        b"GLIBC_2.17\0",  // aarch64
        b"GLIBC_2.4\0",   // arm
        b"GLIBC_2.0\0",   // i386
        b"GLIBC_2.34\0",  // post-libdl merge
    ];
    for version in VERSIONS {
        let ptr = unsafe {
            libc::dlvsym(
                libc::RTLD_NEXT,
                b"dlsym\0".as_ptr() as *const c_char,
                version.as_ptr() as *const c_char,
            )
        };
        if !ptr.is_null() {
            return Some(unsafe { std::mem::transmute::<*mut c_void, DlsymFn>(ptr) });
        }
    }
    None
}

#[cfg(not(all(unix, target_env = "gnu")))]
fn resolve_real_dlsym() -> Option<DlsymFn> {
    None
}

static REAL_DLSYM: Lazy<Option<DlsymFn>> = Lazy::new(|| {
    let resolved = resolve_real_dlsym();
    if resolved.is_none() {
        log::warn!("could not resolve the real dlsym; GL interposition disabled");
    }
    resolved
});

/// The real `dlsym`, or null when unavailable.
pub fn real_dlsym(handle: *mut c_void, name: *const c_char) -> *mut c_void {
    match *REAL_DLSYM {
        Some(f) => unsafe { f(handle, name) },
        None => std::ptr::null_mut(),
    }
}

/// `RTLD_NEXT` lookup by name.
pub fn get_proc_address(name: &str) -> *mut c_void {
    let Ok(c_name) = CString::new(name) else {
        return std::ptr::null_mut();
    };
    real_dlsym(libc::RTLD_NEXT, c_name.as_ptr())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_a_known_libc_symbol() {
        // The test binary does not override dlsym, so a successful resolve
        // must be able to find an ordinary libc export.
        if REAL_DLSYM.is_some() {
            assert!(!get_proc_address("strlen").is_null());
        }
    }

    #[test]
    fn unknown_symbols_return_null() {
        assert!(get_proc_address("definitely_not_a_symbol_xyzzy").is_null());
    }
}
