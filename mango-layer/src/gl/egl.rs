//! EGL swap-buffer hooks.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uint, c_void};

use once_cell::sync::Lazy;

use super::real_dlsym::get_proc_address;
use super::state::query_size;

const EGL_HEIGHT: c_int = 0x3056;
const EGL_WIDTH: c_int = 0x3057;

struct EglFns {
    swap_buffers: Option<unsafe extern "C" fn(*mut c_void, *mut c_void) -> c_uint>,
    swap_buffers_with_damage:
        Option<unsafe extern "C" fn(*mut c_void, *mut c_void, *mut c_int, c_int) -> c_uint>,
    get_current_context: Option<unsafe extern "C" fn() -> *mut c_void>,
    query_surface:
        Option<unsafe extern "C" fn(*mut c_void, *mut c_void, c_int, *mut c_int) -> c_uint>,
    get_proc_address: Option<unsafe extern "C" fn(*const c_char) -> *mut c_void>,
}

macro_rules! load_sym {
    ($name:literal) => {{
        let ptr = get_proc_address($name);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { std::mem::transmute::<*mut c_void, _>(ptr) })
        }
    }};
}

static EGL: Lazy<EglFns> = Lazy::new(|| EglFns {
    swap_buffers: load_sym!("eglSwapBuffers"),
    swap_buffers_with_damage: load_sym!("eglSwapBuffersWithDamageKHR"),
    get_current_context: load_sym!("eglGetCurrentContext"),
    query_surface: load_sym!("eglQuerySurface"),
    get_proc_address: load_sym!("eglGetProcAddress"),
});

fn current_context() -> usize {
    EGL.get_current_context
        .map(|f| unsafe { f() } as usize)
        .unwrap_or(0)
}

fn surface_size(dpy: *mut c_void, surface: *mut c_void) -> Option<(u32, u32)> {
    let query = EGL.query_surface?;
    let mut width: c_int = 0;
    let mut height: c_int = 0;
    let ok = unsafe {
        query(dpy, surface, EGL_WIDTH, &mut width) != 0
            && query(dpy, surface, EGL_HEIGHT, &mut height) != 0
    };
    (ok && width > 0 && height > 0).then_some((width as u32, height as u32))
}

fn swap_common(dpy: *mut c_void, surface: *mut c_void) -> usize {
    let ctx = current_context();
    if ctx != 0 {
        let policy = mango_core::Overlay::global().params().gl_size_query;
        let (width, height) = query_size(policy, || surface_size(dpy, surface));
        super::before_swap(ctx, width, height);
    }
    ctx
}

/// Interposed `eglSwapBuffers`.
///
/// # Safety
/// Called by the application with its own display/surface.
#[no_mangle]
pub unsafe extern "C" fn eglSwapBuffers(dpy: *mut c_void, surface: *mut c_void) -> c_uint {
    let Some(real) = EGL.swap_buffers else {
        return 0;
    };
    let ctx = swap_common(dpy, surface);
    let ret = real(dpy, surface);
    super::after_swap(ctx);
    ret
}

unsafe fn swap_with_damage(
    dpy: *mut c_void,
    surface: *mut c_void,
    rects: *mut c_int,
    n_rects: c_int,
) -> c_uint {
    let Some(real) = EGL.swap_buffers_with_damage else {
        return 0;
    };
    let ctx = swap_common(dpy, surface);
    let ret = real(dpy, surface, rects, n_rects);
    super::after_swap(ctx);
    ret
}

/// Interposed `eglSwapBuffersWithDamageKHR`.
///
/// # Safety
/// Called by the application with its own display/surface.
#[no_mangle]
pub unsafe extern "C" fn eglSwapBuffersWithDamageKHR(
    dpy: *mut c_void,
    surface: *mut c_void,
    rects: *mut c_int,
    n_rects: c_int,
) -> c_uint {
    swap_with_damage(dpy, surface, rects, n_rects)
}

/// Interposed `eglSwapBuffersWithDamageEXT`.
///
/// # Safety
/// Called by the application with its own display/surface.
#[no_mangle]
pub unsafe extern "C" fn eglSwapBuffersWithDamageEXT(
    dpy: *mut c_void,
    surface: *mut c_void,
    rects: *mut c_int,
    n_rects: c_int,
) -> c_uint {
    swap_with_damage(dpy, surface, rects, n_rects)
}

/// Our pointer for an interposed EGL name, if any.
pub fn find_egl_ptr(name: &CStr) -> *mut c_void {
    if mango_core::blacklist::is_blacklisted() {
        return std::ptr::null_mut();
    }
    match name.to_bytes() {
        b"eglSwapBuffers" => eglSwapBuffers as *mut c_void,
        b"eglSwapBuffersWithDamageKHR" => eglSwapBuffersWithDamageKHR as *mut c_void,
        b"eglSwapBuffersWithDamageEXT" => eglSwapBuffersWithDamageEXT as *mut c_void,
        b"eglGetProcAddress" => eglGetProcAddress as *mut c_void,
        _ => std::ptr::null_mut(),
    }
}

/// Interposed `eglGetProcAddress`.
///
/// # Safety
/// Standard EGL contract.
#[no_mangle]
pub unsafe extern "C" fn eglGetProcAddress(proc_name: *const c_char) -> *mut c_void {
    if proc_name.is_null() {
        return std::ptr::null_mut();
    }
    let name = CStr::from_ptr(proc_name);
    let real = EGL
        .get_proc_address
        .map(|f| f(proc_name))
        .unwrap_or(std::ptr::null_mut());
    let ours = find_egl_ptr(name);
    if !ours.is_null() && !real.is_null() {
        ours
    } else {
        real
    }
}
