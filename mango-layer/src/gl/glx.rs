//! GLX swap-buffer hooks.

use std::ffi::CStr;
use std::os::raw::{c_char, c_int, c_uint, c_void};

use once_cell::sync::Lazy;

use super::real_dlsym::get_proc_address;
use super::state::query_size;

const GLX_WIDTH: c_int = 0x801D;
const GLX_HEIGHT: c_int = 0x801E;

struct GlxFns {
    swap_buffers: Option<unsafe extern "C" fn(*mut c_void, *mut c_void)>,
    swap_buffers_msc_oml:
        Option<unsafe extern "C" fn(*mut c_void, *mut c_void, i64, i64, i64) -> i64>,
    get_current_context: Option<unsafe extern "C" fn() -> *mut c_void>,
    query_drawable:
        Option<unsafe extern "C" fn(*mut c_void, *mut c_void, c_int, *mut c_uint) -> c_int>,
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

static GLX: Lazy<GlxFns> = Lazy::new(|| GlxFns {
    swap_buffers: load_sym!("glXSwapBuffers"),
    swap_buffers_msc_oml: load_sym!("glXSwapBuffersMscOML"),
    get_current_context: load_sym!("glXGetCurrentContext"),
    query_drawable: load_sym!("glXQueryDrawable"),
    get_proc_address: load_sym!("glXGetProcAddress"),
});

fn current_context() -> usize {
    GLX.get_current_context
        .map(|f| unsafe { f() } as usize)
        .unwrap_or(0)
}

fn drawable_size(dpy: *mut c_void, drawable: *mut c_void) -> Option<(u32, u32)> {
    let query = GLX.query_drawable?;
    let mut width: c_uint = 0;
    let mut height: c_uint = 0;
    unsafe {
        query(dpy, drawable, GLX_WIDTH, &mut width);
        query(dpy, drawable, GLX_HEIGHT, &mut height);
    }
    (width != 0 && height != 0).then_some((width, height))
}

fn swap_common(dpy: *mut c_void, drawable: *mut c_void) -> usize {
    let ctx = current_context();
    if ctx != 0 {
        let policy = mango_core::Overlay::global().params().gl_size_query;
        let (width, height) = query_size(policy, || drawable_size(dpy, drawable));
        super::before_swap(ctx, width, height);
    }
    ctx
}

/// Interposed `glXSwapBuffers`.
///
/// # Safety
/// Called by the application with its own display/drawable.
#[no_mangle]
pub unsafe extern "C" fn glXSwapBuffers(dpy: *mut c_void, drawable: *mut c_void) {
    let ctx = swap_common(dpy, drawable);
    if let Some(real) = GLX.swap_buffers {
        real(dpy, drawable);
    }
    super::after_swap(ctx);
}

/// Interposed `glXSwapBuffersMscOML`.
///
/// # Safety
/// Called by the application with its own display/drawable.
#[no_mangle]
pub unsafe extern "C" fn glXSwapBuffersMscOML(
    dpy: *mut c_void,
    drawable: *mut c_void,
    target_msc: i64,
    divisor: i64,
    remainder: i64,
) -> i64 {
    let Some(real) = GLX.swap_buffers_msc_oml else {
        return -1;
    };
    let ctx = swap_common(dpy, drawable);
    let ret = real(dpy, drawable, target_msc, divisor, remainder);
    super::after_swap(ctx);
    ret
}

/// Our pointer for an interposed GLX name, if any.
pub fn find_glx_ptr(name: &CStr) -> *mut c_void {
    if mango_core::blacklist::is_blacklisted() {
        return std::ptr::null_mut();
    }
    match name.to_bytes() {
        b"glXSwapBuffers" => glXSwapBuffers as *mut c_void,
        b"glXSwapBuffersMscOML" => glXSwapBuffersMscOML as *mut c_void,
        b"glXGetProcAddress" => glXGetProcAddress as *mut c_void,
        b"glXGetProcAddressARB" => glXGetProcAddressARB as *mut c_void,
        _ => std::ptr::null_mut(),
    }
}

unsafe fn get_proc_common(proc_name: *const c_char) -> *mut c_void {
    if proc_name.is_null() {
        return std::ptr::null_mut();
    }
    let name = CStr::from_ptr(proc_name);
    let real = GLX
        .get_proc_address
        .map(|f| f(proc_name))
        .unwrap_or(std::ptr::null_mut());
    let ours = find_glx_ptr(name);
    // Only shadow symbols the real loader actually provides.
    if !ours.is_null() && !real.is_null() {
        ours
    } else {
        real
    }
}

/// Interposed `glXGetProcAddress`.
///
/// # Safety
/// Standard GLX contract.
#[no_mangle]
pub unsafe extern "C" fn glXGetProcAddress(proc_name: *const c_char) -> *mut c_void {
    get_proc_common(proc_name)
}

/// Interposed `glXGetProcAddressARB`.
///
/// # Safety
/// Standard GLX contract.
#[no_mangle]
pub unsafe extern "C" fn glXGetProcAddressARB(proc_name: *const c_char) -> *mut c_void {
    get_proc_common(proc_name)
}
