//! GL state bookkeeping for the overlay draw.
//!
//! Two concerns: the per-context objects the overlay owns (texture,
//! program, VAO/VBO, cache FBO) and a scoped capture of the application's
//! bindings so the draw can restore them unconditionally.

use std::os::raw::{c_char, c_int, c_uint, c_void};

use once_cell::sync::Lazy;

use super::real_dlsym::get_proc_address;

pub const GL_VIEWPORT: c_uint = 0x0BA2;
pub const GL_SCISSOR_BOX: c_uint = 0x0C10;
const GL_CURRENT_PROGRAM: c_uint = 0x8B8D;
const GL_VERTEX_ARRAY_BINDING: c_uint = 0x85B5;
const GL_ARRAY_BUFFER_BINDING: c_uint = 0x8894;
const GL_ELEMENT_ARRAY_BUFFER_BINDING: c_uint = 0x8895;
const GL_ACTIVE_TEXTURE: c_uint = 0x84E0;
const GL_TEXTURE_BINDING_2D: c_uint = 0x8069;
const GL_FRAMEBUFFER_BINDING: c_uint = 0x8CA6;
const GL_BLEND: c_uint = 0x0BE2;
const GL_SCISSOR_TEST: c_uint = 0x0C11;
const GL_UNPACK_ALIGNMENT: c_uint = 0x0CF5;
const GL_SAMPLER_BINDING: c_uint = 0x8919;
const GL_TEXTURE0: c_uint = 0x84C0;
const GL_ARRAY_BUFFER: c_uint = 0x8892;
const GL_ELEMENT_ARRAY_BUFFER: c_uint = 0x8893;
const GL_FRAMEBUFFER: c_uint = 0x8D40;
const GL_TEXTURE_2D: c_uint = 0x0DE1;

/// The small set of GL entry points the state guard needs, resolved once
/// through the real loader.
pub struct GlFns {
    get_integer_v: Option<unsafe extern "C" fn(c_uint, *mut c_int)>,
    get_string: Option<unsafe extern "C" fn(c_uint) -> *const c_char>,
    is_enabled: Option<unsafe extern "C" fn(c_uint) -> u8>,
    enable: Option<unsafe extern "C" fn(c_uint)>,
    disable: Option<unsafe extern "C" fn(c_uint)>,
    use_program: Option<unsafe extern "C" fn(c_uint)>,
    bind_vertex_array: Option<unsafe extern "C" fn(c_uint)>,
    bind_buffer: Option<unsafe extern "C" fn(c_uint, c_uint)>,
    active_texture: Option<unsafe extern "C" fn(c_uint)>,
    bind_texture: Option<unsafe extern "C" fn(c_uint, c_uint)>,
    bind_framebuffer: Option<unsafe extern "C" fn(c_uint, c_uint)>,
    bind_sampler: Option<unsafe extern "C" fn(c_uint, c_uint)>,
    pixel_store_i: Option<unsafe extern "C" fn(c_uint, c_int)>,
    viewport: Option<unsafe extern "C" fn(c_int, c_int, c_int, c_int)>,
    scissor: Option<unsafe extern "C" fn(c_int, c_int, c_int, c_int)>,
}

macro_rules! load_gl {
    ($name:literal) => {{
        let ptr = get_proc_address($name);
        if ptr.is_null() {
            None
        } else {
            Some(unsafe { std::mem::transmute::<*mut c_void, _>(ptr) })
        }
    }};
}

impl GlFns {
    fn load() -> Self {
        Self {
            get_integer_v: load_gl!("glGetIntegerv"),
            get_string: load_gl!("glGetString"),
            is_enabled: load_gl!("glIsEnabled"),
            enable: load_gl!("glEnable"),
            disable: load_gl!("glDisable"),
            use_program: load_gl!("glUseProgram"),
            bind_vertex_array: load_gl!("glBindVertexArray"),
            bind_buffer: load_gl!("glBindBuffer"),
            active_texture: load_gl!("glActiveTexture"),
            bind_texture: load_gl!("glBindTexture"),
            bind_framebuffer: load_gl!("glBindFramebuffer"),
            bind_sampler: load_gl!("glBindSampler"),
            pixel_store_i: load_gl!("glPixelStorei"),
            viewport: load_gl!("glViewport"),
            scissor: load_gl!("glScissor"),
        }
    }

    fn get_int(&self, pname: c_uint) -> c_int {
        let mut value = 0;
        if let Some(f) = self.get_integer_v {
            unsafe { f(pname, &mut value) };
        }
        value
    }

    fn get_int4(&self, pname: c_uint) -> [c_int; 4] {
        let mut value = [0; 4];
        if let Some(f) = self.get_integer_v {
            unsafe { f(pname, value.as_mut_ptr()) };
        }
        value
    }

    pub fn renderer_string(&self) -> Option<String> {
        const GL_RENDERER: c_uint = 0x1F01;
        let f = self.get_string?;
        let ptr = unsafe { f(GL_RENDERER) };
        if ptr.is_null() {
            return None;
        }
        Some(
            unsafe { std::ffi::CStr::from_ptr(ptr) }
                .to_string_lossy()
                .into_owned(),
        )
    }
}

pub fn gl_fns() -> &'static GlFns {
    static FNS: Lazy<GlFns> = Lazy::new(GlFns::load);
    &FNS
}

/// Objects the overlay owns in one GL context.
pub struct GlContextState {
    pub inited: bool,
    pub texture: c_uint,
    pub program: c_uint,
    pub vao: c_uint,
    pub vbo: c_uint,
    pub cache_fbo: c_uint,
    pub uniform_tex: c_int,
    pub uniform_proj: c_int,
    /// Last drawable size the hooks saw.
    pub width: u32,
    pub height: u32,
    /// Frames drawn in this context; the font atlas uploads on the first.
    pub frames_drawn: u64,
}

impl GlContextState {
    pub fn new() -> Self {
        Self {
            inited: false,
            texture: 0,
            program: 0,
            vao: 0,
            vbo: 0,
            cache_fbo: 0,
            uniform_tex: -1,
            uniform_proj: -1,
            width: 0,
            height: 0,
            frames_drawn: 0,
        }
    }

    pub fn note_size(&mut self, width: u32, height: u32) {
        self.width = width;
        self.height = height;
    }

    pub fn mark_drawn(&mut self) {
        self.inited = true;
        self.frames_drawn += 1;
    }
}

impl Default for GlContextState {
    fn default() -> Self {
        Self::new()
    }
}

/// Application GL state captured before the overlay draw and restored on
/// drop, whichever way the draw exits.
pub struct SavedGlState {
    program: c_int,
    vao: c_int,
    array_buffer: c_int,
    element_buffer: c_int,
    active_texture: c_int,
    texture_2d: c_int,
    framebuffer: c_int,
    sampler: c_int,
    unpack_alignment: c_int,
    viewport: [c_int; 4],
    scissor_box: [c_int; 4],
    blend_enabled: bool,
    scissor_enabled: bool,
}

impl SavedGlState {
    pub fn capture() -> Self {
        let gl = gl_fns();
        let enabled = |cap: c_uint| gl.is_enabled.map(|f| unsafe { f(cap) } != 0).unwrap_or(false);
        Self {
            program: gl.get_int(GL_CURRENT_PROGRAM),
            vao: gl.get_int(GL_VERTEX_ARRAY_BINDING),
            array_buffer: gl.get_int(GL_ARRAY_BUFFER_BINDING),
            element_buffer: gl.get_int(GL_ELEMENT_ARRAY_BUFFER_BINDING),
            active_texture: gl.get_int(GL_ACTIVE_TEXTURE),
            texture_2d: gl.get_int(GL_TEXTURE_BINDING_2D),
            framebuffer: gl.get_int(GL_FRAMEBUFFER_BINDING),
            sampler: gl.get_int(GL_SAMPLER_BINDING),
            unpack_alignment: gl.get_int(GL_UNPACK_ALIGNMENT),
            viewport: gl.get_int4(GL_VIEWPORT),
            scissor_box: gl.get_int4(GL_SCISSOR_BOX),
            blend_enabled: enabled(GL_BLEND),
            scissor_enabled: enabled(GL_SCISSOR_TEST),
        }
    }
}

impl Drop for SavedGlState {
    fn drop(&mut self) {
        let gl = gl_fns();
        unsafe {
            if let Some(f) = gl.use_program {
                f(self.program as c_uint);
            }
            if let Some(f) = gl.bind_vertex_array {
                f(self.vao as c_uint);
            }
            if let Some(f) = gl.bind_buffer {
                f(GL_ARRAY_BUFFER, self.array_buffer as c_uint);
                f(GL_ELEMENT_ARRAY_BUFFER, self.element_buffer as c_uint);
            }
            if let Some(f) = gl.bind_framebuffer {
                f(GL_FRAMEBUFFER, self.framebuffer as c_uint);
            }
            if let Some(f) = gl.active_texture {
                // Restore the texture binding on unit 0, then the app's
                // active unit.
                f(GL_TEXTURE0);
            }
            if let Some(f) = gl.bind_texture {
                f(GL_TEXTURE_2D, self.texture_2d as c_uint);
            }
            if let Some(f) = gl.active_texture {
                f(self.active_texture as c_uint);
            }
            if let Some(f) = gl.bind_sampler {
                f(0, self.sampler as c_uint);
            }
            if let Some(f) = gl.pixel_store_i {
                f(GL_UNPACK_ALIGNMENT, self.unpack_alignment);
            }
            if let Some(f) = gl.viewport {
                f(
                    self.viewport[0],
                    self.viewport[1],
                    self.viewport[2],
                    self.viewport[3],
                );
            }
            if let Some(f) = gl.scissor {
                f(
                    self.scissor_box[0],
                    self.scissor_box[1],
                    self.scissor_box[2],
                    self.scissor_box[3],
                );
            }
            let set_cap = |cap: c_uint, on: bool| unsafe {
                if on {
                    if let Some(f) = gl.enable {
                        f(cap);
                    }
                } else if let Some(f) = gl.disable {
                    f(cap);
                }
            };
            set_cap(GL_BLEND, self.blend_enabled);
            set_cap(GL_SCISSOR_TEST, self.scissor_enabled);
        }
    }
}

/// Drawable size per the configured query policy, falling back to the
/// window-system query the caller supplies.
pub fn query_size(
    policy: mango_core::params::GlSizeQuery,
    drawable_query: impl FnOnce() -> Option<(u32, u32)>,
) -> (u32, u32) {
    use mango_core::params::GlSizeQuery;
    let gl = gl_fns();
    match policy {
        GlSizeQuery::Viewport => {
            let vp = gl.get_int4(GL_VIEWPORT);
            (vp[2].max(0) as u32, vp[3].max(0) as u32)
        }
        GlSizeQuery::ScissorBox => {
            let sb = gl.get_int4(GL_SCISSOR_BOX);
            (sb[2].max(0) as u32, sb[3].max(0) as u32)
        }
        GlSizeQuery::Drawable => drawable_query().unwrap_or_else(|| {
            let vp = gl.get_int4(GL_VIEWPORT);
            (vp[2].max(0) as u32, vp[3].max(0) as u32)
        }),
    }
}
