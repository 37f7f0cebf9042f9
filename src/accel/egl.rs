//! EGL dma-buf import onto the output window.
//!
//! libEGL is loaded at runtime; the dma-buf entry points come from
//! `eglGetProcAddress`. Each acquired EGL object is held by its own guard.
//! The context and window surface are created on the first import and
//! shared by every later session until the pipeline goes idle; a session
//! only holds the image and the texture it is bound to. Guards are stored
//! in reverse acquisition order so a failure part-way through, or a normal
//! teardown, releases them newest first.

use std::ffi::{CStr, CString, c_char, c_void};
use std::path::Path;
use std::ptr;
use std::rc::Rc;

use tracing::{debug, info, warn};
use x11_dl::xlib::{self, Xlib};
use xrdp_local_core::AccelError;
use xrdp_local_core::accel::{AccelBackend, AccelBufferHandle};

use super::quad::TexturedQuad;
use crate::dl::Library;

type EGLDisplay = *mut c_void;
type EGLConfig = *mut c_void;
type EGLContext = *mut c_void;
type EGLSurface = *mut c_void;
type EGLImageKHR = *mut c_void;
type EGLint = i32;
type EGLBoolean = u32;
type EGLenum = u32;

const EGL_FALSE: EGLBoolean = 0;
const EGL_NONE: EGLint = 0x3038;
const EGL_ALPHA_SIZE: EGLint = 0x3021;
const EGL_BLUE_SIZE: EGLint = 0x3022;
const EGL_GREEN_SIZE: EGLint = 0x3023;
const EGL_RED_SIZE: EGLint = 0x3024;
const EGL_SURFACE_TYPE: EGLint = 0x3033;
const EGL_WINDOW_BIT: EGLint = 0x0004;
const EGL_RENDERABLE_TYPE: EGLint = 0x3040;
const EGL_OPENGL_BIT: EGLint = 0x0008;
const EGL_EXTENSIONS: EGLint = 0x3055;
const EGL_HEIGHT: EGLint = 0x3056;
const EGL_WIDTH: EGLint = 0x3057;
const EGL_OPENGL_API: EGLenum = 0x30A2;
const EGL_CONTEXT_MAJOR_VERSION: EGLint = 0x3098;
const EGL_CONTEXT_MINOR_VERSION: EGLint = 0x30FB;
const EGL_CONTEXT_OPENGL_PROFILE_MASK: EGLint = 0x30FD;
const EGL_CONTEXT_OPENGL_CORE_PROFILE_BIT: EGLint = 0x0001;
const EGL_LINUX_DMA_BUF_EXT: EGLenum = 0x3270;
const EGL_LINUX_DRM_FOURCC_EXT: EGLint = 0x3271;
const EGL_DMA_BUF_PLANE0_FD_EXT: EGLint = 0x3272;
const EGL_DMA_BUF_PLANE0_OFFSET_EXT: EGLint = 0x3273;
const EGL_DMA_BUF_PLANE0_PITCH_EXT: EGLint = 0x3274;

const LIBEGL: &str = "libEGL.so.1";
const DMA_BUF_IMPORT_EXT: &str = "EGL_EXT_image_dma_buf_import";
const GL_TEXTURE_2D: u32 = 0x0DE1;

/// libEGL entry points.
#[allow(non_snake_case)]
struct Egl {
    _lib: Library,
    eglGetDisplay: unsafe extern "C" fn(*mut c_void) -> EGLDisplay,
    eglInitialize: unsafe extern "C" fn(EGLDisplay, *mut EGLint, *mut EGLint) -> EGLBoolean,
    eglTerminate: unsafe extern "C" fn(EGLDisplay) -> EGLBoolean,
    eglReleaseThread: unsafe extern "C" fn() -> EGLBoolean,
    eglQueryString: unsafe extern "C" fn(EGLDisplay, EGLint) -> *const c_char,
    eglBindAPI: unsafe extern "C" fn(EGLenum) -> EGLBoolean,
    eglChooseConfig:
        unsafe extern "C" fn(EGLDisplay, *const EGLint, *mut EGLConfig, EGLint, *mut EGLint) -> EGLBoolean,
    eglCreateContext: unsafe extern "C" fn(EGLDisplay, EGLConfig, EGLContext, *const EGLint) -> EGLContext,
    eglDestroyContext: unsafe extern "C" fn(EGLDisplay, EGLContext) -> EGLBoolean,
    eglCreateWindowSurface:
        unsafe extern "C" fn(EGLDisplay, EGLConfig, std::ffi::c_ulong, *const EGLint) -> EGLSurface,
    eglDestroySurface: unsafe extern "C" fn(EGLDisplay, EGLSurface) -> EGLBoolean,
    eglMakeCurrent: unsafe extern "C" fn(EGLDisplay, EGLSurface, EGLSurface, EGLContext) -> EGLBoolean,
    eglSwapBuffers: unsafe extern "C" fn(EGLDisplay, EGLSurface) -> EGLBoolean,
    eglGetError: unsafe extern "C" fn() -> EGLint,
    eglGetProcAddress: unsafe extern "C" fn(*const c_char) -> *mut c_void,
}

type CreateImageKhr =
    unsafe extern "C" fn(EGLDisplay, EGLContext, EGLenum, *mut c_void, *const EGLint) -> EGLImageKHR;
type DestroyImageKhr = unsafe extern "C" fn(EGLDisplay, EGLImageKHR) -> EGLBoolean;
type ImageTargetTexture2dOes = unsafe extern "C" fn(u32, EGLImageKHR);

/// dma-buf extension entry points, resolved per display.
#[derive(Clone, Copy)]
struct ImageFns {
    create: CreateImageKhr,
    destroy: DestroyImageKhr,
    target_texture: ImageTargetTexture2dOes,
}

impl Egl {
    fn load() -> Result<Self, AccelError> {
        let lib = Library::open(Path::new(LIBEGL)).map_err(|e| AccelError::backend("dlopen", format!("{:#}", e)))?;
        macro_rules! sym {
            ($name:ident) => {
                // SAFETY: field types mirror the EGL 1.4 prototypes.
                unsafe { lib.symbol(stringify!($name)) }
                    .map_err(|e| AccelError::backend(stringify!($name), format!("{:#}", e)))?
            };
        }
        Ok(Self {
            eglGetDisplay: sym!(eglGetDisplay),
            eglInitialize: sym!(eglInitialize),
            eglTerminate: sym!(eglTerminate),
            eglReleaseThread: sym!(eglReleaseThread),
            eglQueryString: sym!(eglQueryString),
            eglBindAPI: sym!(eglBindAPI),
            eglChooseConfig: sym!(eglChooseConfig),
            eglCreateContext: sym!(eglCreateContext),
            eglDestroyContext: sym!(eglDestroyContext),
            eglCreateWindowSurface: sym!(eglCreateWindowSurface),
            eglDestroySurface: sym!(eglDestroySurface),
            eglMakeCurrent: sym!(eglMakeCurrent),
            eglSwapBuffers: sym!(eglSwapBuffers),
            eglGetError: sym!(eglGetError),
            eglGetProcAddress: sym!(eglGetProcAddress),
            _lib: lib,
        })
    }

    fn proc_address(&self, name: &str) -> *mut c_void {
        match CString::new(name) {
            // SAFETY: valid C string.
            Ok(c) => unsafe { (self.eglGetProcAddress)(c.as_ptr()) },
            Err(_) => ptr::null_mut(),
        }
    }

    fn image_fns(&self) -> Option<ImageFns> {
        let create = self.proc_address("eglCreateImageKHR");
        let destroy = self.proc_address("eglDestroyImageKHR");
        let target = self.proc_address("glEGLImageTargetTexture2DOES");
        if create.is_null() || destroy.is_null() || target.is_null() {
            return None;
        }
        // SAFETY: non-null pointers returned for these names have these types.
        unsafe {
            Some(ImageFns {
                create: std::mem::transmute::<*mut c_void, CreateImageKhr>(create),
                destroy: std::mem::transmute::<*mut c_void, DestroyImageKhr>(destroy),
                target_texture: std::mem::transmute::<*mut c_void, ImageTargetTexture2dOes>(target),
            })
        }
    }

    fn error(&self, call: &'static str) -> AccelError {
        // SAFETY: no preconditions.
        let code = unsafe { (self.eglGetError)() };
        AccelError::backend(call, format!("EGL error {:#06x}", code))
    }

    fn extensions(&self, display: EGLDisplay) -> String {
        // SAFETY: display is initialized; result is null or a static string.
        unsafe {
            let s = (self.eglQueryString)(display, EGL_EXTENSIONS);
            if s.is_null() {
                String::new()
            } else {
                CStr::from_ptr(s).to_string_lossy().into_owned()
            }
        }
    }
}

struct DisplayGuard {
    egl: Rc<Egl>,
    display: EGLDisplay,
}

impl DisplayGuard {
    fn initialize(egl: &Rc<Egl>, native: *mut xlib::Display) -> Result<Self, AccelError> {
        // SAFETY: native is a live Xlib display owned by the backend.
        let display = unsafe { (egl.eglGetDisplay)(native as *mut c_void) };
        if display.is_null() {
            return Err(egl.error("eglGetDisplay"));
        }
        let (mut major, mut minor) = (0, 0);
        // SAFETY: display came from eglGetDisplay.
        if unsafe { (egl.eglInitialize)(display, &mut major, &mut minor) } == EGL_FALSE {
            return Err(egl.error("eglInitialize"));
        }
        debug!("EGL {}.{} initialized", major, minor);
        Ok(Self {
            egl: egl.clone(),
            display,
        })
    }
}

impl Drop for DisplayGuard {
    fn drop(&mut self) {
        // SAFETY: initialized in `initialize`.
        unsafe {
            (self.egl.eglTerminate)(self.display);
            (self.egl.eglReleaseThread)();
        }
    }
}

struct ContextGuard {
    egl: Rc<Egl>,
    display: EGLDisplay,
    context: EGLContext,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        // SAFETY: context belongs to display, which outlives this guard.
        unsafe { (self.egl.eglDestroyContext)(self.display, self.context) };
    }
}

struct SurfaceGuard {
    egl: Rc<Egl>,
    display: EGLDisplay,
    surface: EGLSurface,
}

impl Drop for SurfaceGuard {
    fn drop(&mut self) {
        // SAFETY: surface belongs to display, which outlives this guard.
        unsafe { (self.egl.eglDestroySurface)(self.display, self.surface) };
    }
}

/// Releases the current context binding.
struct CurrentGuard {
    egl: Rc<Egl>,
    display: EGLDisplay,
}

impl Drop for CurrentGuard {
    fn drop(&mut self) {
        // SAFETY: unbinding is always valid on an initialized display.
        unsafe {
            (self.egl.eglMakeCurrent)(self.display, ptr::null_mut(), ptr::null_mut(), ptr::null_mut())
        };
    }
}

struct ImageGuard {
    destroy: DestroyImageKhr,
    display: EGLDisplay,
    image: EGLImageKHR,
}

impl Drop for ImageGuard {
    fn drop(&mut self) {
        // SAFETY: image belongs to display, which outlives this guard.
        unsafe { (self.destroy)(self.display, self.image) };
    }
}

/// Context bound to the output window, shared by sessions. Fields drop
/// top to bottom.
struct Presenter {
    _current: CurrentGuard,
    surface: SurfaceGuard,
    _context: ContextGuard,
    display: DisplayGuard,
}

/// One imported buffer. Fields drop top to bottom.
pub struct EglSession {
    quad: TexturedQuad,
    _image: ImageGuard,
}

/// Xlib display EGL runs on, separate from the x11rb connection.
struct NativeDisplay {
    xlib: Xlib,
    display: *mut xlib::Display,
}

impl Drop for NativeDisplay {
    fn drop(&mut self) {
        // SAFETY: opened by XOpenDisplay and closed once.
        unsafe { (self.xlib.XCloseDisplay)(self.display) };
    }
}

pub struct EglBackend {
    // Before `native`: EGL must be torn down while the Xlib display is open.
    presenter: Option<Presenter>,
    egl: Rc<Egl>,
    native: NativeDisplay,
    window: std::ffi::c_ulong,
}

impl EglBackend {
    /// Load libEGL and open `display_name` for `window`.
    pub fn new(display_name: &str, window: u32) -> Result<Self, AccelError> {
        let egl = Rc::new(Egl::load()?);
        let xlib = Xlib::open().map_err(|e| AccelError::backend("Xlib::open", e.to_string()))?;
        let c_name = CString::new(display_name).map_err(|e| AccelError::backend("XOpenDisplay", e.to_string()))?;
        // SAFETY: valid C string.
        let display = unsafe { (xlib.XOpenDisplay)(c_name.as_ptr()) };
        if display.is_null() {
            return Err(AccelError::backend("XOpenDisplay", format!("cannot open {:?}", display_name)));
        }
        Ok(Self {
            presenter: None,
            egl,
            native: NativeDisplay { xlib, display },
            window: window as std::ffi::c_ulong,
        })
    }

    /// Whether EGL on this display can import dma-bufs. Creates and tears
    /// down a throwaway display connection; no session state changes.
    pub fn capability_supported(&self, display_name: &str) -> bool {
        if !display_name.starts_with(':') {
            warn!("Remote X display {:?}, accelerated path disabled", display_name);
            return false;
        }
        let probe = match DisplayGuard::initialize(&self.egl, self.native.display) {
            Ok(d) => d,
            Err(e) => {
                info!("EGL unavailable ({}), accelerated path disabled", e);
                return false;
            }
        };
        if !self.egl.extensions(probe.display).split_whitespace().any(|e| e == DMA_BUF_IMPORT_EXT) {
            info!("{} missing, accelerated path disabled", DMA_BUF_IMPORT_EXT);
            return false;
        }
        if self.egl.image_fns().is_none() {
            info!("EGLImage entry points missing, accelerated path disabled");
            return false;
        }
        info!("Accelerated path supported by the local display");
        true
    }
}

impl EglBackend {
    /// Create the context and window surface and make them current.
    fn create_presenter(&self) -> Result<Presenter, AccelError> {
        let egl = &self.egl;
        let display = DisplayGuard::initialize(egl, self.native.display)?;
        let dpy = display.display;

        // SAFETY: every call below operates on `dpy`, which `display` keeps
        // initialized, and stores its result in a guard before continuing.
        unsafe {
            if (egl.eglBindAPI)(EGL_OPENGL_API) == EGL_FALSE {
                return Err(egl.error("eglBindAPI"));
            }

            let config_attribs = [
                EGL_SURFACE_TYPE, EGL_WINDOW_BIT,
                EGL_RED_SIZE, 8,
                EGL_GREEN_SIZE, 8,
                EGL_BLUE_SIZE, 8,
                EGL_ALPHA_SIZE, 8,
                EGL_RENDERABLE_TYPE, EGL_OPENGL_BIT,
                EGL_NONE,
            ];
            let mut config: EGLConfig = ptr::null_mut();
            let mut count = 0;
            if (egl.eglChooseConfig)(dpy, config_attribs.as_ptr(), &mut config, 1, &mut count) == EGL_FALSE
                || count == 0
            {
                return Err(egl.error("eglChooseConfig"));
            }

            let context_attribs = [
                EGL_CONTEXT_MAJOR_VERSION, 3,
                EGL_CONTEXT_MINOR_VERSION, 3,
                EGL_CONTEXT_OPENGL_PROFILE_MASK, EGL_CONTEXT_OPENGL_CORE_PROFILE_BIT,
                EGL_NONE,
            ];
            let context = (egl.eglCreateContext)(dpy, config, ptr::null_mut(), context_attribs.as_ptr());
            if context.is_null() {
                return Err(egl.error("eglCreateContext"));
            }
            let context = ContextGuard {
                egl: egl.clone(),
                display: dpy,
                context,
            };

            let surface = (egl.eglCreateWindowSurface)(dpy, config, self.window, ptr::null());
            if surface.is_null() {
                return Err(egl.error("eglCreateWindowSurface"));
            }
            let surface = SurfaceGuard {
                egl: egl.clone(),
                display: dpy,
                surface,
            };

            if (egl.eglMakeCurrent)(dpy, surface.surface, surface.surface, context.context) == EGL_FALSE {
                return Err(egl.error("eglMakeCurrent"));
            }
            let current = CurrentGuard {
                egl: egl.clone(),
                display: dpy,
            };

            gl::load_with(|name| egl.proc_address(name) as *const _);
            debug!("EGL context current on window {:#x}", self.window);
            Ok(Presenter {
                _current: current,
                surface,
                _context: context,
                display,
            })
        }
    }
}

impl AccelBackend for EglBackend {
    type Session = EglSession;

    fn import(&mut self, handle: &AccelBufferHandle) -> Result<EglSession, AccelError> {
        let presenter = match self.presenter.take() {
            Some(presenter) => presenter,
            None => self.create_presenter()?,
        };
        let dpy = presenter.display.display;
        self.presenter = Some(presenter);
        let egl = &self.egl;
        let fns = egl
            .image_fns()
            .ok_or_else(|| AccelError::backend("eglGetProcAddress", "EGLImage entry points missing"))?;

        // SAFETY: the presenter's context is current on this thread and
        // `dpy` stays initialized while it lives.
        unsafe {
            let image_attribs = [
                EGL_WIDTH, handle.width as EGLint,
                EGL_HEIGHT, handle.height as EGLint,
                EGL_LINUX_DRM_FOURCC_EXT, handle.format as EGLint,
                EGL_DMA_BUF_PLANE0_FD_EXT, handle.fd,
                EGL_DMA_BUF_PLANE0_PITCH_EXT, handle.stride as EGLint,
                EGL_DMA_BUF_PLANE0_OFFSET_EXT, 0,
                EGL_NONE,
            ];
            let image = (fns.create)(
                dpy,
                ptr::null_mut(),
                EGL_LINUX_DMA_BUF_EXT,
                ptr::null_mut(),
                image_attribs.as_ptr(),
            );
            if image.is_null() {
                return Err(egl.error("eglCreateImageKHR"));
            }
            let image = ImageGuard {
                destroy: fns.destroy,
                display: dpy,
                image,
            };

            let quad = TexturedQuad::new(handle.width, handle.height)?;
            (fns.target_texture)(GL_TEXTURE_2D, image.image);

            debug!("Imported dma-buf fd {} as texture {}", handle.fd, quad.texture());
            Ok(EglSession { quad, _image: image })
        }
    }

    fn render(&mut self, session: &mut EglSession) -> Result<(), AccelError> {
        let presenter = self.presenter.as_ref().ok_or(AccelError::NotEnabled)?;
        // SAFETY: the presenter's context is current on this thread.
        unsafe {
            session.quad.draw();
            if (self.egl.eglSwapBuffers)(presenter.display.display, presenter.surface.surface) == EGL_FALSE {
                return Err(self.egl.error("eglSwapBuffers"));
            }
        }
        Ok(())
    }

    fn release(&mut self) {
        if self.presenter.take().is_some() {
            debug!("EGL context released");
        }
    }
}
