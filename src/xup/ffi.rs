//! C layout of libxup's `struct mod` and the client description it sends
//! to the X server.
//!
//! Both mirror the installed xrdp headers (`xup/xup.h`,
//! `xrdp_client_info.h`) and must be kept in step with them. Client and
//! server function blocks are each padded to 100 pointer slots, so slot
//! offsets stay fixed across module versions that only append entries.

#![allow(dead_code)]

use std::ffi::{c_char, c_int, c_short, c_void};

use xrdp_local_core::display::{DisplayDescriptor, MAX_MONITORS};

pub type Tbus = isize;

/// Number of pointer slots in each function block.
const FN_BLOCK_SLOTS: usize = 100;
const CLIENT_FNS: usize = 15;
const SERVER_FNS: usize = 54;

pub type ModFn = unsafe extern "C" fn(*mut XupMod) -> c_int;

/// Marker for table entries this bridge never calls or fills with a
/// typed handler; only the slot width matters.
pub type OpaqueFn = Option<unsafe extern "C" fn()>;

#[repr(C)]
pub struct XupMod {
    pub size: c_int,
    pub version: c_int,

    // Client functions, called by us.
    pub mod_start: Option<unsafe extern "C" fn(*mut XupMod, c_int, c_int, c_int) -> c_int>,
    pub mod_connect: Option<ModFn>,
    pub mod_event: Option<unsafe extern "C" fn(*mut XupMod, c_int, Tbus, Tbus, Tbus, Tbus) -> c_int>,
    pub mod_signal: Option<ModFn>,
    pub mod_end: Option<ModFn>,
    pub mod_set_param: Option<unsafe extern "C" fn(*mut XupMod, *const c_char, *const c_char) -> c_int>,
    pub mod_session_change: OpaqueFn,
    pub mod_get_wait_objs: OpaqueFn,
    pub mod_check_wait_objs: Option<ModFn>,
    pub mod_frame_ack: Option<unsafe extern "C" fn(*mut XupMod, c_int, c_int) -> c_int>,
    pub mod_suppress_output: OpaqueFn,
    pub mod_server_monitor_resize: OpaqueFn,
    pub mod_server_monitor_full_invalidate: OpaqueFn,
    pub mod_server_version_message: OpaqueFn,
    pub mod_dma_buf_request: Option<ModFn>,
    pub mod_dumby: [Tbus; FN_BLOCK_SLOTS - CLIENT_FNS],

    // Server functions, called by the module.
    pub server: ServerFns,
    pub server_dumby: [Tbus; FN_BLOCK_SLOTS - SERVER_FNS],

    pub handle: Tbus,
    /// Owner pointer, free for the host's use.
    pub wm: Tbus,
    pub painter: Tbus,
    pub si: *mut c_void,
}

type Int1 = unsafe extern "C" fn(*mut XupMod, c_int) -> c_int;
type Int2 = unsafe extern "C" fn(*mut XupMod, c_int, c_int) -> c_int;
type Int3 = unsafe extern "C" fn(*mut XupMod, c_int, c_int, c_int) -> c_int;
type Int4 = unsafe extern "C" fn(*mut XupMod, c_int, c_int, c_int, c_int) -> c_int;
type Int6 = unsafe extern "C" fn(*mut XupMod, c_int, c_int, c_int, c_int, c_int, c_int) -> c_int;
type Int7 = unsafe extern "C" fn(*mut XupMod, c_int, c_int, c_int, c_int, c_int, c_int, c_int) -> c_int;
type Glyph = unsafe extern "C" fn(*mut XupMod, c_int, c_int, c_int, c_int, c_int, c_int, *mut c_char) -> c_int;
type Opaque2 = unsafe extern "C" fn(*mut XupMod, c_int, *mut c_void, c_int) -> c_int;

/// The module's callbacks into the host, in table order.
#[repr(C)]
pub struct ServerFns {
    pub begin_update: Option<ModFn>,
    pub end_update: Option<ModFn>,
    pub fill_rect: Option<Int4>,
    pub screen_blt: Option<Int6>,
    pub paint_rect: Option<
        unsafe extern "C" fn(*mut XupMod, c_int, c_int, c_int, c_int, *mut c_char, c_int, c_int, c_int, c_int) -> c_int,
    >,
    pub set_cursor: Option<unsafe extern "C" fn(*mut XupMod, c_int, c_int, *mut c_char, *mut c_char) -> c_int>,
    pub palette: Option<unsafe extern "C" fn(*mut XupMod, *mut c_int) -> c_int>,
    pub msg: Option<unsafe extern "C" fn(*mut XupMod, *const c_char, c_int) -> c_int>,
    pub is_term: Option<unsafe extern "C" fn() -> c_int>,
    pub set_clip: Option<Int4>,
    pub reset_clip: Option<ModFn>,
    pub set_fgcolor: Option<Int1>,
    pub set_bgcolor: Option<Int1>,
    pub set_opcode: Option<Int1>,
    pub set_mixmode: Option<Int1>,
    pub set_brush: Option<unsafe extern "C" fn(*mut XupMod, c_int, c_int, c_int, *mut c_char) -> c_int>,
    pub set_pen: Option<Int2>,
    pub draw_line: Option<Int4>,
    pub add_char: Option<Glyph>,
    pub draw_text: Option<
        unsafe extern "C" fn(
            *mut XupMod,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            *mut c_char,
            c_int,
        ) -> c_int,
    >,
    pub client_monitor_resize:
        Option<unsafe extern "C" fn(*mut XupMod, c_int, c_int, c_int, *const MonitorInfo) -> c_int>,
    pub monitor_resize_done: Option<ModFn>,
    pub get_channel_count: Option<ModFn>,
    pub query_channel: Option<unsafe extern "C" fn(*mut XupMod, c_int, *mut c_char, *mut c_int) -> c_int>,
    pub get_channel_id: Option<unsafe extern "C" fn(*mut XupMod, *const c_char) -> c_int>,
    pub send_to_channel:
        Option<unsafe extern "C" fn(*mut XupMod, c_int, *mut c_char, c_int, c_int, c_int) -> c_int>,
    pub bell_trigger: Option<ModFn>,
    pub chansrv_in_use: Option<ModFn>,
    pub create_os_surface: Option<Int3>,
    pub switch_os_surface: Option<Int1>,
    pub delete_os_surface: Option<Int1>,
    pub paint_rect_os: Option<Int7>,
    pub set_hints: Option<Int2>,
    pub window_new_update: Option<Opaque2>,
    pub window_delete: Option<Int1>,
    pub window_icon: Option<unsafe extern "C" fn(*mut XupMod, c_int, c_int, c_int, *mut c_void, c_int) -> c_int>,
    pub window_cached_icon: Option<Int4>,
    pub notify_new_update: Option<unsafe extern "C" fn(*mut XupMod, c_int, c_int, *mut c_void, c_int) -> c_int>,
    pub notify_delete: Option<Int2>,
    pub monitored_desktop: Option<unsafe extern "C" fn(*mut XupMod, *mut c_void, c_int) -> c_int>,
    pub set_cursor_ex:
        Option<unsafe extern "C" fn(*mut XupMod, c_int, c_int, *mut c_char, *mut c_char, c_int) -> c_int>,
    pub add_char_alpha: Option<Glyph>,
    pub create_os_surface_bpp: Option<Int4>,
    pub paint_rect_bpp: Option<
        unsafe extern "C" fn(
            *mut XupMod,
            c_int,
            c_int,
            c_int,
            c_int,
            *mut c_char,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
        ) -> c_int,
    >,
    pub composite: Option<
        unsafe extern "C" fn(
            *mut XupMod,
            c_int,
            c_int,
            c_int,
            c_int,
            *mut c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
        ) -> c_int,
    >,
    pub paint_rects: Option<
        unsafe extern "C" fn(
            *mut XupMod,
            c_int,
            *mut c_short,
            c_int,
            *mut c_short,
            *mut c_char,
            c_int,
            c_int,
            c_int,
            c_int,
        ) -> c_int,
    >,
    pub session_info: Option<unsafe extern "C" fn(*mut XupMod, *const c_char, c_int) -> c_int>,
    pub set_pointer_large: Option<
        unsafe extern "C" fn(*mut XupMod, c_int, c_int, *mut c_char, *mut c_char, c_int, c_int, c_int) -> c_int,
    >,
    pub paint_rects_ex: Option<
        unsafe extern "C" fn(
            *mut XupMod,
            c_int,
            *mut c_short,
            c_int,
            *mut c_short,
            *mut c_char,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            c_int,
            *mut c_void,
            c_int,
        ) -> c_int,
    >,
    pub egfx_cmd: Option<unsafe extern "C" fn(*mut XupMod, *mut c_char, c_int, *mut c_char, c_int) -> c_int>,
    pub dma_buf_notify: Option<Int1>,
    pub dma_buf_receive_pixmap_fd:
        Option<unsafe extern "C" fn(*mut XupMod, c_int, u32, u32, u16, u32, u32) -> c_int>,
    pub dma_buf_deactivate: Option<ModFn>,
    pub dma_buf_paint_pixmap: Option<ModFn>,
}

/// Byte offset one past the accelerated-buffer request slot.
pub const DMA_BUF_REQUEST_SLOT_END: usize =
    std::mem::offset_of!(XupMod, mod_dma_buf_request) + std::mem::size_of::<Option<ModFn>>();

/// Raw contents of the accelerated-buffer request slot, without assuming
/// it holds a valid function pointer.
///
/// # Safety
/// `module` must point at a live table at least
/// [`DMA_BUF_REQUEST_SLOT_END`] bytes long.
pub unsafe fn dma_buf_request_slot(module: *const XupMod) -> usize {
    // SAFETY: caller guarantees the slot is in bounds.
    unsafe { std::ptr::addr_of!((*module).mod_dma_buf_request).cast::<usize>().read() }
}

pub const CLIENT_MONITOR_DATA_MAXIMUM_MONITORS: usize = 16;
const _: () = assert!(CLIENT_MONITOR_DATA_MAXIMUM_MONITORS == MAX_MONITORS);

pub const CLIENT_INFO_CURRENT_VERSION: c_int = 20230425;
pub const LARGE_POINTER_FLAG_96X96: c_int = 1;
/// `XRDP_a8r8g8b8`: 32 bpp, ARGB, 8 bits per channel.
pub const XRDP_A8R8G8B8: c_int = (32 << 24) | (2 << 16) | (8 << 12) | (8 << 8) | (8 << 4) | 8;
/// `pointer_flags` value enabling colour pointers.
pub const POINTER_FLAGS_COLOR: c_int = 1;

const CLIENT_DESCRIPTION_LEN: usize = 256;
const CLIENT_DESCRIPTION: &[u8] = b"xrdp_local";
/// Zeroed tail covering the client-info fields this bridge leaves at 0.
const CLIENT_INFO_RESERVED: usize = 8192;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MonitorInfo {
    pub left: c_int,
    pub top: c_int,
    pub right: c_int,
    pub bottom: c_int,
    pub flags: c_int,
    pub physical_width: u32,
    pub physical_height: u32,
    pub orientation: u32,
    pub desktop_scale_factor: u32,
    pub device_scale_factor: u32,
    pub is_primary: c_int,
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct DisplaySizes {
    pub monitor_count: u32,
    pub minfo: [MonitorInfo; CLIENT_MONITOR_DATA_MAXIMUM_MONITORS],
    pub minfo_wm: [MonitorInfo; CLIENT_MONITOR_DATA_MAXIMUM_MONITORS],
    pub session_width: u32,
    pub session_height: u32,
}

#[repr(C)]
pub struct ClientInfo {
    pub size: c_int,
    pub version: c_int,
    pub bpp: c_int,
    pub multimon: c_int,
    pub pointer_flags: c_int,
    pub large_pointer_support_flags: c_int,
    pub capture_format: c_int,
    pub normal_frame_interval: c_int,
    pub display_sizes: DisplaySizes,
    pub client_description: [c_char; CLIENT_DESCRIPTION_LEN],
    reserved: [u8; CLIENT_INFO_RESERVED],
}

// SAFETY: plain integers and arrays of them; all-zero is a valid value.
unsafe impl bytemuck::Zeroable for MonitorInfo {}
unsafe impl bytemuck::Zeroable for DisplaySizes {}
unsafe impl bytemuck::Zeroable for ClientInfo {}

impl ClientInfo {
    /// Client description for `display`: 32 bpp, multimon, colour and
    /// large pointers, a8r8g8b8 capture.
    pub fn new(display: &DisplayDescriptor) -> Box<Self> {
        let mut info: Box<Self> = Box::new(bytemuck::Zeroable::zeroed());
        info.size = std::mem::size_of::<Self>() as c_int;
        info.version = CLIENT_INFO_CURRENT_VERSION;
        info.bpp = 32;
        info.multimon = 1;
        info.pointer_flags = POINTER_FLAGS_COLOR;
        info.large_pointer_support_flags = LARGE_POINTER_FLAG_96X96;
        info.capture_format = XRDP_A8R8G8B8;
        info.normal_frame_interval = display.frame_interval_ms as c_int;

        let sizes = &mut info.display_sizes;
        sizes.monitor_count = display.monitors.len().min(CLIENT_MONITOR_DATA_MAXIMUM_MONITORS) as u32;
        sizes.session_width = display.session_width;
        sizes.session_height = display.session_height;
        for (slot, layout) in sizes.minfo.iter_mut().zip(&display.monitors) {
            *slot = MonitorInfo {
                left: layout.left,
                top: layout.top,
                right: layout.right,
                bottom: layout.bottom,
                flags: 0,
                physical_width: layout.width_mm,
                physical_height: layout.height_mm,
                orientation: layout.orientation,
                desktop_scale_factor: layout.desktop_scale,
                device_scale_factor: layout.device_scale,
                is_primary: layout.is_primary as c_int,
            };
        }
        sizes.minfo_wm = sizes.minfo;

        for (dst, &src) in info.client_description.iter_mut().zip(CLIENT_DESCRIPTION) {
            *dst = src as c_char;
        }
        info
    }
}
