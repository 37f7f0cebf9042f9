//! Host callbacks installed into the module's server function table.
//!
//! Every callback runs on the transport worker thread, inside
//! `mod_check_wait_objs`, with the communication lock already held. They
//! may call back into the module directly (frame acks, invalidation) but
//! must never take the lock themselves.

use std::ffi::{CStr, c_char, c_int, c_short, c_void};
use std::slice;

use tracing::{debug, error, info, trace, warn};
use xrdp_local_core::ModuleError;
use xrdp_local_core::accel::AccelBufferHandle;
use xrdp_local_core::cursor;
use xrdp_local_core::frame::{BYTES_PER_PIXEL, FrameChannel, FrameTransfer, FrameUpdate, RECT_WIRE_SIZE, UpdateRect};
use xrdp_local_core::input::ModuleMessage;
use xrdp_local_core::worker::ExitHandle;

use super::ffi::{MonitorInfo, ServerFns, Tbus, XupMod};
use crate::render::RenderHandle;

const OK: c_int = 0;
const FAILED: c_int = 1;

/// Legacy cursor callbacks always carry a 32x32 image.
const LEGACY_CURSOR_SIZE: u32 = 32;

/// Host state reachable from the module through its `wm` field.
pub struct CallbackContext {
    pub render: RenderHandle,
    pub transfer: FrameTransfer,
    pub session_size: (u32, u32),
}

/// # Safety
/// `v` must be the table this bridge installed its context into, and the
/// context must outlive the call.
unsafe fn context<'a>(v: *mut XupMod) -> Option<&'a CallbackContext> {
    if v.is_null() {
        return None;
    }
    // SAFETY: `wm` holds a `*const CallbackContext` or 0.
    unsafe { ((*v).wm as *const CallbackContext).as_ref() }
}

unsafe fn unimplemented_callback(v: *mut XupMod, name: &'static str) -> c_int {
    error!("{}", ModuleError::Unimplemented(name));
    // SAFETY: forwarded from the callback's own contract.
    if let Some(ctx) = unsafe { context(v) } {
        ctx.render.request_exit();
    }
    FAILED
}

/// Stub callbacks for protocol features this bridge does not support.
/// Each one logs, asks the application to exit and reports failure.
macro_rules! unsupported {
    ($($name:ident($($arg:ty),*);)*) => {
        $(
            unsafe extern "C" fn $name(v: *mut XupMod $(, _: $arg)*) -> c_int {
                // SAFETY: called by the module with its own table.
                unsafe { unimplemented_callback(v, concat!("server_", stringify!($name))) }
            }
        )*
    };
}

unsupported! {
    fill_rect(c_int, c_int, c_int, c_int);
    screen_blt(c_int, c_int, c_int, c_int, c_int, c_int);
    paint_rect(c_int, c_int, c_int, c_int, *mut c_char, c_int, c_int, c_int, c_int);
    palette(*mut c_int);
    set_clip(c_int, c_int, c_int, c_int);
    reset_clip();
    set_fgcolor(c_int);
    set_bgcolor(c_int);
    set_opcode(c_int);
    set_mixmode(c_int);
    set_brush(c_int, c_int, c_int, *mut c_char);
    set_pen(c_int, c_int);
    draw_line(c_int, c_int, c_int, c_int);
    add_char(c_int, c_int, c_int, c_int, c_int, c_int, *mut c_char);
    draw_text(
        c_int, c_int, c_int, c_int, c_int, c_int, c_int, c_int, c_int, c_int, c_int, c_int, c_int,
        *mut c_char, c_int
    );
    client_monitor_resize(c_int, c_int, c_int, *const MonitorInfo);
    get_channel_count();
    query_channel(c_int, *mut c_char, *mut c_int);
    get_channel_id(*const c_char);
    send_to_channel(c_int, *mut c_char, c_int, c_int, c_int);
    bell_trigger();
    chansrv_in_use();
    create_os_surface(c_int, c_int, c_int);
    switch_os_surface(c_int);
    delete_os_surface(c_int);
    paint_rect_os(c_int, c_int, c_int, c_int, c_int, c_int, c_int);
    set_hints(c_int, c_int);
    window_new_update(c_int, *mut c_void, c_int);
    window_delete(c_int);
    window_icon(c_int, c_int, c_int, *mut c_void, c_int);
    window_cached_icon(c_int, c_int, c_int, c_int);
    notify_new_update(c_int, c_int, *mut c_void, c_int);
    notify_delete(c_int, c_int);
    monitored_desktop(*mut c_void, c_int);
    add_char_alpha(c_int, c_int, c_int, c_int, c_int, c_int, *mut c_char);
    create_os_surface_bpp(c_int, c_int, c_int, c_int);
    paint_rect_bpp(c_int, c_int, c_int, c_int, *mut c_char, c_int, c_int, c_int, c_int, c_int);
    composite(
        c_int, c_int, c_int, c_int, *mut c_int, c_int, c_int, c_int, c_int, c_int, c_int, c_int,
        c_int, c_int, c_int, c_int, c_int, c_int, c_int, c_int
    );
    session_info(*const c_char, c_int);
    egfx_cmd(*mut c_char, c_int, *mut c_char, c_int);
}

unsafe extern "C" fn begin_update(_v: *mut XupMod) -> c_int {
    OK
}

unsafe extern "C" fn end_update(_v: *mut XupMod) -> c_int {
    OK
}

unsafe extern "C" fn is_term() -> c_int {
    0
}

unsafe extern "C" fn monitor_resize_done(_v: *mut XupMod) -> c_int {
    debug!("Server finished monitor resize");
    OK
}

unsafe extern "C" fn msg(_v: *mut XupMod, text: *const c_char, _code: c_int) -> c_int {
    if text.is_null() {
        return 0;
    }
    // SAFETY: the module passes a NUL-terminated message.
    let text = unsafe { CStr::from_ptr(text) };
    info!("Module message: {}", text.to_string_lossy());
    text.to_bytes().len() as c_int
}

/// Wrap the module's buffer in a frame channel, hand it to the render
/// thread and wait for release.
///
/// # Safety
/// `rects` must hold `num_rects` wire rects and `data` at least
/// `width * height` pixels, all valid for the duration of the call.
#[allow(clippy::too_many_arguments)]
unsafe fn present_frame(
    ctx: &CallbackContext,
    rects: *const c_short,
    num_rects: c_int,
    data: *const c_char,
    left: c_int,
    top: c_int,
    width: c_int,
    height: c_int,
) -> c_int {
    if width <= 0 || height <= 0 || data.is_null() {
        trace!("Empty frame {}x{}", width, height);
        return OK;
    }
    let rect_bytes: &[u8] = if rects.is_null() || num_rects <= 0 {
        &[]
    } else {
        // SAFETY: caller contract.
        unsafe { slice::from_raw_parts(rects.cast::<u8>(), num_rects as usize * RECT_WIRE_SIZE) }
    };
    let pixel_len = width as usize * height as usize * BYTES_PER_PIXEL;
    // SAFETY: caller contract.
    let pixels = unsafe { slice::from_raw_parts(data.cast::<u8>(), pixel_len) };

    let update = UpdateRect::slice_from_wire(rect_bytes)
        .and_then(|rects| {
            let update = FrameUpdate::new(left, top, width as u32, height as u32, &rects, pixels)?;
            trace!(
                "Frame {}x{}+{}+{} with {} rect(s)",
                width,
                height,
                left,
                top,
                update.rects.len()
            );
            FrameChannel::create(update, ctx.transfer).hand_off(|frame| {
                if !ctx.render.post_frame(frame) {
                    debug!("Render loop gone, frame dropped");
                }
            });
            Ok(())
        });
    match update {
        Ok(()) => OK,
        Err(e) => {
            error!("Malformed frame from module: {}", e);
            ctx.render.request_exit();
            FAILED
        }
    }
}

unsafe fn frame_ack(v: *mut XupMod, flags: c_int, frame_id: c_int) {
    // SAFETY: `v` is the live table; the communication lock is held by
    // the worker that called us.
    unsafe {
        if let Some(ack) = (*v).mod_frame_ack {
            ack(v, flags, frame_id);
        }
    }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn paint_rects(
    v: *mut XupMod,
    num_drects: c_int,
    drects: *mut c_short,
    _num_crects: c_int,
    _crects: *mut c_short,
    data: *mut c_char,
    width: c_int,
    height: c_int,
    flags: c_int,
    frame_id: c_int,
) -> c_int {
    // SAFETY: called by the module with its own table and buffers.
    unsafe {
        let Some(ctx) = context(v) else {
            return FAILED;
        };
        let status = present_frame(ctx, drects, num_drects, data, 0, 0, width, height);
        frame_ack(v, flags, frame_id);
        status
    }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn paint_rects_ex(
    v: *mut XupMod,
    num_drects: c_int,
    drects: *mut c_short,
    _num_crects: c_int,
    _crects: *mut c_short,
    data: *mut c_char,
    left: c_int,
    top: c_int,
    width: c_int,
    height: c_int,
    flags: c_int,
    frame_id: c_int,
    shmem_ptr: *mut c_void,
    shmem_bytes: c_int,
) -> c_int {
    // SAFETY: called by the module with its own table and buffers.
    unsafe {
        let Some(ctx) = context(v) else {
            return FAILED;
        };
        let status = present_frame(ctx, drects, num_drects, data, left, top, width, height);
        frame_ack(v, flags, frame_id);
        if !shmem_ptr.is_null() && libc::munmap(shmem_ptr, shmem_bytes.max(0) as usize) != 0 {
            warn!("munmap of frame shared memory failed: {}", std::io::Error::last_os_error());
        }
        status
    }
}

/// Convert a module cursor and queue it for the window.
///
/// # Safety
/// `data` and `mask` must be null or cover `width * height` pixels at
/// `bpp` and `height` mask rows of `width` bits, each padded to a byte.
#[allow(clippy::too_many_arguments)]
unsafe fn post_cursor(
    v: *mut XupMod,
    hot_x: c_int,
    hot_y: c_int,
    width: u32,
    height: u32,
    data: *const c_char,
    mask: *const c_char,
    bpp: c_int,
) -> c_int {
    // SAFETY: caller contract.
    let Some(ctx) = (unsafe { context(v) }) else {
        return FAILED;
    };
    if data.is_null() || bpp < 0 {
        warn!("Cursor without image data ignored");
        return OK;
    }
    let bpp = bpp as u32;
    let bytes_pp = if bpp == 0 { 3 } else { bpp.div_ceil(8) as usize };
    let pixels = width as usize * height as usize;
    // SAFETY: caller contract.
    let data = unsafe { slice::from_raw_parts(data.cast::<u8>(), pixels * bytes_pp) };
    let mask: &[u8] = if mask.is_null() {
        &[]
    } else {
        // SAFETY: caller contract.
        unsafe { slice::from_raw_parts(mask.cast::<u8>(), (width as usize).div_ceil(8) * height as usize) }
    };

    match cursor::convert(hot_x.max(0) as u32, hot_y.max(0) as u32, width, height, data, mask, bpp) {
        Ok(image) => {
            ctx.render.post_cursor(image);
        }
        Err(e) => warn!("Cursor ignored: {}", e),
    }
    OK
}

unsafe extern "C" fn set_cursor(v: *mut XupMod, x: c_int, y: c_int, data: *mut c_char, mask: *mut c_char) -> c_int {
    // SAFETY: the module passes a 32x32 24 bpp cursor.
    unsafe { post_cursor(v, x, y, LEGACY_CURSOR_SIZE, LEGACY_CURSOR_SIZE, data, mask, 0) }
}

unsafe extern "C" fn set_cursor_ex(
    v: *mut XupMod,
    x: c_int,
    y: c_int,
    data: *mut c_char,
    mask: *mut c_char,
    bpp: c_int,
) -> c_int {
    // SAFETY: the module passes a 32x32 cursor at `bpp`.
    unsafe { post_cursor(v, x, y, LEGACY_CURSOR_SIZE, LEGACY_CURSOR_SIZE, data, mask, bpp) }
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn set_pointer_large(
    v: *mut XupMod,
    x: c_int,
    y: c_int,
    data: *mut c_char,
    mask: *mut c_char,
    bpp: c_int,
    width: c_int,
    height: c_int,
) -> c_int {
    if width <= 0 || height <= 0 {
        warn!("Large pointer {}x{} ignored", width, height);
        return OK;
    }
    // SAFETY: the module passes a `width`x`height` cursor at `bpp`.
    unsafe { post_cursor(v, x, y, width as u32, height as u32, data, mask, bpp) }
}

unsafe extern "C" fn dma_buf_notify(_v: *mut XupMod, state: c_int) -> c_int {
    info!("Accelerated buffer state from server: {}", state);
    OK
}

#[allow(clippy::too_many_arguments)]
unsafe extern "C" fn dma_buf_receive_pixmap_fd(
    v: *mut XupMod,
    fd: c_int,
    width: u32,
    height: u32,
    stride: u16,
    size: u32,
    format: u32,
) -> c_int {
    // SAFETY: called by the module with its own table.
    let Some(ctx) = (unsafe { context(v) }) else {
        return FAILED;
    };
    let handle = AccelBufferHandle {
        fd,
        width,
        height,
        stride: stride as u32,
        size,
        format,
    };
    debug!("Accelerated buffer offered: {:?}", handle);
    match ctx.render.run_blocking(move |state| state.enable_accel(handle)) {
        Some(true) => OK,
        Some(false) => FAILED,
        None => {
            debug!("Render loop gone, accelerated buffer ignored");
            FAILED
        }
    }
}

unsafe extern "C" fn dma_buf_deactivate(v: *mut XupMod) -> c_int {
    // SAFETY: called by the module with its own table.
    let Some(ctx) = (unsafe { context(v) }) else {
        return FAILED;
    };
    if ctx.render.run_blocking(|state| state.disable_accel()).is_none() {
        return OK;
    }
    // The CPU framebuffer went stale while the buffer was shown.
    let (width, height) = ctx.session_size;
    let message = ModuleMessage::invalidate(0, 0, width, height);
    // SAFETY: inside the module's own callback with the lock held.
    unsafe {
        if let Some(event) = (*v).mod_event {
            event(
                v,
                message.msg,
                message.param1 as Tbus,
                message.param2 as Tbus,
                message.param3 as Tbus,
                message.param4 as Tbus,
            );
        }
    }
    OK
}

unsafe extern "C" fn dma_buf_paint_pixmap(v: *mut XupMod) -> c_int {
    // SAFETY: called by the module with its own table.
    let Some(ctx) = (unsafe { context(v) }) else {
        return FAILED;
    };
    match ctx.render.run_blocking(|state| state.render_accel()) {
        Some(Ok(())) => OK,
        Some(Err(e)) => {
            warn!("Accelerated paint failed: {}", e);
            FAILED
        }
        None => FAILED,
    }
}

/// The complete server function table.
pub fn server_fns() -> ServerFns {
    ServerFns {
        begin_update: Some(begin_update),
        end_update: Some(end_update),
        fill_rect: Some(fill_rect),
        screen_blt: Some(screen_blt),
        paint_rect: Some(paint_rect),
        set_cursor: Some(set_cursor),
        palette: Some(palette),
        msg: Some(msg),
        is_term: Some(is_term),
        set_clip: Some(set_clip),
        reset_clip: Some(reset_clip),
        set_fgcolor: Some(set_fgcolor),
        set_bgcolor: Some(set_bgcolor),
        set_opcode: Some(set_opcode),
        set_mixmode: Some(set_mixmode),
        set_brush: Some(set_brush),
        set_pen: Some(set_pen),
        draw_line: Some(draw_line),
        add_char: Some(add_char),
        draw_text: Some(draw_text),
        client_monitor_resize: Some(client_monitor_resize),
        monitor_resize_done: Some(monitor_resize_done),
        get_channel_count: Some(get_channel_count),
        query_channel: Some(query_channel),
        get_channel_id: Some(get_channel_id),
        send_to_channel: Some(send_to_channel),
        bell_trigger: Some(bell_trigger),
        chansrv_in_use: Some(chansrv_in_use),
        create_os_surface: Some(create_os_surface),
        switch_os_surface: Some(switch_os_surface),
        delete_os_surface: Some(delete_os_surface),
        paint_rect_os: Some(paint_rect_os),
        set_hints: Some(set_hints),
        window_new_update: Some(window_new_update),
        window_delete: Some(window_delete),
        window_icon: Some(window_icon),
        window_cached_icon: Some(window_cached_icon),
        notify_new_update: Some(notify_new_update),
        notify_delete: Some(notify_delete),
        monitored_desktop: Some(monitored_desktop),
        set_cursor_ex: Some(set_cursor_ex),
        add_char_alpha: Some(add_char_alpha),
        create_os_surface_bpp: Some(create_os_surface_bpp),
        paint_rect_bpp: Some(paint_rect_bpp),
        composite: Some(composite),
        paint_rects: Some(paint_rects),
        session_info: Some(session_info),
        set_pointer_large: Some(set_pointer_large),
        paint_rects_ex: Some(paint_rects_ex),
        egfx_cmd: Some(egfx_cmd),
        dma_buf_notify: Some(dma_buf_notify),
        dma_buf_receive_pixmap_fd: Some(dma_buf_receive_pixmap_fd),
        dma_buf_deactivate: Some(dma_buf_deactivate),
        dma_buf_paint_pixmap: Some(dma_buf_paint_pixmap),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::render::RenderTask;
    use std::ffi::CString;
    use std::mem::MaybeUninit;
    use std::thread;

    /// A zeroed table with `ctx` installed, as the module would hold it.
    fn table(ctx: &CallbackContext) -> Box<XupMod> {
        // SAFETY: every field of XupMod is an integer, raw pointer or
        // nullable function pointer, so all-zero is valid.
        let mut module: Box<XupMod> = unsafe { Box::new(MaybeUninit::zeroed().assume_init()) };
        module.wm = ctx as *const CallbackContext as Tbus;
        module
    }

    fn context_pair(transfer: FrameTransfer) -> (CallbackContext, tokio::sync::mpsc::UnboundedReceiver<RenderTask>) {
        let (render, tasks) = RenderHandle::channel();
        (
            CallbackContext {
                render,
                transfer,
                session_size: (64, 64),
            },
            tasks,
        )
    }

    #[test]
    fn test_unsupported_callback_requests_exit() {
        let (ctx, mut tasks) = context_pair(FrameTransfer::Borrow);
        let mut module = table(&ctx);
        let fns = server_fns();
        // SAFETY: module is a valid table with our context installed.
        let rc = unsafe { (fns.fill_rect.unwrap())(&mut *module, 0, 0, 1, 1) };
        assert_eq!(rc, FAILED);
        assert!(matches!(tasks.try_recv(), Ok(RenderTask::Exit)));
    }

    #[test]
    fn test_msg_returns_length() {
        let text = CString::new("hello").unwrap();
        // SAFETY: valid C string; the table is not touched.
        let rc = unsafe { msg(std::ptr::null_mut(), text.as_ptr(), 0) };
        assert_eq!(rc, 5);
    }

    #[test]
    fn test_paint_rects_ex_waits_for_release() {
        let (ctx, mut tasks) = context_pair(FrameTransfer::Borrow);
        let pixels = vec![0x7fu8; 2 * 2 * 4];
        let rects: [c_short; 4] = [0, 0, 2, 2];

        thread::scope(|s| {
            let consumer = s.spawn(move || {
                let Some(RenderTask::Frame(frame)) = tasks.blocking_recv() else {
                    panic!("expected a frame");
                };
                let update = frame.update();
                assert_eq!((update.width, update.height), (2, 2));
                assert_eq!(update.rects, &[UpdateRect::new(0, 0, 2, 2)]);
                assert!(update.pixels.iter().all(|&b| b == 0x7f));
                frame.signal_released();
            });

            let mut module = table(&ctx);
            // SAFETY: buffers match the declared sizes and outlive the call.
            let rc = unsafe {
                paint_rects_ex(
                    &mut *module,
                    1,
                    rects.as_ptr() as *mut c_short,
                    0,
                    std::ptr::null_mut(),
                    pixels.as_ptr() as *mut c_char,
                    0,
                    0,
                    2,
                    2,
                    0,
                    1,
                    std::ptr::null_mut(),
                    0,
                )
            };
            assert_eq!(rc, OK);
            consumer.join().unwrap();
        });
    }

    #[test]
    fn test_cursor_is_queued_for_render_thread() {
        let (ctx, mut tasks) = context_pair(FrameTransfer::Copy);
        let mut module = table(&ctx);
        let data = vec![0u8; 32 * 32 * 3];
        let mask = vec![0u8; 32 * 32 / 8];
        // SAFETY: buffers cover a 32x32 24 bpp cursor.
        let rc = unsafe {
            set_cursor(
                &mut *module,
                3,
                4,
                data.as_ptr() as *mut c_char,
                mask.as_ptr() as *mut c_char,
            )
        };
        assert_eq!(rc, OK);
        let Ok(RenderTask::Cursor(image)) = tasks.try_recv() else {
            panic!("expected a cursor");
        };
        assert_eq!((image.width, image.height, image.hot_x, image.hot_y), (32, 32, 3, 4));
        assert!(image.pixels.iter().all(|&p| p == 0xFF00_0000));
    }

    #[test]
    fn test_accel_offer_after_exit_fails() {
        let (ctx, tasks) = context_pair(FrameTransfer::Borrow);
        drop(tasks);
        let mut module = table(&ctx);
        // SAFETY: valid table; the render loop is gone so nothing is imported.
        let rc = unsafe { dma_buf_receive_pixmap_fd(&mut *module, 5, 64, 64, 256, 16384, 0) };
        assert_eq!(rc, FAILED);
    }
}
