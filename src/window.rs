//! The local output window.
//!
//! One undecorated, fixed-size window at the origin covering every
//! monitor. It is the CPU path's [`Surface`] (frames go out with
//! `PutImage`), the EGL path's native window, and owns the pointer image.

use anyhow::{Context, Result, anyhow};
use std::sync::Arc;
use tracing::{debug, info, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::properties::{WmSizeHints, WmSizeHintsSpecification};
use x11rb::protocol::render::{self, ConnectionExt as _};
use x11rb::protocol::xproto::*;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;
use xrdp_local_core::SinkError;
use xrdp_local_core::cursor::CursorImage;
use xrdp_local_core::sink::{Framebuffer, Region, Surface};

const WINDOW_TITLE: &[u8] = b"xrdp-local";

/// PutImage request header size in bytes.
const PUT_IMAGE_HEADER: usize = 24;

/// _MOTIF_WM_HINTS flag: the decorations field is valid.
const MWM_HINTS_DECORATIONS: u32 = 1 << 1;

/// Atoms the window needs
#[derive(Debug, Clone, Copy)]
pub struct WindowAtoms {
    pub wm_protocols: Atom,
    pub wm_delete_window: Atom,
    pub motif_wm_hints: Atom,
    pub net_wm_name: Atom,
    pub utf8_string: Atom,
}

impl WindowAtoms {
    fn intern(conn: &RustConnection) -> Result<Self> {
        let atom = |name: &str| -> Result<Atom> {
            Ok(conn
                .intern_atom(false, name.as_bytes())?
                .reply()
                .with_context(|| format!("Failed to intern {}", name))?
                .atom)
        };
        Ok(Self {
            wm_protocols: atom("WM_PROTOCOLS")?,
            wm_delete_window: atom("WM_DELETE_WINDOW")?,
            motif_wm_hints: atom("_MOTIF_WM_HINTS")?,
            net_wm_name: atom("_NET_WM_NAME")?,
            utf8_string: atom("UTF8_STRING")?,
        })
    }
}

pub struct XWindow {
    conn: Arc<RustConnection>,
    window: Window,
    gc: Gcontext,
    depth: u8,
    atoms: WindowAtoms,
    /// Render ARGB32 picture format, looked up on first cursor
    argb_format: Option<render::Pictformat>,
    cursor: Option<Cursor>,
}

impl XWindow {
    pub fn create(conn: Arc<RustConnection>, screen: &Screen, width: u32, height: u32) -> Result<Self> {
        let atoms = WindowAtoms::intern(&conn)?;
        let window = conn.generate_id()?;
        let (w, h) = (to_u16(width)?, to_u16(height)?);

        let events = EventMask::EXPOSURE
            | EventMask::KEY_PRESS
            | EventMask::KEY_RELEASE
            | EventMask::BUTTON_PRESS
            | EventMask::BUTTON_RELEASE
            | EventMask::POINTER_MOTION
            | EventMask::STRUCTURE_NOTIFY;

        conn.create_window(
            x11rb::COPY_DEPTH_FROM_PARENT,
            window,
            screen.root,
            0,
            0,
            w,
            h,
            0,
            WindowClass::INPUT_OUTPUT,
            x11rb::COPY_FROM_PARENT,
            &CreateWindowAux::new()
                .background_pixel(screen.black_pixel)
                .event_mask(events),
        )
        .context("Failed to create window")?;

        conn.change_property8(PropMode::REPLACE, window, AtomEnum::WM_NAME, AtomEnum::STRING, WINDOW_TITLE)?;
        conn.change_property8(PropMode::REPLACE, window, atoms.net_wm_name, atoms.utf8_string, WINDOW_TITLE)?;
        conn.change_property32(
            PropMode::REPLACE,
            window,
            atoms.wm_protocols,
            AtomEnum::ATOM,
            &[atoms.wm_delete_window],
        )?;

        // No decorations, so the window manager leaves geometry alone.
        conn.change_property32(
            PropMode::REPLACE,
            window,
            atoms.motif_wm_hints,
            atoms.motif_wm_hints,
            &[MWM_HINTS_DECORATIONS, 0, 0, 0, 0],
        )?;

        let mut hints = WmSizeHints::new();
        hints.position = Some((WmSizeHintsSpecification::UserSpecified, 0, 0));
        hints.size = Some((WmSizeHintsSpecification::UserSpecified, width as i32, height as i32));
        hints.min_size = Some((width as i32, height as i32));
        hints.max_size = Some((width as i32, height as i32));
        hints.set_normal_hints(conn.as_ref(), window)?;

        let gc = conn.generate_id()?;
        conn.create_gc(gc, window, &CreateGCAux::new().graphics_exposures(0))?;

        conn.map_window(window)?;
        conn.configure_window(window, &ConfigureWindowAux::new().x(0).y(0))?;
        conn.flush()?;

        info!("Created {}x{} window 0x{:x}", width, height, window);
        Ok(Self {
            conn,
            window,
            gc,
            depth: screen.root_depth,
            atoms,
            argb_format: None,
            cursor: None,
        })
    }

    pub fn id(&self) -> Window {
        self.window
    }

    pub fn atoms(&self) -> &WindowAtoms {
        &self.atoms
    }

    /// Replace the pointer image shown over the window.
    pub fn set_cursor(&mut self, image: &CursorImage) -> Result<()> {
        let format = match self.argb_format {
            Some(f) => f,
            None => {
                let f = find_argb32_format(&self.conn)?;
                self.argb_format = Some(f);
                f
            }
        };
        let conn = &self.conn;
        let (w, h) = (to_u16(image.width)?, to_u16(image.height)?);

        let pixmap = conn.generate_id()?;
        conn.create_pixmap(32, pixmap, self.window, w, h)?;
        let gc = conn.generate_id()?;
        conn.create_gc(gc, pixmap, &CreateGCAux::new())?;
        conn.put_image(ImageFormat::Z_PIXMAP, pixmap, gc, w, h, 0, 0, 0, 32, &image.to_bytes())?;

        let picture = conn.generate_id()?;
        conn.render_create_picture(picture, pixmap, format, &render::CreatePictureAux::new())?;
        let cursor = conn.generate_id()?;
        conn.render_create_cursor(cursor, picture, image.hot_x as u16, image.hot_y as u16)?;
        conn.change_window_attributes(self.window, &ChangeWindowAttributesAux::new().cursor(cursor))?;

        conn.render_free_picture(picture)?;
        conn.free_gc(gc)?;
        conn.free_pixmap(pixmap)?;
        if let Some(old) = self.cursor.replace(cursor) {
            conn.free_cursor(old)?;
        }
        conn.flush()?;
        debug!("Cursor {}x{} hot {},{}", image.width, image.height, image.hot_x, image.hot_y);
        Ok(())
    }

    fn put_region(&self, framebuffer: &Framebuffer, region: Region) -> Result<()> {
        let row_bytes = region.width as usize * 4;
        let budget = self.conn.maximum_request_bytes().saturating_sub(PUT_IMAGE_HEADER);
        let rows_per_chunk = (budget / row_bytes.max(1)).max(1) as u32;
        let w = to_u16(region.width)?;

        let mut data = Vec::with_capacity(row_bytes * rows_per_chunk.min(region.height) as usize);
        let mut y = 0;
        while y < region.height {
            let rows = rows_per_chunk.min(region.height - y);
            data.clear();
            for row in 0..rows {
                let span = framebuffer
                    .span(&region, (region.y as u32) + y + row)
                    .ok_or_else(|| anyhow!("row {} outside framebuffer", region.y as u32 + y + row))?;
                data.extend_from_slice(span);
            }
            self.conn.put_image(
                ImageFormat::Z_PIXMAP,
                self.window,
                self.gc,
                w,
                rows as u16,
                region.x as i16,
                (region.y as u32 + y) as i16,
                0,
                self.depth,
                &data,
            )?;
            y += rows;
        }
        self.conn.flush()?;
        Ok(())
    }
}

impl Surface for XWindow {
    fn present(&mut self, framebuffer: &Framebuffer, region: Region) -> Result<(), SinkError> {
        self.put_region(framebuffer, region)
            .map_err(|e| SinkError::Present(format!("{:#}", e)))
    }
}

impl Drop for XWindow {
    fn drop(&mut self) {
        let result = (|| -> Result<()> {
            if let Some(cursor) = self.cursor.take() {
                self.conn.free_cursor(cursor)?;
            }
            self.conn.free_gc(self.gc)?;
            self.conn.destroy_window(self.window)?;
            self.conn.flush()?;
            Ok(())
        })();
        if let Err(e) = result {
            warn!("Window teardown failed: {:#}", e);
        }
    }
}

fn to_u16(v: u32) -> Result<u16> {
    u16::try_from(v).map_err(|_| anyhow!("{} exceeds the X11 size limit", v))
}

fn find_argb32_format(conn: &RustConnection) -> Result<render::Pictformat> {
    let formats = conn
        .render_query_pict_formats()
        .context("RenderQueryPictFormats request")?
        .reply()
        .context("RenderQueryPictFormats reply")?;
    formats
        .formats
        .iter()
        .find(|f| {
            f.type_ == render::PictType::DIRECT
                && f.depth == 32
                && f.direct.alpha_shift == 24
                && f.direct.alpha_mask == 0xff
                && f.direct.red_shift == 16
                && f.direct.green_shift == 8
                && f.direct.blue_shift == 0
        })
        .map(|f| f.id)
        .ok_or_else(|| anyhow!("No ARGB32 picture format"))
}
