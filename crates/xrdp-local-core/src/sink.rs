//! CPU framebuffer and the repaint path onto a visible surface.

use tracing::{debug, warn};

use crate::error::SinkError;
use crate::frame::{FrameUpdate, BYTES_PER_PIXEL};

/// Axis-aligned rectangle in framebuffer coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Region {
    pub x: i32,
    pub y: i32,
    pub width: u32,
    pub height: u32,
}

impl Region {
    pub fn new(x: i32, y: i32, width: u32, height: u32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    fn right(&self) -> i64 {
        self.x as i64 + self.width as i64
    }

    fn bottom(&self) -> i64 {
        self.y as i64 + self.height as i64
    }

    /// Overlap of two regions, `None` when they do not touch.
    pub fn intersect(&self, other: &Region) -> Option<Region> {
        let x0 = (self.x as i64).max(other.x as i64);
        let y0 = (self.y as i64).max(other.y as i64);
        let x1 = self.right().min(other.right());
        let y1 = self.bottom().min(other.bottom());
        if x1 <= x0 || y1 <= y0 {
            return None;
        }
        Some(Region {
            x: x0 as i32,
            y: y0 as i32,
            width: (x1 - x0) as u32,
            height: (y1 - y0) as u32,
        })
    }
}

/// Composited desktop image, 32-bit BGRX, row-major, stride `width * 4`.
#[derive(Debug, Clone)]
pub struct Framebuffer {
    width: u32,
    height: u32,
    data: Vec<u8>,
}

impl Framebuffer {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            data: vec![0; width as usize * height as usize * BYTES_PER_PIXEL],
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn stride(&self) -> usize {
        self.width as usize * BYTES_PER_PIXEL
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn bounds(&self) -> Region {
        Region::new(0, 0, self.width, self.height)
    }

    /// Pixel at (x, y) as a native u32 (0xXXRRGGBB).
    pub fn pixel(&self, x: u32, y: u32) -> Option<u32> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let off = y as usize * self.stride() + x as usize * BYTES_PER_PIXEL;
        let b = &self.data[off..off + BYTES_PER_PIXEL];
        Some(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    /// Bytes of `region` on row `y`, or `None` outside the buffer.
    pub fn span(&self, region: &Region, y: u32) -> Option<&[u8]> {
        let clipped = region.intersect(&self.bounds())?;
        let y = y as i64;
        if y < clipped.y as i64 || y >= clipped.bottom() {
            return None;
        }
        let start = y as usize * self.stride() + clipped.x as usize * BYTES_PER_PIXEL;
        Some(&self.data[start..start + clipped.width as usize * BYTES_PER_PIXEL])
    }

    /// Copy `dst` (already inside bounds) from `src` at (`src_x`, `src_y`).
    fn blit(&mut self, dst: Region, src: &[u8], src_stride: usize, src_x: usize, src_y: usize) {
        let row_bytes = dst.width as usize * BYTES_PER_PIXEL;
        let stride = self.stride();
        for row in 0..dst.height as usize {
            let s = (src_y + row) * src_stride + src_x * BYTES_PER_PIXEL;
            let d = (dst.y as usize + row) * stride + dst.x as usize * BYTES_PER_PIXEL;
            self.data[d..d + row_bytes].copy_from_slice(&src[s..s + row_bytes]);
        }
    }
}

/// The visible output the framebuffer is painted onto.
pub trait Surface {
    /// Show `region` of `framebuffer` at the same coordinates.
    fn present(&mut self, framebuffer: &Framebuffer, region: Region) -> Result<(), SinkError>;
}

/// Receives frame updates, keeps the framebuffer and repaints the surface.
///
/// Painting can be switched off while the accelerated path owns the
/// surface; the framebuffer keeps accepting updates either way.
pub struct DisplaySink<S> {
    framebuffer: Framebuffer,
    surface: S,
    paint_enabled: bool,
}

impl<S: Surface> DisplaySink<S> {
    pub fn new(width: u32, height: u32, surface: S) -> Self {
        Self {
            framebuffer: Framebuffer::new(width, height),
            surface,
            paint_enabled: true,
        }
    }

    pub fn framebuffer(&self) -> &Framebuffer {
        &self.framebuffer
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn paint_enabled(&self) -> bool {
        self.paint_enabled
    }

    /// Copy every rect of `update` into the framebuffer, then repaint the
    /// damaged area if painting is on.
    ///
    /// All rects are checked against the source buffer before any pixel is
    /// touched. Destinations are clipped to the framebuffer.
    pub fn apply_update(&mut self, update: &FrameUpdate<'_>) -> Result<(), SinkError> {
        for r in update.rects {
            if r.x < 0 || r.y < 0 || r.w < 0 || r.h < 0 {
                return Err(SinkError::InvalidRect {
                    x: r.x,
                    y: r.y,
                    w: r.w,
                    h: r.h,
                });
            }
            if r.x as u32 + r.w as u32 > update.width || r.y as u32 + r.h as u32 > update.height {
                return Err(SinkError::RectOutOfBounds {
                    x: r.x,
                    y: r.y,
                    w: r.w,
                    h: r.h,
                    width: update.width,
                    height: update.height,
                });
            }
        }

        let bounds = self.framebuffer.bounds();
        let mut damage = Vec::with_capacity(update.rects.len());
        for r in update.rects {
            let target = Region::new(
                update.left + r.x as i32,
                update.top + r.y as i32,
                r.w as u32,
                r.h as u32,
            );
            let Some(dst) = target.intersect(&bounds) else {
                continue;
            };
            let src_x = r.x as usize + (dst.x - target.x) as usize;
            let src_y = r.y as usize + (dst.y - target.y) as usize;
            self.framebuffer
                .blit(dst, update.pixels, update.stride(), src_x, src_y);
            damage.push(dst);
        }

        for region in damage {
            self.paint(region)?;
        }
        Ok(())
    }

    /// Repaint `region` (clipped) from the framebuffer. No-op while painting
    /// is disabled.
    pub fn paint(&mut self, region: Region) -> Result<(), SinkError> {
        if !self.paint_enabled {
            return Ok(());
        }
        let Some(clipped) = region.intersect(&self.framebuffer.bounds()) else {
            return Ok(());
        };
        self.surface.present(&self.framebuffer, clipped)
    }

    /// Turn CPU painting on or off. Turning it back on repaints the whole
    /// surface so nothing drawn by the other path stays on screen.
    pub fn set_paint_enabled(&mut self, enabled: bool) {
        if self.paint_enabled == enabled {
            return;
        }
        debug!("CPU painting {}", if enabled { "enabled" } else { "disabled" });
        self.paint_enabled = enabled;
        if enabled {
            let full = self.framebuffer.bounds();
            if let Err(e) = self.paint(full) {
                warn!("Full repaint failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::frame::UpdateRect;

    /// Surface that records every presented region.
    #[derive(Default)]
    pub(crate) struct RecordingSurface {
        pub presented: Vec<Region>,
    }

    impl Surface for RecordingSurface {
        fn present(&mut self, _: &Framebuffer, region: Region) -> Result<(), SinkError> {
            self.presented.push(region);
            Ok(())
        }
    }

    fn solid(width: u32, height: u32, pixel: u32) -> Vec<u8> {
        (0..width * height).flat_map(|_| pixel.to_le_bytes()).collect()
    }

    #[test]
    fn test_update_lands_at_offset() {
        let mut sink = DisplaySink::new(8, 8, RecordingSurface::default());
        let pixels = solid(4, 4, 0xFF00FF00);
        let rects = [UpdateRect::new(0, 0, 4, 4)];
        let update = FrameUpdate::new(2, 2, 4, 4, &rects, &pixels).unwrap();

        sink.apply_update(&update).unwrap();

        let fb = sink.framebuffer();
        for y in 0..8 {
            for x in 0..8 {
                let inside = (2..6).contains(&x) && (2..6).contains(&y);
                let want = if inside { 0xFF00FF00 } else { 0 };
                assert_eq!(fb.pixel(x, y), Some(want), "pixel {},{}", x, y);
            }
        }
        assert_eq!(sink.surface().presented, vec![Region::new(2, 2, 4, 4)]);
    }

    #[test]
    fn test_sub_rect_reads_matching_source_pixels() {
        let mut sink = DisplaySink::new(4, 4, RecordingSurface::default());
        let pixels: Vec<u8> = (0u32..16).flat_map(|i| i.to_le_bytes()).collect();
        let rects = [UpdateRect::new(1, 2, 2, 1)];
        let update = FrameUpdate::new(0, 0, 4, 4, &rects, &pixels).unwrap();

        sink.apply_update(&update).unwrap();

        assert_eq!(sink.framebuffer().pixel(1, 2), Some(9));
        assert_eq!(sink.framebuffer().pixel(2, 2), Some(10));
        assert_eq!(sink.framebuffer().pixel(0, 2), Some(0));
        assert_eq!(sink.framebuffer().pixel(3, 2), Some(0));
    }

    #[test]
    fn test_destination_is_clipped_to_framebuffer() {
        let mut sink = DisplaySink::new(4, 4, RecordingSurface::default());
        let pixels = solid(4, 4, 7);
        let rects = [UpdateRect::new(0, 0, 4, 4)];
        let update = FrameUpdate::new(2, -1, 4, 4, &rects, &pixels).unwrap();

        sink.apply_update(&update).unwrap();

        assert_eq!(sink.framebuffer().pixel(2, 0), Some(7));
        assert_eq!(sink.framebuffer().pixel(3, 2), Some(7));
        assert_eq!(sink.framebuffer().pixel(1, 0), Some(0));
        assert_eq!(sink.framebuffer().pixel(3, 3), Some(0));
        assert_eq!(sink.surface().presented, vec![Region::new(2, 0, 2, 3)]);
    }

    #[test]
    fn test_rect_outside_source_is_rejected_before_copy() {
        let mut sink = DisplaySink::new(4, 4, RecordingSurface::default());
        let pixels = solid(2, 2, 1);
        let rects = [UpdateRect::new(0, 0, 1, 1), UpdateRect::new(1, 1, 2, 2)];
        let update = FrameUpdate::new(0, 0, 2, 2, &rects, &pixels).unwrap();

        let err = sink.apply_update(&update).unwrap_err();
        assert!(matches!(err, SinkError::RectOutOfBounds { .. }));
        assert_eq!(sink.framebuffer().pixel(0, 0), Some(0));
        assert!(sink.surface().presented.is_empty());
    }

    #[test]
    fn test_negative_extent_is_rejected() {
        let mut sink = DisplaySink::new(4, 4, RecordingSurface::default());
        let pixels = solid(2, 2, 1);
        let rects = [UpdateRect::new(0, 0, -1, 1)];
        let update = FrameUpdate::new(0, 0, 2, 2, &rects, &pixels).unwrap();
        assert!(matches!(
            sink.apply_update(&update),
            Err(SinkError::InvalidRect { .. })
        ));
    }

    #[test]
    fn test_disabled_paint_still_updates_framebuffer() {
        let mut sink = DisplaySink::new(4, 4, RecordingSurface::default());
        sink.set_paint_enabled(false);
        let pixels = solid(1, 1, 3);
        let rects = [UpdateRect::new(0, 0, 1, 1)];
        let update = FrameUpdate::new(0, 0, 1, 1, &rects, &pixels).unwrap();

        sink.apply_update(&update).unwrap();
        assert_eq!(sink.framebuffer().pixel(0, 0), Some(3));
        assert!(sink.surface().presented.is_empty());

        sink.set_paint_enabled(true);
        assert_eq!(sink.surface().presented, vec![Region::new(0, 0, 4, 4)]);
    }

    #[test]
    fn test_paint_is_clipped_and_repeatable() {
        let mut sink = DisplaySink::new(4, 4, RecordingSurface::default());
        sink.paint(Region::new(-2, 1, 10, 1)).unwrap();
        sink.paint(Region::new(-2, 1, 10, 1)).unwrap();
        sink.paint(Region::new(10, 10, 1, 1)).unwrap();
        assert_eq!(
            sink.surface().presented,
            vec![Region::new(0, 1, 4, 1), Region::new(0, 1, 4, 1)]
        );
    }

    #[test]
    fn test_span_returns_clipped_row() {
        let fb = Framebuffer::new(4, 2);
        assert_eq!(fb.span(&Region::new(1, 0, 8, 2), 1).map(<[u8]>::len), Some(12));
        assert!(fb.span(&Region::new(0, 0, 4, 1), 1).is_none());
    }
}
