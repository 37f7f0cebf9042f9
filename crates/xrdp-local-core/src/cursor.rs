//! Pointer image conversion.
//!
//! The module sends cursors either as 32-bit ARGB or in the legacy
//! packed-color + 1-bit AND mask form, both bottom-up. Everything is
//! converted to a top-down ARGB32 image.

use crate::error::CursorError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CursorImage {
    pub width: u32,
    pub height: u32,
    pub hot_x: u32,
    pub hot_y: u32,
    /// ARGB32, row-major, top row first.
    pub pixels: Vec<u32>,
}

impl CursorImage {
    /// Pixels as little-endian bytes (the layout of an X ARGB32 image on
    /// little-endian servers).
    pub fn to_bytes(&self) -> Vec<u8> {
        self.pixels.iter().flat_map(|p| p.to_le_bytes()).collect()
    }
}

/// Convert a module cursor of depth `bpp`. `mask` is ignored for 32 bpp.
pub fn convert(
    hot_x: u32,
    hot_y: u32,
    width: u32,
    height: u32,
    data: &[u8],
    mask: &[u8],
    bpp: u32,
) -> Result<CursorImage, CursorError> {
    if width == 0 || height == 0 {
        return Err(CursorError::Empty(width, height));
    }
    match bpp {
        32 => from_argb32(hot_x, hot_y, width, height, data),
        0 | 15 | 16 | 24 => from_legacy(hot_x, hot_y, width, height, data, mask, bpp),
        other => Err(CursorError::UnsupportedDepth(other)),
    }
}

fn need(what: &'static str, buf: &[u8], expected: usize) -> Result<(), CursorError> {
    if buf.len() < expected {
        return Err(CursorError::ShortData {
            what,
            expected,
            actual: buf.len(),
        });
    }
    Ok(())
}

fn from_argb32(
    hot_x: u32,
    hot_y: u32,
    width: u32,
    height: u32,
    data: &[u8],
) -> Result<CursorImage, CursorError> {
    let (w, h) = (width as usize, height as usize);
    need("data", data, w * h * 4)?;

    let mut pixels = vec![0u32; w * h];
    for y in 0..h {
        let src = &data[y * w * 4..(y + 1) * w * 4];
        let dst = &mut pixels[(h - 1 - y) * w..(h - y) * w];
        for (d, s) in dst.iter_mut().zip(src.chunks_exact(4)) {
            *d = u32::from_le_bytes([s[0], s[1], s[2], s[3]]);
        }
    }
    Ok(CursorImage {
        width,
        height,
        hot_x,
        hot_y,
        pixels,
    })
}

/// Depth 0 means 24-bit color.
fn from_legacy(
    hot_x: u32,
    hot_y: u32,
    width: u32,
    height: u32,
    data: &[u8],
    mask: &[u8],
    bpp: u32,
) -> Result<CursorImage, CursorError> {
    let bpp = if bpp == 0 { 24 } else { bpp };
    let bytes_pp = bpp.div_ceil(8) as usize;
    let color_mask = u32::MAX >> (32 - bpp);
    let (w, h) = (width as usize, height as usize);
    need("data", data, w * h * bytes_pp)?;
    // Mask rows start on a byte boundary, MSB is the leftmost pixel.
    let mask_stride = w.div_ceil(8);
    need("mask", mask, mask_stride * h)?;

    let mut pixels = vec![0u32; w * h];
    for y in 0..h {
        for x in 0..w {
            if mask[y * mask_stride + x / 8] & (0x80 >> (x % 8)) != 0 {
                continue;
            }
            let off = (y * w + x) * bytes_pp;
            let mut raw = [0u8; 4];
            let end = (off + 4).min(data.len());
            raw[..end - off].copy_from_slice(&data[off..end]);
            pixels[(h - 1 - y) * w + x] = 0xFF00_0000 | (u32::from_le_bytes(raw) & color_mask);
        }
    }
    Ok(CursorImage {
        width,
        height,
        hot_x,
        hot_y,
        pixels,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_argb32_is_flipped_vertically() {
        let rows: [u32; 2] = [0x11111111, 0x22222222];
        let data: Vec<u8> = rows.iter().flat_map(|p| p.to_le_bytes()).collect();
        let img = convert(0, 0, 1, 2, &data, &[], 32).unwrap();
        assert_eq!(img.pixels, vec![0x22222222, 0x11111111]);
    }

    #[test]
    fn test_legacy_24bpp_applies_and_mask() {
        // 2x1: first pixel opaque red, second masked out.
        let data = [0x00, 0x00, 0xFF, 0x00, 0xFF, 0x00];
        let mask = [0b0100_0000];
        let img = convert(1, 0, 2, 1, &data, &mask, 24).unwrap();
        assert_eq!(img.pixels, vec![0xFFFF_0000, 0]);
        assert_eq!((img.hot_x, img.hot_y), (1, 0));
    }

    #[test]
    fn test_legacy_2x2_unmasked_is_opaque_and_flipped() {
        let data = [
            0x01, 0x02, 0x03, 0x04, 0x05, 0x06, // row 0
            0x07, 0x08, 0x09, 0x0A, 0x0B, 0x0C, // row 1
        ];
        let img = convert(0, 0, 2, 2, &data, &[0, 0], 24).unwrap();
        assert_eq!((img.width, img.height), (2, 2));
        assert!(img.pixels.iter().all(|p| p >> 24 == 0xFF));
        assert_eq!(img.pixels, vec![0xFF09_0807, 0xFF0C_0B0A, 0xFF03_0201, 0xFF06_0504]);
    }

    #[test]
    fn test_legacy_mask_rows_are_byte_aligned() {
        // 3x2: each mask row has its own byte. Row 0 hides x=2, row 1 hides x=0.
        let data = [0x10; 3 * 2 * 3];
        let mask = [0b0010_0000, 0b1000_0000];
        let img = convert(0, 0, 3, 2, &data, &mask, 24).unwrap();
        let opaque = 0xFF10_1010;
        // Output row 0 is input row 1.
        assert_eq!(img.pixels, vec![0, opaque, opaque, opaque, opaque, 0]);
    }

    #[test]
    fn test_legacy_zero_depth_means_24() {
        let data = [0xAA, 0xBB, 0xCC];
        let img = convert(0, 0, 1, 1, &data, &[0], 0).unwrap();
        assert_eq!(img.pixels, vec![0xFFCC_BBAA]);
    }

    #[test]
    fn test_legacy_16bpp_masks_high_bits_and_flips() {
        // 1x2, bottom-up: row 0 is the bottom row.
        let data = [0x34, 0x12, 0x78, 0x56];
        let img = convert(0, 0, 1, 2, &data, &[0, 0], 16).unwrap();
        assert_eq!(img.pixels, vec![0xFF00_5678, 0xFF00_1234]);
    }

    #[test]
    fn test_rejects_bad_input() {
        assert!(matches!(
            convert(0, 0, 2, 2, &[0; 8], &[0], 8),
            Err(CursorError::UnsupportedDepth(8))
        ));
        assert!(matches!(
            convert(0, 0, 2, 2, &[0; 8], &[0], 32),
            Err(CursorError::ShortData { what: "data", .. })
        ));
        assert!(matches!(
            convert(0, 0, 4, 4, &[0; 48], &[], 24),
            Err(CursorError::ShortData { what: "mask", .. })
        ));
        assert!(matches!(
            convert(0, 0, 0, 4, &[], &[], 24),
            Err(CursorError::Empty(0, 4))
        ));
    }

    #[test]
    fn test_to_bytes_is_little_endian() {
        let img = CursorImage {
            width: 1,
            height: 1,
            hot_x: 0,
            hot_y: 0,
            pixels: vec![0xFF00_00FF],
        };
        assert_eq!(img.to_bytes(), vec![0xFF, 0x00, 0x00, 0xFF]);
    }
}
