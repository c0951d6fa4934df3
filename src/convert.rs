//! Pixel-format conversion routines
//!
//! The device adapter selects one fill function at stream start, keyed by the
//! `(source fourcc, output format)` pair, and applies it on the producer
//! thread for every captured frame. A pair outside the supported set is a
//! fatal configuration error at start time.

use crate::buffer::{FourCc, PixelFormat};

/// Copies one captured image into an output buffer, converting formats.
///
/// `dst` is sized by [`PixelFormat::buffer_size`] and written tightly packed;
/// `src_stride` is the byte length of one source line, which may exceed the
/// packed width.
pub type FillFunction = fn(dst: &mut [u8], width: u32, height: u32, src: &[u8], src_stride: u32);

/// Select the fill function for a source/output format pair.
///
/// Returns `None` when the pair is not supported.
pub fn select_fill(src: FourCc, dst: PixelFormat) -> Option<FillFunction> {
    match (src, dst) {
        (FourCc::YUYV, PixelFormat::Rgba8888) => Some(fill_rgba_from_yuyv),
        (FourCc::YUYV, PixelFormat::YCbCr422I) => Some(fill_yuyv_from_yuyv),
        (FourCc::UYVY, PixelFormat::YCbCr422I) => Some(fill_yuyv_from_uyvy),
        (FourCc::YUYV, PixelFormat::YCrCb420Sp) => Some(fill_nv21_from_yuyv),
        (FourCc::NV21, PixelFormat::YCrCb420Sp) => Some(fill_nv21_from_nv21),
        _ => None,
    }
}

#[inline]
fn clamp_u8(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited-range YUV to RGB, integer arithmetic
#[inline]
fn yuv_to_rgb(y: i32, u: i32, v: i32) -> [u8; 3] {
    let c = y - 16;
    let d = u - 128;
    let e = v - 128;
    [
        clamp_u8((298 * c + 409 * e + 128) >> 8),
        clamp_u8((298 * c - 100 * d - 208 * e + 128) >> 8),
        clamp_u8((298 * c + 516 * d + 128) >> 8),
    ]
}

fn fill_rgba_from_yuyv(dst: &mut [u8], width: u32, height: u32, src: &[u8], src_stride: u32) {
    let width = width as usize;
    let dst_stride = width * 4;
    for row in 0..height as usize {
        let src_row = &src[row * src_stride as usize..];
        let dst_row = &mut dst[row * dst_stride..][..dst_stride];
        for pair in 0..width / 2 {
            let y0 = src_row[pair * 4] as i32;
            let u = src_row[pair * 4 + 1] as i32;
            let y1 = src_row[pair * 4 + 2] as i32;
            let v = src_row[pair * 4 + 3] as i32;

            let [r0, g0, b0] = yuv_to_rgb(y0, u, v);
            let [r1, g1, b1] = yuv_to_rgb(y1, u, v);
            let out = &mut dst_row[pair * 8..pair * 8 + 8];
            out.copy_from_slice(&[r0, g0, b0, 0xFF, r1, g1, b1, 0xFF]);
        }
    }
}

fn fill_yuyv_from_yuyv(dst: &mut [u8], width: u32, height: u32, src: &[u8], src_stride: u32) {
    let line = (width * 2) as usize;
    for row in 0..height as usize {
        let src_row = &src[row * src_stride as usize..][..line];
        dst[row * line..][..line].copy_from_slice(src_row);
    }
}

fn fill_yuyv_from_uyvy(dst: &mut [u8], width: u32, height: u32, src: &[u8], src_stride: u32) {
    let line = (width * 2) as usize;
    for row in 0..height as usize {
        let src_row = &src[row * src_stride as usize..][..line];
        let dst_row = &mut dst[row * line..][..line];
        // U Y0 V Y1 -> Y0 U Y1 V
        for group in 0..line / 4 {
            let s = &src_row[group * 4..group * 4 + 4];
            let d = &mut dst_row[group * 4..group * 4 + 4];
            d[0] = s[1];
            d[1] = s[0];
            d[2] = s[3];
            d[3] = s[2];
        }
    }
}

fn fill_nv21_from_yuyv(dst: &mut [u8], width: u32, height: u32, src: &[u8], src_stride: u32) {
    let width = width as usize;
    let height = height as usize;
    let (luma, chroma) = dst.split_at_mut(width * height);
    for row in 0..height {
        let src_row = &src[row * src_stride as usize..][..width * 2];
        let luma_row = &mut luma[row * width..][..width];
        for col in 0..width {
            luma_row[col] = src_row[col * 2];
        }
        // Chroma is vertically subsampled from the even rows
        if row % 2 == 0 {
            let chroma_row = &mut chroma[(row / 2) * width..][..width];
            for pair in 0..width / 2 {
                chroma_row[pair * 2] = src_row[pair * 4 + 3]; // V
                chroma_row[pair * 2 + 1] = src_row[pair * 4 + 1]; // U
            }
        }
    }
}

fn fill_nv21_from_nv21(dst: &mut [u8], width: u32, height: u32, src: &[u8], src_stride: u32) {
    let width = width as usize;
    let height = height as usize;
    let stride = src_stride as usize;
    let (luma, chroma) = dst.split_at_mut(width * height);
    for row in 0..height {
        luma[row * width..][..width].copy_from_slice(&src[row * stride..][..width]);
    }
    let src_chroma = &src[height * stride..];
    for row in 0..height / 2 {
        chroma[row * width..][..width].copy_from_slice(&src_chroma[row * stride..][..width]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_pairs() {
        assert!(select_fill(FourCc::YUYV, PixelFormat::Rgba8888).is_some());
        assert!(select_fill(FourCc::YUYV, PixelFormat::YCbCr422I).is_some());
        assert!(select_fill(FourCc::UYVY, PixelFormat::YCbCr422I).is_some());
        assert!(select_fill(FourCc::YUYV, PixelFormat::YCrCb420Sp).is_some());
        assert!(select_fill(FourCc::NV21, PixelFormat::YCrCb420Sp).is_some());
    }

    #[test]
    fn test_unsupported_pairs() {
        assert!(select_fill(FourCc::UYVY, PixelFormat::Rgba8888).is_none());
        assert!(select_fill(FourCc::NV21, PixelFormat::Rgba8888).is_none());
        assert!(select_fill(FourCc::NV21, PixelFormat::YCbCr422I).is_none());
        assert!(select_fill(FourCc(*b"MJPG"), PixelFormat::Rgba8888).is_none());
    }

    #[test]
    fn test_yuyv_passthrough_honors_stride() {
        // 2x2 image, source has 2 bytes of per-line padding
        let src = [
            1, 2, 3, 4, 0xAA, 0xAA, //
            5, 6, 7, 8, 0xAA, 0xAA,
        ];
        let mut dst = [0u8; 8];
        fill_yuyv_from_yuyv(&mut dst, 2, 2, &src, 6);
        assert_eq!(dst, [1, 2, 3, 4, 5, 6, 7, 8]);
    }

    #[test]
    fn test_uyvy_swizzle() {
        let src = [b'U', b'0', b'V', b'1'];
        let mut dst = [0u8; 4];
        fill_yuyv_from_uyvy(&mut dst, 2, 1, &src, 4);
        assert_eq!(dst, [b'0', b'U', b'1', b'V']);
    }

    #[test]
    fn test_yuyv_to_rgba_grey_point() {
        // Y=128 with neutral chroma should land near mid grey, opaque alpha
        let src = [128, 128, 128, 128];
        let mut dst = [0u8; 8];
        fill_rgba_from_yuyv(&mut dst, 2, 1, &src, 4);
        assert_eq!(dst[3], 0xFF);
        assert_eq!(dst[7], 0xFF);
        for channel in [dst[0], dst[1], dst[2]] {
            assert!((120..=140).contains(&channel), "channel = {channel}");
        }
    }

    #[test]
    fn test_yuyv_to_nv21_plane_layout() {
        // 2x2 YUYV frame: distinct luma per pixel, chroma U=10 V=20 per row
        let src = [
            1, 10, 2, 20, //
            3, 11, 4, 21,
        ];
        let mut dst = [0u8; 6];
        fill_nv21_from_yuyv(&mut dst, 2, 2, &src, 4);
        // Luma plane in raster order, then V/U interleaved from row 0
        assert_eq!(&dst[..4], &[1, 2, 3, 4]);
        assert_eq!(&dst[4..], &[20, 10]);
    }
}
