//! Conversion-registry property tests
//!
//! The RGB24 conversion must be a pure function of (source bytes, size,
//! format, stride), ignore row padding, and honor the documented byte
//! order of every recognized wire format.

use kmsnap_core::formats::{self, fourcc, RgbRaster};

fn convert(src: &[u8], w: u32, h: u32, format: u32, stride: usize) -> RgbRaster {
    let mut dst = RgbRaster::new(w, h);
    formats::convert_to_rgb24(src, &mut dst, format, stride);
    dst
}

#[test]
fn conversion_is_pure() {
    let src: Vec<u8> = (0..4 * 4 * 4).map(|i| (i * 7 % 251) as u8).collect();
    let a = convert(&src, 4, 4, fourcc::XRGB8888, 16);
    let b = convert(&src, 4, 4, fourcc::XRGB8888, 16);
    assert_eq!(a, b);
    assert_eq!(a.data.len(), 4 * 4 * 3);
}

#[test]
fn conversion_ignores_row_padding() {
    // Same pixels, two strides; the padding bytes differ wildly
    let w = 3u32;
    let h = 2u32;
    let pixel_bytes = 4;
    let tight_stride = w as usize * pixel_bytes;
    let padded_stride = tight_stride + 12;

    let mut tight = Vec::new();
    let mut padded = Vec::new();
    for y in 0..h {
        for x in 0..w {
            let px = (0xff000000u32 | (x * 40) << 16 | (y * 90) << 8 | 0x11).to_le_bytes();
            tight.extend_from_slice(&px);
            padded.extend_from_slice(&px);
        }
        padded.extend(std::iter::repeat(0xEE).take(padded_stride - tight_stride));
    }

    let a = convert(&tight, w, h, fourcc::ARGB8888, tight_stride);
    let b = convert(&padded, w, h, fourcc::ARGB8888, padded_stride);
    assert_eq!(a, b);
}

#[test]
fn argb_vs_abgr_byte_order() {
    // The same numeric pixel 0x00RRGGBB reads as (RR, GG, BB) in ARGB
    // and as (BB, GG, RR) in ABGR
    let px = 0x00AABBCCu32.to_le_bytes();
    let as_argb = convert(&px, 1, 1, fourcc::ARGB8888, 4);
    let as_abgr = convert(&px, 1, 1, fourcc::ABGR8888, 4);
    assert_eq!(as_argb.pixel(0, 0), (0xAA, 0xBB, 0xCC));
    assert_eq!(as_abgr.pixel(0, 0), (0xCC, 0xBB, 0xAA));
}

#[test]
fn hdr_takes_high_bytes() {
    // 16-bit channels (R, G, B, A) reduce to their high bytes
    let px: u64 = 0xFFFF_3344_1122_AB01; // A, B, G, R little-endian words
    let raster = convert(&px.to_le_bytes(), 1, 1, fourcc::ABGR16161616, 8);
    assert_eq!(raster.pixel(0, 0), (0xAB, 0x11, 0x33));
}

#[test]
fn unknown_format_zero_fills() {
    let src = vec![0xFFu8; 64];
    let raster = convert(&src, 4, 4, 0x3231564E /* NV12 */, 16);
    assert!(raster.data.iter().all(|&b| b == 0));
}

#[test]
fn bgrx_scanout_reorders_to_rgb() {
    // An 8x8 XRGB8888 gradient; memory bytes per pixel are
    // (x*36, 0, y*36, 0) in B,G,R,X order
    let w = 8u32;
    let h = 8u32;
    let mut src = Vec::new();
    for y in 0..w {
        for x in 0..h {
            src.extend_from_slice(&[(x * 36) as u8, 0x00, (y * 36) as u8, 0x00]);
        }
    }
    let raster = convert(&src, w, h, fourcc::XRGB8888, w as usize * 4);
    assert_eq!(raster.pixel(3, 5), (0xB4, 0x00, 0x6C));
}
