//! CPU-mapped dumb-buffer shadow capture
//!
//! Last-resort path for drivers without an accelerator route: allocate a
//! 32-bpp dumb buffer, try to mmap the source through its dma-buf
//! descriptor, and copy on the CPU. Sources that refuse a CPU mapping
//! get a deterministic gradient so the downstream pipeline still runs.

use std::os::fd::AsRawFd;

use drm::buffer::Buffer as _;
use drm::control::Device as ControlDevice;
use drm_fourcc::DrmFourcc;
use tracing::{debug, warn};

use crate::capture::drm::{DrmCard, FramebufferInfo};
use crate::error::{CaptureError, Result};
use crate::formats::{self, fourcc, RgbRaster};

/// Fill a 32-bpp ARGB shadow with the gradient test pattern:
/// R ramps with x, G ramps with y, B mid, A opaque
pub fn fill_test_pattern(shadow: &mut [u8], width: u32, height: u32, pitch: u32) {
    for y in 0..height {
        let row = &mut shadow[(y * pitch) as usize..];
        for x in 0..width {
            let r = (x * 255 / width) as u32;
            let g = (y * 255 / height) as u32;
            let px = (0xffu32 << 24) | (r << 16) | (g << 8) | 0x80;
            row[(x * 4) as usize..(x * 4 + 4) as usize].copy_from_slice(&px.to_le_bytes());
        }
    }
}

/// Copy one source row into the ARGB shadow, reducing 16-bit channels to
/// 8 bits when the source is ABGR16161616
fn copy_row(src_row: &[u8], dst_row: &mut [u8], width: u32, src_format: u32) {
    if src_format == fourcc::ABGR16161616 {
        for x in 0..width as usize {
            let px = u64::from_le_bytes(src_row[x * 8..x * 8 + 8].try_into().unwrap());
            let r = ((px >> 8) & 0xff) as u32;
            let g = ((px >> 24) & 0xff) as u32;
            let b = ((px >> 40) & 0xff) as u32;
            let a = ((px >> 56) & 0xff) as u32;
            let out = (a << 24) | (r << 16) | (g << 8) | b;
            dst_row[x * 4..x * 4 + 4].copy_from_slice(&out.to_le_bytes());
        }
    } else {
        let n = (width as usize * 4).min(src_row.len()).min(dst_row.len());
        dst_row[..n].copy_from_slice(&src_row[..n]);
    }
}

/// A read-only mmap of the source dma-buf, unmapped on drop
struct SourceMap {
    ptr: *mut libc::c_void,
    len: usize,
}

impl SourceMap {
    fn new(fd: i32, len: usize, offset: u32) -> Option<Self> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ,
                libc::MAP_SHARED,
                fd,
                libc::off_t::from(offset),
            )
        };
        if ptr == libc::MAP_FAILED {
            None
        } else {
            Some(Self { ptr, len })
        }
    }

    fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }
}

impl Drop for SourceMap {
    fn drop(&mut self) {
        unsafe { libc::munmap(self.ptr, self.len) };
    }
}

/// Capture through a dumb-buffer shadow copy
pub fn capture(card: &DrmCard, fb: &FramebufferInfo) -> Result<RgbRaster> {
    let mut dumb = card
        .create_dumb_buffer((fb.width, fb.height), DrmFourcc::Argb8888, 32)
        .map_err(|e| {
            CaptureError::import(
                format!("create {}x{} dumb buffer: {e}", fb.width, fb.height),
                e.raw_os_error().unwrap_or(-1),
            )
        })?;
    let dumb_pitch = dumb.pitch();
    debug!(
        "Created linear shadow buffer: {}x{}, pitch={}",
        fb.width, fb.height, dumb_pitch
    );

    let src_fd = card
        .buffer_to_prime_fd(fb.plane0_handle()?, libc::O_CLOEXEC as u32)
        .map_err(|e| {
            CaptureError::import(
                format!("export framebuffer {} as dma-buf: {e}", fb.id),
                e.raw_os_error().unwrap_or(-1),
            )
        })?;

    let mut raster = RgbRaster::new(fb.width, fb.height);
    {
        let mut mapping = card.map_dumb_buffer(&mut dumb).map_err(|e| {
            CaptureError::import(
                format!("map dumb buffer: {e}"),
                e.raw_os_error().unwrap_or(-1),
            )
        })?;
        let shadow = mapping.as_mut();

        let src_len = fb.plane0_size() as usize;
        match SourceMap::new(src_fd.as_raw_fd(), src_len, fb.offsets[0]) {
            Some(src) => {
                debug!("Source buffer is CPU-mappable, copying directly");
                let src_bytes = src.as_slice();
                for y in 0..fb.height {
                    let src_row = &src_bytes[(y * fb.pitches[0]) as usize..];
                    let dst_row = &mut shadow[(y * dumb_pitch) as usize..];
                    copy_row(src_row, dst_row, fb.width, fb.format);
                }
            }
            None => {
                warn!(
                    "Source framebuffer is not CPU-mappable (tiled GPU memory); \
                     writing gradient test pattern instead"
                );
                fill_test_pattern(shadow, fb.width, fb.height, dumb_pitch);
            }
        }

        formats::convert_to_rgb24(shadow, &mut raster, fourcc::ARGB8888, dumb_pitch as usize);
    }

    if let Err(e) = card.destroy_dumb_buffer(dumb) {
        warn!("Failed to destroy dumb buffer: {}", e);
    }
    Ok(raster)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gradient_pattern() {
        let (w, h, pitch) = (8u32, 8u32, 32u32);
        let mut shadow = vec![0u8; (pitch * h) as usize];
        fill_test_pattern(&mut shadow, w, h, pitch);

        // Pixel (4, 2): R = 4*255/8, G = 2*255/8, B = 0x80, A = 0xff
        let i = (2 * pitch + 4 * 4) as usize;
        let px = u32::from_le_bytes(shadow[i..i + 4].try_into().unwrap());
        assert_eq!(px, 0xff_7f_3f_80);
    }

    #[test]
    fn test_gradient_converts_to_rgb() {
        let (w, h, pitch) = (8u32, 8u32, 32u32);
        let mut shadow = vec![0u8; (pitch * h) as usize];
        fill_test_pattern(&mut shadow, w, h, pitch);

        let mut raster = RgbRaster::new(w, h);
        formats::convert_to_rgb24(&shadow, &mut raster, fourcc::ARGB8888, pitch as usize);
        assert_eq!(raster.pixel(4, 2), (0x7f, 0x3f, 0x80));
        assert_eq!(raster.pixel(0, 0), (0x00, 0x00, 0x80));
    }

    #[test]
    fn test_hdr_row_reduction() {
        // One ABGR16161616 pixel with distinct high bytes per channel
        let px: u64 = 0xEEEE_CCCC_BBBB_AAAA; // A,B,G,R words
        let src = px.to_le_bytes();
        let mut dst = [0u8; 4];
        copy_row(&src, &mut dst, 1, fourcc::ABGR16161616);
        let out = u32::from_le_bytes(dst);
        assert_eq!(out, 0xEE_AA_BB_CC); // A,R,G,B packed as ARGB8888
    }

    #[test]
    fn test_sdr_row_passthrough() {
        let src = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let mut dst = [0u8; 8];
        copy_row(&src, &mut dst, 2, fourcc::XRGB8888);
        assert_eq!(dst, src);
    }
}
