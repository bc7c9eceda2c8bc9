//! KMS plane and framebuffer discovery
//!
//! Finds the scanout: enumerates planes on the DRM device, follows their
//! bound framebuffers, and fetches the layout metadata (format, modifier,
//! per-plane handles/pitches/offsets) needed by the acquisition paths.

use std::fs::{File, OpenOptions};
use std::num::NonZeroU32;
use std::os::fd::AsFd;
use std::path::Path;

use drm::control::{framebuffer, Device as ControlDevice, RawResourceHandle};
use drm::{ClientCapability, Device};
use drm_fourcc::DrmModifier;
use tracing::{debug, warn};

use crate::error::{CaptureError, Result};
use crate::formats;

/// An opened DRM character device
///
/// The file descriptor is held read-write for the lifetime of the
/// process; all KMS and PRIME ioctls go through it.
pub struct DrmCard(File);

impl AsFd for DrmCard {
    fn as_fd(&self) -> std::os::fd::BorrowedFd<'_> {
        self.0.as_fd()
    }
}

impl drm::Device for DrmCard {}
impl ControlDevice for DrmCard {}

impl DrmCard {
    /// Open a DRM device node read-write
    pub fn open(path: &Path) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| CaptureError::device(format!("open {}: {}", path.display(), e)))?;
        debug!("Opened DRM device {} (read-write)", path.display());
        Ok(Self(file))
    }

    /// Enable the universal planes client capability
    ///
    /// Without it the kernel hides primary and cursor planes from the
    /// plane list. Failure is non-fatal; enumeration then sees only
    /// overlay planes.
    pub fn enable_universal_planes(&self) {
        if let Err(e) = self.set_client_capability(ClientCapability::UniversalPlanes, true) {
            warn!("Failed to enable universal planes: {}", e);
        }
    }

    /// Kernel driver name for this device
    pub fn driver_name(&self) -> Result<String> {
        let driver = self
            .get_driver()
            .map_err(|e| CaptureError::device(format!("query DRM driver: {}", e)))?;
        Ok(driver.name().to_string_lossy().into_owned())
    }
}

/// Framebuffer layout metadata, immutable after discovery
///
/// Plane 0 always carries a valid non-zero driver handle; width and
/// height are positive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramebufferInfo {
    /// KMS framebuffer id
    pub id: u32,
    pub width: u32,
    pub height: u32,
    /// DRM fourcc pixel format code
    pub format: u32,
    /// Format modifier; 0 is linear
    pub modifier: u64,
    /// Per-plane GEM handles, 0 where absent
    pub handles: [u32; 4],
    /// Per-plane row pitches in bytes
    pub pitches: [u32; 4],
    /// Per-plane byte offsets
    pub offsets: [u32; 4],
}

impl FramebufferInfo {
    /// Whether the buffer uses a tiled/compressed memory layout
    pub fn is_tiled(&self) -> bool {
        self.modifier != 0 && self.modifier != u64::from(DrmModifier::Linear)
    }

    /// Whether the content is wide-gamut HDR needing tone mapping
    pub fn is_hdr(&self) -> bool {
        formats::is_hdr_format(self.format)
    }

    /// Size in bytes of the plane-0 pixel data, `pitch * height`
    pub fn plane0_size(&self) -> u64 {
        u64::from(self.pitches[0]) * u64::from(self.height)
    }

    /// Plane-0 GEM handle as a DRM buffer handle
    pub fn plane0_handle(&self) -> Result<drm::buffer::Handle> {
        NonZeroU32::new(self.handles[0])
            .map(drm::buffer::Handle::from)
            .ok_or_else(|| CaptureError::discovery("framebuffer has no plane-0 handle".to_string()))
    }

    fn describe(&self) -> String {
        format!(
            "FB {}: {}x{}, format={} (0x{:08x}), modifier=0x{:016x}",
            self.id,
            self.width,
            self.height,
            formats::format_name(self.format),
            self.format,
            self.modifier
        )
    }
}

/// A plane together with its currently bound framebuffer, if any
#[derive(Debug, Clone)]
pub struct PlaneBinding {
    pub plane_id: u32,
    /// Bound framebuffer metadata; `None` when the plane is idle or only
    /// the legacy query succeeded
    pub framebuffer: Option<FramebufferInfo>,
    /// Raw framebuffer id, kept even when metadata is unavailable
    pub fb_id: u32,
}

fn raw_id<T: Into<RawResourceHandle>>(handle: T) -> u32 {
    handle.into().get()
}

fn fb_handle(fb_id: u32) -> Result<framebuffer::Handle> {
    NonZeroU32::new(fb_id)
        .map(framebuffer::Handle::from)
        .ok_or_else(|| CaptureError::discovery("framebuffer id 0".to_string()))
}

/// Fetch framebuffer metadata through the FB2 query
///
/// The legacy FB1 query has no pixel format, so a framebuffer only
/// reachable through it cannot be captured.
pub fn framebuffer_info(card: &DrmCard, fb_id: u32) -> Result<FramebufferInfo> {
    let handle = fb_handle(fb_id)?;
    let info = card.get_planar_framebuffer(handle).map_err(|e| {
        // Report what the legacy query knows before giving up
        if let Ok(fb) = card.get_framebuffer(handle) {
            let (w, h) = fb.size();
            CaptureError::discovery(format!(
                "FB {fb_id} ({w}x{h}) is only visible to the legacy framebuffer query, \
                 which lacks the pixel format needed for capture: {e}"
            ))
        } else {
            CaptureError::discovery(format!("query framebuffer {fb_id}: {e}"))
        }
    })?;

    let (width, height) = info.size();
    let mut handles = [0u32; 4];
    for (dst, src) in handles.iter_mut().zip(info.buffers()) {
        *dst = src.map(raw_id).unwrap_or(0);
    }
    let modifier = info.modifier().map(u64::from).unwrap_or(0);

    let fb = FramebufferInfo {
        id: fb_id,
        width,
        height,
        format: info.pixel_format() as u32,
        modifier,
        handles,
        pitches: info.pitches(),
        offsets: info.offsets(),
    };
    debug!("{}", fb.describe());
    Ok(fb)
}

/// Enumerate all planes and their bound framebuffers
pub fn list_planes(card: &DrmCard) -> Result<Vec<PlaneBinding>> {
    let planes = card
        .plane_handles()
        .map_err(|e| CaptureError::discovery(format!("list planes: {}", e)))?;

    let mut out = Vec::with_capacity(planes.len());
    for plane in planes {
        let info = match card.get_plane(plane) {
            Ok(info) => info,
            Err(e) => {
                warn!("Failed to query plane {}: {}", raw_id(plane), e);
                continue;
            }
        };

        let fb_id = info.framebuffer().map(raw_id).unwrap_or(0);
        let framebuffer = if fb_id != 0 {
            framebuffer_info(card, fb_id).ok()
        } else {
            None
        };

        out.push(PlaneBinding {
            plane_id: raw_id(plane),
            framebuffer,
            fb_id,
        });
    }
    Ok(out)
}

/// Pick the primary scanout: the bound framebuffer with the largest area
///
/// Ties are broken by enumeration order.
pub fn find_primary_framebuffer(card: &DrmCard) -> Result<u32> {
    let mut best: Option<(u32, u64)> = None;
    for binding in list_planes(card)? {
        let Some(fb) = binding.framebuffer else {
            continue;
        };
        let area = u64::from(fb.width) * u64::from(fb.height);
        if best.map(|(_, a)| area > a).unwrap_or(true) {
            best = Some((fb.id, area));
        }
    }
    best.map(|(id, _)| id).ok_or_else(|| {
        CaptureError::discovery("no active framebuffers found on this device".to_string())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fourcc;

    fn fb(width: u32, height: u32, format: u32, modifier: u64) -> FramebufferInfo {
        FramebufferInfo {
            id: 40,
            width,
            height,
            format,
            modifier,
            handles: [7, 0, 0, 0],
            pitches: [width * 4, 0, 0, 0],
            offsets: [0; 4],
        }
    }

    #[test]
    fn test_tiling_predicate() {
        assert!(!fb(1920, 1080, fourcc::XRGB8888, 0).is_tiled());
        assert!(fb(1920, 1080, fourcc::XRGB8888, 0x200000018801b03).is_tiled());
    }

    #[test]
    fn test_hdr_predicate() {
        assert!(fb(1920, 1080, fourcc::ABGR16161616, 1).is_hdr());
        assert!(!fb(1920, 1080, fourcc::ARGB8888, 1).is_hdr());
    }

    #[test]
    fn test_plane0_size() {
        let fb = fb(1920, 1080, fourcc::XRGB8888, 0);
        assert_eq!(fb.plane0_size(), 1920 * 4 * 1080);
    }

    #[test]
    fn test_plane0_handle_must_be_nonzero() {
        let mut broken = fb(8, 8, fourcc::XRGB8888, 0);
        broken.handles[0] = 0;
        assert!(broken.plane0_handle().is_err());
    }
}
