//! Framebuffer acquisition
//!
//! Three strategies share one contract: given the DRM card and the
//! framebuffer metadata, hand back a linear RGB raster. The orchestrator
//! walks them in preference order, filtered by driver name and tiling
//! modifier, and falls through on recoverable failures:
//!
//! 1. [`Strategy::ComputeDeswizzle`]: Vulkan external-memory import with
//!    GPU de-tiling and HDR tone mapping (amdgpu, tiled scanouts)
//! 2. [`Strategy::DmaCopy`]: accelerator-native SDMA linear copy (amdgpu)
//! 3. [`Strategy::DumbShadow`]: CPU shadow copy through a dumb buffer
//!    (any driver)

pub mod drm;
pub mod dumb;
pub mod sdma;
pub mod vulkan;

use tracing::{info, warn};

use crate::error::{CaptureError, Result};
use crate::formats::RgbRaster;
use crate::tonemap::ToneMapSettings;

pub use self::drm::{
    find_primary_framebuffer, framebuffer_info, list_planes, DrmCard, FramebufferInfo,
    PlaneBinding,
};

/// The accelerator driver with native SDMA and de-swizzle support
pub const PREFERRED_DRIVER: &str = "amdgpu";

/// One acquisition path over the common
/// `(card, framebuffer, settings) -> raster` contract
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Vulkan external-memory import, GPU de-tiling, optional tone map
    ComputeDeswizzle,
    /// SDMA engine linear copy into a CPU-visible buffer
    DmaCopy,
    /// Dumb-buffer shadow copy on the CPU
    DumbShadow,
}

impl Strategy {
    /// Preference-ordered list the orchestrator folds over
    pub const LADDER: [Strategy; 3] = [
        Strategy::ComputeDeswizzle,
        Strategy::DmaCopy,
        Strategy::DumbShadow,
    ];

    /// Whether this strategy applies to the given driver and buffer
    pub fn applies(self, driver: &str, fb: &FramebufferInfo) -> bool {
        match self {
            Strategy::ComputeDeswizzle => driver == PREFERRED_DRIVER && fb.is_tiled(),
            Strategy::DmaCopy => driver == PREFERRED_DRIVER,
            Strategy::DumbShadow => true,
        }
    }

    fn acquire(
        self,
        card: &DrmCard,
        fb: &FramebufferInfo,
        settings: &ToneMapSettings,
    ) -> Result<RgbRaster> {
        match self {
            Strategy::ComputeDeswizzle => vulkan::capture(card, fb, settings),
            Strategy::DmaCopy => sdma::capture(card, fb),
            Strategy::DumbShadow => dumb::capture(card, fb),
        }
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Strategy::ComputeDeswizzle => write!(f, "GPU de-swizzle"),
            Strategy::DmaCopy => write!(f, "SDMA copy"),
            Strategy::DumbShadow => write!(f, "dumb-buffer shadow"),
        }
    }
}

/// Capture one frame of the given framebuffer as a linear RGB raster
///
/// Runs the fallback ladder; the error of the last applicable strategy
/// is returned if every path fails.
pub fn acquire(card: &DrmCard, fb_id: u32, settings: &ToneMapSettings) -> Result<RgbRaster> {
    let fb = framebuffer_info(card, fb_id)?;
    let driver = card.driver_name()?;
    info!(
        "DRM driver: {}, capturing FB {} ({}x{})",
        driver, fb.id, fb.width, fb.height
    );

    let mut last_err = None;
    for strategy in Strategy::LADDER {
        if !strategy.applies(&driver, &fb) {
            continue;
        }
        info!("Trying {} capture", strategy);
        match strategy.acquire(card, &fb, settings) {
            Ok(raster) => {
                info!("{} capture succeeded", strategy);
                return Ok(raster);
            }
            Err(e) if e.is_fallthrough() => {
                warn!("{} capture failed: {}", strategy, e);
                last_err = Some(e);
            }
            Err(e) => {
                // Device/discovery problems will not improve on another
                // path either, but the ladder contract keeps trying
                warn!("{} capture failed: {}", strategy, e);
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        CaptureError::discovery("no acquisition strategy applies to this device".to_string())
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::formats::fourcc;

    fn fb(format: u32, modifier: u64) -> FramebufferInfo {
        FramebufferInfo {
            id: 40,
            width: 1920,
            height: 1080,
            format,
            modifier,
            handles: [5, 0, 0, 0],
            pitches: [1920 * 4, 0, 0, 0],
            offsets: [0; 4],
        }
    }

    #[test]
    fn test_tiled_amdgpu_prefers_compute() {
        let tiled = fb(fourcc::ABGR16161616, 0x200000018801b03);
        let applicable: Vec<Strategy> = Strategy::LADDER
            .into_iter()
            .filter(|s| s.applies("amdgpu", &tiled))
            .collect();
        assert_eq!(
            applicable,
            [
                Strategy::ComputeDeswizzle,
                Strategy::DmaCopy,
                Strategy::DumbShadow
            ]
        );
    }

    #[test]
    fn test_linear_amdgpu_skips_compute() {
        let linear = fb(fourcc::XRGB8888, 0);
        assert!(!Strategy::ComputeDeswizzle.applies("amdgpu", &linear));
        assert!(Strategy::DmaCopy.applies("amdgpu", &linear));
    }

    #[test]
    fn test_other_drivers_get_shadow_only() {
        let tiled = fb(fourcc::XRGB8888, 0x100);
        let applicable: Vec<Strategy> = Strategy::LADDER
            .into_iter()
            .filter(|s| s.applies("i915", &tiled))
            .collect();
        assert_eq!(applicable, [Strategy::DumbShadow]);
    }
}
