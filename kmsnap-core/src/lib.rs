//! Kmsnap Core Library
//!
//! Single-frame capture of the currently scanned-out display image from a
//! Linux KMS device.
//!
//! This library provides:
//! - KMS plane enumeration and primary-framebuffer discovery
//! - Accelerator-native capture via the amdgpu SDMA engine
//! - GPU de-tiling of tiled scanouts via Vulkan external memory
//! - HDR (PQ/Rec.2020) tone mapping to sRGB with selectable curves
//! - A dumb-buffer CPU fallback and binary PPM output
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐    ┌─────────────────────┐    ┌───────────────┐
//! │ KMS Discovery │───▶│ Acquisition Ladder  │───▶│ RGB24 + PPM   │
//! │ (planes, FB2) │    │ Vulkan ▸ SDMA ▸ dumb│    │ (formats/out) │
//! └───────────────┘    └─────────────────────┘    └───────────────┘
//! ```

pub mod amdgpu;
pub mod capture;
pub mod error;
pub mod formats;
pub mod output;
pub mod tonemap;

pub use capture::{
    acquire, find_primary_framebuffer, framebuffer_info, list_planes, DrmCard, FramebufferInfo,
    PlaneBinding, Strategy, PREFERRED_DRIVER,
};
pub use error::{CaptureError, Result};
pub use formats::RgbRaster;
pub use output::write_ppm;
pub use tonemap::{ToneMapOperator, ToneMapSettings};
