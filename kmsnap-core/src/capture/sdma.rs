//! Accelerator-native capture through the SDMA engine
//!
//! Imports the scanout buffer object into an amdgpu device context,
//! binds GPU virtual addresses for it and a CPU-visible destination, and
//! submits a single linear-copy packet on the DMA ring. Works for linear
//! scanouts; a tiled source copied this way would stay tiled.

use std::os::fd::{AsFd, AsRawFd};

use tracing::{debug, info};

use crate::amdgpu::{self, sys};
use crate::capture::drm::{DrmCard, FramebufferInfo};
use crate::error::Result;
use crate::formats::{self, RgbRaster};

use drm::control::Device as _;

/// SDMA linear-copy packet opcode
const SDMA_OPCODE_COPY: u32 = 1;
/// Linear sub-opcode of the copy packet
const SDMA_COPY_SUB_OPCODE_LINEAR: u32 = 0;

/// Pack the 7-dword linear-copy packet header
const fn sdma_copy_linear_header(op: u32, sub_op: u32) -> u32 {
    ((op & 0xff) << 0) | ((sub_op & 0xff) << 8)
}

/// Build the SDMA linear-copy command stream
fn build_copy_packet(src_va: u64, dst_va: u64, byte_count: u64) -> [u32; 7] {
    [
        sdma_copy_linear_header(SDMA_OPCODE_COPY, SDMA_COPY_SUB_OPCODE_LINEAR),
        (byte_count - 1) as u32,
        0,
        src_va as u32,
        (src_va >> 32) as u32,
        dst_va as u32,
        (dst_va >> 32) as u32,
    ]
}

const IB_SIZE: u64 = 4096;
const VA_ALIGNMENT: u64 = 4096;

/// Capture the framebuffer by importing it and copying with the DMA
/// engine, then converting the CPU-mapped destination to RGB24
///
/// On any failure the RAII wrappers unwind everything acquired so far in
/// reverse order; no driver state leaks.
pub fn capture(card: &DrmCard, fb: &FramebufferInfo) -> Result<RgbRaster> {
    let dev = amdgpu::Device::initialize(card.as_fd().as_raw_fd())?;
    let (major, minor) = dev.version();
    debug!("SDMA capture on amdgpu interface {}.{}", major, minor);

    let ctx = dev.create_context()?;

    // Import the scanout: flink name first, then a PRIME descriptor.
    // The dma-buf import converts the descriptor to a GEM handle without
    // taking ownership, so it is closed right after the call either way.
    let mut src_bo = match dev.import_bo(
        sys::amdgpu_bo_handle_type::gem_flink_name,
        fb.handles[0],
    ) {
        Ok(bo) => bo,
        Err(first_err) => {
            let prime_fd = card
                .buffer_to_prime_fd(fb.plane0_handle()?, libc::O_CLOEXEC as u32)
                .map_err(|_| first_err)?;
            let imported = dev.import_bo(
                sys::amdgpu_bo_handle_type::dma_buf_fd,
                prime_fd.as_raw_fd() as u32,
            );
            drop(prime_fd);
            imported?
        }
    };
    let src_info = src_bo.query_info()?;

    let src_va = dev.alloc_va(src_info.alloc_size, VA_ALIGNMENT)?;
    let src_bind = src_bo.bind(&src_va)?;

    let copy_size = fb.plane0_size();
    let dst_bo = dev.alloc_bo(
        copy_size,
        VA_ALIGNMENT,
        sys::AMDGPU_GEM_DOMAIN_GTT,
        sys::AMDGPU_GEM_CREATE_CPU_ACCESS_REQUIRED,
    )?;
    let dst_va = dev.alloc_va(copy_size, VA_ALIGNMENT)?;
    let dst_bind = dst_bo.bind(&dst_va)?;

    // Indirect buffer holding the copy packet
    let ib_bo = dev.alloc_bo(
        IB_SIZE,
        VA_ALIGNMENT,
        sys::AMDGPU_GEM_DOMAIN_GTT,
        sys::AMDGPU_GEM_CREATE_CPU_ACCESS_REQUIRED,
    )?;
    let ib_va = dev.alloc_va(IB_SIZE, VA_ALIGNMENT)?;
    let ib_bind = ib_bo.bind(&ib_va)?;

    let packet = build_copy_packet(src_bind.address(), dst_bind.address(), copy_size);
    {
        let mut ib_map = ib_bo.cpu_map()?;
        ib_map.write_dwords(&packet);
    }

    info!("Submitting SDMA linear copy ({} bytes)", copy_size);
    let seq_no = ctx.submit(
        amdgpu::AMDGPU_HW_IP_DMA,
        0,
        ib_bind.address(),
        packet.len() as u32,
    )?;
    ctx.wait_fence(
        amdgpu::AMDGPU_HW_IP_DMA,
        0,
        seq_no,
        amdgpu::AMDGPU_TIMEOUT_INFINITE,
    )?;

    let mut raster = RgbRaster::new(fb.width, fb.height);
    {
        let dst_map = dst_bo.cpu_map()?;
        formats::convert_to_rgb24(
            dst_map.as_slice(),
            &mut raster,
            fb.format,
            fb.pitches[0] as usize,
        );
    }
    Ok(raster)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_packet_layout() {
        let packet = build_copy_packet(0x1_2345_6789, 0xA_BCDE_F012, 0x1000);
        assert_eq!(packet[0], 0x0001); // COPY opcode, LINEAR sub-opcode
        assert_eq!(packet[1], 0x0fff); // byte count minus one
        assert_eq!(packet[2], 0);
        assert_eq!(packet[3], 0x2345_6789);
        assert_eq!(packet[4], 0x1);
        assert_eq!(packet[5], 0xBCDE_F012);
        assert_eq!(packet[6], 0xA);
    }

    #[test]
    fn test_header_packs_sub_opcode() {
        assert_eq!(sdma_copy_linear_header(1, 0), 1);
        assert_eq!(sdma_copy_linear_header(1, 2), 0x201);
    }
}
