//! Safe wrappers over the amdgpu userspace library
//!
//! Every driver object is owned by exactly one RAII type, so an early
//! return unwinds in strict reverse-allocation order:
//!
//! - [`Device`]: device handle, deinitialized last
//! - [`SubmitContext`]: command submission context
//! - [`BufferObject`]: a GPU memory allocation, imported or local
//! - [`VaRange`]: a virtual-address range from the general pool
//! - [`VaBinding`] / [`CpuMapping`]: borrows of a buffer object, so the
//!   borrow checker enforces unmap-before-free
//!
//! Release failures during unwinding are logged, never panicked on.

pub mod sys;

use std::ffi::c_void;
use std::sync::Arc;

use tracing::{debug, warn};

use crate::error::{CaptureError, Result};

pub use sys::{AMDGPU_HW_IP_DMA, AMDGPU_TIMEOUT_INFINITE};

struct DeviceInner {
    lib: sys::AmdgpuLib,
    handle: sys::amdgpu_device_handle,
}

// The library serializes access internally; handles are plain pointers.
unsafe impl Send for DeviceInner {}
unsafe impl Sync for DeviceInner {}

impl Drop for DeviceInner {
    fn drop(&mut self) {
        let r = unsafe { (self.lib.device_deinitialize)(self.handle) };
        if r != 0 {
            warn!("amdgpu device deinitialize failed: {}", r);
        }
    }
}

/// An initialized amdgpu device
pub struct Device {
    inner: Arc<DeviceInner>,
    major: u32,
    minor: u32,
}

impl Device {
    /// Initialize the accelerator from a DRM file descriptor
    pub fn initialize(drm_fd: i32) -> Result<Self> {
        let lib = sys::AmdgpuLib::load().map_err(CaptureError::device)?;

        let mut major = 0u32;
        let mut minor = 0u32;
        let mut handle: sys::amdgpu_device_handle = std::ptr::null_mut();
        let r = unsafe { (lib.device_initialize)(drm_fd, &mut major, &mut minor, &mut handle) };
        if r != 0 {
            return Err(CaptureError::import("initialize amdgpu device", r));
        }

        debug!("amdgpu device initialized: interface {}.{}", major, minor);
        Ok(Self {
            inner: Arc::new(DeviceInner { lib, handle }),
            major,
            minor,
        })
    }

    /// Userspace interface version reported at init
    pub fn version(&self) -> (u32, u32) {
        (self.major, self.minor)
    }

    /// Create a command submission context
    pub fn create_context(&self) -> Result<SubmitContext> {
        let mut handle: sys::amdgpu_context_handle = std::ptr::null_mut();
        let r = unsafe { (self.inner.lib.cs_ctx_create)(self.inner.handle, &mut handle) };
        if r != 0 {
            return Err(CaptureError::import("create submission context", r));
        }
        Ok(SubmitContext {
            dev: self.inner.clone(),
            handle,
        })
    }

    /// Allocate a buffer object
    pub fn alloc_bo(&self, size: u64, alignment: u64, heap: u32, flags: u64) -> Result<BufferObject> {
        let req = sys::amdgpu_bo_alloc_request {
            alloc_size: size,
            phys_alignment: alignment,
            preferred_heap: heap,
            flags,
        };
        let mut handle: sys::amdgpu_bo_handle = std::ptr::null_mut();
        let r = unsafe { (self.inner.lib.bo_alloc)(self.inner.handle, &req, &mut handle) };
        if r != 0 {
            return Err(CaptureError::import(
                format!("allocate {size}-byte buffer object"),
                r,
            ));
        }
        Ok(BufferObject {
            dev: self.inner.clone(),
            handle,
            size,
        })
    }

    /// Import a foreign handle or descriptor as a buffer object
    pub fn import_bo(
        &self,
        handle_type: sys::amdgpu_bo_handle_type,
        shared_handle: u32,
    ) -> Result<BufferObject> {
        let mut result = sys::amdgpu_bo_import_result::default();
        let r = unsafe {
            (self.inner.lib.bo_import)(self.inner.handle, handle_type, shared_handle, &mut result)
        };
        if r != 0 {
            return Err(CaptureError::import(
                format!("import buffer object ({handle_type:?})"),
                r,
            ));
        }
        Ok(BufferObject {
            dev: self.inner.clone(),
            handle: result.buf_handle,
            size: result.alloc_size,
        })
    }

    /// Allocate a virtual-address range from the general pool
    pub fn alloc_va(&self, size: u64, alignment: u64) -> Result<VaRange> {
        let mut base = 0u64;
        let mut handle: sys::amdgpu_va_handle = std::ptr::null_mut();
        let r = unsafe {
            (self.inner.lib.va_range_alloc)(
                self.inner.handle,
                sys::amdgpu_gpu_va_range::general,
                size,
                alignment,
                0,
                &mut base,
                &mut handle,
                0,
            )
        };
        if r != 0 {
            return Err(CaptureError::import(
                format!("allocate {size}-byte VA range"),
                r,
            ));
        }
        Ok(VaRange {
            dev: self.inner.clone(),
            base,
            size,
            handle,
        })
    }
}

/// A command submission context
pub struct SubmitContext {
    dev: Arc<DeviceInner>,
    handle: sys::amdgpu_context_handle,
}

impl SubmitContext {
    /// Submit a single indirect buffer on the given hardware IP and ring,
    /// returning the fence sequence number
    pub fn submit(&self, ip_type: u32, ring: u32, ib_va: u64, dword_count: u32) -> Result<u64> {
        let mut ib_info = sys::amdgpu_cs_ib_info {
            flags: 0,
            ib_mc_address: ib_va,
            size: dword_count,
        };
        let mut request = sys::amdgpu_cs_request {
            ip_type,
            ring,
            number_of_ibs: 1,
            ibs: &mut ib_info,
            ..Default::default()
        };

        let r = unsafe { (self.dev.lib.cs_submit)(self.handle, 0, &mut request, 1) };
        if r != 0 {
            return Err(CaptureError::gpu(format!(
                "command submission failed (status {r})"
            )));
        }
        Ok(request.seq_no)
    }

    /// Block until the fence with the given sequence number signals
    pub fn wait_fence(&self, ip_type: u32, ring: u32, seq_no: u64, timeout_ns: u64) -> Result<()> {
        let fence = sys::amdgpu_cs_fence {
            context: self.handle,
            ip_type,
            ip_instance: 0,
            ring,
            fence: seq_no,
        };
        let mut expired = 0u32;
        let r = unsafe {
            (self.dev.lib.cs_query_fence_status)(&fence, timeout_ns, 0, &mut expired)
        };
        if r != 0 {
            return Err(CaptureError::gpu(format!("fence wait failed (status {r})")));
        }
        Ok(())
    }
}

impl Drop for SubmitContext {
    fn drop(&mut self) {
        let r = unsafe { (self.dev.lib.cs_ctx_free)(self.handle) };
        if r != 0 {
            warn!("amdgpu context free failed: {}", r);
        }
    }
}

/// A GPU memory allocation owned by this process
pub struct BufferObject {
    dev: Arc<DeviceInner>,
    handle: sys::amdgpu_bo_handle,
    size: u64,
}

impl BufferObject {
    /// Allocation size in bytes, as reported by the driver
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Query allocation properties; refreshes the cached size for
    /// imported buffers whose import result did not report one
    pub fn query_info(&mut self) -> Result<sys::amdgpu_bo_info> {
        let mut info = sys::amdgpu_bo_info::default();
        let r = unsafe { (self.dev.lib.bo_query_info)(self.handle, &mut info) };
        if r != 0 {
            return Err(CaptureError::import("query buffer object info", r));
        }
        self.size = info.alloc_size;
        Ok(info)
    }

    /// Bind this buffer into a virtual-address range
    pub fn bind<'a>(&'a self, va: &'a VaRange) -> Result<VaBinding<'a>> {
        let r = unsafe {
            (self.dev.lib.bo_va_op)(
                self.handle,
                0,
                va.size,
                va.base,
                0,
                sys::AMDGPU_VA_OP_MAP,
            )
        };
        if r != 0 {
            return Err(CaptureError::import("bind buffer object VA", r));
        }
        Ok(VaBinding { bo: self, va })
    }

    /// Map the buffer for CPU access
    pub fn cpu_map(&self) -> Result<CpuMapping<'_>> {
        let mut ptr: *mut c_void = std::ptr::null_mut();
        let r = unsafe { (self.dev.lib.bo_cpu_map)(self.handle, &mut ptr) };
        if r != 0 {
            return Err(CaptureError::import("CPU-map buffer object", r));
        }
        Ok(CpuMapping {
            bo: self,
            ptr,
            len: self.size as usize,
        })
    }
}

impl Drop for BufferObject {
    fn drop(&mut self) {
        let r = unsafe { (self.dev.lib.bo_free)(self.handle) };
        if r != 0 {
            warn!("amdgpu buffer free failed: {}", r);
        }
    }
}

/// A virtual-address range from the device's general pool
pub struct VaRange {
    dev: Arc<DeviceInner>,
    base: u64,
    size: u64,
    handle: sys::amdgpu_va_handle,
}

impl VaRange {
    /// GPU virtual base address
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Range length in bytes
    pub fn size(&self) -> u64 {
        self.size
    }
}

impl Drop for VaRange {
    fn drop(&mut self) {
        let r = unsafe { (self.dev.lib.va_range_free)(self.handle) };
        if r != 0 {
            warn!("amdgpu VA range free failed: {}", r);
        }
    }
}

/// An active BO↔VA binding; unbinds on drop, before either side can be
/// freed
pub struct VaBinding<'a> {
    bo: &'a BufferObject,
    va: &'a VaRange,
}

impl VaBinding<'_> {
    /// GPU virtual address the buffer is visible at
    pub fn address(&self) -> u64 {
        self.va.base
    }
}

impl Drop for VaBinding<'_> {
    fn drop(&mut self) {
        let r = unsafe {
            (self.bo.dev.lib.bo_va_op)(
                self.bo.handle,
                0,
                self.va.size,
                self.va.base,
                0,
                sys::AMDGPU_VA_OP_UNMAP,
            )
        };
        if r != 0 {
            warn!("amdgpu VA unbind failed: {}", r);
        }
    }
}

/// An active CPU mapping of a buffer object
pub struct CpuMapping<'a> {
    bo: &'a BufferObject,
    ptr: *mut c_void,
    len: usize,
}

impl CpuMapping<'_> {
    /// View the mapping as bytes
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr as *const u8, self.len) }
    }

    /// View the mapping as mutable bytes
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr as *mut u8, self.len) }
    }

    /// Write a sequence of command dwords at the start of the mapping
    pub fn write_dwords(&mut self, dwords: &[u32]) {
        let bytes = self.as_mut_slice();
        for (i, dw) in dwords.iter().enumerate() {
            bytes[i * 4..i * 4 + 4].copy_from_slice(&dw.to_le_bytes());
        }
    }
}

impl Drop for CpuMapping<'_> {
    fn drop(&mut self) {
        let r = unsafe { (self.bo.dev.lib.bo_cpu_unmap)(self.bo.handle) };
        if r != 0 {
            warn!("amdgpu CPU unmap failed: {}", r);
        }
    }
}
