//! Raw FFI bindings for the amdgpu userspace library (libdrm_amdgpu)
//!
//! These bindings are loaded dynamically at runtime from libdrm_amdgpu.so.
//! They cover the subset of the buffer-object, virtual-address and
//! command-submission API needed to copy a scanout buffer with the SDMA
//! engine.

#![allow(non_camel_case_types)]
#![allow(dead_code)]

use std::ffi::{c_int, c_uint, c_void};

/// Opaque device handle
pub type amdgpu_device_handle = *mut c_void;
/// Opaque submission context handle
pub type amdgpu_context_handle = *mut c_void;
/// Opaque buffer object handle
pub type amdgpu_bo_handle = *mut c_void;
/// Opaque virtual-address range handle
pub type amdgpu_va_handle = *mut c_void;
/// Opaque buffer list handle
pub type amdgpu_bo_list_handle = *mut c_void;

/// GTT (system memory visible to the GPU) heap
pub const AMDGPU_GEM_DOMAIN_GTT: u32 = 0x2;
/// Request a CPU-mappable allocation
pub const AMDGPU_GEM_CREATE_CPU_ACCESS_REQUIRED: u64 = 1 << 0;

/// System DMA hardware IP
pub const AMDGPU_HW_IP_DMA: u32 = 2;

/// Bind a BO into a VA range
pub const AMDGPU_VA_OP_MAP: u32 = 1;
/// Unbind a BO from a VA range
pub const AMDGPU_VA_OP_UNMAP: u32 = 2;

/// Wait forever on a fence
pub const AMDGPU_TIMEOUT_INFINITE: u64 = u64::MAX;

/// Kind of foreign handle passed to `amdgpu_bo_import`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum amdgpu_bo_handle_type {
    /// GEM flink name
    gem_flink_name = 0,
    /// KMS GEM handle, valid on the same device file only
    kms = 1,
    /// dma-buf file descriptor
    dma_buf_fd = 2,
    /// KMS handle, never imported through PRIME
    kms_noimport = 3,
}

/// VA pool selector
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum amdgpu_gpu_va_range {
    /// General purpose virtual address range
    general = 0,
}

/// Buffer allocation parameters
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct amdgpu_bo_alloc_request {
    pub alloc_size: u64,
    pub phys_alignment: u64,
    pub preferred_heap: u32,
    pub flags: u64,
}

/// Tiling/layout metadata attached to a BO
#[repr(C)]
#[derive(Clone, Copy)]
pub struct amdgpu_bo_metadata {
    pub flags: u64,
    pub tiling_info: u64,
    pub size_metadata: u32,
    pub umd_metadata: [u32; 64],
}

impl Default for amdgpu_bo_metadata {
    fn default() -> Self {
        Self {
            flags: 0,
            tiling_info: 0,
            size_metadata: 0,
            umd_metadata: [0; 64],
        }
    }
}

/// Queried BO properties
#[repr(C)]
#[derive(Clone, Copy, Default)]
pub struct amdgpu_bo_info {
    pub alloc_size: u64,
    pub phys_alignment: u64,
    pub preferred_heap: u32,
    pub alloc_flags: u64,
    pub metadata: amdgpu_bo_metadata,
}

/// Result of importing a foreign handle
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct amdgpu_bo_import_result {
    pub buf_handle: amdgpu_bo_handle,
    pub alloc_size: u64,
}

impl Default for amdgpu_bo_import_result {
    fn default() -> Self {
        Self {
            buf_handle: std::ptr::null_mut(),
            alloc_size: 0,
        }
    }
}

/// One indirect buffer inside a submission
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct amdgpu_cs_ib_info {
    pub flags: u64,
    pub ib_mc_address: u64,
    pub size: u32,
}

/// Optional user fence attached to a submission
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct amdgpu_cs_fence_info {
    pub handle: amdgpu_bo_handle,
    pub offset: u64,
}

impl Default for amdgpu_cs_fence_info {
    fn default() -> Self {
        Self {
            handle: std::ptr::null_mut(),
            offset: 0,
        }
    }
}

/// Fence identity for status queries
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct amdgpu_cs_fence {
    pub context: amdgpu_context_handle,
    pub ip_type: u32,
    pub ip_instance: u32,
    pub ring: u32,
    pub fence: u64,
}

impl Default for amdgpu_cs_fence {
    fn default() -> Self {
        Self {
            context: std::ptr::null_mut(),
            ip_type: 0,
            ip_instance: 0,
            ring: 0,
            fence: 0,
        }
    }
}

/// One command stream submission
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct amdgpu_cs_request {
    pub flags: u64,
    pub ip_type: c_uint,
    pub ip_instance: c_uint,
    pub ring: u32,
    pub resources: amdgpu_bo_list_handle,
    pub number_of_dependencies: u32,
    pub dependencies: *mut amdgpu_cs_fence,
    pub number_of_ibs: u32,
    pub ibs: *mut amdgpu_cs_ib_info,
    pub seq_no: u64,
    pub fence_info: amdgpu_cs_fence_info,
}

impl Default for amdgpu_cs_request {
    fn default() -> Self {
        Self {
            flags: 0,
            ip_type: 0,
            ip_instance: 0,
            ring: 0,
            resources: std::ptr::null_mut(),
            number_of_dependencies: 0,
            dependencies: std::ptr::null_mut(),
            number_of_ibs: 0,
            ibs: std::ptr::null_mut(),
            seq_no: 0,
            fence_info: amdgpu_cs_fence_info::default(),
        }
    }
}

pub type FnDeviceInitialize = unsafe extern "C" fn(
    fd: c_int,
    major_version: *mut u32,
    minor_version: *mut u32,
    device_handle: *mut amdgpu_device_handle,
) -> c_int;

pub type FnDeviceDeinitialize = unsafe extern "C" fn(device: amdgpu_device_handle) -> c_int;

pub type FnCsCtxCreate = unsafe extern "C" fn(
    dev: amdgpu_device_handle,
    context: *mut amdgpu_context_handle,
) -> c_int;

pub type FnCsCtxFree = unsafe extern "C" fn(context: amdgpu_context_handle) -> c_int;

pub type FnBoAlloc = unsafe extern "C" fn(
    dev: amdgpu_device_handle,
    alloc_buffer: *const amdgpu_bo_alloc_request,
    buf_handle: *mut amdgpu_bo_handle,
) -> c_int;

pub type FnBoImport = unsafe extern "C" fn(
    dev: amdgpu_device_handle,
    handle_type: amdgpu_bo_handle_type,
    shared_handle: u32,
    output: *mut amdgpu_bo_import_result,
) -> c_int;

pub type FnBoFree = unsafe extern "C" fn(buf_handle: amdgpu_bo_handle) -> c_int;

pub type FnBoQueryInfo =
    unsafe extern "C" fn(buf_handle: amdgpu_bo_handle, info: *mut amdgpu_bo_info) -> c_int;

pub type FnBoCpuMap =
    unsafe extern "C" fn(buf_handle: amdgpu_bo_handle, cpu: *mut *mut c_void) -> c_int;

pub type FnBoCpuUnmap = unsafe extern "C" fn(buf_handle: amdgpu_bo_handle) -> c_int;

pub type FnVaRangeAlloc = unsafe extern "C" fn(
    dev: amdgpu_device_handle,
    va_range_type: amdgpu_gpu_va_range,
    size: u64,
    va_base_alignment: u64,
    va_base_required: u64,
    va_base_allocated: *mut u64,
    va_range_handle: *mut amdgpu_va_handle,
    flags: u64,
) -> c_int;

pub type FnVaRangeFree = unsafe extern "C" fn(va_range_handle: amdgpu_va_handle) -> c_int;

pub type FnBoVaOp = unsafe extern "C" fn(
    bo: amdgpu_bo_handle,
    offset: u64,
    size: u64,
    addr: u64,
    flags: u64,
    ops: u32,
) -> c_int;

pub type FnCsSubmit = unsafe extern "C" fn(
    context: amdgpu_context_handle,
    flags: u64,
    ibs_request: *mut amdgpu_cs_request,
    number_of_requests: u32,
) -> c_int;

pub type FnCsQueryFenceStatus = unsafe extern "C" fn(
    fence: *const amdgpu_cs_fence,
    timeout_ns: u64,
    flags: u64,
    expired: *mut u32,
) -> c_int;

/// Library names to search for the amdgpu userspace library
pub const AMDGPU_LIB_PATHS: &[&str] = &["libdrm_amdgpu.so.1", "libdrm_amdgpu.so"];

/// Dynamically loaded libdrm_amdgpu
pub struct AmdgpuLib {
    _lib: libloading::Library,
    pub device_initialize: FnDeviceInitialize,
    pub device_deinitialize: FnDeviceDeinitialize,
    pub cs_ctx_create: FnCsCtxCreate,
    pub cs_ctx_free: FnCsCtxFree,
    pub bo_alloc: FnBoAlloc,
    pub bo_import: FnBoImport,
    pub bo_free: FnBoFree,
    pub bo_query_info: FnBoQueryInfo,
    pub bo_cpu_map: FnBoCpuMap,
    pub bo_cpu_unmap: FnBoCpuUnmap,
    pub va_range_alloc: FnVaRangeAlloc,
    pub va_range_free: FnVaRangeFree,
    pub bo_va_op: FnBoVaOp,
    pub cs_submit: FnCsSubmit,
    pub cs_query_fence_status: FnCsQueryFenceStatus,
}

impl AmdgpuLib {
    /// Try to load libdrm_amdgpu from the standard sonames
    pub fn load() -> Result<Self, String> {
        for path in AMDGPU_LIB_PATHS {
            if let Ok(lib) = Self::load_from_path(path) {
                tracing::debug!("Loaded amdgpu userspace library from: {}", path);
                return Ok(lib);
            }
        }
        Err("Failed to load libdrm_amdgpu.so from any known soname".to_string())
    }

    /// Load the library from a specific path
    ///
    /// # Safety
    /// Loads a shared library and looks up symbols with the signatures
    /// declared above, which match the installed libdrm_amdgpu headers.
    /// Function pointers are copied out immediately and the library handle
    /// is kept alive for the lifetime of this struct.
    pub fn load_from_path(path: &str) -> Result<Self, String> {
        macro_rules! symbol {
            ($lib:expr, $ty:ty, $name:literal) => {
                *$lib
                    .get::<$ty>($name)
                    .map_err(|e| format!("Failed to get {}: {}", String::from_utf8_lossy($name), e))?
            };
        }

        unsafe {
            let lib = libloading::Library::new(path)
                .map_err(|e| format!("Failed to load {}: {}", path, e))?;

            let out = Self {
                device_initialize: symbol!(lib, FnDeviceInitialize, b"amdgpu_device_initialize"),
                device_deinitialize: symbol!(
                    lib,
                    FnDeviceDeinitialize,
                    b"amdgpu_device_deinitialize"
                ),
                cs_ctx_create: symbol!(lib, FnCsCtxCreate, b"amdgpu_cs_ctx_create"),
                cs_ctx_free: symbol!(lib, FnCsCtxFree, b"amdgpu_cs_ctx_free"),
                bo_alloc: symbol!(lib, FnBoAlloc, b"amdgpu_bo_alloc"),
                bo_import: symbol!(lib, FnBoImport, b"amdgpu_bo_import"),
                bo_free: symbol!(lib, FnBoFree, b"amdgpu_bo_free"),
                bo_query_info: symbol!(lib, FnBoQueryInfo, b"amdgpu_bo_query_info"),
                bo_cpu_map: symbol!(lib, FnBoCpuMap, b"amdgpu_bo_cpu_map"),
                bo_cpu_unmap: symbol!(lib, FnBoCpuUnmap, b"amdgpu_bo_cpu_unmap"),
                va_range_alloc: symbol!(lib, FnVaRangeAlloc, b"amdgpu_va_range_alloc"),
                va_range_free: symbol!(lib, FnVaRangeFree, b"amdgpu_va_range_free"),
                bo_va_op: symbol!(lib, FnBoVaOp, b"amdgpu_bo_va_op"),
                cs_submit: symbol!(lib, FnCsSubmit, b"amdgpu_cs_submit"),
                cs_query_fence_status: symbol!(
                    lib,
                    FnCsQueryFenceStatus,
                    b"amdgpu_cs_query_fence_status"
                ),
                _lib: lib,
            };
            Ok(out)
        }
    }
}
