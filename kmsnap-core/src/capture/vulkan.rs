//! Tiled-scanout capture through Vulkan external memory
//!
//! When the scanout uses a hardware tiling layout, the buffer is exported
//! as a dma-buf and imported into a compute-capable Vulkan device with an
//! explicit format-modifier plane layout. A GPU image copy de-swizzles it
//! into a linear image; PQ-encoded HDR sources additionally run the tone
//! mapping compute shader before readback.

use std::ffi::CStr;
use std::os::fd::AsRawFd;

use ash::vk;
use tracing::{debug, info};

use crate::capture::drm::{DrmCard, FramebufferInfo};
use crate::error::{CaptureError, Result};
use crate::formats::{self, fourcc, RgbRaster};
use crate::tonemap::ToneMapSettings;

use drm::control::Device as _;

/// Compiled tone mapping compute shader (see hdr_tonemap.comp alongside)
static HDR_TONEMAP_SPV: &[u8] = include_bytes!("shaders/hdr_tonemap.comp.spv");

const KHR_EXTERNAL_MEMORY_CAPABILITIES: &CStr = c"VK_KHR_external_memory_capabilities";
const KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2: &CStr = c"VK_KHR_get_physical_device_properties2";
const KHR_EXTERNAL_MEMORY: &CStr = c"VK_KHR_external_memory";
const KHR_EXTERNAL_MEMORY_FD: &CStr = c"VK_KHR_external_memory_fd";
const EXT_EXTERNAL_MEMORY_DMA_BUF: &CStr = c"VK_EXT_external_memory_dma_buf";
const EXT_IMAGE_DRM_FORMAT_MODIFIER: &CStr = c"VK_EXT_image_drm_format_modifier";

/// Device extensions the import path cannot work without
const REQUIRED_DEVICE_EXTENSIONS: [&CStr; 4] = [
    KHR_EXTERNAL_MEMORY,
    KHR_EXTERNAL_MEMORY_FD,
    EXT_EXTERNAL_MEMORY_DMA_BUF,
    EXT_IMAGE_DRM_FORMAT_MODIFIER,
];

/// Map a DRM fourcc to the matching Vulkan format
fn vk_format_for(format: u32) -> Option<vk::Format> {
    match format {
        fourcc::ABGR16161616 => Some(vk::Format::R16G16B16A16_UNORM),
        fourcc::ARGB8888 | fourcc::XRGB8888 => Some(vk::Format::B8G8R8A8_UNORM),
        fourcc::ABGR8888 | fourcc::XBGR8888 => Some(vk::Format::R8G8B8A8_UNORM),
        _ => None,
    }
}

fn vk_err(context: &str, e: vk::Result) -> CaptureError {
    CaptureError::gpu(format!("{context}: {e:?}"))
}

/// A Vulkan device context able to import dma-bufs and dispatch compute
pub struct VulkanContext {
    _entry: ash::Entry,
    instance: ash::Instance,
    physical_device: vk::PhysicalDevice,
    device: ash::Device,
    queue: vk::Queue,
    command_pool: vk::CommandPool,
}

impl VulkanContext {
    /// Create an instance, pick a device exposing the external-memory
    /// and format-modifier extensions, and set up one queue plus a
    /// command pool
    pub fn new() -> Result<Self> {
        let entry = unsafe { ash::Entry::load() }
            .map_err(|e| CaptureError::device(format!("load Vulkan loader: {e}")))?;

        let app_info = vk::ApplicationInfo::default()
            .application_name(c"kmsnap")
            .application_version(vk::make_api_version(0, 1, 0, 0))
            .engine_name(c"kmsnap")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let instance_extensions = [
            KHR_EXTERNAL_MEMORY_CAPABILITIES.as_ptr(),
            KHR_GET_PHYSICAL_DEVICE_PROPERTIES_2.as_ptr(),
        ];
        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_extension_names(&instance_extensions);
        let instance = unsafe { entry.create_instance(&create_info, None) }
            .map_err(|e| vk_err("create Vulkan instance", e))?;

        let selected = unsafe { Self::select_device(&instance) };
        let Some((physical_device, queue_family_index, name)) = selected else {
            unsafe { instance.destroy_instance(None) };
            return Err(CaptureError::device(
                "no Vulkan device with external-memory, dma-buf and format-modifier support",
            ));
        };
        debug!(
            "Selected Vulkan device: {} (queue family {})",
            name, queue_family_index
        );

        let queue_priorities = [1.0f32];
        let queue_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(queue_family_index)
            .queue_priorities(&queue_priorities)];
        let device_extensions: Vec<_> = REQUIRED_DEVICE_EXTENSIONS
            .iter()
            .map(|e| e.as_ptr())
            .collect();
        let device_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&device_extensions);

        let device = match unsafe { instance.create_device(physical_device, &device_info, None) } {
            Ok(d) => d,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(vk_err("create Vulkan device", e));
            }
        };

        let queue = unsafe { device.get_device_queue(queue_family_index, 0) };
        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(queue_family_index);
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                }
                return Err(vk_err("create command pool", e));
            }
        };

        Ok(Self {
            _entry: entry,
            instance,
            physical_device,
            device,
            queue,
            command_pool,
        })
    }

    /// Pick the first physical device exposing every required extension
    /// together with a compute-capable transfer/graphics queue family
    unsafe fn select_device(instance: &ash::Instance) -> Option<(vk::PhysicalDevice, u32, String)> {
        let devices = instance.enumerate_physical_devices().ok()?;
        'devices: for pd in devices {
            let extensions = instance.enumerate_device_extension_properties(pd).ok()?;
            for required in REQUIRED_DEVICE_EXTENSIONS {
                let found = extensions
                    .iter()
                    .any(|e| CStr::from_ptr(e.extension_name.as_ptr()) == required);
                if !found {
                    continue 'devices;
                }
            }

            let families = instance.get_physical_device_queue_family_properties(pd);
            for (index, family) in families.iter().enumerate() {
                // The de-swizzle copy needs transfer, the tone mapping
                // dispatch needs compute.
                let usable = family.queue_flags.contains(vk::QueueFlags::COMPUTE)
                    && family
                        .queue_flags
                        .intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::TRANSFER);
                if usable {
                    let props = instance.get_physical_device_properties(pd);
                    let name = CStr::from_ptr(props.device_name.as_ptr())
                        .to_string_lossy()
                        .into_owned();
                    return Some((pd, index as u32, name));
                }
            }
        }
        None
    }

    fn memory_properties(&self) -> vk::PhysicalDeviceMemoryProperties {
        unsafe {
            self.instance
                .get_physical_device_memory_properties(self.physical_device)
        }
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// The tone mapping compute pipeline: two storage-image bindings and an
/// {exposure, mode} push-constant block
struct TonemapPipeline {
    device: ash::Device,
    set_layout: vk::DescriptorSetLayout,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    descriptor_pool: vk::DescriptorPool,
}

impl TonemapPipeline {
    fn new(ctx: &VulkanContext) -> Result<Self> {
        let device = ctx.device.clone();

        if HDR_TONEMAP_SPV.len() % 4 != 0 {
            return Err(CaptureError::gpu("embedded shader is not a SPIR-V stream"));
        }
        let code: Vec<u32> = HDR_TONEMAP_SPV
            .chunks_exact(4)
            .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        let shader_info = vk::ShaderModuleCreateInfo::default().code(&code);
        let shader = unsafe { device.create_shader_module(&shader_info, None) }
            .map_err(|e| vk_err("create shader module", e))?;

        // The module is only needed while the pipeline is built; release
        // it on every exit below.
        let result = Self::build(&device, shader);
        unsafe { device.destroy_shader_module(shader, None) };
        result.map(
            |(set_layout, pipeline_layout, pipeline, descriptor_pool)| Self {
                device,
                set_layout,
                pipeline_layout,
                pipeline,
                descriptor_pool,
            },
        )
    }

    fn build(
        device: &ash::Device,
        shader: vk::ShaderModule,
    ) -> Result<(
        vk::DescriptorSetLayout,
        vk::PipelineLayout,
        vk::Pipeline,
        vk::DescriptorPool,
    )> {
        let bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
            vk::DescriptorSetLayoutBinding::default()
                .binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE),
        ];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings);
        let set_layout = unsafe { device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| vk_err("create descriptor set layout", e))?;

        let push_range = vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::COMPUTE)
            .offset(0)
            .size(8); // f32 exposure + u32 mode
        let set_layouts = [set_layout];
        let push_ranges = [push_range];
        let pl_info = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_ranges);
        let pipeline_layout = match unsafe { device.create_pipeline_layout(&pl_info, None) } {
            Ok(l) => l,
            Err(e) => {
                unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
                return Err(vk_err("create pipeline layout", e));
            }
        };

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader)
            .name(c"main");
        let pipeline_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(pipeline_layout);
        let pipeline = match unsafe {
            device.create_compute_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
        } {
            Ok(pipelines) => pipelines[0],
            Err((_, e)) => {
                unsafe {
                    device.destroy_pipeline_layout(pipeline_layout, None);
                    device.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(vk_err("create compute pipeline", e));
            }
        };

        let pool_sizes = [vk::DescriptorPoolSize::default()
            .ty(vk::DescriptorType::STORAGE_IMAGE)
            .descriptor_count(2)];
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes);
        let descriptor_pool = match unsafe { device.create_descriptor_pool(&pool_info, None) } {
            Ok(p) => p,
            Err(e) => {
                unsafe {
                    device.destroy_pipeline(pipeline, None);
                    device.destroy_pipeline_layout(pipeline_layout, None);
                    device.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(vk_err("create descriptor pool", e));
            }
        };

        debug!("Tone mapping compute pipeline created");
        Ok((set_layout, pipeline_layout, pipeline, descriptor_pool))
    }

    /// Record and run the tone mapping dispatch from `input` (rgba16,
    /// linear HDR) to `output` (rgba8)
    fn dispatch(
        &self,
        ctx: &VulkanContext,
        input: vk::Image,
        output: vk::Image,
        width: u32,
        height: u32,
        settings: &ToneMapSettings,
    ) -> Result<()> {
        let device = &ctx.device;

        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.descriptor_pool)
            .set_layouts(std::slice::from_ref(&self.set_layout));
        let descriptor_set = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| vk_err("allocate descriptor set", e))?[0];

        // Image views live only for the duration of this dispatch
        let input_view = OwnedView::new(device, input, vk::Format::R16G16B16A16_UNORM)?;
        let output_view = OwnedView::new(device, output, vk::Format::R8G8B8A8_UNORM)?;

        let image_infos = [
            vk::DescriptorImageInfo::default()
                .image_layout(vk::ImageLayout::GENERAL)
                .image_view(input_view.view),
            vk::DescriptorImageInfo::default()
                .image_layout(vk::ImageLayout::GENERAL)
                .image_view(output_view.view),
        ];
        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(descriptor_set)
                .dst_binding(0)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(std::slice::from_ref(&image_infos[0])),
            vk::WriteDescriptorSet::default()
                .dst_set(descriptor_set)
                .dst_binding(1)
                .descriptor_type(vk::DescriptorType::STORAGE_IMAGE)
                .image_info(std::slice::from_ref(&image_infos[1])),
        ];
        unsafe { device.update_descriptor_sets(&writes, &[]) };

        let cmd = allocate_command_buffer(ctx)?;
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

        unsafe {
            device
                .begin_command_buffer(cmd, &begin_info)
                .map_err(|e| vk_err("begin command buffer", e))?;

            // Both images into GENERAL for the kernel; the input keeps
            // the texels the copy just wrote.
            let barriers = [
                image_barrier(
                    input,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::GENERAL,
                    vk::AccessFlags::TRANSFER_WRITE,
                    vk::AccessFlags::SHADER_READ,
                ),
                image_barrier(
                    output,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::GENERAL,
                    vk::AccessFlags::empty(),
                    vk::AccessFlags::SHADER_WRITE,
                ),
            ];
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &barriers,
            );

            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, self.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                self.pipeline_layout,
                0,
                &[descriptor_set],
                &[],
            );

            let mut push = [0u8; 8];
            push[..4].copy_from_slice(&settings.exposure.to_ne_bytes());
            push[4..].copy_from_slice(&settings.operator.mode().to_ne_bytes());
            device.cmd_push_constants(
                cmd,
                self.pipeline_layout,
                vk::ShaderStageFlags::COMPUTE,
                0,
                &push,
            );

            device.cmd_dispatch(cmd, width.div_ceil(16), height.div_ceil(16), 1);

            // Make the shader writes visible to the host read after the
            // queue idles
            let host_barrier = image_barrier(
                output,
                vk::ImageLayout::GENERAL,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::SHADER_WRITE,
                vk::AccessFlags::HOST_READ,
            );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[host_barrier],
            );

            device
                .end_command_buffer(cmd)
                .map_err(|e| vk_err("end command buffer", e))?;
        }

        let run = submit_and_wait(ctx, cmd);
        unsafe { device.free_command_buffers(ctx.command_pool, &[cmd]) };
        run?;

        info!(
            "Tone mapping applied: {}, exposure={:.2}",
            settings.operator, settings.exposure
        );
        Ok(())
    }
}

impl Drop for TonemapPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device
                .destroy_descriptor_pool(self.descriptor_pool, None);
            self.device.destroy_pipeline(self.pipeline, None);
            self.device
                .destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

/// An image view released at scope exit
struct OwnedView {
    device: ash::Device,
    view: vk::ImageView,
}

impl OwnedView {
    fn new(device: &ash::Device, image: vk::Image, format: vk::Format) -> Result<Self> {
        let info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(color_subresource_range());
        let view = unsafe { device.create_image_view(&info, None) }
            .map_err(|e| vk_err("create image view", e))?;
        Ok(Self {
            device: device.clone(),
            view,
        })
    }
}

impl Drop for OwnedView {
    fn drop(&mut self) {
        unsafe { self.device.destroy_image_view(self.view, None) };
    }
}

/// An image and its backing memory, released together at scope exit
struct OwnedImage {
    device: ash::Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
}

impl Drop for OwnedImage {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_image(self.image, None);
            self.device.free_memory(self.memory, None);
        }
    }
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

fn image_barrier(
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
    src_access: vk::AccessFlags,
    dst_access: vk::AccessFlags,
) -> vk::ImageMemoryBarrier<'static> {
    vk::ImageMemoryBarrier::default()
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(color_subresource_range())
        .src_access_mask(src_access)
        .dst_access_mask(dst_access)
}

fn allocate_command_buffer(ctx: &VulkanContext) -> Result<vk::CommandBuffer> {
    let info = vk::CommandBufferAllocateInfo::default()
        .command_pool(ctx.command_pool)
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_buffer_count(1);
    let buffers = unsafe { ctx.device.allocate_command_buffers(&info) }
        .map_err(|e| vk_err("allocate command buffer", e))?;
    Ok(buffers[0])
}

fn submit_and_wait(ctx: &VulkanContext, cmd: vk::CommandBuffer) -> Result<()> {
    let cmds = [cmd];
    let submit = vk::SubmitInfo::default().command_buffers(&cmds);
    unsafe {
        ctx.device
            .queue_submit(ctx.queue, &[submit], vk::Fence::null())
            .map_err(|e| vk_err("queue submit", e))?;
        ctx.device
            .queue_wait_idle(ctx.queue)
            .map_err(|e| vk_err("queue wait idle", e))
    }
}

/// First memory type allowed by `type_bits` that carries `required`
fn find_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    required: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0
            && props.memory_types[i as usize]
                .property_flags
                .contains(required)
    })
}

/// Create a linear image and bind freshly allocated memory to it
fn create_linear_image(
    ctx: &VulkanContext,
    format: vk::Format,
    width: u32,
    height: u32,
    usage: vk::ImageUsageFlags,
    memory_flags: vk::MemoryPropertyFlags,
) -> Result<OwnedImage> {
    let device = &ctx.device;
    let info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width,
            height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::LINEAR)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);
    let image =
        unsafe { device.create_image(&info, None) }.map_err(|e| vk_err("create linear image", e))?;

    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let props = ctx.memory_properties();
    let Some(memory_type) = find_memory_type(&props, requirements.memory_type_bits, memory_flags)
    else {
        unsafe { device.destroy_image(image, None) };
        return Err(CaptureError::gpu("no suitable memory type for linear image"));
    };

    let alloc = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type);
    let memory = match unsafe { device.allocate_memory(&alloc, None) } {
        Ok(m) => m,
        Err(e) => {
            unsafe { device.destroy_image(image, None) };
            return Err(vk_err("allocate linear image memory", e));
        }
    };
    if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
        unsafe {
            device.destroy_image(image, None);
            device.free_memory(memory, None);
        }
        return Err(vk_err("bind linear image memory", e));
    }

    Ok(OwnedImage {
        device: device.clone(),
        image,
        memory,
    })
}

/// Import the scanout dma-buf as an external image with the explicit
/// modifier layout declared by the framebuffer metadata
fn import_scanout_image(
    ctx: &VulkanContext,
    card: &DrmCard,
    fb: &FramebufferInfo,
    format: vk::Format,
    hdr: bool,
) -> Result<OwnedImage> {
    let device = &ctx.device;

    let dmabuf = card
        .buffer_to_prime_fd(fb.plane0_handle()?, libc::O_CLOEXEC as u32)
        .map_err(|e| {
            CaptureError::import(
                format!("export framebuffer {} as dma-buf: {e}", fb.id),
                e.raw_os_error().unwrap_or(-1),
            )
        })?;
    debug!("Exported framebuffer as dma-buf fd={}", dmabuf.as_raw_fd());

    let plane_layout = vk::SubresourceLayout {
        offset: u64::from(fb.offsets[0]),
        size: fb.plane0_size(),
        row_pitch: u64::from(fb.pitches[0]),
        array_pitch: 0,
        depth_pitch: 0,
    };
    let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
        .drm_format_modifier(fb.modifier)
        .plane_layouts(std::slice::from_ref(&plane_layout));
    let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
        .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

    let usage = if hdr {
        vk::ImageUsageFlags::TRANSFER_SRC | vk::ImageUsageFlags::STORAGE
    } else {
        vk::ImageUsageFlags::TRANSFER_SRC
    };
    let image_info = vk::ImageCreateInfo::default()
        .push_next(&mut modifier_info)
        .push_next(&mut external_info)
        .image_type(vk::ImageType::TYPE_2D)
        .format(format)
        .extent(vk::Extent3D {
            width: fb.width,
            height: fb.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
        .usage(usage)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe { device.create_image(&image_info, None) }
        .map_err(|e| vk_err("create external image", e))?;

    let requirements = unsafe { device.get_image_memory_requirements(image) };
    let props = ctx.memory_properties();
    let Some(memory_type) = find_memory_type(
        &props,
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::empty(),
    ) else {
        unsafe { device.destroy_image(image, None) };
        return Err(CaptureError::gpu("no memory type accepts the imported image"));
    };

    // A successful import hands FD ownership to the driver, so pass in a
    // duplicate and keep our descriptor to close normally.
    let import_fd = unsafe { libc::dup(dmabuf.as_raw_fd()) };
    if import_fd < 0 {
        unsafe { device.destroy_image(image, None) };
        return Err(CaptureError::import(
            "duplicate dma-buf descriptor",
            std::io::Error::last_os_error().raw_os_error().unwrap_or(-1),
        ));
    }

    let mut import_info = vk::ImportMemoryFdInfoKHR::default()
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
        .fd(import_fd);
    let alloc = vk::MemoryAllocateInfo::default()
        .push_next(&mut import_info)
        .allocation_size(requirements.size)
        .memory_type_index(memory_type);
    let memory = match unsafe { device.allocate_memory(&alloc, None) } {
        Ok(m) => m,
        Err(e) => {
            unsafe {
                libc::close(import_fd);
                device.destroy_image(image, None);
            }
            return Err(vk_err("import dma-buf memory", e));
        }
    };
    if let Err(e) = unsafe { device.bind_image_memory(image, memory, 0) } {
        unsafe {
            device.destroy_image(image, None);
            device.free_memory(memory, None);
        }
        return Err(vk_err("bind imported image memory", e));
    }

    debug!("Imported dma-buf as Vulkan image memory");
    Ok(OwnedImage {
        device: device.clone(),
        image,
        memory,
    })
}

/// Record the tiled→linear de-swizzle copy and wait for it
fn blit_to_linear(
    ctx: &VulkanContext,
    src: vk::Image,
    dst: vk::Image,
    width: u32,
    height: u32,
    hdr: bool,
) -> Result<()> {
    let device = &ctx.device;
    let cmd = allocate_command_buffer(ctx)?;
    let begin_info =
        vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);

    unsafe {
        device
            .begin_command_buffer(cmd, &begin_info)
            .map_err(|e| vk_err("begin command buffer", e))?;

        let barriers = [
            image_barrier(
                src,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_READ,
            ),
            image_barrier(
                dst,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
            ),
        ];
        device.cmd_pipeline_barrier(
            cmd,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::PipelineStageFlags::TRANSFER,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &barriers,
        );

        let region = vk::ImageCopy::default()
            .src_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1),
            )
            .dst_subresource(
                vk::ImageSubresourceLayers::default()
                    .aspect_mask(vk::ImageAspectFlags::COLOR)
                    .layer_count(1),
            )
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            });
        device.cmd_copy_image(
            cmd,
            src,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[region],
        );

        if !hdr {
            // The linear image is read by the host next
            let host_barrier = image_barrier(
                dst,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::GENERAL,
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::HOST_READ,
            );
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::HOST,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[host_barrier],
            );
        }

        device
            .end_command_buffer(cmd)
            .map_err(|e| vk_err("end command buffer", e))?;
    }

    let run = submit_and_wait(ctx, cmd);
    unsafe { device.free_command_buffers(ctx.command_pool, &[cmd]) };
    run
}

/// Read the final linear image back and convert it to RGB24
fn read_back(
    ctx: &VulkanContext,
    image: &OwnedImage,
    fb: &FramebufferInfo,
    convert_format: u32,
) -> Result<RgbRaster> {
    let device = &ctx.device;

    let subresource = vk::ImageSubresource::default().aspect_mask(vk::ImageAspectFlags::COLOR);
    let layout = unsafe { device.get_image_subresource_layout(image.image, subresource) };
    debug!(
        "Linear layout: offset={}, size={}, rowPitch={}",
        layout.offset, layout.size, layout.row_pitch
    );

    let ptr = unsafe {
        device.map_memory(
            image.memory,
            0,
            vk::WHOLE_SIZE,
            vk::MemoryMapFlags::empty(),
        )
    }
    .map_err(|e| vk_err("map readback memory", e))?;

    let mut raster = RgbRaster::new(fb.width, fb.height);
    let mapped = unsafe {
        std::slice::from_raw_parts(
            (ptr as *const u8).add(layout.offset as usize),
            layout.size as usize,
        )
    };
    formats::convert_to_rgb24(mapped, &mut raster, convert_format, layout.row_pitch as usize);

    unsafe { device.unmap_memory(image.memory) };
    Ok(raster)
}

/// Capture a (possibly tiled) framebuffer through Vulkan external-memory
/// import, de-swizzling on the GPU and tone mapping HDR sources
pub fn capture(card: &DrmCard, fb: &FramebufferInfo, settings: &ToneMapSettings) -> Result<RgbRaster> {
    let Some(src_format) = vk_format_for(fb.format) else {
        return Err(CaptureError::unsupported(format!(
            "format {} has no Vulkan equivalent",
            formats::format_name(fb.format)
        )));
    };
    let hdr = fb.is_hdr();

    let ctx = VulkanContext::new()?;
    debug!(
        "De-swizzling FB {}: {}x{}, format={}, modifier=0x{:016x}",
        fb.id,
        fb.width,
        fb.height,
        formats::format_name(fb.format),
        fb.modifier
    );

    let tonemap = if hdr {
        Some(TonemapPipeline::new(&ctx)?)
    } else {
        None
    };

    let src = import_scanout_image(&ctx, card, fb, src_format, hdr)?;

    if let Some(pipeline) = &tonemap {
        // Tiled HDR -> linear HDR -> tone-mapped 8-bit
        let linear_hdr = create_linear_image(
            &ctx,
            src_format,
            fb.width,
            fb.height,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::STORAGE,
            vk::MemoryPropertyFlags::empty(),
        )?;
        let output = create_linear_image(
            &ctx,
            vk::Format::R8G8B8A8_UNORM,
            fb.width,
            fb.height,
            vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )?;

        blit_to_linear(&ctx, src.image, linear_hdr.image, fb.width, fb.height, true)?;
        pipeline.dispatch(
            &ctx,
            linear_hdr.image,
            output.image,
            fb.width,
            fb.height,
            settings,
        )?;

        // The kernel writes R,G,B,A bytes in memory order
        read_back(&ctx, &output, fb, fourcc::ABGR8888)
    } else {
        let output = create_linear_image(
            &ctx,
            src_format,
            fb.width,
            fb.height,
            vk::ImageUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE,
        )?;

        blit_to_linear(&ctx, src.image, output.image, fb.width, fb.height, false)?;
        read_back(&ctx, &output, fb, fb.format)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vk_format_mapping() {
        assert_eq!(
            vk_format_for(fourcc::ABGR16161616),
            Some(vk::Format::R16G16B16A16_UNORM)
        );
        assert_eq!(
            vk_format_for(fourcc::XRGB8888),
            Some(vk::Format::B8G8R8A8_UNORM)
        );
        assert_eq!(
            vk_format_for(fourcc::ABGR8888),
            Some(vk::Format::R8G8B8A8_UNORM)
        );
        assert_eq!(vk_format_for(fourcc::RGB565), None);
    }

    #[test]
    fn test_embedded_shader_is_spirv() {
        // Word stream with the SPIR-V magic number
        assert_eq!(HDR_TONEMAP_SPV.len() % 4, 0);
        let magic = u32::from_le_bytes(HDR_TONEMAP_SPV[..4].try_into().unwrap());
        assert_eq!(magic, 0x0723_0203);
    }

    #[test]
    fn test_push_constant_block_size() {
        // exposure: f32, mode: u32
        assert_eq!(
            std::mem::size_of::<f32>() + std::mem::size_of::<u32>(),
            8
        );
    }
}
