#![allow(clippy::missing_safety_doc)]

// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Small Vulkan helpers shared by the dma-buf import and composite-pipeline
//! modules. Unlike a normal application's `VkContext`, there's no instance
//! or device creation here - this layer is handed already-created handles
//! by the app via the functions it intercepts (`vkCreateInstance`,
//! `vkCreateDevice`), and only ever wraps them (see `crate::dispatch` and
//! `crate::state`). What's left is the same grab-bag of "do a Vulkan thing
//! in three lines instead of fifteen" helpers a first-party renderer would
//! also want.

use anyhow::Context;
use ash::vk;

pub fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0 && props.memory_types[i as usize].property_flags.contains(flags)
    })
}

pub fn create_command_buffer(device: &ash::Device, pool: vk::CommandPool) -> anyhow::Result<vk::CommandBuffer> {
    let create_info = vk::CommandBufferAllocateInfo::default()
        .level(vk::CommandBufferLevel::PRIMARY)
        .command_pool(pool)
        .command_buffer_count(1);

    let cb = unsafe {
        device
            .allocate_command_buffers(&create_info)
            .context("failed to allocate command buffer")?
            .pop()
            .unwrap()
    };

    Ok(cb)
}

pub unsafe fn bind_memory_for_image(
    device: &ash::Device,
    props: &vk::PhysicalDeviceMemoryProperties,
    image: vk::Image,
    flags: vk::MemoryPropertyFlags,
) -> anyhow::Result<vk::DeviceMemory> {
    let requirements = device.get_image_memory_requirements(image);

    let mem_type_index = select_memory_type(props, requirements.memory_type_bits, flags)
        .with_context(|| format!("no appropriate memory type for reqs: {:?}", requirements))?;

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(mem_type_index);

    let memory = device.allocate_memory(&alloc_info, None).context("VkAllocateMemory")?;
    device.bind_image_memory(image, memory, 0).context("VkBindImageMemory")?;

    Ok(memory)
}

pub unsafe fn create_image_view(
    device: &ash::Device,
    image: vk::Image,
    format: vk::Format,
) -> anyhow::Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    device.create_image_view(&create_info, None).context("VkCreateImageView")
}

pub fn create_fence(device: &ash::Device, signalled: bool) -> Result<vk::Fence, vk::Result> {
    let mut create_info = vk::FenceCreateInfo::default();
    if signalled {
        create_info = create_info.flags(vk::FenceCreateFlags::SIGNALED);
    }

    unsafe { device.create_fence(&create_info, None) }
}

pub fn create_semaphore(device: &ash::Device) -> Result<vk::Semaphore, vk::Result> {
    unsafe { device.create_semaphore(&vk::SemaphoreCreateInfo::default(), None) }
}

/// A semaphore whose signal can be exported as a sync-file fd, for the
/// "optionally signal a new export semaphore" step of the per-present
/// sequence.
pub fn create_exportable_semaphore(device: &ash::Device) -> Result<vk::Semaphore, vk::Result> {
    let mut export_info =
        vk::ExportSemaphoreCreateInfo::default().handle_types(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut export_info);

    unsafe { device.create_semaphore(&create_info, None) }
}

pub fn load_shader(device: &ash::Device, bytes: &[u8]) -> anyhow::Result<vk::ShaderModule> {
    let code = ash::util::read_spv(&mut std::io::Cursor::new(bytes))?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

    Ok(unsafe { device.create_shader_module(&create_info, None)? })
}

#[allow(clippy::too_many_arguments)]
pub unsafe fn cmd_image_barrier(
    device: &ash::Device,
    command_buffer: vk::CommandBuffer,
    image: vk::Image,
    src_stage_mask: vk::PipelineStageFlags,
    src_access_mask: vk::AccessFlags,
    dst_stage_mask: vk::PipelineStageFlags,
    dst_access_mask: vk::AccessFlags,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::default()
        .src_access_mask(src_access_mask)
        .dst_access_mask(dst_access_mask)
        .old_layout(old_layout)
        .new_layout(new_layout)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    device.cmd_pipeline_barrier(
        command_buffer,
        src_stage_mask,
        dst_stage_mask,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

/// Finds a memory type usable both for this image's own requirements and
/// for the dma-buf fd being imported into it, per
/// `VkMemoryFdPropertiesKHR::memoryTypeBits` intersected with the image's
/// own `memoryTypeBits` - the "Import lifecycle" memory-type rule.
pub fn select_import_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    image_requirements: vk::MemoryRequirements,
    fd_properties: vk::MemoryFdPropertiesKHR,
) -> Option<u32> {
    let combined_bits = image_requirements.memory_type_bits & fd_properties.memory_type_bits;
    select_memory_type(props, combined_bits, vk::MemoryPropertyFlags::DEVICE_LOCAL)
}

/// Byte width of a push-constant block: dest rect, src rect, pixel offset,
/// and a transfer-function selector, matching the composite pipeline's
/// fragment shader layout.
#[repr(C)]
#[derive(Copy, Clone, Default)]
pub struct CompositePushConstants {
    pub dst_extent: [f32; 2],
    pub src_extent: [f32; 2],
    pub pixel_offset: [f32; 2],
    pub transfer_function: u32,
    pub _pad: u32,
}

impl CompositePushConstants {
    pub fn as_bytes(&self) -> &[u8] {
        unsafe {
            std::slice::from_raw_parts(self as *const Self as *const u8, std::mem::size_of::<Self>())
        }
    }
}

/// Maps a format/color-space pair to the composite shader's transfer
/// function constant. The cache image is always a plain 8-bit sRGB render
/// target on this layer's side (see `crate::swapchain`), so in practice this
/// only ever selects `0` (sRGB) today; the enum exists so a future HDR swap
/// surface isn't a breaking change to the push-constant layout.
pub fn transfer_function_for(format: vk::Format) -> u32 {
    match format {
        vk::Format::B8G8R8A8_SRGB | vk::Format::R8G8B8A8_SRGB => 0,
        _ => 0,
    }
}
