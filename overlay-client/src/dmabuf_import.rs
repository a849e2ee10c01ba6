// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Import lifecycle: turns a [`crate::conn::DmabufDescriptor`] into a
//! sampled Vulkan image with an explicit DRM format modifier, plus a
//! device-local "cache" image the composite pipeline actually samples from.
//! The two-image split mirrors the server's own `src`/export split in
//! `pipeline.rs`, just run in reverse - there, the HUD is drawn into `src`
//! and copied out to the export targets; here, the export target is
//! imported and copied into the cache image the composite pass reads.

use std::os::fd::AsRawFd;

use anyhow::Context;
use ash::vk;

use crate::{
    conn::DmabufDescriptor,
    error::HudError,
    vulkan::{bind_memory_for_image, cmd_image_barrier, create_image_view, select_import_memory_type},
};

const CACHE_FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;

/// The imported dma-buf image plus the cache image the composite pipeline
/// reads from, and the views/layout bookkeeping needed to keep both
/// correctly synchronized across frames.
pub struct DmabufImport {
    pub generation: u64,
    pub width: u32,
    pub height: u32,

    imported_image: vk::Image,
    imported_memory: vk::DeviceMemory,

    cache_image: vk::Image,
    cache_memory: vk::DeviceMemory,
    pub cache_view: vk::ImageView,

    /// Whether the cache image has been populated (copied into) at least
    /// once since import. Sampling before this is set would read garbage.
    pub layout_ready: bool,
}

impl DmabufImport {
    /// Imports `descriptor` on `device`, using `instance`/`pdevice` to query
    /// `VkMemoryFdPropertiesKHR` for the intersection memory-type rule.
    pub unsafe fn import(
        instance: &ash::Instance,
        device: &ash::Device,
        pdevice: vk::PhysicalDevice,
        external_memory_fd: &ash::extensions::khr::ExternalMemoryFd,
        descriptor: &DmabufDescriptor,
    ) -> anyhow::Result<Self> {
        let memory_props = instance.get_physical_device_memory_properties(pdevice);

        let plane_layout = [vk::SubresourceLayout {
            offset: descriptor.dmabuf_offset as u64,
            size: descriptor.plane_size,
            row_pitch: descriptor.stride as u64,
            array_pitch: 0,
            depth_pitch: 0,
        }];

        let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
            .drm_format_modifier(descriptor.modifier)
            .plane_layouts(&plane_layout);
        let mut external_info = vk::ExternalMemoryImageCreateInfo::default()
            .handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

        let create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(CACHE_FORMAT)
            .extent(vk::Extent3D { width: descriptor.width, height: descriptor.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
            .usage(vk::ImageUsageFlags::TRANSFER_SRC)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .push_next(&mut modifier_info)
            .push_next(&mut external_info);

        let imported_image = device.create_image(&create_info, None).context("VkCreateImage for import")?;

        let requirements = device.get_image_memory_requirements(imported_image);

        let dup_fd = descriptor.dmabuf_fd.try_clone().map_err(HudError::FDDupFailed)?;

        let fd_properties = {
            let mut props = vk::MemoryFdPropertiesKHR::default();
            external_memory_fd
                .get_memory_fd_properties(
                    vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT,
                    dup_fd.as_raw_fd(),
                    &mut props,
                )
                .context("VkGetMemoryFdPropertiesKHR")?;
            props
        };

        let mem_type_index = select_import_memory_type(&memory_props, requirements, fd_properties).ok_or_else(|| {
            HudError::DeviceUnsuitable("no memory type satisfies both the image and the dma-buf fd".into())
        })?;

        let mut import_info = vk::ImportMemoryFdInfoKHR::default()
            .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
            .fd(dup_fd.as_raw_fd());

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(mem_type_index)
            .push_next(&mut import_info);

        let imported_memory = device.allocate_memory(&alloc_info, None).context("VkAllocateMemory for import")?;
        // The driver now owns the fd.
        std::mem::forget(dup_fd);

        device
            .bind_image_memory(imported_image, imported_memory, 0)
            .context("VkBindImageMemory for import")?;

        let cache_create_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(CACHE_FORMAT)
            .extent(vk::Extent3D { width: descriptor.width, height: descriptor.height, depth: 1 })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let cache_image = device.create_image(&cache_create_info, None).context("VkCreateImage for cache")?;
        let cache_memory = bind_memory_for_image(device, &memory_props, cache_image, vk::MemoryPropertyFlags::DEVICE_LOCAL)
            .context("binding cache image memory")?;
        let cache_view = create_image_view(device, cache_image, CACHE_FORMAT).context("creating cache image view")?;

        Ok(Self {
            generation: descriptor.generation,
            width: descriptor.width,
            height: descriptor.height,
            imported_image,
            imported_memory,
            cache_image,
            cache_memory,
            cache_view,
            layout_ready: false,
        })
    }

    /// Records the copy from the imported image into the cache image, with
    /// the layout transitions the "ensure pipeline/command resources" step
    /// of the per-present sequence requires. Call once per frame before
    /// sampling `cache_view`.
    pub unsafe fn cmd_refresh_cache(&mut self, device: &ash::Device, command_buffer: vk::CommandBuffer) {
        let imported_old_layout = if self.layout_ready {
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        } else {
            vk::ImageLayout::UNDEFINED
        };
        let cache_old_layout = if self.layout_ready {
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        } else {
            vk::ImageLayout::UNDEFINED
        };

        cmd_image_barrier(
            device,
            command_buffer,
            self.imported_image,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_READ,
            imported_old_layout,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        );

        cmd_image_barrier(
            device,
            command_buffer,
            self.cache_image,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            cache_old_layout,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        );

        let copy = vk::ImageCopy::default()
            .src_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .dst_subresource(vk::ImageSubresourceLayers {
                aspect_mask: vk::ImageAspectFlags::COLOR,
                mip_level: 0,
                base_array_layer: 0,
                layer_count: 1,
            })
            .extent(vk::Extent3D { width: self.width, height: self.height, depth: 1 });

        device.cmd_copy_image(
            command_buffer,
            self.imported_image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            self.cache_image,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[copy],
        );

        cmd_image_barrier(
            device,
            command_buffer,
            self.cache_image,
            vk::PipelineStageFlags::TRANSFER,
            vk::AccessFlags::TRANSFER_WRITE,
            vk::PipelineStageFlags::FRAGMENT_SHADER,
            vk::AccessFlags::SHADER_READ,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        );

        self.layout_ready = true;
    }

    /// Tears down both images. Called on resize/format-change, and the
    /// caller must have waited for the device to go idle first - this
    /// struct has no fence of its own to check.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_image_view(self.cache_view, None);
        device.destroy_image(self.cache_image, None);
        device.free_memory(self.cache_memory, None);
        device.destroy_image(self.imported_image, None);
        device.free_memory(self.imported_memory, None);
    }
}
