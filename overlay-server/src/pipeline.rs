// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! The per-client GPU pipeline: draws the current metrics table with ImGui
//! into a device-local render target, then copies it out to a DMA-BUF-backed
//! export image (when available) and an opaque-fd export image (always, as
//! the compatibility fallback the client falls back to when it can't import
//! by DRM format modifier). One of these exists per connected client, all
//! sharing a single [`VkContext`] / render device. The three-image split
//! (`src` / `dmabuf` / `opaque`) mirrors the per-client resource struct this
//! was distilled from.

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::sync::Arc;

use anyhow::{Context, Result};
use ash::vk;
use drm_fourcc::{DrmFourcc, DrmModifier};

use crate::{
    gbm_alloc::{self, GbmBuffer},
    hud::HudTable,
    vulkan::{drm::DrmDevice, VkContext},
};

const FORMAT: vk::Format = vk::Format::B8G8R8A8_SRGB;
const FOURCC: DrmFourcc = DrmFourcc::Argb8888;

/// A placeholder FD sent in the dma-buf slot of a `Dmabuf` message when GBM
/// allocation failed, so the message keeps its fixed two-FD arity.
pub fn placeholder_fd() -> Result<OwnedFd> {
    std::fs::File::open("/dev/null")
        .map(OwnedFd::from)
        .context("opening /dev/null for placeholder fd")
}

struct TargetImage {
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: Option<vk::ImageView>,
}

/// The GBM-backed export target, present only when the render node supports
/// DMA-BUF export with a usable modifier.
struct DmabufTarget {
    target: TargetImage,
    gbm: GbmBuffer,
}

/// The always-present opaque-fd export target.
struct OpaqueTarget {
    target: TargetImage,
    fd: OwnedFd,
    size: u64,
}

pub struct ClientPipeline {
    vk: Arc<VkContext>,
    width: u32,
    height: u32,

    src: TargetImage,
    dmabuf: Option<DmabufTarget>,
    opaque: OpaqueTarget,

    imgui: imgui::Context,
    imgui_renderer: imgui_rs_vulkan_renderer::Renderer,

    command_buffer: vk::CommandBuffer,
    submit_fence: vk::Fence,
}

/// Everything a client needs to import the current export targets, handed
/// back to the caller so it can be relayed as a `Dmabuf` message. The
/// dma-buf fields are zeroed and `has_gbm` is false when GBM allocation
/// failed on this device.
pub struct ExportDescriptor {
    pub has_gbm: bool,
    pub fourcc: u32,
    pub modifier: u64,
    pub stride: u32,
    pub dmabuf_offset: u32,
    pub plane_size: u64,
    pub dmabuf_fd: OwnedFd,
    pub opaque_fd: OwnedFd,
    pub opaque_size: u64,
    pub opaque_offset: u32,
    pub width: u32,
    pub height: u32,
}

impl ClientPipeline {
    pub fn new(
        vk: Arc<VkContext>,
        drm: DrmDevice,
        width: u32,
        height: u32,
        modifiers: &[DrmModifier],
    ) -> Result<Self> {
        let src = create_render_target(&vk, width, height)?;
        let opaque = create_opaque_target(&vk, width, height)?;
        let dmabuf = match gbm_alloc::allocate(drm, width, height, FOURCC, modifiers) {
            Ok(gbm) => match create_dmabuf_target(&vk, &gbm) {
                Ok(target) => Some(DmabufTarget { target, gbm }),
                Err(e) => {
                    tracing::warn!("dma-buf image import failed, falling back to opaque fd: {e:#}");
                    None
                }
            },
            Err(e) => {
                tracing::warn!("gbm allocation failed, falling back to opaque fd: {e:#}");
                None
            }
        };

        let mut imgui = imgui::Context::create();
        imgui.set_ini_filename(None);
        imgui.io_mut().display_size = [width as f32, height as f32];

        let mut imgui_renderer = imgui_rs_vulkan_renderer::Renderer::with_default_allocator(
            &vk.instance,
            vk.device_info.pdevice,
            vk.device.clone(),
            vk.graphics_queue.queue,
            vk.graphics_queue.command_pool,
            imgui_rs_vulkan_renderer::DynamicRendering {
                color_attachment_format: FORMAT,
                depth_attachment_format: None,
            },
            &mut imgui,
            Some(imgui_rs_vulkan_renderer::Options {
                in_flight_frames: 1,
                ..Default::default()
            }),
        )?;

        imgui_renderer.update_fonts_texture(
            vk.graphics_queue.queue,
            vk.graphics_queue.command_pool,
            &mut imgui,
        )?;

        let command_buffer = unsafe {
            let alloc_info = vk::CommandBufferAllocateInfo::default()
                .command_pool(vk.graphics_queue.command_pool)
                .level(vk::CommandBufferLevel::PRIMARY)
                .command_buffer_count(1);

            vk.device.allocate_command_buffers(&alloc_info)?[0]
        };

        let submit_fence = unsafe {
            vk.device
                .create_fence(&vk::FenceCreateInfo::default().flags(vk::FenceCreateFlags::SIGNALED), None)?
        };

        Ok(Self {
            vk,
            width,
            height,
            src,
            dmabuf,
            opaque,
            imgui,
            imgui_renderer,
            command_buffer,
            submit_fence,
        })
    }

    /// Draws one frame of the HUD into `src`, then copies it into the
    /// dma-buf target (if any) and the opaque target, and exports a
    /// sync-file fence signaled once both copies finish. Never blocks on the
    /// GPU: the fence is handed off immediately after submission, matching
    /// the non-blocking contract in `sync_file.rs`.
    ///
    /// Returns the fence fd alongside the auto-fit content size ImGui
    /// computed while drawing this frame, so the caller can detect "the
    /// table no longer fits the current canvas" and call `resize()` before
    /// the next tick.
    pub fn render_tick(&mut self, table: &HudTable, font_size: u32) -> Result<(OwnedFd, (u32, u32))> {
        let device = &self.vk.device;

        unsafe {
            device.wait_for_fences(&[self.submit_fence], true, u64::MAX)?;
            device.reset_fences(&[self.submit_fence])?;

            device.reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;
            device.begin_command_buffer(
                self.command_buffer,
                &vk::CommandBufferBeginInfo::default()
                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )?;
        }

        self.imgui.io_mut().display_size = [self.width as f32, self.height as f32];
        self.imgui.io_mut().font_global_scale = font_size as f32 / 13.0;

        let ui = self.imgui.new_frame();
        let fit_size = crate::hud_widget::draw(ui, table);
        let draw_data = self.imgui.render();

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(self.src.view.expect("src image always has a view"))
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: [0.0, 0.0, 0.0, 0.0],
                },
            });

        let attachments = [color_attachment];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent: vk::Extent2D {
                    width: self.width,
                    height: self.height,
                },
            })
            .layer_count(1)
            .color_attachments(&attachments);

        unsafe {
            transition_image(
                device,
                self.command_buffer,
                self.src.image,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            );

            device.cmd_begin_rendering(self.command_buffer, &rendering_info);
            self.imgui_renderer.cmd_draw(self.command_buffer, draw_data)?;
            device.cmd_end_rendering(self.command_buffer);

            transition_image(
                device,
                self.command_buffer,
                self.src.image,
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            );

            self.copy_src_into(self.opaque.target.image);
            if let Some(dmabuf) = &self.dmabuf {
                self.copy_src_into(dmabuf.target.image);
            }

            transition_image(
                device,
                self.command_buffer,
                self.src.image,
                vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                vk::ImageLayout::UNDEFINED,
            );

            device.end_command_buffer(self.command_buffer)?;
        }

        let sync_fd_semaphore = create_sync_fd_semaphore(&self.vk)?;

        let command_buffers = [self.command_buffer];
        let signal_semaphores = [sync_fd_semaphore];
        let submit_info = vk::SubmitInfo::default()
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.vk
                .device
                .queue_submit(self.vk.graphics_queue.queue, &[submit_info], self.submit_fence)?;
        }

        let fd = unsafe {
            self.vk
                .external_semaphore_fd_loader
                .get_semaphore_fd(
                    &vk::SemaphoreGetFdInfoKHR::default()
                        .semaphore(sync_fd_semaphore)
                        .handle_type(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD),
                )
                .context("exporting sync file")?
        };

        // sync_fd export consumes the semaphore; the driver now owns it.
        unsafe { self.vk.device.destroy_semaphore(sync_fd_semaphore, None) };

        let fit_extent = (fit_size[0].ceil().max(1.0) as u32, fit_size[1].ceil().max(1.0) as u32);

        Ok((unsafe { OwnedFd::from_raw_fd(fd) }, fit_extent))
    }

    unsafe fn copy_src_into(&self, dst: vk::Image) {
        let device = &self.vk.device;

        transition_image(
            device,
            self.command_buffer,
            dst,
            vk::ImageLayout::UNDEFINED,
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
            .extent(vk::Extent3D {
                width: self.width,
                height: self.height,
                depth: 1,
            });

        device.cmd_copy_image(
            self.command_buffer,
            self.src.image,
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            &[copy],
        );

        // GENERAL, not SHADER_READ_ONLY_OPTIMAL: this image crosses a process
        // boundary via dma-buf/opaque fd, so it can't carry a producer-side
        // layout assumption the importing instance has no way to honor.
        transition_image(
            device,
            self.command_buffer,
            dst,
            vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            vk::ImageLayout::GENERAL,
        );
    }

    /// Rebuilds every target at a new size, called when `reinit_dmabuf`
    /// fires (the overlay's content extent changed - a config reload that
    /// changes the table shape or font size). The caller must send a fresh
    /// `Dmabuf` message afterward.
    pub fn resize(&mut self, drm: DrmDevice, width: u32, height: u32, modifiers: &[DrmModifier]) -> Result<()> {
        unsafe { self.vk.device.device_wait_idle()? };

        self.destroy_targets();

        self.src = create_render_target(&self.vk, width, height)?;
        self.opaque = create_opaque_target(&self.vk, width, height)?;
        self.dmabuf = match gbm_alloc::allocate(drm, width, height, FOURCC, modifiers) {
            Ok(gbm) => match create_dmabuf_target(&self.vk, &gbm) {
                Ok(target) => Some(DmabufTarget { target, gbm }),
                Err(_) => None,
            },
            Err(_) => None,
        };

        self.width = width;
        self.height = height;

        Ok(())
    }

    /// Describes the current export targets, duplicating the backing fd(s)
    /// so they can be sent to the client independently of this pipeline's
    /// own lifetime.
    pub fn export_descriptor(&self) -> Result<ExportDescriptor> {
        let opaque_fd = self.opaque.fd.try_clone().context("duplicating opaque fd")?;

        match &self.dmabuf {
            Some(dmabuf) => Ok(ExportDescriptor {
                has_gbm: true,
                fourcc: dmabuf.gbm.fourcc,
                modifier: dmabuf.gbm.modifier,
                stride: dmabuf.gbm.stride,
                dmabuf_offset: dmabuf.gbm.offset,
                plane_size: dmabuf.gbm.plane_size,
                dmabuf_fd: dmabuf.gbm.fd.try_clone().context("duplicating dma-buf fd")?,
                opaque_fd,
                opaque_size: self.opaque.size,
                opaque_offset: 0,
                width: self.width,
                height: self.height,
            }),
            None => Ok(ExportDescriptor {
                has_gbm: false,
                fourcc: 0,
                modifier: 0,
                stride: 0,
                dmabuf_offset: 0,
                plane_size: 0,
                dmabuf_fd: placeholder_fd()?,
                opaque_fd,
                opaque_size: self.opaque.size,
                opaque_offset: 0,
                width: self.width,
                height: self.height,
            }),
        }
    }

    fn destroy_targets(&mut self) {
        unsafe {
            destroy_target(&self.vk, &mut self.src);
            destroy_target(&self.vk, &mut self.opaque.target);
            if let Some(dmabuf) = &mut self.dmabuf {
                destroy_target(&self.vk, &mut dmabuf.target);
            }
        }
    }
}

impl Drop for ClientPipeline {
    fn drop(&mut self) {
        unsafe {
            self.vk.device.device_wait_idle().ok();
            self.vk.device.destroy_fence(self.submit_fence, None);
        }
        self.destroy_targets();
    }
}

unsafe fn destroy_target(vk: &VkContext, target: &mut TargetImage) {
    if let Some(view) = target.view.take() {
        vk.device.destroy_image_view(view, None);
    }
    vk.device.destroy_image(target.image, None);
    vk.device.free_memory(target.memory, None);
}

unsafe fn transition_image(
    device: &ash::Device,
    cb: vk::CommandBuffer,
    image: vk::Image,
    old_layout: vk::ImageLayout,
    new_layout: vk::ImageLayout,
) {
    let barrier = vk::ImageMemoryBarrier::default()
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
        })
        .src_access_mask(access_mask_for(old_layout))
        .dst_access_mask(access_mask_for(new_layout));

    device.cmd_pipeline_barrier(
        cb,
        vk::PipelineStageFlags::ALL_COMMANDS,
        vk::PipelineStageFlags::ALL_COMMANDS,
        vk::DependencyFlags::empty(),
        &[],
        &[],
        &[barrier],
    );
}

fn access_mask_for(layout: vk::ImageLayout) -> vk::AccessFlags {
    match layout {
        vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL => vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
        vk::ImageLayout::TRANSFER_SRC_OPTIMAL => vk::AccessFlags::TRANSFER_READ,
        vk::ImageLayout::TRANSFER_DST_OPTIMAL => vk::AccessFlags::TRANSFER_WRITE,
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => vk::AccessFlags::SHADER_READ,
        _ => vk::AccessFlags::empty(),
    }
}

fn create_sync_fd_semaphore(vk: &VkContext) -> Result<vk::Semaphore> {
    let mut export_info =
        vk::ExportSemaphoreCreateInfo::default().handle_types(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD);
    let create_info = vk::SemaphoreCreateInfo::default().push_next(&mut export_info);

    Ok(unsafe { vk.device.create_semaphore(&create_info, None)? })
}

fn create_render_target(vk: &VkContext, width: u32, height: u32) -> Result<TargetImage> {
    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(FORMAT)
        .extent(vk::Extent3D { width, height, depth: 1 })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_SRC)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED);

    let image = unsafe { vk.device.create_image(&create_info, None)? };
    let requirements = unsafe { vk.device.get_image_memory_requirements(image) };
    let memory_type = select_memory_type(
        &vk.device_info.memory_props,
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .context("no suitable memory type for render target")?;

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type);

    let memory = unsafe { vk.device.allocate_memory(&alloc_info, None)? };
    unsafe { vk.device.bind_image_memory(image, memory, 0)? };

    let view = create_view(vk, image)?;

    Ok(TargetImage {
        image,
        memory,
        view: Some(view),
    })
}

fn create_dmabuf_target(vk: &VkContext, gbm: &GbmBuffer) -> Result<TargetImage> {
    let plane_layout = [vk::SubresourceLayout {
        offset: gbm.offset as u64,
        size: gbm.plane_size,
        row_pitch: gbm.stride as u64,
        array_pitch: 0,
        depth_pitch: 0,
    }];

    let mut modifier_info = vk::ImageDrmFormatModifierExplicitCreateInfoEXT::default()
        .drm_format_modifier(gbm.modifier)
        .plane_layouts(&plane_layout);
    let mut external_info =
        vk::ExternalMemoryImageCreateInfo::default().handle_types(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT);

    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(FORMAT)
        .extent(vk::Extent3D {
            width: gbm.width,
            height: gbm.height,
            depth: 1,
        })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::DRM_FORMAT_MODIFIER_EXT)
        .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .push_next(&mut modifier_info)
        .push_next(&mut external_info);

    let image = unsafe { vk.device.create_image(&create_info, None)? };

    let dup_fd = gbm.fd.try_clone().context("duplicating dma-buf fd for import")?;
    let requirements = unsafe { vk.device.get_image_memory_requirements(image) };
    let memory_type = select_memory_type(
        &vk.device_info.memory_props,
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .context("no suitable memory type for dma-buf import")?;

    let mut import_info = vk::ImportMemoryFdInfoKHR::default()
        .handle_type(vk::ExternalMemoryHandleTypeFlags::DMA_BUF_EXT)
        .fd(dup_fd.as_raw_fd());

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type)
        .push_next(&mut import_info);

    let memory = unsafe { vk.device.allocate_memory(&alloc_info, None)? };
    // The driver now owns the fd; forget ours so we don't double-close it.
    std::mem::forget(dup_fd);

    unsafe { vk.device.bind_image_memory(image, memory, 0)? };

    // No sampled view needed server-side; the client builds its own view
    // after importing this memory. We only ever copy into this image.
    Ok(TargetImage {
        image,
        memory,
        view: None,
    })
}

fn create_opaque_target(vk: &VkContext, width: u32, height: u32) -> Result<OpaqueTarget> {
    let mut external_info =
        vk::ExternalMemoryImageCreateInfo::default().handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);

    let create_info = vk::ImageCreateInfo::default()
        .image_type(vk::ImageType::TYPE_2D)
        .format(FORMAT)
        .extent(vk::Extent3D { width, height, depth: 1 })
        .mip_levels(1)
        .array_layers(1)
        .samples(vk::SampleCountFlags::TYPE_1)
        .tiling(vk::ImageTiling::OPTIMAL)
        .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
        .sharing_mode(vk::SharingMode::EXCLUSIVE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .push_next(&mut external_info);

    let image = unsafe { vk.device.create_image(&create_info, None)? };
    let requirements = unsafe { vk.device.get_image_memory_requirements(image) };
    let memory_type = select_memory_type(
        &vk.device_info.memory_props,
        requirements.memory_type_bits,
        vk::MemoryPropertyFlags::DEVICE_LOCAL,
    )
    .context("no suitable memory type for opaque image")?;

    let mut export_info =
        vk::ExportMemoryAllocateInfo::default().handle_types(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD);

    let alloc_info = vk::MemoryAllocateInfo::default()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type)
        .push_next(&mut export_info);

    let memory = unsafe { vk.device.allocate_memory(&alloc_info, None)? };
    unsafe { vk.device.bind_image_memory(image, memory, 0)? };

    let fd = unsafe {
        vk.external_mem_loader.get_memory_fd(
            &vk::MemoryGetFdInfoKHR::default()
                .memory(memory)
                .handle_type(vk::ExternalMemoryHandleTypeFlags::OPAQUE_FD),
        )?
    };

    let view = create_view(vk, image)?;

    Ok(OpaqueTarget {
        target: TargetImage {
            image,
            memory,
            view: Some(view),
        },
        fd: unsafe { OwnedFd::from_raw_fd(fd) },
        size: requirements.size,
    })
}

fn create_view(vk: &VkContext, image: vk::Image) -> Result<vk::ImageView> {
    let create_info = vk::ImageViewCreateInfo::default()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(FORMAT)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    Ok(unsafe { vk.device.create_image_view(&create_info, None)? })
}

fn select_memory_type(
    props: &vk::PhysicalDeviceMemoryProperties,
    type_bits: u32,
    flags: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..props.memory_type_count).find(|&i| {
        (type_bits & (1 << i)) != 0 && props.memory_types[i as usize].property_flags.contains(flags)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn placeholder_fd_opens_successfully() {
        let fd = placeholder_fd().expect("/dev/null should always be openable");
        assert!(fd.as_raw_fd() > 0);
    }
}
