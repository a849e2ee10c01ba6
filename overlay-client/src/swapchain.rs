// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Per-swapchain overlay state: the composite pipeline that draws the
//! imported HUD cache image as a full-screen quad over the application's
//! own swapchain images, and the per-present sequence that rebuilds it,
//! records it, and rewrites the app's `VkPresentInfoKHR` wait list so the
//! overlay's own completion gates the actual present.

use std::os::fd::{AsRawFd, OwnedFd};

use anyhow::Context;
use ash::vk;

use crate::{
    conn::Connection,
    dmabuf_import::DmabufImport,
    error::HudError,
    sync_file,
    vulkan::{create_command_buffer, create_exportable_semaphore, create_fence, create_semaphore, load_shader, transfer_function_for, CompositePushConstants},
};

const VERT_SHADER: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/shaders/composite.vert.spv"));
const FRAG_SHADER: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/shaders/composite.frag.spv"));

struct CompositePipeline {
    descriptor_set_layout: vk::DescriptorSetLayout,
    descriptor_pool: vk::DescriptorPool,
    descriptor_set: vk::DescriptorSet,
    pipeline_layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    sampler: vk::Sampler,
    color_format: vk::Format,
}

impl CompositePipeline {
    unsafe fn new(device: &ash::Device, color_format: vk::Format) -> anyhow::Result<Self> {
        let sampler = device
            .create_sampler(
                &vk::SamplerCreateInfo::default()
                    .mag_filter(vk::Filter::NEAREST)
                    .min_filter(vk::Filter::NEAREST)
                    .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
                    .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
                    .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE),
                None,
            )
            .context("VkCreateSampler")?;

        let bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)];

        let descriptor_set_layout = device
            .create_descriptor_set_layout(&vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings), None)
            .context("VkCreateDescriptorSetLayout")?;

        let pool_sizes = [vk::DescriptorPoolSize {
            ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            descriptor_count: 1,
        }];
        let descriptor_pool = device
            .create_descriptor_pool(
                &vk::DescriptorPoolCreateInfo::default().pool_sizes(&pool_sizes).max_sets(1),
                None,
            )
            .context("VkCreateDescriptorPool")?;

        let set_layouts = [descriptor_set_layout];
        let descriptor_set = device
            .allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(descriptor_pool)
                    .set_layouts(&set_layouts),
            )
            .context("VkAllocateDescriptorSets")?[0];

        let push_constant_ranges = [vk::PushConstantRange::default()
            .stage_flags(vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(std::mem::size_of::<CompositePushConstants>() as u32)];

        let pipeline_layout = device
            .create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default()
                    .set_layouts(&set_layouts)
                    .push_constant_ranges(&push_constant_ranges),
                None,
            )
            .context("VkCreatePipelineLayout")?;

        let vert_module = load_shader(device, VERT_SHADER).context("loading composite vertex shader")?;
        let frag_module = load_shader(device, FRAG_SHADER).context("loading composite fragment shader")?;

        let entry_point = c"main";
        let stages = [
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::VERTEX)
                .module(vert_module)
                .name(entry_point),
            vk::PipelineShaderStageCreateInfo::default()
                .stage(vk::ShaderStageFlags::FRAGMENT)
                .module(frag_module)
                .name(entry_point),
        ];

        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
            .topology(vk::PrimitiveTopology::TRIANGLE_LIST);

        let viewport_state = vk::PipelineViewportStateCreateInfo::default().viewport_count(1).scissor_count(1);

        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(vk::PolygonMode::FILL)
            .cull_mode(vk::CullModeFlags::NONE)
            .front_face(vk::FrontFace::CLOCKWISE)
            .line_width(1.0);

        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(vk::SampleCountFlags::TYPE_1);

        let color_blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
            .blend_enable(true)
            .src_color_blend_factor(vk::BlendFactor::SRC_ALPHA)
            .dst_color_blend_factor(vk::BlendFactor::ONE_MINUS_SRC_ALPHA)
            .color_blend_op(vk::BlendOp::ADD)
            .src_alpha_blend_factor(vk::BlendFactor::ONE)
            .dst_alpha_blend_factor(vk::BlendFactor::ZERO)
            .alpha_blend_op(vk::BlendOp::ADD)
            .color_write_mask(vk::ColorComponentFlags::RGBA)];

        let color_blend = vk::PipelineColorBlendStateCreateInfo::default().attachments(&color_blend_attachments);

        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let color_formats = [color_format];
        let mut rendering_info = vk::PipelineRenderingCreateInfo::default().color_attachment_formats(&color_formats);

        let create_info = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport_state)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic_state)
            .layout(pipeline_layout)
            .push_next(&mut rendering_info);

        let pipeline = device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
            .map_err(|(_, e)| e)
            .context("VkCreateGraphicsPipelines")?[0];

        device.destroy_shader_module(vert_module, None);
        device.destroy_shader_module(frag_module, None);

        Ok(Self {
            descriptor_set_layout,
            descriptor_pool,
            descriptor_set,
            pipeline_layout,
            pipeline,
            sampler,
            color_format,
        })
    }

    unsafe fn bind_cache_view(&self, device: &ash::Device, view: vk::ImageView) {
        let image_info = [vk::DescriptorImageInfo::default()
            .sampler(self.sampler)
            .image_view(view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)];

        let write = vk::WriteDescriptorSet::default()
            .dst_set(self.descriptor_set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);

        device.update_descriptor_sets(&[write], &[]);
    }

    unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_pipeline(self.pipeline, None);
        device.destroy_pipeline_layout(self.pipeline_layout, None);
        device.destroy_descriptor_pool(self.descriptor_pool, None);
        device.destroy_descriptor_set_layout(self.descriptor_set_layout, None);
        device.destroy_sampler(self.sampler, None);
    }
}

/// Per-swapchain overlay state, tracked from `vkCreateSwapchainKHR` through
/// `vkDestroySwapchainKHR`.
pub struct SwapchainState {
    pub device: vk::Device,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub images: Vec<vk::Image>,
    pub views: Vec<vk::ImageView>,

    command_pool: vk::CommandPool,
    /// One command buffer, fence (pre-signalled), and "overlay-done"
    /// semaphore per swapchain image, indexed by `image_index` - sharing a
    /// single set across images would force a full GPU-completion stall on
    /// every present instead of only on image-index reuse.
    command_buffers: Vec<vk::CommandBuffer>,
    submit_fences: Vec<vk::Fence>,
    overlay_done_semaphores: Vec<vk::Semaphore>,

    /// A fresh export semaphore is created on demand (cheap) when the
    /// previous one's sync-file fd has already been consumed, per the
    /// per-present sequence's "optionally signal a new export semaphore".
    export_semaphore: Option<vk::Semaphore>,
    prior_export_fd: Option<OwnedFd>,

    import: Option<DmabufImport>,
    pipeline: Option<CompositePipeline>,
}

impl SwapchainState {
    pub unsafe fn new(
        device: &ash::Device,
        device_handle: vk::Device,
        queue_family: u32,
        format: vk::Format,
        extent: vk::Extent2D,
        images: Vec<vk::Image>,
    ) -> anyhow::Result<Self> {
        let command_pool = device
            .create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .queue_family_index(queue_family)
                    .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER),
                None,
            )
            .context("VkCreateCommandPool")?;

        let command_buffers = images
            .iter()
            .map(|_| create_command_buffer(device, command_pool))
            .collect::<anyhow::Result<Vec<_>>>()
            .context("allocating per-image command buffers")?;
        let submit_fences = images
            .iter()
            .map(|_| create_fence(device, true))
            .collect::<anyhow::Result<Vec<_>>>()
            .context("creating per-image fences")?;
        let overlay_done_semaphores = images
            .iter()
            .map(|_| create_semaphore(device))
            .collect::<anyhow::Result<Vec<_>>>()
            .context("creating per-image overlay-done semaphores")?;

        let views = images
            .iter()
            .map(|&image| crate::vulkan::create_image_view(device, image, format))
            .collect::<anyhow::Result<Vec<_>>>()
            .context("creating swapchain image views")?;

        Ok(Self {
            device: device_handle,
            format,
            extent,
            images,
            views,
            command_pool,
            command_buffers,
            submit_fences,
            overlay_done_semaphores,
            export_semaphore: None,
            prior_export_fd: None,
            import: None,
            pipeline: None,
        })
    }

    /// Step 3 of the per-present sequence: tear down and rebuild the import
    /// and pipeline if the server has pushed a new dma-buf, or if this is
    /// the first frame. Waits for the device to go idle first, since the
    /// old import/pipeline might still be in flight.
    pub unsafe fn rebuild_if_needed(
        &mut self,
        instance: &ash::Instance,
        device: &ash::Device,
        pdevice: vk::PhysicalDevice,
        external_memory_fd: &ash::extensions::khr::ExternalMemoryFd,
        conn: &Connection,
    ) -> anyhow::Result<()> {
        let Some(descriptor) = conn.take_dmabuf() else {
            return Ok(());
        };

        if let Some(current) = &self.import {
            if current.generation == descriptor.generation {
                return Ok(());
            }
        }

        device.device_wait_idle().context("VkDeviceWaitIdle before import rebuild")?;

        if let Some(pipeline) = self.pipeline.take() {
            pipeline.destroy(device);
        }
        if let Some(import) = self.import.take() {
            import.destroy(device);
        }

        let import = DmabufImport::import(instance, device, pdevice, external_memory_fd, &descriptor)
            .context("importing dma-buf")?;

        let pipeline = CompositePipeline::new(device, self.format).context("building composite pipeline")?;
        pipeline.bind_cache_view(device, import.cache_view);

        self.import = Some(import);
        self.pipeline = Some(pipeline);

        Ok(())
    }

    /// The full per-present sequence. Returns the semaphore the caller
    /// should make the app's `VkPresentInfoKHR` wait on instead of its own
    /// (`overlay_done`), or `None` if there's nothing to composite yet (no
    /// import, or the imported frame isn't ready), in which case the caller
    /// should present unmodified.
    #[allow(clippy::too_many_arguments)]
    pub unsafe fn composite(
        &mut self,
        device: &ash::Device,
        external_semaphore_fd: &ash::extensions::khr::ExternalSemaphoreFd,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
        conn: &Connection,
    ) -> anyhow::Result<Option<vk::Semaphore>> {
        // Step 1: poll the previous frame's export fence, if any, so we
        // don't leak a dangling sync-file across frames.
        if let Some(fd) = self.prior_export_fd.take() {
            if !sync_file::is_signaled_owned(&fd) {
                self.prior_export_fd = Some(fd);
            }
        }

        // Step 2: `ready_frame()` - only a freshly consumed, signalled
        // acquire fd means a new frame actually landed; no fd this call means
        // no refresh, not "the old frame is still ready to rerefresh". This
        // is what makes a slow client throttle its own HUD refresh instead of
        // recopying stale cache contents every present.
        let frame_ready = match conn.take_acquire_fd() {
            Some(fd) => sync_file::is_signaled_owned(&fd),
            None => false,
        };

        let (Some(import), Some(pipeline)) = (&mut self.import, &self.pipeline) else {
            return Ok(None);
        };

        if !frame_ready && !import.layout_ready {
            // Nothing to show yet - the import exists but no frame has ever
            // landed in the cache image.
            return Ok(None);
        }

        let idx = image_index as usize;
        let command_buffer = self.command_buffers[idx];
        let submit_fence = self.submit_fences[idx];
        let overlay_done = self.overlay_done_semaphores[idx];

        device.wait_for_fences(&[submit_fence], true, u64::MAX).context("VkWaitForFences")?;
        device.reset_fences(&[submit_fence]).context("VkResetFences")?;

        device
            .reset_command_buffer(command_buffer, vk::CommandBufferResetFlags::empty())
            .context("VkResetCommandBuffer")?;
        device
            .begin_command_buffer(
                command_buffer,
                &vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
            )
            .context("VkBeginCommandBuffer")?;

        if frame_ready {
            import.cmd_refresh_cache(device, command_buffer);
        }

        let swap_image = self.images[idx];
        let swap_view = self.views[idx];

        crate::vulkan::cmd_image_barrier(
            device,
            command_buffer,
            swap_image,
            vk::PipelineStageFlags::TOP_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
        );

        let color_attachment = vk::RenderingAttachmentInfo::default()
            .image_view(swap_view)
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::LOAD)
            .store_op(vk::AttachmentStoreOp::STORE);

        let attachments = [color_attachment];
        let rendering_info = vk::RenderingInfo::default()
            .render_area(vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent: self.extent })
            .layer_count(1)
            .color_attachments(&attachments);

        device.cmd_begin_rendering(command_buffer, &rendering_info);

        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: self.extent.width as f32,
            height: self.extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        device.cmd_set_viewport(command_buffer, 0, &[viewport]);
        device.cmd_set_scissor(command_buffer, 0, &[vk::Rect2D { offset: vk::Offset2D { x: 0, y: 0 }, extent: self.extent }]);

        device.cmd_bind_pipeline(command_buffer, vk::PipelineBindPoint::GRAPHICS, pipeline.pipeline);
        device.cmd_bind_descriptor_sets(
            command_buffer,
            vk::PipelineBindPoint::GRAPHICS,
            pipeline.pipeline_layout,
            0,
            &[pipeline.descriptor_set],
            &[],
        );

        let push_constants = CompositePushConstants {
            dst_extent: [self.extent.width as f32, self.extent.height as f32],
            src_extent: [import.width as f32, import.height as f32],
            pixel_offset: [0.0, 0.0],
            transfer_function: transfer_function_for(pipeline.color_format),
            _pad: 0,
        };
        device.cmd_push_constants(
            command_buffer,
            pipeline.pipeline_layout,
            vk::ShaderStageFlags::FRAGMENT,
            0,
            push_constants.as_bytes(),
        );

        device.cmd_draw(command_buffer, 3, 1, 0, 0);
        device.cmd_end_rendering(command_buffer);

        crate::vulkan::cmd_image_barrier(
            device,
            command_buffer,
            swap_image,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE,
            vk::PipelineStageFlags::BOTTOM_OF_PIPE,
            vk::AccessFlags::empty(),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            vk::ImageLayout::PRESENT_SRC_KHR,
        );

        device.end_command_buffer(command_buffer).context("VkEndCommandBuffer")?;

        // Step 6: the export semaphore (and the release-fence send below it
        // feeds) only gets signalled when this submission actually refreshed
        // the cache - an unrefreshed present has nothing new to release.
        let export_semaphore = if frame_ready {
            match self.export_semaphore {
                Some(sem) => Some(sem),
                None => {
                    let sem = create_exportable_semaphore(device).context("VkCreateSemaphore (exportable)")?;
                    self.export_semaphore = Some(sem);
                    Some(sem)
                }
            }
        } else {
            None
        };

        let wait_stages = vec![vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT; wait_semaphores.len()];
        let mut signal_semaphores = vec![overlay_done];
        signal_semaphores.extend(export_semaphore);
        let command_buffers = [command_buffer];

        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        device
            .queue_submit(queue, &[submit_info], submit_fence)
            .context("VkQueueSubmit")?;

        if let Some(export_semaphore) = export_semaphore {
            if let Ok(fd) = export_release_fence(external_semaphore_fd, export_semaphore) {
                let retained = fd.try_clone().map_err(HudError::FDDupFailed)?;
                conn.send_release_fence(fd);
                self.prior_export_fd = Some(retained);
                self.export_semaphore = None;
            }
        }

        Ok(Some(overlay_done))
    }

    /// Resize/format-change teardown: drops everything GPU-side. The caller
    /// recreates swapchain image views from the new `vkGetSwapchainImagesKHR`
    /// results via `new` again.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        device.device_wait_idle().ok();

        if let Some(pipeline) = self.pipeline.take() {
            pipeline.destroy(device);
        }
        if let Some(import) = self.import.take() {
            import.destroy(device);
        }

        for &view in &self.views {
            device.destroy_image_view(view, None);
        }

        for &sem in &self.overlay_done_semaphores {
            device.destroy_semaphore(sem, None);
        }
        if let Some(sem) = self.export_semaphore.take() {
            device.destroy_semaphore(sem, None);
        }
        for &fence in &self.submit_fences {
            device.destroy_fence(fence, None);
        }
        device.destroy_command_pool(self.command_pool, None);
    }
}

/// Exports `semaphore`'s signal as a sync-file fd, matching the server's own
/// `create_sync_fd_semaphore`/export pair in `pipeline.rs`.
unsafe fn export_release_fence(
    external_semaphore_fd: &ash::extensions::khr::ExternalSemaphoreFd,
    semaphore: vk::Semaphore,
) -> anyhow::Result<OwnedFd> {
    let fd = external_semaphore_fd
        .get_semaphore_fd(
            &vk::SemaphoreGetFdInfoKHR::default()
                .semaphore(semaphore)
                .handle_type(vk::ExternalSemaphoreHandleTypeFlags::SYNC_FD),
        )
        .context("VkGetSemaphoreFdKHR")?;

    Ok(std::os::fd::OwnedFd::from_raw_fd(fd))
}
