// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

#![allow(clippy::too_many_arguments)]

mod chain;
pub(crate) use chain::*;

pub mod drm;
pub mod timeline;

use std::ffi::{c_void, CStr, CString};

use anyhow::{bail, Context, Result};
use ash::extensions::{ext, khr};
use ash::vk;
use cstr::cstr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Amd,
    Nvidia,
    Other,
}

/// Parsed driver version, used only for the preflight sanity checks in
/// `main.rs`. `driverVersion` is packed differently by different vendors;
/// Mesa uses the standard Vulkan major.minor.patch packing, while NVIDIA's
/// proprietary driver packs its own `major.minor` scheme into the high bits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DriverVersion {
    MesaRadv { major: u32, minor: u32, patch: u32 },
    NvidiaProprietary { major: u32, minor: u32 },
    Other(String),
}

impl DriverVersion {
    fn parse(vendor: Vendor, packed: u32) -> Self {
        match vendor {
            Vendor::Amd => DriverVersion::MesaRadv {
                major: vk::api_version_major(packed),
                minor: vk::api_version_minor(packed),
                patch: vk::api_version_patch(packed),
            },
            Vendor::Nvidia => DriverVersion::NvidiaProprietary {
                major: packed >> 22,
                minor: (packed >> 14) & 0xff,
            },
            Vendor::Other => DriverVersion::Other(format!("{:#x}", packed)),
        }
    }
}

pub struct VkContext {
    pub entry: ash::Entry,
    pub external_mem_loader: khr::ExternalMemoryFd,
    pub drm_format_modifier_loader: ext::ImageDrmFormatModifierEXT,
    pub timeline_semaphore_loader: khr::TimelineSemaphore,
    pub external_semaphore_fd_loader: khr::ExternalSemaphoreFd,

    pub instance: ash::Instance,
    pub debug: Option<VkDebugContext>,
    pub device: ash::Device,
    pub device_info: VkDeviceInfo,
    pub graphics_queue: VkQueue,
}

pub struct VkDebugContext {
    #[allow(dead_code)]
    debug: ext::DebugUtils,
    #[allow(dead_code)]
    messenger: vk::DebugUtilsMessengerEXT,
}

#[derive(Clone)]
pub struct VkQueue {
    pub family: u32,
    pub queue: vk::Queue,
    pub command_pool: vk::CommandPool,
}

impl VkQueue {
    pub fn new(device: &ash::Device, family: u32) -> Result<Self> {
        let queue = unsafe { device.get_device_queue(family, 0) };

        let command_pool = unsafe {
            let create_info = vk::CommandPoolCreateInfo::default()
                .queue_family_index(family)
                .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);

            device.create_command_pool(&create_info, None)?
        };

        Ok(Self {
            family,
            queue,
            command_pool,
        })
    }
}

pub struct VkDeviceInfo {
    pub pdevice: vk::PhysicalDevice,
    pub device_name: CString,
    pub device_type: vk::PhysicalDeviceType,
    pub device_vendor: Vendor,
    pub driver_version: DriverVersion,
    pub limits: vk::PhysicalDeviceLimits,
    pub render_minor: i64,
    pub graphics_family: u32,
    pub memory_props: vk::PhysicalDeviceMemoryProperties,
    pub selected_extensions: Vec<CString>,
}

impl VkDeviceInfo {
    fn query(instance: &ash::Instance, device: vk::PhysicalDevice) -> Result<Self> {
        let mut drm_props = vk::PhysicalDeviceDrmPropertiesEXT::default();
        let mut props = vk::PhysicalDeviceProperties2::default().push_next(&mut drm_props);
        unsafe { instance.get_physical_device_properties2(device, &mut props) };

        let limits = props.properties.limits;
        let device_type = props.properties.device_type;
        let device_name =
            unsafe { CStr::from_ptr(props.properties.device_name.as_ptr()).to_owned() };
        let device_vendor = match props.properties.vendor_id {
            0x1002 => Vendor::Amd,
            0x10de => Vendor::Nvidia,
            _ => Vendor::Other,
        };
        let driver_version = DriverVersion::parse(device_vendor, props.properties.driver_version);

        if !drm_props.has_render {
            bail!("device {:?} has no render node", device_name);
        }

        let queue_families = unsafe {
            instance
                .get_physical_device_queue_family_properties(device)
                .into_iter()
                .collect::<Vec<_>>()
        };

        let graphics_family = queue_families
            .iter()
            .enumerate()
            .find(|(_, properties)| {
                properties.queue_flags.contains(vk::QueueFlags::GRAPHICS)
                    && properties.queue_flags.contains(vk::QueueFlags::COMPUTE)
            })
            .map(|(index, _)| index as u32)
            .ok_or_else(|| anyhow::anyhow!("no graphics queue found"))?;

        let available_extensions = unsafe {
            instance
                .enumerate_device_extension_properties(device)
                .unwrap()
                .into_iter()
                .map(|properties| CStr::from_ptr(&properties.extension_name as *const _).to_owned())
                .collect::<Vec<_>>()
        };

        let selected_extensions = vec![
            vk::KhrExternalMemoryFdFn::NAME.to_owned(),
            vk::ExtExternalMemoryDmaBufFn::NAME.to_owned(),
            vk::ExtImageDrmFormatModifierFn::NAME.to_owned(),
            vk::ExtPhysicalDeviceDrmFn::NAME.to_owned(),
            vk::KhrExternalSemaphoreFdFn::NAME.to_owned(),
            vk::KhrTimelineSemaphoreFn::NAME.to_owned(),
        ];

        for ext in selected_extensions.iter() {
            if !contains_extension(&available_extensions, ext) {
                return Err(anyhow::anyhow!("extension {:?} not available", ext));
            }
        }

        let memory_props = unsafe { instance.get_physical_device_memory_properties(device) };

        Ok(Self {
            pdevice: device,
            device_name,
            device_type,
            device_vendor,
            driver_version,
            limits,
            render_minor: drm_props.render_minor as i64,
            graphics_family,
            memory_props,
            selected_extensions,
        })
    }
}

impl VkContext {
    pub fn new(enable_debug: bool) -> Result<Self> {
        let entry = unsafe { ash::Entry::load().context("failed to load vulkan libraries!") }?;
        debug!("creating vulkan instance");

        let (major, minor) = match unsafe { entry.try_enumerate_instance_version()? } {
            Some(version) => (
                vk::api_version_major(version),
                vk::api_version_minor(version),
            ),
            None => (1, 0),
        };

        if major < 1 || (major == 1 && minor < 3) {
            return Err(anyhow::anyhow!("vulkan 1.3 or higher is required"));
        }

        let app_info = vk::ApplicationInfo::default()
            .application_name(cstr!("hudd"))
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(cstr!("No Engine"))
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::make_api_version(0, major, minor, 0));

        let available_extensions = unsafe {
            entry
                .enumerate_instance_extension_properties(None)?
                .into_iter()
                .map(|properties| CStr::from_ptr(&properties.extension_name as *const _).to_owned())
                .collect::<Vec<_>>()
        };

        let mut extensions = Vec::new();
        let mut layers = Vec::new();

        if enable_debug {
            if !available_extensions
                .iter()
                .any(|ext| ext.as_c_str() == ext::DebugUtils::NAME)
            {
                return Err(anyhow::anyhow!(
                    "debug utils extension requested, but not available"
                ));
            }

            warn!("vulkan debug tooling enabled");
            extensions.push(ext::DebugUtils::NAME.as_ptr());

            unsafe {
                let validation_layer = cstr!("VK_LAYER_KHRONOS_validation");
                if entry
                    .enumerate_instance_layer_properties()?
                    .into_iter()
                    .map(|properties| CStr::from_ptr(&properties.layer_name as *const _))
                    .any(|layer| layer == validation_layer)
                {
                    layers.push(validation_layer.as_ptr());
                } else {
                    warn!("validation layers requested, but not available!")
                }
            }
        }

        let instance_create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layers)
            .enabled_extension_names(&extensions);

        let instance = unsafe { entry.create_instance(&instance_create_info, None)? };

        let debug_ctx = if enable_debug {
            let debug_utils = ext::DebugUtils::new(&entry, &instance);

            let create_info = vk::DebugUtilsMessengerCreateInfoEXT::default()
                .message_severity(
                    vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                        | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                )
                .message_type(
                    vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                        | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE
                        | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION,
                )
                .pfn_user_callback(Some(vulkan_debug_utils_callback));

            let messenger =
                unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }?;

            Some(VkDebugContext {
                debug: debug_utils,
                messenger,
            })
        } else {
            None
        };

        let devices = unsafe { instance.enumerate_physical_devices()? };
        let mut devices = devices
            .into_iter()
            .flat_map(|dev| match VkDeviceInfo::query(&instance, dev) {
                Ok(device) => Some(device),
                Err(err) => {
                    let device_name = unsafe {
                        CStr::from_ptr(instance.get_physical_device_properties(dev).device_name.as_ptr())
                            .to_owned()
                    };
                    info!("gpu {device_name:?} ineligible: {err}");
                    None
                }
            })
            .collect::<Vec<_>>();

        if devices.is_empty() {
            return Err(anyhow::anyhow!("no suitable gpu found"));
        }

        devices.sort_by_key(|dev| match dev.device_type {
            vk::PhysicalDeviceType::DISCRETE_GPU => 0,
            vk::PhysicalDeviceType::INTEGRATED_GPU => 10,
            _ => 20,
        });

        let device_info = devices.remove(0);
        Self::from_device_info(entry, instance, debug_ctx, device_info)
    }

    /// Re-derives a VkContext pinned to a specific render-node minor, used
    /// when a client's `Handshake` specifies the device it's rendering on
    /// (the server must draw on the same device to export a dma-buf the
    /// client can import without a cross-device copy).
    pub fn for_render_minor(&self, minor: i64) -> Result<Option<VkDeviceInfo>> {
        if self.device_info.render_minor == minor {
            return Ok(None);
        }

        let devices = unsafe { self.instance.enumerate_physical_devices()? };
        for dev in devices {
            if let Ok(info) = VkDeviceInfo::query(&self.instance, dev) {
                if info.render_minor == minor {
                    return Ok(Some(info));
                }
            }
        }

        bail!("no gpu found for render node minor {minor}")
    }

    fn from_device_info(
        entry: ash::Entry,
        instance: ash::Instance,
        debug: Option<VkDebugContext>,
        device_info: VkDeviceInfo,
    ) -> Result<Self> {
        let queue_priorities = [1.0];
        let queue_create_infos = [vk::DeviceQueueCreateInfo::default()
            .queue_family_index(device_info.graphics_family)
            .queue_priorities(&queue_priorities)];

        let extension_ptrs = device_info
            .selected_extensions
            .iter()
            .map(|e| e.as_ptr())
            .collect::<Vec<_>>();

        let mut timeline_features =
            vk::PhysicalDeviceTimelineSemaphoreFeatures::default().timeline_semaphore(true);
        let mut dynamic_rendering_features =
            vk::PhysicalDeviceDynamicRenderingFeatures::default().dynamic_rendering(true);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extension_ptrs)
            .push_next(&mut timeline_features)
            .push_next(&mut dynamic_rendering_features);

        let device =
            unsafe { instance.create_device(device_info.pdevice, &device_create_info, None)? };

        let graphics_queue = VkQueue::new(&device, device_info.graphics_family)?;

        Ok(Self {
            external_mem_loader: khr::ExternalMemoryFd::new(&instance, &device),
            drm_format_modifier_loader: ext::ImageDrmFormatModifierEXT::new(&instance, &device),
            timeline_semaphore_loader: khr::TimelineSemaphore::new(&instance, &device),
            external_semaphore_fd_loader: khr::ExternalSemaphoreFd::new(&instance, &device),
            entry,
            instance,
            debug,
            device,
            device_info,
            graphics_queue,
        })
    }
}

impl Drop for VkContext {
    fn drop(&mut self) {
        unsafe {
            self.device.device_wait_idle().ok();
            self.device
                .destroy_command_pool(self.graphics_queue.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

fn contains_extension(available: &[CString], wanted: &CStr) -> bool {
    available.iter().any(|e| e.as_c_str() == wanted)
}

unsafe extern "system" fn vulkan_debug_utils_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::error!("{:?} {:?}", message_type, message)
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::warn!("{:?} {:?}", message_type, message)
        }
        _ => tracing::trace!("{:?} {:?}", message_type, message),
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_mesa_radv_version_as_standard_triple() {
        let packed = vk::make_api_version(0, 24, 3, 1);
        match DriverVersion::parse(Vendor::Amd, packed) {
            DriverVersion::MesaRadv { major, minor, patch } => {
                assert_eq!((major, minor, patch), (24, 3, 1));
            }
            other => panic!("unexpected: {:?}", other),
        }
    }
}
