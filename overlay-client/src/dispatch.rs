// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Dispatch tables for the handful of Vulkan entry points this layer calls
//! on the *next* link in the chain (the driver, or whatever layer sits below
//! this one). Rather than hand-rolling raw `PFN_vk*` tables, `ash`'s own
//! entry-point loader is reused to resolve them: `ash::Instance::load` and
//! `ash::Device::load` already do exactly the "thin adapter over function
//! pointers" thing a layer needs, chained onto the `GetInstanceProcAddr`/
//! `GetDeviceProcAddr` this layer was handed at `vkCreateInstance`/
//! `vkCreateDevice` time instead of the ones a normal application would get
//! from the loader.

use std::ffi::CStr;

use ash::vk;

/// Everything this layer needs to call on the instance it's layered under.
pub struct InstanceDispatch {
    pub instance: ash::Instance,
}

impl InstanceDispatch {
    /// # Safety
    /// `get_instance_proc_addr` must be the next link's
    /// `vkGetInstanceProcAddr`, and `handle` must be the instance it was
    /// negotiated for.
    pub unsafe fn new(get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr, handle: vk::Instance) -> Self {
        let static_fn = vk::StaticFn { get_instance_proc_addr };
        Self { instance: ash::Instance::load(&static_fn, handle) }
    }
}

/// Everything this layer needs to call on the device it's layered under.
pub struct DeviceDispatch {
    pub device: ash::Device,
}

impl DeviceDispatch {
    /// # Safety
    /// `get_device_proc_addr` must be the next link's `vkGetDeviceProcAddr`
    /// (from `VkLayerDeviceCreateInfo::u.pLayerInfo->pfnNextGetDeviceProcAddr`
    /// at `vkCreateDevice` time), and `handle` must be the device it was
    /// negotiated for.
    pub unsafe fn new(get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr, handle: vk::Device) -> Self {
        // `ash::Device::load` wants an `InstanceFnV1_0` and only ever reads
        // its `get_device_proc_addr` field; build the smallest table that
        // satisfies that contract, the same way ash's own `Instance::load`
        // builds a function table purely by closure.
        let instance_fn = vk::InstanceFnV1_0::load(|name: &CStr| {
            std::mem::transmute(get_device_proc_addr(handle, name.as_ptr()))
        });

        Self { device: ash::Device::load(&instance_fn, handle) }
    }
}
