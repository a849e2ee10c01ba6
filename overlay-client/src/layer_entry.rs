// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The Vulkan implicit-layer ABI surface: `vkNegotiateLoaderLayerInterfaceVersion`,
//! and the small set of `vkCreateInstance`/`vkCreateDevice`/swapchain/present
//! entry points this layer actually intercepts. Everything else is passed
//! straight through via `vkGet{Instance,Device}ProcAddr` with no interposition.
//!
//! The `VkLayer*CreateInfo` structures used to walk the loader's chain during
//! `vkCreateInstance`/`vkCreateDevice` aren't part of the Vulkan registry
//! `ash` generates from (they're loader-private, defined in `vk_layer.h`), so
//! they're declared locally below, matching the ABI every implicit layer
//! (validation, RenderDoc, MangoHud) relies on.

use std::{
    ffi::{c_char, CStr},
    mem::transmute,
};

use ash::vk;

use crate::{
    conn::Connection,
    dispatch::{DeviceDispatch, InstanceDispatch},
    state::{self, DeviceState, InstanceState},
    swapchain::SwapchainState,
};

const LAYER_NAME: &CStr = c"VK_LAYER_HUD_overlay";

#[repr(C)]
#[derive(Copy, Clone)]
struct VkLayerInstanceLink {
    p_next: *mut VkLayerInstanceLink,
    pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pfn_next_get_physical_device_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
}

#[repr(C)]
struct VkLayerInstanceCreateInfo {
    s_type: vk::StructureType,
    p_next: *const std::ffi::c_void,
    function: i32,
    u: VkLayerInstanceLinkUnion,
}

#[repr(C)]
union VkLayerInstanceLinkUnion {
    p_layer_info: *mut VkLayerInstanceLink,
    p_user_data: *mut std::ffi::c_void,
}

#[repr(C)]
#[derive(Copy, Clone)]
struct VkLayerDeviceLink {
    p_next: *mut VkLayerDeviceLink,
    pfn_next_get_instance_proc_addr: vk::PFN_vkGetInstanceProcAddr,
    pfn_next_get_device_proc_addr: vk::PFN_vkGetDeviceProcAddr,
}

#[repr(C)]
struct VkLayerDeviceCreateInfo {
    s_type: vk::StructureType,
    p_next: *const std::ffi::c_void,
    function: i32,
    u: VkLayerDeviceLinkUnion,
}

#[repr(C)]
union VkLayerDeviceLinkUnion {
    p_layer_info: *mut VkLayerDeviceLink,
    p_user_data: *mut std::ffi::c_void,
}

/// `VK_LAYER_LINK_INFO`, the only `function` value this layer cares about.
const VK_LAYER_LINK_INFO: i32 = 0;
const VK_STRUCTURE_TYPE_LOADER_INSTANCE_CREATE_INFO: i32 = 47;
const VK_STRUCTURE_TYPE_LOADER_DEVICE_CREATE_INFO: i32 = 48;

unsafe fn find_instance_layer_link(create_info: *const vk::InstanceCreateInfo) -> Option<*mut VkLayerInstanceLink> {
    let mut next = (*create_info).p_next as *const VkLayerInstanceCreateInfo;
    while !next.is_null() {
        let node = &*next;
        if node.s_type.as_raw() == VK_STRUCTURE_TYPE_LOADER_INSTANCE_CREATE_INFO && node.function == VK_LAYER_LINK_INFO
        {
            return Some(node.u.p_layer_info);
        }
        next = node.p_next as *const VkLayerInstanceCreateInfo;
    }
    None
}

unsafe fn find_device_layer_link(create_info: *const vk::DeviceCreateInfo) -> Option<*mut VkLayerDeviceLink> {
    let mut next = (*create_info).p_next as *const VkLayerDeviceCreateInfo;
    while !next.is_null() {
        let node = &*next;
        if node.s_type.as_raw() == VK_STRUCTURE_TYPE_LOADER_DEVICE_CREATE_INFO && node.function == VK_LAYER_LINK_INFO {
            return Some(node.u.p_layer_info);
        }
        next = node.p_next as *const VkLayerDeviceCreateInfo;
    }
    None
}

fn hud_socket_path() -> std::path::PathBuf {
    std::env::var("HUD_SOCKET_PATH")
        .map(std::path::PathBuf::from)
        .unwrap_or_else(|_| std::path::PathBuf::from("/run/hudd/session.sock"))
}

fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_env("HUD_LOG"))
            .try_init();
    });
}

#[no_mangle]
pub unsafe extern "system" fn vkNegotiateLoaderLayerInterfaceVersion(version_struct: *mut NegotiateLayerInterface) -> vk::Result {
    let version_struct = &mut *version_struct;
    if version_struct.loader_layer_interface_version < 2 {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    }

    version_struct.loader_layer_interface_version = 2;
    version_struct.pfn_get_instance_proc_addr = Some(vkGetInstanceProcAddr);
    version_struct.pfn_get_device_proc_addr = Some(vkGetDeviceProcAddr);
    version_struct.pfn_get_physical_device_proc_addr = None;

    vk::Result::SUCCESS
}

#[repr(C)]
pub struct NegotiateLayerInterface {
    pub s_type: i32,
    pub p_next: *mut std::ffi::c_void,
    pub loader_layer_interface_version: u32,
    pub pfn_get_instance_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
    pub pfn_get_device_proc_addr: Option<vk::PFN_vkGetDeviceProcAddr>,
    pub pfn_get_physical_device_proc_addr: Option<vk::PFN_vkGetInstanceProcAddr>,
}

#[no_mangle]
pub unsafe extern "system" fn vkCreateInstance(
    create_info: *const vk::InstanceCreateInfo,
    allocator: *const vk::AllocationCallbacks,
    out_instance: *mut vk::Instance,
) -> vk::Result {
    init_tracing();

    let Some(link) = find_instance_layer_link(create_info) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    let get_instance_proc_addr = (*link).pfn_next_get_instance_proc_addr;

    let create_instance: vk::PFN_vkCreateInstance =
        transmute(get_instance_proc_addr(vk::Instance::null(), c"vkCreateInstance".as_ptr()));

    let result = create_instance(create_info, allocator, out_instance);
    if result == vk::Result::SUCCESS {
        let dispatch = InstanceDispatch::new(get_instance_proc_addr, *out_instance);
        state::register_instance(*out_instance, InstanceState { dispatch });
        tracing::info!("hud overlay layer attached to instance");
    }

    result
}

#[no_mangle]
pub unsafe extern "system" fn vkDestroyInstance(instance: vk::Instance, allocator: *const vk::AllocationCallbacks) {
    if let Some(state) = state::remove_instance(instance) {
        state.dispatch.instance.destroy_instance(allocator.as_ref());
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkCreateDevice(
    pdevice: vk::PhysicalDevice,
    create_info: *const vk::DeviceCreateInfo,
    allocator: *const vk::AllocationCallbacks,
    out_device: *mut vk::Device,
) -> vk::Result {
    let Some(link) = find_device_layer_link(create_info) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    let get_instance_proc_addr = (*link).pfn_next_get_instance_proc_addr;
    let get_device_proc_addr = (*link).pfn_next_get_device_proc_addr;

    let create_device: vk::PFN_vkCreateDevice =
        transmute(get_instance_proc_addr(vk::Instance::null(), c"vkCreateDevice".as_ptr()));

    let result = create_device(pdevice, create_info, allocator, out_device);
    if result != vk::Result::SUCCESS {
        return result;
    }

    let dispatch = DeviceDispatch::new(get_device_proc_addr, *out_device);

    let queue_family = (0..(*create_info).queue_create_info_count)
        .next()
        .map(|i| (*(*create_info).p_queue_create_infos.add(i as usize)).queue_family_index)
        .unwrap_or(0);
    let graphics_queue = dispatch.device.get_device_queue(queue_family, 0);

    let Some(instance_handle) = state::instance_for_physical_device(pdevice) else {
        tracing::warn!("hud overlay: unknown instance for physical device, running as passthrough");
        return result;
    };

    for i in 0..(*create_info).queue_create_info_count {
        let family = (*(*create_info).p_queue_create_infos.add(i as usize)).queue_family_index;
        let count = (*(*create_info).p_queue_create_infos.add(i as usize)).queue_count;
        for idx in 0..count {
            state::note_queue(dispatch.device.get_device_queue(family, idx), *out_device);
        }
    }

    let conn = match Connection::connect(hud_socket_path(), "hud-layer") {
        Ok(conn) => Some(std::sync::Arc::new(conn)),
        Err(e) => {
            tracing::warn!("hud overlay: no server connection, running as passthrough: {e:#}");
            None
        }
    };

    let Some(instance_state) = state::instance_state(instance_handle) else {
        tracing::warn!("hud overlay: instance state vanished before device creation finished");
        return result;
    };

    let external_memory_fd =
        ash::extensions::khr::ExternalMemoryFd::new(&instance_state.dispatch.instance, &dispatch.device);
    let external_semaphore_fd =
        ash::extensions::khr::ExternalSemaphoreFd::new(&instance_state.dispatch.instance, &dispatch.device);

    state::register_device(
        *out_device,
        DeviceState {
            dispatch,
            instance: instance_handle,
            physical_device: pdevice,
            graphics_queue,
            graphics_queue_family: queue_family,
            external_memory_fd,
            external_semaphore_fd,
            conn,
        },
    );

    result
}

/// Records which instance a physical device belongs to, since
/// `vkCreateDevice` is handed a bare `VkPhysicalDevice` with no instance
/// attached. Passes through to the next link in the chain unmodified.
#[no_mangle]
pub unsafe extern "system" fn vkEnumeratePhysicalDevices(
    instance: vk::Instance,
    count: *mut u32,
    out_devices: *mut vk::PhysicalDevice,
) -> vk::Result {
    let Some(instance_state) = state::instance_state(instance) else {
        return vk::Result::ERROR_INITIALIZATION_FAILED;
    };

    let result = instance_state
        .dispatch
        .instance
        .fp_v1_0()
        .enumerate_physical_devices(instance, count, out_devices);

    if result == vk::Result::SUCCESS && !out_devices.is_null() {
        for pdevice in std::slice::from_raw_parts(out_devices, *count as usize) {
            state::note_physical_device(*pdevice, instance);
        }
    }

    result
}

#[no_mangle]
pub unsafe extern "system" fn vkDestroyDevice(device: vk::Device, allocator: *const vk::AllocationCallbacks) {
    if let Some(state) = state::remove_device(device) {
        state.dispatch.device.destroy_device(allocator.as_ref());
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkCreateSwapchainKHR(
    device: vk::Device,
    create_info: *const vk::SwapchainCreateInfoKHR,
    allocator: *const vk::AllocationCallbacks,
    out_swapchain: *mut vk::SwapchainKHR,
) -> vk::Result {
    let Some(device_state) = state::device_state(device) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };

    let swapchain_ext = ash::extensions::khr::Swapchain::new(
        &state::instance_state(device_state.instance).unwrap().dispatch.instance,
        &device_state.dispatch.device,
    );

    let result = swapchain_ext.create_swapchain(&*create_info, allocator.as_ref());
    let Ok(swapchain) = result else {
        return result.unwrap_err();
    };
    *out_swapchain = swapchain;

    let images = match swapchain_ext.get_swapchain_images(swapchain) {
        Ok(images) => images,
        Err(e) => return e,
    };

    match SwapchainState::new(
        &device_state.dispatch.device,
        device,
        device_state.graphics_queue_family,
        (*create_info).image_format,
        (*create_info).image_extent,
        images,
    ) {
        Ok(swapchain_state) => state::register_swapchain(swapchain, swapchain_state),
        Err(e) => tracing::warn!("hud overlay: failed to set up swapchain overlay state: {e:#}"),
    }

    vk::Result::SUCCESS
}

#[no_mangle]
pub unsafe extern "system" fn vkDestroySwapchainKHR(
    device: vk::Device,
    swapchain: vk::SwapchainKHR,
    allocator: *const vk::AllocationCallbacks,
) {
    if let Some(device_state) = state::device_state(device) {
        if let Some(swapchain_state) = state::remove_swapchain(swapchain) {
            swapchain_state.lock().destroy(&device_state.dispatch.device);
        }

        let swapchain_ext = ash::extensions::khr::Swapchain::new(
            &state::instance_state(device_state.instance).unwrap().dispatch.instance,
            &device_state.dispatch.device,
        );
        swapchain_ext.destroy_swapchain(swapchain, allocator.as_ref());
    }
}

#[no_mangle]
pub unsafe extern "system" fn vkQueuePresentKHR(queue: vk::Queue, present_info: *const vk::PresentInfoKHR) -> vk::Result {
    let present_info_ref = &*present_info;
    let swapchains = std::slice::from_raw_parts(present_info_ref.p_swapchains, present_info_ref.swapchain_count as usize);
    let image_indices =
        std::slice::from_raw_parts(present_info_ref.p_image_indices, present_info_ref.swapchain_count as usize);
    let wait_semaphores = std::slice::from_raw_parts(
        present_info_ref.p_wait_semaphores,
        present_info_ref.wait_semaphore_count as usize,
    );

    // This layer only ever composites onto the first swapchain in a present
    // call; multi-swapchain presents are vanishingly rare and the overlay is
    // informational, not something a HUD needs to guarantee for every
    // surface at once.
    let Some((&swapchain, &image_index)) = swapchains.first().zip(image_indices.first()) else {
        return passthrough_present(queue, present_info);
    };

    let Some(swapchain_state) = state::swapchain_state(swapchain) else {
        return passthrough_present(queue, present_info);
    };

    let Some(device_state) = state::device_state(swapchain_state.lock().device) else {
        return passthrough_present(queue, present_info);
    };

    let Some(conn) = &device_state.conn else {
        return passthrough_present(queue, present_info);
    };

    let instance_state = state::instance_state(device_state.instance).unwrap();
    let mut state = swapchain_state.lock();

    if let Err(e) = state.rebuild_if_needed(
        &instance_state.dispatch.instance,
        &device_state.dispatch.device,
        device_state.physical_device,
        &device_state.external_memory_fd,
        conn,
    ) {
        tracing::warn!("hud overlay: import rebuild failed: {e:#}");
    }

    let overlay_done = match state.composite(
        &device_state.dispatch.device,
        &device_state.external_semaphore_fd,
        queue,
        image_index,
        wait_semaphores,
        conn,
    ) {
        Ok(sem) => sem,
        Err(e) => {
            tracing::warn!("hud overlay: composite failed, presenting unmodified: {e:#}");
            None
        }
    };
    drop(state);

    match overlay_done {
        Some(sem) => {
            let wait = [sem];
            let mut rewritten = *present_info_ref;
            rewritten.wait_semaphore_count = 1;
            rewritten.p_wait_semaphores = wait.as_ptr();
            passthrough_present(queue, &rewritten)
        }
        None => passthrough_present(queue, present_info),
    }
}

unsafe fn passthrough_present(queue: vk::Queue, present_info: *const vk::PresentInfoKHR) -> vk::Result {
    let Some(device_state) = state::device_state_for_queue(queue) else {
        return vk::Result::ERROR_DEVICE_LOST;
    };
    let swapchain_ext = ash::extensions::khr::Swapchain::new(
        &state::instance_state(device_state.instance).unwrap().dispatch.instance,
        &device_state.dispatch.device,
    );
    swapchain_ext.queue_present(queue, &*present_info).unwrap_or_else(|e| e)
}

#[no_mangle]
pub unsafe extern "system" fn vkGetInstanceProcAddr(instance: vk::Instance, name: *const c_char) -> vk::PFN_vkVoidFunction {
    let name_str = CStr::from_ptr(name);

    macro_rules! intercept {
        ($sym:ident) => {
            if name_str.to_bytes() == stringify!($sym).as_bytes() {
                return Some(transmute($sym as usize));
            }
        };
    }

    intercept!(vkCreateInstance);
    intercept!(vkDestroyInstance);
    intercept!(vkCreateDevice);
    intercept!(vkEnumeratePhysicalDevices);
    intercept!(vkDestroyDevice);
    intercept!(vkCreateSwapchainKHR);
    intercept!(vkDestroySwapchainKHR);
    intercept!(vkQueuePresentKHR);
    intercept!(vkGetInstanceProcAddr);
    intercept!(vkGetDeviceProcAddr);

    if instance.is_null() {
        return None;
    }

    state::instance_state(instance).and_then(|s| {
        let gipa = s.dispatch.instance.fp_v1_0().get_instance_proc_addr;
        gipa(instance, name)
    })
}

#[no_mangle]
pub unsafe extern "system" fn vkGetDeviceProcAddr(device: vk::Device, name: *const c_char) -> vk::PFN_vkVoidFunction {
    let name_str = CStr::from_ptr(name);

    macro_rules! intercept {
        ($sym:ident) => {
            if name_str.to_bytes() == stringify!($sym).as_bytes() {
                return Some(transmute($sym as usize));
            }
        };
    }

    intercept!(vkDestroyDevice);
    intercept!(vkCreateSwapchainKHR);
    intercept!(vkDestroySwapchainKHR);
    intercept!(vkQueuePresentKHR);
    intercept!(vkGetDeviceProcAddr);

    state::device_state(device).and_then(|s| {
        let gdpa = s.dispatch.device.fp_v1_0().get_device_proc_addr;
        gdpa(device, name)
    })
}
