// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! Global registries keyed by the Vulkan dispatchable handles this layer
//! intercepts. A Vulkan layer has no object of its own to hang state off of
//! the way a normal application does (there's no "app struct" - the
//! interception points are free functions called by the loader), so instance,
//! device and swapchain state all live here instead, the same role
//! `lazy_static!`-backed maps play for connection/session bookkeeping on the
//! server side.

use std::sync::Arc;

use ash::vk::{self, Handle};
use hashbrown::HashMap;
use lazy_static::lazy_static;
use parking_lot::Mutex;

use crate::{conn::Connection, dispatch::{DeviceDispatch, InstanceDispatch}, swapchain::SwapchainState};

pub struct InstanceState {
    pub dispatch: InstanceDispatch,
}

pub struct DeviceState {
    pub dispatch: DeviceDispatch,
    pub instance: vk::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub graphics_queue: vk::Queue,
    pub graphics_queue_family: u32,
    pub external_memory_fd: ash::extensions::khr::ExternalMemoryFd,
    pub external_semaphore_fd: ash::extensions::khr::ExternalSemaphoreFd,
    /// `None` until the socket dial succeeds; a layer that can't reach the
    /// server degrades to a pure passthrough rather than failing the app's
    /// device creation.
    pub conn: Option<Arc<Connection>>,
}

lazy_static! {
    static ref INSTANCES: Mutex<HashMap<u64, Arc<InstanceState>>> = Mutex::new(HashMap::new());
    static ref DEVICES: Mutex<HashMap<u64, Arc<DeviceState>>> = Mutex::new(HashMap::new());
    static ref SWAPCHAINS: Mutex<HashMap<u64, Arc<Mutex<SwapchainState>>>> = Mutex::new(HashMap::new());
    static ref PHYSICAL_DEVICE_INSTANCE: Mutex<HashMap<u64, vk::Instance>> = Mutex::new(HashMap::new());
    static ref QUEUE_DEVICE: Mutex<HashMap<u64, vk::Device>> = Mutex::new(HashMap::new());
}

/// Populated from `vkEnumeratePhysicalDevices`, since `vkCreateDevice` is
/// handed a `VkPhysicalDevice` with no instance attached.
pub fn note_physical_device(pdevice: vk::PhysicalDevice, instance: vk::Instance) {
    PHYSICAL_DEVICE_INSTANCE.lock().insert(pdevice.as_raw(), instance);
}

pub fn instance_for_physical_device(pdevice: vk::PhysicalDevice) -> Option<vk::Instance> {
    PHYSICAL_DEVICE_INSTANCE.lock().get(&pdevice.as_raw()).copied()
}

/// Populated from `vkGetDeviceQueue`, since `vkQueuePresentKHR` is handed a
/// bare `VkQueue` with no device attached.
pub fn note_queue(queue: vk::Queue, device: vk::Device) {
    QUEUE_DEVICE.lock().insert(queue.as_raw(), device);
}

pub fn device_state_for_queue(queue: vk::Queue) -> Option<Arc<DeviceState>> {
    let device = *QUEUE_DEVICE.lock().get(&queue.as_raw())?;
    device_state(device)
}

pub fn register_instance(handle: vk::Instance, state: InstanceState) {
    INSTANCES.lock().insert(handle.as_raw(), Arc::new(state));
}

pub fn instance_state(handle: vk::Instance) -> Option<Arc<InstanceState>> {
    INSTANCES.lock().get(&handle.as_raw()).cloned()
}

pub fn remove_instance(handle: vk::Instance) -> Option<Arc<InstanceState>> {
    INSTANCES.lock().remove(&handle.as_raw())
}

pub fn register_device(handle: vk::Device, state: DeviceState) {
    DEVICES.lock().insert(handle.as_raw(), Arc::new(state));
}

pub fn device_state(handle: vk::Device) -> Option<Arc<DeviceState>> {
    DEVICES.lock().get(&handle.as_raw()).cloned()
}

pub fn remove_device(handle: vk::Device) -> Option<Arc<DeviceState>> {
    DEVICES.lock().remove(&handle.as_raw())
}

pub fn register_swapchain(handle: vk::SwapchainKHR, state: SwapchainState) {
    SWAPCHAINS.lock().insert(handle.as_raw(), Arc::new(Mutex::new(state)));
}

pub fn swapchain_state(handle: vk::SwapchainKHR) -> Option<Arc<Mutex<SwapchainState>>> {
    SWAPCHAINS.lock().get(&handle.as_raw()).cloned()
}

pub fn remove_swapchain(handle: vk::SwapchainKHR) -> Option<Arc<Mutex<SwapchainState>>> {
    SWAPCHAINS.lock().remove(&handle.as_raw())
}
