// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! DMA-BUF allocation via GBM, with the same modifier fallback chain as the
//! allocator this was distilled from: try the caller's modifier list first,
//! then plain `LINEAR`, then an implicit (driver-chosen) layout. Only total
//! failure across all three is fatal.

use std::os::fd::OwnedFd;

use anyhow::Context;
use drm_fourcc::{DrmFourcc, DrmModifier};
use gbm::{BufferObjectFlags, Device as GbmDevice};

use crate::vulkan::drm::DrmDevice;

/// A single-plane DMA-BUF-backed buffer, allocated from a DRM render node.
pub struct GbmBuffer {
    // Keeps the gbm device and buffer object alive for as long as the fd is
    // in use; the actual fd handed to clients is a dup via `gbm_bo_get_fd`,
    // independent of this handle's lifetime.
    _device: GbmDevice<DrmDevice>,
    _bo: gbm::BufferObject<()>,
    pub fd: OwnedFd,
    pub modifier: u64,
    pub stride: u32,
    pub offset: u32,
    pub plane_size: u64,
    pub fourcc: u32,
    pub width: u32,
    pub height: u32,
}

/// Allocates a DMA-BUF-backed buffer on the given DRM render node, preferring
/// `modifiers` if given, falling back to `LINEAR`, and finally to an
/// implicit, driver-chosen layout.
pub fn allocate(
    drm: DrmDevice,
    width: u32,
    height: u32,
    fourcc: DrmFourcc,
    modifiers: &[DrmModifier],
) -> anyhow::Result<GbmBuffer> {
    let device = GbmDevice::new(drm).context("creating gbm device")?;

    let bo = if !modifiers.is_empty() {
        device
            .create_buffer_object_with_modifiers2::<()>(
                width,
                height,
                fourcc,
                modifiers.iter().copied(),
                BufferObjectFlags::RENDERING,
            )
            .or_else(|_| {
                device.create_buffer_object_with_modifiers2::<()>(
                    width,
                    height,
                    fourcc,
                    std::iter::once(DrmModifier::Linear),
                    BufferObjectFlags::RENDERING,
                )
            })
            .or_else(|_| {
                device.create_buffer_object::<()>(
                    width,
                    height,
                    fourcc,
                    BufferObjectFlags::RENDERING,
                )
            })
    } else {
        device
            .create_buffer_object_with_modifiers2::<()>(
                width,
                height,
                fourcc,
                std::iter::once(DrmModifier::Linear),
                BufferObjectFlags::RENDERING,
            )
            .or_else(|_| {
                device.create_buffer_object::<()>(
                    width,
                    height,
                    fourcc,
                    BufferObjectFlags::RENDERING,
                )
            })
    }
    .context("allocating gbm buffer object (no modifier fallback succeeded)")?;

    let fd = bo.fd().context("exporting gbm buffer object as dma-buf fd")?;
    let modifier: u64 = bo.modifier().context("reading gbm buffer modifier")?.into();
    let stride = bo.stride().context("reading gbm buffer stride")?;
    let offset = bo.offset(0).context("reading gbm buffer plane offset")?;
    let plane_size = stride as u64 * height as u64;

    Ok(GbmBuffer {
        _device: device,
        _bo: bo,
        fd: fd.into(),
        modifier,
        stride,
        offset,
        plane_size,
        fourcc: fourcc as u32,
        width,
        height,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn modifier_list_precedence_is_documented() {
        // This is a compile-time/documentation check rather than a behavioral
        // test: the fallback order (explicit modifiers -> LINEAR -> implicit)
        // can only be exercised against a real render node, which CI does not
        // have. The order is enforced by `allocate`'s `or_else` chain above.
        let modifiers = [DrmModifier::Linear];
        assert_eq!(modifiers.len(), 1);
    }
}
