// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The small set of error kinds callers actually branch on; everything else
//! is `anyhow::Result` with `.context(...)`, same split as the server side.
//!
//! One variant per row of the error-handling table: `ConfigInvalid` is never
//! constructed in this crate (its only producer is the server's YAML loader)
//! but is kept here so the taxonomy is a single enum rather than split across
//! crates - the same "carried but not exercised on this side" treatment
//! `Config.fps_limit` gets.

#[derive(Debug, thiserror::Error)]
pub enum HudError {
    #[error("invalid configuration: {0}")]
    ConfigInvalid(String),
    #[error("no suitable render target for dma-buf import: {0}")]
    DeviceUnsuitable(String),
    #[error("transient vulkan error, skipping this tick: {0}")]
    TransientVulkan(ash::vk::Result),
    #[error("fatal vulkan error: {0}")]
    FatalVulkan(ash::vk::Result),
    #[error("server connection lost")]
    PeerGone,
    #[error("failed to duplicate fd: {0}")]
    FDDupFailed(#[from] std::io::Error),
    #[error("message schema mismatch: {0}")]
    SchemaMismatch(String),
}

impl HudError {
    /// Classifies a raw `vk::Result` the way the overview's failure table
    /// does: device-lost and out-of-memory are fatal, everything else from
    /// a per-frame submit is transient and safely skippable.
    pub fn from_vk_result(result: ash::vk::Result) -> Self {
        use ash::vk::Result as VkResult;
        match result {
            VkResult::ERROR_DEVICE_LOST
            | VkResult::ERROR_OUT_OF_DEVICE_MEMORY
            | VkResult::ERROR_OUT_OF_HOST_MEMORY => HudError::FatalVulkan(result),
            _ => HudError::TransientVulkan(result),
        }
    }
}
