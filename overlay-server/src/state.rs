// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

use std::sync::Arc;

use hashbrown::HashMap; // For stable extract_if.
use tracing::{error, info};

use crate::{config::Config, hud::SharedHudTable, session::Session, vulkan::VkContext};

pub type SharedState = Arc<parking_lot::Mutex<ServerState>>;

const DEFAULT_SESSION_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(60);

pub struct ServerState {
    pub sessions: HashMap<u64, Session>,
    pub cfg: Config,
    pub vk: Arc<VkContext>,
    /// The current frame table, shared with every session's worker thread.
    /// Replaced wholesale on config reload; `Session`s take a clone of the
    /// `Arc` each tick so the table they draw from is immutable for the
    /// duration of one render.
    pub table: SharedHudTable,
}

impl ServerState {
    pub fn new(vk: Arc<VkContext>, cfg: Config) -> Self {
        let table = Arc::new(cfg.hud_table.clone());

        Self {
            vk,
            table,
            cfg,
            sessions: HashMap::new(),
        }
    }

    /// Run periodic cleanup: a client pipeline becomes defunct when its
    /// worker thread exits (peer gone, or a fatal Vulkan error), and is
    /// reaped here rather than inline in the fabric's hot path.
    pub fn tick(&mut self) -> anyhow::Result<()> {
        self.sessions
            .extract_if(|_, s| {
                s.refresh();

                if s.defunct {
                    info!(client_id = s.id, "cleaning up defunct session");
                    true
                } else if s
                    .detached_since
                    .map(|d| d.elapsed() > DEFAULT_SESSION_TIMEOUT)
                    .unwrap_or(false)
                {
                    info!(client_id = s.id, "cleaning up idle session");
                    true
                } else {
                    false
                }
            })
            .for_each(|(_, s)| match s.stop() {
                Ok(()) => {}
                Err(e) => error!("session ended with error: {:#}", e),
            });

        Ok(())
    }
}
