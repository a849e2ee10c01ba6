// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

//! A single connected client's lifecycle: owns its duplex channel and
//! per-client render pipeline on a dedicated worker thread, and enforces the
//! at-most-one-in-flight-frame backpressure contract directly in that
//! thread's control flow.

use std::{
    os::fd::AsFd,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time,
};

use anyhow::{anyhow, Context};
use lazy_static::lazy_static;
use parking_lot::Mutex;
use tracing::{debug_span, info, warn};

use hudbus_protocol::{Dmabuf, FenceReady, HandshakeAck, MessageType};

use crate::{
    channel::SessionChannel,
    fps::FrameStats,
    hud::SharedHudTable,
    hud_widget,
    pipeline::ClientPipeline,
    vulkan::{drm::DrmDevice, VkContext},
};

/// A live client session. Owned by [`crate::state::ServerState`], which
/// reaps it once `defunct` is observed true.
pub struct Session {
    pub id: u64,
    pub started: time::SystemTime,
    pub started_instant: time::Instant,
    pub defunct: bool,
    pub detached_since: Option<time::Instant>,

    running: Arc<AtomicBool>,
    last_activity: Arc<Mutex<time::Instant>>,
    frame_stats: Arc<Mutex<FrameStats>>,
    shutdown_fd: std::os::fd::OwnedFd,
    worker_handle: std::thread::JoinHandle<()>,
}

impl Session {
    /// Spawns the worker thread for a freshly accepted connection. The
    /// worker performs the handshake itself (the first message on a new
    /// channel must be `Handshake`); `spawn` returns as soon as the thread
    /// starts, without waiting for that handshake to complete.
    pub fn spawn(
        vk: Arc<VkContext>,
        channel: SessionChannel,
        conn_fd: impl AsFd,
        table: SharedHudTable,
        font_size: u32,
    ) -> anyhow::Result<Self> {
        let id = generate_id();
        let running = Arc::new(AtomicBool::new(true));
        let last_activity = Arc::new(Mutex::new(time::Instant::now()));
        let frame_stats = Arc::new(Mutex::new(FrameStats::new()));
        let shutdown_fd = conn_fd
            .as_fd()
            .try_clone_to_owned()
            .context("duplicating connection fd for shutdown")?;

        let running_clone = running.clone();
        let last_activity_clone = last_activity.clone();
        let frame_stats_clone = frame_stats.clone();

        let worker_handle = std::thread::Builder::new()
            .name(format!("session-{id}"))
            .spawn(move || {
                let span = debug_span!("session", client_id = id);
                let _guard = span.enter();

                if let Err(e) = run_worker(vk, channel, table, font_size, &last_activity_clone, &frame_stats_clone) {
                    warn!("session ended: {e:#}");
                }

                running_clone.store(false, Ordering::Relaxed);
            })
            .context("spawning session worker thread")?;

        info!(client_id = id, "accepted new session");

        Ok(Self {
            id,
            started: time::SystemTime::now(),
            started_instant: time::Instant::now(),
            defunct: false,
            detached_since: None,
            running,
            last_activity,
            frame_stats,
            shutdown_fd,
            worker_handle,
        })
    }

    /// The client's current smoothed FPS/frametime, for an external metrics
    /// collector resolving this session's `GLOBAL` metric group.
    pub fn frame_stats(&self) -> Arc<Mutex<FrameStats>> {
        self.frame_stats.clone()
    }

    /// Refreshes `defunct`/`detached_since` from the worker's observed
    /// state; called once per reaper tick before the idle-timeout check.
    pub fn refresh(&mut self) {
        if !self.running.load(Ordering::Relaxed) {
            self.defunct = true;
            return;
        }

        self.detached_since = Some(*self.last_activity.lock());
    }

    pub fn stop(self) -> anyhow::Result<()> {
        // Shutting down both directions unblocks the worker's blocking recv
        // even if the client itself never closes its end.
        let _ = rustix::net::shutdown(&self.shutdown_fd, rustix::net::Shutdown::ReadWrite);

        self.worker_handle
            .join()
            .map_err(|v| anyhow!("session worker panicked: {v:?}"))
    }
}

fn run_worker(
    vk: Arc<VkContext>,
    mut channel: SessionChannel,
    table: SharedHudTable,
    font_size: u32,
    last_activity: &Mutex<time::Instant>,
    frame_stats: &Mutex<FrameStats>,
) -> anyhow::Result<()> {
    let (msg, _fds) = channel.recv().context("waiting for handshake")?;
    let MessageType::Handshake(handshake) = msg else {
        anyhow::bail!("expected Handshake, got {msg}");
    };

    info!(
        engine = handshake.engine_name,
        render_minor = handshake.render_minor,
        "client handshake"
    );

    let device_info = vk
        .for_render_minor(handshake.render_minor as i64)
        .context("selecting render device")?;

    // `for_render_minor` returns `None` when the server's own default device
    // already matches; either way, every pipeline shares the single
    // process-wide `VkContext`, since cross-device dma-buf export would
    // require a copy this design doesn't support (see overview, "clients and
    // server share a kernel and a render node").
    if device_info.is_some() {
        warn!("client requested a render node other than the server's selected device; using the server's device anyway");
    }

    let drm = DrmDevice::new(render_minor_to_devnum(handshake.render_minor))
        .context("opening render node for gbm allocation")?;

    let (width, height) = hud_widget::estimate_canvas_size(&table, font_size);
    let mut pipeline = ClientPipeline::new(vk, drm, width, height, &[])?;

    channel
        .send(&HandshakeAck { protocol_version: 1 }.into(), &[])
        .context("sending handshake ack")?;

    send_dmabuf(&mut channel, &pipeline)?;

    loop {
        *last_activity.lock() = time::Instant::now();

        let (acquire_fd, (fit_width, fit_height)) = pipeline.render_tick(&table, font_size)?;
        channel
            .send(&MessageType::from(FenceReady {}), &[acquire_fd])
            .context("sending fence")?;

        // Auto-fit: the frame just drawn told us its real content bounding
        // box. If it no longer matches the canvas, resize for the next tick
        // and push the new dma-buf descriptor - the extent is determined by
        // what actually got drawn, not by a pre-computed estimate.
        if (fit_width, fit_height) != (pipeline.width, pipeline.height) {
            let drm = DrmDevice::new(render_minor_to_devnum(handshake.render_minor))
                .context("reopening render node to resize canvas")?;
            pipeline.resize(drm, fit_width, fit_height, &[]).context("resizing canvas to fit content")?;
            send_dmabuf(&mut channel, &pipeline)?;
        }

        let (msg, fds) = channel.recv().context("waiting for client message")?;
        match msg {
            MessageType::ReleaseFence(_) => {
                // The release fd itself carries no data we need; dropping it
                // here (via `fds` going out of scope) is the signal that the
                // client is done with the previous frame.
                drop(fds);
            }
            MessageType::FrameSamples(samples) => {
                frame_stats.lock().push(&samples.samples);
            }
            MessageType::Config(cfg) => {
                // `fps_limit` rides along for wire compatibility but is
                // deliberately never enforced here (see config.rs).
                let _ = cfg.fps_limit;
            }
            other => {
                anyhow::bail!("unexpected message in steady state: {other}");
            }
        }
    }
}

fn send_dmabuf(channel: &mut SessionChannel, pipeline: &ClientPipeline) -> anyhow::Result<()> {
    let desc = pipeline.export_descriptor()?;

    let msg = Dmabuf {
        modifier: desc.modifier,
        dmabuf_offset: desc.dmabuf_offset,
        stride: desc.stride,
        fourcc: desc.fourcc,
        plane_size: desc.plane_size,
        width: desc.width,
        height: desc.height,
        server_render_minor: 0,
        has_gbm: desc.has_gbm,
        opaque_size: desc.opaque_size,
        opaque_offset: desc.opaque_offset,
    };

    channel
        .send(&msg.into(), &[desc.dmabuf_fd, desc.opaque_fd])
        .context("sending dmabuf descriptor")
}

/// The reference implementation keys render nodes by DRM `dev_t`; the wire
/// protocol only carries the minor number (clients only ever address `/dev/dri/renderD<minor>`
/// nodes, whose major is always 226). Reconstructing the `dev_t` here keeps
/// `DrmDevice::new`'s signature aligned with `drm::node::DrmNode`'s own
/// dev-id-based lookup.
fn render_minor_to_devnum(minor: u32) -> libc::dev_t {
    libc::makedev(226, minor)
}

lazy_static! {
    static ref ID_GENERATOR: std::sync::Mutex<tiny_id::ShortCodeGenerator<char>> =
        std::sync::Mutex::new(tiny_id::ShortCodeGenerator::new_numeric(6));
}

fn generate_id() -> u64 {
    ID_GENERATOR.lock().unwrap().next_int()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_minor_roundtrips_through_makedev() {
        let dev = render_minor_to_devnum(128);
        assert_eq!(unsafe { libc::minor(dev) }, 128);
        assert_eq!(unsafe { libc::major(dev) }, 226);
    }
}
