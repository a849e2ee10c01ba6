// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: MIT

//! The client side of the private per-client duplex channel: dials the
//! server's well-known socket, performs the handshake on a background
//! thread, and exposes the result to the render-thread interception points
//! without ever blocking them on IPC. The wire transport (`FabricChannel`)
//! mirrors the server's own `channel.rs` byte-for-byte; it's duplicated
//! rather than shared because the two sides dial in opposite directions and
//! have little else in common.

use std::{
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    path::Path,
    sync::Arc,
};

use anyhow::Context;
use crossbeam_channel::{Receiver, Sender};
use hudbus_protocol::{self as protocol, Config, FrameSample, FrameSamples, Handshake, MessageType, ReleaseFence};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::error::HudError;

const MAX_FDS: usize = 2;

/// Wire transport: a `SOCK_SEQPACKET` socket carrying length-prefixed
/// protobuf messages, with FDs riding as `SCM_RIGHTS` ancillary data.
struct FabricChannel {
    conn: uds::UnixSeqpacketConn,
    scratch: [u8; protocol::MAX_MESSAGE_SIZE],
}

impl FabricChannel {
    fn connect(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let conn = uds::UnixSeqpacketConn::connect(path.as_ref()).context("connecting to hudd socket")?;
        Ok(Self { conn, scratch: [0; protocol::MAX_MESSAGE_SIZE] })
    }

    fn send(&mut self, msg: &MessageType, fds: &[OwnedFd]) -> anyhow::Result<()> {
        let expected = protocol::expected_fd_count(msg);
        anyhow::ensure!(fds.len() == expected, "message {} requires {} fds, got {}", msg, expected, fds.len());

        let len = protocol::encode_message(msg, &mut self.scratch).context(format!("failed to encode {}", msg))?;

        let raw_fds: Vec<RawFd> = fds.iter().map(|fd| fd.as_raw_fd()).collect();
        self.conn.send_fds(&self.scratch[..len], &raw_fds).context("sending message")?;

        Ok(())
    }

    fn recv(&mut self) -> anyhow::Result<(MessageType, Vec<OwnedFd>)> {
        let mut fd_buf = [-1_i32; MAX_FDS];
        let mut data_buf = [0u8; protocol::MAX_MESSAGE_SIZE];

        let (data_len, truncated, fd_count) =
            self.conn.recv_fds(&mut data_buf, &mut fd_buf).context("receiving message")?;
        if truncated {
            return Err(HudError::SchemaMismatch("message truncated".into()).into());
        }

        let (msg, _) = protocol::decode_message(&data_buf[..data_len])
            .map_err(|e| HudError::SchemaMismatch(e.to_string()))?;

        let expected = protocol::expected_fd_count(&msg);
        if fd_count != expected {
            return Err(HudError::SchemaMismatch(format!(
                "message {msg} arrived with {fd_count} fds, expected {expected}"
            ))
            .into());
        }

        let fds = fd_buf[..fd_count].iter().map(|&raw| unsafe { OwnedFd::from_raw_fd(raw) }).collect();

        Ok((msg, fds))
    }
}

/// The last `Dmabuf` message received, plus a generation counter bumped on
/// every new one so the swapchain layer can detect "this is a different
/// buffer than the one I imported last" without comparing every field.
#[derive(Clone)]
pub struct DmabufDescriptor {
    pub generation: u64,
    pub modifier: u64,
    pub dmabuf_offset: u32,
    pub stride: u32,
    pub fourcc: u32,
    pub plane_size: u64,
    pub width: u32,
    pub height: u32,
    pub has_gbm: bool,
    pub opaque_size: u64,
    pub opaque_offset: u32,
    pub dmabuf_fd: Arc<OwnedFd>,
    pub opaque_fd: Arc<OwnedFd>,
}

struct Shared {
    dmabuf: Mutex<Option<DmabufDescriptor>>,
    acquire_fd: Mutex<Option<OwnedFd>>,
}

enum Outgoing {
    ReleaseFence(OwnedFd),
    FrameSample(u64, u64),
    Config(f32),
}

/// A live connection to the server. Owns a background worker thread; dropping
/// this handle signals the worker to exit by closing the outgoing channel,
/// but does not block waiting for it to notice.
pub struct Connection {
    shared: Arc<Shared>,
    outgoing: Sender<Outgoing>,
    _worker: std::thread::JoinHandle<()>,
}

impl Connection {
    /// Connects to `socket_path` and starts the handshake on a background
    /// thread. Returns once the socket is open; `take_dmabuf`/`take_acquire_fd`
    /// return `None` until the handshake and steady-state exchange have
    /// actually produced something.
    pub fn connect(socket_path: impl AsRef<Path>, engine_name: &str) -> anyhow::Result<Self> {
        let channel = FabricChannel::connect(socket_path)?;

        let shared = Arc::new(Shared { dmabuf: Mutex::new(None), acquire_fd: Mutex::new(None) });
        let (outgoing_tx, outgoing_rx) = crossbeam_channel::unbounded();

        let worker_shared = shared.clone();
        let engine_name = engine_name.to_string();
        let worker = std::thread::Builder::new()
            .name("hud-fabric".into())
            .spawn(move || run_worker(channel, engine_name, worker_shared, outgoing_rx))
            .context("spawning fabric worker thread")?;

        Ok(Self { shared, outgoing: outgoing_tx, _worker: worker })
    }

    /// Takes the current dma-buf descriptor if one hasn't been taken yet
    /// (the swapchain layer's `needs_import` check). Returns `None` once
    /// taken, until the next `Dmabuf` message replaces it.
    pub fn take_dmabuf(&self) -> Option<DmabufDescriptor> {
        self.shared.dmabuf.lock().take()
    }

    /// Takes the current acquire fd, if the server has sent one that hasn't
    /// already been claimed. The caller still has to poll it themselves
    /// (`sync_file::is_signaled`) before treating the frame as ready.
    pub fn take_acquire_fd(&self) -> Option<OwnedFd> {
        self.shared.acquire_fd.lock().take()
    }

    pub fn send_release_fence(&self, fd: OwnedFd) {
        let _ = self.outgoing.send(Outgoing::ReleaseFence(fd));
    }

    pub fn send_frame_sample(&self, seq: u64, timestamp_ns: u64) {
        let _ = self.outgoing.send(Outgoing::FrameSample(seq, timestamp_ns));
    }

    pub fn send_config(&self, fps_limit: f32) {
        let _ = self.outgoing.send(Outgoing::Config(fps_limit));
    }
}

fn run_worker(mut channel: FabricChannel, engine_name: String, shared: Arc<Shared>, outgoing: Receiver<Outgoing>) {
    if let Err(e) = handshake(&mut channel, &engine_name) {
        warn!("hud fabric handshake failed: {e:#}");
        return;
    }

    let mut generation = 0u64;
    let mut sample_batch = Vec::new();

    loop {
        while let Ok(msg) = outgoing.try_recv() {
            match msg {
                Outgoing::ReleaseFence(fd) => {
                    if let Err(e) = channel.send(&ReleaseFence {}.into(), &[fd]) {
                        warn!("sending release fence failed: {e:#}");
                        return;
                    }
                }
                Outgoing::FrameSample(seq, timestamp_ns) => {
                    sample_batch.push(FrameSample { seq, timestamp_ns });
                    if sample_batch.len() >= 32 {
                        flush_samples(&mut channel, &mut sample_batch);
                    }
                }
                Outgoing::Config(fps_limit) => {
                    if let Err(e) = channel.send(&Config { fps_limit }.into(), &[]) {
                        warn!("sending config failed: {e:#}");
                        return;
                    }
                }
            }
        }

        if !sample_batch.is_empty() {
            flush_samples(&mut channel, &mut sample_batch);
        }

        match channel.recv() {
            Ok((MessageType::Dmabuf(d), mut fds)) => {
                if fds.len() != 2 {
                    warn!("dmabuf message arrived with {} fds, expected 2", fds.len());
                    continue;
                }

                generation += 1;
                let opaque_fd = fds.pop().unwrap();
                let dmabuf_fd = fds.pop().unwrap();

                *shared.dmabuf.lock() = Some(DmabufDescriptor {
                    generation,
                    modifier: d.modifier,
                    dmabuf_offset: d.dmabuf_offset,
                    stride: d.stride,
                    fourcc: d.fourcc,
                    plane_size: d.plane_size,
                    width: d.width,
                    height: d.height,
                    has_gbm: d.has_gbm,
                    opaque_size: d.opaque_size,
                    opaque_offset: d.opaque_offset,
                    dmabuf_fd: Arc::new(dmabuf_fd),
                    opaque_fd: Arc::new(opaque_fd),
                });

                debug!(generation, width = d.width, height = d.height, "received dmabuf");
            }
            Ok((MessageType::FenceReady(_), mut fds)) => {
                if let Some(fd) = fds.pop() {
                    // A fresh acquire fd always supersedes a stale, unconsumed
                    // one; dropping the old one here closes it.
                    *shared.acquire_fd.lock() = Some(fd);
                }
            }
            Ok((other, _)) => {
                debug!("ignoring unexpected message in steady state: {other}");
            }
            Err(e) => {
                warn!(cause = %e, "{}", HudError::PeerGone);
                return;
            }
        }
    }
}

fn flush_samples(channel: &mut FabricChannel, batch: &mut Vec<FrameSample>) {
    let samples = std::mem::take(batch);
    if let Err(e) = channel.send(&FrameSamples { samples }.into(), &[]) {
        warn!("sending frame samples failed: {e:#}");
    }
}

fn handshake(channel: &mut FabricChannel, engine_name: &str) -> anyhow::Result<()> {
    let render_minor = default_render_minor()?;

    channel.send(&Handshake { engine_name: engine_name.to_string(), render_minor }.into(), &[])?;

    let (msg, _) = channel.recv()?;
    let MessageType::HandshakeAck(ack) = msg else {
        anyhow::bail!("expected HandshakeAck, got {msg}");
    };

    info!(protocol_version = ack.protocol_version, "connected to hud server");
    Ok(())
}

/// The render-minor number of the render node this process's Vulkan device
/// was created against. A real layer reads this from the physical device's
/// `VkPhysicalDeviceDrmPropertiesEXT` at `vkCreateDevice` time (see
/// `crate::vulkan`); the handshake itself runs before any of that is wired
/// up in this module, so the value is threaded in via an env var the
/// launcher sets, falling back to the first render node found.
fn default_render_minor() -> anyhow::Result<u32> {
    if let Ok(val) = std::env::var("HUD_RENDER_MINOR") {
        return val.parse().context("parsing HUD_RENDER_MINOR");
    }

    for entry in std::fs::read_dir("/dev/dri").context("reading /dev/dri")? {
        let entry = entry?;
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if let Some(minor) = name.strip_prefix("renderD").and_then(|n| n.parse::<u32>().ok()) {
            return Ok(minor - 128);
        }
    }

    anyhow::bail!("no render node found under /dev/dri")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_render_minor_honors_env_override() {
        std::env::set_var("HUD_RENDER_MINOR", "129");
        assert_eq!(default_render_minor().unwrap(), 129);
        std::env::remove_var("HUD_RENDER_MINOR");
    }
}
