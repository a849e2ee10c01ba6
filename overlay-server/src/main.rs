// Copyright 2024 Colin Marc <hi@colinmarc.com>
//
// SPDX-License-Identifier: BUSL-1.1

mod channel;
mod config;
mod container;
mod fps;
mod gbm_alloc;
mod hud;
mod hud_widget;
mod pipeline;
mod server;
mod session;
mod state;
mod sync_file;
mod vulkan;
mod waking_sender;

use std::{
    os::unix::fs::DirBuilderExt,
    path::{Path, PathBuf},
    process::Command,
    sync::Arc,
};

use anyhow::{bail, Context, Result};
use clap::Parser;
use parking_lot::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::{util::SubscriberInitExt, EnvFilter, Layer};

/// Default location for the private per-client duplex socket, relative to
/// `$XDG_RUNTIME_DIR` (falling back to `/tmp`).
const DEFAULT_SOCKET_NAME: &str = "hud.sock";

#[derive(Debug, Parser)]
#[command(name = "hudd")]
#[command(about = "The metrics overlay render server", long_about = None)]
struct Cli {
    /// Print the version.
    #[arg(short, long)]
    version: bool,
    /// Path to the duplex socket clients connect to. Defaults to
    /// $XDG_RUNTIME_DIR/hud.sock.
    #[arg(long, value_name = "PATH")]
    socket: Option<PathBuf>,
    /// Path to a config file. By default,
    /// $XDG_CONFIG_HOME/MangoHud/MangoHud.yml is used (if present).
    #[arg(short = 'C', long, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Generate a bug report in a temporary directory, including a full trace
    /// log and vulkaninfo output.
    #[arg(long)]
    bug_report: bool,
}

fn main() -> Result<()> {
    let args = Cli::parse();

    let version = format!(
        "hudd {}",
        git_version::git_version!(
            args = ["--always", "--tags", "--match", "hudd-v"],
            prefix = "git:",
            cargo_prefix = "",
        )
    );

    if args.version {
        println!("{}", version);
        return Ok(());
    }

    let bug_report_dir = if args.bug_report {
        let dirname = std::env::temp_dir().join(format!("hudd-bugreport-{}", std::process::id()));
        std::fs::DirBuilder::new().mode(0o0755).create(&dirname)?;

        Some(dirname)
    } else {
        None
    };

    init_logging(bug_report_dir.as_ref())?;

    debug!(version, "starting up");
    if let Some(ref dirname) = bug_report_dir {
        warn!("generating bug report files in: {:?}", &dirname);
    }

    #[cfg(feature = "tracy")]
    warn!("tracing enabled!");

    let cfg = if let Some(path) = &args.config {
        config::Config::load_path(path).context("failed to read config")?
    } else {
        config::Config::load().context("failed to read config")?
    };

    let vk = Arc::new(vulkan::VkContext::new(cfg!(debug_assertions))?);

    preflight_checks(&vk)?;

    let socket_path = args
        .socket
        .or_else(default_socket_path)
        .context("could not determine a socket path; pass --socket explicitly")?;

    if socket_path.exists() {
        std::fs::remove_file(&socket_path)
            .context(format!("removing stale socket at {}", socket_path.display()))?;
    }

    let state = Arc::new(Mutex::new(state::ServerState::new(vk, cfg)));
    let mut srv = server::Server::bind(&socket_path, state)?;

    let closer = srv.closer();
    ctrlc::set_handler(move || {
        debug!("received SIGINT");
        closer.send(()).ok();
    })?;

    info!(path = %socket_path.display(), "listening");
    srv.run().context("server exited")?;

    if let Some(dir) = &bug_report_dir {
        save_vulkaninfo(dir);
        info!("bug report files saved to: {:?}", dir);
    }

    Ok(())
}

fn default_socket_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_RUNTIME_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/tmp"));

    Some(base.join(DEFAULT_SOCKET_NAME))
}

fn init_logging(bug_report_dir: Option<impl AsRef<Path>>) -> Result<()> {
    use tracing_subscriber::layer::SubscriberExt;

    let trace_log = if let Some(dir) = bug_report_dir {
        let file = std::fs::File::create(dir.as_ref().join("hudd.log"))?;
        let trace_filter = tracing_subscriber::EnvFilter::new("hudd=trace");

        let trace_log = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(std::sync::Mutex::new(file))
            .with_filter(trace_filter);

        Some(trace_log)
    } else {
        None
    };

    let tracy = if cfg!(feature = "tracy") {
        Some(tracing_tracy::TracyLayer::default().with_filter(EnvFilter::new("hudd=trace")))
    } else {
        None
    };

    let printed_log = tracing_subscriber::fmt::layer().with_filter(
        EnvFilter::builder()
            .with_default_directive("hudd=info".parse()?)
            .from_env_lossy(),
    );

    tracing_subscriber::registry()
        .with(tracy)
        .with(trace_log)
        .with(printed_log)
        .init();

    Ok(())
}

fn preflight_checks(vk: &vulkan::VkContext) -> anyhow::Result<()> {
    match linux_version() {
        Some((major, minor)) if major < 5 => {
            bail!("kernel version {major}.{minor} is too low; 5.x or later required for dma-buf sync-file import");
        }
        None => warn!("unable to determine linux kernel version!"),
        _ => (),
    }

    match vk.device_info.driver_version {
        vulkan::DriverVersion::MesaRadv {
            major,
            minor,
            patch,
        } => {
            if major < 24 || (major == 24 && minor < 3) {
                bail!("mesa >= 24.3 required, have {major}.{minor}.{patch}");
            }
        }
        vulkan::DriverVersion::NvidiaProprietary { major, minor } => {
            if major < 565 {
                bail!("driver version >= 565.x required, have {major}.{minor}");
            }
        }
        vulkan::DriverVersion::Other(ref driver) => {
            warn!(driver, "using potentially unsupported vulkan driver")
        }
    }

    Ok(())
}

fn linux_version() -> Option<(u32, u32)> {
    let uname = rustix::system::uname();
    let version = uname.release().to_str().ok()?;

    let version = version.split_whitespace().next()?;
    let mut parts = version.splitn(3, ".");
    let major = parts.next()?;
    let minor = parts.next()?;

    Some((major.parse().ok()?, minor.parse().ok()?))
}

fn save_vulkaninfo(bug_report_dir: impl AsRef<Path>) {
    match Command::new("vulkaninfo").env_clear().output() {
        Ok(output) => {
            let _ = std::fs::write(
                bug_report_dir.as_ref().join("vulkaninfo.log"),
                output.stdout,
            );
        }
        Err(e) => debug!("failed to run vulkaninfo: {:#}", e),
    }
}

#[test]
fn test_linux_version() {
    let Some((major, _minor)) = linux_version() else {
        panic!("failed to determine linux version");
    };

    assert!(major >= 5);
}
