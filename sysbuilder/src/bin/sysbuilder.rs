// SPDX-License-Identifier: GPL-3.0-only

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use nix::fcntl::{Flock, FlockArg};
use sysbuilder::config::Config;
use sysbuilder::{logging, orchestrator};
use sysbuilder_sys::preflight;
use sysbuilder_sys::{DeviceProber, RetryPolicy, SystemExecutor};

#[derive(Debug, Parser)]
#[command(name = "sysbuilder")]
#[command(about = "Partition, format and mount OS disk images")]
struct Cli {
    /// Log at debug level (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Create the disk described by a config file and mount its filesystems
    Provision {
        config: PathBuf,
        /// Host directory to mount the new system's `/` on
        #[arg(long)]
        root: Option<PathBuf>,
        /// Leave the image attached and mounted for a later install stage
        #[arg(long)]
        keep_mounted: bool,
    },
    /// Unmount and detach loop devices left attached to a backing file
    Release { backing_file: PathBuf },
    /// Print what the kernel reports for a block device as JSON
    Probe { device: PathBuf },
}

/// Exclusive lock on `<path>.lock`, held until dropped.
fn lock_beside(path: &Path) -> Result<Flock<File>> {
    let mut lock_path = path.as_os_str().to_owned();
    lock_path.push(".lock");
    let lock_path = PathBuf::from(lock_path);

    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&lock_path)
        .with_context(|| format!("cannot open lock file {}", lock_path.display()))?;

    Flock::lock(file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
        anyhow!(
            "{} is in use by another sysbuilder run ({errno})",
            path.display()
        )
    })
}

fn provision(config_path: &Path, root: Option<PathBuf>, keep_mounted: bool) -> Result<()> {
    let config = Config::load(config_path)?;
    let storage = &config.storage;

    let filesystems: Vec<_> = storage.layout.iter().map(|e| e.filesystem.kind).collect();
    let missing = preflight::missing_tools(&preflight::required_tools(
        storage.disk.kind,
        &filesystems,
    ));
    if !missing.is_empty() {
        bail!("required tools not found on PATH: {}", missing.join(", "));
    }

    let root = root
        .or_else(|| storage.mount_root.clone())
        .unwrap_or_else(|| std::env::temp_dir().join(format!("sysbuilder-{}", std::process::id())));

    let _lock = if storage.disk.kind.is_virtual() {
        Some(lock_beside(&storage.disk.path)?)
    } else {
        None
    };

    let exec = SystemExecutor::new();
    let image = orchestrator::provision(&exec, storage, &root, RetryPolicy::default())?;

    for mount in image.mounts() {
        println!(
            "{} -> {} ({})",
            mount.device.display(),
            mount.target.display(),
            mount.mountpoint
        );
    }

    if keep_mounted {
        tracing::info!(
            "Leaving {} mounted at {}; run `sysbuilder release {}` when done",
            image.disk().path().display(),
            image.root().display(),
            storage.disk.path.display()
        );
        return Ok(());
    }

    image.teardown(&exec)?;
    Ok(())
}

fn release(backing_file: &Path) -> Result<()> {
    let _lock = lock_beside(backing_file)?;
    let exec = SystemExecutor::new();
    for device in orchestrator::release(&exec, backing_file, RetryPolicy::default())? {
        println!("{}", device.display());
    }
    Ok(())
}

fn probe(device: &Path) -> Result<()> {
    let exec = SystemExecutor::new();
    let prober = DeviceProber::new(&exec, RetryPolicy::immediate(1));
    let snapshot = prober
        .snapshot(device)?
        .ok_or_else(|| anyhow!("{} is not a block device", device.display()))?;
    println!("{}", serde_json::to_string_pretty(&snapshot)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if unsafe { libc::geteuid() } != 0 {
        tracing::warn!("Not running as root; losetup, sgdisk and mount will likely fail");
    }

    match cli.command {
        Command::Provision {
            config,
            root,
            keep_mounted,
        } => provision(&config, root, keep_mounted),
        Command::Release { backing_file } => release(&backing_file),
        Command::Probe { device } => probe(&device),
    }
}
