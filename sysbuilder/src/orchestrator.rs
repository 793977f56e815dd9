// SPDX-License-Identifier: GPL-3.0-only

//! Storage provisioning sequence and teardown
//!
//! [`provision`] takes a validated [`StorageConfig`] from nothing to a
//! mounted tree under a host directory:
//!
//! 1. create the backing file and attach it (or open a physical disk)
//! 2. write the partition table and wait until the kernel shows every partition
//! 3. format every layout entry in order
//! 4. mount every non-swap entry below the root, parents before children
//!
//! Any failure unwinds what was done (unmount in reverse order, then detach)
//! and returns the original error together with whatever the unwind could
//! not undo.

use std::fmt;
use std::path::{Path, PathBuf};

use sysbuilder_sys::device::{associated_loop_devices, create_backing_file};
use sysbuilder_sys::{BlockDevice, CommandExecutor, DeviceProber, RetryPolicy, SysError};
use sysbuilder_types::{DiskKind, DiskSpec, MountPoint, TypeCode};
use thiserror::Error;

use crate::config::StorageConfig;

/// One teardown step that did not succeed.
#[derive(Debug)]
pub struct CleanupFailure {
    pub step: String,
    pub error: SysError,
}

impl fmt::Display for CleanupFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.step, self.error)
    }
}

fn render_cleanup(cleanup: &[CleanupFailure]) -> String {
    if cleanup.is_empty() {
        return String::new();
    }
    let steps: Vec<String> = cleanup.iter().map(ToString::to_string).collect();
    format!(" (cleanup also failed: {})", steps.join("; "))
}

/// Provisioning failed; `source` is the first error, `cleanup` lists the
/// unwind steps that failed afterwards.
#[derive(Debug, Error)]
#[error("{source}{}", render_cleanup(.cleanup))]
pub struct ProvisionError {
    #[source]
    pub source: SysError,
    pub cleanup: Vec<CleanupFailure>,
}

impl From<SysError> for ProvisionError {
    fn from(source: SysError) -> Self {
        Self {
            source,
            cleanup: Vec::new(),
        }
    }
}

/// Teardown could not release everything.
#[derive(Debug, Error)]
#[error("teardown incomplete{}", render_cleanup(.failures))]
pub struct TeardownError {
    pub failures: Vec<CleanupFailure>,
}

/// A layout entry mounted below the image root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountRecord {
    /// Zero-based layout position.
    pub position: usize,
    pub device: PathBuf,
    /// Mount point inside the installed system.
    pub mountpoint: MountPoint,
    /// Where it is mounted on the host.
    pub target: PathBuf,
}

/// A partitioned, formatted and mounted disk, ready for the install stage.
#[derive(Debug)]
pub struct ProvisionedImage {
    disk: BlockDevice,
    root: PathBuf,
    mounts: Vec<MountRecord>,
}

impl ProvisionedImage {
    pub fn disk(&self) -> &BlockDevice {
        &self.disk
    }

    /// Host directory holding `/` of the installed system.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Mounts in the order they were made.
    pub fn mounts(&self) -> &[MountRecord] {
        &self.mounts
    }

    /// Mount points other than `/`, e.g. `/efi`, for the install stage to
    /// write into fstab and the boot loader configuration.
    pub fn special_mounts(&self) -> Vec<&MountPoint> {
        self.mounts
            .iter()
            .map(|mount| &mount.mountpoint)
            .filter(|mountpoint| !mountpoint.is_root())
            .collect()
    }

    /// Unmount everything in reverse order and detach the disk.
    pub fn teardown(mut self, exec: &dyn CommandExecutor) -> Result<(), TeardownError> {
        let mounted = mounted_pairs(&self.mounts);
        let failures = unwind(exec, &mut self.disk, &mounted);
        if failures.is_empty() {
            Ok(())
        } else {
            Err(TeardownError { failures })
        }
    }
}

/// Build the storage described by `storage` and mount it below `root`.
pub fn provision(
    exec: &dyn CommandExecutor,
    storage: &StorageConfig,
    root: &Path,
    policy: RetryPolicy,
) -> Result<ProvisionedImage, ProvisionError> {
    let prober = DeviceProber::new(exec, policy);

    tracing::info!(
        "Provisioning {} disk {} with {} partitions",
        storage.disk.kind,
        storage.disk.path.display(),
        storage.layout.len()
    );

    let mut disk = acquire(exec, &prober, &storage.disk)?;
    let mut mounts = Vec::new();

    match build(&prober, &mut disk, storage, root, &mut mounts) {
        Ok(()) => {
            tracing::info!(
                "Image ready: {} mounted at {}",
                disk.path().display(),
                root.display()
            );
            Ok(ProvisionedImage {
                disk,
                root: root.to_path_buf(),
                mounts,
            })
        }
        Err(source) => {
            tracing::error!("Provisioning failed: {}", source);
            let cleanup = unwind(exec, &mut disk, &mounted_pairs(&mounts));
            for failure in &cleanup {
                tracing::warn!("Cleanup step failed: {}", failure);
            }
            Err(ProvisionError { source, cleanup })
        }
    }
}

fn acquire(
    exec: &dyn CommandExecutor,
    prober: &DeviceProber<'_>,
    disk: &DiskSpec,
) -> Result<BlockDevice, SysError> {
    match disk.kind {
        DiskKind::Sparse | DiskKind::Raw => {
            let size = disk.size.ok_or_else(|| SysError::InvalidState {
                device: disk.path.clone(),
                reason: format!("{} disks need a size", disk.kind),
            })?;
            create_backing_file(exec, &disk.path, disk.kind, size.bytes())?;
            BlockDevice::attach(exec, &disk.path)
        }
        DiskKind::Physical => BlockDevice::open(prober, &disk.path),
    }
}

fn build(
    prober: &DeviceProber<'_>,
    disk: &mut BlockDevice,
    storage: &StorageConfig,
    root: &Path,
    mounts: &mut Vec<MountRecord>,
) -> Result<(), SysError> {
    let exec = prober.executor();
    let layout = &storage.layout;

    disk.apply_partition_table(exec, storage.disk.ptable, layout)?;
    disk.sync_expecting(prober, layout.len())?;
    check_typecodes(disk, storage)?;

    for (position, entry) in layout.iter().enumerate() {
        disk.child_mut(position)?.format(prober, &entry.filesystem)?;
    }

    // Parents before children: `/` before `/boot` before `/boot/efi`.
    let mut order: Vec<(usize, &MountPoint)> = layout
        .iter()
        .enumerate()
        .map(|(position, entry)| (position, &entry.filesystem.mountpoint))
        .filter(|(_, mountpoint)| mountpoint.path().is_some())
        .collect();
    order.sort_by_key(|(position, mountpoint)| (mountpoint.depth(), *position));

    for (position, mountpoint) in order {
        let Some(target) = mountpoint.under(root) else {
            continue;
        };
        std::fs::create_dir_all(&target)?;

        let child = disk.child_mut(position)?;
        child.mount(exec, &target)?;
        mounts.push(MountRecord {
            position,
            device: child.path().to_path_buf(),
            mountpoint: mountpoint.clone(),
            target,
        });
    }

    Ok(())
}

/// Partitions must come back in layout order with the requested types.
fn check_typecodes(disk: &BlockDevice, storage: &StorageConfig) -> Result<(), SysError> {
    for (child, entry) in disk.children()?.iter().zip(&storage.layout) {
        let (Some(reported), Ok(expected)) = (child.typecode(), entry.type_code()) else {
            continue;
        };
        // Codes outside the catalog come back as raw GUIDs and cannot be compared.
        if let Ok(reported) = TypeCode::parse(reported)
            && reported != expected
        {
            return Err(SysError::Probe {
                device: child.path().to_path_buf(),
                reason: format!("partition type is {reported}, layout asked for {expected}"),
            });
        }
    }
    Ok(())
}

fn mounted_pairs(mounts: &[MountRecord]) -> Vec<(PathBuf, PathBuf)> {
    mounts
        .iter()
        .map(|mount| (mount.device.clone(), mount.target.clone()))
        .collect()
}

/// Best-effort reverse of [`build`]: unmount `mounted` (device, target)
/// pairs newest first, then detach.
fn unwind(
    exec: &dyn CommandExecutor,
    disk: &mut BlockDevice,
    mounted: &[(PathBuf, PathBuf)],
) -> Vec<CleanupFailure> {
    let mut failures = Vec::new();

    for (device, target) in mounted.iter().rev() {
        let result = disk
            .child_by_path_mut(device)
            .and_then(|child| match child {
                Some(child) => child.unmount(exec),
                None => Ok(()),
            });
        if let Err(error) = result {
            failures.push(CleanupFailure {
                step: format!("unmount {}", target.display()),
                error,
            });
        }
    }

    if let Err(error) = disk.detach(exec) {
        failures.push(CleanupFailure {
            step: format!("detach {}", disk.path().display()),
            error,
        });
    }

    failures
}

/// Unmount and detach every loop device still attached to `backing_file`,
/// e.g. after an interrupted run. Returns the devices released.
pub fn release(
    exec: &dyn CommandExecutor,
    backing_file: &Path,
    policy: RetryPolicy,
) -> Result<Vec<PathBuf>, TeardownError> {
    let single = |step: String, error: SysError| TeardownError {
        failures: vec![CleanupFailure { step, error }],
    };

    let backing_file = std::path::absolute(backing_file)
        .map_err(|error| single(format!("resolve {}", backing_file.display()), error.into()))?;
    let devices = associated_loop_devices(exec, &backing_file)
        .map_err(|error| {
            single(
                format!("list loop devices of {}", backing_file.display()),
                error,
            )
        })?;

    if devices.is_empty() {
        tracing::info!("No loop devices attached to {}", backing_file.display());
        return Ok(devices);
    }

    let prober = DeviceProber::new(exec, policy);
    let mut failures = Vec::new();
    let mut released = Vec::new();

    for device in devices {
        let adopted = BlockDevice::open_loop(&prober, &device, &backing_file)
            .and_then(|mut disk| disk.sync(&prober).map(|()| disk));
        let mut disk = match adopted {
            Ok(disk) => disk,
            Err(error) => {
                failures.push(CleanupFailure {
                    step: format!("inspect {}", device.display()),
                    error,
                });
                continue;
            }
        };

        // Shallowest first, as if mounted by `build`; unwind walks backwards.
        let mut mounted: Vec<(PathBuf, PathBuf)> = disk
            .mounted_children()
            .into_iter()
            .map(|(device, target)| (device.to_path_buf(), target.to_path_buf()))
            .collect();
        mounted.sort_by_key(|(_, target)| target.components().count());

        let step_failures = unwind(exec, &mut disk, &mounted);
        if step_failures.is_empty() {
            released.push(device);
        }
        failures.extend(step_failures);
    }

    if failures.is_empty() {
        Ok(released)
    } else {
        Err(TeardownError { failures })
    }
}
