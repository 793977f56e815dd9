// SPDX-License-Identifier: GPL-3.0-only

//! Backing files, loop attachment and detachment

use std::path::{Path, PathBuf};

use sysbuilder_types::{DiskKind, PartitionTableType, bytes_to_pretty};

use super::{BlockDevice, DeviceState, Origin};
use crate::cmd::{Command, CommandExecutor};
use crate::probe::{DeviceProber, ProbeOutcome};
use crate::{Result, SysError};

const MIB: u64 = 1024 * 1024;

/// Create the image file a loop device will be attached to.
///
/// Sparse files are sized with `truncate`, raw files are filled from
/// `/dev/zero` with `dd`. An existing file is never overwritten.
pub fn create_backing_file(
    exec: &dyn CommandExecutor,
    path: &Path,
    kind: DiskKind,
    size: u64,
) -> Result<()> {
    if path.exists() {
        return Err(SysError::Attach {
            path: path.to_path_buf(),
            reason: "backing file already exists".to_string(),
        });
    }

    let command = match kind {
        DiskKind::Sparse => Command::new("truncate")
            .arg("--size")
            .arg(size.to_string())
            .arg_path(path),
        DiskKind::Raw => Command::new("dd")
            .arg("if=/dev/zero")
            .arg(format!("of={}", path.display()))
            .arg("bs=1M")
            .arg(format!("count={}", size.div_ceil(MIB)))
            .arg("status=none"),
        DiskKind::Physical => {
            return Err(SysError::InvalidState {
                device: path.to_path_buf(),
                reason: "physical disks have no backing file".to_string(),
            });
        }
    };

    tracing::info!(
        "Creating {} backing file {} ({})",
        kind,
        path.display(),
        bytes_to_pretty(size)
    );

    let output = exec.run(&command)?;
    if !output.success() {
        return Err(SysError::Attach {
            path: path.to_path_buf(),
            reason: output.failure(),
        });
    }
    Ok(())
}

/// Loop devices currently backed by `backing_file`.
pub fn associated_loop_devices(
    exec: &dyn CommandExecutor,
    backing_file: &Path,
) -> Result<Vec<PathBuf>> {
    let command = Command::new("losetup")
        .arg("--associated")
        .arg_path(backing_file);
    let output = exec.run(&command)?;
    if !output.success() {
        return Err(SysError::Attach {
            path: backing_file.to_path_buf(),
            reason: output.failure(),
        });
    }

    // Each line reads `/dev/loop0: [2049]:1234 (/path/to/file)`.
    Ok(output
        .stdout
        .lines()
        .filter_map(|line| line.split_once(':').map(|(device, _)| device.trim()))
        .filter(|device| !device.is_empty())
        .map(PathBuf::from)
        .collect())
}

impl BlockDevice {
    /// Attach `backing_file` to the first free loop device with partition
    /// scanning enabled.
    pub fn attach(exec: &dyn CommandExecutor, backing_file: &Path) -> Result<Self> {
        let backing_file = std::path::absolute(backing_file)?;

        let metadata = std::fs::metadata(&backing_file).map_err(|error| SysError::Attach {
            path: backing_file.clone(),
            reason: format!("backing file is not accessible: {error}"),
        })?;
        if !metadata.is_file() {
            return Err(SysError::Attach {
                path: backing_file,
                reason: "not a regular file".to_string(),
            });
        }

        let existing = associated_loop_devices(exec, &backing_file)?;
        if !existing.is_empty() {
            let devices: Vec<String> = existing.iter().map(|d| d.display().to_string()).collect();
            return Err(SysError::Attach {
                path: backing_file,
                reason: format!("already attached to {}", devices.join(", ")),
            });
        }

        let command = Command::new("losetup")
            .args(["--show", "--find", "--nooverlap", "--partscan"])
            .arg_path(&backing_file);
        let output = exec.run(&command)?;
        if !output.success() {
            return Err(SysError::Attach {
                path: backing_file,
                reason: output.failure(),
            });
        }

        let device = output.stdout.trim();
        if device.is_empty() {
            return Err(SysError::Attach {
                path: backing_file,
                reason: "losetup did not report a device".to_string(),
            });
        }

        tracing::info!("Attached {} to {}", backing_file.display(), device);

        Ok(Self::new_disk(
            PathBuf::from(device),
            Origin::Loop { backing_file },
            metadata.len(),
        ))
    }

    /// Adopt an existing disk. Detaching it later only releases the model.
    pub fn open(prober: &DeviceProber<'_>, device: &Path) -> Result<Self> {
        Self::adopt(prober, device, Origin::Physical)
    }

    /// Take over a loop device left attached to `backing_file`, e.g. by an
    /// interrupted run. Detaching it runs `losetup --detach`.
    pub fn open_loop(
        prober: &DeviceProber<'_>,
        device: &Path,
        backing_file: &Path,
    ) -> Result<Self> {
        Self::adopt(
            prober,
            device,
            Origin::Loop {
                backing_file: backing_file.to_path_buf(),
            },
        )
    }

    fn adopt(prober: &DeviceProber<'_>, device: &Path, origin: Origin) -> Result<Self> {
        let snapshot = match prober.probe(device)? {
            ProbeOutcome::Ready(snapshot) => snapshot,
            ProbeOutcome::NotReady { attempts, .. } => {
                return Err(SysError::ProbeTimeout {
                    device: device.to_path_buf(),
                    attempts,
                    expected: "device not visible".to_string(),
                });
            }
        };

        if snapshot.kind.is_partition() {
            return Err(SysError::InvalidState {
                device: device.to_path_buf(),
                reason: "expected a whole disk, found a partition".to_string(),
            });
        }

        tracing::info!("Opened {} ({} bytes)", device.display(), snapshot.size);

        let mut disk = Self::new_disk(device.to_path_buf(), origin, snapshot.size);
        disk.ptable = snapshot
            .ptable
            .as_deref()
            .and_then(|ptable| PartitionTableType::parse(ptable).ok());
        Ok(disk)
    }

    /// Release the device. Every partition must be unmounted first.
    ///
    /// Detaching twice is a no-op. Loop devices are detached with
    /// `losetup --detach`; physical disks only drop out of the model.
    pub fn detach(&mut self, exec: &dyn CommandExecutor) -> Result<()> {
        if self.state == DeviceState::Detached {
            return Ok(());
        }

        self.ensure_disk("detach")?;

        let mut busy: Vec<String> = self
            .mounted_children()
            .into_iter()
            .map(|(device, target)| format!("{} on {}", device.display(), target.display()))
            .collect();
        if let Some(target) = &self.mount_point {
            busy.insert(0, format!("{} on {}", self.path.display(), target.display()));
        }
        if !busy.is_empty() {
            return Err(SysError::Detach {
                device: self.path.clone(),
                reason: format!("device is busy: {}", busy.join(", ")),
            });
        }

        if let Origin::Loop { backing_file } = &self.origin {
            let command = Command::new("losetup").arg("--detach").arg_path(&self.path);
            let output = exec.run(&command)?;
            if !output.success() {
                return Err(SysError::Detach {
                    device: self.path.clone(),
                    reason: output.failure(),
                });
            }
            tracing::info!(
                "Detached {} (backing file {})",
                self.path.display(),
                backing_file.display()
            );
        } else {
            tracing::info!("Released {}", self.path.display());
        }

        self.state = DeviceState::Detached;
        for child in &mut self.children {
            child.state = DeviceState::Detached;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeKernel;

    #[test]
    fn attach_reports_the_loop_device_and_file_size() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        std::fs::write(&image, vec![0_u8; 4096]).unwrap();

        let kernel = FakeKernel::new();
        let disk = BlockDevice::attach(&kernel, &image).unwrap();
        assert_eq!(disk.path(), Path::new("/dev/loop0"));
        assert_eq!(disk.size(), 4096);
        assert_eq!(disk.backing_file(), Some(image.as_path()));
        assert_eq!(disk.state(), DeviceState::Attached);
    }

    #[test]
    fn attach_refuses_missing_and_already_attached_files() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();

        let missing = dir.path().join("missing.img");
        assert!(matches!(
            BlockDevice::attach(&kernel, &missing),
            Err(SysError::Attach { .. })
        ));

        let image = dir.path().join("disk.img");
        std::fs::write(&image, b"x").unwrap();
        BlockDevice::attach(&kernel, &image).unwrap();
        let err = BlockDevice::attach(&kernel, &image).unwrap_err();
        assert!(err.to_string().contains("already attached to /dev/loop0"));
    }

    #[test]
    fn detach_is_idempotent_and_terminal() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        std::fs::write(&image, b"x").unwrap();

        let kernel = FakeKernel::new();
        let mut disk = BlockDevice::attach(&kernel, &image).unwrap();
        disk.detach(&kernel).unwrap();
        disk.detach(&kernel).unwrap();
        assert!(!disk.is_attached());
        assert_eq!(kernel.count("losetup --detach"), 1);
        assert!(associated_loop_devices(&kernel, &image).unwrap().is_empty());
    }

    #[test]
    fn opened_disks_are_released_without_losetup() {
        let kernel = FakeKernel::new();
        kernel.add_disk(Path::new("/dev/vdb"), 8 << 30);
        let prober = DeviceProber::new(&kernel, crate::probe::RetryPolicy::immediate(1));

        let mut disk = BlockDevice::open(&prober, Path::new("/dev/vdb")).unwrap();
        assert_eq!(disk.size(), 8 << 30);
        assert_eq!(disk.backing_file(), None);
        disk.detach(&kernel).unwrap();
        assert_eq!(kernel.count("losetup"), 0);

        let missing = BlockDevice::open(&prober, Path::new("/dev/vdz")).unwrap_err();
        assert!(matches!(missing, SysError::ProbeTimeout { .. }));
    }

    #[test]
    fn sparse_backing_file_is_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        let kernel = FakeKernel::new();

        create_backing_file(&kernel, &image, DiskKind::Sparse, 1 << 20).unwrap();
        assert_eq!(std::fs::metadata(&image).unwrap().len(), 1 << 20);
        assert!(matches!(
            create_backing_file(&kernel, &image, DiskKind::Sparse, 1 << 20),
            Err(SysError::Attach { .. })
        ));
    }

    #[test]
    fn raw_backing_file_rounds_up_to_whole_mebibytes() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("raw.img");
        let kernel = FakeKernel::new();

        create_backing_file(&kernel, &image, DiskKind::Raw, MIB + 1).unwrap();
        assert!(kernel.ran(&format!(
            "dd if=/dev/zero of={} bs=1M count=2 status=none",
            image.display()
        )));
    }
}
