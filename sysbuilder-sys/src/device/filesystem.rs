// SPDX-License-Identifier: GPL-3.0-only

//! mkfs, mount and unmount

use std::path::Path;

use sysbuilder_types::FilesystemSpec;

use super::{BlockDevice, DeviceState};
use crate::cmd::{Command, CommandExecutor};
use crate::probe::DeviceProber;
use crate::{Result, SysError};

impl BlockDevice {
    /// Create the filesystem described by `spec` on this device.
    ///
    /// A device that already carries a filesystem signature is refused
    /// unless `spec.reformat` is set, in which case the tool's force flag
    /// is passed.
    pub fn format(&mut self, prober: &DeviceProber<'_>, spec: &FilesystemSpec) -> Result<()> {
        let format_error = |device: &Path, reason: String| SysError::Format {
            device: device.to_path_buf(),
            reason,
        };

        if !self.is_attached() {
            return Err(format_error(&self.path, "device is detached".to_string()));
        }
        if self.children_stale && !self.children.is_empty() {
            return Err(format_error(
                &self.path,
                "partition table changed; sync first".to_string(),
            ));
        }
        if let Some(target) = &self.mount_point {
            return Err(format_error(
                &self.path,
                format!("device is mounted on {}", target.display()),
            ));
        }

        let snapshot = prober
            .probe(&self.path)?
            .ready()
            .ok_or_else(|| format_error(&self.path, "device is not visible".to_string()))?;

        if let Some(existing) = snapshot.fstype.as_deref() {
            if !spec.reformat {
                return Err(format_error(
                    &self.path,
                    format!("{existing} signature already present; set reformat to overwrite"),
                ));
            }
            tracing::warn!(
                "Overwriting {} filesystem on {}",
                existing,
                self.path.display()
            );
        }

        let mut command = Command::new(spec.kind.mkfs_command());
        if spec.reformat
            && let Some(force) = spec.kind.force_flag()
        {
            command = command.arg(force);
        }
        if let Some(label) = spec.label.as_deref() {
            command = command.arg(spec.label_flag()).arg(label);
        }
        command = command.args(spec.args.iter().cloned()).arg_path(&self.path);

        tracing::info!("Formatting {} as {}", self.path.display(), spec.kind);

        let output = prober.executor().run(&command)?;
        if !output.success() {
            return Err(format_error(&self.path, output.failure()));
        }

        self.filesystem = Some(spec.kind.as_str().to_string());
        self.label = spec.label.clone();
        self.state = DeviceState::Formatted;
        Ok(())
    }

    /// Mount on `target`. Mounting again on the same target is a no-op.
    pub fn mount(&mut self, exec: &dyn CommandExecutor, target: &Path) -> Result<()> {
        let mount_error = |device: &Path, reason: String| SysError::Mount {
            device: device.to_path_buf(),
            reason,
        };

        if !self.is_attached() {
            return Err(mount_error(&self.path, "device is detached".to_string()));
        }
        if self.children_stale && !self.children.is_empty() {
            return Err(mount_error(
                &self.path,
                "partition table changed; sync first".to_string(),
            ));
        }
        if self.filesystem.as_deref() == Some("swap") {
            return Err(mount_error(
                &self.path,
                "swap areas are not mounted".to_string(),
            ));
        }

        match &self.mount_point {
            Some(current) if current == target => {
                tracing::debug!(
                    "{} already mounted on {}",
                    self.path.display(),
                    target.display()
                );
                return Ok(());
            }
            Some(current) => {
                return Err(mount_error(
                    &self.path,
                    format!("already mounted on {}", current.display()),
                ));
            }
            None => {}
        }

        let command = Command::new("mount").arg_path(&self.path).arg_path(target);
        let output = exec.run(&command)?;
        if !output.success() {
            return Err(mount_error(&self.path, output.failure()));
        }

        tracing::info!("Mounted {} on {}", self.path.display(), target.display());
        self.mount_point = Some(target.to_path_buf());
        self.state = DeviceState::Mounted;
        Ok(())
    }

    /// Unmount if mounted; otherwise a no-op.
    pub fn unmount(&mut self, exec: &dyn CommandExecutor) -> Result<()> {
        let Some(target) = self.mount_point.clone() else {
            return Ok(());
        };

        let command = Command::new("umount").arg_path(&target);
        let output = exec.run(&command)?;
        if !output.success() {
            return Err(SysError::Mount {
                device: self.path.clone(),
                reason: output.failure(),
            });
        }

        tracing::info!("Unmounted {} from {}", self.path.display(), target.display());
        self.mount_point = None;
        self.state = DeviceState::Unmounted;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::*;
    use crate::probe::RetryPolicy;
    use crate::testing::FakeKernel;
    use sysbuilder_types::{FilesystemKind, LayoutEntry, MountPoint, PartitionTableType};

    fn ext4_root() -> FilesystemSpec {
        let mut spec = FilesystemSpec::new(FilesystemKind::Ext4, MountPoint::parse("/").unwrap());
        spec.label = Some("root".to_string());
        spec
    }

    /// Attached loop disk with one synced partition.
    fn single_partition(kernel: &FakeKernel, dir: &tempfile::TempDir) -> BlockDevice {
        let image = dir.path().join("disk.img");
        std::fs::File::create(&image).unwrap().set_len(1 << 30).unwrap();
        let prober = DeviceProber::new(kernel, RetryPolicy::immediate(2));
        let mut disk = BlockDevice::attach(kernel, &image).unwrap();
        let entries = [LayoutEntry::new("", "", "8300", ext4_root())];
        disk.apply_partition_table(kernel, PartitionTableType::Gpt, &entries)
            .unwrap();
        disk.sync_expecting(&prober, 1).unwrap();
        disk
    }

    #[test]
    fn format_builds_argv_from_the_spec() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        let prober = DeviceProber::new(&kernel, RetryPolicy::immediate(2));
        let mut disk = single_partition(&kernel, &dir);

        let part = disk.child_mut(0).unwrap();
        part.format(&prober, &ext4_root()).unwrap();
        assert!(kernel.ran("mkfs.ext4 -L root /dev/loop0p1"));
        assert_eq!(
            kernel.fstype(Path::new("/dev/loop0p1")).as_deref(),
            Some("ext4")
        );
        assert_eq!(part.filesystem(), Some("ext4"));
        assert_eq!(part.label(), Some("root"));
        assert_eq!(part.state(), DeviceState::Formatted);
    }

    #[test]
    fn existing_signature_needs_reformat() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        let prober = DeviceProber::new(&kernel, RetryPolicy::immediate(2));
        let mut disk = single_partition(&kernel, &dir);
        let part = disk.child_mut(0).unwrap();
        part.format(&prober, &ext4_root()).unwrap();

        let err = part.format(&prober, &ext4_root()).unwrap_err();
        assert!(matches!(err, SysError::Format { .. }));
        assert!(err.to_string().contains("ext4 signature already present"));

        let mut again = ext4_root();
        again.reformat = true;
        part.format(&prober, &again).unwrap();
        assert!(kernel.ran("mkfs.ext4 -F -L root /dev/loop0p1"));
    }

    #[test]
    fn mkfs_failure_carries_stderr() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        kernel.fail_on("mkfs.ext4", 1, "mke2fs: Device size reported to be zero.");
        let prober = DeviceProber::new(&kernel, RetryPolicy::immediate(2));
        let mut disk = single_partition(&kernel, &dir);

        let err = disk
            .child_mut(0)
            .unwrap()
            .format(&prober, &ext4_root())
            .unwrap_err();
        assert!(err.to_string().contains("Device size reported to be zero"));
    }

    #[test]
    fn mount_and_unmount_are_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        let prober = DeviceProber::new(&kernel, RetryPolicy::immediate(2));
        let mut disk = single_partition(&kernel, &dir);
        let part = disk.child_mut(0).unwrap();
        part.format(&prober, &ext4_root()).unwrap();

        let target = PathBuf::from("/mnt/image");
        part.mount(&kernel, &target).unwrap();
        part.mount(&kernel, &target).unwrap();
        assert_eq!(kernel.count("mount "), 1);
        assert_eq!(part.mount_point(), Some(target.as_path()));

        let elsewhere = part.mount(&kernel, Path::new("/mnt/other")).unwrap_err();
        assert!(matches!(elsewhere, SysError::Mount { .. }));

        part.unmount(&kernel).unwrap();
        part.unmount(&kernel).unwrap();
        assert_eq!(kernel.count("umount"), 1);
        assert_eq!(part.state(), DeviceState::Unmounted);
        assert!(kernel.mounts().is_empty());
    }

    #[test]
    fn detach_waits_for_children_to_unmount() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        let prober = DeviceProber::new(&kernel, RetryPolicy::immediate(2));
        let mut disk = single_partition(&kernel, &dir);
        let part = disk.child_mut(0).unwrap();
        part.format(&prober, &ext4_root()).unwrap();
        part.mount(&kernel, Path::new("/mnt/image")).unwrap();

        let err = disk.detach(&kernel).unwrap_err();
        assert!(matches!(err, SysError::Detach { .. }));
        assert!(err.to_string().contains("/dev/loop0p1 on /mnt/image"));
        assert_eq!(kernel.count("losetup --detach"), 0);

        disk.child_mut(0).unwrap().unmount(&kernel).unwrap();
        disk.detach(&kernel).unwrap();
        assert!(kernel.loop_devices().is_empty());

        let err = disk.child_mut(0).unwrap().mount(&kernel, Path::new("/mnt/image"));
        assert!(err.is_err());
    }

    #[test]
    fn swap_is_formatted_but_never_mounted() {
        let dir = tempfile::tempdir().unwrap();
        let kernel = FakeKernel::new();
        let prober = DeviceProber::new(&kernel, RetryPolicy::immediate(2));
        let mut disk = single_partition(&kernel, &dir);
        let part = disk.child_mut(0).unwrap();

        let swap = FilesystemSpec::new(FilesystemKind::Swap, MountPoint::Swap);
        part.format(&prober, &swap).unwrap();
        assert!(kernel.ran("mkswap /dev/loop0p1"));
        assert!(part.mount(&kernel, Path::new("/mnt/swap")).is_err());
        assert_eq!(kernel.count("mount "), 0);
    }
}
