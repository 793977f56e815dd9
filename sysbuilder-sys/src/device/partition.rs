// SPDX-License-Identifier: GPL-3.0-only

//! Partition table writes and topology reconciliation

use std::path::{Path, PathBuf};

use sysbuilder_types::{LayoutEntry, PartitionTableType};

use super::{BlockDevice, DeviceState, Origin};
use crate::cmd::{Command, CommandExecutor};
use crate::probe::{DeviceProber, DeviceSnapshot, ProbeOutcome};
use crate::{Result, SysError};

/// Device path of partition `index` on `parent`.
///
/// Kernel naming appends `p` when the disk name ends in a digit:
/// `/dev/loop0` → `/dev/loop0p2`, `/dev/sda` → `/dev/sda2`.
pub fn partition_path(parent: &Path, index: u32) -> PathBuf {
    let parent = parent.to_string_lossy();
    if parent.ends_with(|c: char| c.is_ascii_digit()) {
        PathBuf::from(format!("{parent}p{index}"))
    } else {
        PathBuf::from(format!("{parent}{index}"))
    }
}

/// Inverse of [`partition_path`]; `None` if `child` is not named after `parent`.
pub fn partition_index(parent: &Path, child: &Path) -> Option<u32> {
    let parent = parent.to_string_lossy();
    let child = child.to_string_lossy();
    let mut rest = child.strip_prefix(parent.as_ref())?;
    if parent.ends_with(|c: char| c.is_ascii_digit()) {
        rest = rest.strip_prefix('p')?;
    }
    if rest.is_empty() || !rest.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    rest.parse().ok().filter(|index| *index > 0)
}

fn check(output: crate::cmd::CommandOutput, device: &Path) -> Result<()> {
    if output.success() {
        Ok(())
    } else {
        Err(SysError::Partition {
            device: device.to_path_buf(),
            reason: output.failure(),
        })
    }
}

impl BlockDevice {
    /// Write a new partition table and one partition per entry, in order.
    ///
    /// Every entry is parsed before the first command runs, so a bad bound or
    /// type code leaves the disk untouched. Once writing starts there is no
    /// rollback: a failing step leaves whatever `sgdisk` produced and the
    /// caller decides whether to detach or retry. In both cases the children
    /// list stays stale until the next [`BlockDevice::sync`].
    pub fn apply_partition_table(
        &mut self,
        exec: &dyn CommandExecutor,
        table: PartitionTableType,
        entries: &[LayoutEntry],
    ) -> Result<()> {
        self.ensure_live("partition")?;
        self.ensure_disk("partitioning")?;

        if entries.is_empty() {
            return Err(SysError::Partition {
                device: self.path.clone(),
                reason: "layout has no entries".to_string(),
            });
        }

        let mut planned = Vec::with_capacity(entries.len());
        for (position, entry) in entries.iter().enumerate() {
            let parsed = entry.validate().map_err(|error| SysError::Partition {
                device: self.path.clone(),
                reason: format!("layout entry {}: {error}", position + 1),
            })?;
            planned.push(parsed);
        }

        if self.mount_point.is_some() || !self.mounted_children().is_empty() {
            return Err(SysError::Partition {
                device: self.path.clone(),
                reason: "device has mounted filesystems".to_string(),
            });
        }

        tracing::info!(
            "Writing {} partition table with {} partitions to {}",
            table,
            planned.len(),
            self.path.display()
        );

        self.children_stale = true;
        self.state = DeviceState::Partitioned;
        self.ptable = None;

        match table {
            PartitionTableType::Gpt => {
                let clear = Command::new("sgdisk").arg("--clear").arg_path(&self.path);
                check(exec.run(&clear)?, &self.path)?;

                for (position, (start, end, typecode)) in planned.iter().enumerate() {
                    let number = position + 1;
                    let create = Command::new("sgdisk")
                        .arg("--new")
                        .arg(format!("{number}:{start}:{end}"))
                        .arg("--typecode")
                        .arg(format!("{number}:{typecode}"))
                        .arg_path(&self.path);
                    check(exec.run(&create)?, &self.path)?;
                    tracing::debug!(
                        "Created partition {} ({}:{}, {}) on {}",
                        number,
                        start,
                        end,
                        typecode,
                        self.path.display()
                    );
                }
            }
        }

        // Ask the kernel to re-read the table; visibility is confirmed by sync.
        let reread = Command::new("partprobe").arg_path(&self.path);
        check(exec.run(&reread)?, &self.path)?;

        self.ptable = Some(table);
        Ok(())
    }

    /// Replace the children list with what the kernel currently reports.
    pub fn sync(&mut self, prober: &DeviceProber<'_>) -> Result<()> {
        self.reconcile(prober, None)
    }

    /// Like [`BlockDevice::sync`], but keep probing until exactly `count`
    /// partitions are visible.
    pub fn sync_expecting(&mut self, prober: &DeviceProber<'_>, count: usize) -> Result<()> {
        self.reconcile(prober, Some(count))
    }

    fn reconcile(&mut self, prober: &DeviceProber<'_>, expected: Option<usize>) -> Result<()> {
        self.ensure_live("sync")?;
        self.ensure_disk("sync")?;

        let outcome = prober.probe_until(&self.path, |snapshot| {
            expected.is_none_or(|count| partitions_of(snapshot).count() == count)
        })?;

        let snapshot = match outcome {
            ProbeOutcome::Ready(snapshot) => snapshot,
            ProbeOutcome::NotReady { attempts, last } => {
                let expected = match (expected, last) {
                    (Some(count), Some(last)) => format!(
                        "expected {count} partitions, kernel reports {}",
                        partitions_of(&last).count()
                    ),
                    (Some(count), None) => {
                        format!("expected {count} partitions, device not visible")
                    }
                    (None, _) => "device not visible".to_string(),
                };
                tracing::warn!("{}: {}", self.path.display(), expected);
                return Err(SysError::ProbeTimeout {
                    device: self.path.clone(),
                    attempts,
                    expected,
                });
            }
        };

        self.rebuild_children(snapshot)
    }

    /// Build fresh child instances from a snapshot, carrying over mount and
    /// format state for partitions whose path did not change.
    fn rebuild_children(&mut self, snapshot: DeviceSnapshot) -> Result<()> {
        let mut previous = std::mem::take(&mut self.children);
        let mut children = Vec::new();

        self.size = snapshot.size;
        if let Some(ptable) = snapshot.ptable.as_deref() {
            self.ptable = PartitionTableType::parse(ptable).ok();
        }

        for child in snapshot.children.into_iter().filter(|c| c.kind.is_partition()) {
            let Some(index) = partition_index(&self.path, &child.path) else {
                // Keep the old list so teardown still knows what is mounted.
                self.children = previous;
                return Err(SysError::Probe {
                    device: self.path.clone(),
                    reason: format!(
                        "partition {} is not named after its disk",
                        child.path.display()
                    ),
                });
            };

            let carried = previous
                .iter()
                .position(|old| old.path == child.path)
                .map(|position| previous.swap_remove(position));

            let mut device = BlockDevice {
                path: child.path,
                origin: Origin::Partition {
                    parent: self.path.clone(),
                    index,
                },
                size: child.size,
                ptable: None,
                typecode: child.typecode,
                label: child.label,
                filesystem: child.fstype,
                mount_point: child.mountpoints.first().cloned(),
                state: DeviceState::Synced,
                children: Vec::new(),
                children_stale: false,
            };

            if let Some(old) = carried {
                if old.mount_point.is_some() {
                    device.mount_point = old.mount_point;
                }
                if device.filesystem.is_none() {
                    device.filesystem = old.filesystem;
                }
                if matches!(
                    old.state,
                    DeviceState::Formatted | DeviceState::Mounted | DeviceState::Unmounted
                ) {
                    device.state = old.state;
                }
            }

            // State follows the mount point.
            if device.mount_point.is_some() {
                device.state = DeviceState::Mounted;
            } else if device.state == DeviceState::Mounted {
                device.state = DeviceState::Unmounted;
            }

            children.push(device);
        }
        children.sort_by_key(|child| child.index());

        if let Some(lost) = previous.iter().find(|old| old.mount_point.is_some()) {
            tracing::warn!(
                "{} disappeared from {} while mounted",
                lost.path.display(),
                self.path.display()
            );
        }

        tracing::debug!(
            "Synced {}: {} partitions",
            self.path.display(),
            children.len()
        );

        self.children = children;
        self.children_stale = false;
        if matches!(self.state, DeviceState::Attached | DeviceState::Partitioned) {
            self.state = DeviceState::Synced;
        }
        Ok(())
    }
}

fn partitions_of(snapshot: &DeviceSnapshot) -> impl Iterator<Item = &DeviceSnapshot> {
    snapshot.children.iter().filter(|c| c.kind.is_partition())
}
