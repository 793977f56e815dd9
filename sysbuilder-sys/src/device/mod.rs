// SPDX-License-Identifier: GPL-3.0-only

//! In-memory model of block devices
//!
//! A [`BlockDevice`] is either a disk (a loop device over a backing file, or
//! an adopted physical disk) or one of its partitions. The disk exclusively
//! owns its partitions; a partition only remembers its parent's path and its
//! own index, which is enough to look the parent up and to derive its device
//! path.
//!
//! The children list mirrors kernel state, not intent: it is marked stale by
//! anything that rewrites the partition table and can only be read again
//! after [`BlockDevice::sync`] has confirmed the new topology with a probe.

mod filesystem;
mod loop_device;
mod partition;

use std::path::{Path, PathBuf};

use serde::Serialize;
use sysbuilder_types::PartitionTableType;

pub use loop_device::{associated_loop_devices, create_backing_file};
pub use partition::{partition_index, partition_path};

use crate::{Result, SysError};

/// Whole disk or partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Disk,
    Partition,
}

/// Lifecycle position of a device instance.
///
/// Partitions may move between `Formatted`, `Mounted` and `Unmounted`
/// repeatedly; `Detached` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceState {
    Attached,
    Partitioned,
    Synced,
    Formatted,
    Mounted,
    Unmounted,
    Detached,
}

/// Where a device instance came from.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Origin {
    /// Loop device we attached; detaching runs `losetup --detach`.
    Loop { backing_file: PathBuf },
    /// Existing disk adopted with [`BlockDevice::open`]; never detached from the host.
    Physical,
    /// Partition of the disk at `parent` (lookup only, not ownership).
    Partition { parent: PathBuf, index: u32 },
}

/// One block device node and, for disks, its partitions.
#[derive(Debug)]
pub struct BlockDevice {
    path: PathBuf,
    origin: Origin,
    size: u64,
    ptable: Option<PartitionTableType>,
    typecode: Option<String>,
    label: Option<String>,
    filesystem: Option<String>,
    mount_point: Option<PathBuf>,
    state: DeviceState,
    children: Vec<BlockDevice>,
    children_stale: bool,
}

impl BlockDevice {
    fn new_disk(path: PathBuf, origin: Origin, size: u64) -> Self {
        Self {
            path,
            origin,
            size,
            ptable: None,
            typecode: None,
            label: None,
            filesystem: None,
            mount_point: None,
            state: DeviceState::Attached,
            children: Vec::new(),
            children_stale: true,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn kind(&self) -> DeviceKind {
        match self.origin {
            Origin::Partition { .. } => DeviceKind::Partition,
            Origin::Loop { .. } | Origin::Physical => DeviceKind::Disk,
        }
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn partition_table(&self) -> Option<PartitionTableType> {
        self.ptable
    }

    /// `sgdisk` short code (or raw GUID) last reported for this partition.
    pub fn typecode(&self) -> Option<&str> {
        self.typecode.as_deref()
    }

    pub fn label(&self) -> Option<&str> {
        self.label.as_deref()
    }

    /// Filesystem type as `lsblk` names it, e.g. `ext4` or `swap`.
    pub fn filesystem(&self) -> Option<&str> {
        self.filesystem.as_deref()
    }

    pub fn mount_point(&self) -> Option<&Path> {
        self.mount_point.as_deref()
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_attached(&self) -> bool {
        self.state != DeviceState::Detached
    }

    /// Backing file of a loop-attached disk.
    pub fn backing_file(&self) -> Option<&Path> {
        match &self.origin {
            Origin::Loop { backing_file } => Some(backing_file),
            _ => None,
        }
    }

    /// Parent disk path of a partition.
    pub fn parent(&self) -> Option<&Path> {
        match &self.origin {
            Origin::Partition { parent, .. } => Some(parent),
            _ => None,
        }
    }

    /// One-based partition number.
    pub fn index(&self) -> Option<u32> {
        match &self.origin {
            Origin::Partition { index, .. } => Some(*index),
            _ => None,
        }
    }

    /// False between a partition-table change and the next successful sync.
    pub fn is_synced(&self) -> bool {
        !self.children_stale
    }

    /// Partitions confirmed by the last sync.
    pub fn children(&self) -> Result<&[BlockDevice]> {
        self.ensure_synced()?;
        Ok(&self.children)
    }

    /// Partition at zero-based `position`, ordered by partition number.
    pub fn child_mut(&mut self, position: usize) -> Result<&mut BlockDevice> {
        self.ensure_synced()?;
        let count = self.children.len();
        self.children
            .get_mut(position)
            .ok_or_else(|| SysError::InvalidState {
                device: self.path.clone(),
                reason: format!("no partition at position {position} ({count} present)"),
            })
    }

    /// Partition with the given device path, if present after the last sync.
    pub fn child_by_path_mut(&mut self, path: &Path) -> Result<Option<&mut BlockDevice>> {
        self.ensure_synced()?;
        Ok(self.children.iter_mut().find(|child| child.path == path))
    }

    /// Paths of partitions this model believes are mounted, in on-disk order.
    ///
    /// Reads the last known list even when stale, so teardown can still
    /// find what it mounted.
    pub fn mounted_children(&self) -> Vec<(&Path, &Path)> {
        self.children
            .iter()
            .filter_map(|child| Some((child.path(), child.mount_point()?)))
            .collect()
    }

    fn ensure_synced(&self) -> Result<()> {
        if self.children_stale {
            return Err(SysError::InvalidState {
                device: self.path.clone(),
                reason: "partition list is stale; sync before reading children".to_string(),
            });
        }
        Ok(())
    }

    fn ensure_disk(&self, operation: &str) -> Result<()> {
        if self.kind() != DeviceKind::Disk {
            return Err(SysError::InvalidState {
                device: self.path.clone(),
                reason: format!("{operation} applies to whole disks only"),
            });
        }
        Ok(())
    }

    fn ensure_live(&self, operation: &str) -> Result<()> {
        if self.state == DeviceState::Detached {
            return Err(SysError::InvalidState {
                device: self.path.clone(),
                reason: format!("cannot {operation}: device instance is detached"),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn disk() -> BlockDevice {
        BlockDevice::new_disk(
            PathBuf::from("/dev/loop3"),
            Origin::Loop {
                backing_file: PathBuf::from("/tmp/disk.img"),
            },
            1 << 30,
        )
    }

    #[test]
    fn fresh_disk_is_attached_with_stale_children() {
        let disk = disk();
        assert_eq!(disk.kind(), DeviceKind::Disk);
        assert_eq!(disk.state(), DeviceState::Attached);
        assert!(disk.is_attached());
        assert!(!disk.is_synced());
        assert_eq!(disk.backing_file(), Some(Path::new("/tmp/disk.img")));
        assert!(matches!(
            disk.children(),
            Err(SysError::InvalidState { .. })
        ));
    }

    #[test]
    fn stale_children_cannot_be_borrowed_mutably() {
        let mut disk = disk();
        assert!(disk.child_mut(0).is_err());
        assert!(disk.child_by_path_mut(Path::new("/dev/loop3p1")).is_err());
        assert!(disk.mounted_children().is_empty());
    }
}
