//! Filesystem kinds and per-partition filesystem specs

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ParseError;

/// Supported filesystem types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FilesystemKind {
    Ext2,
    Ext3,
    Ext4,
    Xfs,
    Btrfs,
    /// FAT12/16/32, as used for EFI system partitions
    Vfat,
    /// Pseudo-filesystem created with `mkswap`
    Swap,
}

impl FilesystemKind {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        match s.trim().to_ascii_lowercase().as_str() {
            "ext2" => Ok(Self::Ext2),
            "ext3" => Ok(Self::Ext3),
            "ext4" => Ok(Self::Ext4),
            "xfs" => Ok(Self::Xfs),
            "btrfs" => Ok(Self::Btrfs),
            "vfat" | "fat" | "fat32" => Ok(Self::Vfat),
            "swap" => Ok(Self::Swap),
            _ => Err(ParseError::Filesystem(s.to_string())),
        }
    }

    /// Name as reported by `lsblk` in the `fstype` column
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ext2 => "ext2",
            Self::Ext3 => "ext3",
            Self::Ext4 => "ext4",
            Self::Xfs => "xfs",
            Self::Btrfs => "btrfs",
            Self::Vfat => "vfat",
            Self::Swap => "swap",
        }
    }

    /// Convert to mkfs command name
    pub fn mkfs_command(&self) -> &'static str {
        match self {
            Self::Ext2 => "mkfs.ext2",
            Self::Ext3 => "mkfs.ext3",
            Self::Ext4 => "mkfs.ext4",
            Self::Xfs => "mkfs.xfs",
            Self::Btrfs => "mkfs.btrfs",
            Self::Vfat => "mkfs.vfat",
            Self::Swap => "mkswap",
        }
    }

    /// Flag that sets the volume label when the layout does not override it.
    pub fn default_label_flag(&self) -> &'static str {
        match self {
            Self::Vfat => "-n",
            _ => "-L",
        }
    }

    /// Flag that lets the tool overwrite an existing signature, if it has one.
    pub fn force_flag(&self) -> Option<&'static str> {
        match self {
            Self::Ext2 | Self::Ext3 | Self::Ext4 => Some("-F"),
            Self::Xfs | Self::Btrfs | Self::Swap => Some("-f"),
            Self::Vfat => None,
        }
    }
}

impl fmt::Display for FilesystemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<String> for FilesystemKind {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<FilesystemKind> for String {
    fn from(value: FilesystemKind) -> Self {
        value.as_str().to_string()
    }
}

/// Where a filesystem lives in the installed system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum MountPoint {
    /// The literal `swap`: formatted, never mounted.
    Swap,
    /// Absolute path inside the installed system, e.g. `/` or `/efi`.
    Path(PathBuf),
}

impl MountPoint {
    pub fn parse(s: &str) -> Result<Self, ParseError> {
        if s == "swap" {
            return Ok(Self::Swap);
        }
        let path = Path::new(s);
        let mut components = path.components();
        let rooted = components.next() == Some(Component::RootDir);
        if !rooted || !components.all(|c| matches!(c, Component::Normal(_))) {
            return Err(ParseError::MountPoint(s.to_string()));
        }
        Ok(Self::Path(path.to_path_buf()))
    }

    pub fn path(&self) -> Option<&Path> {
        match self {
            Self::Swap => None,
            Self::Path(path) => Some(path),
        }
    }

    pub fn is_root(&self) -> bool {
        self.path() == Some(Path::new("/"))
    }

    /// Number of normal path components; `/` is 0, `/boot/efi` is 2.
    pub fn depth(&self) -> usize {
        self.path()
            .map(|path| {
                path.components()
                    .filter(|c| matches!(c, Component::Normal(_)))
                    .count()
            })
            .unwrap_or(0)
    }

    /// Resolve this mount point below `root`, the host directory that stands
    /// in for `/` of the installed system.
    pub fn under(&self, root: &Path) -> Option<PathBuf> {
        let path = self.path()?;
        let relative = path.strip_prefix("/").unwrap_or(path);
        if relative.as_os_str().is_empty() {
            return Some(root.to_path_buf());
        }
        Some(root.join(relative))
    }
}

impl fmt::Display for MountPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Swap => f.write_str("swap"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

impl TryFrom<String> for MountPoint {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<MountPoint> for String {
    fn from(value: MountPoint) -> Self {
        value.to_string()
    }
}

/// Filesystem to create on a partition, and where to mount it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemSpec {
    #[serde(rename = "type", alias = "fs_type")]
    pub kind: FilesystemKind,

    pub mountpoint: MountPoint,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,

    /// Overrides the label flag for tools with atypical options.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_flag: Option<String>,

    /// Extra arguments passed to the mkfs tool before the device path.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,

    /// Overwrite an existing filesystem signature instead of refusing.
    #[serde(default)]
    pub reformat: bool,
}

impl FilesystemSpec {
    pub fn new(kind: FilesystemKind, mountpoint: MountPoint) -> Self {
        Self {
            kind,
            mountpoint,
            label: None,
            label_flag: None,
            args: Vec::new(),
            reformat: false,
        }
    }

    pub fn label_flag(&self) -> &str {
        self.label_flag
            .as_deref()
            .unwrap_or_else(|| self.kind.default_label_flag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_filesystem_types_fail_to_parse() {
        assert_eq!(FilesystemKind::parse("VFAT").unwrap(), FilesystemKind::Vfat);
        assert_eq!(
            FilesystemKind::parse("zfs"),
            Err(ParseError::Filesystem("zfs".to_string()))
        );
    }

    #[test]
    fn mount_points_resolve_under_root() {
        let root = Path::new("/mnt/image");
        let efi = MountPoint::parse("/efi").unwrap();
        assert_eq!(efi.under(root).unwrap(), PathBuf::from("/mnt/image/efi"));
        assert_eq!(MountPoint::parse("/").unwrap().under(root).unwrap(), root);
        assert_eq!(MountPoint::Swap.under(root), None);
        assert!(MountPoint::parse("efi").is_err());
    }

    #[test]
    fn mount_points_cannot_climb_out_of_root() {
        for path in ["/../../etc", "/boot/../..", "/efi/.."] {
            assert_eq!(
                MountPoint::parse(path),
                Err(ParseError::MountPoint(path.to_string()))
            );
        }
        assert!(MountPoint::parse("/boot/efi/").is_ok());
    }

    #[test]
    fn mount_point_depth_orders_parents_first() {
        let root = MountPoint::parse("/").unwrap();
        let boot = MountPoint::parse("/boot").unwrap();
        let efi = MountPoint::parse("/boot/efi").unwrap();
        assert!(root.depth() < boot.depth() && boot.depth() < efi.depth());
    }

    #[test]
    fn spec_deserializes_with_defaults() {
        let spec: FilesystemSpec = serde_json::from_str(
            r#"{"type": "vfat", "mountpoint": "/efi", "label": "EFI", "args": ["-F", "32"]}"#,
        )
        .unwrap();
        assert_eq!(spec.kind, FilesystemKind::Vfat);
        assert_eq!(spec.label_flag(), "-n");
        assert!(!spec.reformat);
        assert_eq!(spec.args, vec!["-F", "32"]);
    }
}
