// SPDX-License-Identifier: GPL-3.0-only

//! Build configuration: loading and validation
//!
//! The file is JSON by default, or TOML when the name ends in `.toml`.
//! Only the `storage` table is interpreted here; `install` is handed to the
//! install stage untouched.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sysbuilder_types::{DiskSpec, FilesystemKind, LayoutEntry, MountPoint};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse config {path:?}: {reason}")]
    Parse { path: PathBuf, reason: String },
    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

fn invalid(reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        reason: reason.into(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    pub storage: StorageConfig,
    /// Package lists, services and files for the install stage.
    #[serde(default)]
    pub install: serde_json::Value,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    pub disk: DiskSpec,
    pub layout: Vec<LayoutEntry>,
    /// Host directory standing in for `/` of the new system while it is
    /// built. A temporary directory is used when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mount_root: Option<PathBuf>,
}

impl Config {
    /// Read, parse and validate a configuration file.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let parsed = if is_toml {
            Self::from_toml_str(&raw)
        } else {
            Self::from_json_str(&raw)
        };
        let mut config = parsed.map_err(|reason| ConfigError::Parse {
            path: path.to_path_buf(),
            reason,
        })?;

        config.storage.validate()?;
        config.storage.disk.path = std::path::absolute(&config.storage.disk.path).map_err(
            |source| ConfigError::Read {
                path: config.storage.disk.path.clone(),
                source,
            },
        )?;

        tracing::debug!(
            "Loaded {} with {} layout entries",
            path.display(),
            config.storage.layout.len()
        );
        Ok(config)
    }

    fn from_json_str(raw: &str) -> std::result::Result<Self, String> {
        serde_json::from_str(raw).map_err(|error| error.to_string())
    }

    fn from_toml_str(raw: &str) -> std::result::Result<Self, String> {
        toml::from_str(raw).map_err(|error| error.to_string())
    }
}

impl StorageConfig {
    /// Check everything that can be checked before touching a device.
    pub fn validate(&self) -> Result<()> {
        if self.layout.is_empty() {
            return Err(invalid("storage.layout must not be empty"));
        }

        if self.disk.kind.is_virtual() && self.disk.size.is_none() {
            return Err(invalid(format!(
                "storage.disk.size is required for {} disks",
                self.disk.kind
            )));
        }

        if self.disk.path.as_os_str().is_empty() {
            return Err(invalid("storage.disk.path must not be empty"));
        }

        let mut seen = HashSet::new();
        let mut roots = 0;
        for (position, entry) in self.layout.iter().enumerate() {
            let number = position + 1;
            entry
                .validate()
                .map_err(|error| invalid(format!("layout entry {number}: {error}")))?;

            let fs = &entry.filesystem;
            let is_swap_mount = fs.mountpoint == MountPoint::Swap;
            if (fs.kind == FilesystemKind::Swap) != is_swap_mount {
                return Err(invalid(format!(
                    "layout entry {number}: swap filesystems must use the swap mount point and only they may"
                )));
            }

            if !is_swap_mount && !seen.insert(fs.mountpoint.clone()) {
                return Err(invalid(format!(
                    "layout entry {number}: mount point {} is used twice",
                    fs.mountpoint
                )));
            }

            if fs.mountpoint.is_root() {
                roots += 1;
            }
        }

        if roots != 1 {
            return Err(invalid(format!(
                "exactly one layout entry must mount at /, found {roots}"
            )));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const EXAMPLE_JSON: &str = r#"{
        "storage": {
            "disk": {"path": "build/disk.img", "type": "sparse", "size": "32G", "ptable": "gpt"},
            "layout": [
                {"start": "", "end": "+4G", "typecode": "ef00",
                 "filesystem": {"type": "vfat", "mountpoint": "/efi", "label": "EFI", "label_flag": "-n"}},
                {"start": "", "end": "+8G", "typecode": "8200",
                 "filesystem": {"type": "swap", "mountpoint": "swap"}},
                {"start": "", "end": "", "typecode": "8300",
                 "filesystem": {"type": "ext4", "mountpoint": "/", "label": "root"}}
            ]
        },
        "install": {"packages": ["base", "linux"]}
    }"#;

    fn write(dir: &tempfile::TempDir, name: &str, contents: &str) -> PathBuf {
        let path = dir.path().join(name);
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_json_and_resolves_the_disk_path() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(&write(&dir, "config.json", EXAMPLE_JSON)).unwrap();

        assert!(config.storage.disk.path.is_absolute());
        assert!(config.storage.disk.path.ends_with("build/disk.img"));
        assert_eq!(config.storage.disk.size.unwrap().bytes(), 32 << 30);
        assert_eq!(config.storage.layout.len(), 3);
        assert_eq!(config.install["packages"][1], "linux");
    }

    #[test]
    fn loads_toml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let toml = r#"
            [storage.disk]
            path = "/var/tmp/disk.img"
            type = "raw"
            size = 1073741824
            ptable = "gpt"

            [[storage.layout]]
            start = ""
            end = ""
            typecode = "8300"
            filesystem = { type = "xfs", mountpoint = "/", args = ["-m", "crc=1"] }

            [install]
            packages = ["base"]
        "#;
        let config = Config::load(&write(&dir, "config.toml", toml)).unwrap();
        assert_eq!(config.storage.disk.size.unwrap().bytes(), 1 << 30);
        assert_eq!(
            config.storage.layout[0].filesystem.kind,
            FilesystemKind::Xfs
        );
        assert_eq!(config.storage.layout[0].filesystem.args, ["-m", "crc=1"]);
    }

    #[test]
    fn syntax_errors_name_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(&dir, "broken.json", "{ not json");
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("broken.json"));
    }

    #[test]
    fn mount_points_outside_the_image_fail_to_load() {
        let dir = tempfile::tempdir().unwrap();
        let escaping =
            EXAMPLE_JSON.replace(r#""mountpoint": "/efi""#, r#""mountpoint": "/../../etc""#);
        let err = Config::load(&write(&dir, "config.json", &escaping)).unwrap_err();
        assert!(matches!(err, ConfigError::Parse { .. }));
        assert!(err.to_string().contains("/../../etc"));
    }

    fn storage() -> StorageConfig {
        let config: Config = serde_json::from_str(EXAMPLE_JSON).unwrap();
        config.storage
    }

    #[test]
    fn example_layout_is_valid() {
        storage().validate().unwrap();
    }

    #[test]
    fn virtual_disks_need_a_size() {
        let mut storage = storage();
        storage.disk.size = None;
        let err = storage.validate().unwrap_err();
        assert!(err.to_string().contains("size is required for sparse"));
    }

    #[test]
    fn exactly_one_root_is_required() {
        let mut storage = storage();
        storage.layout.pop();
        assert!(
            storage
                .validate()
                .unwrap_err()
                .to_string()
                .contains("found 0")
        );
    }

    #[test]
    fn duplicate_mount_points_are_rejected() {
        let mut storage = storage();
        let duplicate = storage.layout[0].clone();
        storage.layout.push(duplicate);
        assert!(
            storage
                .validate()
                .unwrap_err()
                .to_string()
                .contains("/efi is used twice")
        );
    }

    #[test]
    fn swap_must_pair_with_the_swap_mount_point() {
        let mut storage = storage();
        storage.layout[1].filesystem.mountpoint = MountPoint::parse("/swap").unwrap();
        assert!(storage.validate().is_err());
    }

    #[test]
    fn bad_bounds_are_caught_at_load() {
        let mut storage = storage();
        storage.layout[2].end = "rest".to_string();
        let err = storage.validate().unwrap_err();
        assert!(err.to_string().contains("layout entry 3"));
    }
}
