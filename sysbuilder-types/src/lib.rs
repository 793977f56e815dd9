// SPDX-License-Identifier: GPL-3.0-only

//! Canonical data types for sysbuilder image provisioning
//!
//! These types describe *what* the storage core should build. They are
//! produced by the config loader and consumed read-only by the block-device
//! model and the orchestrator:
//!
//! - **sysbuilder-sys**: partitions and formats devices from `LayoutEntry`s
//! - **sysbuilder**: loads `DiskSpec`/`LayoutEntry` from JSON or TOML
//!
//! Every string-keyed concept from the configuration file (partition table
//! type, filesystem type, mount point, partition bounds) is parsed into a
//! closed type here so unknown values are rejected before any device is
//! touched.

pub mod common;
pub mod disk;
pub mod error;
pub mod filesystem;
pub mod layout;
pub mod partition;
pub mod partition_types;

pub use common::{Size, bytes_to_pretty, parse_size};
pub use disk::{DiskKind, DiskSpec};
pub use error::ParseError;
pub use filesystem::{FilesystemKind, FilesystemSpec, MountPoint};
pub use layout::LayoutEntry;
pub use partition::{Amount, PartitionBound, PartitionTableType, SizeUnit, TypeCode};
pub use partition_types::{PartitionTypeInfo, find_by_code, find_by_guid};
