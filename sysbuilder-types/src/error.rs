// SPDX-License-Identifier: GPL-3.0-only

use thiserror::Error;

/// Rejected configuration values.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid size '{0}': expected bytes or a number with K, M, G, T or P suffix")]
    Size(String),

    #[error("invalid partition bound '{0}'")]
    Bound(String),

    #[error("invalid type code '{0}': expected 4 hexadecimal digits")]
    TypeCode(String),

    #[error("unsupported partition table type '{0}' (supported: gpt)")]
    PartitionTable(String),

    #[error("unsupported filesystem type '{0}'")]
    Filesystem(String),

    #[error("invalid mount point '{0}': must be 'swap' or an absolute path without '.' or '..'")]
    MountPoint(String),

    #[error("unsupported disk type '{0}' (supported: sparse, raw, physical)")]
    DiskKind(String),
}
