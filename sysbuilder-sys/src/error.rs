// SPDX-License-Identifier: GPL-3.0-only

use std::path::PathBuf;

use thiserror::Error;

/// Error types for block-device operations.
///
/// Failures of an external tool carry the rendered command line, exit code
/// and stderr in `reason` (see [`crate::cmd::CommandOutput::failure`]).
#[derive(Error, Debug)]
pub enum SysError {
    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` did not finish within {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("cannot attach {path:?}: {reason}")]
    Attach { path: PathBuf, reason: String },

    #[error("partitioning {device:?} failed: {reason}")]
    Partition { device: PathBuf, reason: String },

    #[error("cannot format {device:?}: {reason}")]
    Format { device: PathBuf, reason: String },

    #[error("mount operation on {device:?} failed: {reason}")]
    Mount { device: PathBuf, reason: String },

    #[error("cannot detach {device:?}: {reason}")]
    Detach { device: PathBuf, reason: String },

    #[error("{device:?} did not reach the expected state after {attempts} probes: {expected}")]
    ProbeTimeout {
        device: PathBuf,
        attempts: u32,
        expected: String,
    },

    #[error("probing {device:?} failed: {reason}")]
    Probe { device: PathBuf, reason: String },

    #[error("{device:?}: {reason}")]
    InvalidState { device: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for block-device operations
pub type Result<T> = std::result::Result<T, SysError>;
