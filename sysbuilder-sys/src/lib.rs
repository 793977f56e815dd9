// SPDX-License-Identifier: GPL-3.0-only

//! Block-device lifecycle model for image provisioning
//!
//! This crate drives the host's storage tools and keeps an in-memory model
//! of the devices it touches consistent with what the kernel reports:
//! - Command execution with captured output and timeouts ([`cmd`])
//! - Topology snapshots from `lsblk --json` with bounded retry ([`probe`])
//! - Loop attachment, partitioning, formatting and mounting ([`device`])
//!
//! Every operation takes the executor explicitly, so the same code runs
//! against the host or against [`testing::FakeKernel`].

pub mod cmd;
pub mod device;
pub mod error;
pub mod preflight;
pub mod probe;
#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use cmd::{Command, CommandExecutor, CommandOutput, SystemExecutor};
pub use device::{BlockDevice, DeviceKind, DeviceState};
pub use error::{Result, SysError};
pub use probe::{DeviceProber, DeviceSnapshot, ProbeOutcome, RetryPolicy, SnapshotKind};
