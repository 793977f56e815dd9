// SPDX-License-Identifier: GPL-3.0-only

//! Bootable OS image provisioning
//!
//! Loads a build configuration and drives the block-device model in
//! `sysbuilder-sys` to produce a mounted image tree for the install stage.

pub mod config;
pub mod logging;
pub mod orchestrator;

pub use config::{Config, ConfigError, StorageConfig};
pub use orchestrator::{
    CleanupFailure, MountRecord, ProvisionError, ProvisionedImage, TeardownError, provision,
    release,
};
