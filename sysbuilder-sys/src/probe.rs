// SPDX-License-Identifier: GPL-3.0-only

//! Block-device topology probing via `lsblk --json`
//!
//! The kernel re-enumerates partitions asynchronously after `sgdisk` and
//! `partprobe` exit, so a device or its children may not be visible on the
//! first read. [`DeviceProber`] retries with bounded exponential backoff and
//! reports [`ProbeOutcome::NotReady`] when the budget runs out; callers turn
//! that into [`SysError::ProbeTimeout`] when they need the state.

use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sysbuilder_types::partition_types;

use crate::cmd::{Command, CommandExecutor};
use crate::{Result, SysError};

/// `lsblk` exit status when none of the requested devices exist.
const LSBLK_NOT_FOUND: i32 = 32;

const LSBLK_COLUMNS: &str = "PATH,TYPE,SIZE,PTTYPE,FSTYPE,LABEL,PARTTYPE,MOUNTPOINTS";

/// Device class as reported by `lsblk`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SnapshotKind {
    Disk,
    Loop,
    Partition,
    Other(String),
}

impl SnapshotKind {
    fn parse(s: &str) -> Self {
        match s {
            "disk" => Self::Disk,
            "loop" => Self::Loop,
            "part" => Self::Partition,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn is_partition(&self) -> bool {
        matches!(self, Self::Partition)
    }
}

/// Point-in-time view of one device and its children.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DeviceSnapshot {
    pub path: PathBuf,
    pub kind: SnapshotKind,
    pub size: u64,
    pub ptable: Option<String>,
    pub fstype: Option<String>,
    pub label: Option<String>,
    /// `sgdisk` short code when the GUID is known, otherwise the raw GUID.
    pub typecode: Option<String>,
    pub mountpoints: Vec<PathBuf>,
    pub children: Vec<DeviceSnapshot>,
}

impl DeviceSnapshot {
    pub fn is_mounted_at(&self, target: &Path) -> bool {
        self.mountpoints.iter().any(|mount| mount == target)
    }
}

#[derive(Debug, Deserialize)]
struct LsblkOutput {
    #[serde(default)]
    blockdevices: Vec<LsblkDevice>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LsblkSize {
    Bytes(u64),
    Text(String),
}

#[derive(Debug, Deserialize)]
struct LsblkDevice {
    path: Option<String>,
    #[serde(rename = "type")]
    kind: Option<String>,
    size: Option<LsblkSize>,
    pttype: Option<String>,
    fstype: Option<String>,
    label: Option<String>,
    parttype: Option<String>,
    #[serde(default)]
    mountpoints: Vec<Option<String>>,
    #[serde(default)]
    children: Vec<LsblkDevice>,
}

impl LsblkDevice {
    fn into_snapshot(self) -> Option<DeviceSnapshot> {
        let size = match self.size {
            Some(LsblkSize::Bytes(bytes)) => bytes,
            Some(LsblkSize::Text(text)) => text.trim().parse().unwrap_or(0),
            None => 0,
        };

        let typecode = self.parttype.filter(|guid| !guid.is_empty()).map(|guid| {
            partition_types::find_by_guid(&guid)
                .map(|info| info.code.clone())
                .unwrap_or(guid)
        });

        Some(DeviceSnapshot {
            path: PathBuf::from(self.path?),
            kind: SnapshotKind::parse(self.kind.as_deref().unwrap_or_default()),
            size,
            ptable: self.pttype.filter(|value| !value.is_empty()),
            fstype: self.fstype.filter(|value| !value.is_empty()),
            label: self.label.filter(|value| !value.is_empty()),
            typecode,
            mountpoints: self
                .mountpoints
                .into_iter()
                .flatten()
                .filter(|mount| !mount.is_empty())
                .map(PathBuf::from)
                .collect(),
            children: self
                .children
                .into_iter()
                .filter_map(LsblkDevice::into_snapshot)
                .collect(),
        })
    }
}

/// Parse `lsblk --json` output, returning the entry for `device` if present.
pub fn parse_lsblk(device: &Path, json: &str) -> Result<Option<DeviceSnapshot>> {
    let output: LsblkOutput = serde_json::from_str(json).map_err(|error| SysError::Probe {
        device: device.to_path_buf(),
        reason: format!("unparsable lsblk output: {error}"),
    })?;

    Ok(output
        .blockdevices
        .into_iter()
        .filter_map(LsblkDevice::into_snapshot)
        .find(|snapshot| snapshot.path == device))
}

/// Bounded exponential backoff for probes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1600),
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts; for tests and already-settled devices.
    pub fn immediate(attempts: u32) -> Self {
        Self {
            attempts,
            initial_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    /// Delay after the given zero-based failed attempt.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 1_u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Result of a bounded probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProbeOutcome {
    Ready(DeviceSnapshot),
    /// Budget exhausted; `last` is the final snapshot if the device was
    /// visible but did not satisfy the caller's condition.
    NotReady {
        attempts: u32,
        last: Option<DeviceSnapshot>,
    },
}

impl ProbeOutcome {
    pub fn ready(self) -> Option<DeviceSnapshot> {
        match self {
            Self::Ready(snapshot) => Some(snapshot),
            Self::NotReady { .. } => None,
        }
    }
}

/// Reads block-device topology through the command executor.
pub struct DeviceProber<'a> {
    exec: &'a dyn CommandExecutor,
    policy: RetryPolicy,
}

impl<'a> DeviceProber<'a> {
    pub fn new(exec: &'a dyn CommandExecutor, policy: RetryPolicy) -> Self {
        Self { exec, policy }
    }

    pub fn executor(&self) -> &'a dyn CommandExecutor {
        self.exec
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Single `lsblk` read; `None` if the device is not visible.
    pub fn snapshot(&self, device: &Path) -> Result<Option<DeviceSnapshot>> {
        let command = Command::new("lsblk")
            .args(["--json", "--bytes", "--output", LSBLK_COLUMNS])
            .arg_path(device);
        let output = self.exec.run(&command)?;

        if output.exit_code == Some(LSBLK_NOT_FOUND) {
            return Ok(None);
        }

        if !output.success() {
            return Err(SysError::Probe {
                device: device.to_path_buf(),
                reason: output.failure(),
            });
        }

        parse_lsblk(device, &output.stdout)
    }

    /// Probe until the device is visible.
    pub fn probe(&self, device: &Path) -> Result<ProbeOutcome> {
        self.probe_until(device, |_| true)
    }

    /// Probe until the device is visible and `ready` accepts its snapshot.
    pub fn probe_until<F>(&self, device: &Path, ready: F) -> Result<ProbeOutcome>
    where
        F: Fn(&DeviceSnapshot) -> bool,
    {
        let attempts = self.policy.attempts.max(1);
        let mut last = None;

        for attempt in 0..attempts {
            match self.snapshot(device)? {
                Some(snapshot) if ready(&snapshot) => return Ok(ProbeOutcome::Ready(snapshot)),
                snapshot => last = snapshot,
            }

            if attempt + 1 < attempts {
                let delay = self.policy.delay(attempt);
                tracing::debug!(
                    "{} not ready (attempt {}/{}), retrying in {:?}",
                    device.display(),
                    attempt + 1,
                    attempts,
                    delay
                );
                sleep(delay);
            }
        }

        Ok(ProbeOutcome::NotReady { attempts, last })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOOP_WITH_PARTS: &str = r#"{
        "blockdevices": [
            {"path": "/dev/loop0", "type": "loop", "size": 34359738368, "pttype": "gpt",
             "fstype": null, "label": null, "parttype": null, "mountpoints": [null],
             "children": [
                {"path": "/dev/loop0p1", "type": "part", "size": 4294967296, "pttype": "gpt",
                 "fstype": "vfat", "label": "EFI",
                 "parttype": "c12a7328-f81f-11d2-ba4b-00a0c93ec93b",
                 "mountpoints": ["/mnt/efi"]},
                {"path": "/dev/loop0p2", "type": "part", "size": "1024", "pttype": "gpt",
                 "fstype": null, "label": null,
                 "parttype": "00000000-1111-2222-3333-444444444444",
                 "mountpoints": [null]}
             ]}
        ]
    }"#;

    #[test]
    fn parses_children_in_order_with_short_typecodes() {
        let snapshot = parse_lsblk(Path::new("/dev/loop0"), LOOP_WITH_PARTS)
            .unwrap()
            .unwrap();
        assert_eq!(snapshot.kind, SnapshotKind::Loop);
        assert_eq!(snapshot.ptable.as_deref(), Some("gpt"));
        assert!(snapshot.mountpoints.is_empty());
        assert_eq!(snapshot.children.len(), 2);

        let efi = &snapshot.children[0];
        assert_eq!(efi.typecode.as_deref(), Some("EF00"));
        assert_eq!(efi.fstype.as_deref(), Some("vfat"));
        assert!(efi.is_mounted_at(Path::new("/mnt/efi")));

        let unknown = &snapshot.children[1];
        assert_eq!(unknown.size, 1024);
        assert_eq!(
            unknown.typecode.as_deref(),
            Some("00000000-1111-2222-3333-444444444444")
        );
    }

    #[test]
    fn missing_device_entry_is_none() {
        assert!(
            parse_lsblk(Path::new("/dev/loop9"), LOOP_WITH_PARTS)
                .unwrap()
                .is_none()
        );
    }

    #[test]
    fn garbage_output_is_a_probe_error() {
        let err = parse_lsblk(Path::new("/dev/loop0"), "not json").unwrap_err();
        assert!(matches!(err, SysError::Probe { .. }));
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.delay(0), Duration::from_millis(100));
        assert_eq!(policy.delay(2), Duration::from_millis(400));
        assert_eq!(policy.delay(10), Duration::from_millis(1600));
        assert_eq!(policy.delay(40), Duration::from_millis(1600));
        assert_eq!(RetryPolicy::immediate(3).delay(2), Duration::ZERO);
    }
}
