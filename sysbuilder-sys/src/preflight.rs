// SPDX-License-Identifier: GPL-3.0-only

//! Host tool availability checks

use sysbuilder_types::{DiskKind, FilesystemKind};
use which::which;

/// External tools needed to provision a disk of `disk` kind with the given
/// filesystems, in the order they are first used.
pub fn required_tools<'a>(
    disk: DiskKind,
    filesystems: impl IntoIterator<Item = &'a FilesystemKind>,
) -> Vec<&'static str> {
    let mut tools = Vec::new();
    match disk {
        DiskKind::Sparse => tools.extend(["truncate", "losetup"]),
        DiskKind::Raw => tools.extend(["dd", "losetup"]),
        DiskKind::Physical => {}
    }
    tools.extend(["sgdisk", "partprobe", "lsblk"]);
    for kind in filesystems {
        let tool = kind.mkfs_command();
        if !tools.contains(&tool) {
            tools.push(tool);
        }
    }
    tools.extend(["mount", "umount"]);
    tools
}

/// Tools from `tools` that cannot be found on `PATH`.
pub fn missing_tools(tools: &[&'static str]) -> Vec<&'static str> {
    tools
        .iter()
        .copied()
        .filter(|tool| which(tool).is_err())
        .collect()
}
