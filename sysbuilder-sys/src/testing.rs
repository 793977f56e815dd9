// SPDX-License-Identifier: GPL-3.0-only

//! Scripted stand-in for the host's block-device tools
//!
//! [`FakeKernel`] implements [`CommandExecutor`] for the commands the
//! storage core issues (`losetup`, `sgdisk`, `partprobe`, `lsblk`, `mkfs.*`,
//! `mkswap`, `mount`, `umount`, `truncate`, `dd`) and keeps just enough
//! state to answer them consistently. Partition tables written by `sgdisk`
//! only become visible to `lsblk` after `partprobe` plus a configurable
//! number of probes, which is how delayed udev re-reads are reproduced.
//!
//! Backing files passed to `truncate`/`dd` are really created so tests can
//! point them at a temporary directory.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::{Value, json};
use sysbuilder_types::{TypeCode, find_by_code, parse_size};

use crate::cmd::{Command, CommandExecutor, CommandOutput};
use crate::device::partition_path;
use crate::{Result, SysError};

#[derive(Debug, Clone)]
struct FakePartition {
    number: u32,
    size: u64,
    typecode: String,
    fstype: Option<String>,
    label: Option<String>,
}

#[derive(Debug, Clone)]
struct FakeDisk {
    backing: Option<PathBuf>,
    size: u64,
    ptable: Option<String>,
    fstype: Option<String>,
    /// What `sgdisk` wrote.
    table: Vec<FakePartition>,
    /// What the kernel currently exposes.
    visible: Vec<FakePartition>,
    /// Probes left before a pending re-read lands; `None` when nothing is pending.
    reread_in: Option<u32>,
}

impl FakeDisk {
    fn new(backing: Option<PathBuf>, size: u64) -> Self {
        Self {
            backing,
            size,
            ptable: None,
            fstype: None,
            table: Vec::new(),
            visible: Vec::new(),
            reread_in: None,
        }
    }
}

#[derive(Debug)]
struct Failure {
    prefix: String,
    exit_code: i32,
    stderr: String,
}

#[derive(Debug, Default)]
struct KernelState {
    next_loop: u32,
    disks: BTreeMap<PathBuf, FakeDisk>,
    /// device → mount target
    mounts: BTreeMap<PathBuf, PathBuf>,
    log: Vec<String>,
    failures: Vec<Failure>,
    partition_lag: u32,
    hide_partitions: bool,
    reverse_children: bool,
}

/// In-memory block-device host for tests.
#[derive(Debug, Default)]
pub struct FakeKernel {
    state: RefCell<KernelState>,
}

type Reply = (i32, String, String);

fn ok(stdout: impl Into<String>) -> Reply {
    (0, stdout.into(), String::new())
}

fn fail(code: i32, stderr: impl Into<String>) -> Reply {
    (code, String::new(), stderr.into())
}

impl FakeKernel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of `lsblk` probes after `partprobe` before new partitions show up.
    pub fn set_partition_lag(&self, probes: u32) {
        self.state.borrow_mut().partition_lag = probes;
    }

    /// Never expose partitions, whatever `sgdisk` writes.
    pub fn hide_partitions(&self) {
        self.state.borrow_mut().hide_partitions = true;
    }

    /// List partitions last-to-first in `lsblk` output.
    pub fn reverse_children(&self) {
        self.state.borrow_mut().reverse_children = true;
    }

    /// Make every command whose rendered argv starts with `prefix` fail.
    pub fn fail_on(&self, prefix: &str, exit_code: i32, stderr: &str) {
        self.state.borrow_mut().failures.push(Failure {
            prefix: prefix.to_string(),
            exit_code,
            stderr: stderr.to_string(),
        });
    }

    /// Register an existing (non-loop) disk.
    pub fn add_disk(&self, device: &Path, size: u64) {
        self.state
            .borrow_mut()
            .disks
            .insert(device.to_path_buf(), FakeDisk::new(None, size));
    }

    /// Every command run so far, rendered.
    pub fn commands(&self) -> Vec<String> {
        self.state.borrow().log.clone()
    }

    /// How many commands started with `prefix`.
    pub fn count(&self, prefix: &str) -> usize {
        self.state
            .borrow()
            .log
            .iter()
            .filter(|command| command.starts_with(prefix))
            .count()
    }

    /// Whether exactly `command` was run.
    pub fn ran(&self, command: &str) -> bool {
        self.state.borrow().log.iter().any(|c| c == command)
    }

    /// Current mount table as (device, target).
    pub fn mounts(&self) -> Vec<(PathBuf, PathBuf)> {
        self.state
            .borrow()
            .mounts
            .iter()
            .map(|(device, target)| (device.clone(), target.clone()))
            .collect()
    }

    /// Loop devices currently attached.
    pub fn loop_devices(&self) -> Vec<PathBuf> {
        self.state
            .borrow()
            .disks
            .iter()
            .filter(|(_, disk)| disk.backing.is_some())
            .map(|(device, _)| device.clone())
            .collect()
    }

    /// Filesystem type the fake believes is on `device`.
    pub fn fstype(&self, device: &Path) -> Option<String> {
        let state = self.state.borrow();
        if let Some(disk) = state.disks.get(device) {
            return disk.fstype.clone();
        }
        state.disks.iter().find_map(|(parent, disk)| {
            disk.table
                .iter()
                .find(|part| partition_path(parent, part.number) == device)
                .and_then(|part| part.fstype.clone())
        })
    }
}

impl KernelState {
    fn dispatch(&mut self, program: &str, args: &[String]) -> io::Result<Reply> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        Ok(match program {
            "losetup" => self.losetup(&args),
            "sgdisk" => self.sgdisk(&args),
            "partprobe" => self.partprobe(&args),
            "lsblk" => self.lsblk(&args),
            "mkswap" => self.mkfs("swap", &args),
            "mount" => self.mount(&args),
            "umount" => self.umount(&args),
            "truncate" => create_file(&args, |args| {
                let size: u64 = args.get(1)?.parse().ok()?;
                Some((PathBuf::from(args.get(2)?), size))
            })?,
            "dd" => create_file(&args, |args| {
                let value = |key: &str| {
                    args.iter()
                        .find_map(|arg| arg.strip_prefix(key).map(str::to_string))
                };
                let count: u64 = value("count=")?.parse().ok()?;
                Some((PathBuf::from(value("of=")?), count * 1024 * 1024))
            })?,
            other => match other.strip_prefix("mkfs.") {
                Some(fstype) => self.mkfs(fstype, &args),
                None => return Err(io::Error::from(io::ErrorKind::NotFound)),
            },
        })
    }

    fn losetup(&mut self, args: &[&str]) -> Reply {
        match args {
            ["--associated", file] => {
                let file = Path::new(file);
                let lines: Vec<String> = self
                    .disks
                    .iter()
                    .filter(|(_, disk)| disk.backing.as_deref() == Some(file))
                    .map(|(device, _)| {
                        format!("{}: [2049]:131 ({})\n", device.display(), file.display())
                    })
                    .collect();
                ok(lines.concat())
            }
            ["--show", "--find", "--nooverlap", "--partscan", file] => {
                let file = PathBuf::from(file);
                let Ok(metadata) = std::fs::metadata(&file) else {
                    return fail(
                        1,
                        format!("losetup: {}: failed to set up loop device", file.display()),
                    );
                };
                let device = PathBuf::from(format!("/dev/loop{}", self.next_loop));
                self.next_loop += 1;
                self.disks
                    .insert(device.clone(), FakeDisk::new(Some(file), metadata.len()));
                ok(format!("{}\n", device.display()))
            }
            ["--detach", device] => {
                let device = Path::new(device);
                if !self.disks.contains_key(device) {
                    return fail(1, format!("losetup: {}: detach failed", device.display()));
                }
                if self.mounts.keys().any(|mounted| self.belongs_to(mounted, device)) {
                    return fail(1, format!("losetup: {}: device is busy", device.display()));
                }
                self.disks.remove(device);
                ok("")
            }
            _ => fail(1, "losetup: unsupported arguments"),
        }
    }

    fn sgdisk(&mut self, args: &[&str]) -> Reply {
        let Some((device, options)) = args.split_last() else {
            return fail(2, "sgdisk: no device");
        };
        let Some(disk) = self.disks.get_mut(Path::new(device)) else {
            return fail(2, format!("Problem opening {device} for reading!"));
        };

        match options {
            ["--clear"] => {
                disk.table.clear();
                disk.ptable = Some("gpt".to_string());
                ok("")
            }
            ["--new", new, "--typecode", code] => {
                let mut fields = new.splitn(3, ':');
                let (Some(number), Some(_start), Some(end)) =
                    (fields.next(), fields.next(), fields.next())
                else {
                    return fail(4, format!("Invalid partition spec {new}"));
                };
                let Ok(number) = number.parse::<u32>() else {
                    return fail(4, format!("Invalid partition number {number}"));
                };
                if disk.table.iter().any(|part| part.number == number) {
                    return fail(4, format!("Could not create partition {number}"));
                }
                let size = end
                    .strip_prefix('+')
                    .and_then(|size| parse_size(size).ok())
                    .unwrap_or(0);
                let typecode = code.split_once(':').map_or(*code, |(_, c)| c);
                disk.table.push(FakePartition {
                    number,
                    size,
                    typecode: typecode.to_string(),
                    fstype: None,
                    label: None,
                });
                ok("The operation has completed successfully.\n")
            }
            _ => fail(2, "sgdisk: unsupported arguments"),
        }
    }

    fn partprobe(&mut self, args: &[&str]) -> Reply {
        let [device] = args else {
            return fail(1, "partprobe: expected one device");
        };
        let lag = self.partition_lag;
        match self.disks.get_mut(Path::new(device)) {
            Some(disk) => {
                disk.reread_in = Some(lag);
                ok("")
            }
            None => fail(1, format!("partprobe: cannot open {device}")),
        }
    }

    fn lsblk(&mut self, args: &[&str]) -> Reply {
        let Some(device) = args.last().map(Path::new) else {
            return fail(1, "lsblk: no device");
        };

        let hide = self.hide_partitions;
        if let Some(disk) = self.disks.get_mut(device) {
            match disk.reread_in {
                Some(0) => {
                    if !hide {
                        disk.visible = disk.table.clone();
                    }
                    disk.reread_in = None;
                }
                Some(left) => disk.reread_in = Some(left - 1),
                None => {}
            }
        }

        let entry = if let Some(disk) = self.disks.get(device) {
            self.disk_json(device, disk)
        } else if let Some((parent, part)) = self.find_visible_partition(device) {
            let path = partition_path(parent, part.number);
            self.partition_json(&path, part, disk_ptable(self, parent))
        } else {
            return fail(32, format!("lsblk: {}: not a block device", device.display()));
        };

        ok(json!({ "blockdevices": [entry] }).to_string())
    }

    fn mkfs(&mut self, fstype: &str, args: &[&str]) -> Reply {
        let Some(device) = args.last().map(Path::new) else {
            return fail(1, "mkfs: no device");
        };
        let label = args
            .windows(2)
            .find(|pair| pair[0] == "-L" || pair[0] == "-n")
            .map(|pair| pair[1].to_string());

        if self.mounts.contains_key(device) {
            return fail(
                1,
                format!("{} is mounted; will not make a filesystem here!", device.display()),
            );
        }

        if let Some(disk) = self.disks.get_mut(device) {
            disk.fstype = Some(fstype.to_string());
            return ok("");
        }

        let mut found = false;
        for (parent, disk) in &mut self.disks {
            for list in [&mut disk.table, &mut disk.visible] {
                for part in list.iter_mut() {
                    if partition_path(parent, part.number) == device {
                        part.fstype = Some(fstype.to_string());
                        part.label = label.clone();
                        found = true;
                    }
                }
            }
        }

        if found {
            ok("")
        } else {
            fail(1, format!("The file {} does not exist", device.display()))
        }
    }

    fn mount(&mut self, args: &[&str]) -> Reply {
        let [device, target] = args else {
            return fail(1, "mount: unsupported arguments");
        };
        let device = PathBuf::from(device);
        let target = PathBuf::from(target);

        let fstype = match self.disks.get(&device) {
            Some(disk) => disk.fstype.clone(),
            None => match self.find_visible_partition(&device) {
                Some((_, part)) => part.fstype.clone(),
                None => {
                    return fail(
                        32,
                        format!("mount: {}: special device does not exist.", device.display()),
                    );
                }
            },
        };
        if fstype.is_none() || fstype.as_deref() == Some("swap") {
            return fail(32, format!("mount: {}: wrong fs type", target.display()));
        }
        if self.mounts.contains_key(&device) {
            return fail(32, format!("mount: {}: already mounted", device.display()));
        }

        self.mounts.insert(device, target);
        ok("")
    }

    fn umount(&mut self, args: &[&str]) -> Reply {
        let [target] = args else {
            return fail(1, "umount: unsupported arguments");
        };
        let target = Path::new(target);
        if self.mounts.values().any(|mounted| mounted.starts_with(target) && mounted != target) {
            return fail(32, format!("umount: {}: target is busy.", target.display()));
        }
        let device = self
            .mounts
            .iter()
            .find(|(_, mounted)| mounted.as_path() == target)
            .map(|(device, _)| device.clone());
        match device {
            Some(device) => {
                self.mounts.remove(&device);
                ok("")
            }
            None => fail(32, format!("umount: {}: not mounted.", target.display())),
        }
    }

    fn belongs_to(&self, device: &Path, disk: &Path) -> bool {
        device == disk
            || self.disks.get(disk).is_some_and(|d| {
                d.visible
                    .iter()
                    .any(|part| partition_path(disk, part.number) == device)
            })
    }

    fn find_visible_partition(&self, device: &Path) -> Option<(&Path, &FakePartition)> {
        self.disks.iter().find_map(|(parent, disk)| {
            disk.visible
                .iter()
                .find(|part| partition_path(parent, part.number) == device)
                .map(|part| (parent.as_path(), part))
        })
    }

    fn mountpoints(&self, device: &Path) -> Value {
        match self.mounts.get(device) {
            Some(target) => json!([target.display().to_string()]),
            None => json!([null]),
        }
    }

    fn disk_json(&self, device: &Path, disk: &FakeDisk) -> Value {
        let mut children: Vec<Value> = disk
            .visible
            .iter()
            .map(|part| {
                let path = partition_path(device, part.number);
                self.partition_json(&path, part, disk.ptable.clone())
            })
            .collect();
        if self.reverse_children {
            children.reverse();
        }

        let kind = if disk.backing.is_some() { "loop" } else { "disk" };
        let mut entry = json!({
            "path": device.display().to_string(),
            "type": kind,
            "size": disk.size,
            "pttype": disk.ptable,
            "fstype": disk.fstype,
            "label": null,
            "parttype": null,
            "mountpoints": self.mountpoints(device),
        });
        if !children.is_empty() {
            entry["children"] = Value::Array(children);
        }
        entry
    }

    fn partition_json(&self, path: &Path, part: &FakePartition, ptable: Option<String>) -> Value {
        let guid = TypeCode::parse(&part.typecode)
            .ok()
            .and_then(|code| find_by_code(&code))
            .map(|info| info.guid.clone())
            .unwrap_or_else(|| part.typecode.clone());

        json!({
            "path": path.display().to_string(),
            "type": "part",
            "size": part.size,
            "pttype": ptable,
            "fstype": part.fstype,
            "label": part.label,
            "parttype": guid,
            "mountpoints": self.mountpoints(path),
        })
    }
}

fn disk_ptable(state: &KernelState, parent: &Path) -> Option<String> {
    state.disks.get(parent).and_then(|disk| disk.ptable.clone())
}

fn create_file<F>(args: &[&str], parse: F) -> io::Result<Reply>
where
    F: Fn(&[&str]) -> Option<(PathBuf, u64)>,
{
    let Some((path, size)) = parse(args) else {
        return Ok(fail(1, "unsupported arguments"));
    };
    File::create(&path)?.set_len(size)?;
    Ok(ok(""))
}

impl CommandExecutor for FakeKernel {
    fn run(&self, command: &Command) -> Result<CommandOutput> {
        let rendered = command.render();
        let mut state = self.state.borrow_mut();
        state.log.push(rendered.clone());

        let injected = state
            .failures
            .iter()
            .find(|failure| rendered.starts_with(&failure.prefix))
            .map(|failure| fail(failure.exit_code, failure.stderr.clone()));

        let (exit_code, stdout, stderr) = match injected {
            Some(reply) => reply,
            None => state
                .dispatch(command.program(), command.get_args())
                .map_err(|source| SysError::Launch {
                    command: rendered.clone(),
                    source,
                })?,
        };

        Ok(CommandOutput {
            command: rendered,
            exit_code: Some(exit_code),
            stdout,
            stderr,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(kernel: &FakeKernel, argv: &[&str]) -> CommandOutput {
        let command = Command::new(argv[0]).args(argv[1..].iter().copied());
        kernel.run(&command).unwrap()
    }

    #[test]
    fn partitions_appear_only_after_reread_and_lag() {
        let dir = tempfile::tempdir().unwrap();
        let image = dir.path().join("disk.img");
        File::create(&image).unwrap().set_len(1 << 30).unwrap();
        let image = image.to_string_lossy().into_owned();

        let kernel = FakeKernel::new();
        kernel.set_partition_lag(1);
        let attach = ["losetup", "--show", "--find", "--nooverlap", "--partscan"];
        let mut argv = attach.to_vec();
        argv.push(&image);
        assert_eq!(run(&kernel, &argv).stdout, "/dev/loop0\n");

        run(&kernel, &["sgdisk", "--clear", "/dev/loop0"]);
        run(&kernel, &["sgdisk", "--new", "1::+512M", "--typecode", "1:EF00", "/dev/loop0"]);

        let children = |out: CommandOutput| {
            let value: Value = serde_json::from_str(&out.stdout).unwrap();
            value["blockdevices"][0]["children"]
                .as_array()
                .map(Vec::len)
                .unwrap_or(0)
        };
        let lsblk = ["lsblk", "--json", "/dev/loop0"];
        assert_eq!(children(run(&kernel, &lsblk)), 0);

        run(&kernel, &["partprobe", "/dev/loop0"]);
        assert_eq!(children(run(&kernel, &lsblk)), 0);
        assert_eq!(children(run(&kernel, &lsblk)), 1);
    }

    #[test]
    fn unknown_devices_look_like_lsblk_not_found() {
        let kernel = FakeKernel::new();
        let out = run(&kernel, &["lsblk", "--json", "/dev/loop7"]);
        assert_eq!(out.exit_code, Some(32));
    }

    #[test]
    fn injected_failures_win_and_are_logged() {
        let kernel = FakeKernel::new();
        kernel.fail_on("partprobe", 1, "Error: Partition(s) on /dev/loop0 are being used.");
        let out = run(&kernel, &["partprobe", "/dev/loop0"]);
        assert_eq!(out.exit_code, Some(1));
        assert!(out.stderr.contains("being used"));
        assert_eq!(kernel.commands(), ["partprobe /dev/loop0"]);
    }

    #[test]
    fn unknown_programs_fail_to_launch() {
        let kernel = FakeKernel::new();
        let out = kernel.run(&Command::new("mkfs.zfs").arg("/dev/loop0")).unwrap();
        assert_eq!(out.exit_code, Some(1));
        let err = kernel.run(&Command::new("parted")).unwrap_err();
        assert!(matches!(err, SysError::Launch { .. }));
    }
}
