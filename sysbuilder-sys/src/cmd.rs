// SPDX-License-Identifier: GPL-3.0-only

//! External command execution
//!
//! Every interaction with the host goes through [`CommandExecutor`], which is
//! passed explicitly to each operation. The executor never interprets exit
//! codes: a tool that ran and failed is an `Ok(CommandOutput)` with a
//! non-zero code, a tool that could not be started is [`SysError::Launch`].

use std::io::Read;
use std::path::Path;
use std::process::{self, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use crate::{Result, SysError};

const POLL_INTERVAL: Duration = Duration::from_millis(20);

/// An argv plus an optional timeout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    program: String,
    args: Vec<String>,
    timeout: Option<Duration>,
}

impl Command {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout: None,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn arg_path(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    pub fn get_timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn render(&self) -> String {
        render(&self.program, &self.args)
    }
}

pub fn render(command: &str, args: &[String]) -> String {
    if args.is_empty() {
        command.to_string()
    } else {
        format!("{} {}", command, args.join(" "))
    }
}

/// Captured result of a command that was started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub command: String,
    /// `None` when the process was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    /// Diagnostic text for error variants: argv, exit status and stderr.
    pub fn failure(&self) -> String {
        let status = match self.exit_code {
            Some(code) => format!("exit code {code}"),
            None => "killed by signal".to_string(),
        };
        let stderr = self.stderr.trim();
        if stderr.is_empty() {
            format!("`{}` failed with {}", self.command, status)
        } else {
            format!("`{}` failed with {}: {}", self.command, status, stderr)
        }
    }
}

/// Runs one external command per call.
pub trait CommandExecutor {
    fn run(&self, command: &Command) -> Result<CommandOutput>;
}

/// Executes commands on the host with `std::process`.
#[derive(Debug, Clone, Default)]
pub struct SystemExecutor {
    default_timeout: Option<Duration>,
}

impl SystemExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applied to commands that do not carry their own timeout.
    pub fn with_default_timeout(timeout: Duration) -> Self {
        Self {
            default_timeout: Some(timeout),
        }
    }
}

fn drain<R: Read + Send + 'static>(pipe: Option<R>) -> Option<thread::JoinHandle<Vec<u8>>> {
    pipe.map(|mut pipe| {
        thread::spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            buf
        })
    })
}

fn collect(handle: Option<thread::JoinHandle<Vec<u8>>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .map(|bytes| String::from_utf8_lossy(&bytes).to_string())
        .unwrap_or_default()
}

impl CommandExecutor for SystemExecutor {
    fn run(&self, command: &Command) -> Result<CommandOutput> {
        let rendered = command.render();
        tracing::debug!("Running {}", rendered);

        let launch_error = |source| SysError::Launch {
            command: rendered.clone(),
            source,
        };

        let mut child = process::Command::new(command.program())
            .args(command.get_args())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(launch_error)?;

        // Pipes are drained concurrently so a chatty tool cannot block on a
        // full buffer while we wait for it.
        let stdout = drain(child.stdout.take());
        let stderr = drain(child.stderr.take());

        let status = match command.get_timeout().or(self.default_timeout) {
            None => child.wait().map_err(launch_error)?,
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                loop {
                    if let Some(status) = child.try_wait().map_err(launch_error)? {
                        break status;
                    }
                    if Instant::now() >= deadline {
                        let _ = child.kill();
                        let _ = child.wait();
                        tracing::warn!("{} timed out after {:?}", rendered, timeout);
                        return Err(SysError::Timeout {
                            command: rendered,
                            seconds: timeout.as_secs(),
                        });
                    }
                    thread::sleep(POLL_INTERVAL);
                }
            }
        };

        let output = CommandOutput {
            command: rendered,
            exit_code: status.code(),
            stdout: collect(stdout),
            stderr: collect(stderr),
        };

        if !output.success() {
            tracing::debug!("{}", output.failure());
        }

        Ok(output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_command_context() {
        let command = Command::new("losetup").args(["--find", "--show", "disk.img"]);
        assert_eq!(command.render(), "losetup --find --show disk.img");
        assert_eq!(render("partprobe", &[]), "partprobe");
    }

    #[test]
    fn failure_text_carries_argv_and_stderr() {
        let output = CommandOutput {
            command: "sgdisk --new 1::+4G /dev/loop0".to_string(),
            exit_code: Some(4),
            stdout: String::new(),
            stderr: "Could not create partition 1\n".to_string(),
        };
        assert!(!output.success());
        assert_eq!(
            output.failure(),
            "`sgdisk --new 1::+4G /dev/loop0` failed with exit code 4: Could not create partition 1"
        );
    }

    #[test]
    fn non_zero_exit_is_not_an_error() {
        let output = SystemExecutor::new().run(&Command::new("false")).unwrap();
        assert_eq!(output.exit_code, Some(1));
    }

    #[test]
    fn missing_binary_is_a_launch_error() {
        let err = SystemExecutor::new()
            .run(&Command::new("sysbuilder-no-such-tool"))
            .unwrap_err();
        assert!(matches!(err, SysError::Launch { .. }));
    }

    #[test]
    fn captures_stdout() {
        let output = SystemExecutor::new()
            .run(&Command::new("echo").arg("hello"))
            .unwrap();
        assert!(output.success());
        assert_eq!(output.stdout.trim(), "hello");
    }

    #[test]
    fn timeout_kills_the_child() {
        let err = SystemExecutor::new()
            .run(&Command::new("sleep").arg("5").timeout(Duration::from_millis(100)))
            .unwrap_err();
        assert!(matches!(err, SysError::Timeout { .. }));
    }
}
