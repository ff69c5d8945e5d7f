//! External tool discovery and bounded process execution.

use std::env;
use std::ffi::OsStr;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::warn;

const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("`{command}` did not exit within {timeout:?} and was killed")]
    Timeout { command: String, timeout: Duration },
    #[error("failed waiting for `{command}`: {source}")]
    Wait {
        command: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl ProcessOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.status.code()
    }
}

/// Locations of the encoder and the stream inspector, if installed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Toolchain {
    pub ffmpeg: Option<PathBuf>,
    pub ffprobe: Option<PathBuf>,
}

impl Toolchain {
    pub fn from_env() -> Self {
        Self {
            ffmpeg: which::which("ffmpeg").ok(),
            ffprobe: which::which("ffprobe").ok(),
        }
    }

    /// Looks the tools up in an explicit `PATH`-style list.
    pub fn search(path_var: &OsStr) -> Self {
        Self {
            ffmpeg: locate("ffmpeg", path_var),
            ffprobe: locate("ffprobe", path_var),
        }
    }
}

fn locate(name: &str, path_var: &OsStr) -> Option<PathBuf> {
    if path_var.is_empty() {
        return None;
    }
    let cwd = env::current_dir().unwrap_or_default();
    which::which_in(name, Some(path_var), cwd).ok()
}

/// Runs one command line through the platform shell.
pub fn run_shell(command_line: &str, timeout: Duration) -> Result<ProcessOutput, ProcessError> {
    let mut command;
    if cfg!(target_os = "windows") {
        command = Command::new("cmd");
        command.arg("/C");
    } else {
        command = Command::new("sh");
        command.arg("-c");
    }
    command.arg(command_line);
    run_bounded(command, command_line, timeout)
}

/// Runs `program` with `args`, bypassing the shell.
pub fn run_program<I, S>(
    program: &Path,
    args: I,
    timeout: Duration,
) -> Result<ProcessOutput, ProcessError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command.args(args);
    let label = describe(&command);
    run_bounded(command, &label, timeout)
}

fn describe(command: &Command) -> String {
    std::iter::once(command.get_program())
        .chain(command.get_args())
        .map(|part| part.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ")
}

fn run_bounded(
    mut command: Command,
    label: &str,
    timeout: Duration,
) -> Result<ProcessOutput, ProcessError> {
    let mut child = command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| ProcessError::Spawn {
            command: label.to_owned(),
            source,
        })?;

    let stdout = drain(child.stdout.take(), "stdout");
    let stderr = drain(child.stderr.take(), "stderr");
    // On failure the drain threads are left detached: a grandchild of the
    // shell may still hold the pipes open.
    let status = wait_with_deadline(&mut child, label, timeout)?;

    Ok(ProcessOutput {
        status,
        stdout: join_drain(stdout),
        stderr: join_drain(stderr),
    })
}

fn wait_with_deadline(
    child: &mut Child,
    label: &str,
    timeout: Duration,
) -> Result<ExitStatus, ProcessError> {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(status)) => return Ok(status),
            Ok(None) if Instant::now() >= deadline => {
                if let Err(error) = child.kill() {
                    warn!(command = label, "failed to kill timed out process: {error}");
                }
                let _ = child.wait();
                return Err(ProcessError::Timeout {
                    command: label.to_owned(),
                    timeout,
                });
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(source) => {
                let _ = child.kill();
                return Err(ProcessError::Wait {
                    command: label.to_owned(),
                    source,
                });
            }
        }
    }
}

type Drain = Option<JoinHandle<String>>;

fn drain<R: Read + Send + 'static>(pipe: Option<R>, name: &str) -> Drain {
    let mut pipe = pipe?;
    thread::Builder::new()
        .name(format!("stepreel-{name}"))
        .spawn(move || {
            let mut buf = Vec::new();
            let _ = pipe.read_to_end(&mut buf);
            String::from_utf8_lossy(&buf).into_owned()
        })
        .ok()
}

fn join_drain(handle: Drain) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(all(test, unix))]
mod tests {
    use std::fs;
    use std::os::unix::fs::PermissionsExt;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn executables_are_found_in_path_order() {
        let first = tempdir().unwrap();
        let second = tempdir().unwrap();
        for dir in [first.path(), second.path()] {
            let tool = dir.join("ffmpeg");
            fs::write(&tool, "#!/bin/sh\n").unwrap();
            fs::set_permissions(&tool, fs::Permissions::from_mode(0o755)).unwrap();
        }
        let not_executable = first.path().join("ffprobe");
        fs::write(&not_executable, "").unwrap();

        let path_var = env::join_paths([first.path(), second.path()]).unwrap();
        let toolchain = Toolchain::search(&path_var);
        assert_eq!(toolchain.ffmpeg, Some(first.path().join("ffmpeg")));
        assert_eq!(toolchain.ffprobe, None);
    }

    #[test]
    fn empty_path_finds_nothing() {
        assert_eq!(Toolchain::search(OsStr::new("")), Toolchain::default());
    }

    #[test]
    fn shell_output_is_captured() {
        let output = run_shell("echo out; echo err >&2; exit 3", Duration::from_secs(10)).unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code(), Some(3));
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[test]
    fn hung_process_times_out() {
        let started = Instant::now();
        let error = run_shell("sleep 30", Duration::from_millis(200)).unwrap_err();
        assert!(matches!(error, ProcessError::Timeout { .. }), "{error}");
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn missing_program_is_a_spawn_error() {
        let error = run_program(
            Path::new("/nonexistent/stepreel-tool"),
            ["-h"],
            Duration::from_secs(1),
        )
        .unwrap_err();
        assert!(matches!(error, ProcessError::Spawn { .. }));
    }
}
