//! Local batch debugger subprocess (`dotnet-dump analyze`)

use std::ffi::OsStr;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use dumpscope_core::prelude::*;

use super::{Backend, BackendControl, Transport};
use crate::command::Dialect;
use crate::text::{Encoding, Newline};

const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(20);

/// How to launch `dotnet-dump`
#[derive(Debug, Clone, Default)]
pub struct LocalOptions {
    /// Explicit executable; resolved on `PATH` when unset
    pub dotnet_dump_path: Option<PathBuf>,
    pub encoding: Encoding,
    pub newline: Option<Newline>,
}

/// Handle on a spawned debugger child process.
///
/// Killed on drop if it is still running.
pub struct LocalProcess {
    child: Child,
    program: String,
    pid: u32,
    exit_code: Option<Option<i32>>,
}

impl LocalProcess {
    /// Locate the `dotnet-dump` executable
    pub fn resolve_dotnet_dump(explicit: Option<&Path>) -> Result<PathBuf> {
        match explicit {
            Some(path) if path.exists() => Ok(path.to_path_buf()),
            Some(path) => {
                warn!(
                    "Configured dotnet-dump path {} does not exist, searching PATH",
                    path.display()
                );
                which::which("dotnet-dump").map_err(|_| Error::AnalyzerNotFound)
            }
            None => which::which("dotnet-dump").map_err(|_| Error::AnalyzerNotFound),
        }
    }

    /// Spawn `dotnet-dump analyze <dump>` for one engine
    pub fn spawn_dotnet_dump(dump: &Path, options: &LocalOptions) -> Result<Backend> {
        if !dump.exists() {
            return Err(Error::dump_not_found(dump));
        }
        let program = Self::resolve_dotnet_dump(options.dotnet_dump_path.as_deref())?;
        let args = [OsStr::new("analyze"), dump.as_os_str()];
        Self::spawn_program(
            &program,
            args,
            options.encoding,
            options.newline.unwrap_or_else(Newline::platform),
            Dialect::DotnetDump,
        )
    }

    /// Spawn any program speaking the batch debugger protocol on stdio
    pub fn spawn_program<I, S>(
        program: &Path,
        args: I,
        encoding: Encoding,
        newline: Newline,
        dialect: Dialect,
    ) -> Result<Backend>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let name = program.display().to_string();
        info!("Spawning debugger: {}", name);

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    Error::AnalyzerNotFound
                } else {
                    Error::ProcessSpawn {
                        reason: e.to_string(),
                    }
                }
            })?;

        let pid = child.id();
        info!("Debugger process started with PID: {}", pid);

        let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) else {
            let _ = child.kill();
            return Err(Error::ProcessSpawn {
                reason: "debugger stdio was not captured".to_string(),
            });
        };
        if let Some(stderr) = child.stderr.take() {
            Self::spawn_stderr_reader(stderr, pid)?;
        }

        Ok(Backend {
            transport: Transport {
                reader: Box::new(stdout),
                writer: Box::new(stdin),
                encoding,
                newline,
            },
            control: Box::new(LocalProcess {
                child,
                program: name,
                pid,
                exit_code: None,
            }),
            dialect,
        })
    }

    fn spawn_stderr_reader(stderr: ChildStderr, pid: u32) -> Result<()> {
        thread::Builder::new()
            .name(format!("debugger-{}-stderr", pid))
            .spawn(move || {
                for line in BufReader::new(stderr).lines() {
                    match line {
                        Ok(line) if !line.trim().is_empty() => {
                            debug!(pid, "debugger stderr: {}", line);
                        }
                        Ok(_) => {}
                        Err(e) => {
                            debug!(pid, "debugger stderr closed: {}", e);
                            break;
                        }
                    }
                }
            })?;
        Ok(())
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    fn poll_exit(&mut self) -> bool {
        if self.exit_code.is_some() {
            return true;
        }
        match self.child.try_wait() {
            Ok(Some(status)) => {
                info!(
                    "Debugger process {} exited with status: {:?}",
                    self.pid, status
                );
                self.exit_code = Some(status.code());
                true
            }
            Ok(None) => false,
            Err(e) => {
                error!("Error polling debugger process {}: {}", self.pid, e);
                false
            }
        }
    }
}

impl BackendControl for LocalProcess {
    fn has_exited(&mut self) -> bool {
        self.poll_exit()
    }

    fn wait_for_exit(&mut self, timeout: Duration) -> Result<bool> {
        let deadline = Instant::now() + timeout;
        loop {
            if self.poll_exit() {
                return Ok(true);
            }
            if Instant::now() >= deadline {
                return Ok(false);
            }
            thread::sleep(EXIT_POLL_INTERVAL);
        }
    }

    fn kill(&mut self) -> Result<()> {
        if self.poll_exit() {
            return Ok(());
        }
        info!("Force-killing debugger process {}", self.pid);
        self.child.kill()?;
        let status = self.child.wait()?;
        self.exit_code = Some(status.code());
        Ok(())
    }

    fn exit_code(&self) -> Option<i32> {
        self.exit_code.flatten()
    }

    fn describe(&self) -> String {
        format!("{} (pid {})", self.program, self.pid)
    }
}

impl Drop for LocalProcess {
    fn drop(&mut self) {
        if !self.poll_exit() {
            warn!(
                "Debugger process {} still running on drop, killing",
                self.pid
            );
            let _ = self.child.kill();
            let _ = self.child.wait();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dump_is_reported() {
        let err = LocalProcess::spawn_dotnet_dump(
            Path::new("/definitely/not/here.dmp"),
            &LocalOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, Error::DumpNotFound { .. }));
    }

    #[test]
    fn test_missing_program_maps_to_not_found() {
        let err = LocalProcess::spawn_program(
            Path::new("/definitely/not/a/debugger"),
            ["analyze"],
            Encoding::Utf8,
            Newline::LF,
            Dialect::DotnetDump,
        )
        .unwrap_err();
        assert!(matches!(err, Error::AnalyzerNotFound));
    }

    #[cfg(unix)]
    #[test]
    fn test_wait_and_kill_lifecycle() {
        let mut backend = LocalProcess::spawn_program(
            Path::new("sh"),
            ["-c", "sleep 5"],
            Encoding::Utf8,
            Newline::LF,
            Dialect::DotnetDump,
        )
        .unwrap();

        assert!(!backend.control.has_exited());
        assert!(!backend
            .control
            .wait_for_exit(Duration::from_millis(50))
            .unwrap());
        assert_eq!(backend.control.exit_code(), None);
        backend.control.kill().unwrap();
        assert!(backend.control.has_exited());
        assert!(backend.control.describe().contains("sh"));
    }

    #[cfg(unix)]
    #[test]
    fn test_exit_code_is_reported() {
        let mut backend = LocalProcess::spawn_program(
            Path::new("sh"),
            ["-c", "exit 3"],
            Encoding::Utf8,
            Newline::LF,
            Dialect::DotnetDump,
        )
        .unwrap();
        assert!(backend.control.wait_for_exit(Duration::from_secs(5)).unwrap());
        assert_eq!(backend.control.exit_code(), Some(3));
    }
}
