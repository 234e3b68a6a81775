//! Capturing a dump from a live .NET process with `dotnet-dump collect`

use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use dumpscope_analyzer::LocalProcess;
use dumpscope_core::prelude::*;

use crate::config::Settings;

/// Default upper bound for a single `collect` run
pub const DEFAULT_COLLECT_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct CollectOptions {
    pub dotnet_dump_path: Option<PathBuf>,
    /// Dump type passed as `--type` (`Full`, `Heap`, `Mini`); `None` keeps the tool default
    pub dump_type: Option<String>,
    pub timeout: Duration,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            dotnet_dump_path: None,
            dump_type: None,
            timeout: DEFAULT_COLLECT_TIMEOUT,
        }
    }
}

impl CollectOptions {
    pub fn from_settings(settings: &Settings) -> Self {
        Self {
            dotnet_dump_path: settings.analyzer.dotnet_dump_path.clone(),
            ..Self::default()
        }
    }
}

/// Write a dump of process `pid` to `output` and return its path
pub async fn collect_dump(pid: u32, output: &Path, options: &CollectOptions) -> Result<PathBuf> {
    let program = LocalProcess::resolve_dotnet_dump(options.dotnet_dump_path.as_deref())?;
    let pid = pid.to_string();
    let mut args = vec![
        OsStr::new("collect"),
        OsStr::new("-p"),
        OsStr::new(&pid),
        OsStr::new("-o"),
        output.as_os_str(),
    ];
    if let Some(dump_type) = &options.dump_type {
        args.push(OsStr::new("--type"));
        args.push(OsStr::new(dump_type));
    }

    info!(pid = %pid, output = %output.display(), "Collecting dump");
    run_collector(&program, &args, options.timeout).await?;

    if !output.exists() {
        return Err(Error::dump_not_found(output));
    }
    Ok(output.to_path_buf())
}

/// Run `program` to completion, killing it after `timeout`
pub async fn run_collector<S: AsRef<OsStr>>(
    program: &Path,
    args: &[S],
    timeout: Duration,
) -> Result<()> {
    let mut child = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::ProcessSpawn {
            reason: format!("{}: {}", program.display(), e),
        })?;

    let waited = tokio::time::timeout(timeout, wait_with_output(&mut child)).await;
    let output = match waited {
        Ok(output) => output?,
        Err(_) => {
            warn!("{} timed out after {:?}, killing it", program.display(), timeout);
            if let Err(e) = child.kill().await {
                debug!("Kill after timeout failed: {}", e);
            }
            return Err(Error::process(format!(
                "{} timed out after {:?}",
                program.display(),
                timeout
            )));
        }
    };

    for line in output.stdout.lines() {
        debug!(target: "dumpscope::collect", "{}", line);
    }
    if !output.success {
        let detail = output
            .stderr
            .lines()
            .chain(output.stdout.lines())
            .find(|line| !line.trim().is_empty())
            .unwrap_or("no output");
        return Err(Error::process(format!(
            "{} exited with {}: {}",
            program.display(),
            output.status,
            detail.trim()
        )));
    }
    Ok(())
}

struct CollectorOutput {
    success: bool,
    status: String,
    stdout: String,
    stderr: String,
}

/// Like `Child::wait_with_output` but keeps the child so it can still be killed
async fn wait_with_output(child: &mut tokio::process::Child) -> Result<CollectorOutput> {
    use tokio::io::AsyncReadExt;

    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let read_out = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stdout.as_mut() {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };
    let read_err = async {
        let mut buf = Vec::new();
        if let Some(pipe) = stderr.as_mut() {
            pipe.read_to_end(&mut buf).await?;
        }
        Ok::<_, std::io::Error>(buf)
    };

    let (out, err, status) = tokio::join!(read_out, read_err, child.wait());
    let status = status?;
    Ok(CollectorOutput {
        success: status.success(),
        status: status.to_string(),
        stdout: String::from_utf8_lossy(&out?).into_owned(),
        stderr: String::from_utf8_lossy(&err?).into_owned(),
    })
}
