//! Log file setup for the CLI
//!
//! Everything goes to a daily file under the data directory so debugger
//! transcripts never mix with command output on stdout. Warnings and errors
//! are also echoed to stderr.

use std::ffi::OsString;
use std::path::{Path, PathBuf};

use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

/// Filter directives, e.g. `DUMPSCOPE_LOG=dumpscope_analyzer=trace`
pub const LOG_FILTER_ENV: &str = "DUMPSCOPE_LOG";
/// Overrides the log directory
pub const LOG_DIR_ENV: &str = "DUMPSCOPE_LOG_DIR";

const DEFAULT_DIRECTIVES: &str =
    "dumpscope=info,dumpscope_core=info,dumpscope_analyzer=info,dumpscope_app=info,warn";
/// Daily files kept before the oldest is removed
const KEEP_LOG_FILES: usize = 7;

/// Install the global subscriber and return the directory logs go to.
pub fn init() -> Result<PathBuf> {
    let log_dir = log_directory(std::env::var_os(LOG_DIR_ENV));
    let appender = file_appender(&log_dir)?;

    tracing_subscriber::registry()
        .with(env_filter())
        .with(
            fmt::layer()
                .with_writer(appender)
                .with_ansi(false)
                .with_thread_names(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .with(
            fmt::layer()
                .with_writer(std::io::stderr)
                .without_time()
                .with_target(false)
                .with_filter(LevelFilter::WARN),
        )
        .init();

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        "Logging to {}",
        log_dir.display()
    );
    Ok(log_dir)
}

fn env_filter() -> EnvFilter {
    EnvFilter::try_from_env(LOG_FILTER_ENV).unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES))
}

/// `override_dir` when set, otherwise `<data dir>/dumpscope/logs`
fn log_directory(override_dir: Option<OsString>) -> PathBuf {
    match override_dir {
        Some(dir) if !dir.is_empty() => PathBuf::from(dir),
        _ => dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("dumpscope")
            .join("logs"),
    }
}

/// `dumpscope.<date>.log` files in `dir`, rotated daily
fn file_appender(dir: &Path) -> Result<RollingFileAppender> {
    std::fs::create_dir_all(dir)?;
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("dumpscope")
        .filename_suffix("log")
        .max_log_files(KEEP_LOG_FILES)
        .build(dir)
        .map_err(|e| std::io::Error::other(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_log_directory_override() {
        let dir = log_directory(Some(OsString::from("/tmp/dumpscope-logs")));
        assert_eq!(dir, PathBuf::from("/tmp/dumpscope-logs"));
    }

    #[test]
    fn test_empty_override_uses_data_dir() {
        let dir = log_directory(Some(OsString::new()));
        assert!(dir.ends_with("dumpscope/logs"));
        assert_eq!(dir, log_directory(None));
    }

    #[test]
    fn test_default_directives_parse() {
        assert!(EnvFilter::try_new(DEFAULT_DIRECTIVES).is_ok());
    }

    #[test]
    fn test_appender_writes_dated_file() {
        let temp = tempfile::tempdir().unwrap();
        let dir = temp.path().join("nested").join("logs");
        let mut appender = file_appender(&dir).unwrap();
        appender.write_all(b"engine-0 ready\n").unwrap();
        appender.flush().unwrap();

        let names: Vec<String> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|entry| entry.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 1);
        assert!(names[0].starts_with("dumpscope."), "{}", names[0]);
        assert!(names[0].ends_with(".log"), "{}", names[0]);
    }
}
