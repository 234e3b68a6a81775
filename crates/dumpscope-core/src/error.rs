//! Application error types with rich context

use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Application error types organized by layer/domain
#[derive(Debug, Error)]
pub enum Error {
    // ─────────────────────────────────────────────────────────────
    // Common/Infrastructure Errors
    // ─────────────────────────────────────────────────────────────
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // ─────────────────────────────────────────────────────────────
    // Backend Process Errors
    // ─────────────────────────────────────────────────────────────
    #[error("dotnet-dump not found. Install it with `dotnet tool install -g dotnet-dump` or set analyzer.dotnet_dump_path.")]
    AnalyzerNotFound,

    #[error("Dump file not found: {path}")]
    DumpNotFound { path: PathBuf },

    #[error("Failed to spawn debugger process: {reason}")]
    ProcessSpawn { reason: String },

    #[error("Debugger process error: {message}")]
    Process { message: String },

    #[error("Debugger backend exited unexpectedly with code: {code:?}")]
    BackendExited { code: Option<i32> },

    #[error("Debugger output closed before the end of command output")]
    BackendClosed,

    // ─────────────────────────────────────────────────────────────
    // Protocol Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Debugger protocol error: {message}")]
    Protocol { message: String },

    #[error("A command is already in flight on engine '{engine}'")]
    ExchangeInFlight { engine: String },

    #[error("Engine '{engine}' has already been started")]
    AlreadyStarted { engine: String },

    #[error("Debugger failed to start: {message}")]
    StartupFailed { message: String },

    #[error("Debugger did not become ready within {elapsed:?}")]
    StartupTimeout { elapsed: Duration },

    #[error("Command '{command}' produced no {record}")]
    MissingRecord {
        command: String,
        record: &'static str,
    },

    #[error("Command exceeds {limit} bytes: {command}")]
    CommandTooLong { command: String, limit: usize },

    // ─────────────────────────────────────────────────────────────
    // Remote Session Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Remote debugger error: {message}")]
    Remote { message: String },

    // ─────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Invalid configuration: {message}")]
    ConfigInvalid { message: String },

    // ─────────────────────────────────────────────────────────────
    // Channel/Communication Errors
    // ─────────────────────────────────────────────────────────────
    #[error("Channel closed unexpectedly")]
    ChannelClosed,
}

// ─────────────────────────────────────────────────────────────────
// Convenience Constructors
// ─────────────────────────────────────────────────────────────────

impl Error {
    pub fn process(message: impl Into<String>) -> Self {
        Self::Process {
            message: message.into(),
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn startup(message: impl Into<String>) -> Self {
        Self::StartupFailed {
            message: message.into(),
        }
    }

    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn config_invalid(message: impl Into<String>) -> Self {
        Self::ConfigInvalid {
            message: message.into(),
        }
    }

    pub fn missing_record(command: impl Into<String>, record: &'static str) -> Self {
        Self::MissingRecord {
            command: command.into(),
            record,
        }
    }

    pub fn dump_not_found(path: impl Into<PathBuf>) -> Self {
        Self::DumpNotFound { path: path.into() }
    }

    /// Check if this is a recoverable error
    ///
    /// Recoverable errors leave the engine usable for the next command.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::MissingRecord { .. }
                | Error::CommandTooLong { .. }
                | Error::ExchangeInFlight { .. }
                | Error::Json(_)
        )
    }

    /// Check if this error means the backend session can no longer be used
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::AnalyzerNotFound
                | Error::DumpNotFound { .. }
                | Error::ProcessSpawn { .. }
                | Error::BackendExited { .. }
                | Error::BackendClosed
                | Error::StartupFailed { .. }
                | Error::StartupTimeout { .. }
        )
    }
}

// ─────────────────────────────────────────────────────────────────
// Error Context Extensions
// ─────────────────────────────────────────────────────────────────

/// Extension trait for adding context to Results
pub trait ResultExt<T> {
    /// Add context to an error
    fn context(self, context: impl Into<String>) -> Result<T>;

    /// Add context with a closure (lazy evaluation)
    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String;
}

impl<T, E: Into<Error>> ResultExt<T> for std::result::Result<T, E> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", context.into(), err);
            err
        })
    }

    fn with_context<F>(self, f: F) -> Result<T>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| {
            let err = e.into();
            tracing::error!("{}: {:?}", f(), err);
            err
        })
    }
}
