//! Configuration types for dumpscope
//!
//! Defines:
//! - `Settings` - Top-level settings (`config.toml`)
//! - `AnalyzerSettings`, `RemoteSettings`, `FanOutSettings` - Per-section settings

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use dumpscope_analyzer::text::MAX_CHAR_BYTES;
use dumpscope_analyzer::{EngineOptions, Encoding, LocalOptions, Newline, RemoteOptions};
use dumpscope_core::prelude::*;

/// Smallest text buffer that fits one character plus a two-byte newline
pub const MIN_TEXT_BUFFER_BYTES: usize = MAX_CHAR_BYTES + 2;

/// Application settings (`config.toml`)
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub analyzer: AnalyzerSettings,

    #[serde(default)]
    pub remote: RemoteSettings,

    #[serde(default)]
    pub fan_out: FanOutSettings,
}

/// Local `dotnet-dump` engines
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AnalyzerSettings {
    /// Explicit `dotnet-dump` executable; searched on `PATH` when unset
    #[serde(default)]
    pub dotnet_dump_path: Option<PathBuf>,

    /// Number of debugger processes started per dump
    #[serde(default = "default_parallelism")]
    pub degree_of_parallelism: usize,

    /// `utf-8`, `cp437` or `latin1`
    #[serde(default = "default_encoding")]
    pub encoding: String,

    /// `lf` or `crlf`; the platform convention when unset
    #[serde(default)]
    pub newline: Option<String>,

    #[serde(default = "default_ring_buffer_bytes")]
    pub ring_buffer_bytes: usize,

    #[serde(default = "default_text_buffer_bytes")]
    pub text_buffer_bytes: usize,

    /// Grace period for `exit` before the debugger is killed
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
}

impl Default for AnalyzerSettings {
    fn default() -> Self {
        Self {
            dotnet_dump_path: None,
            degree_of_parallelism: default_parallelism(),
            encoding: default_encoding(),
            newline: None,
            ring_buffer_bytes: default_ring_buffer_bytes(),
            text_buffer_bytes: default_text_buffer_bytes(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
        }
    }
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .max(1)
}

fn default_encoding() -> String {
    "utf-8".to_string()
}

fn default_ring_buffer_bytes() -> usize {
    4096
}

fn default_text_buffer_bytes() -> usize {
    16 * 1024
}

fn default_shutdown_timeout_ms() -> u64 {
    5000
}

/// Remote debugger sessions
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RemoteSettings {
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Capacity of the callback-to-reader rendezvous buffer
    #[serde(default = "default_stream_buffer_bytes")]
    pub stream_buffer_bytes: usize,
}

impl Default for RemoteSettings {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            stream_buffer_bytes: default_stream_buffer_bytes(),
        }
    }
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_stream_buffer_bytes() -> usize {
    64 * 1024
}

/// Work distribution across engines
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FanOutSettings {
    /// Items handed to one engine lease at a time
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for FanOutSettings {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
        }
    }
}

fn default_batch_size() -> usize {
    64
}

impl Settings {
    /// Reject values the engines cannot run with
    pub fn validate(&self) -> Result<()> {
        let analyzer = &self.analyzer;
        if analyzer.degree_of_parallelism == 0 {
            return Err(Error::config_invalid(
                "analyzer.degree_of_parallelism must be at least 1",
            ));
        }
        if analyzer.ring_buffer_bytes == 0 {
            return Err(Error::config_invalid(
                "analyzer.ring_buffer_bytes must be greater than 0",
            ));
        }
        if analyzer.text_buffer_bytes < MIN_TEXT_BUFFER_BYTES {
            return Err(Error::config_invalid(format!(
                "analyzer.text_buffer_bytes must be at least {}",
                MIN_TEXT_BUFFER_BYTES
            )));
        }
        if self.remote.stream_buffer_bytes == 0 {
            return Err(Error::config_invalid(
                "remote.stream_buffer_bytes must be greater than 0",
            ));
        }
        if self.fan_out.batch_size == 0 {
            return Err(Error::config_invalid("fan_out.batch_size must be at least 1"));
        }
        self.encoding()?;
        self.newline()?;
        Ok(())
    }

    pub fn encoding(&self) -> Result<Encoding> {
        self.analyzer.encoding.parse()
    }

    pub fn newline(&self) -> Result<Newline> {
        match self.analyzer.newline.as_deref() {
            Some(value) => value.parse(),
            None => Ok(Newline::platform()),
        }
    }

    /// Engine tuning for the engine called `name`
    pub fn engine_options(&self, name: impl Into<String>) -> EngineOptions {
        EngineOptions {
            ring_buffer_bytes: self.analyzer.ring_buffer_bytes,
            text_buffer_bytes: self.analyzer.text_buffer_bytes,
            shutdown_timeout: Duration::from_millis(self.analyzer.shutdown_timeout_ms),
            ..EngineOptions::named(name)
        }
    }

    pub fn local_options(&self) -> Result<LocalOptions> {
        Ok(LocalOptions {
            dotnet_dump_path: self.analyzer.dotnet_dump_path.clone(),
            encoding: self.encoding()?,
            newline: Some(self.newline()?),
        })
    }

    pub fn remote_options(&self) -> RemoteOptions {
        RemoteOptions {
            connect_timeout: Duration::from_secs(self.remote.connect_timeout_secs),
            stream_buffer_bytes: self.remote.stream_buffer_bytes,
            ..RemoteOptions::default()
        }
    }
}
