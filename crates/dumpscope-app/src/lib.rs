//! # dumpscope-app - Orchestration
//!
//! Everything above a single engine: configuration, a pool of started
//! engines, parallel fan-out over that pool, progress reporting and dump
//! collection.
//!
//! ## Public API
//!
//! - [`Settings`], [`load_settings_or_default()`] - `config.toml` handling
//! - [`EnginePool`], [`EngineLease`] - Exclusive leases on started engines
//! - [`DumpDiagnoser`] - Batched fan-out of analysis work across the pool
//! - [`ProgressSink`], [`Progress`] - Per-category completion reports
//! - [`collect_dump()`] - Write a dump of a live process with `dotnet-dump collect`

pub mod collect;
pub mod config;
pub mod diagnoser;
pub mod pool;
pub mod progress;

pub use collect::{collect_dump, CollectOptions};
pub use config::{load_settings, load_settings_or_default, save_settings, Settings};
pub use diagnoser::{DumpDiagnoser, ThreadStack};
pub use pool::{EngineLease, EnginePool};
pub use progress::{NoProgress, Progress, ProgressSink, TracingProgress};
