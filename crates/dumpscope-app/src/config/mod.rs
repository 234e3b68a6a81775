//! Configuration file parsing for dumpscope
//!
//! Settings live in `<config dir>/dumpscope/config.toml`; every field has a
//! default, so a missing or partial file is fine.

pub mod settings;
pub mod types;

pub use settings::{default_config_path, load_settings, load_settings_or_default, save_settings};
pub use types::*;
