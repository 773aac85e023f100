//! # SBC Infrastructure Common
//!
//! Plumbing shared by the media and signalling crates:
//!
//! - `logging`: `tracing-subscriber` setup and a small log context helper
//! - `config`: TOML loading for serde-derived configuration structs
//! - `errors`: the infrastructure error type and context extension

pub mod config;
pub mod errors;
pub mod logging;

pub use config::{load_toml_file, parse_toml};
pub use errors::types::{Error, Result};
pub use logging::context::LogContext;
pub use logging::setup::{LoggingConfig, parse_log_level, setup_logging};
