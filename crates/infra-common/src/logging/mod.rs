//! Logging setup and helpers built on `tracing`

pub mod context;
pub mod setup;
