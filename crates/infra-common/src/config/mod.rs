//! TOML configuration loading
//!
//! Every configuration section in the workspace derives `Deserialize` with
//! `#[serde(default)]`, so a partial file only overrides what it names.

use crate::errors::context::{ErrorContext, ErrorExt};
use crate::errors::types::{Error, Result};
use serde::de::DeserializeOwned;
use std::path::Path;

/// Parse a configuration document
pub fn parse_toml<T: DeserializeOwned>(text: &str) -> Result<T> {
    toml::from_str(text).map_err(|e| Error::Parse(e.to_string()))
}

/// Read and parse a configuration file
pub fn load_toml_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    tracing::debug!(path = %path.display(), "loaded configuration file");
    parse_toml(&text).map_err(|e| e.context(ErrorContext::new("config", "load").with_details(path.display().to_string())))
}
