use thiserror::Error;

/// Errors raised by the shared infrastructure
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration could not be interpreted
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configuration file could not be read
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A configuration document failed to parse
    #[error("Parse error: {0}")]
    Parse(String),

    /// Error with additional context attached
    #[error("{0}")]
    Custom(String),
}

pub type Result<T> = std::result::Result<T, Error>;
