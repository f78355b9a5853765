//! Common error types for PhazeTunnel.

use thiserror::Error;

/// Result type alias using PhazeTunnel's error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for setup and management operations.
///
/// The packet path uses the narrower error enums of each crate; this one
/// covers loading configuration and identities.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (file, network, etc.)
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Create a serialization error from any displayable type.
    pub fn serialization(msg: impl std::fmt::Display) -> Self {
        Self::Serialization(msg.to_string())
    }

    /// Create a config error from any displayable type.
    pub fn config(msg: impl std::fmt::Display) -> Self {
        Self::Config(msg.to_string())
    }
}
