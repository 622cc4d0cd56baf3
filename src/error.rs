//! Typed error kinds for expected failure paths.
//!
//! Everything else travels as `anyhow::Error`; these enums are what callers
//! match on (or `downcast_ref` to) when they need to know which parameter was
//! rejected and why.

use thiserror::Error;

/// Configuration rejected at load, create or initialize time.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("rows_per_packet must be between 1 and {max}, got {value}")]
    RowsPerPacket { value: u32, max: u8 },

    #[error("unsupported resolution {0}; expected 240, 180 or 120")]
    Resolution(u32),

    #[error("unsupported color mode '{0}'; expected rgb565 or rgb332")]
    ColorMode(String),

    #[error("packets of {size} bytes exceed max_datagram_bytes ({limit})")]
    DatagramTooLarge { size: usize, limit: usize },

    #[error("unknown transport profile '{0}'")]
    UnknownProfile(String),

    #[error("unknown source kind '{0}'")]
    UnknownSourceKind(String),

    #[error("source kind '{0}' has no built-in backend; insert an initialized source instead")]
    UnsupportedSourceKind(&'static str),

    #[error("source id '{0}' already exists")]
    DuplicateSourceId(String),

    #[error("source id '{0}' is not registered")]
    UnknownSourceId(String),

    #[error("invalid value for '{field}': {reason}")]
    InvalidField { field: String, reason: String },

    #[error("invalid source parameters: {0}")]
    InvalidParams(String),
}

impl ConfigError {
    pub(crate) fn field(field: &str, reason: impl Into<String>) -> Self {
        ConfigError::InvalidField {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Malformed packet header.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireError {
    #[error("packet is {0} bytes; the header alone needs 5")]
    Truncated(usize),

    #[error("reserved resolution code {0}")]
    ResolutionCode(u8),

    #[error("reserved color code {0}")]
    ColorCode(u8),

    #[error("row count {0} does not fit the 4-bit header field")]
    RowCount(u32),
}
