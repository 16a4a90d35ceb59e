//! Error types for chunked dataset access

use thiserror::Error;

/// Main error type for h5chunk operations
#[derive(Error, Debug)]
pub enum H5Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid format: {0}")]
    InvalidFormat(String),

    #[error("Invalid signature: expected {expected}, found {found}")]
    InvalidSignature { expected: String, found: String },

    #[error("Unsupported {structure} version: {version}")]
    UnsupportedVersion { structure: &'static str, version: u8 },

    #[error("Unknown filter '{name}' with id {id}")]
    UnknownFilter { id: u16, name: String },

    #[error("Filter '{name}' with id {id} is not supported")]
    UnsupportedFilter { id: u16, name: String },

    #[error("Checksum mismatch in {0}")]
    ChecksumMismatch(String),

    #[error("Selection size mismatch: {0}")]
    SelectionSizeMismatch(String),

    #[error("Buffer too small: need {required} bytes, got {actual}")]
    BufferTooSmall { required: usize, actual: usize },

    #[error("Invalid dimensions: {0}")]
    InvalidDimensions(String),

    #[error("Invalid selection: {0}")]
    InvalidSelection(String),

    #[error("Out of bounds: {0}")]
    OutOfBounds(String),

    #[error("Compression error: {0}")]
    Compression(String),

    #[error("Decompression error: {0}")]
    Decompression(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Virtual dataset recursion exceeded depth {0}")]
    RecursionLimit(usize),

    #[error("Read cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Configuration(String),
}

/// Specialized Result type for h5chunk operations
pub type Result<T> = std::result::Result<T, H5Error>;

impl From<serde_json::Error> for H5Error {
    fn from(err: serde_json::Error) -> Self {
        H5Error::Serialization(err.to_string())
    }
}
