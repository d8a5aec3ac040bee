//! Error types for the account engine

use thiserror::Error;

/// Result type alias using our custom Error
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for the account engine
#[derive(Error, Debug)]
pub enum Error {
    // Validation errors
    #[error("Only one of the following fields can be set: multiUse, expectedAmount")]
    ConflictingConditions,

    #[error("Expired timeout.")]
    ExpiredTimeout,

    #[error("Value cannot exceed expected amount of {0} iotas.")]
    ValueExceedsExpectedAmount(u64),

    #[error("Invalid CDA checksum.")]
    InvalidChecksum,

    #[error("Illegal address trytes: {0}")]
    IllegalAddress(String),

    #[error("Invalid seed: {0}")]
    InvalidSeed(String),

    #[error("Invalid security level: {0}")]
    InvalidSecurityLevel(u8),

    #[error("Invalid magnet link: {0}")]
    InvalidMagnet(String),

    #[error("Illegal CDA encoding: {0}")]
    IllegalCdaEncoding(String),

    #[error("Invalid transfer: {0}")]
    InvalidTransfer(String),

    // Balance errors
    #[error("Insufficient balance")]
    InsufficientBalance,

    // Spending policy errors
    #[error("Aborted sending to spent address; {0}")]
    SpentAddress(String),

    #[error("Aborted sending twice to the same address; {0}")]
    SendingTwice(String),

    // Persistence errors
    #[error("Illegal key index: {0}")]
    IllegalKeyIndex(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("CDA already in store: {0}")]
    CdaAlreadyInStore(String),

    #[error("Storage error: {0}")]
    Storage(String),

    // Network errors
    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("RPC timeout after {0}ms")]
    RpcTimeout(u64),

    #[error("RPC connection failed: {0}")]
    RpcConnection(String),

    #[error("Node rejected request: {0}")]
    NodeRejected(String),

    // Bundle errors
    #[error("Bundle build failed: {0}")]
    BundleBuild(String),

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Deserialization error: {0}")]
    Deserialization(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    // Generic errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

impl Error {
    /// Check if this error is retryable (transient)
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Rpc(_) | Error::RpcTimeout(_) | Error::RpcConnection(_)
        )
    }

    /// Check if this error rejects malformed caller input
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::ConflictingConditions
                | Error::ExpiredTimeout
                | Error::ValueExceedsExpectedAmount(_)
                | Error::InvalidChecksum
                | Error::IllegalAddress(_)
                | Error::InvalidSeed(_)
                | Error::InvalidSecurityLevel(_)
                | Error::InvalidMagnet(_)
                | Error::IllegalCdaEncoding(_)
                | Error::InvalidTransfer(_)
        )
    }

    /// Check if this error is a spending policy abort
    pub fn is_policy_abort(&self) -> bool {
        matches!(self, Error::SpentAddress(_) | Error::SendingTwice(_))
    }

    /// Check if this error means a key is absent from storage
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

// Conversion from reqwest errors
impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Error::RpcTimeout(0)
        } else if e.is_connect() {
            Error::RpcConnection(e.to_string())
        } else {
            Error::Rpc(e.to_string())
        }
    }
}

// Conversion from serde_json errors
impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}

// Conversion from I/O errors
impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}
