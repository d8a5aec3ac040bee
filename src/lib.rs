//! Tangle Account Library
//!
//! Conditional deposit address (CDA) account engine: address generation,
//! input selection, bundle issuance and attachment until inclusion.

pub mod account;
pub mod bundle;
pub mod cda;
pub mod cli;
pub mod config;
pub mod error;
pub mod network;
pub mod persistence;
pub mod queue;
pub mod signing;
pub mod trytes;

// Re-export commonly used types
pub use account::{Account, AccountEvent, AccountParams, AttachmentParams};
pub use cda::{Cda, CdaParams, CdaTransfer};
pub use config::Config;
pub use error::{Error, Result};
