//! Typed records, keys and store events

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bundle::{Bundle, Hash};
use crate::cda::{Cda, CdaInput};
use crate::error::{Error, Result};

/// Reserved key of the address index counter
pub const KEY_INDEX_KEY: &str = "key_index";

pub const CDA_PREFIX: &str = "cda:";
pub const BUNDLE_PREFIX: &str = "bundle:";
pub const OUTGOING_PREFIX: &str = "outgoing:";

pub const DEPOSIT_PREFIX: &str = "deposit:";
pub const TRANSFER_PREFIX: &str = "transfer:";

/// Key of a record in the state store
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// CDA by address (without checksum)
    Cda(String),
    /// Outbound bundle by bundle hash
    Bundle(Hash),
    /// Marker for a single-use recipient already paid
    Outgoing(String),
}

impl RecordKey {
    pub fn to_key(&self) -> String {
        match self {
            RecordKey::Cda(address) => format!("{}{}", CDA_PREFIX, address),
            RecordKey::Bundle(hash) => format!("{}{}", BUNDLE_PREFIX, hash),
            RecordKey::Outgoing(address) => format!("{}{}", OUTGOING_PREFIX, address),
        }
    }

    pub fn parse(key: &str) -> Option<Self> {
        if let Some(address) = key.strip_prefix(CDA_PREFIX) {
            Some(RecordKey::Cda(address.to_string()))
        } else if let Some(hash) = key.strip_prefix(BUNDLE_PREFIX) {
            Some(RecordKey::Bundle(hash.to_string()))
        } else {
            key.strip_prefix(OUTGOING_PREFIX)
                .map(|address| RecordKey::Outgoing(address.to_string()))
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_key())
    }
}

/// Payment to a single-use CDA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutgoingTransfer {
    pub address: String,
    pub bundle: Hash,
}

/// A record in the state store
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Record {
    Cda(CdaInput),
    Bundle(Bundle),
    Outgoing(OutgoingTransfer),
}

impl Record {
    pub fn key(&self) -> RecordKey {
        match self {
            Record::Cda(input) => RecordKey::Cda(input.address.clone()),
            Record::Bundle(bundle) => RecordKey::Bundle(bundle.hash.clone()),
            Record::Outgoing(outgoing) => RecordKey::Outgoing(outgoing.address.clone()),
        }
    }

    /// Encode the record value
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Record::Cda(input) => Ok(input.serialize().into_bytes()),
            Record::Bundle(bundle) => Ok(serde_json::to_vec(bundle)?),
            Record::Outgoing(outgoing) => Ok(serde_json::to_vec(outgoing)?),
        }
    }

    /// Decode a stored value, using the key to pick the record type
    pub fn decode(key: &str, value: &[u8]) -> Result<Self> {
        let record_key = RecordKey::parse(key)
            .ok_or_else(|| Error::Deserialization(format!("unknown record key {}", key)))?;

        match record_key {
            RecordKey::Cda(_) => {
                let encoded = std::str::from_utf8(value)
                    .map_err(|e| Error::Deserialization(e.to_string()))?;
                Ok(Record::Cda(CdaInput::deserialize(encoded)?))
            }
            RecordKey::Bundle(_) => serde_json::from_slice(value)
                .map(Record::Bundle)
                .map_err(|e| Error::Deserialization(e.to_string())),
            RecordKey::Outgoing(_) => serde_json::from_slice(value)
                .map(Record::Outgoing)
                .map_err(|e| Error::Deserialization(e.to_string())),
        }
    }
}

/// One operation of an atomic batch
#[derive(Debug, Clone)]
pub enum BatchOp {
    Put(Record),
    Del(RecordKey),
}

/// Event emitted for every record replayed or written
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// Record read back during startup replay
    Replayed(Record),
    /// Record durably written
    Written(Record),
    /// Record durably deleted
    Deleted(RecordKey),
}

/// A deposit that left the state store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEntry {
    pub cda: Cda,
    pub index: u64,
    /// Balance observed when the deposit was retired
    pub balance: u64,
    /// Bundle that spent the deposit, if any
    #[serde(default)]
    pub bundle: Option<Hash>,
    pub recorded_at: DateTime<Utc>,
}

/// An outbound transfer confirmed by the network
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferEntry {
    pub bundle: Bundle,
    pub included_at: DateTime<Utc>,
}

pub fn deposit_key(address: &str) -> String {
    format!("{}{}", DEPOSIT_PREFIX, address)
}

pub fn transfer_key(hash: &str) -> String {
    format!("{}{}", TRANSFER_PREFIX, hash)
}
