//! Conditional deposit addresses
//!
//! A CDA is a deposit address plus spending conditions (timeout, multi-use,
//! expected amount) and a 9-tryte checksum binding the conditions to the
//! address. The checksummed 90-tryte address is what gets shared.
//!
//! # Stored layout
//!
//! ```text
//! address(81) | checksum(9) | index(14) | security(1) | timeout_at(14) | multi_use(1) | expected_amount(14)
//! ```

pub mod magnet;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::signing::Security;
use crate::trytes::{self, HASH_LENGTH, VALUE_LENGTH};

pub use magnet::{parse_cda_magnet, serialize_cda_magnet};

pub const CDA_CHECKSUM_LENGTH: usize = 9;

/// Address plus checksum
pub const CDA_ADDRESS_LENGTH: usize = HASH_LENGTH + CDA_CHECKSUM_LENGTH;

const INDEX_OFFSET: usize = CDA_ADDRESS_LENGTH;
const SECURITY_OFFSET: usize = INDEX_OFFSET + VALUE_LENGTH;
const TIMEOUT_AT_OFFSET: usize = SECURITY_OFFSET + 1;
const MULTI_USE_OFFSET: usize = TIMEOUT_AT_OFFSET + VALUE_LENGTH;
const EXPECTED_AMOUNT_OFFSET: usize = MULTI_USE_OFFSET + 1;

/// Length of a serialized `CdaInput`
pub const CDA_LENGTH: usize = EXPECTED_AMOUNT_OFFSET + VALUE_LENGTH;

/// Conditions requested when generating a CDA
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CdaParams {
    /// Unix time (seconds) after which the address stops accepting deposits
    pub timeout_at: u64,
    #[serde(default)]
    pub multi_use: bool,
    #[serde(default)]
    pub expected_amount: Option<u64>,
    /// Defaults to the account security level
    #[serde(default)]
    pub security: Option<Security>,
}

/// A shareable conditional deposit address
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cda {
    /// 90 trytes: address followed by checksum
    pub address: String,
    pub timeout_at: u64,
    #[serde(default)]
    pub multi_use: bool,
    #[serde(default)]
    pub expected_amount: Option<u64>,
}

/// A request to pay into a CDA
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CdaTransfer {
    #[serde(flatten)]
    pub cda: Cda,
    pub value: u64,
}

/// A CDA owned by this account, with its derivation data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CdaInput {
    /// Address without checksum
    pub address: String,
    /// Key index the address was derived at
    pub index: u64,
    pub security: Security,
    pub timeout_at: u64,
    pub multi_use: bool,
    pub expected_amount: Option<u64>,
    /// Balance observed during input selection; never persisted
    pub balance: Option<u64>,
}

/// Check if a timeout has passed; a zero timeout never expires
pub fn is_expired(now: u64, timeout_at: u64) -> bool {
    timeout_at != 0 && timeout_at <= now
}

/// Compute the checksum binding `address` to its conditions
pub fn checksum(address: &str, timeout_at: u64, multi_use: bool, expected_amount: Option<u64>) -> String {
    // Multi-use addresses never carry an expected amount
    let expected = if multi_use { 0 } else { expected_amount.unwrap_or(0) };
    let digest = trytes::hash_trytes(&[
        address.as_bytes(),
        trytes::encode_value(timeout_at, VALUE_LENGTH).as_bytes(),
        if multi_use { b"A".as_slice() } else { b"9".as_slice() },
        trytes::encode_value(expected, VALUE_LENGTH).as_bytes(),
    ]);
    digest[HASH_LENGTH - CDA_CHECKSUM_LENGTH..].to_string()
}

fn verify_conditions(now: u64, timeout_at: u64, multi_use: bool, expected_amount: Option<u64>) -> Result<()> {
    if multi_use && expected_amount.is_some_and(|amount| amount > 0) {
        return Err(Error::ConflictingConditions);
    }

    if timeout_at <= now {
        return Err(Error::ExpiredTimeout);
    }

    Ok(())
}

/// Validate generation parameters against the current time
pub fn verify_cda_params(now: u64, params: &CdaParams) -> Result<()> {
    verify_conditions(now, params.timeout_at, params.multi_use, params.expected_amount)
}

/// Validate a shared CDA: address shape, conditions and checksum
pub fn verify_cda(now: u64, cda: &Cda) -> Result<()> {
    if !trytes::is_trytes_of_length(&cda.address, CDA_ADDRESS_LENGTH) {
        return Err(Error::IllegalAddress(cda.address.clone()));
    }
    verify_conditions(now, cda.timeout_at, cda.multi_use, cda.expected_amount)?;
    verify_cda_checksum(cda)
}

/// Validate the checksum of a shared CDA
pub fn verify_cda_checksum(cda: &Cda) -> Result<()> {
    if !cda.has_valid_checksum() {
        return Err(Error::InvalidChecksum);
    }
    Ok(())
}

/// Validate a transfer to a CDA
pub fn verify_cda_transfer(now: u64, transfer: &CdaTransfer) -> Result<()> {
    if let Some(expected) = transfer.cda.expected_amount.filter(|amount| *amount > 0) {
        if transfer.value > expected {
            return Err(Error::ValueExceedsExpectedAmount(expected));
        }
    }
    verify_cda(now, &transfer.cda)
}

impl Cda {
    /// The 81-tryte address the ledger knows about
    pub fn address_without_checksum(&self) -> &str {
        let end = self.address.len().min(HASH_LENGTH);
        &self.address[..end]
    }

    pub fn has_valid_checksum(&self) -> bool {
        self.address.len() == CDA_ADDRESS_LENGTH
            && self.address[HASH_LENGTH..]
                == checksum(
                    self.address_without_checksum(),
                    self.timeout_at,
                    self.multi_use,
                    self.expected_amount,
                )
    }

    pub fn is_expired(&self, now: u64) -> bool {
        is_expired(now, self.timeout_at)
    }
}

impl CdaInput {
    pub fn is_expired(&self, now: u64) -> bool {
        is_expired(now, self.timeout_at)
    }

    /// The shareable form of this address
    pub fn to_cda(&self) -> Cda {
        Cda {
            address: format!(
                "{}{}",
                self.address,
                checksum(&self.address, self.timeout_at, self.multi_use, self.expected_amount)
            ),
            timeout_at: self.timeout_at,
            multi_use: self.multi_use,
            expected_amount: self.expected_amount,
        }
    }

    /// Encode into the fixed tryte layout
    pub fn serialize(&self) -> String {
        let expected = self.expected_amount.unwrap_or(0);
        let mut out = String::with_capacity(CDA_LENGTH);
        out.push_str(&self.address);
        out.push_str(&checksum(&self.address, self.timeout_at, self.multi_use, self.expected_amount));
        out.push_str(&trytes::encode_value(self.index, VALUE_LENGTH));
        out.push(match self.security {
            Security::Low => 'A',
            Security::Medium => 'B',
            Security::High => 'C',
        });
        out.push_str(&trytes::encode_value(self.timeout_at, VALUE_LENGTH));
        out.push(if self.multi_use { 'A' } else { '9' });
        out.push_str(&trytes::encode_value(expected, VALUE_LENGTH));
        out
    }

    /// Decode from the fixed tryte layout, verifying the checksum
    pub fn deserialize(encoded: &str) -> Result<Self> {
        if !trytes::is_trytes_of_length(encoded, CDA_LENGTH) {
            return Err(Error::IllegalCdaEncoding(format!(
                "expected {} trytes, got {} characters",
                CDA_LENGTH,
                encoded.len()
            )));
        }

        let address = encoded[..HASH_LENGTH].to_string();
        let index = trytes::decode_value(&encoded[INDEX_OFFSET..SECURITY_OFFSET])?;
        let security = match &encoded[SECURITY_OFFSET..TIMEOUT_AT_OFFSET] {
            "A" => Security::Low,
            "B" => Security::Medium,
            "C" => Security::High,
            other => return Err(Error::IllegalCdaEncoding(format!("security tryte {}", other))),
        };
        let timeout_at = trytes::decode_value(&encoded[TIMEOUT_AT_OFFSET..MULTI_USE_OFFSET])?;
        let multi_use = match &encoded[MULTI_USE_OFFSET..EXPECTED_AMOUNT_OFFSET] {
            "9" => false,
            "A" => true,
            other => return Err(Error::IllegalCdaEncoding(format!("multi-use tryte {}", other))),
        };
        let expected = trytes::decode_value(&encoded[EXPECTED_AMOUNT_OFFSET..])?;
        let expected_amount = (expected > 0).then_some(expected);

        if encoded[HASH_LENGTH..INDEX_OFFSET] != checksum(&address, timeout_at, multi_use, expected_amount) {
            return Err(Error::InvalidChecksum);
        }

        Ok(Self {
            address,
            index,
            security,
            timeout_at,
            multi_use,
            expected_amount,
            balance: None,
        })
    }
}
