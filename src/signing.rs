//! Key derivation and bundle signing
//!
//! `Signer` is the seam between the account engine and the signature
//! scheme. `SeedSigner` derives addresses and signature fragments from a
//! seed with chained SHA-512; it is deterministic, so the same seed, index
//! and security level always give the same address.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bundle::{Bundle, Transaction, TransferOutput};
use crate::cda::CdaInput;
use crate::error::{Error, Result};
use crate::trytes::{self, HASH_LENGTH, TRYTE_ALPHABET};

/// Signature strength used when deriving keys and addresses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Security {
    Low = 1,
    #[default]
    Medium = 2,
    High = 3,
}

impl Security {
    /// Number of key fragments (and input transactions) at this level
    pub fn fragments(self) -> usize {
        self as usize
    }
}

impl TryFrom<u8> for Security {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(Security::Low),
            2 => Ok(Security::Medium),
            3 => Ok(Security::High),
            other => Err(Error::InvalidSecurityLevel(other)),
        }
    }
}

impl From<Security> for u8 {
    fn from(security: Security) -> Self {
        security as u8
    }
}

impl fmt::Display for Security {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// An 81-tryte account seed
#[derive(Clone, PartialEq, Eq)]
pub struct Seed(String);

impl Seed {
    /// Parse a seed from trytes
    pub fn from_trytes(trytes: &str) -> Result<Self> {
        let trytes = trytes.trim();
        if !trytes::is_trytes_of_length(trytes, HASH_LENGTH) {
            return Err(Error::InvalidSeed(format!(
                "expected {} trytes, got {} characters",
                HASH_LENGTH,
                trytes.len()
            )));
        }
        Ok(Self(trytes.to_string()))
    }

    /// Generate a fresh random seed
    pub fn random() -> Self {
        let mut rng = rand::thread_rng();
        let seed = (0..HASH_LENGTH)
            .map(|_| TRYTE_ALPHABET[rng.gen_range(0..27)] as char)
            .collect();
        Self(seed)
    }

    /// Expose the seed trytes
    pub fn expose(&self) -> &str {
        &self.0
    }
}

// Never print the seed
impl fmt::Debug for Seed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Seed({}...)", &self.0[..3])
    }
}

/// Address derivation and bundle signing
pub trait Signer: Send + Sync {
    /// Derive the address (without checksum) at `index`
    fn address(&self, index: u64, security: Security) -> String;

    /// Build and sign a bundle spending `inputs` into `transfers`
    ///
    /// Any surplus of the inputs over the transfers goes to
    /// `remainder_address`, which must then be present.
    fn prepare_transfers(
        &self,
        transfers: &[TransferOutput],
        inputs: &[CdaInput],
        remainder_address: Option<&str>,
        timestamp: u64,
    ) -> Result<Bundle>;
}

/// Derive the storage identifier for the account owning `signer`
pub fn persistence_id(signer: &dyn Signer) -> String {
    trytes::hash_trytes(&[b"persistence", signer.address(0, Security::Medium).as_bytes()])
}

/// Seed-backed signer
pub struct SeedSigner {
    seed: Seed,
}

impl SeedSigner {
    pub fn new(seed: Seed) -> Self {
        Self { seed }
    }

    fn subseed(&self, index: u64) -> String {
        trytes::hash_trytes(&[self.seed.expose().as_bytes(), &index.to_be_bytes()])
    }

    fn key_fragments(&self, index: u64, security: Security) -> Vec<String> {
        let subseed = self.subseed(index);
        (0..security.fragments())
            .map(|i| trytes::hash_trytes(&[subseed.as_bytes(), b"key", &(i as u64).to_be_bytes()]))
            .collect()
    }

    fn sign_fragment(key_fragment: &str, bundle_hash: &str) -> String {
        trytes::hash_trytes(&[key_fragment.as_bytes(), bundle_hash.as_bytes()])
    }
}

impl Signer for SeedSigner {
    fn address(&self, index: u64, security: Security) -> String {
        let digests: Vec<String> = self
            .key_fragments(index, security)
            .iter()
            .map(|fragment| trytes::hash_trytes(&[b"digest", fragment.as_bytes()]))
            .collect();
        let chunks: Vec<&[u8]> = digests.iter().map(|d| d.as_bytes()).collect();
        trytes::hash_trytes(&chunks)
    }

    fn prepare_transfers(
        &self,
        transfers: &[TransferOutput],
        inputs: &[CdaInput],
        remainder_address: Option<&str>,
        timestamp: u64,
    ) -> Result<Bundle> {
        let total_out: u64 = transfers.iter().map(|t| t.value).sum();
        let mut total_in: u64 = 0;
        for input in inputs {
            let balance = input
                .balance
                .ok_or_else(|| Error::BundleBuild(format!("input {} has no balance", input.address)))?;
            total_in += balance;
        }

        if total_in < total_out {
            return Err(Error::BundleBuild(format!(
                "inputs hold {} but transfers need {}",
                total_in, total_out
            )));
        }

        let remainder = total_in - total_out;
        let remainder_address = match (remainder, remainder_address) {
            (0, _) => None,
            (_, Some(address)) => Some(address),
            (_, None) => {
                return Err(Error::BundleBuild(format!(
                    "remainder of {} needs a remainder address",
                    remainder
                )))
            }
        };

        let entry = |address: &str, value: i64| Transaction {
            hash: trytes::null_hash(),
            signature_message_fragment: String::new(),
            address: address.to_string(),
            value,
            timestamp,
            current_index: 0,
            last_index: 0,
            bundle: trytes::null_hash(),
            trunk_transaction: trytes::null_hash(),
            branch_transaction: trytes::null_hash(),
            attachment_timestamp: 0,
            nonce: String::new(),
        };

        let mut transactions = Vec::new();

        for transfer in transfers {
            if !trytes::is_trytes_of_length(&transfer.address, HASH_LENGTH) {
                return Err(Error::IllegalAddress(transfer.address.clone()));
            }
            transactions.push(entry(&transfer.address, transfer.value as i64));
        }

        // One entry per key fragment; only the first carries the value
        let mut signed_slots = Vec::new();
        for input in inputs {
            let balance = input.balance.unwrap_or_default() as i64;
            for fragment in 0..input.security.fragments() {
                let value = if fragment == 0 { -balance } else { 0 };
                signed_slots.push((transactions.len(), input.index, input.security, fragment));
                transactions.push(entry(&input.address, value));
            }
        }

        if let Some(address) = remainder_address {
            transactions.push(entry(address, remainder as i64));
        }

        let last_index = transactions.len().saturating_sub(1);
        for (i, tx) in transactions.iter_mut().enumerate() {
            tx.current_index = i;
            tx.last_index = last_index;
        }

        let bundle_hash = Bundle::essence_hash(&transactions);
        for tx in transactions.iter_mut() {
            tx.bundle = bundle_hash.clone();
        }

        for (slot, index, security, fragment) in signed_slots {
            let keys = self.key_fragments(index, security);
            transactions[slot].signature_message_fragment =
                Self::sign_fragment(&keys[fragment], &bundle_hash);
        }

        Bundle::new(transactions)
    }
}
