//! Tryte alphabet helpers
//!
//! Addresses, hashes and fixed-width record fields are carried as tryte
//! strings over the alphabet `9A-Z`. Integer fields use a fixed-width
//! base-27 encoding, most significant tryte first, with `9` as zero.

use sha2::{Digest, Sha512};

use crate::error::{Error, Result};

/// The 27 tryte characters, `9` has value zero
pub const TRYTE_ALPHABET: &[u8; 27] = b"9ABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Length of an address or hash in trytes
pub const HASH_LENGTH: usize = 81;

/// Trytes needed to hold any `u64`
pub const VALUE_LENGTH: usize = 14;

/// An all-nines hash, used for unset trunk/branch/hash fields
pub fn null_hash() -> String {
    "9".repeat(HASH_LENGTH)
}

/// Check that `s` consists of tryte characters only
pub fn is_trytes(s: &str) -> bool {
    s.bytes().all(|b| b == b'9' || b.is_ascii_uppercase())
}

/// Check that `s` is a tryte string of exactly `length` characters
pub fn is_trytes_of_length(s: &str, length: usize) -> bool {
    s.len() == length && is_trytes(s)
}

/// Map arbitrary bytes onto trytes, one tryte per byte
pub fn bytes_to_trytes(bytes: &[u8]) -> String {
    bytes
        .iter()
        .map(|b| TRYTE_ALPHABET[(*b as usize) % 27] as char)
        .collect()
}

/// Hash the given chunks into an 81-tryte digest
///
/// Two chained SHA-512 rounds give 128 bytes, of which the first 81 are
/// mapped onto trytes.
pub fn hash_trytes(chunks: &[&[u8]]) -> String {
    let mut hasher = Sha512::new();
    for chunk in chunks {
        hasher.update((chunk.len() as u64).to_be_bytes());
        hasher.update(chunk);
    }
    let first = hasher.finalize();
    let second = Sha512::digest(first);

    let mut bytes = Vec::with_capacity(128);
    bytes.extend_from_slice(&first);
    bytes.extend_from_slice(&second);
    bytes_to_trytes(&bytes[..HASH_LENGTH])
}

fn tryte_value(c: u8) -> Option<u64> {
    TRYTE_ALPHABET.iter().position(|t| *t == c).map(|p| p as u64)
}

/// Encode `value` as exactly `width` trytes
pub fn encode_value(mut value: u64, width: usize) -> String {
    let mut out = vec![b'9'; width];
    for slot in out.iter_mut().rev() {
        *slot = TRYTE_ALPHABET[(value % 27) as usize];
        value /= 27;
    }
    out.into_iter().map(char::from).collect()
}

/// Decode a fixed-width tryte field back into a `u64`
pub fn decode_value(trytes: &str) -> Result<u64> {
    trytes.bytes().try_fold(0u64, |acc, c| {
        let digit = tryte_value(c)
            .ok_or_else(|| Error::IllegalCdaEncoding(format!("non-tryte character {:?}", c as char)))?;
        acc.checked_mul(27)
            .and_then(|v| v.checked_add(digit))
            .ok_or_else(|| Error::IllegalCdaEncoding("value overflow".to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_value_encoding() {
        assert_eq!(encode_value(0, 4), "9999");
        assert_eq!(encode_value(1, 4), "999A");
        assert_eq!(encode_value(27, 4), "99A9");
        assert_eq!(decode_value("99A9").unwrap(), 27);
        assert_eq!(decode_value(&encode_value(u64::MAX, VALUE_LENGTH)).unwrap(), u64::MAX);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode_value("abc").is_err());
        assert!(decode_value(&"Z".repeat(VALUE_LENGTH)).is_err());
    }

    #[test]
    fn test_tryte_checks() {
        assert!(is_trytes_of_length(&null_hash(), HASH_LENGTH));
        assert!(!is_trytes("ABC1"));
        assert_eq!(bytes_to_trytes(&[0, 1, 27, 26]), "9A9Z");
    }

    #[test]
    fn test_hash_trytes_is_deterministic() {
        let a = hash_trytes(&[b"seed", b"1"]);
        assert_eq!(a, hash_trytes(&[b"seed", b"1"]));
        assert_ne!(a, hash_trytes(&[b"seed1", b""]));
        assert!(is_trytes_of_length(&a, HASH_LENGTH));
    }
}
