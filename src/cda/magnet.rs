//! CDA magnet links
//!
//! `iota://<address+checksum>/?timeout_at=<secs>&multi_use=<0|1>[&expected_amount=<n>]`

use url::form_urlencoded;

use super::{verify_cda_checksum, Cda, CDA_ADDRESS_LENGTH};
use crate::error::{Error, Result};
use crate::trytes;

const SCHEME: &str = "iota://";

/// Render a CDA as a magnet link
pub fn serialize_cda_magnet(cda: &Cda) -> String {
    let mut magnet = format!(
        "{}{}/?timeout_at={}&multi_use={}",
        SCHEME,
        cda.address,
        cda.timeout_at,
        if cda.multi_use { "1" } else { "0" }
    );

    if let Some(expected) = cda.expected_amount.filter(|amount| *amount > 0) {
        magnet.push_str(&format!("&expected_amount={}", expected));
    }

    magnet
}

/// Parse a magnet link, verifying the checksum
pub fn parse_cda_magnet(magnet: &str) -> Result<Cda> {
    let magnet = magnet.trim();

    let rest = magnet
        .strip_prefix(SCHEME)
        .ok_or_else(|| Error::InvalidMagnet("Unknown scheme".to_string()))?;

    let address = rest
        .get(..CDA_ADDRESS_LENGTH)
        .filter(|address| trytes::is_trytes_of_length(address, CDA_ADDRESS_LENGTH));
    let Some(address) = address else {
        return Err(Error::InvalidMagnet("Invalid address trytes".to_string()));
    };

    let query = rest[CDA_ADDRESS_LENGTH..]
        .trim_start_matches('/')
        .trim_start_matches('?');

    let mut timeout_at = None;
    let mut multi_use = None;
    let mut expected_amount = None;

    for (key, value) in form_urlencoded::parse(query.as_bytes()) {
        match key.as_ref() {
            "timeout_at" => {
                let parsed = value
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidMagnet("Invalid `timeout_at` field".to_string()))?;
                timeout_at = Some(parsed);
            }
            "multi_use" => {
                multi_use = Some(match value.as_ref() {
                    "1" => true,
                    "0" => false,
                    _ => return Err(Error::InvalidMagnet("Invalid `multi_use` field".to_string())),
                });
            }
            "expected_amount" => {
                let parsed = value
                    .parse::<u64>()
                    .map_err(|_| Error::InvalidMagnet("Invalid `expected_amount` field".to_string()))?;
                expected_amount = Some(parsed);
            }
            _ => {}
        }
    }

    let timeout_at =
        timeout_at.ok_or_else(|| Error::InvalidMagnet("Missing `timeout_at` field".to_string()))?;
    let multi_use = multi_use.unwrap_or(false);
    let expected_amount = expected_amount.filter(|amount| *amount > 0);

    if multi_use && expected_amount.is_some() {
        return Err(Error::ConflictingConditions);
    }

    let cda = Cda {
        address: address.to_string(),
        timeout_at,
        multi_use,
        expected_amount,
    };

    verify_cda_checksum(&cda)?;

    Ok(cda)
}
