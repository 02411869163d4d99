use lazy_static::lazy_static;
use regex::Regex;
use sha3::{Digest, Keccak256};

use crate::core::errors::BridgeError;

lazy_static! {
    static ref ADDRESS_RE: Regex =
        Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("Hardcoded regex should always compile");
    static ref TX_HASH_RE: Regex =
        Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("Hardcoded regex should always compile");
}

/// Validates an Ethereum-style account address.
pub fn validate_ethereum_address(address: &str) -> Result<(), BridgeError> {
    if !ADDRESS_RE.is_match(address) {
        return Err(BridgeError::InvalidSubmission(format!("invalid sender address: {}", address)));
    }
    // EIP-55: if mixed-case, enforce checksum. All-lower or all-upper acceptable for compatibility.
    let body = &address[2..];
    let is_all_lower = !body.chars().any(|c| c.is_ascii_uppercase());
    let is_all_upper = !body.chars().any(|c| c.is_ascii_lowercase());
    if is_all_lower || is_all_upper {
        return Ok(());
    }
    if !is_eip55_checksum_valid(address) {
        return Err(BridgeError::InvalidSubmission(format!(
            "invalid EIP-55 checksum for address {}",
            address
        )));
    }
    Ok(())
}

fn is_eip55_checksum_valid(addr: &str) -> bool {
    let body = &addr[2..];
    let lower = body.to_lowercase();
    let mut keccak = Keccak256::new();
    keccak.update(lower.as_bytes());
    let hash = keccak.finalize();
    for (i, ch) in body.chars().enumerate() {
        let nibble = (hash[i / 2] >> (4 * (1 - (i % 2)))) & 0x0f;
        match ch {
            'a'..='f' if nibble >= 8 => return false,
            'A'..='F' if nibble < 8 => return false,
            _ => {}
        }
    }
    true
}

/// Validates a 32-byte transaction hash.
pub fn validate_tx_hash(tx_hash: &str) -> Result<(), BridgeError> {
    if TX_HASH_RE.is_match(tx_hash) {
        Ok(())
    } else {
        Err(BridgeError::InvalidSubmission(format!("invalid transaction hash: {}", tx_hash)))
    }
}

/// Raw on-chain amounts are unsigned base-unit integers carried as strings.
pub fn validate_raw_amount(value: &str) -> Result<(), BridgeError> {
    if value.is_empty() || value.len() > 78 || !value.chars().all(|c| c.is_ascii_digit()) {
        return Err(BridgeError::InvalidSubmission(format!("invalid raw amount: {:?}", value)));
    }
    Ok(())
}

pub fn validate_asset_name(name: &str) -> Result<(), BridgeError> {
    if name.is_empty()
        || name.len() > 32
        || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_')
    {
        return Err(BridgeError::InvalidSubmission(format!("invalid asset name: {:?}", name)));
    }
    Ok(())
}
