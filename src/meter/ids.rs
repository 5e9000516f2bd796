//! Random identifiers and secrets.

use crate::error::{MeterError, Result};

pub const API_KEY_PREFIX: &str = "sk_";
const API_KEY_BYTES: usize = 24;

fn random_hex(len: usize) -> Result<String> {
    let mut bytes = vec![0u8; len];
    getrandom::fill(&mut bytes).map_err(|err| MeterError::Internal {
        message: format!("system randomness unavailable: {err}"),
    })?;
    Ok(hex_encode(&bytes))
}

/// `sk_` followed by 48 lowercase hex characters.
pub fn api_key_secret() -> Result<String> {
    Ok(format!("{API_KEY_PREFIX}{}", random_hex(API_KEY_BYTES)?))
}

pub fn api_key_id() -> Result<String> {
    Ok(format!("key_{}", random_hex(12)?))
}

pub fn transaction_id() -> Result<String> {
    Ok(format!("tx_{}", random_hex(16)?))
}

pub fn account_id() -> Result<String> {
    Ok(format!("acct_{}", random_hex(12)?))
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}
