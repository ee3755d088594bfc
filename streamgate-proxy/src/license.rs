//! ClearKey helpers
//!
//! Parses `KID:KEY[,KID:KEY…]` hex pair lists and synthesizes the JWK set
//! ClearKey license responses carry.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum ClearKeyError {
    #[error("No valid KID:KEY pairs in '{0}'")]
    NoPairs(String),
    #[error("Invalid hex in ClearKey pair: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClearKeyPair {
    /// Hex key id.
    pub key_id: String,
    /// Hex key.
    pub key: String,
}

#[derive(Debug, Serialize)]
pub struct JwkKey {
    pub kty: &'static str,
    pub k: String,
    pub kid: String,
    #[serde(rename = "type")]
    pub key_type: &'static str,
}

#[derive(Debug, Serialize)]
pub struct JwkSet {
    pub keys: Vec<JwkKey>,
    #[serde(rename = "type")]
    pub set_type: &'static str,
}

/// Parse a `KID:KEY[,KID:KEY…]` parameter. Entries without a colon are
/// skipped.
#[must_use]
pub fn parse_clearkey(raw: &str) -> Vec<ClearKeyPair> {
    raw.split(',')
        .filter_map(|pair| {
            let (kid, key) = pair.split_once(':')?;
            let kid = kid.trim();
            let key = key.trim();
            if kid.is_empty() || key.is_empty() {
                return None;
            }
            Some(ClearKeyPair {
                key_id: kid.to_string(),
                key: key.to_string(),
            })
        })
        .collect()
}

/// Combine the `clearkey` parameter with separate comma-separated
/// `key_id`/`key` parameters into the canonical `KID:KEY,…` form. Count
/// mismatches pair as many entries as possible.
#[must_use]
pub fn merge_key_params(
    clearkey: Option<&str>,
    key_id: Option<&str>,
    key: Option<&str>,
) -> Option<String> {
    if let Some(clearkey) = clearkey {
        if !clearkey.is_empty() {
            return Some(clearkey.to_string());
        }
    }

    match (key_id, key) {
        (Some(key_ids), Some(keys)) => {
            let ids: Vec<&str> = key_ids.split(',').map(str::trim).collect();
            let values: Vec<&str> = keys.split(',').map(str::trim).collect();
            if ids.len() != values.len() {
                tracing::warn!(
                    "Mismatched key_id/key count: {} vs {}",
                    ids.len(),
                    values.len()
                );
            }
            let pairs: Vec<String> = ids
                .iter()
                .zip(values.iter())
                .filter(|(id, value)| !id.is_empty() && !value.is_empty())
                .map(|(id, value)| format!("{id}:{value}"))
                .collect();
            if pairs.is_empty() {
                None
            } else {
                Some(pairs.join(","))
            }
        }
        (None, Some(keys)) if !keys.is_empty() => Some(keys.to_string()),
        _ => None,
    }
}

/// Synthesize the ClearKey JWK set for a list of hex pairs: each key as
/// `{kty: oct, kid, k}` with base64url (unpadded) values.
pub fn clearkey_jwk(raw: &str) -> Result<JwkSet, ClearKeyError> {
    let pairs = parse_clearkey(raw);
    if pairs.is_empty() {
        return Err(ClearKeyError::NoPairs(raw.to_string()));
    }

    let mut keys = Vec::with_capacity(pairs.len());
    for pair in pairs {
        let kid = hex::decode(&pair.key_id)?;
        let key = hex::decode(&pair.key)?;
        keys.push(JwkKey {
            kty: "oct",
            k: URL_SAFE_NO_PAD.encode(key),
            kid: URL_SAFE_NO_PAD.encode(kid),
            key_type: "temporary",
        });
    }

    Ok(JwkSet {
        keys,
        set_type: "temporary",
    })
}
