//! # DID Codec
//!
//! Mapping between internal identity hashes and the `did:one:sha256` method.
//!
//! A DID is `did:one:sha256:<64 lowercase hex chars>`; a verification method
//! appends a key fragment: `did:one:sha256:<hash>#keys-1`. Uppercase hex in
//! incoming DIDs is normalized to lowercase; any other deviation is rejected.

use crate::error::TrustError;

/// DID method prefix for this fabric.
pub const DID_PREFIX: &str = "did:one:sha256:";

/// Wrap an identity hash in its DID form.
pub fn hash_to_did(hash: &str) -> String {
    format!("{DID_PREFIX}{hash}")
}

/// Extract the identity hash from a `did:one:sha256` DID.
///
/// # Errors
///
/// - `UnsupportedDidMethod` for any other `did:` method.
/// - `InvalidDid` for strings that are not DIDs or carry a malformed hash.
pub fn did_to_hash(did: &str) -> Result<String, TrustError> {
    let Some(rest) = did.strip_prefix("did:") else {
        return Err(TrustError::InvalidDid { value: did.to_string() });
    };
    let Some(hash) = rest.strip_prefix("one:sha256:") else {
        // Report the method (plus the hash-algorithm label for the `one`
        // family), never the method-specific id.
        let mut parts = rest.splitn(3, ':');
        let method = parts.next().unwrap_or_default();
        let method = if method == "one" {
            match parts.next() {
                Some(algorithm) => format!("did:one:{algorithm}"),
                None => "did:one".to_string(),
            }
        } else {
            format!("did:{method}")
        };
        return Err(TrustError::UnsupportedDidMethod { method });
    };
    normalize_hash(hash).ok_or_else(|| TrustError::InvalidDid { value: did.to_string() })
}

/// Parse a verification method into `(identity_hash, key_fragment)`.
///
/// Example: `did:one:sha256:<hash>#keys-1` yields `(<hash>, "keys-1")`.
pub fn parse_verification_method(method: &str) -> Result<(String, String), TrustError> {
    let (did, fragment) = method.split_once('#').ok_or_else(|| TrustError::InvalidDid {
        value: method.to_string(),
    })?;
    if fragment.is_empty() {
        return Err(TrustError::InvalidDid { value: method.to_string() });
    }
    let hash = did_to_hash(did)?;
    Ok((hash, fragment.to_string()))
}

/// Validate a SHA-256 hex hash, lowercasing it. `None` when malformed.
fn normalize_hash(hash: &str) -> Option<String> {
    if hash.len() != 64 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
        return None;
    }
    Some(hash.to_ascii_lowercase())
}
