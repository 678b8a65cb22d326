//! # Canonicalizer & Proof Codec
//!
//! Deterministic serialization and the signature plumbing built on top of it:
//!
//! - **Canonical JSON**: keys ordered lexicographically at every depth, no
//!   insignificant whitespace, UTF-8. The same byte string feeds both the
//!   SHA-256 content hash and the Ed25519 signature input.
//! - **Hashing**: SHA-256 throughout. The DID method (`did:one:sha256`)
//!   names the algorithm on the wire, so it is not swappable.
//! - **Proof codec**: translation between raw Ed25519 signatures and W3C
//!   `Ed25519Signature2020` proof blocks (base58btc `proofValue`).
//! - **Time**: millisecond epoch timestamps and their ISO-8601 rendering.
//!
//! ## Signing Model
//!
//! Signatures cover the canonical serialization with the `signature` field
//! elided. No domain prefix is applied: the exact same 64 bytes must verify
//! both natively and as the `proofValue` of the exported credential.

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::TrustError;

/// Proof suite identifier accepted and produced by the codec.
pub const PROOF_TYPE_ED25519_2020: &str = "Ed25519Signature2020";

/// Proof purpose stamped on every produced proof block.
pub const PROOF_PURPOSE_ASSERTION: &str = "assertionMethod";

/// Key reference fragment appended to the issuer DID in verification methods.
pub const KEY_FRAGMENT: &str = "keys-1";

/// Domain prefix mixed into identity hashes.
/// Distinguishes "hash of the stable id" from "hash of a serialized version".
const IDENTITY_HASH_DOMAIN: &[u8] = b"id:";

// ============================================================================
// Canonical JSON
// ============================================================================

/// Render a JSON value in canonical form.
///
/// Object keys are sorted lexicographically (by UTF-8 byte order) at every
/// depth; arrays keep their order; no whitespace is emitted.
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_canonical(value, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Null => out.push_str("null"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Number(n) => out.push_str(&n.to_string()),
        Value::String(s) => {
            out.push_str(&serde_json::to_string(s).expect("JSON string encoding is infallible"))
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            out.push('{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                out.push_str(
                    &serde_json::to_string(key).expect("JSON string encoding is infallible"),
                );
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
    }
}

/// Canonical byte encoding of any serializable value.
pub fn canonical_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let json = serde_json::to_value(value)?;
    Ok(canonical_json(&json).into_bytes())
}

/// Canonical bytes with the `signature` field elided.
///
/// This is the exact input for both signing and signature verification (I1).
pub fn signing_bytes<T: Serialize>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut json = serde_json::to_value(value)?;
    if let Value::Object(map) = &mut json {
        map.remove("signature");
    }
    Ok(canonical_json(&json).into_bytes())
}

/// Decode a value back from its canonical byte encoding.
pub fn from_canonical_bytes<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, serde_json::Error> {
    serde_json::from_slice(bytes)
}

// ============================================================================
// Hashing
// ============================================================================

/// SHA-256 over arbitrary bytes, as lowercase hex.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Content hash of a serializable value: SHA-256 over its canonical bytes.
pub fn content_hash<T: Serialize>(value: &T) -> Result<String, serde_json::Error> {
    Ok(sha256_hex(&canonical_bytes(value)?))
}

/// Stable identity hash of a versioned entity, derived from its `id` field.
///
/// Invariant across versions: every version of the same entity maps to the
/// same identity hash, while each version has a distinct content hash.
pub fn identity_hash(id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(IDENTITY_HASH_DOMAIN);
    hasher.update(id.as_bytes());
    hex::encode(hasher.finalize())
}

// ============================================================================
// Ed25519 Verification
// ============================================================================

/// Verify an Ed25519 signature against a hex-encoded public key.
///
/// Uses strict verification to reject malleable encodings.
pub fn verify_ed25519(
    public_key_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<(), TrustError> {
    let key_bytes = hex::decode(public_key_hex).map_err(|_| TrustError::BadSignature)?;
    let key_array: [u8; 32] = key_bytes
        .as_slice()
        .try_into()
        .map_err(|_| TrustError::BadSignature)?;
    let verifying_key =
        VerifyingKey::from_bytes(&key_array).map_err(|_| TrustError::BadSignature)?;

    let sig_bytes = hex::decode(signature_hex).map_err(|_| TrustError::BadSignature)?;
    let sig_array: [u8; 64] = sig_bytes
        .as_slice()
        .try_into()
        .map_err(|_| TrustError::BadSignature)?;
    let signature = Signature::from_bytes(&sig_array);

    verifying_key
        .verify_strict(message, &signature)
        .map_err(|_| TrustError::BadSignature)
}

// ============================================================================
// Proof Codec (Ed25519Signature2020)
// ============================================================================

/// A W3C data-integrity proof block in the Ed25519-2020 suite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    /// Proof suite; always `Ed25519Signature2020` for produced proofs.
    #[serde(rename = "type")]
    pub proof_type: String,
    /// ISO-8601 creation time (the certificate's `issued_at`).
    pub created: String,
    #[serde(rename = "proofPurpose")]
    pub proof_purpose: String,
    /// `<issuer-DID>#keys-1`.
    #[serde(rename = "verificationMethod")]
    pub verification_method: String,
    /// Multibase base58btc (`z` prefix) encoding of the raw signature.
    #[serde(rename = "proofValue")]
    pub proof_value: String,
}

/// Translate a native hex signature into an `Ed25519Signature2020` proof.
pub fn proof_from_signature(
    signature_hex: &str,
    issuer_did: &str,
    issued_at_ms: u64,
) -> Result<Proof, TrustError> {
    let raw = hex::decode(signature_hex).map_err(|_| TrustError::BadSignature)?;
    Ok(Proof {
        proof_type: PROOF_TYPE_ED25519_2020.to_string(),
        created: ms_to_iso8601(issued_at_ms)?,
        proof_purpose: PROOF_PURPOSE_ASSERTION.to_string(),
        verification_method: format!("{issuer_did}#{KEY_FRAGMENT}"),
        proof_value: format!("z{}", bs58::encode(raw).into_string()),
    })
}

/// Extract the native hex signature from a W3C proof block.
///
/// Fails with `UnsupportedProofType` for any suite other than
/// `Ed25519Signature2020`.
pub fn signature_from_proof(proof: &Proof) -> Result<String, TrustError> {
    if proof.proof_type != PROOF_TYPE_ED25519_2020 {
        return Err(TrustError::UnsupportedProofType {
            proof_type: proof.proof_type.clone(),
        });
    }
    let encoded = proof
        .proof_value
        .strip_prefix('z')
        .ok_or(TrustError::BadSignature)?;
    let raw = bs58::decode(encoded)
        .into_vec()
        .map_err(|_| TrustError::BadSignature)?;
    if raw.len() != 64 {
        return Err(TrustError::BadSignature);
    }
    Ok(hex::encode(raw))
}

// ============================================================================
// Time
// ============================================================================

/// Render milliseconds since epoch as ISO-8601 with millisecond precision.
pub fn ms_to_iso8601(ms: u64) -> Result<String, TrustError> {
    let dt = chrono::DateTime::<chrono::Utc>::from_timestamp_millis(ms as i64)
        .ok_or(TrustError::InvalidDate { value: ms.to_string() })?;
    Ok(dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string())
}

/// Parse an ISO-8601 date back to milliseconds since epoch.
///
/// Sub-millisecond precision is truncated; this is the normalization that
/// makes the VC round-trip exact at millisecond granularity (I8).
pub fn iso8601_to_ms(value: &str) -> Result<u64, TrustError> {
    let dt = chrono::DateTime::parse_from_rfc3339(value).map_err(|_| TrustError::InvalidDate {
        value: value.to_string(),
    })?;
    let ms = dt.timestamp_millis();
    if ms < 0 {
        return Err(TrustError::InvalidDate { value: value.to_string() });
    }
    Ok(ms as u64)
}
