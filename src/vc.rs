//! # Verifiable Credential Bridge
//!
//! Bidirectional translation between native certificates and their W3C
//! Verifiable Credential presentation.
//!
//! The native certificate is authoritative; the credential is a view. The
//! bridge guarantees structural round-trip: for every certificate `c`,
//! `vc_to_cert(cert_to_vc(c))` reproduces `c` except for
//!
//! - `issuer_public_key`, which is never carried on the wire and is resolved
//!   from the keychain's known keys on import, and
//! - `status`, which readers re-derive.
//!
//! Fields without a W3C home (`valid_from`, `issued_by`, `chain_depth`,
//! `serial_number`, `version`) travel in the credential's `_metadata` block.
//! That block is part of the portable document; what export strips are the
//! *other* underscore-prefixed fields a platform may have attached.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::canonical::{
    iso8601_to_ms, ms_to_iso8601, proof_from_signature, signature_from_proof, Proof,
};
use crate::certificate::{Certificate, CertificateKind, CertificateStatus};
use crate::did::{did_to_hash, hash_to_did};
use crate::error::TrustError;
use crate::ports::Keychain;

/// W3C credentials context, always first in `@context`.
pub const CONTEXT_CREDENTIALS_V1: &str = "https://www.w3.org/2018/credentials/v1";

/// Ed25519-2020 signature suite context, always second.
pub const CONTEXT_ED25519_2020: &str = "https://w3id.org/security/suites/ed25519-2020/v1";

/// URN prefix wrapping native certificate ids.
pub const VC_ID_PREFIX: &str = "urn:one:cert:";

/// Base credential type present in every `type` array.
pub const TYPE_VERIFIABLE_CREDENTIAL: &str = "VerifiableCredential";

/// Status-block type used to carry non-valid lifecycle states.
pub const STATUS_TYPE: &str = "CertificateStatusRecord";

// ============================================================================
// Model
// ============================================================================

/// Credential issuer: either a bare DID or an object with a display name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IssuerRef {
    Did(String),
    Object {
        id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
}

impl IssuerRef {
    /// The issuer DID regardless of representation.
    pub fn did(&self) -> &str {
        match self {
            Self::Did(did) => did,
            Self::Object { id, .. } => id,
        }
    }
}

/// Implementation metadata carried inside the credential.
///
/// Versioned-object bookkeeping the W3C envelope has no field for. Receivers
/// reconcile imports by `version`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct VcMetadata {
    pub version: u64,
    #[serde(rename = "validFrom", default, skip_serializing_if = "Option::is_none")]
    pub valid_from: Option<u64>,
    #[serde(rename = "issuedBy", default, skip_serializing_if = "Option::is_none")]
    pub issued_by: Option<String>,
    #[serde(rename = "chainDepth", default, skip_serializing_if = "Option::is_none")]
    pub chain_depth: Option<u32>,
    #[serde(rename = "serialNumber", default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
}

/// A W3C Verifiable Credential in its JSON-LD shape.
///
/// The envelope is rigid; `credentialSubject` is extensible per the
/// specification and carries the certificate's claim bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerifiableCredential {
    #[serde(rename = "@context")]
    pub context: Vec<String>,
    pub id: String,
    #[serde(rename = "type")]
    pub types: Vec<String>,
    pub issuer: IssuerRef,
    #[serde(rename = "issuanceDate")]
    pub issuance_date: String,
    #[serde(rename = "expirationDate", default, skip_serializing_if = "Option::is_none")]
    pub expiration_date: Option<String>,
    #[serde(rename = "credentialSubject")]
    pub credential_subject: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proof: Option<Proof>,
    #[serde(rename = "credentialStatus", default, skip_serializing_if = "Option::is_none")]
    pub credential_status: Option<Value>,
    #[serde(rename = "_metadata", default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<VcMetadata>,
}

impl VerifiableCredential {
    /// The kind-specific type tag, i.e. the first entry that is not the base
    /// `VerifiableCredential` type.
    pub fn kind_tag(&self) -> Option<&str> {
        self.types.iter().map(String::as_str).find(|t| *t != TYPE_VERIFIABLE_CREDENTIAL)
    }

    /// Native certificate id, with the URN prefix stripped.
    pub fn certificate_id(&self) -> &str {
        self.id.strip_prefix(VC_ID_PREFIX).unwrap_or(&self.id)
    }
}

// ============================================================================
// Certificate → Credential
// ============================================================================

/// Render a certificate as its credential view.
pub fn cert_to_vc(cert: &Certificate) -> Result<VerifiableCredential, TrustError> {
    let issuer_did = hash_to_did(&cert.issuer);

    let mut credential_subject = Map::new();
    credential_subject.insert("id".to_string(), Value::String(subject_reference(&cert.subject)));
    credential_subject
        .insert("publicKey".to_string(), Value::String(cert.subject_public_key.clone()));
    if let Value::Object(claims) = &cert.claims {
        for (key, value) in claims {
            if key != "id" && key != "publicKey" {
                credential_subject.insert(key.clone(), value.clone());
            }
        }
    }

    let issuer_name =
        cert.claims.get("name").and_then(Value::as_str).map(|s| s.to_string());

    let proof = if cert.signature.is_empty() {
        None
    } else {
        Some(proof_from_signature(&cert.signature, &issuer_did, cert.issued_at)?)
    };

    let credential_status = if cert.status != CertificateStatus::Valid
        || cert.revocation_reason.is_some()
    {
        let mut status = Map::new();
        status.insert("type".to_string(), Value::String(STATUS_TYPE.to_string()));
        status.insert("status".to_string(), Value::String(cert.status.to_string()));
        if let Some(reason) = &cert.revocation_reason {
            status.insert("reason".to_string(), Value::String(reason.clone()));
        }
        Some(Value::Object(status))
    } else {
        None
    };

    Ok(VerifiableCredential {
        context: vec![CONTEXT_CREDENTIALS_V1.to_string(), CONTEXT_ED25519_2020.to_string()],
        id: format!("{VC_ID_PREFIX}{}", cert.id),
        types: vec![
            TYPE_VERIFIABLE_CREDENTIAL.to_string(),
            cert.kind.vc_type_tag().to_string(),
        ],
        issuer: IssuerRef::Object { id: issuer_did, name: issuer_name },
        issuance_date: ms_to_iso8601(cert.issued_at)?,
        expiration_date: Some(ms_to_iso8601(cert.valid_until)?),
        credential_subject,
        proof,
        credential_status,
        metadata: Some(VcMetadata {
            version: cert.version,
            valid_from: Some(cert.valid_from),
            issued_by: cert.issued_by.clone(),
            chain_depth: Some(cert.chain_depth),
            serial_number: Some(cert.serial_number.clone()),
        }),
    })
}

/// Subjects that are identity hashes travel as DIDs; opaque subject strings
/// pass through unchanged.
fn subject_reference(subject: &str) -> String {
    if subject.len() == 64 && subject.chars().all(|c| c.is_ascii_hexdigit()) {
        hash_to_did(subject)
    } else {
        subject.to_string()
    }
}

// ============================================================================
// Credential → Certificate
// ============================================================================

/// Reconstruct the native certificate from a credential.
///
/// The issuer public key is resolved from the keychain's known keys; when
/// unknown it is left empty and the certificate stays unverifiable until the
/// key is learned.
pub async fn vc_to_cert(
    vc: &VerifiableCredential,
    keychain: &dyn Keychain,
) -> Result<Certificate, TrustError> {
    let kind = vc
        .kind_tag()
        .and_then(CertificateKind::from_vc_type_tag)
        .unwrap_or(CertificateKind::Identity);

    let issuer = did_to_hash(vc.issuer.did())?;
    let issuer_public_key = keychain.known_public_key(&issuer).await.unwrap_or_default();

    let subject_value = vc
        .credential_subject
        .get("id")
        .and_then(Value::as_str)
        .ok_or_else(|| TrustError::InvalidDocument {
            detail: "credentialSubject.id missing".to_string(),
        })?;
    let subject = if subject_value.starts_with("did:") {
        did_to_hash(subject_value)?
    } else {
        subject_value.to_string()
    };

    let subject_public_key = vc
        .credential_subject
        .get("publicKey")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let issued_at = iso8601_to_ms(&vc.issuance_date)?;
    let valid_until = match &vc.expiration_date {
        Some(date) => iso8601_to_ms(date)?,
        None => {
            return Err(TrustError::InvalidDocument {
                detail: "expirationDate missing".to_string(),
            })
        }
    };

    let signature = match &vc.proof {
        Some(proof) => signature_from_proof(proof)?,
        None => String::new(),
    };

    let (status, revocation_reason) = parse_credential_status(vc.credential_status.as_ref());

    let metadata = vc.metadata.clone().unwrap_or_default();
    let version = if metadata.version == 0 { 1 } else { metadata.version };

    let mut claims = Map::new();
    for (key, value) in &vc.credential_subject {
        if key != "id" && key != "publicKey" {
            claims.insert(key.clone(), value.clone());
        }
    }

    Ok(Certificate {
        id: vc.certificate_id().to_string(),
        kind,
        status,
        subject,
        subject_public_key,
        issuer,
        issuer_public_key,
        valid_from: metadata.valid_from.unwrap_or(issued_at),
        valid_until,
        issued_by: metadata.issued_by,
        chain_depth: metadata.chain_depth.unwrap_or(1),
        claims: Value::Object(claims),
        issued_at,
        serial_number: metadata.serial_number.unwrap_or_default(),
        version,
        signature,
        revocation_reason,
    })
}

fn parse_credential_status(status: Option<&Value>) -> (CertificateStatus, Option<String>) {
    let Some(status) = status else {
        return (CertificateStatus::Valid, None);
    };
    let parsed = status
        .get("status")
        .and_then(Value::as_str)
        .and_then(|s| serde_json::from_value(Value::String(s.to_string())).ok())
        .unwrap_or(CertificateStatus::Valid);
    let reason = status.get("reason").and_then(Value::as_str).map(|s| s.to_string());
    (parsed, reason)
}

// ============================================================================
// JSON-LD Wire Form
// ============================================================================

/// Serialize a credential for out-of-band transport.
///
/// Underscore-prefixed platform fields other than `_metadata` are stripped;
/// `_metadata` itself is portable (receivers reconcile by its `version`).
pub fn export_json_ld(vc: &VerifiableCredential) -> Result<String, TrustError> {
    let mut value = serde_json::to_value(vc)
        .map_err(|e| TrustError::InvalidDocument { detail: e.to_string() })?;
    strip_private_fields(&mut value);
    serde_json::to_string_pretty(&value)
        .map_err(|e| TrustError::InvalidDocument { detail: e.to_string() })
}

/// Parse a JSON-LD document into a credential, dropping platform-private
/// fields first.
pub fn import_json_ld(document: &str) -> Result<VerifiableCredential, TrustError> {
    let mut value: Value = serde_json::from_str(document)
        .map_err(|e| TrustError::InvalidDocument { detail: e.to_string() })?;
    strip_private_fields(&mut value);

    if value.get("@context").is_none() {
        return Err(TrustError::InvalidDocument { detail: "@context missing".to_string() });
    }

    serde_json::from_value(value)
        .map_err(|e| TrustError::InvalidDocument { detail: e.to_string() })
}

fn strip_private_fields(value: &mut Value) {
    if let Value::Object(map) = value {
        map.retain(|key, _| !key.starts_with('_') || key == "_metadata");
    }
}
