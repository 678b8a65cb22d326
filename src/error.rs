//! # Structured Error Types
//!
//! Every fallible core operation surfaces a [`TrustError`]. Each kind maps to
//! a stable machine-readable code (see [`TrustError::code`]) so callers and
//! audit consumers can branch on failures without parsing display text.
//!
//! Propagation policy:
//! - Signing and store failures are surfaced to the caller.
//! - Transient propagation failures are retried inside the sync loop and
//!   never bubble out of it.
//! - Verification failures carry the reason that made the certificate
//!   unacceptable (`BadSignature`, `Expired`, `Revoked`, ...).
//! - Import rejects (`StaleOrDuplicate`, `BadSignature`) are non-fatal to the
//!   importing instance and are always audited.

/// Errors produced by certificate, trust and propagation operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrustError {
    /// The CA engine is not in the `CaReady` state.
    NotReady,
    /// A certificate, relationship or object version could not be found.
    NotFound { what: String },
    /// A validity duration could not be parsed.
    InvalidDuration { input: String },
    /// A DID string is structurally malformed.
    InvalidDid { value: String },
    /// A DID uses a method other than `did:one:sha256`.
    UnsupportedDidMethod { method: String },
    /// A proof block uses a suite other than `Ed25519Signature2020`.
    UnsupportedProofType { proof_type: String },
    /// A timestamp or ISO-8601 date could not be interpreted.
    InvalidDate { value: String },
    /// A JSON-LD document is not parseable as a credential.
    InvalidDocument { detail: String },
    /// Signature verification failed, or no key was available to verify.
    BadSignature,
    /// The certificate's validity window has not opened yet.
    NotYetValid,
    /// The certificate's validity window has closed.
    Expired,
    /// The certificate was revoked.
    Revoked { reason: Option<String> },
    /// A chain link is missing, cyclic or structurally inconsistent.
    ChainBroken { depth: usize },
    /// The certificate named in `chain_to` cannot anchor a new certificate.
    ParentInvalid { reason: String },
    /// The requested reduction would end the certificate in the past.
    UseRevoke,
    /// The requested reduction does not shrink the validity window.
    NotAReduction,
    /// An imported version is not newer than the stored one.
    StaleOrDuplicate { existing_version: u64 },
    /// No public key is known for the certificate subject.
    SubjectKeyMissing { subject: String },
    /// The object store rejected or failed an operation.
    StoreFailure { detail: String },
    /// The keychain failed to produce a signature.
    SigningFailure { detail: String },
    /// The peer transport reports no connection.
    TransportOffline,
    /// An external delivery did not complete in time.
    TimedOut,
    /// The operation was cancelled cooperatively.
    Cancelled,
}

impl TrustError {
    /// Stable machine-readable code for this error kind.
    ///
    /// Codes never change once released; display text may.
    pub fn code(&self) -> &'static str {
        match self {
            Self::NotReady => "not_ready",
            Self::NotFound { .. } => "not_found",
            Self::InvalidDuration { .. } => "invalid_duration",
            Self::InvalidDid { .. } => "invalid_did",
            Self::UnsupportedDidMethod { .. } => "unsupported_did_method",
            Self::UnsupportedProofType { .. } => "unsupported_proof_type",
            Self::InvalidDate { .. } => "invalid_date",
            Self::InvalidDocument { .. } => "invalid_document",
            Self::BadSignature => "bad_signature",
            Self::NotYetValid => "not_yet_valid",
            Self::Expired => "expired",
            Self::Revoked { .. } => "revoked",
            Self::ChainBroken { .. } => "chain_broken",
            Self::ParentInvalid { .. } => "parent_invalid",
            Self::UseRevoke => "use_revoke",
            Self::NotAReduction => "not_a_reduction",
            Self::StaleOrDuplicate { .. } => "stale_or_duplicate",
            Self::SubjectKeyMissing { .. } => "subject_key_missing",
            Self::StoreFailure { .. } => "store_failure",
            Self::SigningFailure { .. } => "signing_failure",
            Self::TransportOffline => "transport_offline",
            Self::TimedOut => "timed_out",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TrustError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotReady => write!(f, "CA engine is not ready"),
            Self::NotFound { what } => write!(f, "not found: {what}"),
            Self::InvalidDuration { input } => write!(f, "invalid duration: {input:?}"),
            Self::InvalidDid { value } => write!(f, "invalid DID: {value:?}"),
            Self::UnsupportedDidMethod { method } => {
                write!(f, "unsupported DID method: {method:?}")
            }
            Self::UnsupportedProofType { proof_type } => {
                write!(f, "unsupported proof type: {proof_type:?}")
            }
            Self::InvalidDate { value } => write!(f, "invalid date: {value:?}"),
            Self::InvalidDocument { detail } => write!(f, "invalid credential document: {detail}"),
            Self::BadSignature => write!(f, "signature verification failed"),
            Self::NotYetValid => write!(f, "certificate is not yet valid"),
            Self::Expired => write!(f, "certificate has expired"),
            Self::Revoked { reason: Some(r) } => write!(f, "certificate revoked: {r}"),
            Self::Revoked { reason: None } => write!(f, "certificate revoked"),
            Self::ChainBroken { depth } => write!(f, "certificate chain broken at depth {depth}"),
            Self::ParentInvalid { reason } => write!(f, "parent certificate invalid: {reason}"),
            Self::UseRevoke => write!(f, "new expiry is in the past, use revoke instead"),
            Self::NotAReduction => write!(f, "new expiry does not reduce the validity window"),
            Self::StaleOrDuplicate { existing_version } => {
                write!(f, "stale or duplicate import, stored version is {existing_version}")
            }
            Self::SubjectKeyMissing { subject } => {
                write!(f, "no public key known for subject {subject}")
            }
            Self::StoreFailure { detail } => write!(f, "object store failure: {detail}"),
            Self::SigningFailure { detail } => write!(f, "signing failure: {detail}"),
            Self::TransportOffline => write!(f, "peer transport is offline"),
            Self::TimedOut => write!(f, "operation timed out"),
            Self::Cancelled => write!(f, "operation cancelled"),
        }
    }
}

impl std::error::Error for TrustError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable_and_distinct() {
        let kinds = [
            TrustError::NotReady,
            TrustError::NotFound { what: "x".into() },
            TrustError::InvalidDuration { input: "x".into() },
            TrustError::InvalidDid { value: "x".into() },
            TrustError::UnsupportedDidMethod { method: "x".into() },
            TrustError::UnsupportedProofType { proof_type: "x".into() },
            TrustError::InvalidDate { value: "x".into() },
            TrustError::InvalidDocument { detail: "x".into() },
            TrustError::BadSignature,
            TrustError::NotYetValid,
            TrustError::Expired,
            TrustError::Revoked { reason: None },
            TrustError::ChainBroken { depth: 1 },
            TrustError::ParentInvalid { reason: "x".into() },
            TrustError::UseRevoke,
            TrustError::NotAReduction,
            TrustError::StaleOrDuplicate { existing_version: 2 },
            TrustError::SubjectKeyMissing { subject: "x".into() },
            TrustError::StoreFailure { detail: "x".into() },
            TrustError::SigningFailure { detail: "x".into() },
            TrustError::TransportOffline,
            TrustError::TimedOut,
            TrustError::Cancelled,
        ];

        let mut seen = std::collections::HashSet::new();
        for kind in &kinds {
            assert!(seen.insert(kind.code()), "duplicate code {}", kind.code());
        }
    }

    #[test]
    fn display_mentions_the_payload() {
        let err = TrustError::StaleOrDuplicate { existing_version: 7 };
        assert!(err.to_string().contains('7'));

        let err = TrustError::SubjectKeyMissing { subject: "abc".into() };
        assert!(err.to_string().contains("abc"));
    }
}
