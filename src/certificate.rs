//! # Certificate Model
//!
//! The typed certificate at the heart of the fabric, plus the small pieces
//! of arithmetic that surround it:
//!
//! - [`Certificate`]: signed, versioned attestation binding an issuer to a
//!   subject's public key with a validity window and free-form claims.
//! - [`CertificateKind`] / [`CertificateStatus`]: the discriminator and the
//!   derived lifecycle state.
//! - Duration parsing for both ISO-8601 (`P1Y`, `P90D`, `PT6H`) and human
//!   (`"12 months"`, `"1 year"`) validity inputs.
//! - [`DeviceTrustClaims`]: the structural projection carried by
//!   `kind = device` certificates.
//!
//! ## Versioning Model
//!
//! A certificate's `id` is stable for its whole lifetime; each lifecycle
//! transition (extend, reduce, revoke) produces a new value with
//! `version = prev.version + 1`. The identity hash (SHA-256 of the `id`)
//! groups versions; the content hash addresses one exact version.
//!
//! ## Status Derivation
//!
//! The persisted `status` field is advisory. Readers derive the effective
//! status from the validity window and revocation state; see
//! [`Certificate::derived_status`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::canonical;
use crate::error::TrustError;

// ============================================================================
// Duration Arithmetic
// ============================================================================

/// Milliseconds per second.
pub const MS_PER_SECOND: u64 = 1_000;
/// Milliseconds per minute.
pub const MS_PER_MINUTE: u64 = 60 * MS_PER_SECOND;
/// Milliseconds per hour.
pub const MS_PER_HOUR: u64 = 60 * MS_PER_MINUTE;
/// Milliseconds per day.
pub const MS_PER_DAY: u64 = 24 * MS_PER_HOUR;
/// Milliseconds per week.
pub const MS_PER_WEEK: u64 = 7 * MS_PER_DAY;
/// Calendar approximation: one month is 30 days.
pub const MS_PER_MONTH: u64 = 30 * MS_PER_DAY;
/// Calendar approximation: one year is 365 days.
pub const MS_PER_YEAR: u64 = 365 * MS_PER_DAY;

/// Parse a validity duration into milliseconds.
///
/// Accepts both conventions with one canonical normalization:
///
/// - ISO-8601: `P1Y`, `P6M`, `P90D`, `P2W`, `PT6H`, `PT30M`, `P1YT12H`
/// - Human: `"12 months"`, `"1 year"`, `"90 days"`, `"6 hours"`
///
/// Normalization uses 1 year = 365 days and 1 month = 30 days, with whole
/// dozens of months folded into years first (`"12 months"` equals
/// `"1 year"`, i.e. 365 days, not 360).
pub fn parse_duration(input: &str) -> Result<u64, TrustError> {
    let trimmed = input.trim();
    let err = || TrustError::InvalidDuration { input: input.to_string() };

    let (years, months, ms) = if trimmed.starts_with('P') || trimmed.starts_with('p') {
        parse_iso8601_duration(trimmed).ok_or_else(err)?
    } else {
        parse_human_duration(trimmed).ok_or_else(err)?
    };

    // Fold whole dozens of months into years before applying the 30-day
    // month approximation, so "12 months" and "1 year" agree.
    let years = years + months / 12;
    let months = months % 12;

    let total = years
        .checked_mul(MS_PER_YEAR)
        .and_then(|y| months.checked_mul(MS_PER_MONTH).and_then(|m| y.checked_add(m)))
        .and_then(|ym| ym.checked_add(ms))
        .ok_or_else(err)?;

    if total == 0 {
        return Err(err());
    }
    Ok(total)
}

/// Returns `(years, months, fixed_ms)` or `None` on malformed input.
fn parse_iso8601_duration(input: &str) -> Option<(u64, u64, u64)> {
    let mut chars = input.chars().peekable();
    match chars.next() {
        Some('P') | Some('p') => {}
        _ => return None,
    }

    let mut years = 0u64;
    let mut months = 0u64;
    let mut ms = 0u64;
    let mut in_time = false;
    let mut saw_component = false;

    while let Some(&c) = chars.peek() {
        if c == 'T' || c == 't' {
            if in_time {
                return None;
            }
            in_time = true;
            chars.next();
            continue;
        }

        let mut digits = String::new();
        while let Some(&d) = chars.peek() {
            if d.is_ascii_digit() {
                digits.push(d);
                chars.next();
            } else {
                break;
            }
        }
        if digits.is_empty() {
            return None;
        }
        let value: u64 = digits.parse().ok()?;
        let unit = chars.next()?;
        saw_component = true;

        match (in_time, unit.to_ascii_uppercase()) {
            (false, 'Y') => years = years.checked_add(value)?,
            (false, 'M') => months = months.checked_add(value)?,
            (false, 'W') => ms = ms.checked_add(value.checked_mul(MS_PER_WEEK)?)?,
            (false, 'D') => ms = ms.checked_add(value.checked_mul(MS_PER_DAY)?)?,
            (true, 'H') => ms = ms.checked_add(value.checked_mul(MS_PER_HOUR)?)?,
            (true, 'M') => ms = ms.checked_add(value.checked_mul(MS_PER_MINUTE)?)?,
            (true, 'S') => ms = ms.checked_add(value.checked_mul(MS_PER_SECOND)?)?,
            _ => return None,
        }
    }

    if !saw_component {
        return None;
    }
    Some((years, months, ms))
}

/// Returns `(years, months, fixed_ms)` or `None` on malformed input.
fn parse_human_duration(input: &str) -> Option<(u64, u64, u64)> {
    let tokens: Vec<&str> = input.split_whitespace().collect();
    if tokens.is_empty() || tokens.len() % 2 != 0 {
        return None;
    }

    let mut years = 0u64;
    let mut months = 0u64;
    let mut ms = 0u64;

    for pair in tokens.chunks(2) {
        let value: u64 = pair[0].parse().ok()?;
        match pair[1].to_ascii_lowercase().trim_end_matches('s') {
            "year" => years = years.checked_add(value)?,
            "month" => months = months.checked_add(value)?,
            "week" => ms = ms.checked_add(value.checked_mul(MS_PER_WEEK)?)?,
            "day" => ms = ms.checked_add(value.checked_mul(MS_PER_DAY)?)?,
            "hour" => ms = ms.checked_add(value.checked_mul(MS_PER_HOUR)?)?,
            "minute" => ms = ms.checked_add(value.checked_mul(MS_PER_MINUTE)?)?,
            "second" => ms = ms.checked_add(value.checked_mul(MS_PER_SECOND)?)?,
            _ => return None,
        }
    }
    Some((years, months, ms))
}

// ============================================================================
// Kinds and Statuses
// ============================================================================

/// Discriminator over certificate variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateKind {
    Identity,
    Device,
    Service,
    Attestation,
    Delegation,
    Revocation,
}

impl CertificateKind {
    /// The kind-specific tag used in a credential's `type` array.
    ///
    /// Device-trust certificates use the established `DeviceTrustCredential`
    /// tag; every other kind title-cases into `<Kind>Certificate`.
    pub fn vc_type_tag(&self) -> &'static str {
        match self {
            Self::Identity => "IdentityCertificate",
            Self::Device => "DeviceTrustCredential",
            Self::Service => "ServiceCertificate",
            Self::Attestation => "AttestationCertificate",
            Self::Delegation => "DelegationCertificate",
            Self::Revocation => "RevocationCertificate",
        }
    }

    /// Recover the kind from a credential `type` tag. `None` when unknown.
    pub fn from_vc_type_tag(tag: &str) -> Option<Self> {
        match tag {
            "IdentityCertificate" => Some(Self::Identity),
            "DeviceTrustCredential" | "DeviceCertificate" => Some(Self::Device),
            "ServiceCertificate" => Some(Self::Service),
            "AttestationCertificate" => Some(Self::Attestation),
            "DelegationCertificate" => Some(Self::Delegation),
            "RevocationCertificate" => Some(Self::Revocation),
            _ => None,
        }
    }
}

impl std::fmt::Display for CertificateKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Identity => "identity",
            Self::Device => "device",
            Self::Service => "service",
            Self::Attestation => "attestation",
            Self::Delegation => "delegation",
            Self::Revocation => "revocation",
        };
        write!(f, "{name}")
    }
}

/// Certificate lifecycle status.
///
/// The persisted value is advisory; the effective status is derived on read
/// via [`Certificate::derived_status`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertificateStatus {
    Valid,
    Expired,
    Revoked,
    Suspended,
}

impl std::fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Valid => "valid",
            Self::Expired => "expired",
            Self::Revoked => "revoked",
            Self::Suspended => "suspended",
        };
        write!(f, "{name}")
    }
}

// ============================================================================
// Certificate
// ============================================================================

/// A signed, versioned attestation.
///
/// All hash-valued fields (`subject`, `issuer`, `issued_by`) and key/signature
/// fields are lowercase hex strings. Timestamps are milliseconds since epoch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Certificate {
    /// Stable identifier, e.g. `cert:<kind>:<subject>:<serial>`. Opaque to
    /// the core beyond being the input of the identity hash.
    pub id: String,
    pub kind: CertificateKind,
    /// Advisory persisted status; derive the effective one on read.
    pub status: CertificateStatus,
    /// Identity hash of the subject, or an opaque string for non-person
    /// subjects.
    pub subject: String,
    /// Subject's Ed25519 public key, hex.
    pub subject_public_key: String,
    /// Identity hash of the issuing instance.
    pub issuer: String,
    /// Issuer's Ed25519 public key, hex. Empty on imported certificates whose
    /// issuer key has not been resolved yet.
    #[serde(default)]
    pub issuer_public_key: String,
    /// Validity window start, ms since epoch.
    pub valid_from: u64,
    /// Validity window end, ms since epoch.
    pub valid_until: u64,
    /// Identity hash of the parent certificate; `None` only for roots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub issued_by: Option<String>,
    /// 0 for roots, parent depth + 1 otherwise.
    pub chain_depth: u32,
    /// Free-form claim bag; serialized in stable key order.
    pub claims: Value,
    /// Issuance time of version 1, ms since epoch. Unchanged by lifecycle
    /// transitions.
    pub issued_at: u64,
    /// Unique per issuer.
    pub serial_number: String,
    /// Monotonic, starting at 1.
    pub version: u64,
    /// Ed25519 signature over the canonical form with this field elided, hex.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub signature: String,
    /// Reason recorded at revocation; feeds status derivation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,
}

impl Certificate {
    /// Stable identity hash grouping all versions of this certificate.
    pub fn identity_hash(&self) -> String {
        canonical::identity_hash(&self.id)
    }

    /// Content hash of this exact version (canonical form, signature
    /// included).
    pub fn content_hash(&self) -> Result<String, serde_json::Error> {
        canonical::content_hash(self)
    }

    /// The bytes covered by `signature`: canonical form with the signature
    /// field elided.
    pub fn signing_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        canonical::signing_bytes(self)
    }

    /// Full canonical serialization of this version.
    pub fn canonical_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        canonical::canonical_bytes(self)
    }

    /// Whether issuer and subject coincide (the root shape).
    pub fn is_self_signed(&self) -> bool {
        self.issuer == self.subject
    }

    /// Whether this is a trust-anchor root certificate.
    pub fn is_root(&self) -> bool {
        self.chain_depth == 0 && self.is_self_signed() && self.kind == CertificateKind::Identity
    }

    /// Whether the issuer key is present, i.e. the signature can be checked
    /// locally. Imported certificates stay unverifiable until the issuer's
    /// key is learned.
    pub fn is_verifiable(&self) -> bool {
        !self.issuer_public_key.is_empty()
    }

    /// Whether `at_ms` falls inside the validity window (inclusive).
    pub fn validity_contains(&self, at_ms: u64) -> bool {
        self.valid_from <= at_ms && at_ms <= self.valid_until
    }

    /// Derive the effective status at `now`.
    ///
    /// Precedence: explicit revocation, then past-expiry revocation (window
    /// closed with a recorded reason), then explicit suspension, then plain
    /// expiry, then valid.
    pub fn derived_status(&self, now: u64) -> CertificateStatus {
        if self.status == CertificateStatus::Revoked {
            return CertificateStatus::Revoked;
        }
        if self.valid_until < now && self.revocation_reason.is_some() {
            return CertificateStatus::Revoked;
        }
        if self.status == CertificateStatus::Suspended {
            return CertificateStatus::Suspended;
        }
        if self.valid_until < now {
            return CertificateStatus::Expired;
        }
        CertificateStatus::Valid
    }

    /// Project the device-trust claim set out of a `kind = device`
    /// certificate. `None` for other kinds or malformed claim bags.
    pub fn device_trust_claims(&self) -> Option<DeviceTrustClaims> {
        if self.kind != CertificateKind::Device {
            return None;
        }
        DeviceTrustClaims::from_claims(&self.claims)
    }
}

// ============================================================================
// Serial Numbers
// ============================================================================

/// Compose a serial number from an issuer-scoped counter, the issuance
/// timestamp and a short random tag.
///
/// Uniqueness within an issuer is structural: the counter alone never
/// repeats. The timestamp and tag make serials globally unlikely to collide
/// even across issuer re-installs.
pub fn compose_serial(counter: u64, issued_at_ms: u64, tag: &[u8]) -> String {
    format!("{counter:06}-{issued_at_ms}-{}", hex::encode(tag))
}

// ============================================================================
// Device Trust Projection
// ============================================================================

/// Trust grade carried by a device-trust certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceTrustLevel {
    Full,
    Limited,
    Temporary,
}

/// Canonical claim set of `kind = device` certificates.
///
/// A structural subset of the free-form claim bag, not a separate entity:
/// converting back and forth through [`DeviceTrustClaims::to_claims`] is
/// lossless for well-formed bags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceTrustClaims {
    pub trust_level: DeviceTrustLevel,
    pub trust_reason: String,
    pub verification_method: String,
    /// Fine-grained capability mapping, kept free-form.
    pub permissions: Value,
}

impl DeviceTrustClaims {
    /// Render as a claim bag for embedding in a certificate.
    pub fn to_claims(&self) -> Value {
        serde_json::to_value(self).expect("device trust claims serialize to an object")
    }

    /// Parse from a claim bag. `None` when required fields are missing or
    /// mistyped.
    pub fn from_claims(claims: &Value) -> Option<Self> {
        serde_json::from_value(claims.clone()).ok()
    }
}
