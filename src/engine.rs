//! # CA Engine
//!
//! Every instance is its own certificate authority. The engine owns the CA
//! lifecycle and the certificate state machine:
//!
//! - **Lifecycle**: `Uninitialised → Initialised → CaReady`, with a
//!   self-signed root certificate as the trust anchor. Operations that need
//!   a root reject with `NotReady` in any other state.
//! - **Issuance**: mint version 1 of a certificate, chained to an explicit
//!   parent or to the local root.
//! - **Version transitions**: extend, reduce and revoke each derive a new
//!   version from the latest one, re-sign it and persist it. Versions are
//!   never mutated in place.
//! - **Verification**: single-certificate checks and full chain walks back
//!   to a self-signed root.
//!
//! ## Concurrency
//!
//! Lifecycle operations over the same certificate id serialize on a per-id
//! lock so each transition observes a consistent latest version and version
//! numbers stay strictly monotonic. Operations on distinct ids run in
//! parallel. The lock is never held across transport I/O; propagation picks
//! versions up after the store write, via the event channel.
//!
//! ## Events and Audit
//!
//! Every committed transition emits a [`CaEvent`] on a broadcast channel
//! (revocations are flagged urgent for propagation) and exactly one audit
//! event, for failures too.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;
use tokio::sync::{broadcast, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::canonical::{self, from_canonical_bytes, sha256_hex};
use crate::certificate::{
    compose_serial, parse_duration, Certificate, CertificateKind, CertificateStatus,
    DeviceTrustClaims,
};
use crate::error::TrustError;
use crate::ports::{Clock, Keychain, ObjectStore, VersionedRecord};

/// Upper bound on chain walks; anything deeper is reported broken (P2).
const MAX_CHAIN_DEPTH: usize = 32;

/// Reverse-map index names the engine maintains on certificate records.
pub mod indexes {
    /// Issuing instance identity.
    pub const AUTHOR: &str = "author";
    /// Certificate subject.
    pub const SUBJECT: &str = "subject";
    /// Certificate kind.
    pub const KIND: &str = "kind";
    /// Root certificates by authoring instance.
    pub const ROOT: &str = "root";
}

// ============================================================================
// Configuration and Lifecycle
// ============================================================================

/// Per-instance CA settings. The core is otherwise configuration-free.
#[derive(Debug, Clone)]
pub struct CaConfig {
    /// Display name, surfaced in root claims and credential issuer blocks.
    pub name: String,
    /// Trust domain label, surfaced in root claims.
    pub domain: String,
    /// Validity of a freshly minted root, as a parseable duration.
    pub root_validity: String,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            name: "trustmesh".to_string(),
            domain: "local".to_string(),
            root_validity: "10 years".to_string(),
        }
    }
}

/// Engine lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaState {
    Uninitialised,
    Initialised,
    CaReady,
}

// ============================================================================
// Events and Reports
// ============================================================================

/// Addressing data for one committed certificate version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateRef {
    pub certificate_id: String,
    pub identity_hash: String,
    pub content_hash: String,
    pub version: u64,
}

/// Engine state changes, broadcast to subscribers (propagation, UIs).
#[derive(Debug, Clone)]
pub enum CaEvent {
    RootCreated(CertificateRef),
    CertificateIssued(CertificateRef),
    CertificateExtended(CertificateRef),
    CertificateReduced(CertificateRef),
    CertificateRevoked(CertificateRef),
}

impl CaEvent {
    /// The committed version this event refers to.
    pub fn certificate(&self) -> &CertificateRef {
        match self {
            Self::RootCreated(c)
            | Self::CertificateIssued(c)
            | Self::CertificateExtended(c)
            | Self::CertificateReduced(c)
            | Self::CertificateRevoked(c) => c,
        }
    }

    /// Revocations must propagate with urgent priority.
    pub fn is_urgent(&self) -> bool {
        matches!(self, Self::CertificateRevoked(_))
    }
}

/// Why a certificate failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VerificationFailure {
    Revoked,
    Suspended,
    NotYetValid,
    Expired,
    BadSignature,
}

impl VerificationFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Revoked => "revoked",
            Self::Suspended => "suspended",
            Self::NotYetValid => "not_yet_valid",
            Self::Expired => "expired",
            Self::BadSignature => "bad_signature",
        }
    }
}

/// Outcome of a single-certificate verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VerificationReport {
    pub valid: bool,
    pub reason: Option<VerificationFailure>,
}

impl VerificationReport {
    fn ok() -> Self {
        Self { valid: true, reason: None }
    }

    fn fail(reason: VerificationFailure) -> Self {
        Self { valid: false, reason: Some(reason) }
    }
}

/// Why a chain walk failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFailure {
    /// One link failed single-certificate verification.
    Link(VerificationFailure),
    /// A parent is missing, the walk cycled, or it exceeded the depth bound.
    Broken,
    /// `chain_depth` does not decrement by exactly one.
    DepthMismatch,
    /// The child was issued outside the parent's validity window.
    OutsideParentValidity,
    /// The terminal certificate is not a self-signed root.
    UnanchoredRoot,
    /// The terminal root differs from the expected one.
    RootMismatch,
}

impl ChainFailure {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Link(f) => f.as_str(),
            Self::Broken => "chain_broken",
            Self::DepthMismatch => "depth_mismatch",
            Self::OutsideParentValidity => "outside_parent_validity",
            Self::UnanchoredRoot => "unanchored_root",
            Self::RootMismatch => "root_mismatch",
        }
    }
}

/// Outcome of a chain verification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub valid: bool,
    /// Certificate ids from leaf to the terminal link reached.
    pub chain: Vec<String>,
    /// Index into `chain` where verification failed.
    pub failed_at: Option<usize>,
    pub reason: Option<ChainFailure>,
}

/// Transition kind inferred between two consecutive stored versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Extend,
    Reduce,
    Revoke,
    Renew,
}

/// One version in a certificate's history.
#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub certificate: Certificate,
    /// `None` for the initial version.
    pub transition: Option<Transition>,
}

/// Issuance input.
#[derive(Debug, Clone)]
pub struct IssueRequest {
    pub kind: CertificateKind,
    /// Subject identity hash, or an opaque subject string.
    pub subject: String,
    /// Subject key, hex. Fetched from the keychain's known keys when absent.
    pub subject_public_key: Option<String>,
    /// Validity duration, ISO-8601 or human form.
    pub validity: String,
    /// Window start; defaults to now.
    pub valid_from: Option<u64>,
    pub claims: serde_json::Value,
    /// Certificate id of an explicit parent. Defaults to the local root.
    pub chain_to: Option<String>,
}

// ============================================================================
// Engine
// ============================================================================

/// The per-instance certificate authority.
pub struct CaEngine {
    keychain: Arc<dyn Keychain>,
    store: Arc<dyn ObjectStore>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    config: CaConfig,
    state: RwLock<CaState>,
    root: RwLock<Option<Certificate>>,
    serial_counter: AtomicU64,
    /// Per-identity-hash lifecycle locks.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: broadcast::Sender<CaEvent>,
}

impl CaEngine {
    pub fn new(
        keychain: Arc<dyn Keychain>,
        store: Arc<dyn ObjectStore>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        config: CaConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            keychain,
            store,
            audit,
            clock,
            config,
            state: RwLock::new(CaState::Uninitialised),
            root: RwLock::new(None),
            serial_counter: AtomicU64::new(0),
            locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to committed state changes.
    pub fn subscribe(&self) -> broadcast::Receiver<CaEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> CaState {
        *self.state.read().await
    }

    /// Identity hash of this instance.
    pub fn local_identity(&self) -> String {
        self.keychain.local_identity()
    }

    pub fn config(&self) -> &CaConfig {
        &self.config
    }

    /// The active root, once the engine is ready.
    pub async fn root(&self) -> Option<Certificate> {
        self.root.read().await.clone()
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Move from `Uninitialised` to `Initialised`. Idempotent.
    pub async fn init(&self) -> Result<(), TrustError> {
        let mut state = self.state.write().await;
        if *state == CaState::Uninitialised {
            *state = CaState::Initialised;
            debug!(identity = %self.keychain.local_identity(), "CA initialised");
        }
        Ok(())
    }

    /// Load the existing root or mint a fresh self-signed one, then move to
    /// `CaReady`.
    ///
    /// Emits `RootCreated` only when a new root was minted.
    pub async fn create_root(&self) -> Result<Certificate, TrustError> {
        if *self.state.read().await == CaState::Uninitialised {
            return Err(TrustError::NotReady);
        }

        let identity = self.keychain.local_identity();
        let existing = self.store.reverse_lookup(indexes::ROOT, &identity).await?;
        if let Some(record) = existing.first() {
            let root = decode_certificate(record)?;
            info!(id = %root.id, version = root.version, "loaded existing root");
            *self.root.write().await = Some(root.clone());
            *self.state.write().await = CaState::CaReady;
            return Ok(root);
        }

        let root = self.mint_root().await;
        match root {
            Ok(root) => {
                let cert_ref = certificate_ref(&root)?;
                self.audit
                    .record(
                        AuditEvent::new(AuditEventType::CertificateIssued, identity)
                            .subject(root.subject.clone())
                            .certificate(
                                cert_ref.certificate_id.clone(),
                                cert_ref.content_hash.clone(),
                                cert_ref.version,
                            )
                            .metadata(json!({"root": true})),
                    )
                    .await;
                info!(id = %root.id, "created root certificate");
                *self.root.write().await = Some(root.clone());
                *self.state.write().await = CaState::CaReady;
                let _ = self.events.send(CaEvent::RootCreated(cert_ref));
                Ok(root)
            }
            Err(e) => {
                self.audit
                    .record(
                        AuditEvent::new(AuditEventType::CertificateIssued, identity)
                            .metadata(json!({"root": true}))
                            .failed(e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Drop back to `Uninitialised`, clearing instance caches. Stored
    /// certificates are untouched.
    pub async fn shutdown(&self) {
        *self.state.write().await = CaState::Uninitialised;
        *self.root.write().await = None;
        debug!("CA shut down");
    }

    async fn mint_root(&self) -> Result<Certificate, TrustError> {
        let identity = self.keychain.local_identity();
        let public_key = self.keychain.public_key().await?;
        let now = self.clock.now_ms();
        let validity = parse_duration(&self.config.root_validity)?;
        let serial = self.next_serial(now).await;

        let mut root = Certificate {
            id: format!("cert:identity:{identity}:{serial}"),
            kind: CertificateKind::Identity,
            status: CertificateStatus::Valid,
            subject: identity.clone(),
            subject_public_key: public_key.clone(),
            issuer: identity,
            issuer_public_key: public_key,
            valid_from: now,
            valid_until: now + validity,
            issued_by: None,
            chain_depth: 0,
            claims: json!({ "name": self.config.name, "domain": self.config.domain }),
            issued_at: now,
            serial_number: serial,
            version: 1,
            signature: String::new(),
            revocation_reason: None,
        };
        self.sign_and_persist(&mut root).await?;
        Ok(root)
    }

    // ------------------------------------------------------------------
    // Issuance
    // ------------------------------------------------------------------

    /// Issue version 1 of a new certificate.
    pub async fn issue(&self, request: IssueRequest) -> Result<Certificate, TrustError> {
        let subject = request.subject.clone();
        match self.issue_inner(request).await {
            Ok(cert) => {
                let cert_ref = certificate_ref(&cert)?;
                self.audit
                    .record(
                        AuditEvent::new(AuditEventType::CertificateIssued, self.local_identity())
                            .subject(cert.subject.clone())
                            .certificate(
                                cert_ref.certificate_id.clone(),
                                cert_ref.content_hash.clone(),
                                cert_ref.version,
                            ),
                    )
                    .await;
                info!(id = %cert.id, kind = %cert.kind, "issued certificate");
                let _ = self.events.send(CaEvent::CertificateIssued(cert_ref));
                Ok(cert)
            }
            Err(e) => {
                self.audit
                    .record(
                        AuditEvent::new(AuditEventType::CertificateIssued, self.local_identity())
                            .subject(subject)
                            .failed(e.to_string()),
                    )
                    .await;
                Err(e)
            }
        }
    }

    /// Issue a `kind = device` certificate with the canonical device-trust
    /// claim set.
    pub async fn issue_device_trust(
        &self,
        subject: impl Into<String>,
        subject_public_key: Option<String>,
        validity: impl Into<String>,
        claims: &DeviceTrustClaims,
    ) -> Result<Certificate, TrustError> {
        self.issue(IssueRequest {
            kind: CertificateKind::Device,
            subject: subject.into(),
            subject_public_key,
            validity: validity.into(),
            valid_from: None,
            claims: claims.to_claims(),
            chain_to: None,
        })
        .await
    }

    async fn issue_inner(&self, request: IssueRequest) -> Result<Certificate, TrustError> {
        self.ensure_ready().await?;

        let subject_public_key = match request.subject_public_key {
            Some(key) => key,
            None => self
                .keychain
                .known_public_key(&request.subject)
                .await
                .ok_or_else(|| TrustError::SubjectKeyMissing { subject: request.subject.clone() })?,
        };

        let duration = parse_duration(&request.validity)?;
        let now = self.clock.now_ms();
        let valid_from = request.valid_from.unwrap_or(now);
        let valid_until = valid_from + duration;

        let (issued_by, chain_depth) = match &request.chain_to {
            Some(parent_id) => {
                let parent = self.validate_parent(parent_id, now).await?;
                (Some(parent.identity_hash()), parent.chain_depth + 1)
            }
            None => {
                let root = self.root.read().await.clone().ok_or(TrustError::NotReady)?;
                (Some(root.identity_hash()), 1)
            }
        };

        let serial = self.next_serial(now).await;
        let mut cert = Certificate {
            id: format!("cert:{}:{}:{}", request.kind, request.subject, serial),
            kind: request.kind,
            status: CertificateStatus::Valid,
            subject: request.subject,
            subject_public_key,
            issuer: self.keychain.local_identity(),
            issuer_public_key: self.keychain.public_key().await?,
            valid_from,
            valid_until,
            issued_by,
            chain_depth,
            claims: request.claims,
            issued_at: now,
            serial_number: serial,
            version: 1,
            signature: String::new(),
            revocation_reason: None,
        };
        self.sign_and_persist(&mut cert).await?;
        Ok(cert)
    }

    async fn validate_parent(
        &self,
        parent_id: &str,
        now: u64,
    ) -> Result<Certificate, TrustError> {
        let parent = match self.latest_version(parent_id).await {
            Ok(parent) => parent,
            Err(TrustError::NotFound { .. }) => {
                return Err(TrustError::ParentInvalid {
                    reason: format!("parent certificate {parent_id} not found"),
                })
            }
            Err(e) => return Err(e),
        };

        let status = parent.derived_status(now);
        if status != CertificateStatus::Valid {
            return Err(TrustError::ParentInvalid { reason: format!("parent status is {status}") });
        }
        if parent.issuer != self.keychain.local_identity() {
            return Err(TrustError::ParentInvalid {
                reason: "parent was issued by a different instance".to_string(),
            });
        }
        Ok(parent)
    }

    // ------------------------------------------------------------------
    // Version Transitions
    // ------------------------------------------------------------------

    /// Extend the validity window by a positive duration.
    pub async fn extend(&self, id: &str, additional: &str) -> Result<Certificate, TrustError> {
        let result = self.extend_inner(id, additional).await;
        self.audit_transition(AuditEventType::CertificateExtended, id, &result, None).await;
        if let Ok(cert) = &result {
            info!(id = %cert.id, version = cert.version, valid_until = cert.valid_until, "extended certificate");
            let _ = self.events.send(CaEvent::CertificateExtended(certificate_ref(cert)?));
        }
        result
    }

    /// Shrink the validity window to `new_valid_until`, which must lie
    /// strictly between now and the current expiry.
    pub async fn reduce(&self, id: &str, new_valid_until: u64) -> Result<Certificate, TrustError> {
        let result = self.reduce_inner(id, new_valid_until).await;
        self.audit_transition(AuditEventType::CertificateReduced, id, &result, None).await;
        if let Ok(cert) = &result {
            info!(id = %cert.id, version = cert.version, valid_until = cert.valid_until, "reduced certificate");
            let _ = self.events.send(CaEvent::CertificateReduced(certificate_ref(cert)?));
        }
        result
    }

    /// Revoke the certificate, closing its validity window in the past.
    pub async fn revoke(&self, id: &str, reason: &str) -> Result<Certificate, TrustError> {
        let result = self.revoke_inner(id, reason).await;
        self.audit_transition(AuditEventType::CertificateRevoked, id, &result, Some(reason)).await;
        if let Ok(cert) = &result {
            warn!(id = %cert.id, reason, "revoked certificate");
            let _ = self.events.send(CaEvent::CertificateRevoked(certificate_ref(cert)?));
        }
        result
    }

    async fn extend_inner(&self, id: &str, additional: &str) -> Result<Certificate, TrustError> {
        self.ensure_ready().await?;
        let additional_ms = parse_duration(additional)?;

        let identity_hash = canonical::identity_hash(id);
        let _guard = self.id_lock(&identity_hash).await;

        let prev = self.latest_by_hash(&identity_hash, id).await?;
        self.require_transitionable(&prev)?;

        let mut next = prev.clone();
        next.version = prev.version + 1;
        next.valid_until = prev.valid_until + additional_ms;
        next.signature = String::new();
        self.sign_and_persist(&mut next).await?;
        Ok(next)
    }

    async fn reduce_inner(&self, id: &str, new_valid_until: u64) -> Result<Certificate, TrustError> {
        self.ensure_ready().await?;
        let now = self.clock.now_ms();
        if new_valid_until <= now {
            return Err(TrustError::UseRevoke);
        }

        let identity_hash = canonical::identity_hash(id);
        let _guard = self.id_lock(&identity_hash).await;

        let prev = self.latest_by_hash(&identity_hash, id).await?;
        self.require_transitionable(&prev)?;
        if new_valid_until >= prev.valid_until {
            return Err(TrustError::NotAReduction);
        }

        let mut next = prev.clone();
        next.version = prev.version + 1;
        next.valid_until = new_valid_until;
        next.signature = String::new();
        self.sign_and_persist(&mut next).await?;
        Ok(next)
    }

    async fn revoke_inner(&self, id: &str, reason: &str) -> Result<Certificate, TrustError> {
        self.ensure_ready().await?;

        let identity_hash = canonical::identity_hash(id);
        let _guard = self.id_lock(&identity_hash).await;

        let prev = self.latest_by_hash(&identity_hash, id).await?;
        if prev.derived_status(self.clock.now_ms()) == CertificateStatus::Revoked {
            return Err(TrustError::Revoked { reason: prev.revocation_reason });
        }

        let mut next = prev.clone();
        next.version = prev.version + 1;
        next.valid_until = self.clock.now_ms().saturating_sub(1);
        next.status = CertificateStatus::Revoked;
        next.revocation_reason = Some(reason.to_string());
        next.signature = String::new();
        self.sign_and_persist(&mut next).await?;
        Ok(next)
    }

    /// Extensions and reductions only apply to certificates that are still
    /// alive; ended ones surface their terminal state instead.
    fn require_transitionable(&self, cert: &Certificate) -> Result<(), TrustError> {
        match cert.derived_status(self.clock.now_ms()) {
            CertificateStatus::Revoked => {
                Err(TrustError::Revoked { reason: cert.revocation_reason.clone() })
            }
            CertificateStatus::Expired => Err(TrustError::Expired),
            CertificateStatus::Valid | CertificateStatus::Suspended => Ok(()),
        }
    }

    async fn audit_transition(
        &self,
        event_type: AuditEventType,
        id: &str,
        result: &Result<Certificate, TrustError>,
        reason: Option<&str>,
    ) {
        let mut event = AuditEvent::new(event_type, self.local_identity()).certificate_id(id);
        if let Some(reason) = reason {
            event = event.reason(reason);
        }
        match result {
            Ok(cert) => {
                if let Ok(hash) = cert.content_hash() {
                    event = event.certificate(cert.id.clone(), hash, cert.version);
                }
                event = event.subject(cert.subject.clone());
            }
            Err(e) => event = event.failed(e.to_string()),
        }
        self.audit.record(event).await;
    }

    // ------------------------------------------------------------------
    // Verification
    // ------------------------------------------------------------------

    /// Verify one certificate: status, validity window, signature.
    ///
    /// Records a `certificate_verified` audit event with the outcome.
    pub async fn verify_certificate(&self, cert: &Certificate) -> VerificationReport {
        let report = self.check_certificate(cert, self.clock.now_ms()).await;
        let mut event = AuditEvent::new(AuditEventType::CertificateVerified, self.local_identity())
            .certificate_id(cert.id.clone())
            .subject(cert.subject.clone());
        if let Some(reason) = report.reason {
            event = event.failed(reason.as_str());
        }
        self.audit.record(event).await;
        report
    }

    /// Single-certificate check without audit side effects; used by chain
    /// walks.
    async fn check_certificate(&self, cert: &Certificate, now: u64) -> VerificationReport {
        match cert.derived_status(now) {
            CertificateStatus::Revoked => return VerificationReport::fail(VerificationFailure::Revoked),
            CertificateStatus::Suspended => {
                return VerificationReport::fail(VerificationFailure::Suspended)
            }
            CertificateStatus::Expired | CertificateStatus::Valid => {}
        }
        if now < cert.valid_from {
            return VerificationReport::fail(VerificationFailure::NotYetValid);
        }
        if now > cert.valid_until {
            return VerificationReport::fail(VerificationFailure::Expired);
        }

        let issuer_key = if cert.is_verifiable() {
            cert.issuer_public_key.clone()
        } else {
            match self.keychain.known_public_key(&cert.issuer).await {
                Some(key) => key,
                None => return VerificationReport::fail(VerificationFailure::BadSignature),
            }
        };

        let Ok(message) = cert.signing_bytes() else {
            return VerificationReport::fail(VerificationFailure::BadSignature);
        };
        if cert.signature.is_empty()
            || canonical::verify_ed25519(&issuer_key, &message, &cert.signature).is_err()
        {
            return VerificationReport::fail(VerificationFailure::BadSignature);
        }
        VerificationReport::ok()
    }

    /// Walk the chain from `cert` back to a self-signed root, verifying each
    /// link, validity containment and depth decrements.
    ///
    /// When `expected_root` is given the terminal certificate must be that
    /// root. The walk is bounded and cycle-checked, so it always terminates.
    pub async fn verify_chain(
        &self,
        cert: &Certificate,
        expected_root: Option<&Certificate>,
    ) -> ChainReport {
        let now = self.clock.now_ms();
        let mut chain = vec![cert.id.clone()];
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(cert.identity_hash());

        let fail = |chain: Vec<String>, at: usize, reason: ChainFailure| ChainReport {
            valid: false,
            chain,
            failed_at: Some(at),
            reason: Some(reason),
        };

        let leaf = self.check_certificate(cert, now).await;
        if let Some(reason) = leaf.reason {
            return fail(chain, 0, ChainFailure::Link(reason));
        }

        let mut current = cert.clone();
        let mut index = 0usize;
        while let Some(parent_hash) = current.issued_by.clone() {
            index += 1;
            if index > MAX_CHAIN_DEPTH || !visited.insert(parent_hash.clone()) {
                return fail(chain, index - 1, ChainFailure::Broken);
            }

            let Ok(Some(record)) = self.store.latest(&parent_hash).await else {
                return fail(chain, index, ChainFailure::Broken);
            };
            let Ok(parent) = decode_certificate(&record) else {
                return fail(chain, index, ChainFailure::Broken);
            };
            chain.push(parent.id.clone());

            let link = self.check_certificate(&parent, now).await;
            if let Some(reason) = link.reason {
                return fail(chain, index, ChainFailure::Link(reason));
            }
            if !parent.validity_contains(current.issued_at) {
                return fail(chain, index, ChainFailure::OutsideParentValidity);
            }
            if parent.chain_depth + 1 != current.chain_depth {
                return fail(chain, index, ChainFailure::DepthMismatch);
            }
            current = parent;
        }

        let terminal = chain.len() - 1;
        if !current.is_self_signed() || current.chain_depth != 0 {
            return fail(chain, terminal, ChainFailure::UnanchoredRoot);
        }
        if let Some(root) = expected_root {
            if root.identity_hash() != current.identity_hash() {
                return fail(chain, terminal, ChainFailure::RootMismatch);
            }
        }

        ChainReport { valid: true, chain, failed_at: None, reason: None }
    }

    // ------------------------------------------------------------------
    // History
    // ------------------------------------------------------------------

    /// Highest stored version of the certificate with this id.
    pub async fn latest_version(&self, id: &str) -> Result<Certificate, TrustError> {
        let identity_hash = canonical::identity_hash(id);
        self.latest_by_hash(&identity_hash, id).await
    }

    /// Every stored version in increasing order, with the transition that
    /// produced each one inferred from its predecessor.
    pub async fn history(&self, id: &str) -> Result<Vec<HistoryEntry>, TrustError> {
        let identity_hash = canonical::identity_hash(id);
        let records = self.store.versions(&identity_hash).await?;
        if records.is_empty() {
            return Err(TrustError::NotFound { what: format!("certificate {id}") });
        }

        let now = self.clock.now_ms();
        let mut entries: Vec<HistoryEntry> = Vec::with_capacity(records.len());
        for record in &records {
            let certificate = decode_certificate(record)?;
            let transition = entries
                .last()
                .map(|prev| infer_transition(&prev.certificate, &certificate, now));
            entries.push(HistoryEntry { certificate, transition });
        }
        Ok(entries)
    }

    // ------------------------------------------------------------------
    // Import Reconciliation
    // ------------------------------------------------------------------

    /// Store an externally received certificate version, reconciling by
    /// version against the local copy.
    ///
    /// The original signature is preserved; nothing is re-signed. Returns
    /// the stored version, or `StaleOrDuplicate` carrying the version the
    /// store already holds.
    pub async fn reconcile_import(&self, cert: &Certificate) -> Result<u64, TrustError> {
        let identity_hash = cert.identity_hash();
        let _guard = self.id_lock(&identity_hash).await;

        if let Some(existing) = self.store.latest(&identity_hash).await? {
            if existing.version >= cert.version {
                return Err(TrustError::StaleOrDuplicate { existing_version: existing.version });
            }
        }
        self.persist(cert).await?;
        debug!(id = %cert.id, version = cert.version, "stored imported certificate version");
        Ok(cert.version)
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    async fn ensure_ready(&self) -> Result<(), TrustError> {
        if *self.state.read().await != CaState::CaReady {
            return Err(TrustError::NotReady);
        }
        Ok(())
    }

    /// Acquire the lifecycle lock for one identity hash.
    async fn id_lock(&self, identity_hash: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks
                .entry(identity_hash.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    async fn next_serial(&self, now_ms: u64) -> String {
        let counter = self.serial_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let nonce = self.keychain.random_nonce().await;
        compose_serial(counter, now_ms, &nonce[..4])
    }

    async fn latest_by_hash(
        &self,
        identity_hash: &str,
        id: &str,
    ) -> Result<Certificate, TrustError> {
        let record = self
            .store
            .latest(identity_hash)
            .await?
            .ok_or_else(|| TrustError::NotFound { what: format!("certificate {id}") })?;
        decode_certificate(&record)
    }

    async fn sign_and_persist(&self, cert: &mut Certificate) -> Result<(), TrustError> {
        let message = cert
            .signing_bytes()
            .map_err(|e| TrustError::SigningFailure { detail: e.to_string() })?;
        let signature = self.keychain.sign(&message).await?;
        cert.signature = hex::encode(signature);
        self.persist(cert).await
    }

    async fn persist(&self, cert: &Certificate) -> Result<(), TrustError> {
        let bytes = cert
            .canonical_bytes()
            .map_err(|e| TrustError::StoreFailure { detail: e.to_string() })?;
        let content_hash = sha256_hex(&bytes);

        let mut record_indexes = vec![
            (indexes::AUTHOR.to_string(), cert.issuer.clone()),
            (indexes::SUBJECT.to_string(), cert.subject.clone()),
            (indexes::KIND.to_string(), cert.kind.to_string()),
        ];
        if cert.is_root() {
            record_indexes.push((indexes::ROOT.to_string(), cert.issuer.clone()));
        }

        self.store
            .put(VersionedRecord {
                identity_hash: cert.identity_hash(),
                content_hash,
                version: cert.version,
                bytes,
                indexes: record_indexes,
            })
            .await
    }
}

/// Infer the transition between two consecutive versions.
fn infer_transition(prev: &Certificate, curr: &Certificate, now: u64) -> Transition {
    if curr.status == CertificateStatus::Revoked || curr.valid_until < now {
        Transition::Revoke
    } else if curr.valid_until > prev.valid_until {
        Transition::Extend
    } else if curr.valid_until < prev.valid_until {
        Transition::Reduce
    } else {
        Transition::Renew
    }
}

fn decode_certificate(record: &VersionedRecord) -> Result<Certificate, TrustError> {
    from_canonical_bytes(&record.bytes)
        .map_err(|e| TrustError::StoreFailure { detail: format!("undecodable certificate: {e}") })
}

fn certificate_ref(cert: &Certificate) -> Result<CertificateRef, TrustError> {
    let content_hash = cert
        .content_hash()
        .map_err(|e| TrustError::StoreFailure { detail: e.to_string() })?;
    Ok(CertificateRef {
        certificate_id: cert.id.clone(),
        identity_hash: cert.identity_hash(),
        content_hash,
        version: cert.version,
    })
}
