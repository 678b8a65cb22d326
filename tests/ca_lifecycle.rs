//! Integration tests for the CA lifecycle: issuance, version transitions,
//! chain verification and audit coverage, driven by a pinned test clock.

use std::sync::Arc;

use trustmesh::audit::AuditQuery;
use trustmesh::memory::{MemoryKeychain, MemoryStore, TestClock};
use trustmesh::{
    canonical, AuditEventType, AuditLog, CaConfig, CaEngine, Certificate, CertificateKind,
    CertificateStatus, ChainFailure, Clock, IssueRequest, Keychain, Transition, TrustError,
    VerificationFailure,
};

/// Fixed test clock origin, milliseconds since epoch.
const T0: u64 = 1_700_000_000_000;

struct Instance {
    engine: Arc<CaEngine>,
    keychain: Arc<MemoryKeychain>,
    audit: Arc<AuditLog>,
    clock: Arc<TestClock>,
}

async fn ready_instance() -> Instance {
    let clock = Arc::new(TestClock::at(T0));
    let keychain = Arc::new(MemoryKeychain::generate());
    let store = Arc::new(MemoryStore::new());
    let audit = Arc::new(AuditLog::new(clock.clone()));
    let engine = Arc::new(CaEngine::new(
        keychain.clone(),
        store,
        audit.clone(),
        clock.clone(),
        CaConfig::default(),
    ));
    engine.init().await.expect("init failed");
    engine.create_root().await.expect("root creation failed");
    Instance { engine, keychain, audit, clock }
}

fn subject_hash() -> String {
    "ab".repeat(32)
}

fn subject_key() -> String {
    "11".repeat(32)
}

fn issue_request(validity: &str) -> IssueRequest {
    IssueRequest {
        kind: CertificateKind::Identity,
        subject: subject_hash(),
        subject_public_key: Some(subject_key()),
        validity: validity.to_string(),
        valid_from: None,
        claims: serde_json::json!({}),
        chain_to: None,
    }
}

// S1 — Issue → verify.
#[tokio::test]
async fn issue_then_verify() {
    let instance = ready_instance().await;

    let cert = instance.engine.issue(issue_request("12 months")).await.unwrap();
    assert_eq!(cert.valid_from, T0);
    assert_eq!(cert.valid_until, T0 + 31_536_000_000);
    assert_eq!(cert.version, 1);
    assert_eq!(cert.subject, subject_hash());
    assert_eq!(cert.subject_public_key, subject_key());

    // P1: the signature verifies against the issuer key over the canonical
    // form with the signature elided.
    let message = cert.signing_bytes().unwrap();
    canonical::verify_ed25519(&cert.issuer_public_key, &message, &cert.signature)
        .expect("P1: signature must verify over the canonical form");

    let report = instance.engine.verify_certificate(&cert).await;
    assert!(report.valid);
    assert_eq!(report.reason, None);
}

// S2 — Extend then verify.
#[tokio::test]
async fn extend_then_verify() {
    let instance = ready_instance().await;
    let cert = instance.engine.issue(issue_request("12 months")).await.unwrap();

    instance.clock.set(T0 + 1_000);
    let extended = instance.engine.extend(&cert.id, "6 months").await.unwrap();
    assert_eq!(extended.version, 2);
    assert_eq!(extended.valid_until, T0 + 31_536_000_000 + 15_552_000_000);
    assert!(extended.valid_until > instance.clock.now_ms());

    let history = instance.engine.history(&cert.id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].certificate.version, 1);
    assert_eq!(history[0].transition, None);
    assert_eq!(history[1].certificate.version, 2);
    assert_eq!(history[1].transition, Some(Transition::Extend));
}

// S3 — Revoke → deny.
#[tokio::test]
async fn revoke_then_deny() {
    let instance = ready_instance().await;
    let cert = instance.engine.issue(issue_request("12 months")).await.unwrap();

    instance.clock.set(T0 + 5_000);
    let revoked = instance.engine.revoke(&cert.id, "key compromised").await.unwrap();
    assert_eq!(revoked.version, 2);
    assert_eq!(revoked.valid_until, T0 + 4_999);
    assert_eq!(revoked.status, CertificateStatus::Revoked);
    assert_eq!(revoked.revocation_reason.as_deref(), Some("key compromised"));

    let report = instance.engine.verify_certificate(&revoked).await;
    assert!(!report.valid);
    assert_eq!(report.reason, Some(VerificationFailure::Revoked));

    // The revocation is audited as a success.
    let events = instance
        .audit
        .query(&AuditQuery {
            event_type: Some(AuditEventType::CertificateRevoked),
            ..Default::default()
        })
        .await;
    assert_eq!(events.len(), 1);
    assert!(events[0].success);
    assert_eq!(events[0].reason.as_deref(), Some("key compromised"));
}

// S4 — Chain verification through root → intermediate → leaf.
#[tokio::test]
async fn chain_verification_and_intermediate_revocation() {
    let instance = ready_instance().await;
    let root = instance.engine.root().await.unwrap();

    let intermediate = instance.engine.issue(issue_request("1 year")).await.unwrap();

    let mut leaf_request = issue_request("3 months");
    leaf_request.subject = "cd".repeat(32);
    leaf_request.chain_to = Some(intermediate.id.clone());
    let leaf = instance.engine.issue(leaf_request).await.unwrap();
    assert_eq!(leaf.chain_depth, 2);

    let report = instance.engine.verify_chain(&leaf, Some(&root)).await;
    assert!(report.valid, "chain should verify: {report:?}");
    assert_eq!(report.chain.len(), 3);
    assert_eq!(report.chain[0], leaf.id);
    assert_eq!(report.chain[2], root.id);

    instance.engine.revoke(&intermediate.id, "rotation").await.unwrap();
    let report = instance.engine.verify_chain(&leaf, Some(&root)).await;
    assert!(!report.valid);
    assert_eq!(report.failed_at, Some(1));
    assert_eq!(report.reason, Some(ChainFailure::Link(VerificationFailure::Revoked)));
}

#[tokio::test]
async fn chain_with_wrong_expected_root_fails() {
    let instance = ready_instance().await;
    let other = ready_instance().await;

    let cert = instance.engine.issue(issue_request("1 year")).await.unwrap();
    let foreign_root = other.engine.root().await.unwrap();

    let report = instance.engine.verify_chain(&cert, Some(&foreign_root)).await;
    assert!(!report.valid);
    assert_eq!(report.reason, Some(ChainFailure::RootMismatch));
}

// P2 — chain walks always terminate: a cycle is reported broken.
#[tokio::test]
async fn cyclic_chain_terminates_with_broken() {
    let instance = ready_instance().await;
    let identity = instance.keychain.local_identity();
    let public_key = instance.keychain.public_key().await.unwrap();

    let mut cert = Certificate {
        id: "cert:identity:cycle:1".to_string(),
        kind: CertificateKind::Identity,
        status: CertificateStatus::Valid,
        subject: subject_hash(),
        subject_public_key: subject_key(),
        issuer: identity,
        issuer_public_key: public_key,
        valid_from: T0,
        valid_until: T0 + 1_000_000,
        issued_by: None,
        chain_depth: 1,
        claims: serde_json::json!({}),
        issued_at: T0,
        serial_number: "999999-0-00000000".to_string(),
        version: 1,
        signature: String::new(),
        revocation_reason: None,
    };
    // Points at its own identity hash: the walk revisits and must stop.
    cert.issued_by = Some(cert.identity_hash());
    let message = cert.signing_bytes().unwrap();
    let signature = instance.keychain.sign(&message).await.unwrap();
    cert.signature = hex::encode(signature);
    instance.engine.reconcile_import(&cert).await.unwrap();

    let report = instance.engine.verify_chain(&cert, None).await;
    assert!(!report.valid);
    assert_eq!(report.reason, Some(ChainFailure::Broken));
}

#[tokio::test]
async fn missing_parent_breaks_the_chain() {
    let instance = ready_instance().await;
    let mut cert = instance.engine.issue(issue_request("1 year")).await.unwrap();
    cert.issued_by = Some("ee".repeat(32));
    // The tampered link also breaks the signature; re-sign to isolate the
    // chain failure.
    let message = cert.signing_bytes().unwrap();
    cert.signature = hex::encode(instance.keychain.sign(&message).await.unwrap());

    let report = instance.engine.verify_chain(&cert, None).await;
    assert!(!report.valid);
    assert_eq!(report.reason, Some(ChainFailure::Broken));
}

// P3 — strictly monotonic versions across every transition.
#[tokio::test]
async fn versions_are_strictly_monotonic() {
    let instance = ready_instance().await;
    let cert = instance.engine.issue(issue_request("12 months")).await.unwrap();

    instance.engine.extend(&cert.id, "1 day").await.unwrap();
    instance.engine.extend(&cert.id, "1 day").await.unwrap();
    instance.engine.reduce(&cert.id, T0 + 500_000).await.unwrap();
    instance.engine.revoke(&cert.id, "done").await.unwrap();

    let history = instance.engine.history(&cert.id).await.unwrap();
    let versions: Vec<u64> = history.iter().map(|e| e.certificate.version).collect();
    assert_eq!(versions, vec![1, 2, 3, 4, 5]);
}

// P4 — transition arithmetic.
#[tokio::test]
async fn transition_arithmetic_matches_the_contract() {
    let instance = ready_instance().await;
    let cert = instance.engine.issue(issue_request("12 months")).await.unwrap();

    let extended = instance.engine.extend(&cert.id, "90 days").await.unwrap();
    assert_eq!(extended.valid_until, cert.valid_until + 90 * 24 * 60 * 60 * 1_000);
    assert!(extended.valid_until > instance.clock.now_ms());

    let target = T0 + 1_000_000;
    let reduced = instance.engine.reduce(&cert.id, target).await.unwrap();
    assert_eq!(reduced.valid_until, target);

    instance.clock.set(T0 + 10_000);
    let revoked = instance.engine.revoke(&cert.id, "compromise").await.unwrap();
    assert!(revoked.valid_until < instance.clock.now_ms());
    assert_eq!(revoked.status, CertificateStatus::Revoked);

    let report = instance.engine.verify_certificate(&revoked).await;
    assert_eq!(report.reason, Some(VerificationFailure::Revoked));
}

#[tokio::test]
async fn lifecycle_rejections_are_structured() {
    let instance = ready_instance().await;
    let cert = instance.engine.issue(issue_request("12 months")).await.unwrap();

    assert_eq!(
        instance.engine.reduce(&cert.id, T0 - 1).await.unwrap_err(),
        TrustError::UseRevoke
    );
    assert_eq!(
        instance.engine.reduce(&cert.id, cert.valid_until + 1).await.unwrap_err(),
        TrustError::NotAReduction
    );
    assert!(matches!(
        instance.engine.extend(&cert.id, "gibberish").await.unwrap_err(),
        TrustError::InvalidDuration { .. }
    ));
    assert!(matches!(
        instance.engine.extend("cert:identity:ghost:1", "1 day").await.unwrap_err(),
        TrustError::NotFound { .. }
    ));
}

// P10 — every lifecycle operation, failed ones included, leaves exactly one
// audit event.
#[tokio::test]
async fn audit_covers_success_and_failure() {
    let instance = ready_instance().await;
    let baseline = instance.audit.len().await;

    let cert = instance.engine.issue(issue_request("12 months")).await.unwrap();
    instance.engine.extend(&cert.id, "1 day").await.unwrap();
    // Not a reduction: the target is beyond the current expiry.
    instance.engine.reduce(&cert.id, cert.valid_until * 2).await.unwrap_err();
    instance.engine.revoke(&cert.id, "bye").await.unwrap();
    instance.engine.revoke(&cert.id, "again").await.unwrap_err();

    // issue + extend + failed reduce + revoke + failed revoke = 5 events.
    assert_eq!(instance.audit.len().await - baseline, 5);

    let failed_revokes = instance
        .audit
        .query(&AuditQuery {
            event_type: Some(AuditEventType::CertificateRevoked),
            ..Default::default()
        })
        .await;
    assert_eq!(failed_revokes.len(), 2);
    assert!(failed_revokes.iter().any(|e| !e.success));
}

#[tokio::test]
async fn issuance_is_denied_before_ready() {
    let clock = Arc::new(TestClock::at(T0));
    let keychain = Arc::new(MemoryKeychain::generate());
    let store = Arc::new(MemoryStore::new());
    let audit = Arc::new(AuditLog::new(clock.clone()));
    let engine = CaEngine::new(keychain, store, audit, clock, CaConfig::default());

    assert_eq!(engine.issue(issue_request("1 year")).await.unwrap_err(), TrustError::NotReady);

    engine.init().await.unwrap();
    assert_eq!(engine.issue(issue_request("1 year")).await.unwrap_err(), TrustError::NotReady);
}
