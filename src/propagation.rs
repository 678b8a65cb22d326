//! # Propagation Service
//!
//! Certificate versions leave an instance through two channels:
//!
//! - **Internal (automatic)**: every version committed by the CA engine is
//!   picked up from the engine's event stream and handed to the peer
//!   transport. Per certificate, the service tracks a sync status in
//!   {pending, syncing, synced, failed, offline}. Revocations take the
//!   urgent lane and drain first.
//! - **External (manual)**: [`PropagationService::export_external`] renders
//!   a version as a JSON-LD credential and hands it to out-of-band delivery
//!   channels (QR, mail, file, HTTPS).
//!
//! [`PropagationService::import_external`] is the receiving half: parse,
//! convert, verify, then reconcile by version against the local store. The
//! imported signature is preserved as-is; nothing is re-signed.
//!
//! ## Background Loop
//!
//! A single drain task owns the queues. Failed deliveries are re-enqueued
//! with exponential backoff; an unreachable transport parks items as
//! `offline` and rechecks. The loop never holds certificate locks across
//! transport I/O, and it shuts down cooperatively via a watch signal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::canonical;
use crate::certificate::{Certificate, CertificateStatus};
use crate::engine::CaEngine;
use crate::error::TrustError;
use crate::ports::{Clock, ExternalDelivery, Keychain, ObjectStore, PeerTransport};
use crate::vc::{cert_to_vc, export_json_ld, import_json_ld, vc_to_cert};

/// First retry delay; doubles per attempt.
const BACKOFF_BASE_MS: u64 = 100;

/// Retry delay ceiling.
const BACKOFF_MAX_MS: u64 = 30_000;

/// Delivery attempts before an item is parked as failed for good.
const MAX_ATTEMPTS: u32 = 6;

/// Recheck interval while the transport reports no connection.
const OFFLINE_RECHECK_MS: u64 = 200;

/// Timeout for HTTPS exports; the only timed delivery.
const HTTP_EXPORT_TIMEOUT: Duration = Duration::from_secs(10);

/// Internal sync state of one certificate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
    Offline,
}

/// Wire envelope handed to the peer transport for one object version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEnvelope {
    pub identity_hash: String,
    pub content_hash: String,
    pub version: u64,
    /// Canonical serialization of the version.
    pub bytes: Vec<u8>,
}

/// Out-of-band delivery channels for an export.
#[derive(Debug, Clone)]
pub enum ExportChannel {
    QrCode,
    Email(String),
    Download(String),
    WebEndpoint(String),
}

/// Options accepted by [`PropagationService::export_external`].
#[derive(Debug, Clone, Default)]
pub struct ExportOptions {
    pub channels: Vec<ExportChannel>,
    /// Free-form tag stored with the audit trail.
    pub method: Option<String>,
}

/// Result of an external export.
#[derive(Debug, Clone)]
pub struct ExportedVc {
    pub certificate_id: String,
    pub version: u64,
    pub json_ld: String,
    /// Present when a QR channel was requested.
    pub qr_payload: Option<Vec<u8>>,
    /// Delivery records for the audit trail.
    pub deliveries: Vec<String>,
}

/// Result of a successful external import.
#[derive(Debug, Clone)]
pub struct ImportResult {
    pub certificate: Certificate,
    pub identity_hash: String,
    pub version: u64,
}

struct SyncItem {
    identity_hash: String,
    content_hash: String,
    version: u64,
    bytes: Vec<u8>,
    urgent: bool,
    attempts: u32,
}

/// The dual-channel propagation service.
pub struct PropagationService {
    engine: Arc<CaEngine>,
    store: Arc<dyn ObjectStore>,
    keychain: Arc<dyn Keychain>,
    delivery: Arc<dyn ExternalDelivery>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    status: Arc<RwLock<HashMap<String, SyncStatus>>>,
    queue_tx: mpsc::UnboundedSender<SyncItem>,
    shutdown_tx: watch::Sender<bool>,
}

impl PropagationService {
    /// Start the service: spawns the drain loop and the engine-event
    /// forwarder. Both exit when [`PropagationService::shutdown`] is called.
    pub fn spawn(
        engine: Arc<CaEngine>,
        store: Arc<dyn ObjectStore>,
        keychain: Arc<dyn Keychain>,
        transport: Arc<dyn PeerTransport>,
        delivery: Arc<dyn ExternalDelivery>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
    ) -> Arc<Self> {
        let (queue_tx, queue_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let status: Arc<RwLock<HashMap<String, SyncStatus>>> =
            Arc::new(RwLock::new(HashMap::new()));

        let service = Arc::new(Self {
            engine: engine.clone(),
            store: store.clone(),
            keychain,
            delivery,
            audit,
            clock,
            status: status.clone(),
            queue_tx: queue_tx.clone(),
            shutdown_tx,
        });

        tokio::spawn(drain_loop(
            transport,
            status.clone(),
            queue_tx.clone(),
            queue_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(forward_engine_events(engine, store, queue_tx, status, shutdown_rx));

        service
    }

    /// Stop the background tasks. Queued items are dropped; the store
    /// remains the source of truth for future sessions.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Current internal sync status of a certificate, by identity hash.
    pub async fn sync_status(&self, identity_hash: &str) -> Option<SyncStatus> {
        self.status.read().await.get(identity_hash).copied()
    }

    /// Queue one version for internal propagation.
    pub async fn enqueue(
        &self,
        identity_hash: String,
        content_hash: String,
        version: u64,
        bytes: Vec<u8>,
        urgent: bool,
    ) {
        self.status.write().await.insert(identity_hash.clone(), SyncStatus::Pending);
        let _ = self.queue_tx.send(SyncItem {
            identity_hash,
            content_hash,
            version,
            bytes,
            urgent,
            attempts: 0,
        });
    }

    // ------------------------------------------------------------------
    // External Export
    // ------------------------------------------------------------------

    /// Render one stored certificate version as a portable JSON-LD
    /// credential and hand it to the requested delivery channels.
    pub async fn export_external(
        &self,
        certificate_id: &str,
        version: u64,
        options: ExportOptions,
    ) -> Result<ExportedVc, TrustError> {
        let result = self.export_inner(certificate_id, version, &options).await;

        let mut event = AuditEvent::new(AuditEventType::VcExported, self.engine.local_identity())
            .certificate_id(certificate_id);
        if let Some(method) = &options.method {
            event = event.metadata(json!({ "method": method }));
        }
        match &result {
            Ok(exported) => {
                event.certificate_version = Some(exported.version);
                event = event.metadata(json!({
                    "method": options.method,
                    "deliveries": exported.deliveries,
                }));
                self.audit.record(event).await;
                info!(certificate_id, version, "exported credential");
            }
            Err(e) => {
                self.audit.record(event.failed(e.to_string())).await;
            }
        }
        result
    }

    async fn export_inner(
        &self,
        certificate_id: &str,
        version: u64,
        options: &ExportOptions,
    ) -> Result<ExportedVc, TrustError> {
        let identity_hash = canonical::identity_hash(certificate_id);
        let records = self.store.versions(&identity_hash).await?;
        let record = records.iter().find(|r| r.version == version).ok_or_else(|| {
            TrustError::NotFound {
                what: format!("certificate {certificate_id} version {version}"),
            }
        })?;
        let cert: Certificate = canonical::from_canonical_bytes(&record.bytes)
            .map_err(|e| TrustError::StoreFailure { detail: e.to_string() })?;

        let vc = cert_to_vc(&cert)?;
        let json_ld = export_json_ld(&vc)?;

        let mut qr_payload = None;
        let mut deliveries = Vec::new();
        for channel in &options.channels {
            match channel {
                ExportChannel::QrCode => {
                    qr_payload = Some(self.delivery.render_qr(&json_ld).await?);
                    deliveries.push("qr_code".to_string());
                }
                ExportChannel::Email(address) => {
                    self.delivery.send_email(address, &json_ld).await?;
                    deliveries.push(format!("email:{address}"));
                }
                ExportChannel::Download(path) => {
                    self.delivery.write_file(path, &json_ld).await?;
                    deliveries.push(format!("download:{path}"));
                }
                ExportChannel::WebEndpoint(url) => {
                    self.delivery.put_https(url, &json_ld, HTTP_EXPORT_TIMEOUT).await?;
                    deliveries.push(format!("web:{url}"));
                }
            }
        }
        if let Some(method) = &options.method {
            deliveries.push(format!("method:{method}"));
        }

        Ok(ExportedVc {
            certificate_id: certificate_id.to_string(),
            version,
            json_ld,
            qr_payload,
            deliveries,
        })
    }

    // ------------------------------------------------------------------
    // External Import
    // ------------------------------------------------------------------

    /// Import a JSON-LD credential received out-of-band.
    ///
    /// Pipeline: parse, convert, verify (signature required when the issuer
    /// key is known, chain best-effort), then reconcile by version. Rejects
    /// are non-fatal and fully audited; `StaleOrDuplicate` carries the
    /// version the store already holds.
    pub async fn import_external(&self, document: &str) -> Result<ImportResult, TrustError> {
        let result = self.import_inner(document).await;

        match &result {
            Ok(imported) => {
                self.audit
                    .record(
                        AuditEvent::new(AuditEventType::VcImported, self.engine.local_identity())
                            .subject(imported.certificate.subject.clone())
                            .certificate(
                                imported.certificate.id.clone(),
                                imported.certificate.content_hash().unwrap_or_default(),
                                imported.version,
                            ),
                    )
                    .await;
                info!(
                    id = %imported.certificate.id,
                    version = imported.version,
                    "imported credential"
                );
            }
            Err(e) => {
                self.audit
                    .record(
                        AuditEvent::new(AuditEventType::VcImported, self.engine.local_identity())
                            .failed(e.to_string()),
                    )
                    .await;
            }
        }
        result
    }

    async fn import_inner(&self, document: &str) -> Result<ImportResult, TrustError> {
        let vc = import_json_ld(document)?;
        let cert = vc_to_cert(&vc, self.keychain.as_ref()).await?;

        // Signature integrity gates the import whenever it can be checked.
        // Lifecycle states (expired, revoked) do not: propagating closed
        // windows is exactly what revocation sync is. The check is direct so
        // a forged revocation cannot hide behind its own revoked status.
        if cert.is_verifiable() {
            let message = cert
                .signing_bytes()
                .map_err(|e| TrustError::StoreFailure { detail: e.to_string() })?;
            if cert.signature.is_empty()
                || canonical::verify_ed25519(&cert.issuer_public_key, &message, &cert.signature)
                    .is_err()
            {
                return Err(TrustError::BadSignature);
            }
        } else {
            warn!(id = %cert.id, issuer = %cert.issuer, "importing unverifiable credential, issuer key unknown");
        }

        let chain = self.engine.verify_chain(&cert, None).await;
        if !chain.valid {
            debug!(
                id = %cert.id,
                reason = chain.reason.map(|r| r.code()).unwrap_or("unknown"),
                "imported certificate chain does not verify locally"
            );
        }

        let version = self.engine.reconcile_import(&cert).await?;

        let identity_hash = cert.identity_hash();
        let bytes = cert
            .canonical_bytes()
            .map_err(|e| TrustError::StoreFailure { detail: e.to_string() })?;
        let content_hash = canonical::sha256_hex(&bytes);
        let urgent = cert.derived_status(self.clock.now_ms()) == CertificateStatus::Revoked;
        self.enqueue(identity_hash.clone(), content_hash, version, bytes, urgent).await;

        Ok(ImportResult { certificate: cert, identity_hash, version })
    }
}

// ============================================================================
// Background Tasks
// ============================================================================

/// Forward engine events into the sync queue.
async fn forward_engine_events(
    engine: Arc<CaEngine>,
    store: Arc<dyn ObjectStore>,
    queue_tx: mpsc::UnboundedSender<SyncItem>,
    status: Arc<RwLock<HashMap<String, SyncStatus>>>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut events = engine.subscribe();
    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
            event = events.recv() => {
                let event = match event {
                    Ok(event) => event,
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "propagation lagged behind engine events");
                        continue;
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                };
                let cert_ref = event.certificate();
                let record = match store.by_content_hash(&cert_ref.content_hash).await {
                    Ok(Some(record)) => record,
                    Ok(None) => {
                        warn!(content_hash = %cert_ref.content_hash, "event for unknown record");
                        continue;
                    }
                    Err(e) => {
                        warn!(error = %e, "store lookup failed while forwarding event");
                        continue;
                    }
                };
                status.write().await.insert(cert_ref.identity_hash.clone(), SyncStatus::Pending);
                let _ = queue_tx.send(SyncItem {
                    identity_hash: cert_ref.identity_hash.clone(),
                    content_hash: cert_ref.content_hash.clone(),
                    version: cert_ref.version,
                    bytes: record.bytes,
                    urgent: event.is_urgent(),
                    attempts: 0,
                });
            }
        }
    }
}

/// Drain the sync queues: urgent lane first, retry with backoff, park as
/// offline while the transport has no connection.
async fn drain_loop(
    transport: Arc<dyn PeerTransport>,
    status: Arc<RwLock<HashMap<String, SyncStatus>>>,
    retry_tx: mpsc::UnboundedSender<SyncItem>,
    mut queue_rx: mpsc::UnboundedReceiver<SyncItem>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut urgent: std::collections::VecDeque<SyncItem> = Default::default();
    let mut normal: std::collections::VecDeque<SyncItem> = Default::default();

    loop {
        // Block only when both lanes are empty.
        if urgent.is_empty() && normal.is_empty() {
            tokio::select! {
                changed = shutdown_rx.changed() => {
                    if changed.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                    continue;
                }
                item = queue_rx.recv() => match item {
                    Some(item) => enqueue_lane(&mut urgent, &mut normal, item),
                    None => break,
                },
            }
        }
        // Soak up whatever else is already queued.
        while let Ok(item) = queue_rx.try_recv() {
            enqueue_lane(&mut urgent, &mut normal, item);
        }
        if *shutdown_rx.borrow() {
            break;
        }

        let Some(mut item) = urgent.pop_front().or_else(|| normal.pop_front()) else {
            continue;
        };

        if !transport.is_connected().await {
            status.write().await.insert(item.identity_hash.clone(), SyncStatus::Offline);
            schedule_retry(&retry_tx, item, OFFLINE_RECHECK_MS);
            continue;
        }

        status.write().await.insert(item.identity_hash.clone(), SyncStatus::Syncing);
        let payload = match bincode::serialize(&SyncEnvelope {
            identity_hash: item.identity_hash.clone(),
            content_hash: item.content_hash.clone(),
            version: item.version,
            bytes: item.bytes.clone(),
        }) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "failed to encode sync envelope, dropping item");
                status.write().await.insert(item.identity_hash.clone(), SyncStatus::Failed);
                continue;
            }
        };

        match transport.deliver(payload).await {
            Ok(()) => {
                debug!(identity_hash = %item.identity_hash, version = item.version, "synced");
                status.write().await.insert(item.identity_hash.clone(), SyncStatus::Synced);
            }
            Err(e) => {
                item.attempts += 1;
                status.write().await.insert(item.identity_hash.clone(), SyncStatus::Failed);
                if item.attempts >= MAX_ATTEMPTS {
                    warn!(
                        identity_hash = %item.identity_hash,
                        attempts = item.attempts,
                        error = %e,
                        "giving up on internal propagation"
                    );
                } else {
                    let delay =
                        (BACKOFF_BASE_MS << (item.attempts - 1)).min(BACKOFF_MAX_MS);
                    debug!(
                        identity_hash = %item.identity_hash,
                        attempts = item.attempts,
                        delay_ms = delay,
                        "delivery failed, backing off"
                    );
                    schedule_retry(&retry_tx, item, delay);
                }
            }
        }
    }
}

fn enqueue_lane(
    urgent: &mut std::collections::VecDeque<SyncItem>,
    normal: &mut std::collections::VecDeque<SyncItem>,
    item: SyncItem,
) {
    if item.urgent {
        urgent.push_back(item);
    } else {
        normal.push_back(item);
    }
}

/// Re-enqueue an item after a delay without blocking the drain loop.
fn schedule_retry(retry_tx: &mpsc::UnboundedSender<SyncItem>, item: SyncItem, delay_ms: u64) {
    let retry_tx = retry_tx.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        let _ = retry_tx.send(item);
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certificate::CertificateKind;
    use crate::engine::{CaConfig, IssueRequest};
    use crate::memory::{
        MemoryKeychain, MemoryStore, MemoryTransport, RecordingDelivery, TestClock,
    };

    const T0: u64 = 1_700_000_000_000;

    struct Fixture {
        service: Arc<PropagationService>,
        engine: Arc<CaEngine>,
        transport: Arc<MemoryTransport>,
        delivery: Arc<RecordingDelivery>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(TestClock::at(T0));
        let keychain = Arc::new(MemoryKeychain::generate());
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(crate::audit::AuditLog::new(clock.clone()));
        let engine = Arc::new(CaEngine::new(
            keychain.clone(),
            store.clone(),
            audit.clone(),
            clock.clone(),
            CaConfig::default(),
        ));
        engine.init().await.unwrap();
        engine.create_root().await.unwrap();

        let transport = Arc::new(MemoryTransport::new());
        let delivery = Arc::new(RecordingDelivery::new());
        let service = PropagationService::spawn(
            engine.clone(),
            store,
            keychain,
            transport.clone(),
            delivery.clone(),
            audit,
            clock,
        );
        Fixture { service, engine, transport, delivery }
    }

    fn request(subject: &str) -> IssueRequest {
        IssueRequest {
            kind: CertificateKind::Identity,
            subject: subject.to_string(),
            subject_public_key: Some("11".repeat(32)),
            validity: "1 year".to_string(),
            valid_from: None,
            claims: serde_json::json!({}),
            chain_to: None,
        }
    }

    async fn wait_for_status(
        service: &PropagationService,
        identity_hash: &str,
        expected: SyncStatus,
    ) {
        for _ in 0..100 {
            if service.sync_status(identity_hash).await == Some(expected) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!(
            "status never became {expected:?}, is {:?}",
            service.sync_status(identity_hash).await
        );
    }

    #[tokio::test]
    async fn issued_certificates_reach_the_transport() {
        let fixture = fixture().await;
        let cert = fixture.engine.issue(request("subject")).await.unwrap();

        wait_for_status(&fixture.service, &cert.identity_hash(), SyncStatus::Synced).await;

        let delivered = fixture.transport.delivered().await;
        assert!(!delivered.is_empty());
        let envelope: SyncEnvelope = bincode::deserialize(delivered.last().unwrap()).unwrap();
        assert_eq!(envelope.identity_hash, cert.identity_hash());
        assert_eq!(envelope.version, 1);

        let decoded: Certificate = canonical::from_canonical_bytes(&envelope.bytes).unwrap();
        assert_eq!(decoded, cert);
        fixture.service.shutdown();
    }

    #[tokio::test]
    async fn failed_deliveries_retry_with_backoff() {
        let fixture = fixture().await;
        fixture.transport.fail_next(2);

        let cert = fixture.engine.issue(request("subject")).await.unwrap();
        wait_for_status(&fixture.service, &cert.identity_hash(), SyncStatus::Synced).await;

        let delivered = fixture.transport.delivered().await;
        assert_eq!(delivered.len(), 1);
        fixture.service.shutdown();
    }

    #[tokio::test]
    async fn disconnected_transport_parks_items_offline() {
        let fixture = fixture().await;
        fixture.transport.set_connected(false);

        let cert = fixture.engine.issue(request("subject")).await.unwrap();
        wait_for_status(&fixture.service, &cert.identity_hash(), SyncStatus::Offline).await;
        assert!(fixture.transport.delivered().await.is_empty());

        fixture.transport.set_connected(true);
        wait_for_status(&fixture.service, &cert.identity_hash(), SyncStatus::Synced).await;
        fixture.service.shutdown();
    }

    #[tokio::test]
    async fn revocations_are_propagated_too() {
        let fixture = fixture().await;
        let cert = fixture.engine.issue(request("subject")).await.unwrap();
        wait_for_status(&fixture.service, &cert.identity_hash(), SyncStatus::Synced).await;

        fixture.engine.revoke(&cert.id, "compromised").await.unwrap();
        // The revoked version 2 lands on the transport.
        for _ in 0..100 {
            let delivered = fixture.transport.delivered().await;
            if delivered.iter().any(|payload| {
                bincode::deserialize::<SyncEnvelope>(payload)
                    .map(|e| e.version == 2)
                    .unwrap_or(false)
            }) {
                fixture.service.shutdown();
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("revoked version never delivered");
    }

    #[tokio::test]
    async fn export_hands_the_document_to_every_channel() {
        let fixture = fixture().await;
        let cert = fixture.engine.issue(request("subject")).await.unwrap();

        let exported = fixture
            .service
            .export_external(
                &cert.id,
                1,
                ExportOptions {
                    channels: vec![
                        ExportChannel::QrCode,
                        ExportChannel::Email("ops@example.com".into()),
                        ExportChannel::Download("/tmp/cert.jsonld".into()),
                        ExportChannel::WebEndpoint("https://example.com/certs".into()),
                    ],
                    method: Some("handover".into()),
                },
            )
            .await
            .unwrap();

        assert!(exported.qr_payload.is_some());
        assert_eq!(exported.deliveries.len(), 5);
        assert!(exported.json_ld.contains("VerifiableCredential"));

        assert_eq!(fixture.delivery.emails().await.len(), 1);
        assert_eq!(fixture.delivery.files().await.len(), 1);
        assert_eq!(fixture.delivery.puts().await.len(), 1);
        fixture.service.shutdown();
    }

    #[tokio::test]
    async fn export_of_unknown_version_fails() {
        let fixture = fixture().await;
        let cert = fixture.engine.issue(request("subject")).await.unwrap();

        let err = fixture
            .service
            .export_external(&cert.id, 7, ExportOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, TrustError::NotFound { .. }));
        fixture.service.shutdown();
    }

    #[tokio::test]
    async fn import_rejects_garbage_documents() {
        let fixture = fixture().await;
        assert!(matches!(
            fixture.service.import_external("{}").await,
            Err(TrustError::InvalidDocument { .. })
        ));
        fixture.service.shutdown();
    }
}
