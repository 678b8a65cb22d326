//! # Trust Store
//!
//! Device-level trust records, one per peer, persisted as versioned objects
//! reverse-indexed by the peer's identity hash.
//!
//! Status updates never mutate a stored version: each change produces the
//! next version, preserving `established_at` from the first record and
//! stamping a fresh `last_verified`. Subscribers receive a
//! [`TrustChanged`] event for every committed update.

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::info;

use crate::audit::{AuditEvent, AuditEventType, AuditLog};
use crate::canonical::{self, from_canonical_bytes, sha256_hex};
use crate::error::TrustError;
use crate::ports::{Clock, ObjectStore, VersionedRecord};

/// Reverse-map index names maintained on trust records.
pub mod indexes {
    /// Relationship by peer identity hash.
    pub const PEER: &str = "peer";
    /// All trust relationships of this instance.
    pub const RECORD: &str = "record";
}

const RECORD_KEY: &str = "trust";

/// Trust status of a peer relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustStatus {
    Trusted,
    Untrusted,
    Pending,
    Revoked,
}

impl std::fmt::Display for TrustStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Trusted => "trusted",
            Self::Untrusted => "untrusted",
            Self::Pending => "pending",
            Self::Revoked => "revoked",
        };
        write!(f, "{name}")
    }
}

/// Coarse trust grade attached to a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustLevel {
    #[serde(rename = "self")]
    Own,
    High,
    Medium,
    Low,
}

/// One versioned trust record for a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustRelationship {
    /// Peer identity hash.
    pub peer: String,
    /// Peer's Ed25519 public key, hex.
    pub peer_public_key: String,
    pub status: TrustStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_level: Option<TrustLevel>,
    /// Fine-grained capability mapping, free-form.
    pub permissions: Value,
    /// When the relationship was first recorded; survives every update.
    pub established_at: u64,
    /// Updated on every status change.
    pub last_verified: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_method: Option<String>,
    /// Hash of the artifact that verified this relationship, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_proof: Option<String>,
    pub version: u64,
}

impl TrustRelationship {
    /// Stable store id for a peer's trust record.
    pub fn record_id(peer: &str) -> String {
        format!("trust:{peer}")
    }
}

/// Optional fields accompanying a status update.
#[derive(Debug, Clone, Default)]
pub struct TrustOptions {
    pub trust_level: Option<TrustLevel>,
    pub permissions: Option<Value>,
    pub valid_until: Option<u64>,
    pub reason: Option<String>,
    pub context: Option<String>,
    pub verification_method: Option<String>,
    pub verification_proof: Option<String>,
}

/// Broadcast on every committed trust update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustChanged {
    pub peer: String,
    pub status: TrustStatus,
}

/// Persistence and queries for [`TrustRelationship`] records.
pub struct TrustStore {
    store: Arc<dyn ObjectStore>,
    audit: Arc<AuditLog>,
    clock: Arc<dyn Clock>,
    local_identity: String,
    /// Per-peer update locks so concurrent updates observe a consistent
    /// latest version.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    events: broadcast::Sender<TrustChanged>,
}

impl TrustStore {
    pub fn new(
        store: Arc<dyn ObjectStore>,
        audit: Arc<AuditLog>,
        clock: Arc<dyn Clock>,
        local_identity: impl Into<String>,
    ) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            store,
            audit,
            clock,
            local_identity: local_identity.into(),
            locks: Mutex::new(HashMap::new()),
            events,
        }
    }

    /// Subscribe to trust changes.
    pub fn subscribe(&self) -> broadcast::Receiver<TrustChanged> {
        self.events.subscribe()
    }

    /// Record a peer's trust status, creating the next version of its
    /// relationship record.
    ///
    /// `established_at` is preserved from the existing relationship when
    /// there is one; `last_verified` is always refreshed.
    pub async fn set_trust_status(
        &self,
        peer: &str,
        peer_public_key: &str,
        status: TrustStatus,
        options: TrustOptions,
    ) -> Result<TrustRelationship, TrustError> {
        let lock = {
            let mut locks = self.locks.lock().await;
            locks.entry(peer.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
        };
        let _guard = lock.lock().await;

        let now = self.clock.now_ms();
        let existing = self.get_trust(peer).await?;
        let (established_at, version) = match &existing {
            Some(rel) => (rel.established_at, rel.version + 1),
            None => (now, 1),
        };

        let relationship = TrustRelationship {
            peer: peer.to_string(),
            peer_public_key: peer_public_key.to_string(),
            status,
            trust_level: options.trust_level.or(existing.as_ref().and_then(|r| r.trust_level)),
            permissions: options
                .permissions
                .or(existing.map(|r| r.permissions))
                .unwrap_or_else(|| Value::Object(serde_json::Map::new())),
            established_at,
            last_verified: now,
            valid_until: options.valid_until,
            reason: options.reason,
            context: options.context,
            verification_method: options.verification_method,
            verification_proof: options.verification_proof,
            version,
        };

        let result = self.persist(&relationship).await;
        let event_type = match status {
            TrustStatus::Trusted | TrustStatus::Pending => AuditEventType::TrustEstablished,
            TrustStatus::Untrusted | TrustStatus::Revoked => AuditEventType::TrustRevoked,
        };
        let mut event =
            AuditEvent::new(event_type, self.local_identity.clone()).subject(peer.to_string());
        if let Some(reason) = &relationship.reason {
            event = event.reason(reason.clone());
        }
        match &result {
            Ok(()) => {
                self.audit.record(event).await;
                info!(peer, status = %status, version, "trust status updated");
                let _ = self
                    .events
                    .send(TrustChanged { peer: peer.to_string(), status });
                Ok(relationship)
            }
            Err(e) => {
                self.audit.record(event.failed(e.to_string())).await;
                Err(e.clone())
            }
        }
    }

    /// Latest trust record for a peer.
    pub async fn get_trust(&self, peer: &str) -> Result<Option<TrustRelationship>, TrustError> {
        let identity_hash = canonical::identity_hash(&TrustRelationship::record_id(peer));
        let Some(record) = self.store.latest(&identity_hash).await? else {
            return Ok(None);
        };
        Ok(Some(decode_relationship(&record)?))
    }

    /// Latest trust records for every known peer.
    pub async fn list(&self) -> Result<Vec<TrustRelationship>, TrustError> {
        let records = self.store.reverse_lookup(indexes::RECORD, RECORD_KEY).await?;
        records.iter().map(decode_relationship).collect()
    }

    /// Every stored version of a peer's relationship, ascending.
    pub async fn history(&self, peer: &str) -> Result<Vec<TrustRelationship>, TrustError> {
        let identity_hash = canonical::identity_hash(&TrustRelationship::record_id(peer));
        let records = self.store.versions(&identity_hash).await?;
        records.iter().map(decode_relationship).collect()
    }

    async fn persist(&self, relationship: &TrustRelationship) -> Result<(), TrustError> {
        let bytes = canonical::canonical_bytes(relationship)
            .map_err(|e| TrustError::StoreFailure { detail: e.to_string() })?;
        let record_id = TrustRelationship::record_id(&relationship.peer);
        self.store
            .put(VersionedRecord {
                identity_hash: canonical::identity_hash(&record_id),
                content_hash: sha256_hex(&bytes),
                version: relationship.version,
                bytes,
                indexes: vec![
                    (indexes::PEER.to_string(), relationship.peer.clone()),
                    (indexes::RECORD.to_string(), RECORD_KEY.to_string()),
                ],
            })
            .await
    }
}

fn decode_relationship(record: &VersionedRecord) -> Result<TrustRelationship, TrustError> {
    from_canonical_bytes(&record.bytes)
        .map_err(|e| TrustError::StoreFailure { detail: format!("undecodable trust record: {e}") })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditQuery;
    use crate::memory::{MemoryStore, TestClock};
    use serde_json::json;

    fn trust_store() -> (Arc<TestClock>, Arc<AuditLog>, TrustStore) {
        let clock = Arc::new(TestClock::at(1_000));
        let audit = Arc::new(AuditLog::new(clock.clone()));
        let store = TrustStore::new(
            Arc::new(MemoryStore::new()),
            audit.clone(),
            clock.clone(),
            "local-instance",
        );
        (clock, audit, store)
    }

    #[tokio::test]
    async fn establishing_trust_creates_version_one() {
        let (_clock, _audit, store) = trust_store();

        let rel = store
            .set_trust_status(
                "peer-a",
                "aa",
                TrustStatus::Trusted,
                TrustOptions {
                    trust_level: Some(TrustLevel::High),
                    permissions: Some(json!({"file-transfer": true})),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(rel.version, 1);
        assert_eq!(rel.established_at, 1_000);
        assert_eq!(rel.last_verified, 1_000);

        let loaded = store.get_trust("peer-a").await.unwrap().unwrap();
        assert_eq!(loaded, rel);
        assert!(store.get_trust("peer-b").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn updates_preserve_established_at_and_refresh_last_verified() {
        let (clock, _audit, store) = trust_store();

        store
            .set_trust_status("peer-a", "aa", TrustStatus::Pending, TrustOptions::default())
            .await
            .unwrap();

        clock.set(5_000);
        let updated = store
            .set_trust_status("peer-a", "aa", TrustStatus::Trusted, TrustOptions::default())
            .await
            .unwrap();

        assert_eq!(updated.version, 2);
        assert_eq!(updated.established_at, 1_000);
        assert_eq!(updated.last_verified, 5_000);

        let history = store.history("peer-a").await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].status, TrustStatus::Pending);
        assert_eq!(history[1].status, TrustStatus::Trusted);
    }

    #[tokio::test]
    async fn list_returns_latest_record_per_peer() {
        let (_clock, _audit, store) = trust_store();

        store
            .set_trust_status("peer-a", "aa", TrustStatus::Trusted, TrustOptions::default())
            .await
            .unwrap();
        store
            .set_trust_status("peer-b", "bb", TrustStatus::Pending, TrustOptions::default())
            .await
            .unwrap();
        store
            .set_trust_status("peer-a", "aa", TrustStatus::Revoked, TrustOptions::default())
            .await
            .unwrap();

        let mut all = store.list().await.unwrap();
        all.sort_by(|a, b| a.peer.cmp(&b.peer));
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, TrustStatus::Revoked);
        assert_eq!(all[0].version, 2);
        assert_eq!(all[1].status, TrustStatus::Pending);
    }

    #[tokio::test]
    async fn events_and_audit_cover_updates() {
        let (_clock, audit, store) = trust_store();
        let mut events = store.subscribe();

        store
            .set_trust_status("peer-a", "aa", TrustStatus::Trusted, TrustOptions::default())
            .await
            .unwrap();
        store
            .set_trust_status(
                "peer-a",
                "aa",
                TrustStatus::Revoked,
                TrustOptions { reason: Some("device lost".into()), ..Default::default() },
            )
            .await
            .unwrap();

        assert_eq!(
            events.recv().await.unwrap(),
            TrustChanged { peer: "peer-a".into(), status: TrustStatus::Trusted }
        );
        assert_eq!(
            events.recv().await.unwrap(),
            TrustChanged { peer: "peer-a".into(), status: TrustStatus::Revoked }
        );

        let established = audit
            .query(&AuditQuery {
                event_type: Some(AuditEventType::TrustEstablished),
                ..Default::default()
            })
            .await;
        assert_eq!(established.len(), 1);

        let revoked = audit
            .query(&AuditQuery {
                event_type: Some(AuditEventType::TrustRevoked),
                ..Default::default()
            })
            .await;
        assert_eq!(revoked.len(), 1);
        assert_eq!(revoked[0].reason.as_deref(), Some("device lost"));
    }

    #[tokio::test]
    async fn trust_level_survives_updates_unless_overridden() {
        let (_clock, _audit, store) = trust_store();

        store
            .set_trust_status(
                "peer-a",
                "aa",
                TrustStatus::Trusted,
                TrustOptions { trust_level: Some(TrustLevel::Medium), ..Default::default() },
            )
            .await
            .unwrap();

        let updated = store
            .set_trust_status("peer-a", "aa", TrustStatus::Trusted, TrustOptions::default())
            .await
            .unwrap();
        assert_eq!(updated.trust_level, Some(TrustLevel::Medium));

        let overridden = store
            .set_trust_status(
                "peer-a",
                "aa",
                TrustStatus::Trusted,
                TrustOptions { trust_level: Some(TrustLevel::Low), ..Default::default() },
            )
            .await
            .unwrap();
        assert_eq!(overridden.trust_level, Some(TrustLevel::Low));
    }
}
