//! # Audit Log
//!
//! Append-only record of every CA and trust lifecycle operation, successful
//! or not. Events are plain data: the core does not sign them; a caller
//! exporting an audit trail externally signs it at the boundary.
//!
//! Queries filter by any subset of fields plus a time range and return
//! newest-first. Pruning removes whole events older than a retention window
//! and never rewrites surviving ones.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;

use crate::ports::Clock;

/// Lifecycle operations recorded in the audit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    CertificateIssued,
    CertificateExtended,
    CertificateReduced,
    CertificateRevoked,
    CertificateVerified,
    TrustEstablished,
    TrustRevoked,
    VcExported,
    VcImported,
}

/// One audit entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    /// Milliseconds since epoch.
    pub timestamp: u64,
    /// Identity hash of the acting instance.
    pub actor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_version: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl AuditEvent {
    /// Start building an event; unset optional fields stay `None`.
    pub fn new(event_type: AuditEventType, actor: impl Into<String>) -> Self {
        Self {
            event_type,
            timestamp: 0,
            actor: actor.into(),
            subject: None,
            certificate_id: None,
            certificate_hash: None,
            certificate_version: None,
            reason: None,
            metadata: None,
            success: true,
            error: None,
        }
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = Some(subject.into());
        self
    }

    pub fn certificate(
        mut self,
        id: impl Into<String>,
        hash: impl Into<String>,
        version: u64,
    ) -> Self {
        self.certificate_id = Some(id.into());
        self.certificate_hash = Some(hash.into());
        self.certificate_version = Some(version);
        self
    }

    pub fn certificate_id(mut self, id: impl Into<String>) -> Self {
        self.certificate_id = Some(id.into());
        self
    }

    pub fn reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }
}

/// Field filters for audit queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct AuditQuery {
    pub event_type: Option<AuditEventType>,
    pub actor: Option<String>,
    pub subject: Option<String>,
    pub certificate_id: Option<String>,
    /// Inclusive lower bound, ms since epoch.
    pub since: Option<u64>,
    /// Inclusive upper bound, ms since epoch.
    pub until: Option<u64>,
}

impl AuditQuery {
    fn matches(&self, event: &AuditEvent) -> bool {
        if let Some(event_type) = self.event_type {
            if event.event_type != event_type {
                return false;
            }
        }
        if let Some(actor) = &self.actor {
            if &event.actor != actor {
                return false;
            }
        }
        if let Some(subject) = &self.subject {
            if event.subject.as_deref() != Some(subject.as_str()) {
                return false;
            }
        }
        if let Some(certificate_id) = &self.certificate_id {
            if event.certificate_id.as_deref() != Some(certificate_id.as_str()) {
                return false;
            }
        }
        if let Some(since) = self.since {
            if event.timestamp < since {
                return false;
            }
        }
        if let Some(until) = self.until {
            if event.timestamp > until {
                return false;
            }
        }
        true
    }
}

/// Append-only, instance-scoped audit log.
pub struct AuditLog {
    events: RwLock<Vec<AuditEvent>>,
    clock: Arc<dyn Clock>,
}

impl AuditLog {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { events: RwLock::new(Vec::new()), clock }
    }

    /// Append one event, stamping it with the current time.
    pub async fn record(&self, mut event: AuditEvent) {
        event.timestamp = self.clock.now_ms();
        tracing::debug!(
            event_type = ?event.event_type,
            success = event.success,
            certificate_id = event.certificate_id.as_deref().unwrap_or("-"),
            "audit"
        );
        self.events.write().await.push(event);
    }

    /// Events matching the query, newest-first.
    pub async fn query(&self, query: &AuditQuery) -> Vec<AuditEvent> {
        let events = self.events.read().await;
        let mut matched: Vec<AuditEvent> =
            events.iter().filter(|e| query.matches(e)).cloned().collect();
        matched.reverse();
        matched
    }

    /// Total number of recorded events.
    pub async fn len(&self) -> usize {
        self.events.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.events.read().await.is_empty()
    }

    /// Drop events older than the retention window. Returns how many were
    /// removed. Surviving events are untouched.
    pub async fn prune(&self, retention_ms: u64) -> usize {
        let cutoff = self.clock.now_ms().saturating_sub(retention_ms);
        let mut events = self.events.write().await;
        let before = events.len();
        events.retain(|e| e.timestamp >= cutoff);
        before - events.len()
    }
}
