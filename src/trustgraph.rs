//! # Trust Graph & Evaluator
//!
//! Social trust on top of the device-level records: directed, weighted
//! [`TrustEdge`]s between persons, multi-factor evaluation of a single peer,
//! bounded path search, and whole-graph metrics.
//!
//! ## Evaluation Factors
//!
//! [`TrustGraph::evaluate_trust`] combines:
//!
//! 1. the relationship status (base level and confidence),
//! 2. whether a device-trust certificate chain vouches for the peer's key,
//! 3. how recently the relationship was verified,
//! 4. relationship expiry, and
//! 5. the requirements of the requesting context.
//!
//! Both outputs are clamped to `[0, 1]`.
//!
//! ## Path Semantics
//!
//! Path trust is the **minimum** edge confidence along the path (the
//! bottleneck), not the product; the bottleneck edge is reported separately.
//! Revoked edges never participate.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::certificate::CertificateKind;
use crate::engine::{self, CaEngine};
use crate::error::TrustError;
use crate::ports::{Clock, ObjectStore};
use crate::truststore::{TrustLevel, TrustStatus, TrustStore};

/// Default bound for path searches.
pub const DEFAULT_MAX_PATH_DEPTH: usize = 6;

/// Default bound for trust-chain traversal.
pub const DEFAULT_MAX_CHAIN_DEPTH: u32 = 3;

/// Paths whose bottleneck confidence falls below this are reported invalid.
pub const MIN_PATH_TRUST: f64 = 0.5;

/// Edges at or above this confidence form clusters.
pub const CLUSTER_CONFIDENCE_THRESHOLD: f64 = 0.7;

const SEVEN_DAYS_MS: u64 = 7 * 24 * 60 * 60 * 1_000;
const THIRTY_DAYS_MS: u64 = 30 * 24 * 60 * 60 * 1_000;

// ============================================================================
// Edges
// ============================================================================

/// Progressive closeness of a social trust relation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrustEdgeLevel {
    Invited,
    Known,
    Verified,
    Trusted,
    Core,
}

/// A directed social trust relation between two persons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrustEdge {
    pub from: String,
    pub to: String,
    pub level: TrustEdgeLevel,
    /// Confidence in `[0, 1]`.
    pub confidence: f64,
    /// How the edge came to exist (invitation, endorsement, import).
    pub origin: String,
    pub created_at: u64,
    pub updated_at: u64,
    /// Hops from the owning instance when the edge was learned.
    pub chain_depth: u32,
    /// Trust of the path this edge was learned through.
    pub path_trust: f64,
    pub interactions: u64,
    pub endorsements: u64,
    pub disputes: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revoked_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revocation_reason: Option<String>,
}

impl TrustEdge {
    /// A fresh direct edge with the given confidence (clamped to `[0, 1]`).
    pub fn new(
        from: impl Into<String>,
        to: impl Into<String>,
        level: TrustEdgeLevel,
        confidence: f64,
        now_ms: u64,
    ) -> Self {
        let confidence = confidence.clamp(0.0, 1.0);
        Self {
            from: from.into(),
            to: to.into(),
            level,
            confidence,
            origin: "direct".to_string(),
            created_at: now_ms,
            updated_at: now_ms,
            chain_depth: 1,
            path_trust: confidence,
            interactions: 0,
            endorsements: 0,
            disputes: 0,
            scope: None,
            revoked: false,
            revoked_at: None,
            revocation_reason: None,
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Context a trust decision is being made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrustContext {
    FileTransfer,
    Communication,
    General,
}

impl TrustContext {
    /// Minimum trust level the context requires.
    fn threshold(&self) -> f64 {
        match self {
            Self::FileTransfer => 0.7,
            Self::Communication => 0.5,
            Self::General => 0.0,
        }
    }

    fn insufficient_reason(&self) -> &'static str {
        match self {
            Self::FileTransfer => "insufficient_trust_for_file_transfer",
            Self::Communication => "insufficient_trust_for_communication",
            Self::General => "insufficient_trust",
        }
    }
}

/// Outcome of a multi-factor evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustEvaluation {
    /// Trust level in `[0, 1]`.
    pub level: f64,
    /// Confidence in the level, in `[0, 1]`.
    pub confidence: f64,
    pub reason: String,
    pub trust_level: Option<TrustLevel>,
}

/// The weakest edge along a path.
#[derive(Debug, Clone, PartialEq)]
pub struct BottleneckEdge {
    pub from: String,
    pub to: String,
    pub confidence: f64,
}

/// A trust path between two persons.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustPath {
    /// Node identities from source to target, inclusive.
    pub path: Vec<String>,
    /// Number of edges.
    pub path_length: usize,
    /// Minimum edge confidence along the path.
    pub total_trust: f64,
    pub bottleneck: Option<BottleneckEdge>,
    /// Whether `total_trust` clears [`MIN_PATH_TRUST`].
    pub is_valid: bool,
}

/// Degree and centrality of one node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphNode {
    pub id: String,
    pub out_degree: usize,
    pub in_degree: usize,
    /// Count of simple two-hop paths routed through this node.
    pub centrality: usize,
}

/// Aggregate graph metrics.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphMetrics {
    pub node_count: usize,
    pub edge_count: usize,
    pub cluster_count: usize,
    pub average_confidence: f64,
}

/// Snapshot of the social graph.
#[derive(Debug, Clone, PartialEq)]
pub struct SocialGraph {
    pub nodes: Vec<GraphNode>,
    pub edges: Vec<TrustEdge>,
    /// Connected components over edges with confidence at or above
    /// [`CLUSTER_CONFIDENCE_THRESHOLD`].
    pub clusters: Vec<Vec<String>>,
    pub metrics: GraphMetrics,
}

/// One node of a breadth-first trust chain.
#[derive(Debug, Clone, PartialEq)]
pub struct TrustChainNode {
    pub identity: String,
    pub depth: u32,
    /// The node this one was reached through; `None` for the root.
    pub established_by: Option<String>,
    pub trust_level: TrustLevel,
}

// ============================================================================
// Graph
// ============================================================================

/// Social edges plus the evaluator over them.
pub struct TrustGraph {
    truststore: Arc<TrustStore>,
    engine: Arc<CaEngine>,
    store: Arc<dyn ObjectStore>,
    clock: Arc<dyn Clock>,
    edges: RwLock<Vec<TrustEdge>>,
}

impl TrustGraph {
    pub fn new(
        truststore: Arc<TrustStore>,
        engine: Arc<CaEngine>,
        store: Arc<dyn ObjectStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { truststore, engine, store, clock, edges: RwLock::new(Vec::new()) }
    }

    /// Insert or replace the edge `from → to`.
    pub async fn upsert_edge(&self, edge: TrustEdge) {
        let mut edges = self.edges.write().await;
        if let Some(existing) =
            edges.iter_mut().find(|e| e.from == edge.from && e.to == edge.to)
        {
            *existing = edge;
        } else {
            edges.push(edge);
        }
    }

    /// Mark the edge `from → to` revoked; it no longer participates in any
    /// computation.
    pub async fn revoke_edge(&self, from: &str, to: &str, reason: &str) -> bool {
        let mut edges = self.edges.write().await;
        match edges.iter_mut().find(|e| e.from == from && e.to == to && !e.revoked) {
            Some(edge) => {
                edge.revoked = true;
                edge.revoked_at = Some(self.clock.now_ms());
                edge.revocation_reason = Some(reason.to_string());
                true
            }
            None => false,
        }
    }

    /// Snapshot of all edges, revoked ones included.
    pub async fn edges(&self) -> Vec<TrustEdge> {
        self.edges.read().await.clone()
    }

    async fn active_edges(&self) -> Vec<TrustEdge> {
        self.edges.read().await.iter().filter(|e| !e.revoked).cloned().collect()
    }

    // ------------------------------------------------------------------
    // Evaluation
    // ------------------------------------------------------------------

    /// Multi-factor trust evaluation of a peer for a context.
    pub async fn evaluate_trust(
        &self,
        peer: &str,
        context: TrustContext,
    ) -> Result<TrustEvaluation, TrustError> {
        let now = self.clock.now_ms();
        let Some(relationship) = self.truststore.get_trust(peer).await? else {
            return Ok(TrustEvaluation {
                level: 0.0,
                confidence: 0.0,
                reason: "no_relationship".to_string(),
                trust_level: None,
            });
        };

        let (level, mut confidence): (f64, f64) = match relationship.status {
            TrustStatus::Trusted => (0.9, 0.5),
            TrustStatus::Pending => (0.3, 0.5),
            TrustStatus::Untrusted => (0.1, 0.8),
            TrustStatus::Revoked => (0.0, 1.0),
        };

        if self.device_certificate_vouches(peer, &relationship.peer_public_key).await {
            confidence = (confidence + 0.2).min(1.0);
        } else {
            confidence = (confidence - 0.1).max(0.0);
        }

        let age = now.saturating_sub(relationship.last_verified);
        if age <= SEVEN_DAYS_MS {
            confidence = (confidence + 0.1).min(1.0);
        } else if age > THIRTY_DAYS_MS {
            confidence = (confidence - 0.1).max(0.0);
        }

        if let Some(valid_until) = relationship.valid_until {
            if valid_until < now {
                return Ok(TrustEvaluation {
                    level: 0.0,
                    confidence: 1.0,
                    reason: "expired".to_string(),
                    trust_level: relationship.trust_level,
                });
            }
        }

        let level = level.clamp(0.0, 1.0);
        let reason = if level < context.threshold() {
            context.insufficient_reason().to_string()
        } else {
            format!("status_{}", relationship.status)
        };

        Ok(TrustEvaluation {
            level,
            confidence: confidence.clamp(0.0, 1.0),
            reason,
            trust_level: relationship.trust_level,
        })
    }

    /// Whether a verifying device-trust certificate chain binds the peer to
    /// the given key.
    async fn device_certificate_vouches(&self, peer: &str, peer_public_key: &str) -> bool {
        let Ok(records) = self.store.reverse_lookup(engine::indexes::SUBJECT, peer).await else {
            return false;
        };
        for record in records {
            let Ok(cert) =
                crate::canonical::from_canonical_bytes::<crate::certificate::Certificate>(
                    &record.bytes,
                )
            else {
                continue;
            };
            if cert.kind != CertificateKind::Device {
                continue;
            }
            if cert.subject_public_key != peer_public_key {
                continue;
            }
            if self.engine.verify_chain(&cert, None).await.valid {
                return true;
            }
        }
        false
    }

    // ------------------------------------------------------------------
    // Paths
    // ------------------------------------------------------------------

    /// Widest trust path from `from` to `to`, bounded by `max_depth` edges.
    ///
    /// Maximizes the bottleneck (minimum edge confidence); `None` when no
    /// path within the bound exists.
    pub async fn calculate_trust_path(
        &self,
        from: &str,
        to: &str,
        max_depth: usize,
    ) -> Option<TrustPath> {
        if from == to {
            return Some(TrustPath {
                path: vec![from.to_string()],
                path_length: 0,
                total_trust: 1.0,
                bottleneck: None,
                is_valid: true,
            });
        }

        let edges = self.active_edges().await;
        let mut adjacency: HashMap<&str, Vec<&TrustEdge>> = HashMap::new();
        for edge in &edges {
            adjacency.entry(edge.from.as_str()).or_default().push(edge);
        }

        // Layered relaxation: after round k, `best` holds the widest
        // bottleneck reachable in at most k edges.
        let mut best: HashMap<String, (f64, Vec<String>)> = HashMap::new();
        best.insert(from.to_string(), (f64::INFINITY, vec![from.to_string()]));

        for _ in 0..max_depth {
            let mut changed = false;
            let snapshot: Vec<(String, (f64, Vec<String>))> =
                best.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
            for (node, (score, path)) in snapshot {
                let Some(outgoing) = adjacency.get(node.as_str()) else { continue };
                for edge in outgoing {
                    if path.contains(&edge.to) {
                        continue;
                    }
                    let candidate = score.min(edge.confidence);
                    let current = best.get(&edge.to).map(|(s, _)| *s).unwrap_or(f64::NEG_INFINITY);
                    if candidate > current {
                        let mut next_path = path.clone();
                        next_path.push(edge.to.clone());
                        best.insert(edge.to.clone(), (candidate, next_path));
                        changed = true;
                    }
                }
            }
            if !changed {
                break;
            }
        }

        let (total_trust, path) = best.remove(to)?;
        let bottleneck = path
            .windows(2)
            .filter_map(|pair| {
                edges
                    .iter()
                    .find(|e| e.from == pair[0] && e.to == pair[1])
                    .map(|e| BottleneckEdge {
                        from: e.from.clone(),
                        to: e.to.clone(),
                        confidence: e.confidence,
                    })
            })
            .min_by(|a, b| a.confidence.total_cmp(&b.confidence));

        debug!(from, to, trust = total_trust, hops = path.len() - 1, "trust path found");
        Some(TrustPath {
            path_length: path.len() - 1,
            total_trust,
            is_valid: total_trust >= MIN_PATH_TRUST,
            bottleneck,
            path,
        })
    }

    // ------------------------------------------------------------------
    // Graph Analysis
    // ------------------------------------------------------------------

    /// Degrees, two-hop centrality, strong clusters and aggregate metrics
    /// over the non-revoked edges.
    pub async fn build_social_graph(&self) -> SocialGraph {
        let edges = self.active_edges().await;

        let mut node_ids: Vec<String> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();
        for edge in &edges {
            if seen.insert(edge.from.as_str()) {
                node_ids.push(edge.from.clone());
            }
            if seen.insert(edge.to.as_str()) {
                node_ids.push(edge.to.clone());
            }
        }

        let mut out_adj: HashMap<&str, Vec<&str>> = HashMap::new();
        let mut in_adj: HashMap<&str, Vec<&str>> = HashMap::new();
        for edge in &edges {
            out_adj.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
            in_adj.entry(edge.to.as_str()).or_default().push(edge.from.as_str());
        }

        let nodes: Vec<GraphNode> = node_ids
            .iter()
            .map(|id| {
                let outgoing = out_adj.get(id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
                let incoming = in_adj.get(id.as_str()).map(Vec::as_slice).unwrap_or(&[]);
                // Two-hop paths a → id → b with distinct endpoints.
                let centrality = incoming
                    .iter()
                    .copied()
                    .map(|a| {
                        outgoing
                            .iter()
                            .copied()
                            .filter(|&b| b != a && b != id.as_str())
                            .count()
                    })
                    .sum();
                GraphNode {
                    id: id.clone(),
                    out_degree: outgoing.len(),
                    in_degree: incoming.len(),
                    centrality,
                }
            })
            .collect();

        let clusters = strong_clusters(&node_ids, &edges);
        let average_confidence = if edges.is_empty() {
            0.0
        } else {
            edges.iter().map(|e| e.confidence).sum::<f64>() / edges.len() as f64
        };

        SocialGraph {
            metrics: GraphMetrics {
                node_count: nodes.len(),
                edge_count: edges.len(),
                cluster_count: clusters.len(),
                average_confidence,
            },
            nodes,
            clusters,
            edges,
        }
    }

    /// Breadth-first trust tree rooted at `person`, traversing outgoing
    /// edges to `max_depth`.
    ///
    /// The root carries `trust_level = self`; reached peers carry their
    /// relationship trust level when one exists, and a mapping of the edge
    /// level otherwise.
    pub async fn get_trust_chain(
        &self,
        person: &str,
        max_depth: u32,
    ) -> Result<Vec<TrustChainNode>, TrustError> {
        let edges = self.active_edges().await;
        let mut adjacency: HashMap<&str, Vec<&TrustEdge>> = HashMap::new();
        for edge in &edges {
            adjacency.entry(edge.from.as_str()).or_default().push(edge);
        }

        let mut nodes = vec![TrustChainNode {
            identity: person.to_string(),
            depth: 0,
            established_by: None,
            trust_level: TrustLevel::Own,
        }];
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(person.to_string());
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        queue.push_back((person.to_string(), 0));

        while let Some((current, depth)) = queue.pop_front() {
            if depth >= max_depth {
                continue;
            }
            let Some(outgoing) = adjacency.get(current.as_str()) else { continue };
            for edge in outgoing {
                if !visited.insert(edge.to.clone()) {
                    continue;
                }
                let trust_level = match self.truststore.get_trust(&edge.to).await? {
                    Some(rel) => rel.trust_level.unwrap_or_else(|| edge_trust_level(edge.level)),
                    None => edge_trust_level(edge.level),
                };
                nodes.push(TrustChainNode {
                    identity: edge.to.clone(),
                    depth: depth + 1,
                    established_by: Some(current.clone()),
                    trust_level,
                });
                queue.push_back((edge.to.clone(), depth + 1));
            }
        }
        Ok(nodes)
    }
}

/// Map an edge level onto the coarse relationship grades.
fn edge_trust_level(level: TrustEdgeLevel) -> TrustLevel {
    match level {
        TrustEdgeLevel::Core | TrustEdgeLevel::Trusted => TrustLevel::High,
        TrustEdgeLevel::Verified => TrustLevel::Medium,
        TrustEdgeLevel::Known | TrustEdgeLevel::Invited => TrustLevel::Low,
    }
}

/// Connected components (undirected) over strong edges.
fn strong_clusters(node_ids: &[String], edges: &[TrustEdge]) -> Vec<Vec<String>> {
    let index: HashMap<&str, usize> =
        node_ids.iter().enumerate().map(|(i, id)| (id.as_str(), i)).collect();
    let mut parent: Vec<usize> = (0..node_ids.len()).collect();

    fn find(parent: &mut Vec<usize>, mut x: usize) -> usize {
        while parent[x] != x {
            parent[x] = parent[parent[x]];
            x = parent[x];
        }
        x
    }

    for edge in edges {
        if edge.confidence < CLUSTER_CONFIDENCE_THRESHOLD {
            continue;
        }
        let (Some(&a), Some(&b)) = (index.get(edge.from.as_str()), index.get(edge.to.as_str()))
        else {
            continue;
        };
        let (ra, rb) = (find(&mut parent, a), find(&mut parent, b));
        if ra != rb {
            parent[ra] = rb;
        }
    }

    let mut components: HashMap<usize, Vec<String>> = HashMap::new();
    for (i, id) in node_ids.iter().enumerate() {
        let root = find(&mut parent, i);
        components.entry(root).or_default().push(id.clone());
    }
    let mut clusters: Vec<Vec<String>> = components.into_values().collect();
    for cluster in &mut clusters {
        cluster.sort();
    }
    clusters.sort();
    clusters
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLog;
    use crate::engine::CaConfig;
    use crate::memory::{MemoryKeychain, MemoryStore, TestClock};
    use crate::ports::Keychain;
    use crate::truststore::TrustOptions;

    const T0: u64 = 1_700_000_000_000;

    struct Fixture {
        graph: TrustGraph,
        truststore: Arc<TrustStore>,
        engine: Arc<CaEngine>,
        clock: Arc<TestClock>,
    }

    async fn fixture() -> Fixture {
        let clock = Arc::new(TestClock::at(T0));
        let keychain = Arc::new(MemoryKeychain::generate());
        let store = Arc::new(MemoryStore::new());
        let audit = Arc::new(AuditLog::new(clock.clone()));
        let engine = Arc::new(CaEngine::new(
            keychain.clone(),
            store.clone(),
            audit.clone(),
            clock.clone(),
            CaConfig::default(),
        ));
        engine.init().await.unwrap();
        engine.create_root().await.unwrap();
        let truststore = Arc::new(TrustStore::new(
            store.clone(),
            audit,
            clock.clone(),
            keychain.local_identity(),
        ));
        let graph =
            TrustGraph::new(truststore.clone(), engine.clone(), store, clock.clone());
        Fixture { graph, truststore, engine, clock }
    }

    async fn trust(fixture: &Fixture, peer: &str, status: TrustStatus) {
        fixture
            .truststore
            .set_trust_status(peer, &"77".repeat(32), status, TrustOptions::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn evaluation_is_always_bounded() {
        let fixture = fixture().await;
        for status in
            [TrustStatus::Trusted, TrustStatus::Pending, TrustStatus::Untrusted, TrustStatus::Revoked]
        {
            trust(&fixture, "peer", status).await;
            for context in
                [TrustContext::FileTransfer, TrustContext::Communication, TrustContext::General]
            {
                let eval = fixture.graph.evaluate_trust("peer", context).await.unwrap();
                assert!((0.0..=1.0).contains(&eval.level), "level out of bounds: {eval:?}");
                assert!(
                    (0.0..=1.0).contains(&eval.confidence),
                    "confidence out of bounds: {eval:?}"
                );
            }
        }
    }

    #[tokio::test]
    async fn unknown_peer_evaluates_to_zero() {
        let fixture = fixture().await;
        let eval = fixture.graph.evaluate_trust("stranger", TrustContext::General).await.unwrap();
        assert_eq!(eval.level, 0.0);
        assert_eq!(eval.reason, "no_relationship");
    }

    #[tokio::test]
    async fn trusted_peer_passes_communication_but_device_cert_decides_confidence() {
        let fixture = fixture().await;
        trust(&fixture, "peer", TrustStatus::Trusted).await;

        // No device certificate: 0.5 - 0.1 (lookup miss) + 0.1 (recent) = 0.5
        let eval = fixture.graph.evaluate_trust("peer", TrustContext::Communication).await.unwrap();
        assert_eq!(eval.level, 0.9);
        assert!((eval.confidence - 0.5).abs() < 1e-9);
        assert_eq!(eval.reason, "status_trusted");

        // A verifying device-trust certificate for the same key raises it:
        // 0.5 + 0.2 + 0.1 = 0.8
        let claims = crate::certificate::DeviceTrustClaims {
            trust_level: crate::certificate::DeviceTrustLevel::Full,
            trust_reason: "paired".into(),
            verification_method: "manual".into(),
            permissions: serde_json::json!({}),
        };
        fixture
            .engine
            .issue_device_trust("peer", Some("77".repeat(32)), "1 year", &claims)
            .await
            .unwrap();

        let eval = fixture.graph.evaluate_trust("peer", TrustContext::Communication).await.unwrap();
        assert!((eval.confidence - 0.8).abs() < 1e-9, "got {eval:?}");
    }

    #[tokio::test]
    async fn stale_verification_lowers_confidence() {
        let fixture = fixture().await;
        trust(&fixture, "peer", TrustStatus::Trusted).await;

        fixture.clock.advance(31 * 24 * 60 * 60 * 1_000);
        // 0.5 - 0.1 (no cert) - 0.1 (stale) = 0.3
        let eval = fixture.graph.evaluate_trust("peer", TrustContext::General).await.unwrap();
        assert!((eval.confidence - 0.3).abs() < 1e-9, "got {eval:?}");
    }

    #[tokio::test]
    async fn expired_relationship_short_circuits() {
        let fixture = fixture().await;
        fixture
            .truststore
            .set_trust_status(
                "peer",
                &"77".repeat(32),
                TrustStatus::Trusted,
                TrustOptions { valid_until: Some(T0 + 1_000), ..Default::default() },
            )
            .await
            .unwrap();

        fixture.clock.set(T0 + 2_000);
        let eval = fixture.graph.evaluate_trust("peer", TrustContext::General).await.unwrap();
        assert_eq!(eval.level, 0.0);
        assert_eq!(eval.confidence, 1.0);
        assert_eq!(eval.reason, "expired");
    }

    #[tokio::test]
    async fn file_transfer_requires_high_trust() {
        let fixture = fixture().await;
        trust(&fixture, "peer", TrustStatus::Pending).await;

        let eval = fixture.graph.evaluate_trust("peer", TrustContext::FileTransfer).await.unwrap();
        assert_eq!(eval.reason, "insufficient_trust_for_file_transfer");

        trust(&fixture, "peer", TrustStatus::Trusted).await;
        let eval = fixture.graph.evaluate_trust("peer", TrustContext::FileTransfer).await.unwrap();
        assert_eq!(eval.reason, "status_trusted");
    }

    #[tokio::test]
    async fn widest_path_beats_shorter_weaker_ones() {
        let fixture = fixture().await;
        let now = T0;
        // a → b → c strong, a → c weak direct.
        fixture.graph.upsert_edge(TrustEdge::new("a", "b", TrustEdgeLevel::Trusted, 0.9, now)).await;
        fixture.graph.upsert_edge(TrustEdge::new("b", "c", TrustEdgeLevel::Trusted, 0.8, now)).await;
        fixture.graph.upsert_edge(TrustEdge::new("a", "c", TrustEdgeLevel::Known, 0.3, now)).await;

        let path = fixture.graph.calculate_trust_path("a", "c", DEFAULT_MAX_PATH_DEPTH).await.unwrap();
        assert_eq!(path.path, vec!["a", "b", "c"]);
        assert_eq!(path.path_length, 2);
        assert!((path.total_trust - 0.8).abs() < 1e-9);
        assert!(path.is_valid);

        // The direct edge never has higher confidence than the reported
        // bottleneck.
        let bottleneck = path.bottleneck.unwrap();
        assert!((bottleneck.confidence - 0.8).abs() < 1e-9);
        assert!(0.3 <= bottleneck.confidence);
    }

    #[tokio::test]
    async fn revoked_edges_are_excluded_from_paths() {
        let fixture = fixture().await;
        fixture.graph.upsert_edge(TrustEdge::new("a", "b", TrustEdgeLevel::Trusted, 0.9, T0)).await;
        fixture.graph.upsert_edge(TrustEdge::new("b", "c", TrustEdgeLevel::Trusted, 0.9, T0)).await;

        assert!(fixture.graph.calculate_trust_path("a", "c", 6).await.is_some());
        assert!(fixture.graph.revoke_edge("b", "c", "dispute").await);
        assert!(fixture.graph.calculate_trust_path("a", "c", 6).await.is_none());
    }

    #[tokio::test]
    async fn path_respects_the_depth_bound() {
        let fixture = fixture().await;
        for (from, to) in [("a", "b"), ("b", "c"), ("c", "d")] {
            fixture
                .graph
                .upsert_edge(TrustEdge::new(from, to, TrustEdgeLevel::Trusted, 0.9, T0))
                .await;
        }

        assert!(fixture.graph.calculate_trust_path("a", "d", 2).await.is_none());
        assert!(fixture.graph.calculate_trust_path("a", "d", 3).await.is_some());
    }

    #[tokio::test]
    async fn social_graph_metrics_and_clusters() {
        let fixture = fixture().await;
        // Strong triangle a-b-c plus a weakly attached d.
        fixture.graph.upsert_edge(TrustEdge::new("a", "b", TrustEdgeLevel::Core, 0.9, T0)).await;
        fixture.graph.upsert_edge(TrustEdge::new("b", "c", TrustEdgeLevel::Trusted, 0.8, T0)).await;
        fixture.graph.upsert_edge(TrustEdge::new("c", "a", TrustEdgeLevel::Trusted, 0.75, T0)).await;
        fixture.graph.upsert_edge(TrustEdge::new("c", "d", TrustEdgeLevel::Known, 0.4, T0)).await;

        let graph = fixture.graph.build_social_graph().await;
        assert_eq!(graph.metrics.node_count, 4);
        assert_eq!(graph.metrics.edge_count, 4);
        assert_eq!(graph.metrics.cluster_count, 2);
        assert!(graph.clusters.contains(&vec![
            "a".to_string(),
            "b".to_string(),
            "c".to_string()
        ]));
        assert!(graph.clusters.contains(&vec!["d".to_string()]));

        let b = graph.nodes.iter().find(|n| n.id == "b").unwrap();
        assert_eq!(b.in_degree, 1);
        assert_eq!(b.out_degree, 1);
        // a → b → c is the single two-hop path through b.
        assert_eq!(b.centrality, 1);

        let expected_avg = (0.9 + 0.8 + 0.75 + 0.4) / 4.0;
        assert!((graph.metrics.average_confidence - expected_avg).abs() < 1e-9);
    }

    #[tokio::test]
    async fn trust_chain_is_breadth_first_and_bounded() {
        let fixture = fixture().await;
        let me = fixture.engine.local_identity();
        fixture
            .graph
            .upsert_edge(TrustEdge::new(me.clone(), "friend", TrustEdgeLevel::Trusted, 0.9, T0))
            .await;
        fixture
            .graph
            .upsert_edge(TrustEdge::new("friend", "acquaintance", TrustEdgeLevel::Known, 0.5, T0))
            .await;
        fixture
            .graph
            .upsert_edge(TrustEdge::new("acquaintance", "distant", TrustEdgeLevel::Invited, 0.2, T0))
            .await;

        let chain = fixture.graph.get_trust_chain(&me, 2).await.unwrap();
        assert_eq!(chain.len(), 3);
        assert_eq!(chain[0].identity, me);
        assert_eq!(chain[0].depth, 0);
        assert_eq!(chain[0].trust_level, TrustLevel::Own);
        assert_eq!(chain[1].identity, "friend");
        assert_eq!(chain[1].established_by.as_deref(), Some(me.as_str()));
        assert_eq!(chain[2].identity, "acquaintance");
        assert_eq!(chain[2].depth, 2);
        // depth 3 node is beyond the bound
        assert!(chain.iter().all(|n| n.identity != "distant"));
    }
}
