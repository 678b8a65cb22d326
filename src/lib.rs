//! # Trustmesh - Decentralized Certificate Authority and Trust Fabric
//!
//! Every participating instance is itself a CA: it mints, extends, reduces
//! and revokes time-bound certificates, chains them to a self-signed local
//! root, evaluates multi-factor trust across a social graph, and exposes the
//! same attestations both as native content-addressed objects (for
//! peer-to-peer sync) and as W3C Verifiable Credentials in JSON-LD (for
//! external interoperability). The bridge between the two representations is
//! lossless at the data level: every certificate round-trips through its
//! credential view.
//!
//! ## Architecture
//!
//! The core holds no global mutable state. Each CA is an instance with an
//! explicit lifecycle; external collaborators (keychain, object store, peer
//! transport, delivery channels) are reached through narrow async ports, and
//! long-lived work runs in owned background tasks wired by channels.
//!
//! ## Security Model
//!
//! - Signatures are Ed25519 over a canonical serialization with the
//!   signature field elided; the same bytes feed content hashes.
//! - The root certificate is self-signed; chains terminate at it and fail
//!   closed on any structural inconsistency.
//! - Private keys never cross the keychain boundary.
//! - Stored versions are immutable and strictly monotonic; receivers
//!   reconcile imports by version.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|---------|
//! | `engine` | CA lifecycle, issuance, version transitions, verification |
//! | `certificate` | Certificate model, durations, status derivation |
//! | `canonical` | Canonical JSON, SHA-256 hashing, Ed25519-2020 proof codec |
//! | `did` | `did:one:sha256` codec |
//! | `vc` | Certificate ↔ Verifiable Credential bridge, JSON-LD wire form |
//! | `truststore` | Device-level trust relationships |
//! | `trustgraph` | Social edges, evaluator, paths, graph metrics |
//! | `propagation` | Internal sync loop + external VC export/import |
//! | `audit` | Append-only audit log with filtered queries |
//! | `ports` | Traits for the external collaborators |
//! | `memory` | In-memory reference implementations of the ports |
//! | `error` | Structured error kinds with stable codes |

pub mod audit;
pub mod canonical;
pub mod certificate;
pub mod did;
pub mod engine;
pub mod error;
pub mod memory;
pub mod ports;
pub mod propagation;
pub mod trustgraph;
pub mod truststore;
pub mod vc;

pub use audit::{AuditEvent, AuditEventType, AuditLog, AuditQuery};
pub use certificate::{
    parse_duration, Certificate, CertificateKind, CertificateStatus, DeviceTrustClaims,
    DeviceTrustLevel,
};
pub use engine::{
    CaConfig, CaEngine, CaEvent, CaState, ChainFailure, ChainReport, HistoryEntry, IssueRequest,
    Transition, VerificationFailure, VerificationReport,
};
pub use error::TrustError;
pub use ports::{
    Clock, ExternalDelivery, Keychain, ObjectStore, PeerTransport, SystemClock, VersionedRecord,
};
pub use propagation::{
    ExportChannel, ExportOptions, ExportedVc, ImportResult, PropagationService, SyncStatus,
};
pub use trustgraph::{
    SocialGraph, TrustContext, TrustEdge, TrustEdgeLevel, TrustEvaluation, TrustGraph, TrustPath,
};
pub use truststore::{
    TrustChanged, TrustLevel, TrustOptions, TrustRelationship, TrustStatus, TrustStore,
};
pub use vc::{cert_to_vc, export_json_ld, import_json_ld, vc_to_cert, VerifiableCredential};
