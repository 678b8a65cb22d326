//! # External Collaborator Ports
//!
//! Trait definitions for the surfaces the core consumes but does not own.
//! Implementations live elsewhere (platform glue, a real store, a real
//! transport); the in-memory reference implementations are in
//! [`crate::memory`].
//!
//! | Collaborator | Trait | Purpose |
//! |--------------|-------|---------|
//! | Keychain | [`Keychain`] | Sign/verify and key lookup without exposing private keys |
//! | Object store | [`ObjectStore`] | Content-addressed, versioned persistence with reverse maps |
//! | Peer transport | [`PeerTransport`] | Delivery of new object versions to connected instances |
//! | Delivery | [`ExternalDelivery`] | Out-of-band channels for exported credentials |
//! | Clock | [`Clock`] | Injected time source so tests can pin `t0` |
//!
//! Traits are defined here, separately from implementations, so core modules
//! depend only on the contract and no dependency cycles form.
//!
//! The keychain contract deliberately covers only what the core consumes:
//! identity, public keys, signing, verification and nonce generation. The
//! encrypt/decrypt half of a full keychain stays with the transport layer.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::TrustError;

/// One stored version of a versioned entity.
///
/// `bytes` is the canonical serialization of the version; `content_hash`
/// addresses exactly these bytes, while `identity_hash` is shared by every
/// version of the entity. `indexes` are `(name, key)` pairs the store must
/// answer reverse-map queries for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub identity_hash: String,
    pub content_hash: String,
    pub version: u64,
    pub bytes: Vec<u8>,
    pub indexes: Vec<(String, String)>,
}

/// Signing keychain. Private key material never crosses this boundary.
#[async_trait]
pub trait Keychain: Send + Sync {
    /// Identity hash of this instance (hash of its signing public key).
    fn local_identity(&self) -> String;

    /// This instance's signing public key, hex.
    async fn public_key(&self) -> Result<String, TrustError>;

    /// Look up a known public key for another identity, hex.
    ///
    /// This is the seam a handshake or directory layer populates; the core
    /// only reads from it.
    async fn known_public_key(&self, identity: &str) -> Option<String>;

    /// Sign with this instance's private key. Returns the raw 64-byte
    /// Ed25519 signature.
    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, TrustError>;

    /// Verify a raw signature against a hex public key.
    async fn verify(
        &self,
        public_key_hex: &str,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, TrustError>;

    /// Fresh random nonce from the keychain's entropy source.
    async fn random_nonce(&self) -> [u8; 32];
}

/// Content-addressed, versioned object store.
///
/// Persistence is atomic at version granularity: a `put` either stores the
/// whole record or nothing. Stored versions are immutable; the store must
/// reject any write that does not strictly increase `version` for an
/// identity hash.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Persist one version. Fails with `StoreFailure` on non-monotonic
    /// versions or storage errors.
    async fn put(&self, record: VersionedRecord) -> Result<(), TrustError>;

    /// Highest-version record for an identity hash.
    async fn latest(&self, identity_hash: &str) -> Result<Option<VersionedRecord>, TrustError>;

    /// Every stored version for an identity hash, ascending.
    async fn versions(&self, identity_hash: &str) -> Result<Vec<VersionedRecord>, TrustError>;

    /// Look up one exact version by its content hash.
    async fn by_content_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<VersionedRecord>, TrustError>;

    /// Reverse-map query: latest versions of all entities indexed under
    /// `(index, key)`.
    async fn reverse_lookup(
        &self,
        index: &str,
        key: &str,
    ) -> Result<Vec<VersionedRecord>, TrustError>;
}

/// Peer transport for automatic propagation between connected instances.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Whether any peer connection is currently up.
    async fn is_connected(&self) -> bool;

    /// Deliver an encoded object version to connected peers.
    async fn deliver(&self, payload: Vec<u8>) -> Result<(), TrustError>;
}

/// Out-of-band delivery channels for exported credentials.
#[async_trait]
pub trait ExternalDelivery: Send + Sync {
    /// Render a JSON-LD document into a QR payload.
    async fn render_qr(&self, json_ld: &str) -> Result<Vec<u8>, TrustError>;

    /// Hand a JSON-LD document to the mail system.
    async fn send_email(&self, address: &str, json_ld: &str) -> Result<(), TrustError>;

    /// Write a JSON-LD document to a file path.
    async fn write_file(&self, path: &str, json_ld: &str) -> Result<(), TrustError>;

    /// PUT a JSON-LD document to an HTTPS endpoint. The only delivery with a
    /// timeout; implementations return `TimedOut` when it elapses.
    async fn put_https(
        &self,
        url: &str,
        json_ld: &str,
        timeout: Duration,
    ) -> Result<(), TrustError>;
}

/// Injected time source. All core timestamps flow through this.
pub trait Clock: Send + Sync {
    /// Current time, milliseconds since Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall-clock implementation of [`Clock`].
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}
