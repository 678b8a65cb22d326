//! # In-Memory Reference Ports
//!
//! Reference implementations of the [`crate::ports`] traits backed by plain
//! in-process state. They serve two purposes:
//!
//! - the test substrate for every integration scenario, and
//! - the embedding story for hosts that bring their own persistence later.
//!
//! Nothing here touches the filesystem or the network. The store still
//! enforces the monotonic-version contract so tests exercise the same
//! rejection paths a real store would produce.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use ed25519_dalek::{Signer, SigningKey};
use rand::rngs::OsRng;
use tokio::sync::RwLock;

use crate::canonical::{sha256_hex, verify_ed25519};
use crate::error::TrustError;
use crate::ports::{Clock, ExternalDelivery, Keychain, ObjectStore, PeerTransport, VersionedRecord};

// ============================================================================
// Keychain
// ============================================================================

/// Keychain holding one Ed25519 signing key plus a learned-keys directory.
///
/// The instance identity is the SHA-256 hash of the signing public key, so
/// identity and key are bound without a registration step.
pub struct MemoryKeychain {
    signing_key: SigningKey,
    identity: String,
    public_key_hex: String,
    known_keys: RwLock<HashMap<String, String>>,
}

impl MemoryKeychain {
    /// Generate a fresh keychain with a random signing key.
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut OsRng))
    }

    /// Deterministic keychain for tests.
    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(bytes))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public = signing_key.verifying_key().to_bytes();
        Self {
            signing_key,
            identity: sha256_hex(&public),
            public_key_hex: hex::encode(public),
            known_keys: RwLock::new(HashMap::new()),
        }
    }

    /// Teach this keychain another identity's public key.
    ///
    /// This is what a handshake or directory integration would do; tests use
    /// it to let instance B verify credentials exported by instance A.
    pub async fn learn_key(&self, identity: impl Into<String>, public_key_hex: impl Into<String>) {
        self.known_keys
            .write()
            .await
            .insert(identity.into(), public_key_hex.into());
    }
}

impl std::fmt::Debug for MemoryKeychain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryKeychain")
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Keychain for MemoryKeychain {
    fn local_identity(&self) -> String {
        self.identity.clone()
    }

    async fn public_key(&self) -> Result<String, TrustError> {
        Ok(self.public_key_hex.clone())
    }

    async fn known_public_key(&self, identity: &str) -> Option<String> {
        if identity == self.identity {
            return Some(self.public_key_hex.clone());
        }
        self.known_keys.read().await.get(identity).cloned()
    }

    async fn sign(&self, message: &[u8]) -> Result<Vec<u8>, TrustError> {
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }

    async fn verify(
        &self,
        public_key_hex: &str,
        message: &[u8],
        signature: &[u8],
    ) -> Result<bool, TrustError> {
        Ok(verify_ed25519(public_key_hex, message, &hex::encode(signature)).is_ok())
    }

    async fn random_nonce(&self) -> [u8; 32] {
        let mut nonce = [0u8; 32];
        // OS entropy failure here would mean a broken platform RNG; fall back
        // to zeroes rather than panic inside a port.
        let _ = getrandom::getrandom(&mut nonce);
        nonce
    }
}

// ============================================================================
// Object Store
// ============================================================================

#[derive(Default)]
struct StoreState {
    /// identity hash → version → record
    objects: HashMap<String, BTreeMap<u64, VersionedRecord>>,
    /// content hash → (identity hash, version)
    by_content: HashMap<String, (String, u64)>,
    /// (index name, key) → identity hashes
    reverse: HashMap<(String, String), Vec<String>>,
}

/// In-memory versioned object store enforcing strict version monotonicity.
#[derive(Default)]
pub struct MemoryStore {
    state: RwLock<StoreState>,
    fail_puts: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail with `StoreFailure`. Tests use this
    /// to exercise the surfaced-failure paths.
    pub fn fail_puts(&self, fail: bool) {
        self.fail_puts.store(fail, Ordering::SeqCst);
    }

    /// Number of distinct stored entities.
    pub async fn entity_count(&self) -> usize {
        self.state.read().await.objects.len()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn put(&self, record: VersionedRecord) -> Result<(), TrustError> {
        if self.fail_puts.load(Ordering::SeqCst) {
            return Err(TrustError::StoreFailure { detail: "injected failure".to_string() });
        }

        let mut state = self.state.write().await;
        let versions = state.objects.entry(record.identity_hash.clone()).or_default();
        if let Some((&latest, _)) = versions.iter().next_back() {
            if record.version <= latest {
                return Err(TrustError::StoreFailure {
                    detail: format!(
                        "non-monotonic version {} for {}, latest is {latest}",
                        record.version, record.identity_hash
                    ),
                });
            }
        }

        let identity_hash = record.identity_hash.clone();
        let content_hash = record.content_hash.clone();
        let version = record.version;
        let indexes = record.indexes.clone();
        versions.insert(version, record);

        state
            .by_content
            .insert(content_hash, (identity_hash.clone(), version));
        for (index, key) in indexes {
            let entry = state.reverse.entry((index, key)).or_default();
            if !entry.contains(&identity_hash) {
                entry.push(identity_hash.clone());
            }
        }
        Ok(())
    }

    async fn latest(&self, identity_hash: &str) -> Result<Option<VersionedRecord>, TrustError> {
        let state = self.state.read().await;
        Ok(state
            .objects
            .get(identity_hash)
            .and_then(|versions| versions.values().next_back().cloned()))
    }

    async fn versions(&self, identity_hash: &str) -> Result<Vec<VersionedRecord>, TrustError> {
        let state = self.state.read().await;
        Ok(state
            .objects
            .get(identity_hash)
            .map(|versions| versions.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn by_content_hash(
        &self,
        content_hash: &str,
    ) -> Result<Option<VersionedRecord>, TrustError> {
        let state = self.state.read().await;
        let Some((identity_hash, version)) = state.by_content.get(content_hash) else {
            return Ok(None);
        };
        Ok(state
            .objects
            .get(identity_hash)
            .and_then(|versions| versions.get(version))
            .cloned())
    }

    async fn reverse_lookup(
        &self,
        index: &str,
        key: &str,
    ) -> Result<Vec<VersionedRecord>, TrustError> {
        let state = self.state.read().await;
        let Some(hashes) = state.reverse.get(&(index.to_string(), key.to_string())) else {
            return Ok(Vec::new());
        };
        let mut records = Vec::with_capacity(hashes.len());
        for hash in hashes {
            if let Some(record) = state
                .objects
                .get(hash)
                .and_then(|versions| versions.values().next_back())
            {
                records.push(record.clone());
            }
        }
        Ok(records)
    }
}

// ============================================================================
// Peer Transport
// ============================================================================

/// Recording transport with failure and offline injection.
#[derive(Default)]
pub struct MemoryTransport {
    delivered: RwLock<Vec<Vec<u8>>>,
    connected: AtomicBool,
    fail_next: AtomicU32,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self {
            delivered: RwLock::new(Vec::new()),
            connected: AtomicBool::new(true),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Toggle the simulated connection state.
    pub fn set_connected(&self, connected: bool) {
        self.connected.store(connected, Ordering::SeqCst);
    }

    /// Fail the next `count` deliveries with `TransportOffline`.
    pub fn fail_next(&self, count: u32) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Payloads delivered so far, in order.
    pub async fn delivered(&self) -> Vec<Vec<u8>> {
        self.delivered.read().await.clone()
    }
}

#[async_trait]
impl PeerTransport for MemoryTransport {
    async fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn deliver(&self, payload: Vec<u8>) -> Result<(), TrustError> {
        if self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TrustError::TransportOffline);
        }
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TrustError::TransportOffline);
        }
        self.delivered.write().await.push(payload);
        Ok(())
    }
}

// ============================================================================
// External Delivery
// ============================================================================

/// Delivery port that records every hand-off instead of performing it.
#[derive(Default)]
pub struct RecordingDelivery {
    emails: RwLock<Vec<(String, String)>>,
    files: RwLock<Vec<(String, String)>>,
    puts: RwLock<Vec<(String, String)>>,
}

impl RecordingDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn emails(&self) -> Vec<(String, String)> {
        self.emails.read().await.clone()
    }

    pub async fn files(&self) -> Vec<(String, String)> {
        self.files.read().await.clone()
    }

    pub async fn puts(&self) -> Vec<(String, String)> {
        self.puts.read().await.clone()
    }
}

#[async_trait]
impl ExternalDelivery for RecordingDelivery {
    async fn render_qr(&self, json_ld: &str) -> Result<Vec<u8>, TrustError> {
        Ok(json_ld.as_bytes().to_vec())
    }

    async fn send_email(&self, address: &str, json_ld: &str) -> Result<(), TrustError> {
        self.emails
            .write()
            .await
            .push((address.to_string(), json_ld.to_string()));
        Ok(())
    }

    async fn write_file(&self, path: &str, json_ld: &str) -> Result<(), TrustError> {
        self.files
            .write()
            .await
            .push((path.to_string(), json_ld.to_string()));
        Ok(())
    }

    async fn put_https(
        &self,
        url: &str,
        json_ld: &str,
        _timeout: Duration,
    ) -> Result<(), TrustError> {
        self.puts
            .write()
            .await
            .push((url.to_string(), json_ld.to_string()));
        Ok(())
    }
}

// ============================================================================
// Test Clock
// ============================================================================

/// Manually advanced clock so scenarios can pin `t0`.
pub struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    pub fn at(now_ms: u64) -> Self {
        Self { now: AtomicU64::new(now_ms) }
    }

    pub fn set(&self, now_ms: u64) {
        self.now.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.now.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}
