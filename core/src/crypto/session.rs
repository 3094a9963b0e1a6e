// Secure session engine: X25519 key agreement + key confirmation
//
// Flow per session id:
// 1. create_session: fresh X25519 secret, only the public half leaves
// 2. Public keys are exchanged out of band (pairing payload / QR)
// 3. complete_handshake: weak-key screen, ECDH, Blake3 KDF over the shared
//    secret and both public keys in canonical order
// 4. Each side sends generate_verification_payload(); the other runs
//    verify_incoming_payload() to confirm both derived the same key
//
// The derived key never leaves this module. The transfer engine asks the
// engine to seal/open chunks by session id.

use super::envelope::{self, EnvelopeError};
use super::is_weak_key;
use crate::config::SessionConfig;
use crate::transport::{TransportError, TransportGateway, TransportKind};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// KDF context for session keys. Changing it breaks pairing with older peers.
const SESSION_KDF_CONTEXT: &str = "beamdrop v1 session key 2026-10-19";
/// KDF context for keys handed to the transport layer
const TRANSPORT_KDF_CONTEXT: &str = "beamdrop v1 transport link key 2026-10-19";
/// Fixed probe both sides encrypt to prove key agreement
const VERIFICATION_PROBE: &[u8] = b"beamdrop-handshake-verification-v1";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session already exists: {0}")]
    AlreadyExists(String),
    #[error("Session not found: {0}")]
    NotFound(String),
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),
    #[error("Remote public key failed the weak-key screen")]
    WeakKey,
    #[error("Handshake already completed for session {0}")]
    HandshakeAlreadyComplete(String),
    #[error("Handshake not complete for session {0}")]
    HandshakeIncomplete(String),
    #[error("Handshake verification failed for session {0}")]
    VerificationFailed(String),
    #[error("Timed out waiting for handshake on session {0}")]
    Timeout(String),
    #[error("Envelope error: {0}")]
    Envelope(#[from] EnvelopeError),
    #[error("Transport rejected encryption key")]
    KeyRejected,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Public view of a session; never carries key material
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub session_id: String,
    pub peer_device_id: String,
    pub local_public_key: String,
    pub remote_public_key: Option<String>,
    pub handshake_complete: bool,
    pub verified: bool,
    pub connection_method: Option<TransportKind>,
    pub created_at: u64,
}

/// What a device shows (e.g. as a QR code) so a peer can complete the handshake
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairingPayload {
    pub session_id: String,
    pub device_id: String,
    pub public_key: String,
    pub connection_method: Option<TransportKind>,
}

impl PairingPayload {
    pub fn to_json(&self) -> String {
        // Plain struct of strings, serialization cannot fail
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_json(raw: &str) -> Result<Self, SessionError> {
        serde_json::from_str(raw).map_err(|e| SessionError::InvalidPublicKey(e.to_string()))
    }

    pub fn public_key_bytes(&self) -> Result<[u8; 32], SessionError> {
        let bytes = hex::decode(&self.public_key)
            .map_err(|e| SessionError::InvalidPublicKey(e.to_string()))?;
        bytes
            .as_slice()
            .try_into()
            .map_err(|_| SessionError::InvalidPublicKey(format!("expected 32 bytes, got {}", bytes.len())))
    }
}

struct SecureSession {
    session_id: String,
    peer_device_id: String,
    connection_method: Option<TransportKind>,
    local_secret: StaticSecret,
    local_public: PublicKey,
    remote_public: Option<[u8; 32]>,
    derived_key: Option<Zeroizing<[u8; 32]>>,
    handshake_complete: bool,
    verified: bool,
    created_at: u64,
}

impl SecureSession {
    fn info(&self) -> SessionInfo {
        SessionInfo {
            session_id: self.session_id.clone(),
            peer_device_id: self.peer_device_id.clone(),
            local_public_key: hex::encode(self.local_public.as_bytes()),
            remote_public_key: self.remote_public.map(hex::encode),
            handshake_complete: self.handshake_complete,
            verified: self.verified,
            connection_method: self.connection_method,
            created_at: self.created_at,
        }
    }

    fn key(&self) -> Result<&[u8; 32], SessionError> {
        match (&self.derived_key, self.handshake_complete) {
            (Some(key), true) => Ok(key),
            _ => Err(SessionError::HandshakeIncomplete(self.session_id.clone())),
        }
    }

    /// Key material goes first
    fn wipe(&mut self) {
        self.derived_key.take();
        self.handshake_complete = false;
        self.verified = false;
    }
}

struct SessionSlot {
    session: Mutex<SecureSession>,
    ready: watch::Sender<bool>,
}

/// Verification probes are bound to the session and to the sealing device
fn probe_aad(session_id: &str, sender_device_id: &str) -> Vec<u8> {
    let mut aad = Vec::with_capacity(session_id.len() + sender_device_id.len() + 1);
    aad.extend_from_slice(session_id.as_bytes());
    aad.push(0);
    aad.extend_from_slice(sender_device_id.as_bytes());
    aad
}

pub struct SessionEngine {
    local_device_id: String,
    config: SessionConfig,
    sessions: RwLock<HashMap<String, Arc<SessionSlot>>>,
}

impl SessionEngine {
    pub fn new(local_device_id: impl Into<String>, config: SessionConfig) -> Self {
        Self {
            local_device_id: local_device_id.into(),
            config,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>, SessionError> {
        self.sessions
            .read()
            .get(session_id)
            .cloned()
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))
    }

    pub fn create_session(
        &self,
        session_id: &str,
        peer_device_id: &str,
        connection_method: Option<TransportKind>,
    ) -> Result<SessionInfo, SessionError> {
        let mut sessions = self.sessions.write();
        if sessions.contains_key(session_id) {
            return Err(SessionError::AlreadyExists(session_id.to_string()));
        }

        let local_secret = StaticSecret::random_from_rng(rand::rngs::OsRng);
        let local_public = PublicKey::from(&local_secret);
        let session = SecureSession {
            session_id: session_id.to_string(),
            peer_device_id: peer_device_id.to_string(),
            connection_method,
            local_secret,
            local_public,
            remote_public: None,
            derived_key: None,
            handshake_complete: false,
            verified: false,
            created_at: crate::now_millis(),
        };
        let info = session.info();
        let (ready, _) = watch::channel(false);
        sessions.insert(
            session_id.to_string(),
            Arc::new(SessionSlot {
                session: Mutex::new(session),
                ready,
            }),
        );

        debug!(session_id, peer_device_id, "created secure session");
        Ok(info)
    }

    pub fn session_info(&self, session_id: &str) -> Option<SessionInfo> {
        self.slot(session_id).ok().map(|slot| slot.session.lock().info())
    }

    pub fn pairing_payload(&self, session_id: &str) -> Result<PairingPayload, SessionError> {
        let slot = self.slot(session_id)?;
        let session = slot.session.lock();
        Ok(PairingPayload {
            session_id: session.session_id.clone(),
            device_id: self.local_device_id.clone(),
            public_key: hex::encode(session.local_public.as_bytes()),
            connection_method: session.connection_method,
        })
    }

    pub fn complete_handshake(
        &self,
        session_id: &str,
        remote_public_key: &[u8],
    ) -> Result<SessionInfo, SessionError> {
        let remote: [u8; 32] = remote_public_key.try_into().map_err(|_| {
            SessionError::InvalidPublicKey(format!(
                "expected 32 bytes, got {}",
                remote_public_key.len()
            ))
        })?;
        if is_weak_key(&remote) {
            warn!(session_id, "rejected weak remote public key");
            return Err(SessionError::WeakKey);
        }

        let slot = self.slot(session_id)?;
        let info = {
            let mut session = slot.session.lock();
            if session.handshake_complete {
                return Err(SessionError::HandshakeAlreadyComplete(session_id.to_string()));
            }

            let shared = session.local_secret.diffie_hellman(&PublicKey::from(remote));
            if !shared.was_contributory() {
                warn!(session_id, "key agreement produced a non-contributory secret");
                return Err(SessionError::WeakKey);
            }

            let local = *session.local_public.as_bytes();
            let (first, second) = if local <= remote { (local, remote) } else { (remote, local) };
            let mut hasher = blake3::Hasher::new_derive_key(SESSION_KDF_CONTEXT);
            hasher.update(shared.as_bytes());
            hasher.update(&first);
            hasher.update(&second);
            let key = Zeroizing::new(*hasher.finalize().as_bytes());

            session.remote_public = Some(remote);
            session.derived_key = Some(key);
            session.handshake_complete = true;
            session.info()
        };

        slot.ready.send_replace(true);
        info!(session_id, "secure session handshake complete");
        Ok(info)
    }

    pub fn complete_handshake_from_payload(
        &self,
        session_id: &str,
        payload: &PairingPayload,
    ) -> Result<SessionInfo, SessionError> {
        self.complete_handshake(session_id, &payload.public_key_bytes()?)
    }

    pub fn is_ready(&self, session_id: &str) -> bool {
        self.slot(session_id)
            .map(|slot| slot.session.lock().key().is_ok())
            .unwrap_or(false)
    }

    /// Wait (bounded) until the session's handshake completes
    pub async fn wait_for_handshake(&self, session_id: &str) -> Result<(), SessionError> {
        let mut ready = self.slot(session_id)?.ready.subscribe();
        let timeout = Duration::from_secs(self.config.handshake_timeout_secs);
        let outcome = tokio::time::timeout(timeout, ready.wait_for(|done| *done))
            .await
            .map(|waited| waited.map(|_| ()));
        match outcome {
            Ok(Ok(())) => Ok(()),
            // sender dropped: the session ended while we waited
            Ok(Err(_)) => Err(SessionError::NotFound(session_id.to_string())),
            Err(_) => Err(SessionError::Timeout(session_id.to_string())),
        }
    }

    pub fn generate_verification_payload(&self, session_id: &str) -> Result<Vec<u8>, SessionError> {
        let slot = self.slot(session_id)?;
        let session = slot.session.lock();
        let key = session.key()?;
        let aad = probe_aad(session_id, &self.local_device_id);
        Ok(envelope::seal(key, &aad, VERIFICATION_PROBE)?)
    }

    /// True only when the payload was sealed under the same derived key by
    /// the session's peer; a probe echoed back from this side does not open
    pub fn verify_incoming_payload(&self, session_id: &str, payload: &[u8]) -> bool {
        let Ok(slot) = self.slot(session_id) else {
            return false;
        };
        let session = slot.session.lock();
        let Ok(key) = session.key() else {
            return false;
        };
        let aad = probe_aad(session_id, &session.peer_device_id);
        matches!(
            envelope::open(key, &aad, payload),
            Ok(probe) if probe == VERIFICATION_PROBE
        )
    }

    /// Verification step of the pairing flow; a mismatch aborts pairing
    pub fn confirm_peer(&self, session_id: &str, payload: &[u8]) -> Result<SessionInfo, SessionError> {
        if !self.verify_incoming_payload(session_id, payload) {
            warn!(session_id, "peer verification payload mismatch");
            return Err(SessionError::VerificationFailed(session_id.to_string()));
        }
        let slot = self.slot(session_id)?;
        let mut session = slot.session.lock();
        session.verified = true;
        Ok(session.info())
    }

    pub fn seal(&self, session_id: &str, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, SessionError> {
        let slot = self.slot(session_id)?;
        let session = slot.session.lock();
        Ok(envelope::seal(session.key()?, aad, plaintext)?)
    }

    pub fn open(&self, session_id: &str, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, SessionError> {
        let slot = self.slot(session_id)?;
        let session = slot.session.lock();
        Ok(envelope::open(session.key()?, aad, sealed)?)
    }

    /// Hand a link key derived from the session key to the transport layer
    pub async fn install_transport_key(
        &self,
        session_id: &str,
        gateway: &dyn TransportGateway,
        connection_token: &str,
    ) -> Result<(), SessionError> {
        let link_key = {
            let slot = self.slot(session_id)?;
            let session = slot.session.lock();
            Zeroizing::new(blake3::derive_key(TRANSPORT_KDF_CONTEXT, session.key()?))
        };
        if is_weak_key(link_key.as_ref()) {
            return Err(SessionError::WeakKey);
        }

        if gateway.set_encryption_key(connection_token, link_key.as_ref()).await? {
            debug!(session_id, "installed transport link key");
            Ok(())
        } else {
            Err(SessionError::KeyRejected)
        }
    }

    /// Tear a session down; its key is wiped before the session is dropped
    pub fn end_session(&self, session_id: &str) -> bool {
        let Some(slot) = self.sessions.write().remove(session_id) else {
            return false;
        };
        slot.session.lock().wipe();
        slot.ready.send_replace(false);
        info!(session_id, "secure session ended");
        true
    }

    pub fn active_sessions(&self) -> usize {
        self.sessions.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalGateway;

    fn engine(name: &str) -> SessionEngine {
        SessionEngine::new(name, SessionConfig::default())
    }

    fn paired() -> (SessionEngine, SessionEngine) {
        let alice = engine("alice");
        let bob = engine("bob");
        alice.create_session("s1", "bob", Some(TransportKind::WifiAware)).unwrap();
        bob.create_session("s1", "alice", Some(TransportKind::WifiAware)).unwrap();

        let alice_pub = alice.pairing_payload("s1").unwrap();
        let bob_pub = bob.pairing_payload("s1").unwrap();
        alice.complete_handshake_from_payload("s1", &bob_pub).unwrap();
        bob.complete_handshake_from_payload("s1", &alice_pub).unwrap();
        (alice, bob)
    }

    #[test]
    fn test_mutual_verification_succeeds() {
        let (alice, bob) = paired();
        let from_alice = alice.generate_verification_payload("s1").unwrap();
        let from_bob = bob.generate_verification_payload("s1").unwrap();

        assert!(bob.verify_incoming_payload("s1", &from_alice));
        assert!(alice.verify_incoming_payload("s1", &from_bob));
        assert!(bob.confirm_peer("s1", &from_alice).unwrap().verified);
    }

    #[test]
    fn test_echoed_verification_payload_is_rejected() {
        let (alice, bob) = paired();
        let from_alice = alice.generate_verification_payload("s1").unwrap();

        // Same key, but sealed by alice herself
        assert!(!alice.verify_incoming_payload("s1", &from_alice));
        assert!(matches!(
            alice.confirm_peer("s1", &from_alice),
            Err(SessionError::VerificationFailed(_))
        ));
        assert!(bob.verify_incoming_payload("s1", &from_alice));
    }

    #[test]
    fn test_mismatched_key_fails_verification() {
        let alice = engine("alice");
        let bob = engine("bob");
        let mallory = engine("mallory");
        alice.create_session("s1", "bob", None).unwrap();
        bob.create_session("s1", "alice", None).unwrap();
        mallory.create_session("s1", "alice", None).unwrap();

        let bob_pub = bob.pairing_payload("s1").unwrap();
        let mallory_pub = mallory.pairing_payload("s1").unwrap();
        let alice_pub = alice.pairing_payload("s1").unwrap();

        // Alice got Mallory's key instead of Bob's
        alice.complete_handshake_from_payload("s1", &mallory_pub).unwrap();
        bob.complete_handshake_from_payload("s1", &alice_pub).unwrap();
        let _ = bob_pub;

        let from_alice = alice.generate_verification_payload("s1").unwrap();
        assert!(!bob.verify_incoming_payload("s1", &from_alice));
        assert!(matches!(
            bob.confirm_peer("s1", &from_alice),
            Err(SessionError::VerificationFailed(_))
        ));
    }

    #[test]
    fn test_duplicate_session_rejected() {
        let alice = engine("alice");
        alice.create_session("s1", "bob", None).unwrap();
        assert!(matches!(
            alice.create_session("s1", "bob", None),
            Err(SessionError::AlreadyExists(_))
        ));
    }

    #[test]
    fn test_weak_and_malformed_keys_rejected() {
        let alice = engine("alice");
        alice.create_session("s1", "bob", None).unwrap();

        assert!(matches!(alice.complete_handshake("s1", &[0u8; 32]), Err(SessionError::WeakKey)));
        assert!(matches!(alice.complete_handshake("s1", &[9u8; 32]), Err(SessionError::WeakKey)));
        assert!(matches!(
            alice.complete_handshake("s1", &[1u8; 16]),
            Err(SessionError::InvalidPublicKey(_))
        ));

        // u = 1 is a low-order point: passes the byte screen, fails contributory check
        let mut low_order = [0u8; 32];
        low_order[0] = 1;
        assert!(matches!(alice.complete_handshake("s1", &low_order), Err(SessionError::WeakKey)));
        assert!(!alice.is_ready("s1"));
    }

    #[test]
    fn test_seal_requires_handshake() {
        let alice = engine("alice");
        alice.create_session("s1", "bob", None).unwrap();
        assert!(matches!(
            alice.seal("s1", b"", b"data"),
            Err(SessionError::HandshakeIncomplete(_))
        ));
        assert!(alice.generate_verification_payload("s1").is_err());
    }

    #[test]
    fn test_seal_open_across_peers() {
        let (alice, bob) = paired();
        let sealed = alice.seal("s1", b"chunk-0", b"payload").unwrap();
        assert_eq!(bob.open("s1", b"chunk-0", &sealed).unwrap(), b"payload");
    }

    #[test]
    fn test_end_session_wipes_key() {
        let (alice, _bob) = paired();
        assert!(alice.end_session("s1"));
        assert!(!alice.is_ready("s1"));
        assert!(matches!(alice.seal("s1", b"", b"x"), Err(SessionError::NotFound(_))));
        assert!(!alice.end_session("s1"));
        assert_eq!(alice.active_sessions(), 0);
    }

    #[test]
    fn test_pairing_payload_json_roundtrip() {
        let alice = engine("alice");
        alice.create_session("s1", "bob", Some(TransportKind::Ble)).unwrap();
        let payload = alice.pairing_payload("s1").unwrap();
        let parsed = PairingPayload::from_json(&payload.to_json()).unwrap();
        assert_eq!(parsed, payload);
        assert_eq!(parsed.device_id, "alice");
        assert_eq!(parsed.public_key_bytes().unwrap().len(), 32);
    }

    #[tokio::test]
    async fn test_wait_for_handshake_resolves() {
        let alice = Arc::new(engine("alice"));
        let bob = engine("bob");
        alice.create_session("s1", "bob", None).unwrap();
        bob.create_session("s1", "alice", None).unwrap();
        let bob_pub = bob.pairing_payload("s1").unwrap();

        let waiter = {
            let alice = alice.clone();
            tokio::spawn(async move { alice.wait_for_handshake("s1").await })
        };
        alice.complete_handshake_from_payload("s1", &bob_pub).unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_handshake_times_out() {
        let alice = SessionEngine::new("alice", SessionConfig { handshake_timeout_secs: 0 });
        alice.create_session("s1", "bob", None).unwrap();
        assert!(matches!(
            alice.wait_for_handshake("s1").await,
            Err(SessionError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_install_transport_key() {
        let (alice, _bob) = paired();
        let gateway = LocalGateway::new();
        alice.install_transport_key("s1", &gateway, "tok").await.unwrap();
        assert_eq!(gateway.installed_keys(), 1);
    }
}
