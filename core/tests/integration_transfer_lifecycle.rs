//! Two engines paired over a local gateway: encrypted send, pause at ~30%,
//! resume from the acknowledged offset, cancel while paused and send again.

use beamdrop_core::checksum::{hash_file_chunked, ChecksumService};
use beamdrop_core::config::{ChecksumConfig, RateLimitConfig, SessionConfig, TransferConfig};
use beamdrop_core::crypto::SessionEngine;
use beamdrop_core::ratelimit::RateLimiter;
use beamdrop_core::store::MemoryStorage;
use beamdrop_core::transfer::{ChunkFrame, TransferEngine, TransferError, TransferProgress, TransferRequest, TransferStatus};
use beamdrop_core::transport::LocalGateway;
use rand::RngCore;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

const SESSION: &str = "session-ab";
const TEN_MIB: usize = 10 * 1024 * 1024;

struct Peer {
    gateway: Arc<LocalGateway>,
    sessions: Arc<SessionEngine>,
    engine: Arc<TransferEngine>,
}

fn peer(device_id: &str) -> Peer {
    let gateway = Arc::new(LocalGateway::new());
    let backend = Arc::new(MemoryStorage::new());
    let sessions = Arc::new(SessionEngine::new(device_id, SessionConfig::default()));
    let engine = Arc::new(TransferEngine::new(
        gateway.clone(),
        sessions.clone(),
        Arc::new(ChecksumService::new(backend.clone(), ChecksumConfig::default())),
        Arc::new(RateLimiter::new(RateLimitConfig::default())),
        backend,
        TransferConfig::default(),
        device_id,
    ));
    Peer {
        gateway,
        sessions,
        engine,
    }
}

fn pair(a: &Peer, b: &Peer) {
    a.sessions.create_session(SESSION, "bob", None).unwrap();
    b.sessions.create_session(SESSION, "alice", None).unwrap();
    let a_payload = a.sessions.pairing_payload(SESSION).unwrap();
    let b_payload = b.sessions.pairing_payload(SESSION).unwrap();
    a.sessions.complete_handshake_from_payload(SESSION, &b_payload).unwrap();
    b.sessions.complete_handshake_from_payload(SESSION, &a_payload).unwrap();

    // Both sides derived the same key
    let probe = a.sessions.generate_verification_payload(SESSION).unwrap();
    assert!(b.sessions.verify_incoming_payload(SESSION, &probe));
}

/// Forward every frame the sender emits into the receiver's engine
fn pump_frames(from: &Peer, to: &Peer) {
    let mut frames = from.gateway.take_frames().unwrap();
    let receiver = to.engine.clone();
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            receiver
                .receive_chunk(&frame.connection_token, &frame.bytes)
                .await
                .unwrap();
        }
    });
}

async fn wait_closed(mut rx: broadcast::Receiver<TransferProgress>) -> Option<TransferProgress> {
    let mut last = None;
    loop {
        match rx.recv().await {
            Ok(event) => last = Some(event),
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return last,
        }
    }
}

fn random_file(path: &Path, size: usize) {
    let mut data = vec![0u8; size];
    rand::thread_rng().fill_bytes(&mut data);
    std::fs::write(path, data).unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_resume_and_verify_ten_mib() {
    let outbox = tempfile::tempdir().unwrap();
    let inbox = tempfile::tempdir().unwrap();
    let source = outbox.path().join("video.bin");
    random_file(&source, TEN_MIB);

    let alice = peer("alice");
    let bob = peer("bob");
    pair(&alice, &bob);
    alice.gateway.set_send_delay(Duration::from_millis(5));

    let started = alice
        .engine
        .start_transfer(TransferRequest::new("bob", "conn-ab", SESSION, vec![source.clone()]))
        .await
        .unwrap();
    let transfer_id = started.transfer_id.clone();
    let manifest = alice.engine.manifest(&transfer_id).unwrap();
    let incoming = bob.engine.accept_incoming(manifest, inbox.path()).await.unwrap();
    // Frames sent before the manifest was accepted wait in the gateway queue
    pump_frames(&alice, &bob);

    // Pause once progress passes 30%
    let mut progress = started.progress;
    loop {
        let event = progress.recv().await.unwrap();
        assert!(event.bytes_transferred <= TEN_MIB as u64);
        if event.progress >= 30.0 {
            alice.engine.pause_transfer(&transfer_id).unwrap();
            break;
        }
    }
    // Let the in-flight chunk settle
    tokio::time::sleep(Duration::from_millis(200)).await;

    let paused = alice.engine.get_transfer(&transfer_id).unwrap();
    assert_eq!(paused.status, TransferStatus::Paused);
    assert!(paused.bytes_transferred > 0);
    assert!(paused.bytes_transferred < TEN_MIB as u64);
    let paused_at = paused.bytes_transferred;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(alice.engine.get_transfer(&transfer_id).unwrap().bytes_transferred, paused_at);

    alice.gateway.set_send_delay(Duration::ZERO);
    alice.engine.resume_transfer(&transfer_id).await.unwrap();
    let last = wait_closed(progress).await.unwrap();
    assert_eq!(last.status, TransferStatus::Completed);
    assert_eq!(last.bytes_transferred, TEN_MIB as u64);

    let received = wait_closed(incoming).await.unwrap();
    assert_eq!(received.status, TransferStatus::Completed);
    let written = inbox.path().join("video.bin");
    assert_eq!(
        hash_file_chunked(&written, 64 * 1024).unwrap(),
        hash_file_chunked(&source, 64 * 1024).unwrap()
    );
    let metrics = alice.engine.transfer_metrics(&transfer_id).unwrap();
    assert_eq!(metrics.files_completed, 1);
}

/// Forward only the frames of one transfer; anything else left in the queue is dropped
fn pump_transfer_frames(from: &Peer, to: &Peer, transfer_id: &str) {
    let mut frames = from.gateway.take_frames().unwrap();
    let receiver = to.engine.clone();
    let transfer_id = transfer_id.to_string();
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let ours = ChunkFrame::decode(&frame.bytes)
                .map(|f| f.transfer_id == transfer_id)
                .unwrap_or(false);
            if ours {
                receiver
                    .receive_chunk(&frame.connection_token, &frame.bytes)
                    .await
                    .unwrap();
            }
        }
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancel_while_paused_then_fresh_transfer_verifies() {
    let outbox = tempfile::tempdir().unwrap();
    let inbox = tempfile::tempdir().unwrap();
    let source = outbox.path().join("video.bin");
    random_file(&source, TEN_MIB);
    let before = hash_file_chunked(&source, 64 * 1024).unwrap();

    let alice = peer("alice");
    let bob = peer("bob");
    pair(&alice, &bob);
    alice.gateway.set_send_delay(Duration::from_millis(5));

    // First attempt: paused near 30%, then cancelled
    let first = alice
        .engine
        .start_transfer(TransferRequest::new("bob", "conn-ab", SESSION, vec![source.clone()]))
        .await
        .unwrap();
    let first_id = first.transfer_id.clone();
    let mut progress = first.progress;
    loop {
        let event = progress.recv().await.unwrap();
        if event.progress >= 30.0 {
            alice.engine.pause_transfer(&first_id).unwrap();
            break;
        }
    }
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(alice.engine.get_transfer(&first_id).unwrap().status, TransferStatus::Paused);

    alice.engine.cancel_transfer(&first_id).unwrap();
    let last = wait_closed(progress).await.unwrap();
    assert_eq!(last.status, TransferStatus::Cancelled);
    assert!(matches!(
        alice.engine.resume_transfer(&first_id).await,
        Err(TransferError::InvalidState { .. })
    ));
    assert!(alice.sessions.is_ready(SESSION));

    // Fresh transfer of the same file over the same session
    alice.gateway.set_send_delay(Duration::ZERO);
    let second = alice
        .engine
        .start_transfer(TransferRequest::new("bob", "conn-ab", SESSION, vec![source.clone()]))
        .await
        .unwrap();
    assert_ne!(second.transfer_id, first_id);
    let manifest = alice.engine.manifest(&second.transfer_id).unwrap();
    let incoming = bob.engine.accept_incoming(manifest, inbox.path()).await.unwrap();
    pump_transfer_frames(&alice, &bob, &second.transfer_id);

    let sent = wait_closed(second.progress).await.unwrap();
    assert_eq!(sent.status, TransferStatus::Completed);
    let received = wait_closed(incoming).await.unwrap();
    assert_eq!(received.status, TransferStatus::Completed);

    let receiver_checksums = ChecksumService::new(Arc::new(MemoryStorage::new()), ChecksumConfig::default());
    let written = inbox.path().join("video.bin");
    assert!(receiver_checksums.verify_checksum(&written, &before).await);
    assert_eq!(alice.engine.get_transfer(&first_id).unwrap().status, TransferStatus::Cancelled);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_cancelled_transfer_cannot_resume() {
    let outbox = tempfile::tempdir().unwrap();
    let source = outbox.path().join("big.bin");
    random_file(&source, 4 * 1024 * 1024);

    let alice = peer("alice");
    let bob = peer("bob");
    pair(&alice, &bob);
    alice.gateway.set_send_delay(Duration::from_millis(20));

    let started = alice
        .engine
        .start_transfer(TransferRequest::new("bob", "conn-ab", SESSION, vec![source]).with_compression(true))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    alice.engine.cancel_transfer(&started.transfer_id).unwrap();

    let last = wait_closed(started.progress).await.unwrap();
    assert_eq!(last.status, TransferStatus::Cancelled);
    let session = alice.engine.get_transfer(&started.transfer_id).unwrap();
    assert!(session.bytes_transferred < session.total_bytes);
    assert!(session.files.iter().all(|f| !f.can_retry));

    assert!(matches!(
        alice.engine.resume_transfer(&started.transfer_id).await,
        Err(TransferError::InvalidState { .. })
    ));
    // The secure session survives cancellation
    assert!(alice.sessions.is_ready(SESSION));
}

#[tokio::test]
async fn test_tampered_frames_are_rejected() {
    let outbox = tempfile::tempdir().unwrap();
    let inbox = tempfile::tempdir().unwrap();
    let source = outbox.path().join("note.txt");
    std::fs::write(&source, b"meet at the north gate").unwrap();

    let alice = peer("alice");
    let bob = peer("bob");
    pair(&alice, &bob);
    let mut frames = alice.gateway.take_frames().unwrap();

    let started = alice
        .engine
        .start_transfer(TransferRequest::new("bob", "conn-ab", SESSION, vec![source]))
        .await
        .unwrap();
    let manifest = alice.engine.manifest(&started.transfer_id).unwrap();
    bob.engine.accept_incoming(manifest, inbox.path()).await.unwrap();
    wait_closed(started.progress).await;

    let mut frame = frames.recv().await.unwrap().bytes;
    let last = frame.len() - 1;
    frame[last] ^= 0x01;
    assert!(matches!(
        bob.engine.receive_chunk("conn-ab", &frame).await,
        Err(TransferError::Session(_))
    ));
}
