// Loopback transfer: two in-process peers over local gateways
//
// Exercises the full path a real pairing takes: key agreement, verification,
// encrypted chunked send, receive, and checksum verification on the far side.

use anyhow::{Context, Result};
use beamdrop_core::config::CoreConfig;
use beamdrop_core::store::{MemoryStorage, StorageBackend, StorageKey};
use beamdrop_core::transfer::{TransferProgress, TransferRequest, TransferStatus};
use beamdrop_core::transport::{ChunkReceived, GatewayEvent, LocalGateway};
use beamdrop_core::CoreContext;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use tracing::info;

const SESSION_ID: &str = "loopback";
const CONNECTION: &str = "loopback-link";
const RECEIVER_ID: &str = "loopback-receiver";

pub struct LoopbackOptions {
    pub files: Vec<PathBuf>,
    pub out_dir: PathBuf,
    pub encrypt: bool,
    pub compress: bool,
}

#[derive(Debug)]
pub struct LoopbackSummary {
    pub transfer_id: String,
    pub bytes: u64,
    pub elapsed_secs: f64,
    pub status: TransferStatus,
    pub files_verified: usize,
    pub files_total: usize,
}

fn peer(
    base: &CoreConfig,
    device_id: &str,
    backend: Arc<dyn StorageBackend>,
    key: StorageKey,
) -> (Arc<LocalGateway>, Arc<CoreContext>) {
    let gateway = Arc::new(LocalGateway::new());
    let config = CoreConfig {
        local_device_id: device_id.to_string(),
        ..base.clone()
    };
    let ctx = CoreContext::new(config, gateway.clone(), backend, key);
    (gateway, Arc::new(ctx))
}

/// Handshake both ways, then confirm each side's verification probe
fn pair(sender: &CoreContext, receiver: &CoreContext) -> Result<()> {
    sender
        .sessions
        .create_session(SESSION_ID, &receiver.config.local_device_id, None)?;
    receiver
        .sessions
        .create_session(SESSION_ID, &sender.config.local_device_id, None)?;

    let offer = sender.sessions.pairing_payload(SESSION_ID)?;
    let answer = receiver.sessions.pairing_payload(SESSION_ID)?;
    // Pairing payloads travel as JSON (QR code or NFC in the apps)
    let offer = beamdrop_core::crypto::PairingPayload::from_json(&offer.to_json())?;
    receiver.sessions.complete_handshake_from_payload(SESSION_ID, &offer)?;
    sender.sessions.complete_handshake_from_payload(SESSION_ID, &answer)?;

    let probe = sender.sessions.generate_verification_payload(SESSION_ID)?;
    receiver
        .sessions
        .confirm_peer(SESSION_ID, &probe)
        .context("Receiver rejected verification")?;
    let probe = receiver.sessions.generate_verification_payload(SESSION_ID)?;
    sender
        .sessions
        .confirm_peer(SESSION_ID, &probe)
        .context("Sender rejected verification")?;
    Ok(())
}

async fn last_event(
    mut rx: broadcast::Receiver<TransferProgress>,
    mut on_event: impl FnMut(&TransferProgress),
) -> Option<TransferProgress> {
    let mut last = None;
    loop {
        match rx.recv().await {
            Ok(event) => {
                on_event(&event);
                last = Some(event);
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return last,
        }
    }
}

/// The sending side keeps its transfer history and checksums in `sender_store`
pub async fn run(
    base: &CoreConfig,
    options: LoopbackOptions,
    sender_store: Arc<dyn StorageBackend>,
    sender_key: StorageKey,
    on_progress: impl FnMut(&TransferProgress),
) -> Result<LoopbackSummary> {
    let (sender_gateway, sender) = peer(base, &base.local_device_id, sender_store, sender_key);
    let (_, receiver) = peer(
        base,
        RECEIVER_ID,
        Arc::new(MemoryStorage::new()),
        StorageKey::random(),
    );
    if options.encrypt {
        pair(&sender, &receiver)?;
    }

    let mut frames = sender_gateway
        .take_frames()
        .context("Sender frames already taken")?;

    let request = if options.encrypt {
        TransferRequest::new(RECEIVER_ID, CONNECTION, SESSION_ID, options.files.clone())
    } else {
        TransferRequest::unencrypted(RECEIVER_ID, CONNECTION, options.files.clone())
    }
    .with_compression(options.compress);

    let started_at = Instant::now();
    let started = sender.transfers.start_transfer(request).await?;
    let manifest = sender
        .transfers
        .manifest(&started.transfer_id)
        .context("Transfer disappeared before its manifest was read")?;
    let files_total = manifest.files.len();
    let incoming = receiver
        .transfers
        .accept_incoming(manifest, &options.out_dir)
        .await?;
    info!(transfer_id = %started.transfer_id, files = files_total, "Loopback transfer running");

    // Frames queued before the manifest was accepted are forwarded in order
    let rx_ctx = receiver.clone();
    let pump = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            rx_ctx
                .dispatch(GatewayEvent::ChunkReceived(ChunkReceived {
                    connection_id: CONNECTION.to_string(),
                    bytes: frame.bytes,
                }))
                .await;
        }
    });

    let sent = last_event(started.progress, on_progress).await;
    let status = match sent.map(|e| e.status) {
        Some(TransferStatus::Completed) => last_event(incoming, |_| {}).await.map(|e| e.status),
        other => other,
    }
    .unwrap_or(TransferStatus::Failed);
    pump.abort();

    let received = receiver
        .transfers
        .incoming_transfer(&started.transfer_id)
        .await
        .context("Receiver lost the transfer")?;
    let files_verified = received
        .files
        .iter()
        .filter(|f| f.status == TransferStatus::Completed)
        .count();

    Ok(LoopbackSummary {
        transfer_id: started.transfer_id,
        bytes: received.bytes_transferred,
        elapsed_secs: started_at.elapsed().as_secs_f64(),
        status,
        files_verified,
        files_total,
    })
}
