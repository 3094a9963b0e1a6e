//! In-process loopback gateway.
//!
//! Stands in for the platform radio layer in tests and the CLI demo: every
//! transport call is recorded, failures can be scripted per transport kind, and
//! sent chunk frames are forwarded to a channel a receiving engine can drain.

use super::abstraction::{TransportError, TransportKind};
use super::events::{ConnectionReady, GatewayEvent};
use super::gateway::{Endpoint, TransportGateway};
use crate::crypto::is_weak_key;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// One call made against the gateway, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    StartDiscovery(TransportKind),
    StopDiscovery(TransportKind),
    StartAdvertising(TransportKind),
    StopAdvertising(TransportKind),
    Connect(TransportKind, String),
    CreateDatapath(TransportKind, String),
    SetEncryptionKey(String),
}

/// A chunk frame as handed to `send_chunk`
#[derive(Debug, Clone)]
pub struct SentFrame {
    pub connection_token: String,
    pub bytes: Vec<u8>,
    pub index: u64,
    pub total: u64,
}

#[derive(Default)]
struct LocalState {
    calls: Vec<GatewayCall>,
    failing: HashSet<TransportKind>,
    failing_connects: HashSet<TransportKind>,
    failing_sends: u32,
    unacked_sends: u32,
    send_delay: Option<Duration>,
    installed_keys: usize,
}

pub struct LocalGateway {
    state: Mutex<LocalState>,
    frames_tx: mpsc::UnboundedSender<SentFrame>,
    frames_rx: Mutex<Option<mpsc::UnboundedReceiver<SentFrame>>>,
    events_tx: Mutex<Option<mpsc::UnboundedSender<GatewayEvent>>>,
}

impl Default for LocalGateway {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalGateway {
    pub fn new() -> Self {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        Self {
            state: Mutex::new(LocalState::default()),
            frames_tx,
            frames_rx: Mutex::new(Some(frames_rx)),
            events_tx: Mutex::new(None),
        }
    }

    /// Make discovery and advertising fail on `kind`
    pub fn fail_transport(&self, kind: TransportKind) {
        self.state.lock().failing.insert(kind);
    }

    pub fn restore_transport(&self, kind: TransportKind) {
        self.state.lock().failing.remove(&kind);
    }

    /// Make connect / create_datapath fail on `kind`
    pub fn fail_connects(&self, kind: TransportKind) {
        self.state.lock().failing_connects.insert(kind);
    }

    /// The next `count` sends return a transport error
    pub fn fail_next_sends(&self, count: u32) {
        self.state.lock().failing_sends = count;
    }

    /// The next `count` sends are delivered but not acknowledged
    pub fn drop_next_acks(&self, count: u32) {
        self.state.lock().unacked_sends = count;
    }

    /// Slow every send down, simulating link throughput
    pub fn set_send_delay(&self, delay: Duration) {
        self.state.lock().send_delay = Some(delay);
    }

    /// Emit a `connectionReady` event on this sink whenever a connect or
    /// datapath call succeeds, like a platform layer would
    pub fn emit_events_to(&self, sink: mpsc::UnboundedSender<GatewayEvent>) {
        *self.events_tx.lock() = Some(sink);
    }

    /// Receiver for every frame passed to `send_chunk`. Only one exists.
    pub fn take_frames(&self) -> Option<mpsc::UnboundedReceiver<SentFrame>> {
        self.frames_rx.lock().take()
    }

    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone()
    }

    pub fn installed_keys(&self) -> usize {
        self.state.lock().installed_keys
    }

    fn record(&self, call: GatewayCall) {
        debug!("local gateway call: {:?}", call);
        self.state.lock().calls.push(call);
    }

    fn check_available(&self, kind: TransportKind) -> Result<(), TransportError> {
        if self.state.lock().failing.contains(&kind) {
            Err(TransportError::TransportNotAvailable(kind.to_string()))
        } else {
            Ok(())
        }
    }

    fn check_connectable(&self, kind: TransportKind) -> Result<(), TransportError> {
        if self.state.lock().failing_connects.contains(&kind) {
            Err(TransportError::ConnectionFailed(kind.to_string()))
        } else {
            Ok(())
        }
    }

    fn announce_ready(&self, ready: ConnectionReady) {
        if let Some(sink) = self.events_tx.lock().as_ref() {
            let _ = sink.send(GatewayEvent::ConnectionReady(ready));
        }
    }
}

#[async_trait]
impl TransportGateway for LocalGateway {
    async fn start_discovery(&self, kind: TransportKind) -> Result<(), TransportError> {
        self.record(GatewayCall::StartDiscovery(kind));
        self.check_available(kind)
    }

    async fn stop_discovery(&self, kind: TransportKind) -> Result<(), TransportError> {
        self.record(GatewayCall::StopDiscovery(kind));
        Ok(())
    }

    async fn start_advertising(&self, kind: TransportKind) -> Result<(), TransportError> {
        self.record(GatewayCall::StartAdvertising(kind));
        self.check_available(kind)
    }

    async fn stop_advertising(&self, kind: TransportKind) -> Result<(), TransportError> {
        self.record(GatewayCall::StopAdvertising(kind));
        Ok(())
    }

    async fn connect(&self, kind: TransportKind, address: &str) -> Result<String, TransportError> {
        self.record(GatewayCall::Connect(kind, address.to_string()));
        self.check_connectable(kind)?;
        let token = format!("local-{}-{}", kind, address);
        self.announce_ready(ConnectionReady {
            device_id: address.to_string(),
            connection_method: Some(kind),
            host: None,
            port: None,
            connection_token: Some(token.clone()),
            peer_id: None,
            device_address: None,
            extra: Default::default(),
        });
        Ok(token)
    }

    async fn create_datapath(
        &self,
        kind: TransportKind,
        peer_id: &str,
    ) -> Result<Endpoint, TransportError> {
        self.record(GatewayCall::CreateDatapath(kind, peer_id.to_string()));
        self.check_connectable(kind)?;
        let endpoint = Endpoint {
            host: "192.168.49.1".to_string(),
            port: 8988,
            connection_token: Some(format!("local-{}-{}", kind, peer_id)),
        };
        self.announce_ready(ConnectionReady {
            device_id: peer_id.to_string(),
            connection_method: Some(kind),
            host: Some(endpoint.host.clone()),
            port: Some(endpoint.port),
            connection_token: endpoint.connection_token.clone(),
            peer_id: Some(peer_id.to_string()),
            device_address: None,
            extra: Default::default(),
        });
        Ok(endpoint)
    }

    async fn send_chunk(
        &self,
        connection_token: &str,
        bytes: &[u8],
        index: u64,
        total: u64,
    ) -> Result<bool, TransportError> {
        let (delay, fail, unacked) = {
            let mut state = self.state.lock();
            let fail = state.failing_sends > 0;
            if fail {
                state.failing_sends -= 1;
            }
            let unacked = !fail && state.unacked_sends > 0;
            if unacked {
                state.unacked_sends -= 1;
            }
            (state.send_delay, fail, unacked)
        };

        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if fail {
            return Err(TransportError::SendFailed(format!("chunk {} dropped", index)));
        }
        if unacked {
            return Ok(false);
        }

        let _ = self.frames_tx.send(SentFrame {
            connection_token: connection_token.to_string(),
            bytes: bytes.to_vec(),
            index,
            total,
        });
        Ok(true)
    }

    async fn set_encryption_key(
        &self,
        connection_token: &str,
        key: &[u8],
    ) -> Result<bool, TransportError> {
        self.record(GatewayCall::SetEncryptionKey(connection_token.to_string()));
        if is_weak_key(key) {
            return Ok(false);
        }
        self.state.lock().installed_keys += 1;
        Ok(true)
    }
}
