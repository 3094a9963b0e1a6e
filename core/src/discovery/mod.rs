//! Discovery and connection orchestration.
//!
//! Drives the gateway through the transport priority list with fallback,
//! keeps the discovered-device list, dials devices through per-transport
//! connectors and waits (bounded) for the platform's `connectionReady` event.
//!
//! State and the device list are published on `watch` channels so any number
//! of observers can follow them without polling.

mod connectors;

use crate::config::DiscoveryConfig;
use crate::ratelimit::{RateLimitError, RateLimiter};
use crate::registry::{ConnectionInfo, ConnectionRegistry, ValidationError, INVALID_FLAG, INVALID_REASON};
use crate::transport::{
    ConnectionEstablished, ConnectionLost, ConnectionReady, DiscoveryUpdate, EventDecodeError,
    GatewayEvent, TransportError, TransportGateway, TransportKind,
};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Idle,
    Initializing,
    Discovering,
    Advertising,
    Connecting,
    Connected,
    Error,
}

/// Per-transport failures collected during a fallback run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportFailures(pub Vec<(TransportKind, TransportError)>);

impl fmt::Display for TransportFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|(kind, err)| format!("{}: {}", kind, err)).collect();
        f.write_str(&parts.join("; "))
    }
}

#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error(transparent)]
    RateLimited(#[from] RateLimitError),
    #[error("All transports failed: {0}")]
    AllTransportsFailed(TransportFailures),
    #[error("Unknown device: {0}")]
    UnknownDevice(String),
    #[error("Device {device_id} is flagged invalid: {reason}")]
    InvalidDevice { device_id: String, reason: String },
    #[error("Device {0} has no connection method")]
    NoConnectionMethod(String),
    #[error("Connection info invalid: {0}")]
    Validation(#[from] ValidationError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Timed out waiting for device {0} to become ready")]
    Timeout(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceRecord {
    pub id: String,
    pub display_name: String,
    pub transport_metadata: Map<String, Value>,
    pub is_connected: bool,
    pub last_seen: u64,
}

impl DeviceRecord {
    pub fn new(id: impl Into<String>, display_name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            display_name: display_name.into(),
            transport_metadata: Map::new(),
            is_connected: false,
            last_seen: crate::now_millis(),
        }
    }

    pub fn metadata_str(&self, field: &str) -> Option<&str> {
        self.transport_metadata.get(field).and_then(Value::as_str)
    }

    pub fn metadata_u64(&self, field: &str) -> Option<u64> {
        self.transport_metadata.get(field).and_then(Value::as_u64)
    }

    pub fn connection_method(&self) -> Option<TransportKind> {
        self.metadata_str("connectionMethod").and_then(|m| m.parse().ok())
    }

    pub fn is_invalid(&self) -> bool {
        matches!(self.transport_metadata.get(INVALID_FLAG), Some(Value::Bool(true)))
    }

    pub fn invalid_reason(&self) -> Option<&str> {
        self.metadata_str(INVALID_REASON)
    }

    fn mark_invalid(&mut self, reason: &str) {
        self.transport_metadata.insert(INVALID_FLAG.to_string(), Value::Bool(true));
        self.transport_metadata
            .insert(INVALID_REASON.to_string(), Value::String(reason.to_string()));
    }

    fn clear_invalid(&mut self) {
        self.transport_metadata.remove(INVALID_FLAG);
        self.transport_metadata.remove(INVALID_REASON);
    }

    /// Drops a stale invalid flag once the merged metadata can be dialed
    fn revalidate(&mut self) {
        if !self.is_invalid() {
            return;
        }
        let dialable = self
            .connection_method()
            .is_some_and(|kind| connectors::plan(kind, self).is_ok());
        if dialable {
            debug!(device_id = %self.id, "Device metadata now complete, clearing invalid flag");
            self.clear_invalid();
        }
    }

    /// Event values win over what is already known
    fn merge(&mut self, fields: Map<String, Value>) {
        for (key, value) in fields {
            self.transport_metadata.insert(key, value);
        }
        self.last_seen = crate::now_millis();
    }

    fn connection_info(&self) -> ConnectionInfo {
        let mut info = ConnectionInfo::new(self.id.clone(), self.connection_method());
        info.host = self.metadata_str("host").map(str::to_string);
        info.port = self.metadata_u64("port").and_then(|p| u16::try_from(p).ok());
        info.connection_token = self.metadata_str("connectionToken").map(str::to_string);
        info.peer_id = self.metadata_str("peerId").map(str::to_string);
        info.device_address = self.metadata_str("deviceAddress").map(str::to_string);
        info.metadata = self.transport_metadata.clone();
        info.metadata.remove(INVALID_FLAG);
        info.metadata.remove(INVALID_REASON);
        info
    }
}

/// Serialize an event payload into metadata fields, dropping ids and nulls
fn event_fields<T: Serialize>(payload: &T) -> Map<String, Value> {
    let mut fields = match serde_json::to_value(payload) {
        Ok(Value::Object(map)) => map,
        _ => Map::new(),
    };
    fields.remove("deviceId");
    fields.remove("deviceName");
    fields.retain(|_, v| !v.is_null());
    fields
}

#[derive(Clone, Copy)]
enum Role {
    Discovery,
    Advertising,
}

struct ReadyWaiter {
    device_id: String,
    tx: oneshot::Sender<ConnectionInfo>,
}

pub struct DiscoveryOrchestrator {
    gateway: Arc<dyn TransportGateway>,
    registry: Arc<ConnectionRegistry>,
    limiter: Arc<RateLimiter>,
    config: DiscoveryConfig,
    local_device_id: String,
    devices: RwLock<HashMap<String, DeviceRecord>>,
    active_discovery: Mutex<Option<TransportKind>>,
    active_advertising: Mutex<Option<TransportKind>>,
    /// Keyed by device id and by dial target; both point at the same waiter
    ready_waiters: Mutex<HashMap<String, ReadyWaiter>>,
    state_tx: watch::Sender<ConnectionState>,
    devices_tx: watch::Sender<Vec<DeviceRecord>>,
    discovery_op: tokio::sync::Mutex<()>,
    advertising_op: tokio::sync::Mutex<()>,
}

impl DiscoveryOrchestrator {
    pub fn new(
        gateway: Arc<dyn TransportGateway>,
        registry: Arc<ConnectionRegistry>,
        limiter: Arc<RateLimiter>,
        config: DiscoveryConfig,
        local_device_id: impl Into<String>,
    ) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let (devices_tx, _) = watch::channel(Vec::new());
        Self {
            gateway,
            registry,
            limiter,
            config,
            local_device_id: local_device_id.into(),
            devices: RwLock::new(HashMap::new()),
            active_discovery: Mutex::new(None),
            active_advertising: Mutex::new(None),
            ready_waiters: Mutex::new(HashMap::new()),
            state_tx,
            devices_tx,
            discovery_op: tokio::sync::Mutex::new(()),
            advertising_op: tokio::sync::Mutex::new(()),
        }
    }

    // ------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------

    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn subscribe_devices(&self) -> watch::Receiver<Vec<DeviceRecord>> {
        self.devices_tx.subscribe()
    }

    pub fn devices(&self) -> Vec<DeviceRecord> {
        let mut list: Vec<DeviceRecord> = self.devices.read().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub fn device(&self, device_id: &str) -> Option<DeviceRecord> {
        self.devices.read().get(device_id).cloned()
    }

    pub fn active_discovery_method(&self) -> Option<TransportKind> {
        *self.active_discovery.lock()
    }

    pub fn active_advertising_method(&self) -> Option<TransportKind> {
        *self.active_advertising.lock()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Connection state {:?} -> {:?}", previous, state);
        }
    }

    fn publish_devices(&self) {
        self.devices_tx.send_replace(self.devices());
    }

    fn update_device<F: FnOnce(&mut DeviceRecord)>(&self, device_id: &str, f: F) -> bool {
        let updated = match self.devices.write().get_mut(device_id) {
            Some(device) => {
                f(device);
                true
            }
            None => false,
        };
        if updated {
            self.publish_devices();
        }
        updated
    }

    // ------------------------------------------------------------------
    // Discovery / advertising with fallback
    // ------------------------------------------------------------------

    fn candidates(&self) -> Vec<TransportKind> {
        let mut list: Vec<TransportKind> = self
            .config
            .transport_priority
            .iter()
            .copied()
            .filter(|k| *k != TransportKind::Relay)
            .collect();
        if self.config.relay_fallback {
            list.push(TransportKind::Relay);
        }
        list
    }

    async fn start_with_fallback(&self, role: Role) -> Result<TransportKind, DiscoveryError> {
        let mut failures = Vec::new();
        for kind in self.candidates() {
            let result = match role {
                Role::Discovery => self.gateway.start_discovery(kind).await,
                Role::Advertising => self.gateway.start_advertising(kind).await,
            };
            match result {
                Ok(()) => return Ok(kind),
                Err(e) => {
                    warn!("Transport {} unavailable: {}", kind, e);
                    failures.push((kind, e));
                }
            }
        }
        Err(DiscoveryError::AllTransportsFailed(TransportFailures(failures)))
    }

    /// Start discovery on the first transport that accepts it
    pub async fn start_discovery(&self) -> Result<TransportKind, DiscoveryError> {
        self.limiter.admit_discovery(&self.local_device_id)?;
        let _op = self.discovery_op.lock().await;

        if self.active_discovery.lock().is_some() {
            self.stop_discovery_inner().await;
        }

        self.set_state(ConnectionState::Initializing);
        match self.start_with_fallback(Role::Discovery).await {
            Ok(kind) => {
                *self.active_discovery.lock() = Some(kind);
                self.set_state(ConnectionState::Discovering);
                info!("Discovery started on {}", kind);
                Ok(kind)
            }
            Err(e) => {
                self.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// Idempotent; clears the device list
    pub async fn stop_discovery(&self) {
        let _op = self.discovery_op.lock().await;
        self.stop_discovery_inner().await;
    }

    async fn stop_discovery_inner(&self) {
        let active = self.active_discovery.lock().take();
        if let Some(kind) = active {
            if let Err(e) = self.gateway.stop_discovery(kind).await {
                warn!("Failed to stop discovery on {}: {}", kind, e);
            }
            info!("Discovery stopped on {}", kind);
        }
        self.devices.write().clear();
        self.publish_devices();
        self.set_state(ConnectionState::Idle);
    }

    pub async fn start_advertising(&self) -> Result<TransportKind, DiscoveryError> {
        self.limiter.admit_discovery(&self.local_device_id)?;
        let _op = self.advertising_op.lock().await;

        if let Some(kind) = self.active_advertising.lock().take() {
            if let Err(e) = self.gateway.stop_advertising(kind).await {
                warn!("Failed to stop advertising on {}: {}", kind, e);
            }
        }

        self.set_state(ConnectionState::Initializing);
        match self.start_with_fallback(Role::Advertising).await {
            Ok(kind) => {
                *self.active_advertising.lock() = Some(kind);
                self.set_state(ConnectionState::Advertising);
                info!("Advertising started on {}", kind);
                Ok(kind)
            }
            Err(e) => {
                self.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    /// Idempotent; leaves discovered devices alone
    pub async fn stop_advertising(&self) {
        let _op = self.advertising_op.lock().await;
        let active = self.active_advertising.lock().take();
        if let Some(kind) = active {
            if let Err(e) = self.gateway.stop_advertising(kind).await {
                warn!("Failed to stop advertising on {}: {}", kind, e);
            }
            info!("Advertising stopped on {}", kind);
        }
        if self.active_discovery.lock().is_some() {
            self.set_state(ConnectionState::Discovering);
        } else {
            self.set_state(ConnectionState::Idle);
        }
    }

    // ------------------------------------------------------------------
    // Connecting
    // ------------------------------------------------------------------

    /// Dial a discovered device and wait for the platform to report it ready
    pub async fn connect_to_device(&self, device_id: &str) -> Result<ConnectionInfo, DiscoveryError> {
        self.limiter.admit_connection(device_id)?;

        let device = self
            .device(device_id)
            .ok_or_else(|| DiscoveryError::UnknownDevice(device_id.to_string()))?;
        if device.is_invalid() {
            return Err(DiscoveryError::InvalidDevice {
                device_id: device_id.to_string(),
                reason: device.invalid_reason().unwrap_or("unspecified").to_string(),
            });
        }
        let kind = device
            .connection_method()
            .ok_or_else(|| DiscoveryError::NoConnectionMethod(device_id.to_string()))?;

        let plan = match connectors::plan(kind, &device) {
            Ok(plan) => plan,
            Err(e) => {
                warn!(device_id, "Refusing to dial: {}", e);
                self.update_device(device_id, |d| d.mark_invalid(&e.to_string()));
                return Err(e.into());
            }
        };

        self.set_state(ConnectionState::Connecting);
        let ready = self.register_waiter(device_id, &plan.target);

        let result = self.dial_and_wait(device_id, &plan, ready).await;
        self.clear_waiters(device_id, &plan.target);

        match result {
            Ok(info) => {
                self.set_state(ConnectionState::Connected);
                info!(device_id, "Connected via {}", kind);
                Ok(info)
            }
            Err(e) => {
                warn!(device_id, "Connection failed: {}", e);
                self.update_device(device_id, |d| d.is_connected = false);
                self.set_state(ConnectionState::Error);
                Err(e)
            }
        }
    }

    async fn dial_and_wait(
        &self,
        device_id: &str,
        plan: &connectors::DialPlan,
        ready: oneshot::Receiver<ConnectionInfo>,
    ) -> Result<ConnectionInfo, DiscoveryError> {
        let outcome = connectors::dial(self.gateway.as_ref(), plan).await?;

        // Record what the dial itself told us; the ready event may add more
        self.update_device(device_id, |d| {
            let mut fields = Map::new();
            if let Some(token) = &outcome.connection_token {
                fields.insert("connectionToken".to_string(), Value::String(token.clone()));
            }
            if let Some(endpoint) = &outcome.endpoint {
                fields.insert("host".to_string(), Value::String(endpoint.host.clone()));
                fields.insert("port".to_string(), Value::from(endpoint.port));
            }
            d.merge(fields);
        });

        let info = match tokio::time::timeout(self.config.connect_timeout(), ready).await {
            Ok(Ok(info)) => info,
            Ok(Err(_)) | Err(_) => return Err(DiscoveryError::Timeout(device_id.to_string())),
        };

        if info.is_invalid() {
            return Err(DiscoveryError::InvalidDevice {
                device_id: device_id.to_string(),
                reason: info
                    .metadata
                    .get(INVALID_REASON)
                    .and_then(Value::as_str)
                    .unwrap_or("unspecified")
                    .to_string(),
            });
        }
        Ok(info)
    }

    fn register_waiter(&self, device_id: &str, target: &str) -> oneshot::Receiver<ConnectionInfo> {
        let (tx, rx) = oneshot::channel();
        let mut waiters = self.ready_waiters.lock();
        waiters.insert(
            device_id.to_string(),
            ReadyWaiter {
                device_id: device_id.to_string(),
                tx,
            },
        );
        if target != device_id {
            // The alias entry has no sender; it only maps back to the device
            let (alias_tx, _) = oneshot::channel();
            waiters.insert(
                target.to_string(),
                ReadyWaiter {
                    device_id: device_id.to_string(),
                    tx: alias_tx,
                },
            );
        }
        rx
    }

    fn clear_waiters(&self, device_id: &str, target: &str) {
        let mut waiters = self.ready_waiters.lock();
        waiters.remove(device_id);
        waiters.remove(target);
    }

    fn resolve_device_id(&self, event_device_id: &str) -> String {
        self.ready_waiters
            .lock()
            .get(event_device_id)
            .map(|w| w.device_id.clone())
            .unwrap_or_else(|| event_device_id.to_string())
    }

    /// Mark a device disconnected locally and in the registry
    pub fn disconnect_device(&self, device_id: &str) -> bool {
        let known = self.update_device(device_id, |d| d.is_connected = false);
        let stored = self.registry.set_connected(device_id, false);
        if known || stored {
            info!(device_id, "Device disconnected");
        }
        known || stored
    }

    // ------------------------------------------------------------------
    // Events
    // ------------------------------------------------------------------

    /// Decode a raw platform event and apply it; invalid events are dropped
    pub fn handle_raw_event(&self, raw: &Value) -> Result<(), EventDecodeError> {
        match GatewayEvent::decode(raw) {
            Ok(event) => {
                self.apply(&event);
                Ok(())
            }
            Err(e) => {
                warn!("Dropping gateway event: {}", e);
                Err(e)
            }
        }
    }

    /// Apply an already-typed event after the same required-field checks
    pub fn handle_event(&self, event: &GatewayEvent) {
        if let Err(e) = event.validate() {
            warn!("Dropping gateway event: {}", e);
            return;
        }
        self.apply(event);
    }

    fn apply(&self, event: &GatewayEvent) {
        match event {
            GatewayEvent::DiscoveryUpdate(update) => self.on_discovery_update(update),
            GatewayEvent::ConnectionReady(ready) => self.on_connection_ready(ready),
            GatewayEvent::ConnectionEstablished(established) => self.on_connection_established(established),
            GatewayEvent::ConnectionLost(lost) => self.on_connection_lost(lost),
            GatewayEvent::ChunkSent(_) | GatewayEvent::ChunkReceived(_) => {
                debug!("Chunk event ignored by discovery orchestrator");
            }
        }
    }

    /// Consume events in arrival order until the sender side closes
    pub async fn run_events(&self, mut rx: mpsc::UnboundedReceiver<GatewayEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle_event(&event);
        }
        debug!("Gateway event stream closed");
    }

    fn on_discovery_update(&self, update: &DiscoveryUpdate) {
        if self.active_discovery.lock().is_none() {
            debug!(device_id = %update.device_id, "Discovery update while not discovering");
        }
        let fields = event_fields(update);
        {
            let mut devices = self.devices.write();
            let device = devices
                .entry(update.device_id.clone())
                .or_insert_with(|| DeviceRecord::new(update.device_id.clone(), update.device_name.clone()));
            device.display_name = update.device_name.clone();
            device.merge(fields);
            device.revalidate();
        }
        debug!(device_id = %update.device_id, "Device discovered");
        self.publish_devices();
    }

    fn on_connection_ready(&self, ready: &ConnectionReady) {
        let device_id = self.resolve_device_id(&ready.device_id);
        let fields = event_fields(ready);
        let merged = {
            let mut devices = self.devices.write();
            let device = devices
                .entry(device_id.clone())
                .or_insert_with(|| DeviceRecord::new(device_id.clone(), device_id.clone()));
            device.merge(fields);
            device.clone()
        };

        let mut info = merged.connection_info();
        info.is_connected = true;
        info.last_connected_at = crate::now_millis();
        let stored = self.registry.store_connection_info(info);

        self.update_device(&device_id, |d| {
            if stored.is_invalid() {
                let reason = stored
                    .metadata
                    .get(INVALID_REASON)
                    .and_then(Value::as_str)
                    .unwrap_or("invalid connection info")
                    .to_string();
                d.mark_invalid(&reason);
                d.is_connected = false;
            } else {
                d.clear_invalid();
                d.is_connected = true;
            }
        });

        let waiter = self.ready_waiters.lock().remove(&device_id);
        if let Some(waiter) = waiter {
            let _ = waiter.tx.send(stored);
        }
    }

    fn on_connection_established(&self, established: &ConnectionEstablished) {
        let device_id = self.resolve_device_id(&established.device_id);
        let known = self.update_device(&device_id, |d| {
            let mut fields = Map::new();
            if let Some(token) = &established.connection_token {
                fields.insert("connectionToken".to_string(), Value::String(token.clone()));
            }
            d.merge(fields);
            d.is_connected = true;
        });
        self.registry.set_connected(&device_id, true);
        if known {
            self.set_state(ConnectionState::Connected);
        }
        info!(device_id = %device_id, "Connection established out of band");
    }

    fn on_connection_lost(&self, lost: &ConnectionLost) {
        let reason = lost.reason.as_deref().unwrap_or("unknown");
        info!(device_id = %lost.device_id, "Connection lost: {}", reason);
        self.disconnect_device(&lost.device_id);
    }
}
