// Per-transport connectors
//
// Each transport needs different fields from the discovery metadata before it
// can be dialed. `plan` checks them and picks the dial target; `dial` makes
// the single gateway call that starts the connection.

use super::DeviceRecord;
use crate::registry::ValidationError;
use crate::transport::{is_valid_address, Endpoint, TransportError, TransportGateway, TransportKind};
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct DialPlan {
    pub kind: TransportKind,
    /// Address handed to the gateway; also an alias the ready event may use
    pub target: String,
}

#[derive(Debug, Clone, Default)]
pub(super) struct DialOutcome {
    pub connection_token: Option<String>,
    pub endpoint: Option<Endpoint>,
}

fn non_empty<'a>(device: &'a DeviceRecord, field: &str) -> Option<&'a str> {
    device.metadata_str(field).filter(|v| !v.trim().is_empty())
}

pub(super) fn plan(kind: TransportKind, device: &DeviceRecord) -> Result<DialPlan, ValidationError> {
    let target = match kind {
        TransportKind::WifiAware | TransportKind::Multipeer | TransportKind::Relay => {
            non_empty(device, "peerId")
                .ok_or(ValidationError::MissingPeerId(kind))?
                .to_string()
        }
        TransportKind::Ble => non_empty(device, "deviceAddress")
            .or_else(|| non_empty(device, "connectionToken"))
            .ok_or(ValidationError::MissingToken(kind))?
            .to_string(),
        TransportKind::Hotspot => {
            let host = non_empty(device, "host");
            let port = device.metadata_u64("port");
            match (host, port) {
                (Some(host), Some(port)) => {
                    if !is_valid_address(host) {
                        return Err(ValidationError::InvalidAddress(host.to_string()));
                    }
                    let port = u16::try_from(port)
                        .ok()
                        .filter(|p| *p != 0)
                        .ok_or(ValidationError::InvalidPort(u32::try_from(port).unwrap_or(u32::MAX)))?;
                    format!("{}:{}", host, port)
                }
                _ => non_empty(device, "connectionToken")
                    .ok_or(ValidationError::MissingEndpoint(kind))?
                    .to_string(),
            }
        }
    };
    Ok(DialPlan { kind, target })
}

pub(super) async fn dial(
    gateway: &dyn TransportGateway,
    plan: &DialPlan,
) -> Result<DialOutcome, TransportError> {
    debug!("Dialing {} via {}", plan.target, plan.kind);
    match plan.kind {
        TransportKind::WifiAware => {
            let endpoint = gateway.create_datapath(plan.kind, &plan.target).await?;
            Ok(DialOutcome {
                connection_token: endpoint.connection_token.clone(),
                endpoint: Some(endpoint),
            })
        }
        _ => {
            let token = gateway.connect(plan.kind, &plan.target).await?;
            Ok(DialOutcome {
                connection_token: Some(token),
                endpoint: None,
            })
        }
    }
}
