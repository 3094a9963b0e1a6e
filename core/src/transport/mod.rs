// Gateway boundary, event decoding and address checks

pub mod abstraction;
pub mod address;
pub mod events;
pub mod gateway;
pub mod local;

pub use abstraction::{TransportError, TransportKind};
pub use address::{classify_address, is_valid_address, is_valid_port, AddressKind};
pub use events::{
    ChunkReceived, ChunkSent, ConnectionEstablished, ConnectionLost, ConnectionReady,
    DiscoveryUpdate, EventDecodeError, GatewayEvent,
};
pub use gateway::{Endpoint, TransportGateway};
pub use local::{GatewayCall, LocalGateway, SentFrame};
