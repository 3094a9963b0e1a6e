// Session key agreement and chunk encryption

pub mod envelope;
pub mod session;

pub use envelope::{ChunkEnvelope, EnvelopeError};
pub use session::{PairingPayload, SessionEngine, SessionError, SessionInfo};

/// Placeholder screen applied before any key is installed: rejects empty,
/// all-zero and all-identical byte strings. Not an entropy test.
pub fn is_weak_key(key: &[u8]) -> bool {
    match key.first() {
        None => true,
        Some(first) => key.iter().all(|b| b == first),
    }
}
