// Persistence backends shared by the registry, checksum table
// and transfer snapshots

pub mod backend;
pub mod sealed;

pub use backend::{MemoryStorage, SledStorage, StorageBackend, StorageError};
pub use sealed::{SealedStorage, StorageKey};
