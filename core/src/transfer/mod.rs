//! File transfer engine.
//!
//! Outgoing transfers run one send loop each with adaptive chunk sizing,
//! per-chunk encryption under a secure session, bounded retry and a health
//! monitor. Progress is snapshotted so interrupted transfers come back
//! paused after a restart. The receiving side writes frames at their offsets
//! and verifies each file against the sender's checksum.

mod chunking;
mod engine;
mod fanout;
mod receiver;
mod retry;
mod snapshot;
mod types;

pub use chunking::{compress_chunk, decompress_chunk, AdaptiveChunkSizer};
pub use engine::{SourceFile, TransferEngine};
pub use fanout::{FanoutRequest, FanoutStarted, FanoutStatus, FanoutTarget, ReceiverStatus};
pub use receiver::{ChunkAck, IncomingFile, IncomingTransfer};
pub use retry::{send_with_retry, RetryPolicy, SendReport};
pub use snapshot::TransferStateStore;
pub use types::{
    AggregateMetrics, ChunkFrame, ControlSignal, TransferControl, TransferDirection, TransferError,
    TransferFile, TransferMetrics, TransferPriority, TransferProgress, TransferRequest, TransferSession,
    TransferStarted, TransferStatus,
};
