// Bounded retry for chunk sends
//
// One initial attempt plus `max_retries` retries, sleeping base * 2^n between
// them (1s, 2s, 4s with the defaults). The control word is checked before
// every sleep so a cancel never waits out a backoff.

use super::types::{ControlSignal, TransferControl, TransferError};
use crate::config::TransferConfig;
use crate::transport::{TransportError, TransportGateway};
use std::time::Duration;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base_delay: config.retry_base_delay(),
        }
    }

    /// Delay before retry number `retry` (0-based)
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.base_delay.saturating_mul(1u32.checked_shl(retry).unwrap_or(u32::MAX))
    }
}

/// Result of one chunk's send, with the failed attempts it took
#[derive(Debug)]
pub struct SendReport {
    pub failed_attempts: u32,
    pub result: Result<(), TransferError>,
}

pub async fn send_with_retry(
    gateway: &dyn TransportGateway,
    connection_token: &str,
    frame: &[u8],
    index: u64,
    total: u64,
    policy: RetryPolicy,
    control: &TransferControl,
) -> SendReport {
    let mut failed_attempts = 0;
    let mut retry = 0;
    loop {
        let error = match gateway.send_chunk(connection_token, frame, index, total).await {
            Ok(true) => {
                return SendReport {
                    failed_attempts,
                    result: Ok(()),
                }
            }
            Ok(false) => TransportError::SendFailed(format!("chunk {} not acknowledged", index)),
            Err(e) => e,
        };
        failed_attempts += 1;

        if retry >= policy.max_retries {
            warn!("Chunk {} failed after {} attempts: {}", index, failed_attempts, error);
            return SendReport {
                failed_attempts,
                result: Err(error.into()),
            };
        }

        // Pause waits for the in-flight chunk; cancel and abort do not
        if matches!(control.get(), ControlSignal::Cancel | ControlSignal::Abort) {
            return SendReport {
                failed_attempts,
                result: Err(TransferError::Cancelled),
            };
        }

        let delay = policy.delay_for(retry);
        debug!("Retrying chunk {} in {:?}: {}", index, delay, error);
        tokio::time::sleep(delay).await;
        retry += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::LocalGateway;
    use tokio::time::Instant;

    fn policy() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_backoff_doubles() {
        let p = policy();
        assert_eq!(p.delay_for(0), Duration::from_secs(1));
        assert_eq!(p.delay_for(1), Duration::from_secs(2));
        assert_eq!(p.delay_for(2), Duration::from_secs(4));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_within_budget() {
        let gateway = LocalGateway::new();
        gateway.fail_next_sends(2);
        let control = TransferControl::new();

        let started = Instant::now();
        let report = send_with_retry(&gateway, "tok", b"frame", 0, 1, policy(), &control).await;
        assert!(report.result.is_ok());
        assert_eq!(report.failed_attempts, 2);
        assert_eq!(started.elapsed(), Duration::from_secs(3));
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let gateway = LocalGateway::new();
        gateway.fail_next_sends(10);
        let control = TransferControl::new();

        let report = send_with_retry(&gateway, "tok", b"frame", 0, 1, policy(), &control).await;
        assert!(matches!(report.result, Err(TransferError::Transport(_))));
        assert_eq!(report.failed_attempts, 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unacknowledged_sends_are_retried() {
        let gateway = LocalGateway::new();
        gateway.drop_next_acks(1);
        let control = TransferControl::new();

        let report = send_with_retry(&gateway, "tok", b"frame", 0, 1, policy(), &control).await;
        assert!(report.result.is_ok());
        assert_eq!(report.failed_attempts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_checked_before_sleep() {
        let gateway = LocalGateway::new();
        gateway.fail_next_sends(1);
        let control = TransferControl::new();
        control.set(ControlSignal::Cancel);

        let started = Instant::now();
        let report = send_with_retry(&gateway, "tok", b"frame", 0, 1, policy(), &control).await;
        assert!(matches!(report.result, Err(TransferError::Cancelled)));
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}
