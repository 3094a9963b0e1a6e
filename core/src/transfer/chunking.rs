// Adaptive chunk sizing and optional LZ4 compression

use crate::config::TransferConfig;
use std::collections::VecDeque;

const FAST_THROUGHPUT: f64 = 1024.0 * 1024.0;
const SLOW_THROUGHPUT: f64 = 100.0 * 1024.0;
const MAX_ERROR_RATE: f64 = 0.10;
/// Outcomes kept for the rolling error rate
const OUTCOME_WINDOW: usize = 20;

/// Chunk size that follows measured throughput and recent errors
#[derive(Debug, Clone)]
pub struct AdaptiveChunkSizer {
    min: usize,
    max: usize,
    current: usize,
    outcomes: VecDeque<bool>,
}

impl AdaptiveChunkSizer {
    /// `prior_throughput` is the last measured bytes/sec for this engine, if any
    pub fn new(config: &TransferConfig, prior_throughput: Option<f64>) -> Self {
        let initial = match prior_throughput {
            Some(speed) if speed > FAST_THROUGHPUT => config.fast_chunk_size,
            _ => config.default_chunk_size,
        };
        let min = config.min_chunk_size.max(1);
        let max = config.max_chunk_size.max(min);
        Self {
            min,
            max,
            current: initial.clamp(min, max),
            outcomes: VecDeque::with_capacity(OUTCOME_WINDOW),
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    fn push(&mut self, ok: bool) {
        if self.outcomes.len() == OUTCOME_WINDOW {
            self.outcomes.pop_front();
        }
        self.outcomes.push_back(ok);
    }

    pub fn record_success(&mut self) {
        self.push(true);
    }

    pub fn record_error(&mut self) {
        self.push(false);
    }

    pub fn error_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.0;
        }
        let errors = self.outcomes.iter().filter(|ok| !**ok).count();
        errors as f64 / self.outcomes.len() as f64
    }

    /// Re-size from the current average throughput (bytes/sec)
    pub fn adjust(&mut self, average_speed: f64) -> usize {
        let mut next = self.current as f64;
        if average_speed > FAST_THROUGHPUT {
            next *= 1.5;
        } else if average_speed > 0.0 && average_speed < SLOW_THROUGHPUT {
            next *= 0.5;
        }
        if self.error_rate() > MAX_ERROR_RATE {
            next *= 0.8;
        }
        self.current = (next as usize).clamp(self.min, self.max);
        self.current
    }
}

/// LZ4 with a size prefix. `None` when compression would not shrink the chunk.
pub fn compress_chunk(data: &[u8]) -> Option<Vec<u8>> {
    let compressed = lz4_flex::compress_prepend_size(data);
    (compressed.len() < data.len()).then_some(compressed)
}

pub fn decompress_chunk(data: &[u8]) -> Result<Vec<u8>, lz4_flex::block::DecompressError> {
    lz4_flex::decompress_size_prepended(data)
}

#[cfg(test)]
mod tests {
    use super::*;

    const KIB: usize = 1024;

    #[test]
    fn test_initial_size_follows_history() {
        let config = TransferConfig::default();
        assert_eq!(AdaptiveChunkSizer::new(&config, None).current(), 64 * KIB);
        assert_eq!(AdaptiveChunkSizer::new(&config, Some(50_000.0)).current(), 64 * KIB);
        assert_eq!(
            AdaptiveChunkSizer::new(&config, Some(4.0 * 1024.0 * 1024.0)).current(),
            256 * KIB
        );
    }

    #[test]
    fn test_scaling_rules() {
        let config = TransferConfig::default();
        let mut sizer = AdaptiveChunkSizer::new(&config, None);

        assert_eq!(sizer.adjust(2.0 * 1024.0 * 1024.0), 96 * KIB);
        assert_eq!(sizer.adjust(500.0 * 1024.0), 96 * KIB);
        assert_eq!(sizer.adjust(50.0 * 1024.0), 48 * KIB);
    }

    #[test]
    fn test_error_rate_shrinks_chunks() {
        let config = TransferConfig::default();
        let mut sizer = AdaptiveChunkSizer::new(&config, None);
        for _ in 0..8 {
            sizer.record_success();
        }
        sizer.record_error();
        sizer.record_error();
        assert!(sizer.error_rate() > 0.1);
        assert_eq!(sizer.adjust(500.0 * 1024.0), (64.0 * 1024.0 * 0.8) as usize);
    }

    #[test]
    fn test_bounds_hold() {
        let config = TransferConfig::default();
        let mut sizer = AdaptiveChunkSizer::new(&config, None);
        for _ in 0..50 {
            sizer.adjust(100.0 * 1024.0 * 1024.0);
        }
        assert_eq!(sizer.current(), 1024 * KIB);
        for _ in 0..50 {
            sizer.adjust(10.0);
        }
        assert_eq!(sizer.current(), KIB);
    }

    #[test]
    fn test_compression_only_when_smaller() {
        let text = vec![b'a'; 4096];
        let packed = compress_chunk(&text).unwrap();
        assert!(packed.len() < text.len());
        assert_eq!(decompress_chunk(&packed).unwrap(), text);

        let noise: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2_654_435_761) >> 24) as u8).collect();
        assert!(compress_chunk(&noise).is_none());
    }
}
