//! Sliding-window rate limiter.
//!
//! Admission control per key (device id or connection id) and category, plus a
//! global transfer ceiling shared by every device. Each key's windows sit
//! behind their own lock so concurrent checks on different devices never
//! contend and concurrent checks on one device never lose an update.

use crate::config::{RateLimitConfig, RateRule};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

const GLOBAL_KEY: &str = "__global__";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RateCategory {
    Discovery,
    Connection,
    Transfer,
    InvalidFrame,
}

impl RateCategory {
    /// Most restrictive first
    pub const BY_SEVERITY: [RateCategory; 4] = [
        RateCategory::InvalidFrame,
        RateCategory::Transfer,
        RateCategory::Connection,
        RateCategory::Discovery,
    ];
}

impl fmt::Display for RateCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            RateCategory::Discovery => "discovery",
            RateCategory::Connection => "connection",
            RateCategory::Transfer => "transfer",
            RateCategory::InvalidFrame => "invalid-frame",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{category} rate limit exceeded for {key}, retry after {retry_after:?}")]
pub struct RateLimitError {
    pub key: String,
    pub category: RateCategory,
    pub retry_after: Duration,
}

/// Diagnostics snapshot for one key
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStatus {
    pub key: String,
    pub discovery_count: usize,
    pub connection_count: usize,
    pub transfer_count: usize,
    pub invalid_frame_count: usize,
    /// Most restrictive category currently at its ceiling
    pub most_restrictive: Option<RateCategory>,
}

#[derive(Default)]
struct KeyWindows {
    windows: HashMap<RateCategory, VecDeque<Instant>>,
}

impl KeyWindows {
    fn evict(&mut self, category: RateCategory, window: Duration, now: Instant) -> &mut VecDeque<Instant> {
        let entries = self.windows.entry(category).or_default();
        while let Some(oldest) = entries.front() {
            if now.saturating_duration_since(*oldest) >= window {
                entries.pop_front();
            } else {
                break;
            }
        }
        entries
    }

    fn last_activity(&self) -> Option<Instant> {
        self.windows.values().filter_map(|w| w.back().copied()).max()
    }
}

fn exceeded(
    key: &str,
    category: RateCategory,
    rule: RateRule,
    entries: &VecDeque<Instant>,
    now: Instant,
) -> RateLimitError {
    let retry_after = entries
        .front()
        .map(|oldest| (*oldest + rule.window()).saturating_duration_since(now))
        .unwrap_or_default();
    warn!(key, %category, ?retry_after, "rate limit exceeded");
    RateLimitError {
        key: key.to_string(),
        category,
        retry_after,
    }
}

pub struct RateLimiter {
    config: RateLimitConfig,
    keys: RwLock<HashMap<String, Arc<Mutex<KeyWindows>>>>,
    /// Serializes transfer admissions, which touch a device key and the global key
    transfer_gate: Mutex<()>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            keys: RwLock::new(HashMap::new()),
            transfer_gate: Mutex::new(()),
        }
    }

    fn rule(&self, category: RateCategory) -> RateRule {
        match category {
            RateCategory::Discovery => self.config.discovery,
            RateCategory::Connection => self.config.connection,
            RateCategory::Transfer => self.config.transfer,
            RateCategory::InvalidFrame => self.config.invalid_frame,
        }
    }

    fn windows_for(&self, key: &str) -> Arc<Mutex<KeyWindows>> {
        if let Some(existing) = self.keys.read().get(key) {
            return existing.clone();
        }
        self.keys
            .write()
            .entry(key.to_string())
            .or_default()
            .clone()
    }

    // ------------------------------------------------------------------------
    // Generic operations, time injected for deterministic tests
    // ------------------------------------------------------------------------

    pub fn is_allowed_at(&self, key: &str, category: RateCategory, now: Instant) -> bool {
        self.check_rule_at(key, category, self.rule(category), now)
    }

    pub fn record_at(&self, key: &str, category: RateCategory, now: Instant) {
        let rule = self.rule(category);
        let windows = self.windows_for(key);
        let mut windows = windows.lock();
        windows.evict(category, rule.window(), now).push_back(now);
    }

    /// Check and record in one critical section
    pub fn admit_at(&self, key: &str, category: RateCategory, now: Instant) -> Result<(), RateLimitError> {
        self.admit_rule_at(key, category, self.rule(category), now)
    }

    fn check_rule_at(&self, key: &str, category: RateCategory, rule: RateRule, now: Instant) -> bool {
        let windows = self.windows_for(key);
        let mut windows = windows.lock();
        windows.evict(category, rule.window(), now).len() < rule.max_requests
    }

    fn admit_rule_at(
        &self,
        key: &str,
        category: RateCategory,
        rule: RateRule,
        now: Instant,
    ) -> Result<(), RateLimitError> {
        let windows = self.windows_for(key);
        let mut windows = windows.lock();
        let entries = windows.evict(category, rule.window(), now);
        if entries.len() >= rule.max_requests {
            return Err(exceeded(key, category, rule, entries, now));
        }
        entries.push_back(now);
        Ok(())
    }

    /// Err unless `needed` more requests fit in the key's window
    fn check_room_at(
        &self,
        key: &str,
        category: RateCategory,
        rule: RateRule,
        now: Instant,
        needed: usize,
    ) -> Result<(), RateLimitError> {
        let windows = self.windows_for(key);
        let mut windows = windows.lock();
        let entries = windows.evict(category, rule.window(), now);
        if entries.len() + needed <= rule.max_requests {
            Ok(())
        } else {
            Err(exceeded(key, category, rule, entries, now))
        }
    }

    // ------------------------------------------------------------------------
    // Per-category convenience API
    // ------------------------------------------------------------------------

    pub fn is_discovery_allowed(&self, key: &str) -> bool {
        self.is_allowed_at(key, RateCategory::Discovery, Instant::now())
    }

    pub fn record_discovery(&self, key: &str) {
        self.record_at(key, RateCategory::Discovery, Instant::now())
    }

    pub fn is_connection_allowed(&self, key: &str) -> bool {
        self.is_allowed_at(key, RateCategory::Connection, Instant::now())
    }

    pub fn record_connection(&self, key: &str) {
        self.record_at(key, RateCategory::Connection, Instant::now())
    }

    /// Per-device transfer ceiling; see [`Self::is_global_transfer_allowed`]
    pub fn is_transfer_allowed(&self, key: &str) -> bool {
        self.is_allowed_at(key, RateCategory::Transfer, Instant::now())
    }

    pub fn record_transfer(&self, key: &str) {
        let _gate = self.transfer_gate.lock();
        let now = Instant::now();
        self.record_at(key, RateCategory::Transfer, now);
        let rule = self.config.global_transfer;
        let windows = self.windows_for(GLOBAL_KEY);
        windows
            .lock()
            .evict(RateCategory::Transfer, rule.window(), now)
            .push_back(now);
    }

    pub fn is_global_transfer_allowed(&self) -> bool {
        self.check_rule_at(
            GLOBAL_KEY,
            RateCategory::Transfer,
            self.config.global_transfer,
            Instant::now(),
        )
    }

    pub fn is_invalid_frame_allowed(&self, connection_id: &str) -> bool {
        self.is_allowed_at(connection_id, RateCategory::InvalidFrame, Instant::now())
    }

    pub fn record_invalid_frame(&self, connection_id: &str) {
        self.record_at(connection_id, RateCategory::InvalidFrame, Instant::now())
    }

    pub fn admit_discovery(&self, key: &str) -> Result<(), RateLimitError> {
        self.admit_at(key, RateCategory::Discovery, Instant::now())
    }

    pub fn admit_connection(&self, key: &str) -> Result<(), RateLimitError> {
        self.admit_at(key, RateCategory::Connection, Instant::now())
    }

    /// Admit a transfer against both the device and the global ceiling
    pub fn admit_transfer(&self, key: &str) -> Result<(), RateLimitError> {
        self.admit_transfer_at(key, Instant::now())
    }

    pub fn admit_transfer_at(&self, key: &str, now: Instant) -> Result<(), RateLimitError> {
        self.admit_transfers_at(&[key], now)
    }

    /// Admit one transfer per key, all or nothing: when any device or the
    /// global ceiling would be exceeded nothing is charged
    pub fn admit_transfers(&self, keys: &[&str]) -> Result<(), RateLimitError> {
        self.admit_transfers_at(keys, Instant::now())
    }

    pub fn admit_transfers_at(&self, keys: &[&str], now: Instant) -> Result<(), RateLimitError> {
        let _gate = self.transfer_gate.lock();
        let device_rule = self.config.transfer;
        let global = self.config.global_transfer;

        self.check_room_at(GLOBAL_KEY, RateCategory::Transfer, global, now, keys.len())?;
        let mut per_key: HashMap<&str, usize> = HashMap::new();
        for key in keys.iter().copied() {
            *per_key.entry(key).or_default() += 1;
        }
        for (key, needed) in &per_key {
            self.check_room_at(key, RateCategory::Transfer, device_rule, now, *needed)?;
        }

        for key in keys.iter().copied().chain(std::iter::repeat(GLOBAL_KEY).take(keys.len())) {
            let rule = if key == GLOBAL_KEY { global } else { device_rule };
            self.windows_for(key)
                .lock()
                .evict(RateCategory::Transfer, rule.window(), now)
                .push_back(now);
        }
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Diagnostics and maintenance
    // ------------------------------------------------------------------------

    pub fn get_rate_limit_status(&self, key: &str) -> RateLimitStatus {
        self.status_at(key, Instant::now())
    }

    pub fn status_at(&self, key: &str, now: Instant) -> RateLimitStatus {
        let windows = self.windows_for(key);
        let mut windows = windows.lock();
        let mut counts = HashMap::new();
        for category in RateCategory::BY_SEVERITY {
            let rule = self.rule(category);
            counts.insert(category, windows.evict(category, rule.window(), now).len());
        }

        let most_restrictive = RateCategory::BY_SEVERITY
            .into_iter()
            .find(|category| counts[category] >= self.rule(*category).max_requests);

        RateLimitStatus {
            key: key.to_string(),
            discovery_count: counts[&RateCategory::Discovery],
            connection_count: counts[&RateCategory::Connection],
            transfer_count: counts[&RateCategory::Transfer],
            invalid_frame_count: counts[&RateCategory::InvalidFrame],
            most_restrictive,
        }
    }

    /// Drop keys with no activity inside the longest window
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Instant::now())
    }

    pub fn cleanup_at(&self, now: Instant) -> usize {
        let horizon = [
            self.config.discovery,
            self.config.connection,
            self.config.transfer,
            self.config.invalid_frame,
            self.config.global_transfer,
        ]
        .iter()
        .map(|rule| rule.window())
        .max()
        .unwrap_or_default();

        let mut keys = self.keys.write();
        let before = keys.len();
        keys.retain(|_, windows| {
            windows
                .lock()
                .last_activity()
                .map(|last| now.saturating_duration_since(last) < horizon)
                .unwrap_or(false)
        });
        let removed = before - keys.len();
        if removed > 0 {
            debug!(removed, "rate limiter dropped idle keys");
        }
        removed
    }

    pub fn tracked_keys(&self) -> usize {
        self.keys.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    #[test]
    fn test_ceiling_then_window_expiry() {
        let limiter = limiter();
        let start = Instant::now();
        let rule = RateLimitConfig::default().connection;

        for _ in 0..rule.max_requests {
            assert!(limiter.is_allowed_at("dev", RateCategory::Connection, start));
            limiter.record_at("dev", RateCategory::Connection, start);
        }
        assert!(!limiter.is_allowed_at("dev", RateCategory::Connection, start));

        let later = start + rule.window() + Duration::from_millis(1);
        assert!(limiter.is_allowed_at("dev", RateCategory::Connection, later));
    }

    #[test]
    fn test_categories_and_keys_are_independent() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..3 {
            limiter.record_at("a", RateCategory::Connection, now);
        }
        assert!(!limiter.is_allowed_at("a", RateCategory::Connection, now));
        assert!(limiter.is_allowed_at("a", RateCategory::Discovery, now));
        assert!(limiter.is_allowed_at("b", RateCategory::Connection, now));
    }

    #[test]
    fn test_admit_reports_retry_after() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..10 {
            limiter.admit_at("dev", RateCategory::Discovery, now).unwrap();
        }
        let err = limiter
            .admit_at("dev", RateCategory::Discovery, now + Duration::from_secs(20))
            .unwrap_err();
        assert_eq!(err.category, RateCategory::Discovery);
        assert_eq!(err.retry_after, Duration::from_secs(40));
    }

    #[test]
    fn test_global_transfer_ceiling() {
        let mut config = RateLimitConfig::default();
        config.global_transfer = RateRule::new(3, 60);
        let limiter = RateLimiter::new(config);
        let now = Instant::now();

        limiter.admit_transfer_at("a", now).unwrap();
        limiter.admit_transfer_at("b", now).unwrap();
        limiter.admit_transfer_at("c", now).unwrap();

        let err = limiter.admit_transfer_at("d", now).unwrap_err();
        assert_eq!(err.key, GLOBAL_KEY);
        // device "d" was never charged
        assert_eq!(limiter.status_at("d", now).transfer_count, 0);
    }

    #[test]
    fn test_batch_transfer_admission_is_all_or_nothing() {
        let mut config = RateLimitConfig::default();
        config.transfer = RateRule::new(2, 60);
        let limiter = RateLimiter::new(config);
        let now = Instant::now();
        limiter.admit_transfer_at("b", now).unwrap();
        limiter.admit_transfer_at("b", now).unwrap();

        let err = limiter.admit_transfers_at(&["a", "b", "c"], now).unwrap_err();
        assert_eq!(err.key, "b");
        assert_eq!(limiter.status_at("a", now).transfer_count, 0);
        assert_eq!(limiter.status_at("c", now).transfer_count, 0);
        assert_eq!(limiter.status_at(GLOBAL_KEY, now).transfer_count, 2);

        // Duplicates count against the same device
        assert!(limiter.admit_transfers_at(&["a", "a", "a"], now).is_err());
        limiter.admit_transfers_at(&["a", "c"], now).unwrap();
        assert_eq!(limiter.status_at(GLOBAL_KEY, now).transfer_count, 4);
    }

    #[test]
    fn test_most_restrictive_ordering() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..3 {
            limiter.record_at("dev", RateCategory::Connection, now);
        }
        for _ in 0..10 {
            limiter.record_at("dev", RateCategory::Discovery, now);
        }
        let status = limiter.status_at("dev", now);
        assert_eq!(status.most_restrictive, Some(RateCategory::Connection));
        assert_eq!(status.discovery_count, 10);

        for _ in 0..10 {
            limiter.record_at("dev", RateCategory::InvalidFrame, now);
        }
        assert_eq!(
            limiter.status_at("dev", now).most_restrictive,
            Some(RateCategory::InvalidFrame)
        );
        assert_eq!(limiter.status_at("idle", now).most_restrictive, None);
    }

    #[test]
    fn test_cleanup_drops_idle_keys() {
        let limiter = limiter();
        let now = Instant::now();
        limiter.record_at("old", RateCategory::Discovery, now);
        limiter.record_at("fresh", RateCategory::Discovery, now + Duration::from_secs(290));

        let removed = limiter.cleanup_at(now + Duration::from_secs(301));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    #[test]
    fn test_concurrent_admission_does_not_lose_updates() {
        let limiter = Arc::new(limiter());
        let now = Instant::now();
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let limiter = limiter.clone();
                std::thread::spawn(move || {
                    (0..10)
                        .filter(|_| limiter.admit_at("dev", RateCategory::InvalidFrame, now).is_ok())
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 10);
    }
}
