//! Per-client admission control for the shared upstream credential.
//!
//! Each client identifier accumulates attempts until it reaches the limit.
//! The attempt that reaches the limit is still admitted and starts a
//! cooldown; everything after it is denied until the cooldown has run out,
//! at which point the next attempt starts a fresh epoch.
//!
//! [`Throttle::query`] reports quota without consuming it and
//! [`Throttle::record`] charges one attempt, so callers can short-circuit
//! before doing upstream work and only pay for work that actually happens.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::clock::{Clock, MonotonicClock};
use crate::error::GatewayError;

/// Throttle parameters, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleSettings {
    /// Attempts admitted per epoch.
    pub limit: u32,
    /// How long a client stays denied after reaching the limit.
    #[serde(with = "humantime_serde")]
    pub cooldown: Duration,
    /// Idle time after which a record is evicted by [`Throttle::sweep`].
    #[serde(with = "humantime_serde")]
    pub retention: Duration,
}

impl Default for ThrottleSettings {
    fn default() -> Self {
        Self {
            limit: 10,
            cooldown: Duration::from_secs(15 * 60),
            retention: Duration::from_secs(15 * 60),
        }
    }
}

impl ThrottleSettings {
    pub fn new(limit: u32, cooldown: Duration, retention: Duration) -> Self {
        Self {
            limit,
            cooldown,
            retention,
        }
    }

    /// Reject settings the throttle cannot honour.
    ///
    /// A retention shorter than the cooldown would let the sweep evict a
    /// client in the middle of its cooldown and hand it a fresh quota.
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.limit == 0 {
            return Err(GatewayError::Configuration(
                "Rate limit must be greater than 0".to_string(),
            ));
        }
        if self.cooldown.is_zero() {
            return Err(GatewayError::Configuration(
                "Cooldown must be greater than 0".to_string(),
            ));
        }
        if self.retention < self.cooldown {
            return Err(GatewayError::Configuration(format!(
                "Retention ({}) must not be shorter than cooldown ({})",
                humantime::format_duration(self.retention),
                humantime::format_duration(self.cooldown),
            )));
        }
        Ok(())
    }
}

/// State tracked for one client identifier.
#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub count: u32,
    pub cooldown_started_at: Option<Instant>,
    pub last_seen_at: Instant,
}

impl ClientRecord {
    fn new(now: Instant) -> Self {
        Self {
            count: 0,
            cooldown_started_at: None,
            last_seen_at: now,
        }
    }

    fn cooldown_ends_at(&self, cooldown: Duration) -> Option<Instant> {
        self.cooldown_started_at.map(|started| started + cooldown)
    }
}

/// Quota snapshot handed to callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaStatus {
    pub remaining: u32,
    pub limit: u32,
    /// End of the active cooldown, or an estimate of one full cooldown from
    /// now when none is active.
    pub reset_at: Instant,
    /// `reset_at` relative to the instant the status was taken.
    pub reset_in: Duration,
}

/// Outcome of [`Throttle::record`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub status: QuotaStatus,
}

pub struct Throttle {
    settings: ThrottleSettings,
    clock: Arc<dyn Clock>,
    records: Mutex<HashMap<String, ClientRecord>>,
}

impl Throttle {
    pub fn new(settings: ThrottleSettings, clock: Arc<dyn Clock>) -> Self {
        Self {
            settings,
            clock,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Throttle on the process monotonic clock.
    pub fn with_settings(settings: ThrottleSettings) -> Self {
        Self::new(settings, Arc::new(MonotonicClock))
    }

    pub fn settings(&self) -> &ThrottleSettings {
        &self.settings
    }

    /// Report the quota left for `client_id` without consuming any.
    ///
    /// Unknown clients and clients whose cooldown has run out report a full
    /// quota. Nothing is created or reset here; the lazy reset happens on
    /// the next [`Throttle::record`].
    pub fn query(&self, client_id: &str) -> QuotaStatus {
        let now = self.clock.now();
        let limit = self.settings.limit;
        let estimate = now + self.settings.cooldown;

        let records = self.records();
        let (remaining, reset_at) = match records.get(client_id) {
            None => (limit, estimate),
            Some(record) => match record.cooldown_ends_at(self.settings.cooldown) {
                Some(ends_at) if now < ends_at => (0, ends_at),
                Some(_) => (limit, estimate),
                None => (limit.saturating_sub(record.count), estimate),
            },
        };
        drop(records);

        self.status(now, remaining, reset_at)
    }

    /// Charge one attempt to `client_id`.
    pub fn record(&self, client_id: &str) -> Admission {
        let now = self.clock.now();
        let limit = self.settings.limit;
        let cooldown = self.settings.cooldown;

        let mut records = self.records();
        let record = records
            .entry(client_id.to_owned())
            .or_insert_with(|| ClientRecord::new(now));
        record.last_seen_at = now;

        if let Some(ends_at) = record.cooldown_ends_at(cooldown) {
            if now < ends_at {
                debug!(client_id = %client_id, "Attempt denied during cooldown");
                return Admission {
                    allowed: false,
                    status: self.status(now, 0, ends_at),
                };
            }

            info!(client_id = %client_id, "Cooldown expired, quota restored");
            record.count = 0;
            record.cooldown_started_at = None;
        }

        record.count = record.count.saturating_add(1);

        let remaining = if record.count >= limit {
            record.cooldown_started_at = Some(now);
            info!(
                client_id = %client_id,
                limit,
                cooldown = %humantime::format_duration(cooldown),
                "Rate limit reached, cooldown started"
            );
            0
        } else {
            limit - record.count
        };

        Admission {
            allowed: true,
            status: self.status(now, remaining, now + cooldown),
        }
    }

    /// Evict records that have been idle for longer than the retention window.
    pub fn sweep(&self) {
        let now = self.clock.now();
        let retention = self.settings.retention;

        let mut records = self.records();
        let before = records.len();
        records.retain(|_, record| now.saturating_duration_since(record.last_seen_at) <= retention);
        let evicted = before - records.len();

        if evicted > 0 {
            debug!(evicted, tracked = records.len(), "Swept idle client records");
        }
    }

    /// Number of client identifiers currently tracked.
    pub fn tracked_clients(&self) -> usize {
        self.records().len()
    }

    fn records(&self) -> MutexGuard<'_, HashMap<String, ClientRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn status(&self, now: Instant, remaining: u32, reset_at: Instant) -> QuotaStatus {
        QuotaStatus {
            remaining,
            limit: self.settings.limit,
            reset_at,
            reset_in: reset_at.saturating_duration_since(now),
        }
    }
}

/// Run [`Throttle::sweep`] every `every` until the returned task is aborted.
///
/// `every` must be non-zero.
pub fn spawn_sweeper(throttle: Arc<Throttle>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;

        loop {
            ticker.tick().await;
            throttle.sweep();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    const MINUTE: Duration = Duration::from_secs(60);

    fn throttle_with_clock(limit: u32) -> (Throttle, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new());
        let settings = ThrottleSettings::new(limit, 15 * MINUTE, 20 * MINUTE);
        (Throttle::new(settings, clock.clone()), clock)
    }

    #[test]
    fn test_unknown_client_has_full_quota() {
        let (throttle, _clock) = throttle_with_clock(10);
        let status = throttle.query("203.0.113.7");
        assert_eq!(status.remaining, 10);
        assert_eq!(status.limit, 10);
        assert_eq!(status.reset_in, 15 * MINUTE);
    }

    #[test]
    fn test_query_does_not_consume_or_create() {
        let (throttle, _clock) = throttle_with_clock(3);
        for _ in 0..5 {
            assert_eq!(throttle.query("a").remaining, 3);
        }
        assert_eq!(throttle.tracked_clients(), 0);

        throttle.record("a");
        assert_eq!(throttle.query("a").remaining, 2);
        assert_eq!(throttle.query("a").remaining, 2);
    }

    #[test]
    fn test_ten_attempts_then_denied() {
        let (throttle, clock) = throttle_with_clock(10);

        for call in 1..=9 {
            let admission = throttle.record("A");
            assert!(admission.allowed, "call {call} should be allowed");
            assert_eq!(admission.status.remaining, 10 - call);
        }

        let tenth = throttle.record("A");
        assert!(tenth.allowed);
        assert_eq!(tenth.status.remaining, 0);
        let cooldown_ends = clock.now() + 15 * MINUTE;
        assert_eq!(tenth.status.reset_at, cooldown_ends);

        let eleventh = throttle.record("A");
        assert!(!eleventh.allowed);
        assert_eq!(eleventh.status.remaining, 0);
        assert_eq!(eleventh.status.reset_at, cooldown_ends);
        assert_eq!(eleventh.status.reset_in, 15 * MINUTE);
    }

    #[test]
    fn test_reset_time_is_stable_during_cooldown() {
        let (throttle, clock) = throttle_with_clock(2);
        throttle.record("a");
        let trip = throttle.record("a");
        let ends_at = trip.status.reset_at;

        for _ in 0..14 {
            clock.advance(MINUTE);
            let queried = throttle.query("a");
            assert_eq!(queried.remaining, 0);
            assert_eq!(queried.reset_at, ends_at);

            let denied = throttle.record("a");
            assert!(!denied.allowed);
            assert_eq!(denied.status.reset_at, ends_at);
            assert_eq!(denied.status.reset_in, ends_at - clock.now());
        }
    }

    #[test]
    fn test_denied_attempts_do_not_extend_cooldown() {
        let (throttle, clock) = throttle_with_clock(1);
        assert!(throttle.record("a").allowed);

        clock.advance(10 * MINUTE);
        assert!(!throttle.record("a").allowed);

        clock.advance(5 * MINUTE);
        let after = throttle.record("a");
        assert!(after.allowed);
    }

    #[test]
    fn test_cooldown_expiry_starts_fresh_epoch() {
        let (throttle, clock) = throttle_with_clock(10);
        for _ in 0..10 {
            throttle.record("A");
        }

        clock.advance(15 * MINUTE);
        assert_eq!(throttle.query("A").remaining, 10);

        let admission = throttle.record("A");
        assert!(admission.allowed);
        assert_eq!(admission.status.remaining, 9);
    }

    #[test]
    fn test_expired_cooldown_is_not_normalized_by_query() {
        let (throttle, clock) = throttle_with_clock(1);
        throttle.record("a");
        clock.advance(16 * MINUTE);

        let status = throttle.query("a");
        assert_eq!(status.remaining, 1);
        assert_eq!(status.reset_in, 15 * MINUTE);

        let admission = throttle.record("a");
        assert!(admission.allowed);
        assert_eq!(admission.status.remaining, 0);
    }

    #[test]
    fn test_clients_are_isolated() {
        let (throttle, _clock) = throttle_with_clock(3);
        for _ in 0..4 {
            throttle.record("noisy");
        }
        assert!(!throttle.record("noisy").allowed);

        assert_eq!(throttle.query("quiet").remaining, 3);
        let admission = throttle.record("quiet");
        assert!(admission.allowed);
        assert_eq!(admission.status.remaining, 2);
    }

    #[test]
    fn test_limit_of_one_trips_on_first_attempt() {
        let (throttle, _clock) = throttle_with_clock(1);
        let first = throttle.record("a");
        assert!(first.allowed);
        assert_eq!(first.status.remaining, 0);
        assert!(!throttle.record("a").allowed);
    }

    #[test]
    fn test_sweep_evicts_only_idle_records() {
        let (throttle, clock) = throttle_with_clock(10);
        throttle.record("old");
        clock.advance(10 * MINUTE);
        throttle.record("recent");
        clock.advance(10 * MINUTE + Duration::from_secs(1));

        throttle.sweep();

        assert_eq!(throttle.tracked_clients(), 1);
        assert_eq!(throttle.query("recent").remaining, 9);
        assert_eq!(throttle.query("old").remaining, 10);
    }

    #[test]
    fn test_sweep_keeps_record_exactly_at_retention() {
        let (throttle, clock) = throttle_with_clock(10);
        throttle.record("a");
        clock.advance(20 * MINUTE);

        throttle.sweep();
        assert_eq!(throttle.tracked_clients(), 1);

        clock.advance(Duration::from_millis(1));
        throttle.sweep();
        assert_eq!(throttle.tracked_clients(), 0);
    }

    #[test]
    fn test_sweep_never_forgives_active_cooldown() {
        let (throttle, clock) = throttle_with_clock(1);
        throttle.record("a");
        clock.advance(15 * MINUTE - Duration::from_secs(1));

        throttle.sweep();
        assert!(!throttle.record("a").allowed);
    }

    #[test]
    fn test_settings_validation() {
        assert!(ThrottleSettings::default().validate().is_ok());
        assert!(ThrottleSettings::new(0, 15 * MINUTE, 15 * MINUTE).validate().is_err());
        assert!(ThrottleSettings::new(10, Duration::ZERO, 15 * MINUTE).validate().is_err());
        assert!(ThrottleSettings::new(10, 15 * MINUTE, 10 * MINUTE).validate().is_err());
    }

    #[test]
    fn test_concurrent_records_never_overshoot() {
        let throttle = Arc::new(Throttle::with_settings(ThrottleSettings::new(
            50,
            15 * MINUTE,
            15 * MINUTE,
        )));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let throttle = throttle.clone();
                std::thread::spawn(move || {
                    (0..20).filter(|_| throttle.record("shared").allowed).count()
                })
            })
            .collect();

        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(admitted, 50);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_task_evicts_on_schedule() {
        let (throttle, clock) = throttle_with_clock(10);
        let throttle = Arc::new(throttle);
        throttle.record("a");
        clock.advance(21 * MINUTE);

        let sweeper = spawn_sweeper(throttle.clone(), Duration::from_secs(30));
        assert_eq!(throttle.tracked_clients(), 1);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(throttle.tracked_clients(), 0);

        sweeper.abort();
    }
}
