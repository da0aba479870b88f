//! Per-upstream circuit breakers.
//!
//! One breaker guards each named upstream: every adapter, the remote cache
//! tier, and any sub-endpoint an adapter registers. State transitions are
//! serialized per upstream by the registry's per-entry lock, and every
//! transition is logged with before/after state and trigger.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::BreakerSettings;

/// Breaker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Runtime parameters derived from [`BreakerSettings`].
#[derive(Debug, Clone)]
pub struct BreakerParams {
    pub failure_threshold: u32,
    pub window: Duration,
    pub open_duration: Duration,
    pub half_open_max_probes: u32,
    pub call_timeout: Duration,
}

impl From<&BreakerSettings> for BreakerParams {
    fn from(s: &BreakerSettings) -> Self {
        Self {
            failure_threshold: s.failure_threshold.max(1),
            window: Duration::from_secs(s.window_seconds),
            open_duration: Duration::from_secs(s.open_seconds),
            half_open_max_probes: s.half_open_max_probes.max(1),
            call_timeout: Duration::from_secs(s.call_timeout_seconds),
        }
    }
}

/// Circuit breaker state machine for a single upstream.
#[derive(Debug)]
pub struct CircuitBreaker {
    state: CircuitState,
    /// Failure timestamps within the rolling window.
    failures: Vec<Instant>,
    opened_at: Option<Instant>,
    half_open_probes_inflight: u32,
    params: BreakerParams,
}

/// Outcome of asking the breaker for permission to call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Proceed with a normal call.
    Allowed,
    /// Proceed, but this call is a half-open probe; report its outcome.
    Probe,
    /// Fail fast, the circuit is open.
    Rejected,
}

impl CircuitBreaker {
    pub fn new(params: BreakerParams) -> Self {
        Self {
            state: CircuitState::Closed,
            failures: Vec::new(),
            opened_at: None,
            half_open_probes_inflight: 0,
            params,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    /// Ask permission to make an upstream call.
    pub fn admit(&mut self, upstream: &str) -> Admission {
        match self.state {
            CircuitState::Closed => Admission::Allowed,
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.params.open_duration {
                    self.transition(upstream, CircuitState::HalfOpen, "open_duration_elapsed");
                    self.half_open_probes_inflight = 1;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
            CircuitState::HalfOpen => {
                if self.half_open_probes_inflight < self.params.half_open_max_probes {
                    self.half_open_probes_inflight += 1;
                    Admission::Probe
                } else {
                    Admission::Rejected
                }
            }
        }
    }

    /// Record a successful call.
    pub fn record_success(&mut self, upstream: &str, was_probe: bool) {
        if was_probe {
            self.half_open_probes_inflight = self.half_open_probes_inflight.saturating_sub(1);
        }
        if self.state == CircuitState::HalfOpen {
            self.transition(upstream, CircuitState::Closed, "probe_succeeded");
            self.failures.clear();
            self.half_open_probes_inflight = 0;
        }
    }

    /// Record a failed call (error or timeout).
    pub fn record_failure(&mut self, upstream: &str, was_probe: bool) {
        if was_probe {
            self.half_open_probes_inflight = self.half_open_probes_inflight.saturating_sub(1);
        }
        match self.state {
            CircuitState::HalfOpen => {
                self.transition(upstream, CircuitState::Open, "probe_failed");
                self.opened_at = Some(Instant::now());
                self.half_open_probes_inflight = 0;
            }
            CircuitState::Closed => {
                let now = Instant::now();
                self.failures.push(now);
                let window = self.params.window;
                self.failures.retain(|t| now.duration_since(*t) <= window);
                if self.failures.len() as u32 >= self.params.failure_threshold {
                    self.transition(upstream, CircuitState::Open, "failure_threshold_reached");
                    self.opened_at = Some(now);
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Return an unused probe slot without recording an outcome. Used when
    /// an admitted call is abandoned before reaching the upstream.
    pub fn release_probe(&mut self) {
        self.half_open_probes_inflight = self.half_open_probes_inflight.saturating_sub(1);
    }

    /// Current failure count within the rolling window.
    pub fn failure_count(&self) -> u32 {
        let now = Instant::now();
        self.failures
            .iter()
            .filter(|t| now.duration_since(**t) <= self.params.window)
            .count() as u32
    }

    /// Per-call timeout configured for this upstream.
    pub fn call_timeout(&self) -> Duration {
        self.params.call_timeout
    }

    fn transition(&mut self, upstream: &str, to: CircuitState, trigger: &str) {
        tracing::info!(
            upstream = %upstream,
            from = %self.state,
            to = %to,
            trigger = %trigger,
            timestamp = %chrono::Utc::now().to_rfc3339(),
            "circuit breaker transition"
        );
        self.state = to;
    }
}

/// Process-wide breaker map, one entry per named upstream.
///
/// Entry-level locking in the `DashMap` serializes transitions per
/// upstream; distinct upstreams never contend.
#[derive(Debug, Default)]
pub struct BreakerRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    /// Transition observer hook for metrics (count only).
    transitions: std::sync::atomic::AtomicU64,
}

impl BreakerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an upstream with explicit settings. Re-registration keeps
    /// the existing state.
    pub fn register(&self, upstream: &str, settings: &BreakerSettings) {
        self.breakers
            .entry(upstream.to_string())
            .or_insert_with(|| CircuitBreaker::new(BreakerParams::from(settings)));
    }

    /// Ask permission to call `upstream`. Unregistered upstreams are
    /// fail-open with default settings.
    pub fn admit(&self, upstream: &str) -> Admission {
        let mut entry = self
            .breakers
            .entry(upstream.to_string())
            .or_insert_with(|| CircuitBreaker::new(BreakerParams::from(&BreakerSettings::default())));
        let before = entry.state();
        let admission = entry.admit(upstream);
        if entry.state() != before {
            self.transitions
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
        admission
    }

    /// Report a call outcome for `upstream`.
    pub fn record(&self, upstream: &str, was_probe: bool, success: bool) {
        if let Some(mut entry) = self.breakers.get_mut(upstream) {
            let before = entry.state();
            if success {
                entry.record_success(upstream, was_probe);
            } else {
                entry.record_failure(upstream, was_probe);
            }
            if entry.state() != before {
                self.transitions
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
            }
        }
    }

    /// Return an unused probe slot for `upstream` without an outcome.
    pub fn release_probe(&self, upstream: &str) {
        if let Some(mut entry) = self.breakers.get_mut(upstream) {
            entry.release_probe();
        }
    }

    /// Current state for an upstream (closed if unregistered).
    pub fn state(&self, upstream: &str) -> CircuitState {
        self.breakers
            .get(upstream)
            .map(|b| b.state())
            .unwrap_or(CircuitState::Closed)
    }

    /// Per-call timeout for an upstream.
    pub fn call_timeout(&self, upstream: &str) -> Duration {
        self.breakers
            .get(upstream)
            .map(|b| b.call_timeout())
            .unwrap_or_else(|| Duration::from_secs(10))
    }

    /// Total state transitions since startup.
    pub fn transition_count(&self) -> u64 {
        self.transitions.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn params(threshold: u32, open_ms: u64) -> BreakerParams {
        BreakerParams {
            failure_threshold: threshold,
            window: Duration::from_secs(30),
            open_duration: Duration::from_millis(open_ms),
            half_open_max_probes: 1,
            call_timeout: Duration::from_secs(1),
        }
    }

    #[test]
    fn test_opens_at_threshold() {
        let mut cb = CircuitBreaker::new(params(3, 1000));
        assert_eq!(cb.admit("a"), Admission::Allowed);
        cb.record_failure("a", false);
        cb.record_failure("a", false);
        assert_eq!(cb.state(), CircuitState::Closed);
        cb.record_failure("a", false);
        assert_eq!(cb.state(), CircuitState::Open);
        assert_eq!(cb.admit("a"), Admission::Rejected);
    }

    #[test]
    fn test_half_open_after_open_duration() {
        let mut cb = CircuitBreaker::new(params(1, 0));
        cb.record_failure("a", false);
        assert_eq!(cb.state(), CircuitState::Open);

        // open_duration is zero, so the next admit becomes a probe.
        assert_eq!(cb.admit("a"), Admission::Probe);
        assert_eq!(cb.state(), CircuitState::HalfOpen);

        // Only one probe allowed in flight.
        assert_eq!(cb.admit("a"), Admission::Rejected);

        cb.record_success("a", true);
        assert_eq!(cb.state(), CircuitState::Closed);
        assert_eq!(cb.failure_count(), 0);
    }

    #[test]
    fn test_probe_failure_reopens() {
        let mut cb = CircuitBreaker::new(params(1, 0));
        cb.record_failure("a", false);
        assert_eq!(cb.admit("a"), Admission::Probe);
        cb.record_failure("a", true);
        assert_eq!(cb.state(), CircuitState::Open);
    }

    #[test]
    fn test_registry_fail_open_for_unknown() {
        let registry = BreakerRegistry::new();
        assert_eq!(registry.admit("never-registered"), Admission::Allowed);
        assert_eq!(registry.state("other"), CircuitState::Closed);
    }

    #[test]
    fn test_registry_records_transitions() {
        let registry = BreakerRegistry::new();
        let settings = BreakerSettings {
            failure_threshold: 1,
            ..Default::default()
        };
        registry.register("b", &settings);
        registry.record("b", false, false);
        assert_eq!(registry.state("b"), CircuitState::Open);
        assert!(registry.transition_count() >= 1);
    }
}
