//! Adapter and engine health monitoring.
//!
//! The monitor keeps a rolling window of call outcomes per adapter (probe
//! results and live fan-out calls both feed it), computes success rates and
//! latency percentiles, and derives a status:
//!
//! - healthy: success rate >= 99% and p95 <= the latency target
//! - degraded: success rate in [90%, 99%) or p95 between the target and 2x
//! - unhealthy: success rate < 90%, p95 >= 2x the target, or breaker open
//!
//! Status snapshots are cached; serving a health query never runs a live
//! probe, so the health surface answers within its 1s bound regardless of
//! adapter state.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::adapter::{AdapterHandle, AdapterState};
use crate::breaker::{BreakerRegistry, CircuitState};

/// Default p95 latency target applied when an adapter has no override.
const DEFAULT_LATENCY_TARGET: Duration = Duration::from_millis(500);

/// Upper bound on a single health probe.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Health classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Point-in-time health view of one adapter or the whole engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub status: HealthStatus,
    pub last_check_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    /// p95 latency over the rolling window, in milliseconds.
    pub latency_ms: u64,
    pub consecutive_failures: u32,
    /// Failure fraction over the rolling window, in `[0, 1]`.
    pub error_rate: f64,
}

impl HealthSnapshot {
    fn unknown() -> Self {
        Self {
            status: HealthStatus::Healthy,
            last_check_at: None,
            last_success_at: None,
            latency_ms: 0,
            consecutive_failures: 0,
            error_rate: 0.0,
        }
    }
}

/// Engine-wide health: aggregate status plus per-adapter summaries.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineHealth {
    pub status: HealthStatus,
    pub adapters: Vec<(String, HealthSnapshot)>,
    pub remote_cache_operable: bool,
}

struct RollingWindow {
    samples: VecDeque<(Instant, bool, Duration)>,
    window: Duration,
}

impl RollingWindow {
    fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    fn record(&mut self, ok: bool, latency: Duration) {
        let now = Instant::now();
        self.samples.push_back((now, ok, latency));
        while let Some((t, _, _)) = self.samples.front() {
            if now.duration_since(*t) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }

    fn success_rate(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let ok = self.samples.iter().filter(|(_, ok, _)| *ok).count();
        Some(ok as f64 / self.samples.len() as f64)
    }

    /// Latency percentile by sort-on-read; windows are small.
    fn percentile(&self, p: f64) -> Duration {
        if self.samples.is_empty() {
            return Duration::ZERO;
        }
        let mut latencies: Vec<Duration> = self.samples.iter().map(|(_, _, l)| *l).collect();
        latencies.sort();
        let rank = ((latencies.len() as f64 * p).ceil() as usize)
            .clamp(1, latencies.len());
        latencies[rank - 1]
    }
}

#[derive(Default)]
struct AdapterHealthState {
    consecutive_failures: u32,
    last_check_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

/// Health monitor shared across the engine.
pub struct HealthMonitor {
    windows: DashMap<String, Mutex<RollingWindow>>,
    states: DashMap<String, Mutex<AdapterHealthState>>,
    snapshots: DashMap<String, HealthSnapshot>,
    latency_targets: DashMap<String, Duration>,
    window: Duration,
    breakers: Arc<BreakerRegistry>,
}

impl HealthMonitor {
    pub fn new(window: Duration, breakers: Arc<BreakerRegistry>) -> Self {
        Self {
            windows: DashMap::new(),
            states: DashMap::new(),
            snapshots: DashMap::new(),
            latency_targets: DashMap::new(),
            window,
            breakers,
        }
    }

    /// Override the latency target for one adapter.
    pub fn set_latency_target(&self, adapter: &str, target: Duration) {
        self.latency_targets.insert(adapter.to_string(), target);
    }

    fn latency_target(&self, adapter: &str) -> Duration {
        self.latency_targets
            .get(adapter)
            .map(|t| *t)
            .unwrap_or(DEFAULT_LATENCY_TARGET)
    }

    /// Record one call outcome for an adapter. Fan-out calls and health
    /// probes both land here.
    pub fn record_call(&self, adapter: &str, ok: bool, latency: Duration) {
        let window = self.window;
        self.windows
            .entry(adapter.to_string())
            .or_insert_with(|| Mutex::new(RollingWindow::new(window)))
            .lock()
            .record(ok, latency);

        let now = Utc::now();
        let state_entry = self
            .states
            .entry(adapter.to_string())
            .or_default();
        let mut state = state_entry.lock();
        state.last_check_at = Some(now);
        if ok {
            state.last_success_at = Some(now);
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures += 1;
        }
    }

    /// Run one bounded health probe against an adapter and refresh its
    /// cached snapshot. Drives the handle's ready/degraded state.
    pub async fn probe(&self, handle: &AdapterHandle) {
        let started = Instant::now();
        let probe = tokio::time::timeout(PROBE_TIMEOUT, handle.adapter.health_check()).await;
        let latency = started.elapsed();

        let healthy = match probe {
            Ok(result) => {
                if let Some(detail) = result.detail.as_deref().filter(|_| !result.healthy) {
                    tracing::warn!(adapter = %handle.name, detail = %detail, "health probe reported unhealthy");
                }
                result.healthy
            }
            Err(_) => {
                tracing::warn!(adapter = %handle.name, timeout_ms = PROBE_TIMEOUT.as_millis() as u64, "health probe timed out");
                false
            }
        };

        self.record_call(&handle.name, healthy, latency);
        let snapshot = self.refresh_snapshot(&handle.name);

        match (handle.state(), snapshot.status) {
            (AdapterState::Ready, HealthStatus::Degraded | HealthStatus::Unhealthy) => {
                handle.set_state(AdapterState::Degraded);
            }
            (AdapterState::Degraded, HealthStatus::Healthy) => {
                handle.set_state(AdapterState::Ready);
            }
            _ => {}
        }
    }

    /// Recompute and cache one adapter's snapshot.
    pub fn refresh_snapshot(&self, adapter: &str) -> HealthSnapshot {
        let status = self.compute_status(adapter);
        let (p95, error_rate) = self
            .windows
            .get(adapter)
            .map(|w| {
                let w = w.lock();
                (
                    w.percentile(0.95),
                    1.0 - w.success_rate().unwrap_or(1.0),
                )
            })
            .unwrap_or((Duration::ZERO, 0.0));
        let (last_check_at, last_success_at, consecutive_failures) = self
            .states
            .get(adapter)
            .map(|s| {
                let s = s.lock();
                (s.last_check_at, s.last_success_at, s.consecutive_failures)
            })
            .unwrap_or((None, None, 0));

        let snapshot = HealthSnapshot {
            status,
            last_check_at,
            last_success_at,
            latency_ms: p95.as_millis() as u64,
            consecutive_failures,
            error_rate,
        };
        self.snapshots
            .insert(adapter.to_string(), snapshot.clone());
        snapshot
    }

    /// Cached snapshot for one adapter (never probes).
    pub fn adapter_snapshot(&self, adapter: &str) -> HealthSnapshot {
        self.snapshots
            .get(adapter)
            .map(|s| s.clone())
            .unwrap_or_else(HealthSnapshot::unknown)
    }

    fn compute_status(&self, adapter: &str) -> HealthStatus {
        if self.breakers.state(adapter) == CircuitState::Open {
            return HealthStatus::Unhealthy;
        }

        let Some(window) = self.windows.get(adapter) else {
            return HealthStatus::Healthy;
        };
        let window = window.lock();
        let Some(success_rate) = window.success_rate() else {
            return HealthStatus::Healthy;
        };
        let p95 = window.percentile(0.95);
        drop(window);

        let target = self.latency_target(adapter);
        if success_rate < 0.90 || p95 >= target * 2 {
            HealthStatus::Unhealthy
        } else if success_rate < 0.99 || p95 > target {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        }
    }

    /// Aggregate engine health from cached adapter snapshots.
    pub fn engine_health(
        &self,
        adapter_names: &[String],
        remote_cache_operable: bool,
    ) -> EngineHealth {
        let adapters: Vec<(String, HealthSnapshot)> = adapter_names
            .iter()
            .map(|name| (name.clone(), self.adapter_snapshot(name)))
            .collect();

        let unhealthy = adapters
            .iter()
            .filter(|(_, s)| s.status == HealthStatus::Unhealthy)
            .count();
        let degraded = adapters
            .iter()
            .filter(|(_, s)| s.status == HealthStatus::Degraded)
            .count();

        let status = if !adapters.is_empty() && unhealthy == adapters.len() {
            HealthStatus::Unhealthy
        } else if unhealthy > 0 || degraded > 0 || !remote_cache_operable {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        EngineHealth {
            status,
            adapters,
            remote_cache_operable,
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::config::BreakerSettings;

    fn monitor() -> HealthMonitor {
        HealthMonitor::new(Duration::from_secs(300), Arc::new(BreakerRegistry::new()))
    }

    fn record_n(m: &HealthMonitor, adapter: &str, ok: usize, failed: usize, latency: Duration) {
        for _ in 0..ok {
            m.record_call(adapter, true, latency);
        }
        for _ in 0..failed {
            m.record_call(adapter, false, latency);
        }
    }

    #[test]
    fn test_healthy_when_fast_and_reliable() {
        let m = monitor();
        record_n(&m, "a", 100, 0, Duration::from_millis(50));
        assert_eq!(m.refresh_snapshot("a").status, HealthStatus::Healthy);
    }

    #[test]
    fn test_degraded_on_moderate_error_rate() {
        let m = monitor();
        record_n(&m, "a", 95, 5, Duration::from_millis(50));
        let snapshot = m.refresh_snapshot("a");
        assert_eq!(snapshot.status, HealthStatus::Degraded);
        assert!((snapshot.error_rate - 0.05).abs() < 1e-9);
    }

    #[test]
    fn test_unhealthy_on_high_error_rate() {
        let m = monitor();
        record_n(&m, "a", 10, 10, Duration::from_millis(50));
        assert_eq!(m.refresh_snapshot("a").status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_degraded_on_slow_p95() {
        let m = monitor();
        record_n(&m, "a", 100, 0, Duration::from_millis(700));
        assert_eq!(m.refresh_snapshot("a").status, HealthStatus::Degraded);
    }

    #[test]
    fn test_unhealthy_on_very_slow_p95() {
        let m = monitor();
        record_n(&m, "a", 100, 0, Duration::from_millis(1200));
        assert_eq!(m.refresh_snapshot("a").status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_latency_target_override() {
        let m = monitor();
        m.set_latency_target("a", Duration::from_secs(5));
        record_n(&m, "a", 100, 0, Duration::from_millis(1200));
        assert_eq!(m.refresh_snapshot("a").status, HealthStatus::Healthy);
    }

    #[test]
    fn test_open_breaker_forces_unhealthy() {
        let breakers = Arc::new(BreakerRegistry::new());
        breakers.register(
            "a",
            &BreakerSettings {
                failure_threshold: 1,
                ..Default::default()
            },
        );
        breakers.record("a", false, false);

        let m = HealthMonitor::new(Duration::from_secs(300), breakers);
        record_n(&m, "a", 100, 0, Duration::from_millis(10));
        assert_eq!(m.refresh_snapshot("a").status, HealthStatus::Unhealthy);
    }

    #[test]
    fn test_consecutive_failures_reset_on_success() {
        let m = monitor();
        m.record_call("a", false, Duration::from_millis(10));
        m.record_call("a", false, Duration::from_millis(10));
        assert_eq!(m.refresh_snapshot("a").consecutive_failures, 2);
        m.record_call("a", true, Duration::from_millis(10));
        let snapshot = m.refresh_snapshot("a");
        assert_eq!(snapshot.consecutive_failures, 0);
        assert!(snapshot.last_success_at.is_some());
    }

    #[test]
    fn test_engine_aggregate_rules() {
        let m = monitor();
        record_n(&m, "good", 100, 0, Duration::from_millis(10));
        record_n(&m, "shaky", 95, 5, Duration::from_millis(10));
        record_n(&m, "down", 0, 20, Duration::from_millis(10));
        for name in ["good", "shaky", "down"] {
            m.refresh_snapshot(name);
        }

        let names: Vec<String> = ["good", "shaky", "down"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let health = m.engine_health(&names, true);
        assert_eq!(health.status, HealthStatus::Degraded);

        // All adapters unhealthy: engine unhealthy.
        let health = m.engine_health(&["down".to_string()], true);
        assert_eq!(health.status, HealthStatus::Unhealthy);

        // Remote cache loss alone degrades the engine.
        let health = m.engine_health(&["good".to_string()], false);
        assert_eq!(health.status, HealthStatus::Degraded);

        let health = m.engine_health(&["good".to_string()], true);
        assert_eq!(health.status, HealthStatus::Healthy);
    }

    #[test]
    fn test_percentiles() {
        let mut w = RollingWindow::new(Duration::from_secs(300));
        for ms in [10u64, 20, 30, 40, 50, 60, 70, 80, 90, 100] {
            w.record(true, Duration::from_millis(ms));
        }
        assert_eq!(w.percentile(0.50), Duration::from_millis(50));
        assert_eq!(w.percentile(0.95), Duration::from_millis(100));
        assert_eq!(w.percentile(0.99), Duration::from_millis(100));
    }
}
