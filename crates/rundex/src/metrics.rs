//! Prometheus metrics for the engine.
//!
//! One [`EngineMetrics`] instance is owned by the engine and shared with
//! the background tasks. The wire layer exposes [`EngineMetrics::gather`]
//! on its metrics endpoint. Counters reset only on explicit
//! [`EngineMetrics::reset`].

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry,
    TextEncoder,
};

use crate::error::{EngineError, Result};

/// Tool latency buckets (seconds).
const TOOL_LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Adapter call latency buckets (seconds).
const ADAPTER_LATENCY_BUCKETS: &[f64] = &[0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0];

/// Prometheus metrics for the rundex engine.
#[derive(Clone)]
pub struct EngineMetrics {
    /// The Prometheus registry.
    pub registry: Registry,

    // ============ Tool Metrics ============
    /// Tool calls by tool and status code.
    pub tool_requests_total: IntCounterVec,
    /// Tool call duration by tool.
    pub tool_duration_seconds: HistogramVec,

    // ============ Adapter Metrics ============
    /// Adapter calls by adapter and outcome (ok, error, timeout).
    pub adapter_calls_total: IntCounterVec,
    /// Adapter call duration by adapter.
    pub adapter_duration_seconds: HistogramVec,

    // ============ Cache Metrics ============
    /// Cache hits by tier (memory, remote).
    pub cache_hits_total: IntCounterVec,
    /// Cache misses (both tiers missed).
    pub cache_misses_total: IntCounter,
    /// Current memory tier entry count.
    pub cache_memory_entries: IntGauge,

    // ============ Breaker Metrics ============
    /// Breaker state transitions.
    pub breaker_transitions_total: IntCounter,
    /// Breaker state by upstream (0 closed, 1 half-open, 2 open).
    pub breaker_state: IntGaugeVec,

    // ============ Corpus Metrics ============
    /// Indexed document count.
    pub corpus_documents: IntGauge,
    /// Current corpus epoch.
    pub corpus_epoch: IntGauge,
    /// Index refresh passes by adapter and outcome.
    pub refresh_passes_total: IntCounterVec,
}

impl EngineMetrics {
    /// Create and register all metrics.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let tool_requests_total = IntCounterVec::new(
            Opts::new("rundex_tool_requests_total", "Tool calls by tool and status"),
            &["tool", "status"],
        )
        .map_err(internal)?;
        let tool_duration_seconds = HistogramVec::new(
            HistogramOpts::new("rundex_tool_duration_seconds", "Tool call duration")
                .buckets(TOOL_LATENCY_BUCKETS.to_vec()),
            &["tool"],
        )
        .map_err(internal)?;

        let adapter_calls_total = IntCounterVec::new(
            Opts::new(
                "rundex_adapter_calls_total",
                "Adapter calls by adapter and outcome",
            ),
            &["adapter", "outcome"],
        )
        .map_err(internal)?;
        let adapter_duration_seconds = HistogramVec::new(
            HistogramOpts::new("rundex_adapter_duration_seconds", "Adapter call duration")
                .buckets(ADAPTER_LATENCY_BUCKETS.to_vec()),
            &["adapter"],
        )
        .map_err(internal)?;

        let cache_hits_total = IntCounterVec::new(
            Opts::new("rundex_cache_hits_total", "Cache hits by tier"),
            &["tier"],
        )
        .map_err(internal)?;
        let cache_misses_total = IntCounter::new(
            "rundex_cache_misses_total",
            "Reads that missed every cache tier",
        )
        .map_err(internal)?;
        let cache_memory_entries = IntGauge::new(
            "rundex_cache_memory_entries",
            "Current memory tier entry count",
        )
        .map_err(internal)?;

        let breaker_transitions_total = IntCounter::new(
            "rundex_breaker_transitions_total",
            "Circuit breaker state transitions",
        )
        .map_err(internal)?;
        let breaker_state = IntGaugeVec::new(
            Opts::new(
                "rundex_breaker_state",
                "Breaker state by upstream (0 closed, 1 half-open, 2 open)",
            ),
            &["upstream"],
        )
        .map_err(internal)?;

        let corpus_documents =
            IntGauge::new("rundex_corpus_documents", "Indexed document count").map_err(internal)?;
        let corpus_epoch =
            IntGauge::new("rundex_corpus_epoch", "Current corpus epoch").map_err(internal)?;
        let refresh_passes_total = IntCounterVec::new(
            Opts::new(
                "rundex_refresh_passes_total",
                "Index refresh passes by adapter and outcome",
            ),
            &["adapter", "outcome"],
        )
        .map_err(internal)?;

        for collector in [
            Box::new(tool_requests_total.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(tool_duration_seconds.clone()),
            Box::new(adapter_calls_total.clone()),
            Box::new(adapter_duration_seconds.clone()),
            Box::new(cache_hits_total.clone()),
            Box::new(cache_misses_total.clone()),
            Box::new(cache_memory_entries.clone()),
            Box::new(breaker_transitions_total.clone()),
            Box::new(breaker_state.clone()),
            Box::new(corpus_documents.clone()),
            Box::new(corpus_epoch.clone()),
            Box::new(refresh_passes_total.clone()),
        ] {
            registry.register(collector).map_err(internal)?;
        }

        Ok(Self {
            registry,
            tool_requests_total,
            tool_duration_seconds,
            adapter_calls_total,
            adapter_duration_seconds,
            cache_hits_total,
            cache_misses_total,
            cache_memory_entries,
            breaker_transitions_total,
            breaker_state,
            corpus_documents,
            corpus_epoch,
            refresh_passes_total,
        })
    }

    /// Encode all metrics in the Prometheus text format.
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        encoder
            .encode_to_string(&self.registry.gather())
            .map_err(internal)
    }

    /// Reset every counter and gauge. Explicit-only, per the monitoring
    /// contract.
    pub fn reset(&self) {
        self.tool_requests_total.reset();
        self.adapter_calls_total.reset();
        self.cache_hits_total.reset();
        self.cache_misses_total.reset();
        self.breaker_transitions_total.reset();
        self.refresh_passes_total.reset();
        self.cache_memory_entries.set(0);
        self.corpus_documents.set(0);
        self.corpus_epoch.set(0);
        self.breaker_state.reset();
    }
}

fn internal<E: std::fmt::Display>(err: E) -> EngineError {
    EngineError::Internal {
        correlation_id: format!("metrics:{err}"),
    }
}
