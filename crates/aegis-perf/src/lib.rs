//! Performance engine: per-endpoint latency percentiles, slow-query and
//! index analysis, memory-growth trend, connection-pool saturation, and
//! overload-risk prediction.

#![forbid(unsafe_code)]

use aegis_incident::{IncidentManager, NewIncident};
use aegis_metrics::{MetricsRegistry, percentile_of};
use aegis_proto::{PerfObservation, Priority, RiskBand};
use aegis_store::{OpsStore, StatementStat, StoreStats, TableScanStat};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};
use uuid::Uuid;

/// Samples retained per endpoint.
pub const LATENCY_CAPACITY: usize = 2000;

/// Rolling reset interval for endpoint windows.
pub const LATENCY_RESET: Duration = Duration::from_secs(300);

// ─── Latency tracker ─────────────────────────────────────────────────────────

struct EndpointWindow {
    samples: VecDeque<f64>,
    window_start: Instant,
}

#[derive(Debug, Clone, Serialize)]
pub struct EndpointLatency {
    pub endpoint: String,
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub sample_count: usize,
}

/// Bounded per-endpoint latency samples with a rolling reset.
pub struct LatencyTracker {
    endpoints: RwLock<HashMap<String, EndpointWindow>>,
    capacity: usize,
    reset_after: Duration,
}

impl Default for LatencyTracker {
    fn default() -> Self {
        Self::new(LATENCY_CAPACITY, LATENCY_RESET)
    }
}

impl LatencyTracker {
    pub fn new(capacity: usize, reset_after: Duration) -> Self {
        Self {
            endpoints: RwLock::new(HashMap::new()),
            capacity,
            reset_after,
        }
    }

    pub fn record(&self, endpoint: &str, ms: f64) {
        let mut endpoints = self.endpoints.write();
        let window = endpoints
            .entry(endpoint.to_string())
            .or_insert_with(|| EndpointWindow {
                samples: VecDeque::new(),
                window_start: Instant::now(),
            });
        if window.window_start.elapsed() > self.reset_after {
            window.samples.clear();
            window.window_start = Instant::now();
        }
        if window.samples.len() == self.capacity {
            window.samples.pop_front();
        }
        window.samples.push_back(ms);
    }

    /// Percentile for one endpoint; 0 when no samples exist.
    pub fn percentile(&self, endpoint: &str, q: f64) -> f64 {
        let endpoints = self.endpoints.read();
        let Some(window) = endpoints.get(endpoint) else {
            return 0.0;
        };
        percentile_of(window.samples.iter().copied(), q)
    }

    /// Per-endpoint p50 baselines for overload and rollback comparison.
    pub fn baselines(&self) -> HashMap<String, f64> {
        let endpoints = self.endpoints.read();
        endpoints
            .iter()
            .map(|(name, w)| (name.clone(), percentile_of(w.samples.iter().copied(), 50.0)))
            .collect()
    }

    pub fn snapshot(&self) -> Vec<EndpointLatency> {
        let endpoints = self.endpoints.read();
        let mut all: Vec<EndpointLatency> = endpoints
            .iter()
            .map(|(name, w)| EndpointLatency {
                endpoint: name.clone(),
                p50_ms: percentile_of(w.samples.iter().copied(), 50.0),
                p95_ms: percentile_of(w.samples.iter().copied(), 95.0),
                p99_ms: percentile_of(w.samples.iter().copied(), 99.0),
                sample_count: w.samples.len(),
            })
            .collect();
        all.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        all
    }
}

// ─── Memory trend ────────────────────────────────────────────────────────────

/// Heap samples retained for trend analysis (one per minute).
pub const MEMORY_SAMPLES: usize = 60;

/// Growth above this slope flags the process as growing.
pub const GROWTH_FLAG_MB_PER_MIN: f64 = 5.0;

/// Ring of (timestamp, heap MB) samples with a least-squares slope.
pub struct MemoryTrend {
    samples: Mutex<VecDeque<(DateTime<Utc>, f64)>>,
    capacity: usize,
}

impl Default for MemoryTrend {
    fn default() -> Self {
        Self::new(MEMORY_SAMPLES)
    }
}

impl MemoryTrend {
    pub fn new(capacity: usize) -> Self {
        Self {
            samples: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn sample(&self, heap_mb: f64) {
        self.sample_at(Utc::now(), heap_mb);
    }

    pub fn sample_at(&self, at: DateTime<Utc>, heap_mb: f64) {
        let mut samples = self.samples.lock();
        if samples.len() == self.capacity {
            samples.pop_front();
        }
        samples.push_back((at, heap_mb));
    }

    /// Least-squares slope over (minutes, MB). Fewer than two samples → 0.
    pub fn slope_mb_per_min(&self) -> f64 {
        let samples = self.samples.lock();
        if samples.len() < 2 {
            return 0.0;
        }
        let origin = samples.front().expect("non-empty").0;
        let n = samples.len() as f64;
        let (mut sx, mut sy, mut sxy, mut sxx) = (0.0, 0.0, 0.0, 0.0);
        for (at, mb) in samples.iter() {
            let x = at.signed_duration_since(origin).num_milliseconds() as f64 / 60_000.0;
            sx += x;
            sy += mb;
            sxy += x * mb;
            sxx += x * x;
        }
        let denom = n * sxx - sx * sx;
        if denom.abs() < f64::EPSILON {
            return 0.0;
        }
        (n * sxy - sx * sy) / denom
    }

    pub fn growing(&self) -> bool {
        self.slope_mb_per_min() > GROWTH_FLAG_MB_PER_MIN
    }
}

/// Current process heap in MB via sysinfo; 0 when the process cannot be
/// inspected.
pub fn process_memory_mb() -> f64 {
    use sysinfo::System;
    let Ok(pid) = sysinfo::get_current_pid() else {
        return 0.0;
    };
    let mut sys = System::new_all();
    sys.refresh_all();
    sys.process(pid)
        .map(|p| p.memory() as f64 / (1024.0 * 1024.0))
        .unwrap_or(0.0)
}

// ─── Overload prediction ─────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize)]
pub struct OverloadSignals {
    /// Worst endpoint p95 divided by its p50 baseline.
    pub worst_p95_ratio: f64,
    pub saturation_pct: f64,
    /// 0.0–1.0 fraction from the `http.error_rate` gauge.
    pub error_rate: f64,
    pub memory_growth_mb_min: f64,
}

/// Additive overload score with risk banding. Pure function.
pub fn predict_overload(signals: &OverloadSignals) -> (u8, RiskBand) {
    let mut score = 0u8;

    if signals.worst_p95_ratio > 2.0 {
        score += 30;
    } else if signals.worst_p95_ratio > 1.5 {
        score += 15;
    }

    if signals.saturation_pct > 85.0 {
        score += 35;
    } else if signals.saturation_pct > 70.0 {
        score += 15;
    }

    if signals.error_rate > 0.05 {
        score += 30;
    } else if signals.error_rate > 0.01 {
        score += 15;
    }

    if signals.memory_growth_mb_min > 10.0 {
        score += 20;
    }

    (score, RiskBand::from_score(score))
}

// ─── Engine ──────────────────────────────────────────────────────────────────

/// Slow-query thresholds: mean time and call count.
pub const SLOW_QUERY_MEAN_MS: f64 = 500.0;
pub const SLOW_QUERY_MIN_CALLS: u64 = 10;

#[derive(Debug, Clone, Serialize)]
pub struct IndexSuggestion {
    pub table: String,
    pub detail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PerfReport {
    pub endpoints: Vec<EndpointLatency>,
    pub slow_queries: Vec<StatementStat>,
    pub index_suggestions: Vec<IndexSuggestion>,
    pub saturation_pct: f64,
    pub memory_growth_mb_min: f64,
    pub overload_score: u8,
    pub risk: RiskBand,
}

pub struct PerfEngine {
    tracker: Arc<LatencyTracker>,
    trend: Arc<MemoryTrend>,
    stats: Arc<dyn StoreStats>,
    store: Arc<OpsStore>,
    incidents: Arc<IncidentManager>,
    metrics: Arc<MetricsRegistry>,
}

impl PerfEngine {
    pub fn new(
        tracker: Arc<LatencyTracker>,
        trend: Arc<MemoryTrend>,
        stats: Arc<dyn StoreStats>,
        store: Arc<OpsStore>,
        incidents: Arc<IncidentManager>,
        metrics: Arc<MetricsRegistry>,
    ) -> Self {
        Self {
            tracker,
            trend,
            stats,
            store,
            incidents,
            metrics,
        }
    }

    /// Take one heap sample into the trend ring.
    pub fn sample_memory(&self) {
        let mb = process_memory_mb();
        self.trend.sample(mb);
        self.metrics.set_gauge("process.heap_mb", mb);
    }

    /// One analysis cycle: advisory signals, saturation gauge, overload
    /// prediction, and one persisted observation per endpoint. A CRITICAL
    /// band opens a P2 incident carrying the signals.
    pub async fn run_analysis(&self) -> PerfReport {
        let slow_queries: Vec<StatementStat> = match self.stats.statement_stats() {
            Ok(rows) => rows
                .into_iter()
                .filter(|s| s.mean_time_ms > SLOW_QUERY_MEAN_MS && s.calls > SLOW_QUERY_MIN_CALLS)
                .collect(),
            Err(e) => {
                warn!(error = %e, "statement stats unavailable");
                Vec::new()
            }
        };

        let index_suggestions: Vec<IndexSuggestion> = match self.stats.table_scan_stats() {
            Ok(rows) => rows.iter().filter(|t| needs_index(t)).map(suggest_index).collect(),
            Err(e) => {
                warn!(error = %e, "table scan stats unavailable");
                Vec::new()
            }
        };

        let saturation_pct = match self.stats.connection_activity() {
            Ok(activity) if activity.max_connections > 0 => {
                (activity.active + activity.idle) as f64 / activity.max_connections as f64 * 100.0
            }
            Ok(_) => 0.0,
            Err(e) => {
                warn!(error = %e, "connection activity unavailable");
                0.0
            }
        };
        self.metrics.set_gauge("db.pool.saturation_pct", saturation_pct);

        let endpoints = self.tracker.snapshot();
        let worst_p95_ratio = endpoints
            .iter()
            .filter(|e| e.p50_ms > 0.0)
            .map(|e| e.p95_ms / e.p50_ms)
            .fold(0.0_f64, f64::max);

        let signals = OverloadSignals {
            worst_p95_ratio,
            saturation_pct,
            error_rate: self.metrics.gauge("http.error_rate"),
            memory_growth_mb_min: self.trend.slope_mb_per_min(),
        };
        let (overload_score, risk) = predict_overload(&signals);
        self.metrics.set_gauge("perf.overload_score", overload_score as f64);

        let now = Utc::now();
        let top_slow = slow_queries.first().map(|s| s.query.clone());
        let top_index = index_suggestions.first().map(|s| s.detail.clone());
        for endpoint in &endpoints {
            self.store.append_perf_observation(PerfObservation {
                id: Uuid::new_v4().to_string(),
                endpoint: endpoint.endpoint.clone(),
                p95_ms: endpoint.p95_ms,
                p99_ms: endpoint.p99_ms,
                sample_count: endpoint.sample_count,
                slow_query: top_slow.clone(),
                index_suggestion: top_index.clone(),
                observed_at: now,
            });
        }

        if risk == RiskBand::Critical {
            self.incidents
                .create_incident(NewIncident {
                    priority: Priority::P2,
                    title: "Overload risk CRITICAL".to_string(),
                    invariant: None,
                    details: serde_json::to_value(&signals)
                        .unwrap_or_else(|_| serde_json::json!({})),
                })
                .await;
        }

        info!(overload_score, risk = ?risk, saturation_pct, "perf analysis complete");
        PerfReport {
            endpoints,
            slow_queries,
            index_suggestions,
            saturation_pct,
            memory_growth_mb_min: signals.memory_growth_mb_min,
            overload_score,
            risk,
        }
    }
}

fn needs_index(t: &TableScanStat) -> bool {
    t.seq_scans > 100 && t.seq_tuples_read > 10_000 && (t.index_scans as f64) < t.seq_scans as f64 * 0.10
}

fn suggest_index(t: &TableScanStat) -> IndexSuggestion {
    IndexSuggestion {
        table: t.table.clone(),
        detail: format!(
            "table {} read {} tuples over {} sequential scans ({} index scans)",
            t.table, t.seq_tuples_read, t.seq_scans, t.index_scans
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_alert::RecordingAlerter;
    use aegis_incident::NoForensics;
    use aegis_store::memory::MemoryStoreStats;
    use aegis_store::ConnectionActivity;
    use chrono::Duration as ChronoDuration;

    // ─── Latency tracker ─────────────────────────────────────────────────────

    #[test]
    fn test_empty_percentile_is_zero() {
        let tracker = LatencyTracker::default();
        assert_eq!(tracker.percentile("GET /sales", 95.0), 0.0);
    }

    #[test]
    fn test_latency_percentiles() {
        let tracker = LatencyTracker::default();
        for ms in 1..=100 {
            tracker.record("GET /sales", ms as f64);
        }
        assert_eq!(tracker.percentile("GET /sales", 50.0), 51.0);
        assert!(tracker.percentile("GET /sales", 95.0) >= 95.0);
    }

    #[test]
    fn test_latency_capacity_bound() {
        let tracker = LatencyTracker::new(100, LATENCY_RESET);
        for ms in 0..500 {
            tracker.record("e", ms as f64);
        }
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot[0].sample_count, 100);
        // Only the most recent 100 samples remain.
        assert_eq!(tracker.percentile("e", 0.0), 400.0);
    }

    #[test]
    fn test_latency_rolling_reset() {
        let tracker = LatencyTracker::new(100, Duration::from_millis(10));
        tracker.record("e", 50.0);
        std::thread::sleep(Duration::from_millis(20));
        tracker.record("e", 70.0);
        // The first sample was dropped by the rolling reset.
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot[0].sample_count, 1);
        assert_eq!(snapshot[0].p50_ms, 70.0);
    }

    #[test]
    fn test_baselines_are_p50() {
        let tracker = LatencyTracker::default();
        for ms in [10.0, 20.0, 30.0] {
            tracker.record("a", ms);
        }
        let baselines = tracker.baselines();
        assert_eq!(baselines["a"], 20.0);
    }

    // ─── Memory trend ────────────────────────────────────────────────────────

    #[test]
    fn test_memory_slope_flat() {
        let trend = MemoryTrend::default();
        let start = Utc::now();
        for i in 0..10 {
            trend.sample_at(start + ChronoDuration::minutes(i), 100.0);
        }
        assert!(trend.slope_mb_per_min().abs() < 0.001);
        assert!(!trend.growing());
    }

    #[test]
    fn test_memory_slope_growth() {
        let trend = MemoryTrend::default();
        let start = Utc::now();
        // +8 MB per minute.
        for i in 0..10 {
            trend.sample_at(start + ChronoDuration::minutes(i), 100.0 + 8.0 * i as f64);
        }
        let slope = trend.slope_mb_per_min();
        assert!((slope - 8.0).abs() < 0.01, "slope was {slope}");
        assert!(trend.growing());
    }

    #[test]
    fn test_memory_slope_needs_two_samples() {
        let trend = MemoryTrend::default();
        assert_eq!(trend.slope_mb_per_min(), 0.0);
        trend.sample(100.0);
        assert_eq!(trend.slope_mb_per_min(), 0.0);
    }

    #[test]
    fn test_memory_ring_capacity() {
        let trend = MemoryTrend::new(5);
        let start = Utc::now();
        for i in 0..20 {
            trend.sample_at(start + ChronoDuration::minutes(i), i as f64);
        }
        assert_eq!(trend.samples.lock().len(), 5);
    }

    // ─── Overload prediction ─────────────────────────────────────────────────

    fn signals() -> OverloadSignals {
        OverloadSignals {
            worst_p95_ratio: 1.0,
            saturation_pct: 10.0,
            error_rate: 0.0,
            memory_growth_mb_min: 0.0,
        }
    }

    #[test]
    fn test_overload_quiet_system() {
        let (score, risk) = predict_overload(&signals());
        assert_eq!(score, 0);
        assert_eq!(risk, RiskBand::Low);
    }

    #[test]
    fn test_overload_latency_tiers() {
        let mut s = signals();
        s.worst_p95_ratio = 1.6;
        assert_eq!(predict_overload(&s).0, 15);
        s.worst_p95_ratio = 2.5;
        assert_eq!(predict_overload(&s).0, 30);
    }

    #[test]
    fn test_overload_all_signals_critical() {
        let s = OverloadSignals {
            worst_p95_ratio: 3.0,
            saturation_pct: 90.0,
            error_rate: 0.08,
            memory_growth_mb_min: 12.0,
        };
        let (score, risk) = predict_overload(&s);
        assert_eq!(score, 115);
        assert_eq!(risk, RiskBand::Critical);
    }

    #[test]
    fn test_overload_band_edges() {
        let mut s = signals();
        s.saturation_pct = 75.0; // +15
        s.error_rate = 0.02; // +15
        let (score, risk) = predict_overload(&s);
        assert_eq!(score, 30);
        assert_eq!(risk, RiskBand::Medium);

        s.worst_p95_ratio = 2.1; // +30 → 60
        let (score, risk) = predict_overload(&s);
        assert_eq!(score, 60);
        assert_eq!(risk, RiskBand::High);
    }

    // ─── Engine ──────────────────────────────────────────────────────────────

    fn engine() -> (
        tempfile::TempDir,
        Arc<OpsStore>,
        Arc<MemoryStoreStats>,
        Arc<MetricsRegistry>,
        Arc<LatencyTracker>,
        PerfEngine,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(OpsStore::open(dir.path()));
        let incidents = Arc::new(IncidentManager::new(
            store.clone(),
            Arc::new(RecordingAlerter::new()),
            Arc::new(NoForensics),
        ));
        let stats = Arc::new(MemoryStoreStats::new());
        let metrics = Arc::new(MetricsRegistry::new());
        let tracker = Arc::new(LatencyTracker::default());
        let engine = PerfEngine::new(
            tracker.clone(),
            Arc::new(MemoryTrend::default()),
            stats.clone(),
            store.clone(),
            incidents,
            metrics.clone(),
        );
        (dir, store, stats, metrics, tracker, engine)
    }

    #[tokio::test]
    async fn test_analysis_persists_observations() {
        let (_dir, store, stats, _metrics, tracker, engine) = engine();
        stats.set_activity(ConnectionActivity {
            active: 10,
            idle: 10,
            max_connections: 100,
        });
        for ms in [10.0, 12.0, 14.0] {
            tracker.record("POST /sales", ms);
        }

        let report = engine.run_analysis().await;
        assert_eq!(report.endpoints.len(), 1);
        assert!((report.saturation_pct - 20.0).abs() < 0.001);
        assert_eq!(report.risk, RiskBand::Low);

        let observations = store.recent_perf_observations(10);
        assert_eq!(observations.len(), 1);
        assert_eq!(observations[0].endpoint, "POST /sales");
    }

    #[tokio::test]
    async fn test_analysis_flags_slow_queries_and_indexes() {
        let (_dir, _store, stats, _metrics, _tracker, engine) = engine();
        stats.set_statements(vec![
            StatementStat {
                query: "SELECT * FROM sales WHERE ...".to_string(),
                mean_time_ms: 800.0,
                calls: 50,
            },
            StatementStat {
                query: "fast query".to_string(),
                mean_time_ms: 5.0,
                calls: 10_000,
            },
        ]);
        stats.set_table_scans(vec![TableScanStat {
            table: "stock_movements".to_string(),
            seq_scans: 500,
            seq_tuples_read: 2_000_000,
            index_scans: 3,
        }]);

        let report = engine.run_analysis().await;
        assert_eq!(report.slow_queries.len(), 1);
        assert_eq!(report.index_suggestions.len(), 1);
        assert_eq!(report.index_suggestions[0].table, "stock_movements");
    }

    #[tokio::test]
    async fn test_critical_overload_opens_p2() {
        let (_dir, store, stats, metrics, tracker, engine) = engine();
        stats.set_activity(ConnectionActivity {
            active: 80,
            idle: 15,
            max_connections: 100,
        });
        metrics.set_gauge("http.error_rate", 0.09);
        // p95 far above the p50 baseline.
        for _ in 0..90 {
            tracker.record("GET /x", 10.0);
        }
        for _ in 0..10 {
            tracker.record("GET /x", 500.0);
        }

        let report = engine.run_analysis().await;
        assert_eq!(report.risk, RiskBand::Critical);
        let open = store.open_incidents();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].priority, Priority::P2);
        assert!(open[0].title.contains("Overload"));
    }
}
