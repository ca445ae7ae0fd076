//! Thread-safe metrics registry for the Aegis control plane.
//!
//! Three families: gauges, counters, and bounded histograms with percentile
//! queries. Gauge writes evaluate declarative thresholds and notify
//! registered breach observers, rate-limited by a per-metric cooldown.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::warn;

/// Most recent samples retained per histogram. Older samples drop silently.
pub const HISTOGRAM_CAPACITY: usize = 2000;

// ─── Thresholds ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThresholdOp {
    #[serde(rename = ">")]
    Gt,
    #[serde(rename = "<")]
    Lt,
    #[serde(rename = ">=")]
    Ge,
    #[serde(rename = "<=")]
    Le,
}

impl ThresholdOp {
    pub fn holds(self, actual: f64, limit: f64) -> bool {
        match self {
            Self::Gt => actual > limit,
            Self::Lt => actual < limit,
            Self::Ge => actual >= limit,
            Self::Le => actual <= limit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BreachSeverity {
    Low,
    Medium,
    High,
    Critical,
}

/// A declarative alerting rule over one gauge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Threshold {
    pub metric: String,
    pub operator: ThresholdOp,
    pub value: f64,
    pub severity: BreachSeverity,
    pub cooldown_ms: u64,
}

/// Emitted when a gauge write crosses a threshold outside its cooldown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThresholdBreach {
    pub threshold: Threshold,
    pub actual: f64,
    pub at: DateTime<Utc>,
}

type BreachObserver = Box<dyn Fn(&ThresholdBreach) + Send + Sync>;

// ─── Registry ────────────────────────────────────────────────────────────────

/// Central metrics registry. Cheap to share via [`Arc`]; every operation is
/// atomic with respect to the others.
pub struct MetricsRegistry {
    gauges: RwLock<HashMap<String, f64>>,
    counters: RwLock<HashMap<String, u64>>,
    histograms: RwLock<HashMap<String, VecDeque<f64>>>,
    thresholds: RwLock<Vec<Threshold>>,
    last_breach: Mutex<HashMap<String, DateTime<Utc>>>,
    observers: RwLock<Vec<BreachObserver>>,
}

/// Shared handle to the registry.
pub type SharedMetrics = Arc<MetricsRegistry>;

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            gauges: RwLock::new(HashMap::new()),
            counters: RwLock::new(HashMap::new()),
            histograms: RwLock::new(HashMap::new()),
            thresholds: RwLock::new(Vec::new()),
            last_breach: Mutex::new(HashMap::new()),
            observers: RwLock::new(Vec::new()),
        }
    }

    // ── Gauges ──────────────────────────────────────────────────────────────

    /// Set a gauge and evaluate thresholds declared for it.
    pub fn set_gauge(&self, name: &str, value: f64) {
        self.gauges.write().insert(name.to_string(), value);
        self.evaluate_thresholds(name, value);
    }

    /// Current gauge value; 0 if absent.
    pub fn gauge(&self, name: &str) -> f64 {
        self.gauges.read().get(name).copied().unwrap_or(0.0)
    }

    // ── Counters ────────────────────────────────────────────────────────────

    /// Increment a counter and return the new value.
    pub fn increment(&self, name: &str) -> u64 {
        self.increment_by(name, 1)
    }

    pub fn increment_by(&self, name: &str, by: u64) -> u64 {
        let mut counters = self.counters.write();
        let entry = counters.entry(name.to_string()).or_insert(0);
        *entry += by;
        *entry
    }

    pub fn counter(&self, name: &str) -> u64 {
        self.counters.read().get(name).copied().unwrap_or(0)
    }

    // ── Histograms ──────────────────────────────────────────────────────────

    /// Record a histogram sample into a bounded ring.
    pub fn record(&self, name: &str, value: f64) {
        let mut histograms = self.histograms.write();
        let ring = histograms.entry(name.to_string()).or_default();
        if ring.len() == HISTOGRAM_CAPACITY {
            ring.pop_front();
        }
        ring.push_back(value);
    }

    /// Percentile over the retained ring. Empty histograms report 0.
    pub fn percentile(&self, name: &str, q: f64) -> f64 {
        let histograms = self.histograms.read();
        let Some(ring) = histograms.get(name) else {
            return 0.0;
        };
        percentile_of(ring.iter().copied(), q)
    }

    pub fn histogram_count(&self, name: &str) -> usize {
        self.histograms.read().get(name).map_or(0, VecDeque::len)
    }

    // ── Thresholds & observers ──────────────────────────────────────────────

    pub fn declare_threshold(&self, threshold: Threshold) {
        self.thresholds.write().push(threshold);
    }

    pub fn declare_thresholds(&self, thresholds: Vec<Threshold>) {
        self.thresholds.write().extend(thresholds);
    }

    /// Register a breach observer. Observers run inline on the writing
    /// thread and must not block.
    pub fn on_threshold_breach<F>(&self, handler: F)
    where
        F: Fn(&ThresholdBreach) + Send + Sync + 'static,
    {
        self.observers.write().push(Box::new(handler));
    }

    fn evaluate_thresholds(&self, metric: &str, actual: f64) {
        let breached: Vec<Threshold> = {
            let thresholds = self.thresholds.read();
            thresholds
                .iter()
                .filter(|t| t.metric == metric && t.operator.holds(actual, t.value))
                .cloned()
                .collect()
        };
        if breached.is_empty() {
            return;
        }

        let now = Utc::now();
        for threshold in breached {
            let under_cooldown = {
                let mut last = self.last_breach.lock();
                match last.get(metric) {
                    Some(prev)
                        if now.signed_duration_since(*prev).num_milliseconds()
                            < threshold.cooldown_ms as i64 =>
                    {
                        true
                    }
                    _ => {
                        last.insert(metric.to_string(), now);
                        false
                    }
                }
            };
            if under_cooldown {
                continue;
            }

            warn!(
                metric = %threshold.metric,
                actual,
                limit = threshold.value,
                severity = ?threshold.severity,
                "threshold breach"
            );
            let breach = ThresholdBreach {
                threshold,
                actual,
                at: now,
            };
            for observer in self.observers.read().iter() {
                observer(&breach);
            }
        }
    }

    // ── Exposition ──────────────────────────────────────────────────────────

    /// Prometheus text exposition: gauges, counters, and histogram
    /// summaries with 0.5/0.95/0.99 quantiles.
    pub fn render_prometheus(&self) -> String {
        let mut out = String::new();

        let mut gauges: Vec<(String, f64)> = self
            .gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        gauges.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in gauges {
            let prom = prom_name(&name);
            out.push_str(&format!("# TYPE {prom} gauge\n{prom} {value}\n"));
        }

        let mut counters: Vec<(String, u64)> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        counters.sort_by(|a, b| a.0.cmp(&b.0));
        for (name, value) in counters {
            let prom = format!("{}_total", prom_name(&name));
            out.push_str(&format!("# TYPE {prom} counter\n{prom} {value}\n"));
        }

        let mut names: Vec<String> = self.histograms.read().keys().cloned().collect();
        names.sort();
        for name in names {
            let prom = prom_name(&name);
            let count = self.histogram_count(&name);
            out.push_str(&format!("# TYPE {prom} summary\n"));
            for (label, q) in [("0.5", 50.0), ("0.95", 95.0), ("0.99", 99.0)] {
                out.push_str(&format!(
                    "{prom}{{quantile=\"{label}\"}} {}\n",
                    self.percentile(&name, q)
                ));
            }
            out.push_str(&format!("{prom}_count {count}\n"));
        }

        out
    }

    /// JSON snapshot: every gauge, counter (`_total` suffix), and histogram
    /// p50/p95/p99.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let gauges: serde_json::Map<String, serde_json::Value> = self
            .gauges
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::json!(v)))
            .collect();
        let counters: serde_json::Map<String, serde_json::Value> = self
            .counters
            .read()
            .iter()
            .map(|(k, v)| (format!("{k}_total"), serde_json::json!(v)))
            .collect();
        let names: Vec<String> = self.histograms.read().keys().cloned().collect();
        let histograms: serde_json::Map<String, serde_json::Value> = names
            .iter()
            .map(|name| {
                (
                    name.clone(),
                    serde_json::json!({
                        "p50": self.percentile(name, 50.0),
                        "p95": self.percentile(name, 95.0),
                        "p99": self.percentile(name, 99.0),
                        "count": self.histogram_count(name),
                    }),
                )
            })
            .collect();

        serde_json::json!({
            "gauges": gauges,
            "counters": counters,
            "histograms": histograms,
        })
    }
}

/// Nearest-rank percentile over an iterator of samples. Empty input → 0.
pub fn percentile_of(samples: impl Iterator<Item = f64>, q: f64) -> f64 {
    let mut sorted: Vec<f64> = samples.collect();
    if sorted.is_empty() {
        return 0.0;
    }
    sorted.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let q = q.clamp(0.0, 100.0);
    let idx = ((q / 100.0) * (sorted.len() - 1) as f64).round() as usize;
    sorted[idx]
}

fn prom_name(name: &str) -> String {
    name.replace(['.', '-'], "_")
}
