//! Deployment gates and the post-deploy auto-rollback watcher.
//!
//! Gates are hard preconditions evaluated in parallel before a deploy is
//! allowed to proceed; a single failed blocker aborts the deploy. The
//! watcher runs after a successful deploy, compares live error rate and
//! latency against a captured baseline, and invokes a caller-supplied
//! rollback once a spike persists for the full window.

#![forbid(unsafe_code)]

use aegis_alert::{Alert, AlertSink};
use aegis_incident::{IncidentManager, NewIncident};
use aegis_metrics::MetricsRegistry;
use aegis_perf::LatencyTracker;
use aegis_proto::{AlertSeverity, DeploymentGateRun, GateResult, Priority};
use aegis_store::{OpsStore, StoreStats};
use async_trait::async_trait;
use chrono::Utc;
use futures_util::future::{BoxFuture, join_all};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};
use uuid::Uuid;

// ─── Gate names (external contract) ──────────────────────────────────────────

pub const GATE_NO_OPEN_P1: &str = "NO_OPEN_P1_INCIDENTS";
pub const GATE_DRIFT_SCORE: &str = "DRIFT_SCORE";
pub const GATE_TEST_COVERAGE: &str = "TEST_COVERAGE";
pub const GATE_BACKUP_FRESHNESS: &str = "BACKUP_FRESHNESS";
pub const GATE_ERROR_RATE: &str = "ERROR_RATE";
pub const GATE_MIGRATIONS_CLEAN: &str = "MIGRATIONS_CLEAN";

pub const MIN_DRIFT_SCORE: u8 = 85;
pub const MIN_COVERAGE_PCT: f64 = 85.0;
pub const MAX_BACKUP_AGE_HOURS: f64 = 24.0;
pub const MAX_ERROR_RATE: f64 = 0.03;

/// Coverage-gate subprocess timeout.
pub const COVERAGE_TIMEOUT: Duration = Duration::from_secs(120);

// ─── Coverage source ─────────────────────────────────────────────────────────

/// Supplies reported line coverage, usually by invoking an external
/// coverage report command.
#[async_trait]
pub trait CoverageSource: Send + Sync {
    async fn line_coverage_pct(&self) -> anyhow::Result<f64>;
}

/// Runs an injected shell command whose stdout is the coverage percentage.
pub struct CommandCoverage {
    command: String,
}

impl CommandCoverage {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

#[async_trait]
impl CoverageSource for CommandCoverage {
    async fn line_coverage_pct(&self) -> anyhow::Result<f64> {
        let output = tokio::time::timeout(
            COVERAGE_TIMEOUT,
            tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&self.command)
                .output(),
        )
        .await
        .map_err(|_| anyhow::anyhow!("coverage command timed out"))??;
        if !output.status.success() {
            anyhow::bail!("coverage command exited with {}", output.status);
        }
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim()
            .parse::<f64>()
            .map_err(|e| anyhow::anyhow!("coverage output not a number: {e}"))
    }
}

/// Fixed coverage value, for tests and deployments without a report.
pub struct FixedCoverage(pub f64);

#[async_trait]
impl CoverageSource for FixedCoverage {
    async fn line_coverage_pct(&self) -> anyhow::Result<f64> {
        Ok(self.0)
    }
}

// ─── Gate runner ─────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("deployment blocked by gates: {}", .0.join(", "))]
    Blocked(Vec<String>),
}

pub struct GateContext {
    pub store: Arc<OpsStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub stats: Arc<dyn StoreStats>,
    pub coverage: Arc<dyn CoverageSource>,
    pub skip_coverage: bool,
    pub alerts: Arc<dyn AlertSink>,
}

fn gate(name: &str, passed: bool, detail: String) -> GateResult {
    GateResult {
        name: name.to_string(),
        passed,
        detail,
        blocking: true,
    }
}

/// Evaluate all gates in parallel, persist the run, and abort with a
/// terminal error when any blocker failed. A gate that errors becomes a
/// failed blocking result carrying the error text.
pub async fn run_deployment_gates(
    ctx: &GateContext,
    triggered_by: Option<&str>,
) -> Result<DeploymentGateRun, DeployError> {
    let checks: Vec<BoxFuture<'_, GateResult>> = vec![
        Box::pin(async {
            let open = ctx.store.open_p1_count();
            gate(GATE_NO_OPEN_P1, open == 0, format!("{open} open P1 incidents"))
        }),
        Box::pin(async {
            match ctx.store.latest_drift_sample() {
                Some(sample) => gate(
                    GATE_DRIFT_SCORE,
                    sample.score >= MIN_DRIFT_SCORE,
                    format!("drift score {} (minimum {MIN_DRIFT_SCORE})", sample.score),
                ),
                None => gate(
                    GATE_DRIFT_SCORE,
                    false,
                    "no drift score recorded yet".to_string(),
                ),
            }
        }),
        Box::pin(async {
            if ctx.skip_coverage {
                return gate(GATE_TEST_COVERAGE, true, "skipped by flag".to_string());
            }
            match ctx.coverage.line_coverage_pct().await {
                Ok(pct) => gate(
                    GATE_TEST_COVERAGE,
                    pct >= MIN_COVERAGE_PCT,
                    format!("line coverage {pct:.1}% (minimum {MIN_COVERAGE_PCT}%)"),
                ),
                Err(e) => gate(GATE_TEST_COVERAGE, false, format!("coverage check failed: {e}")),
            }
        }),
        Box::pin(async {
            match ctx.store.latest_passed_backup() {
                Some(backup) => {
                    let age_hours = Utc::now()
                        .signed_duration_since(backup.validated_at)
                        .num_minutes() as f64
                        / 60.0;
                    gate(
                        GATE_BACKUP_FRESHNESS,
                        age_hours < MAX_BACKUP_AGE_HOURS,
                        format!("latest passed backup is {age_hours:.1}h old"),
                    )
                }
                None => gate(
                    GATE_BACKUP_FRESHNESS,
                    false,
                    "no passed backup validation".to_string(),
                ),
            }
        }),
        Box::pin(async {
            let rate = ctx.metrics.gauge("http.error_rate");
            gate(
                GATE_ERROR_RATE,
                rate <= MAX_ERROR_RATE,
                format!("error rate {:.2}% (maximum {:.0}%)", rate * 100.0, MAX_ERROR_RATE * 100.0),
            )
        }),
        Box::pin(async {
            match ctx.stats.pending_migrations() {
                Ok(0) => gate(GATE_MIGRATIONS_CLEAN, true, "no pending migrations".to_string()),
                Ok(n) => gate(GATE_MIGRATIONS_CLEAN, false, format!("{n} pending migrations")),
                Err(e) => gate(
                    GATE_MIGRATIONS_CLEAN,
                    false,
                    format!("migration status unavailable: {e}"),
                ),
            }
        }),
    ];

    let gates = join_all(checks).await;
    let blockers: Vec<String> = gates
        .iter()
        .filter(|g| g.blocking && !g.passed)
        .map(|g| g.name.clone())
        .collect();
    let passed = blockers.is_empty();

    let run = DeploymentGateRun {
        id: Uuid::new_v4().to_string(),
        passed,
        gates,
        blockers: blockers.clone(),
        triggered_by: triggered_by.map(String::from),
        created_at: Utc::now(),
    };
    ctx.store.append_gate_run(run.clone());

    if passed {
        info!(run = %run.id, "deployment gates passed");
        return Ok(run);
    }

    error!(run = %run.id, blockers = ?blockers, "deployment blocked");
    let alert = Alert::new(
        AlertSeverity::Critical,
        "Deployment blocked",
        format!("Blocking gates failed: {}", blockers.join(", ")),
    );
    if let Err(e) = ctx.alerts.send(&alert).await {
        warn!(error = %e, "failed to send gate alert");
    }
    Err(DeployError::Blocked(blockers))
}

// ─── Auto-rollback watcher ───────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RollbackConfig {
    pub check_interval: Duration,
    pub spike_window: Duration,
    /// Absolute error-rate ceiling for a spike.
    pub error_rate_threshold: f64,
    /// Endpoint p95 must also clear this floor to count as a spike.
    pub latency_floor_ms: f64,
    /// A zero error-rate baseline is floored here so the 2x multiplier
    /// test is never vacuous.
    pub baseline_error_floor: f64,
    pub baseline_latency_floor_ms: f64,
}

impl Default for RollbackConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_secs(30),
            spike_window: Duration::from_secs(60),
            error_rate_threshold: 0.03,
            latency_floor_ms: 500.0,
            baseline_error_floor: 0.005,
            baseline_latency_floor_ms: 1.0,
        }
    }
}

/// Metric state captured immediately after a deploy.
#[derive(Debug, Clone)]
pub struct Baseline {
    pub error_rate: f64,
    pub endpoint_p95: HashMap<String, f64>,
}

/// Spike predicate against the baseline. Returns the reason when spiking.
pub fn detect_spike(
    baseline: &Baseline,
    error_rate: f64,
    endpoint_p95: &HashMap<String, f64>,
    config: &RollbackConfig,
) -> Option<String> {
    let error_base = baseline.error_rate.max(config.baseline_error_floor);
    if error_rate > config.error_rate_threshold && error_rate > 2.0 * error_base {
        return Some(format!(
            "error rate {:.2}% vs baseline {:.2}%",
            error_rate * 100.0,
            baseline.error_rate * 100.0
        ));
    }

    for (endpoint, p95) in endpoint_p95 {
        let base = baseline
            .endpoint_p95
            .get(endpoint)
            .copied()
            .unwrap_or(0.0)
            .max(config.baseline_latency_floor_ms);
        if *p95 > 2.0 * base && *p95 > config.latency_floor_ms {
            return Some(format!("{endpoint} p95 {p95:.0}ms vs baseline {base:.0}ms"));
        }
    }
    None
}

/// Caller-supplied rollback action.
pub type RollbackFn = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

pub struct RollbackWatcher {
    metrics: Arc<MetricsRegistry>,
    tracker: Arc<LatencyTracker>,
    alerts: Arc<dyn AlertSink>,
    incidents: Arc<IncidentManager>,
    config: RollbackConfig,
}

/// Handle to a running watcher; dropping it does not stop the task.
pub struct WatcherHandle {
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl WatcherHandle {
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl RollbackWatcher {
    pub fn new(
        metrics: Arc<MetricsRegistry>,
        tracker: Arc<LatencyTracker>,
        alerts: Arc<dyn AlertSink>,
        incidents: Arc<IncidentManager>,
        config: RollbackConfig,
    ) -> Self {
        Self {
            metrics,
            tracker,
            alerts,
            incidents,
            config,
        }
    }

    fn current_p95(&self) -> HashMap<String, f64> {
        self.tracker
            .snapshot()
            .into_iter()
            .map(|e| (e.endpoint, e.p95_ms))
            .collect()
    }

    /// Start watching. Captures the baseline now; evaluates every
    /// `check_interval`; a spike persisting through `spike_window` triggers
    /// alert + P1 incident + rollback, then the watcher stops itself.
    pub fn start(self, rollback: RollbackFn) -> WatcherHandle {
        let baseline = Baseline {
            error_rate: self.metrics.gauge("http.error_rate"),
            endpoint_p95: self.current_p95(),
        };
        info!(
            baseline_error_rate = baseline.error_rate,
            endpoints = baseline.endpoint_p95.len(),
            "rollback watcher started"
        );

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut rollback = Some(rollback);
            let mut spike_since: Option<std::time::Instant> = None;
            let mut ticker = tokio::time::interval(self.config.check_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await; // immediate first tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    _ = shutdown_rx.changed() => {
                        info!("rollback watcher stopped");
                        return;
                    }
                }

                let error_rate = self.metrics.gauge("http.error_rate");
                let p95 = self.current_p95();
                match detect_spike(&baseline, error_rate, &p95, &self.config) {
                    Some(reason) => {
                        let started = *spike_since.get_or_insert_with(std::time::Instant::now);
                        if started.elapsed() >= self.config.spike_window {
                            warn!(reason = %reason, "post-deploy spike persisted, rolling back");
                            let alert = Alert::new(
                                AlertSeverity::Critical,
                                "Auto-rollback triggered",
                                format!("Post-deploy spike persisted: {reason}"),
                            );
                            if let Err(e) = self.alerts.send(&alert).await {
                                warn!(error = %e, "failed to send rollback alert");
                            }
                            self.incidents
                                .create_incident(NewIncident {
                                    priority: Priority::P1,
                                    title: "Post-deploy regression, auto-rollback invoked"
                                        .to_string(),
                                    invariant: None,
                                    details: serde_json::json!({
                                        "reason": reason,
                                        "baseline_error_rate": baseline.error_rate,
                                    }),
                                })
                                .await;
                            if let Some(rollback) = rollback.take() {
                                rollback().await;
                            }
                            return;
                        }
                    }
                    None => {
                        if spike_since.take().is_some() {
                            info!("spike cleared before window end, watcher reset");
                        }
                    }
                }
            }
        });

        WatcherHandle {
            shutdown: shutdown_tx,
            task,
        }
    }
}
