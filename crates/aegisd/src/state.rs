//! Bootstrap wiring: constructed-once engines shared across the HTTP
//! surface and the scheduler.

use crate::config::AegisConfig;
use aegis_alert::{
    AlertSink, MultiAlerter, NullAlerter, PagerDutyAlerter, ResilientAlerter, WebhookAlerter,
};
use aegis_cron::CronScheduler;
use aegis_health::HealthScorer;
use aegis_idempotency::{IdempotencyConfig, IdempotencyRegistry};
use aegis_incident::{ForensicSource, IncidentManager};
use aegis_invariant::InvariantEngine;
use aegis_metrics::MetricsRegistry;
use aegis_perf::{LatencyTracker, MemoryTrend, PerfEngine, process_memory_mb};
use aegis_proto::ForensicSnapshot;
use aegis_report::{
    BackupInfo, BackupSource, BackupValidator, ExecutiveReporter, RestoreOutcome, ReportSink,
    WebhookReportSink,
};
use aegis_security::{
    BruteForceConfig, BruteForceDetector, PatternScanner, RateLimiterConfig, ScannerConfig,
    SlidingRateLimiter,
};
use aegis_store::memory::{MemoryBusinessData, MemoryStoreStats};
use aegis_store::{BusinessData, OpsStore, StoreError, StoreStats};
use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::warn;

/// Forensic counters assembled from the business store and the process.
pub struct SystemForensics {
    business: Arc<dyn BusinessData>,
    started_at: Instant,
}

impl SystemForensics {
    pub fn new(business: Arc<dyn BusinessData>, started_at: Instant) -> Self {
        Self {
            business,
            started_at,
        }
    }
}

impl ForensicSource for SystemForensics {
    fn capture(&self) -> Result<ForensicSnapshot, StoreError> {
        Ok(ForensicSnapshot {
            negative_stock_rows: self.business.negative_stock_count()?,
            payment_gap_sales: self.business.payment_gap_count()?,
            active_db_connections: self.business.active_connection_count()?,
            heap_used_mb: process_memory_mb(),
            uptime_secs: self.started_at.elapsed().as_secs(),
        })
    }
}

/// Backups as files in a directory: newest file wins, checksum computed
/// here, restore test delegated to an injected shell command.
pub struct FileBackupSource {
    dir: PathBuf,
    restore_cmd: Option<String>,
}

impl FileBackupSource {
    pub fn new(dir: PathBuf, restore_cmd: Option<String>) -> Self {
        Self { dir, restore_cmd }
    }
}

#[async_trait]
impl BackupSource for FileBackupSource {
    fn latest_backup(&self) -> Option<BackupInfo> {
        let entries = std::fs::read_dir(&self.dir).ok()?;
        let newest = entries
            .flatten()
            .filter(|e| e.path().is_file())
            .max_by_key(|e| {
                e.metadata()
                    .and_then(|m| m.modified())
                    .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
            })?;
        let path = newest.path();
        let size_kb = newest.metadata().ok()?.len() / 1024;
        let bytes = std::fs::read(&path).ok()?;
        let checksum = hex::encode(Sha256::digest(&bytes));
        Some(BackupInfo {
            file: path.file_name()?.to_string_lossy().into_owned(),
            size_kb,
            checksum,
        })
    }

    async fn restore_test(&self) -> anyhow::Result<RestoreOutcome> {
        let Some(cmd) = &self.restore_cmd else {
            return Ok(RestoreOutcome {
                restore_ok: true,
                drift_clean: true,
            });
        };
        let status = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(cmd)
            .status()
            .await?;
        Ok(RestoreOutcome {
            restore_ok: status.success(),
            drift_clean: status.success(),
        })
    }
}

/// Everything the daemon shares between the HTTP layer and the jobs.
pub struct AppState {
    pub config: AegisConfig,
    pub started_at: Instant,
    pub store: Arc<OpsStore>,
    pub metrics: Arc<MetricsRegistry>,
    pub alerts: Arc<dyn AlertSink>,
    pub business: Arc<dyn BusinessData>,
    pub stats: Arc<dyn StoreStats>,
    pub tracker: Arc<LatencyTracker>,
    pub limiter: Arc<SlidingRateLimiter>,
    pub brute_force: Arc<BruteForceDetector>,
    pub incidents: Arc<IncidentManager>,
    pub invariants: Arc<InvariantEngine>,
    pub scanner: Arc<PatternScanner>,
    pub perf: Arc<PerfEngine>,
    pub health: Arc<HealthScorer>,
    pub reporter: Arc<ExecutiveReporter>,
    pub backup_validator: Arc<BackupValidator>,
    pub idempotency: Arc<IdempotencyRegistry>,
    pub scheduler: Arc<CronScheduler>,
}

impl AppState {
    /// Wire the full control plane. The business store and statistics
    /// sources default to the in-process fakes until SQL-backed
    /// implementations are injected here.
    pub fn bootstrap(config: AegisConfig) -> Arc<Self> {
        let started_at = Instant::now();
        let store = Arc::new(OpsStore::open(&config.state_path));
        let metrics = Arc::new(MetricsRegistry::new());
        let business: Arc<dyn BusinessData> = Arc::new(MemoryBusinessData::new());
        let stats: Arc<dyn StoreStats> = Arc::new(MemoryStoreStats::new());

        let alerts = build_alerts(&config, &metrics);
        metrics.declare_thresholds(default_thresholds());
        aegis_alert::bind_threshold_alerts(&metrics, alerts.clone());

        let forensics = Arc::new(SystemForensics::new(business.clone(), started_at));
        let incidents = Arc::new(IncidentManager::new(
            store.clone(),
            alerts.clone(),
            forensics,
        ));

        let tracker = Arc::new(LatencyTracker::default());
        let trend = Arc::new(MemoryTrend::default());
        let invariants = Arc::new(InvariantEngine::new(store.clone(), incidents.clone()));
        let scanner = Arc::new(PatternScanner::new(
            store.clone(),
            incidents.clone(),
            ScannerConfig::default(),
        ));
        let perf = Arc::new(PerfEngine::new(
            tracker.clone(),
            trend,
            stats.clone(),
            store.clone(),
            incidents.clone(),
            metrics.clone(),
        ));
        let health = Arc::new(HealthScorer::new(
            store.clone(),
            metrics.clone(),
            stats.clone(),
            alerts.clone(),
        ));

        let report_sink: Option<Arc<dyn ReportSink>> = config
            .executive_webhook_url
            .as_ref()
            .map(|url| Arc::new(WebhookReportSink::new(url)) as Arc<dyn ReportSink>);
        let reporter = Arc::new(ExecutiveReporter::new(
            store.clone(),
            metrics.clone(),
            incidents.clone(),
            report_sink,
        ));

        let backup_source = Arc::new(FileBackupSource::new(
            config
                .backup_dir
                .clone()
                .unwrap_or_else(|| config.state_path.join("backups")),
            config.restore_test_cmd.clone(),
        ));
        let backup_validator = Arc::new(BackupValidator::new(
            store.clone(),
            incidents.clone(),
            backup_source,
            config.shadow_db_url.is_some(),
        ));

        let idempotency = Arc::new(IdempotencyRegistry::new(
            store.clone(),
            IdempotencyConfig::default(),
        ));
        let scheduler = Arc::new(CronScheduler::new(metrics.clone(), Some(incidents.clone())));

        Arc::new(Self {
            started_at,
            store,
            metrics,
            alerts,
            business,
            stats,
            tracker,
            limiter: Arc::new(SlidingRateLimiter::new(RateLimiterConfig::default())),
            brute_force: Arc::new(BruteForceDetector::new(BruteForceConfig::default())),
            incidents,
            invariants,
            scanner,
            perf,
            health,
            reporter,
            backup_validator,
            idempotency,
            scheduler,
            config,
        })
    }
}

/// Gauge alerting rules evaluated on every write, each with a five-minute
/// cooldown so a flapping metric pages once.
fn default_thresholds() -> Vec<aegis_metrics::Threshold> {
    use aegis_metrics::{BreachSeverity, Threshold, ThresholdOp};
    const COOLDOWN_MS: u64 = 300_000;
    vec![
        Threshold {
            metric: "http.error_rate".to_string(),
            operator: ThresholdOp::Gt,
            value: 0.05,
            severity: BreachSeverity::High,
            cooldown_ms: COOLDOWN_MS,
        },
        Threshold {
            metric: "db.pool.saturation_pct".to_string(),
            operator: ThresholdOp::Gt,
            value: 85.0,
            severity: BreachSeverity::Critical,
            cooldown_ms: COOLDOWN_MS,
        },
        Threshold {
            metric: "perf.overload_score".to_string(),
            operator: ThresholdOp::Ge,
            value: 70.0,
            severity: BreachSeverity::Critical,
            cooldown_ms: COOLDOWN_MS,
        },
        Threshold {
            metric: "health.score".to_string(),
            operator: ThresholdOp::Lt,
            value: 60.0,
            severity: BreachSeverity::High,
            cooldown_ms: COOLDOWN_MS,
        },
    ]
}

fn build_alerts(
    config: &AegisConfig,
    metrics: &Arc<aegis_metrics::MetricsRegistry>,
) -> Arc<dyn AlertSink> {
    // Each webhook rides its own circuit breaker so one dead transport
    // cannot stall the engines.
    let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();
    if let Some(url) = &config.alert_webhook_url {
        sinks.push(Arc::new(ResilientAlerter::new(
            "ops",
            Arc::new(WebhookAlerter::new(url)),
            metrics.clone(),
        )));
    }
    if let Some(url) = &config.slack_webhook_url {
        sinks.push(Arc::new(ResilientAlerter::new(
            "slack",
            Arc::new(WebhookAlerter::new(url)),
            metrics.clone(),
        )));
    }
    if let Some(key) = &config.pagerduty_routing_key {
        sinks.push(Arc::new(PagerDutyAlerter::new(key)));
    }
    match sinks.len() {
        0 => {
            warn!("no alert transport configured, alerts will only be logged");
            Arc::new(NullAlerter)
        }
        1 => sinks.remove(0),
        _ => Arc::new(MultiAlerter::new(sinks)),
    }
}
