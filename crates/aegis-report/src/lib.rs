//! Daily executive reporting and backup validation.
//!
//! The reporter condenses the day's control-plane state (health, drift,
//! incidents, security, performance, backups) into one upserted row per
//! period date and dispatches it to the executive webhook. The backup
//! validator checks the newest dump and opens a P1 when validation fails.

#![forbid(unsafe_code)]

use aegis_incident::{IncidentManager, IncidentSummary, NewIncident};
use aegis_metrics::MetricsRegistry;
use aegis_proto::{BackupStatus, BackupValidation, ExecutiveReportRow, Priority};
use aegis_store::OpsStore;
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

// ─── Executive summary ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutiveSummary {
    pub period_date: String,
    pub generated_at: chrono::DateTime<Utc>,
    pub health_score: Option<u8>,
    pub health_grade: Option<String>,
    pub safe_mode: bool,
    pub drift_score: Option<u8>,
    pub incidents: IncidentSummary,
    pub security_events_24h: usize,
    pub overload_score: f64,
    pub error_rate: f64,
    pub latest_backup: Option<String>,
}

/// Where finished reports are delivered.
#[async_trait]
pub trait ReportSink: Send + Sync {
    async fn dispatch(&self, summary: &ExecutiveSummary) -> anyhow::Result<()>;
}

/// POSTs the summary JSON to the executive webhook.
pub struct WebhookReportSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookReportSink {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl ReportSink for WebhookReportSink {
    async fn dispatch(&self, summary: &ExecutiveSummary) -> anyhow::Result<()> {
        let response = self.client.post(&self.url).json(summary).send().await?;
        anyhow::ensure!(
            response.status().is_success(),
            "executive webhook returned {}",
            response.status()
        );
        Ok(())
    }
}

/// Captures dispatched summaries; test support.
#[derive(Default)]
pub struct RecordingReportSink {
    summaries: parking_lot::Mutex<Vec<ExecutiveSummary>>,
}

impl RecordingReportSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn dispatched(&self) -> Vec<ExecutiveSummary> {
        self.summaries.lock().clone()
    }
}

#[async_trait]
impl ReportSink for RecordingReportSink {
    async fn dispatch(&self, summary: &ExecutiveSummary) -> anyhow::Result<()> {
        self.summaries.lock().push(summary.clone());
        Ok(())
    }
}

pub struct ExecutiveReporter {
    store: Arc<OpsStore>,
    metrics: Arc<MetricsRegistry>,
    incidents: Arc<IncidentManager>,
    sink: Option<Arc<dyn ReportSink>>,
}

impl ExecutiveReporter {
    pub fn new(
        store: Arc<OpsStore>,
        metrics: Arc<MetricsRegistry>,
        incidents: Arc<IncidentManager>,
        sink: Option<Arc<dyn ReportSink>>,
    ) -> Self {
        Self {
            store,
            metrics,
            incidents,
            sink,
        }
    }

    pub fn build_summary(&self) -> ExecutiveSummary {
        let now = Utc::now();
        let health = self.store.latest_health_sample();
        ExecutiveSummary {
            period_date: now.format("%Y-%m-%d").to_string(),
            generated_at: now,
            health_score: health.as_ref().map(|h| h.score),
            health_grade: health.as_ref().map(|h| h.grade.to_string()),
            safe_mode: self.store.safe_mode().safe_mode,
            drift_score: self.store.latest_drift_sample().map(|d| d.score),
            incidents: self.incidents.summary(),
            security_events_24h: self
                .store
                .security_events_since(now - chrono::Duration::hours(24))
                .len(),
            overload_score: self.metrics.gauge("perf.overload_score"),
            error_rate: self.metrics.gauge("http.error_rate"),
            latest_backup: self.store.latest_passed_backup().map(|b| b.backup_file),
        }
    }

    /// Build, upsert one row per period date, and dispatch.
    pub async fn run(&self) -> ExecutiveSummary {
        let summary = self.build_summary();
        let report = serde_json::to_value(&summary).unwrap_or_else(|_| serde_json::json!({}));
        self.store.upsert_executive_report(ExecutiveReportRow {
            period_date: summary.period_date.clone(),
            report,
            dispatched: false,
            dispatched_at: None,
        });

        if let Some(sink) = &self.sink {
            match sink.dispatch(&summary).await {
                Ok(()) => {
                    if let Err(e) = self.store.mark_report_dispatched(&summary.period_date) {
                        warn!(error = %e, "failed to mark report dispatched");
                    }
                    info!(period = %summary.period_date, "executive report dispatched");
                }
                Err(e) => warn!(error = %e, "executive report dispatch failed"),
            }
        }
        summary
    }
}

// ─── Backup validation ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct BackupInfo {
    pub file: String,
    pub size_kb: u64,
    pub checksum: String,
}

#[derive(Debug, Clone, Copy)]
pub struct RestoreOutcome {
    pub restore_ok: bool,
    /// Integrity checks against the restored copy came back clean.
    pub drift_clean: bool,
}

/// Supplies backup artifacts and the shadow-restore test. The dump/restore
/// subprocesses live behind this seam; they carry no engine-side timeout.
#[async_trait]
pub trait BackupSource: Send + Sync {
    fn latest_backup(&self) -> Option<BackupInfo>;
    async fn restore_test(&self) -> anyhow::Result<RestoreOutcome>;
}

pub struct BackupValidator {
    store: Arc<OpsStore>,
    incidents: Arc<IncidentManager>,
    source: Arc<dyn BackupSource>,
    /// Restore tests need a shadow store; disabled when none is configured.
    restore_enabled: bool,
}

impl BackupValidator {
    pub fn new(
        store: Arc<OpsStore>,
        incidents: Arc<IncidentManager>,
        source: Arc<dyn BackupSource>,
        restore_enabled: bool,
    ) -> Self {
        Self {
            store,
            incidents,
            source,
            restore_enabled,
        }
    }

    /// Validate the newest backup. Terminal status never reverts; a FAILED
    /// validation opens a P1 incident and the job keeps scheduling.
    pub async fn run_validation(&self) -> BackupValidation {
        let now = Utc::now();
        let Some(info) = self.source.latest_backup() else {
            return self
                .finish(
                    BackupValidation {
                        id: Uuid::new_v4().to_string(),
                        backup_file: String::new(),
                        size_kb: 0,
                        checksum: String::new(),
                        restore_tested: false,
                        drift_clean: false,
                        incident_id: None,
                        validated_at: now,
                        status: BackupStatus::Failed,
                    },
                    "no backup artifact found",
                )
                .await;
        };

        let artifact_ok = info.size_kb > 0 && !info.checksum.is_empty();
        let (restore_tested, restore_ok, drift_clean) = if self.restore_enabled {
            match self.source.restore_test().await {
                Ok(outcome) => (true, outcome.restore_ok, outcome.drift_clean),
                Err(e) => {
                    warn!(error = %e, "restore test failed to run");
                    (true, false, false)
                }
            }
        } else {
            (false, true, true)
        };

        let passed = artifact_ok && restore_ok && drift_clean;
        let validation = BackupValidation {
            id: Uuid::new_v4().to_string(),
            backup_file: info.file,
            size_kb: info.size_kb,
            checksum: info.checksum,
            restore_tested,
            drift_clean,
            incident_id: None,
            validated_at: now,
            status: if passed {
                BackupStatus::Passed
            } else {
                BackupStatus::Failed
            },
        };

        if passed {
            info!(file = %validation.backup_file, "backup validation passed");
            self.store.append_backup_validation(validation.clone());
            validation
        } else {
            self.finish(validation, "backup validation failed").await
        }
    }

    async fn finish(&self, mut validation: BackupValidation, reason: &str) -> BackupValidation {
        warn!(file = %validation.backup_file, reason, "backup validation failed");
        let incident_id = self
            .incidents
            .create_incident(NewIncident {
                priority: Priority::P1,
                title: "Backup validation failed".to_string(),
                invariant: None,
                details: serde_json::json!({
                    "backup_file": validation.backup_file,
                    "reason": reason,
                }),
            })
            .await;
        validation.incident_id = Some(incident_id);
        self.store.append_backup_validation(validation.clone());
        validation
    }
}
