//! Composite health scoring for the Aegis control plane.
//!
//! Six weighted components sum to a 0-100 score:
//!
//! | component  | max | source                          |
//! |------------|-----|---------------------------------|
//! | integrity  | 30  | latest drift score              |
//! | errorRate  | 20  | `http.error_rate` gauge         |
//! | latency    | 15  | request-duration p95            |
//! | incidents  | 20  | open incident counts            |
//! | backup     | 10  | age of latest PASSED validation |
//! | migrations | 5   | pending schema migrations       |
//!
//! An F grade (< 40) auto-engages safe mode; scores 40-49 alert CRITICAL
//! without engaging.

#![forbid(unsafe_code)]

use aegis_alert::{Alert, AlertSink};
use aegis_metrics::MetricsRegistry;
use aegis_proto::{AlertSeverity, HealthComponents, HealthGrade, HealthScoreSample, Priority};
use aegis_store::{OpsStore, StoreStats};
use chrono::Utc;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Reason recorded when the scorer engages safe mode on its own.
pub const AUTO_ENGAGE_REASON: &str = "Health score F - auto-engaged";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationsStatus {
    Clean,
    Pending(u32),
    /// The migration-status query itself failed; partial credit.
    Unknown,
}

/// Everything the pure component computation needs.
#[derive(Debug, Clone, Copy)]
pub struct HealthInputs {
    pub drift_score: u8,
    /// 0.0-1.0 fraction.
    pub error_rate: f64,
    pub p95_ms: f64,
    pub p1_open: usize,
    pub p2_open: usize,
    pub p3_open: usize,
    pub p4_open: usize,
    pub backup_age_hours: Option<f64>,
    pub migrations: MigrationsStatus,
}

/// Component table from the inputs. Pure function.
pub fn compute_components(inputs: &HealthInputs) -> HealthComponents {
    let integrity = ((inputs.drift_score as f64 / 100.0) * 30.0).round() as u8;

    let error_rate = if inputs.error_rate == 0.0 {
        20
    } else if inputs.error_rate < 0.005 {
        18
    } else if inputs.error_rate < 0.01 {
        15
    } else if inputs.error_rate < 0.03 {
        10
    } else if inputs.error_rate < 0.05 {
        5
    } else {
        0
    };

    let latency = if inputs.p95_ms == 0.0 || inputs.p95_ms < 100.0 {
        15
    } else if inputs.p95_ms < 200.0 {
        12
    } else if inputs.p95_ms < 500.0 {
        8
    } else if inputs.p95_ms < 1000.0 {
        4
    } else {
        0
    };

    let deduction =
        10 * inputs.p1_open + 5 * inputs.p2_open + 2 * inputs.p3_open + inputs.p4_open;
    let incidents = 20_usize.saturating_sub(deduction) as u8;

    let backup = match inputs.backup_age_hours {
        Some(age) if age < 12.0 => 10,
        Some(age) if age < 24.0 => 7,
        Some(age) if age < 48.0 => 3,
        _ => 0,
    };

    let migrations = match inputs.migrations {
        MigrationsStatus::Clean => 5,
        MigrationsStatus::Pending(_) => 0,
        MigrationsStatus::Unknown => 3,
    };

    HealthComponents {
        integrity,
        error_rate,
        latency,
        incidents,
        backup,
        migrations,
    }
}

// ─── Scorer ──────────────────────────────────────────────────────────────────

pub struct HealthScorer {
    store: Arc<OpsStore>,
    metrics: Arc<MetricsRegistry>,
    stats: Arc<dyn StoreStats>,
    alerts: Arc<dyn AlertSink>,
}

impl HealthScorer {
    pub fn new(
        store: Arc<OpsStore>,
        metrics: Arc<MetricsRegistry>,
        stats: Arc<dyn StoreStats>,
        alerts: Arc<dyn AlertSink>,
    ) -> Self {
        Self {
            store,
            metrics,
            stats,
            alerts,
        }
    }

    fn gather_inputs(&self) -> HealthInputs {
        let drift_score = self
            .store
            .latest_drift_sample()
            .map(|s| s.score)
            .unwrap_or(100);
        let counts = self.store.open_counts_by_priority();
        let backup_age_hours = self.store.latest_passed_backup().map(|b| {
            Utc::now()
                .signed_duration_since(b.validated_at)
                .num_minutes() as f64
                / 60.0
        });
        let migrations = match self.stats.pending_migrations() {
            Ok(0) => MigrationsStatus::Clean,
            Ok(n) => MigrationsStatus::Pending(n),
            Err(e) => {
                warn!(error = %e, "migration status query failed, partial credit");
                MigrationsStatus::Unknown
            }
        };

        HealthInputs {
            drift_score,
            error_rate: self.metrics.gauge("http.error_rate"),
            p95_ms: self.metrics.percentile("http.request_duration_ms", 95.0),
            p1_open: counts.get(&Priority::P1).copied().unwrap_or(0),
            p2_open: counts.get(&Priority::P2).copied().unwrap_or(0),
            p3_open: counts.get(&Priority::P3).copied().unwrap_or(0),
            p4_open: counts.get(&Priority::P4).copied().unwrap_or(0),
            backup_age_hours,
            migrations,
        }
    }

    /// Compute, persist, and act on one health sample.
    pub async fn compute(&self) -> HealthScoreSample {
        let inputs = self.gather_inputs();
        let components = compute_components(&inputs);
        let score = components.total();
        let grade = HealthGrade::from_score(score);
        self.metrics.set_gauge("health.score", score as f64);

        let mut safe_mode = self.store.safe_mode().safe_mode;
        if grade == HealthGrade::F && !safe_mode {
            self.store.enable_safe_mode(AUTO_ENGAGE_REASON, "health-scorer");
            safe_mode = true;
            warn!(score, "health grade F, safe mode auto-engaged");
            let alert = Alert::new(
                AlertSeverity::Critical,
                "Safe mode engaged",
                format!("Health score {score} (grade F); writes are now refused"),
            );
            if let Err(e) = self.alerts.send(&alert).await {
                warn!(error = %e, "failed to send safe-mode alert");
            }
        } else if (40..50).contains(&score) {
            let alert = Alert::new(
                AlertSeverity::Critical,
                "Health score approaching safe-mode threshold",
                format!("Health score {score} (grade D)"),
            );
            if let Err(e) = self.alerts.send(&alert).await {
                warn!(error = %e, "failed to send health alert");
            }
        }

        let sample = HealthScoreSample {
            id: Uuid::new_v4().to_string(),
            score,
            grade,
            components,
            safe_mode,
            recorded_at: Utc::now(),
        };
        self.store.append_health_sample(sample.clone());
        info!(score, grade = %grade, safe_mode, "health score computed");
        sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_alert::RecordingAlerter;
    use aegis_proto::{BackupStatus, BackupValidation, DriftScoreSample, Incident, IncidentStatus};
    use aegis_store::memory::MemoryStoreStats;
    use std::collections::HashMap;

    fn healthy_inputs() -> HealthInputs {
        HealthInputs {
            drift_score: 100,
            error_rate: 0.0,
            p95_ms: 0.0,
            p1_open: 0,
            p2_open: 0,
            p3_open: 0,
            p4_open: 0,
            backup_age_hours: Some(1.0),
            migrations: MigrationsStatus::Clean,
        }
    }

    #[test]
    fn test_perfect_score() {
        let c = compute_components(&healthy_inputs());
        assert_eq!(c.total(), 100);
        assert_eq!(HealthGrade::from_score(c.total()), HealthGrade::A);
    }

    #[test]
    fn test_integrity_scales_with_drift() {
        let mut inputs = healthy_inputs();
        inputs.drift_score = 92;
        assert_eq!(compute_components(&inputs).integrity, 28);
        inputs.drift_score = 0;
        assert_eq!(compute_components(&inputs).integrity, 0);
        inputs.drift_score = 50;
        assert_eq!(compute_components(&inputs).integrity, 15);
    }

    #[test]
    fn test_error_rate_tiers() {
        let mut inputs = healthy_inputs();
        let cases = [
            (0.0, 20),
            (0.004, 18),
            (0.009, 15),
            (0.02, 10),
            (0.04, 5),
            (0.08, 0),
        ];
        for (rate, expected) in cases {
            inputs.error_rate = rate;
            assert_eq!(compute_components(&inputs).error_rate, expected, "rate {rate}");
        }
    }

    #[test]
    fn test_latency_tiers() {
        let mut inputs = healthy_inputs();
        let cases = [(0.0, 15), (50.0, 15), (150.0, 12), (300.0, 8), (800.0, 4), (1200.0, 0)];
        for (p95, expected) in cases {
            inputs.p95_ms = p95;
            assert_eq!(compute_components(&inputs).latency, expected, "p95 {p95}");
        }
    }

    #[test]
    fn test_incident_deductions_floor_at_zero() {
        let mut inputs = healthy_inputs();
        inputs.p1_open = 1;
        inputs.p2_open = 1;
        inputs.p3_open = 2;
        inputs.p4_open = 1;
        assert_eq!(compute_components(&inputs).incidents, 0);

        inputs.p1_open = 3;
        assert_eq!(compute_components(&inputs).incidents, 0);

        let mut light = healthy_inputs();
        light.p3_open = 1;
        assert_eq!(compute_components(&light).incidents, 18);
    }

    #[test]
    fn test_backup_age_tiers() {
        let mut inputs = healthy_inputs();
        let cases = [
            (Some(6.0), 10),
            (Some(18.0), 7),
            (Some(30.0), 3),
            (Some(72.0), 0),
            (None, 0),
        ];
        for (age, expected) in cases {
            inputs.backup_age_hours = age;
            assert_eq!(compute_components(&inputs).backup, expected, "age {age:?}");
        }
    }

    #[test]
    fn test_migrations_partial_credit() {
        let mut inputs = healthy_inputs();
        inputs.migrations = MigrationsStatus::Unknown;
        assert_eq!(compute_components(&inputs).migrations, 3);
        inputs.migrations = MigrationsStatus::Pending(2);
        assert_eq!(compute_components(&inputs).migrations, 0);
    }

    #[test]
    fn test_degraded_stack_scores_f() {
        // No backups, 3 open P1s, 8% errors, p95 1200ms, drift 0.
        let inputs = HealthInputs {
            drift_score: 0,
            error_rate: 0.08,
            p95_ms: 1200.0,
            p1_open: 3,
            p2_open: 0,
            p3_open: 0,
            p4_open: 0,
            backup_age_hours: None,
            migrations: MigrationsStatus::Clean,
        };
        let c = compute_components(&inputs);
        assert_eq!(
            (c.integrity, c.error_rate, c.latency, c.incidents, c.backup, c.migrations),
            (0, 0, 0, 0, 0, 5)
        );
        assert_eq!(c.total(), 5);
        assert_eq!(HealthGrade::from_score(c.total()), HealthGrade::F);
    }

    // ─── Scorer integration ──────────────────────────────────────────────────

    fn scorer() -> (
        tempfile::TempDir,
        Arc<OpsStore>,
        Arc<MetricsRegistry>,
        Arc<MemoryStoreStats>,
        Arc<RecordingAlerter>,
        HealthScorer,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(OpsStore::open(dir.path()));
        let metrics = Arc::new(MetricsRegistry::new());
        let stats = Arc::new(MemoryStoreStats::new());
        let alerts = Arc::new(RecordingAlerter::new());
        let scorer = HealthScorer::new(store.clone(), metrics.clone(), stats.clone(), alerts.clone());
        (dir, store, metrics, stats, alerts, scorer)
    }

    fn open_p1(store: &OpsStore, id: &str) {
        store.insert_incident(Incident {
            id: id.to_string(),
            priority: Priority::P1,
            status: IncidentStatus::Open,
            title: "t".to_string(),
            invariant: None,
            details: serde_json::json!({}),
            forensic: serde_json::json!({}),
            auto_heal_attempts: 0,
            auto_healed: false,
            created_at: Utc::now(),
            updated_at: Utc::now(),
            resolved_at: None,
            escalated_at: None,
            resolved_by: None,
            resolved_reason: None,
        });
    }

    #[tokio::test]
    async fn test_f_grade_engages_safe_mode() {
        let (_dir, store, metrics, _stats, alerts, scorer) = scorer();
        store.append_drift_sample(DriftScoreSample {
            id: "d-1".to_string(),
            score: 0,
            components: HashMap::new(),
            created_at: Utc::now(),
        });
        metrics.set_gauge("http.error_rate", 0.08);
        for _ in 0..100 {
            metrics.record("http.request_duration_ms", 1200.0);
        }
        for i in 0..3 {
            open_p1(&store, &format!("p1-{i}"));
        }

        let sample = scorer.compute().await;
        assert_eq!(sample.score, 5);
        assert_eq!(sample.grade, HealthGrade::F);
        assert!(sample.safe_mode);

        let state = store.safe_mode();
        assert!(state.safe_mode);
        assert!(state.reason.expect("reason").starts_with("Health score F"));
        assert!(alerts.alerts().iter().any(|a| a.title.contains("Safe mode")));
    }

    #[tokio::test]
    async fn test_d_grade_alerts_without_engaging() {
        let (_dir, store, metrics, _stats, alerts, scorer) = scorer();
        // integrity 30 + errors 0 + latency 0 + incidents 10 + backup 0 + migrations 5 = 45.
        metrics.set_gauge("http.error_rate", 0.9);
        for _ in 0..100 {
            metrics.record("http.request_duration_ms", 2000.0);
        }
        open_p1(&store, "p1-a");

        let sample = scorer.compute().await;
        assert_eq!(sample.score, 45);
        assert_eq!(sample.grade, HealthGrade::D);
        assert!(!sample.safe_mode);
        assert!(!store.safe_mode().safe_mode);
        assert_eq!(alerts.count(), 1);
        assert_eq!(alerts.alerts()[0].severity, AlertSeverity::Critical);
    }

    #[tokio::test]
    async fn test_healthy_system_scores_high() {
        let (_dir, store, _metrics, _stats, alerts, scorer) = scorer();
        store.append_backup_validation(BackupValidation {
            id: "bv-1".to_string(),
            backup_file: "dump.sql.gz".to_string(),
            size_kb: 2048,
            checksum: "ok".to_string(),
            restore_tested: true,
            drift_clean: true,
            incident_id: None,
            validated_at: Utc::now(),
            status: BackupStatus::Passed,
        });

        let sample = scorer.compute().await;
        assert_eq!(sample.score, 100);
        assert_eq!(sample.grade, HealthGrade::A);
        assert_eq!(alerts.count(), 0);
        assert!(store.latest_health_sample().is_some());
    }

    #[tokio::test]
    async fn test_migration_query_failure_partial_credit() {
        let (_dir, store, _metrics, stats, _alerts, scorer) = scorer();
        stats.set_fail_migration_query(true);
        store.append_backup_validation(BackupValidation {
            id: "bv-1".to_string(),
            backup_file: "dump.sql.gz".to_string(),
            size_kb: 2048,
            checksum: "ok".to_string(),
            restore_tested: true,
            drift_clean: true,
            incident_id: None,
            validated_at: Utc::now(),
            status: BackupStatus::Passed,
        });
        let sample = scorer.compute().await;
        assert_eq!(sample.components.migrations, 3);
        assert_eq!(sample.score, 98);
    }
}
