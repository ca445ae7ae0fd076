//! Incident lifecycle management for the Aegis control plane.
//!
//! The manager owns every mutation of the incident table. Status moves
//! forward only:
//!
//! ```text
//!   OPEN ──violation recurs──► AUTO_HEALING ──threshold──► ESCALATED
//!    │                            │                             │
//!    │                            └──violation clears──► RESOLVED ──► CLOSED
//!    └──violation clears──► RESOLVED ──► CLOSED
//! ```
//!
//! Terminal states are sticky. CLOSED is a manual follow-up and is never
//! entered by the control plane itself.

#![forbid(unsafe_code)]

use aegis_alert::{Alert, AlertSink};
use aegis_proto::{
    ForensicSnapshot, Incident, IncidentStatus, InvariantResult, Priority,
};
use aegis_store::{OpsStore, StoreError};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Heal attempts before an incident escalates.
pub const MAX_HEAL_ATTEMPTS: u32 = 3;

/// An incident older than this escalates regardless of attempt count.
pub const ESCALATE_AFTER_MINUTES: i64 = 15;

/// Supplies the diagnostic counters captured at incident creation.
pub trait ForensicSource: Send + Sync {
    fn capture(&self) -> Result<ForensicSnapshot, StoreError>;
}

/// Forensic source that always fails; incidents get the
/// `snapshot_failed` marker. Useful before the business store is wired.
pub struct NoForensics;

impl ForensicSource for NoForensics {
    fn capture(&self) -> Result<ForensicSnapshot, StoreError> {
        Err(StoreError::Query("no forensic source wired".to_string()))
    }
}

#[derive(Debug, Clone)]
pub struct NewIncident {
    pub priority: Priority,
    pub title: String,
    pub invariant: Option<String>,
    pub details: serde_json::Value,
}

/// Aggregate counts for dashboards and the deployment gate.
#[derive(Debug, Clone, serde::Serialize)]
pub struct IncidentSummary {
    pub total_open: usize,
    pub p1_open: usize,
    pub p2_open: usize,
    pub p3_open: usize,
    pub p4_open: usize,
    pub escalated: usize,
}

pub struct IncidentManager {
    store: Arc<OpsStore>,
    alerts: Arc<dyn AlertSink>,
    forensics: Arc<dyn ForensicSource>,
}

impl IncidentManager {
    pub fn new(
        store: Arc<OpsStore>,
        alerts: Arc<dyn AlertSink>,
        forensics: Arc<dyn ForensicSource>,
    ) -> Self {
        Self {
            store,
            alerts,
            forensics,
        }
    }

    /// Open a new incident with a forensic snapshot and emit an alert keyed
    /// to the priority.
    pub async fn create_incident(&self, new: NewIncident) -> String {
        let forensic = match self.forensics.capture() {
            Ok(snapshot) => serde_json::to_value(&snapshot)
                .unwrap_or_else(|_| serde_json::json!({"error": "snapshot_failed"})),
            Err(e) => {
                warn!(error = %e, "forensic snapshot failed");
                serde_json::json!({"error": "snapshot_failed"})
            }
        };

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        let incident = Incident {
            id: id.clone(),
            priority: new.priority,
            status: IncidentStatus::Open,
            title: new.title.clone(),
            invariant: new.invariant,
            details: new.details,
            forensic,
            auto_heal_attempts: 0,
            auto_healed: false,
            created_at: now,
            updated_at: now,
            resolved_at: None,
            escalated_at: None,
            resolved_by: None,
            resolved_reason: None,
        };
        self.store.insert_incident(incident);

        info!(incident = %id, priority = %new.priority, title = %new.title, "incident opened");
        let alert = Alert::new(
            new.priority.alert_severity(),
            format!("[{}] {}", new.priority, new.title),
            format!("Incident {id} opened: {}", new.title),
        );
        if let Err(e) = self.alerts.send(&alert).await {
            warn!(error = %e, "failed to send incident alert");
        }
        id
    }

    /// Feed one invariant cycle result into the lifecycle.
    ///
    /// An existing open incident for the invariant is resolved when the
    /// violation cleared, or accrues a heal attempt when it recurred. A
    /// failed result with no open incident opens a fresh one.
    pub async fn create_or_update_from_invariant(
        &self,
        result: &InvariantResult,
        priority: Priority,
    ) {
        match self.store.find_open_by_invariant(&result.invariant) {
            Some(existing) => {
                if result.passed {
                    let reason = if result.auto_corrected {
                        "violation auto-corrected"
                    } else {
                        "violation cleared"
                    };
                    self.auto_resolve(&existing.id, reason).await;
                } else {
                    self.increment_heal_attempts(&existing.id, result).await;
                }
            }
            None => {
                if !result.passed {
                    self.create_incident(NewIncident {
                        priority,
                        title: format!("Invariant violation: {}", result.invariant),
                        invariant: Some(result.invariant.clone()),
                        details: serde_json::json!({
                            "violations": result.violations.len(),
                            "auto_corrected": result.auto_corrected,
                        }),
                    })
                    .await;
                }
            }
        }
    }

    /// Record another failed heal cycle, then escalate once the attempt or
    /// age threshold is crossed.
    pub async fn increment_heal_attempts(&self, id: &str, result: &InvariantResult) {
        let updated = self.store.update_incident(id, |incident| {
            if incident.status.is_terminal() {
                return;
            }
            incident.auto_heal_attempts += 1;
            incident.status = IncidentStatus::AutoHealing;
            if let Some(details) = incident.details.as_object_mut() {
                details.insert(
                    "violations".to_string(),
                    serde_json::json!(result.violations.len()),
                );
                details.insert(
                    "last_heal_attempt".to_string(),
                    serde_json::json!(Utc::now()),
                );
            }
        });

        let Ok(incident) = updated else {
            warn!(incident = %id, "heal attempt on unknown incident");
            return;
        };
        if incident.status.is_terminal() {
            return;
        }

        let age = Utc::now().signed_duration_since(incident.created_at);
        if incident.auto_heal_attempts >= MAX_HEAL_ATTEMPTS
            || age > Duration::minutes(ESCALATE_AFTER_MINUTES)
        {
            let reason = format!(
                "auto-heal exhausted after {} attempts",
                incident.auto_heal_attempts
            );
            self.escalate(id, &reason).await;
        }
    }

    /// Idempotent OPEN|AUTO_HEALING → ESCALATED transition. Never downgrades;
    /// the first escalation's timestamp wins.
    pub async fn escalate(&self, id: &str, reason: &str) {
        let mut newly_escalated = false;
        let result = self.store.update_incident(id, |incident| {
            if matches!(
                incident.status,
                IncidentStatus::Open | IncidentStatus::AutoHealing
            ) {
                incident.status = IncidentStatus::Escalated;
                incident.escalated_at = Some(Utc::now());
                newly_escalated = true;
            }
        });

        let Ok(incident) = result else {
            warn!(incident = %id, "escalate on unknown incident");
            return;
        };
        if !newly_escalated {
            return;
        }

        warn!(incident = %id, reason, "incident escalated");
        let alert = Alert::new(
            aegis_proto::AlertSeverity::Critical,
            format!("[{}] Incident escalated: {}", incident.priority, incident.title),
            format!("Incident {id} escalated: {reason}"),
        );
        if let Err(e) = self.alerts.send(&alert).await {
            warn!(error = %e, "failed to send escalation alert");
        }
    }

    /// Transition to RESOLVED with `auto_healed = true`. No-op on terminal
    /// states.
    pub async fn auto_resolve(&self, id: &str, reason: &str) {
        let mut resolved = false;
        let result = self.store.update_incident(id, |incident| {
            if incident.status.is_terminal() {
                return;
            }
            incident.status = IncidentStatus::Resolved;
            incident.auto_healed = true;
            incident.resolved_at = Some(Utc::now());
            incident.resolved_by = Some("aegis".to_string());
            incident.resolved_reason = Some(reason.to_string());
            resolved = true;
        });

        match result {
            Ok(_) if resolved => {
                info!(incident = %id, reason, "incident auto-resolved");
            }
            Ok(_) => {}
            Err(e) => warn!(incident = %id, error = %e, "auto-resolve failed"),
        }
    }

    pub fn open_p1_count(&self) -> usize {
        self.store.open_p1_count()
    }

    pub fn summary(&self) -> IncidentSummary {
        let counts = self.store.open_counts_by_priority();
        let open = self.store.open_incidents();
        IncidentSummary {
            total_open: open.len(),
            p1_open: counts.get(&Priority::P1).copied().unwrap_or(0),
            p2_open: counts.get(&Priority::P2).copied().unwrap_or(0),
            p3_open: counts.get(&Priority::P3).copied().unwrap_or(0),
            p4_open: counts.get(&Priority::P4).copied().unwrap_or(0),
            escalated: open
                .iter()
                .filter(|i| i.status == IncidentStatus::Escalated)
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_alert::RecordingAlerter;
    use aegis_proto::AlertSeverity;

    struct FixedForensics;

    impl ForensicSource for FixedForensics {
        fn capture(&self) -> Result<ForensicSnapshot, StoreError> {
            Ok(ForensicSnapshot {
                negative_stock_rows: 1,
                payment_gap_sales: 0,
                active_db_connections: 7,
                heap_used_mb: 118.5,
                uptime_secs: 3600,
            })
        }
    }

    fn manager_with(
        forensics: Arc<dyn ForensicSource>,
    ) -> (tempfile::TempDir, Arc<OpsStore>, Arc<RecordingAlerter>, IncidentManager) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(OpsStore::open(dir.path()));
        let alerts = Arc::new(RecordingAlerter::new());
        let manager = IncidentManager::new(store.clone(), alerts.clone(), forensics);
        (dir, store, alerts, manager)
    }

    fn failed_result(invariant: &str, count: usize) -> InvariantResult {
        InvariantResult {
            invariant: invariant.to_string(),
            passed: false,
            drift_score: 100.0 - 10.0 * count as f64,
            violations: (0..count)
                .map(|i| aegis_proto::ViolationRecord {
                    entity_id: format!("e-{i}"),
                    entity_type: "stock".to_string(),
                    shop_id: None,
                    detail: "on-hand below zero".to_string(),
                })
                .collect(),
            auto_corrected: false,
        }
    }

    fn passed_result(invariant: &str, auto_corrected: bool) -> InvariantResult {
        InvariantResult {
            invariant: invariant.to_string(),
            passed: true,
            drift_score: 100.0,
            violations: Vec::new(),
            auto_corrected,
        }
    }

    #[tokio::test]
    async fn test_create_incident_with_forensics_and_alert() {
        let (_dir, store, alerts, manager) = manager_with(Arc::new(FixedForensics));
        let id = manager
            .create_incident(NewIncident {
                priority: Priority::P1,
                title: "Invariant violation: NO_NEGATIVE_STOCK".to_string(),
                invariant: Some("NO_NEGATIVE_STOCK".to_string()),
                details: serde_json::json!({"violations": 1}),
            })
            .await;

        let incident = store.get_incident(&id).expect("incident");
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.forensic["negative_stock_rows"], 1);
        assert_eq!(incident.forensic["active_db_connections"], 7);

        let sent = alerts.alerts();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].severity, AlertSeverity::Critical);
        assert!(sent[0].title.starts_with("[P1]"));
    }

    #[tokio::test]
    async fn test_snapshot_failure_is_recorded() {
        let (_dir, store, _alerts, manager) = manager_with(Arc::new(NoForensics));
        let id = manager
            .create_incident(NewIncident {
                priority: Priority::P3,
                title: "t".to_string(),
                invariant: None,
                details: serde_json::json!({}),
            })
            .await;
        let incident = store.get_incident(&id).expect("incident");
        assert_eq!(incident.forensic["error"], "snapshot_failed");
    }

    #[tokio::test]
    async fn test_priority_alert_severity_mapping() {
        let (_dir, _store, alerts, manager) = manager_with(Arc::new(NoForensics));
        for (priority, severity) in [
            (Priority::P1, AlertSeverity::Critical),
            (Priority::P2, AlertSeverity::High),
            (Priority::P3, AlertSeverity::Medium),
            (Priority::P4, AlertSeverity::Low),
        ] {
            manager
                .create_incident(NewIncident {
                    priority,
                    title: "x".to_string(),
                    invariant: None,
                    details: serde_json::json!({}),
                })
                .await;
            assert_eq!(alerts.alerts().last().expect("alert").severity, severity);
        }
    }

    #[tokio::test]
    async fn test_invariant_flow_creates_then_heals_then_escalates() {
        let (_dir, store, alerts, manager) = manager_with(Arc::new(NoForensics));

        // First failing cycle opens an incident.
        manager
            .create_or_update_from_invariant(&failed_result("NO_NEGATIVE_STOCK", 3), Priority::P1)
            .await;
        let incident = store
            .find_open_by_invariant("NO_NEGATIVE_STOCK")
            .expect("open incident");
        assert_eq!(incident.status, IncidentStatus::Open);
        assert_eq!(incident.title, "Invariant violation: NO_NEGATIVE_STOCK");

        // Recurring violations accrue heal attempts.
        manager
            .create_or_update_from_invariant(&failed_result("NO_NEGATIVE_STOCK", 2), Priority::P1)
            .await;
        let incident = store.get_incident(&incident.id).expect("incident");
        assert_eq!(incident.status, IncidentStatus::AutoHealing);
        assert_eq!(incident.auto_heal_attempts, 1);
        assert_eq!(incident.details["violations"], 2);

        manager
            .create_or_update_from_invariant(&failed_result("NO_NEGATIVE_STOCK", 2), Priority::P1)
            .await;
        manager
            .create_or_update_from_invariant(&failed_result("NO_NEGATIVE_STOCK", 2), Priority::P1)
            .await;

        // Third attempt crosses MAX_HEAL_ATTEMPTS.
        let incident = store.get_incident(&incident.id).expect("incident");
        assert_eq!(incident.status, IncidentStatus::Escalated);
        assert!(incident.escalated_at.is_some());
        assert!(alerts.alerts().iter().any(|a| a.title.contains("escalated")));
    }

    #[tokio::test]
    async fn test_invariant_clear_auto_resolves() {
        let (_dir, store, _alerts, manager) = manager_with(Arc::new(NoForensics));
        manager
            .create_or_update_from_invariant(&failed_result("NO_ORPHANED_SALE_ITEMS", 2), Priority::P3)
            .await;
        let incident = store
            .find_open_by_invariant("NO_ORPHANED_SALE_ITEMS")
            .expect("open");

        manager
            .create_or_update_from_invariant(&passed_result("NO_ORPHANED_SALE_ITEMS", true), Priority::P3)
            .await;
        let incident = store.get_incident(&incident.id).expect("incident");
        assert_eq!(incident.status, IncidentStatus::Resolved);
        assert!(incident.auto_healed);
        assert_eq!(
            incident.resolved_reason.as_deref(),
            Some("violation auto-corrected")
        );
    }

    #[tokio::test]
    async fn test_passed_result_without_open_incident_is_noop() {
        let (_dir, store, alerts, manager) = manager_with(Arc::new(NoForensics));
        manager
            .create_or_update_from_invariant(&passed_result("NO_DUPLICATE_INVOICES", false), Priority::P1)
            .await;
        assert!(store.open_incidents().is_empty());
        assert_eq!(alerts.count(), 0);
    }

    #[tokio::test]
    async fn test_escalate_is_idempotent() {
        let (_dir, store, _alerts, manager) = manager_with(Arc::new(NoForensics));
        let id = manager
            .create_incident(NewIncident {
                priority: Priority::P2,
                title: "t".to_string(),
                invariant: None,
                details: serde_json::json!({}),
            })
            .await;

        manager.escalate(&id, "first").await;
        let first = store.get_incident(&id).expect("incident").escalated_at;
        assert!(first.is_some());

        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        manager.escalate(&id, "second").await;
        let second = store.get_incident(&id).expect("incident").escalated_at;
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_auto_resolve_skips_terminal() {
        let (_dir, store, _alerts, manager) = manager_with(Arc::new(NoForensics));
        let id = manager
            .create_incident(NewIncident {
                priority: Priority::P2,
                title: "t".to_string(),
                invariant: None,
                details: serde_json::json!({}),
            })
            .await;

        manager.auto_resolve(&id, "fixed").await;
        let resolved_at = store.get_incident(&id).expect("incident").resolved_at;

        manager.auto_resolve(&id, "fixed again").await;
        let incident = store.get_incident(&id).expect("incident");
        assert_eq!(incident.resolved_at, resolved_at);
        assert_eq!(incident.resolved_reason.as_deref(), Some("fixed"));
    }

    #[tokio::test]
    async fn test_summary_counts() {
        let (_dir, _store, _alerts, manager) = manager_with(Arc::new(NoForensics));
        for priority in [Priority::P1, Priority::P1, Priority::P2, Priority::P4] {
            manager
                .create_incident(NewIncident {
                    priority,
                    title: "x".to_string(),
                    invariant: None,
                    details: serde_json::json!({}),
                })
                .await;
        }
        let summary = manager.summary();
        assert_eq!(summary.total_open, 4);
        assert_eq!(summary.p1_open, 2);
        assert_eq!(summary.p2_open, 1);
        assert_eq!(summary.p4_open, 1);
        assert_eq!(manager.open_p1_count(), 2);
    }
}
