//! Control-plane persistence for Aegis.
//!
//! Two halves:
//! - [`OpsStore`]: typed repositories for every control-plane entity,
//!   kept in memory behind `parking_lot` locks and snapshotted to one JSON
//!   file per domain on every write. Audit chain hashing happens here, at
//!   insert time.
//! - [`BusinessData`] / [`StoreStats`]: the interfaces through which the
//!   engines consume the external business store. Production wires
//!   SQL-backed implementations; [`memory`] provides in-process fakes.

#![forbid(unsafe_code)]

use aegis_proto::{
    AUDIT_GENESIS, AuditChainEntry, BackupStatus, BackupValidation, BlockTargetType,
    DeploymentGateRun, DriftScoreSample, ExecutiveReportRow, HealthScoreSample, IdempotencyRecord,
    Incident, IncidentStatus, InvariantViolation, PerfObservation, Priority, SafeModeState,
    SecurityBlock, SecurityEvent,
};
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Serialize, de::DeserializeOwned};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

pub use business::{
    BusinessData, CreditBreachRow, DuplicateInvoiceRow, LargeTransactionRow, MovementImbalanceRow,
    OrphanedSaleItemRow, RapidFireRow, SaleAmountRow, StockRow, VoidSpikeRow,
};
pub use stats::{ConnectionActivity, StatementStat, StoreStats, TableScanStat};

pub mod error {
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum StoreError {
        #[error("not found: {0}")]
        NotFound(String),
        #[error("query failed: {0}")]
        Query(String),
        #[error("io: {0}")]
        Io(#[from] std::io::Error),
    }

    pub type Result<T> = std::result::Result<T, StoreError>;
}

pub use error::{Result, StoreError};

// ─── Snapshot Store ──────────────────────────────────────────────────────────

/// A JSON file-backed snapshot for a single domain of control-plane data.
///
/// Keeps nothing in memory itself; callers hold the live value and call
/// [`SnapshotStore::save`] after each mutation.
pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(state_path: &Path, domain: &str) -> Self {
        let path = state_path.join("state").join(format!("{domain}.json"));
        Self { path }
    }

    /// Load the domain from disk. Returns the default value if the file is
    /// missing or unreadable.
    pub fn load<T: DeserializeOwned + Default>(&self) -> T {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                warn!(path = %self.path.display(), error = %e, "corrupt state file, starting fresh");
                T::default()
            }),
            Err(_) => {
                debug!(path = %self.path.display(), "no state file, starting fresh");
                T::default()
            }
        }
    }

    /// Save the domain to disk, creating directories as needed.
    pub fn save<T: Serialize>(&self, data: &T) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(data).map_err(std::io::Error::other)?;
        std::fs::write(&self.path, content)
    }
}

// ─── Audit chain hashing ─────────────────────────────────────────────────────

/// Canonical timestamp text used inside the chain hash. Millisecond
/// resolution, UTC, trailing `Z`. Changing this breaks historical chains.
pub fn audit_timestamp_text(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `row_hash = SHA256(prev_hash ‖ id ‖ action ‖ entity_type ‖ entity_id ‖ created_at)`
/// hex-encoded. The format is a wire contract shared with the verifier.
pub fn audit_row_hash(
    prev_hash: &str,
    id: &str,
    action: &str,
    entity_type: &str,
    entity_id: &str,
    created_at: DateTime<Utc>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(prev_hash.as_bytes());
    hasher.update(id.as_bytes());
    hasher.update(action.as_bytes());
    hasher.update(entity_type.as_bytes());
    hasher.update(entity_id.as_bytes());
    hasher.update(audit_timestamp_text(created_at).as_bytes());
    hex::encode(hasher.finalize())
}

// ─── OpsStore ────────────────────────────────────────────────────────────────

struct Domain<T> {
    data: RwLock<T>,
    disk: SnapshotStore,
}

impl<T: Serialize + DeserializeOwned + Default> Domain<T> {
    fn open(state_path: &Path, name: &str) -> Self {
        let disk = SnapshotStore::new(state_path, name);
        let data = RwLock::new(disk.load());
        Self { data, disk }
    }

    fn snapshot(&self) {
        if let Err(e) = self.disk.save(&*self.data.read()) {
            warn!(error = %e, "failed to snapshot domain");
        }
    }
}

/// Typed repositories for every control-plane entity.
///
/// Each entity is mutated by exactly one engine; the store only enforces the
/// storage-level invariants (append-only tables, unique keys, chain hashes).
pub struct OpsStore {
    incidents: Domain<HashMap<String, Incident>>,
    violations: Domain<Vec<InvariantViolation>>,
    drift_scores: Domain<Vec<DriftScoreSample>>,
    health_scores: Domain<Vec<HealthScoreSample>>,
    safe_mode: Domain<SafeModeState>,
    idempotency: Domain<HashMap<String, IdempotencyRecord>>,
    security_events: Domain<Vec<SecurityEvent>>,
    security_blocks: Domain<HashMap<String, SecurityBlock>>,
    audit_chain: Domain<Vec<AuditChainEntry>>,
    perf_observations: Domain<Vec<PerfObservation>>,
    backup_validations: Domain<Vec<BackupValidation>>,
    gate_runs: Domain<Vec<DeploymentGateRun>>,
    executive_reports: Domain<HashMap<String, ExecutiveReportRow>>,
    /// Serializes idempotency insert races (INSERT .. ON CONFLICT DO NOTHING).
    idempotency_gate: Mutex<()>,
}

impl OpsStore {
    /// Open (or create) the store rooted at `state_path`.
    pub fn open(state_path: &Path) -> Self {
        Self {
            incidents: Domain::open(state_path, "incidents"),
            violations: Domain::open(state_path, "invariant_violations"),
            drift_scores: Domain::open(state_path, "drift_scores"),
            health_scores: Domain::open(state_path, "health_scores"),
            safe_mode: Domain::open(state_path, "safe_mode"),
            idempotency: Domain::open(state_path, "idempotency"),
            security_events: Domain::open(state_path, "security_events"),
            security_blocks: Domain::open(state_path, "security_blocks"),
            audit_chain: Domain::open(state_path, "audit_chain"),
            perf_observations: Domain::open(state_path, "perf_observations"),
            backup_validations: Domain::open(state_path, "backup_validations"),
            gate_runs: Domain::open(state_path, "deployment_gate_runs"),
            executive_reports: Domain::open(state_path, "executive_reports"),
            idempotency_gate: Mutex::new(()),
        }
    }

    // ── Incidents ───────────────────────────────────────────────────────────

    pub fn insert_incident(&self, incident: Incident) {
        self.incidents
            .data
            .write()
            .insert(incident.id.clone(), incident);
        self.incidents.snapshot();
    }

    /// Apply `f` to the incident and persist. `updated_at` is bumped here so
    /// callers cannot forget it.
    pub fn update_incident<F>(&self, id: &str, f: F) -> Result<Incident>
    where
        F: FnOnce(&mut Incident),
    {
        let updated = {
            let mut incidents = self.incidents.data.write();
            let incident = incidents
                .get_mut(id)
                .ok_or_else(|| StoreError::NotFound(format!("incident {id}")))?;
            f(incident);
            incident.updated_at = Utc::now();
            incident.clone()
        };
        self.incidents.snapshot();
        Ok(updated)
    }

    pub fn get_incident(&self, id: &str) -> Option<Incident> {
        self.incidents.data.read().get(id).cloned()
    }

    /// Open incidents ordered P1 first, then newest first.
    pub fn open_incidents(&self) -> Vec<Incident> {
        let mut open: Vec<Incident> = self
            .incidents
            .data
            .read()
            .values()
            .filter(|i| i.status.is_open())
            .cloned()
            .collect();
        open.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(b.created_at.cmp(&a.created_at))
        });
        open
    }

    pub fn open_p1_count(&self) -> usize {
        self.incidents
            .data
            .read()
            .values()
            .filter(|i| i.status.is_open() && i.priority == Priority::P1)
            .count()
    }

    pub fn open_counts_by_priority(&self) -> HashMap<Priority, usize> {
        let mut counts = HashMap::new();
        for incident in self.incidents.data.read().values() {
            if incident.status.is_open() {
                *counts.entry(incident.priority).or_insert(0) += 1;
            }
        }
        counts
    }

    /// The open or auto-healing incident referencing `invariant`, if any.
    pub fn find_open_by_invariant(&self, invariant: &str) -> Option<Incident> {
        self.incidents
            .data
            .read()
            .values()
            .find(|i| {
                matches!(
                    i.status,
                    IncidentStatus::Open | IncidentStatus::AutoHealing
                ) && i.invariant.as_deref() == Some(invariant)
            })
            .cloned()
    }

    // ── Invariant violations & drift ────────────────────────────────────────

    pub fn append_violations(&self, mut rows: Vec<InvariantViolation>) {
        if rows.is_empty() {
            return;
        }
        self.violations.data.write().append(&mut rows);
        self.violations.snapshot();
    }

    pub fn violations_since(&self, since: DateTime<Utc>) -> Vec<InvariantViolation> {
        self.violations
            .data
            .read()
            .iter()
            .filter(|v| v.created_at >= since)
            .cloned()
            .collect()
    }

    pub fn append_drift_sample(&self, sample: DriftScoreSample) {
        self.drift_scores.data.write().push(sample);
        self.drift_scores.snapshot();
    }

    pub fn latest_drift_sample(&self) -> Option<DriftScoreSample> {
        self.drift_scores.data.read().last().cloned()
    }

    // ── Health samples & safe mode ──────────────────────────────────────────

    pub fn append_health_sample(&self, sample: HealthScoreSample) {
        self.health_scores.data.write().push(sample);
        self.health_scores.snapshot();
    }

    pub fn latest_health_sample(&self) -> Option<HealthScoreSample> {
        self.health_scores.data.read().last().cloned()
    }

    pub fn safe_mode(&self) -> SafeModeState {
        self.safe_mode.data.read().clone()
    }

    /// Enable safe mode. Keeps any existing override token.
    pub fn enable_safe_mode(&self, reason: &str, enabled_by: &str) -> SafeModeState {
        let state = {
            let mut sm = self.safe_mode.data.write();
            sm.safe_mode = true;
            sm.reason = Some(reason.to_string());
            sm.enabled_at = Some(Utc::now());
            sm.enabled_by = Some(enabled_by.to_string());
            sm.updated_at = Some(Utc::now());
            sm.clone()
        };
        self.safe_mode.snapshot();
        state
    }

    /// Disable safe mode iff `token` matches the stored override token.
    /// The comparison and the flag clear happen under one lock. When no
    /// token has been configured the disable is allowed.
    pub fn disable_safe_mode(&self, token: Option<&str>, by: &str) -> bool {
        let ok = {
            let mut sm = self.safe_mode.data.write();
            let matches = match sm.override_token.as_deref() {
                None => true,
                Some(stored) => token == Some(stored),
            };
            if matches {
                sm.safe_mode = false;
                sm.reason = None;
                sm.enabled_at = None;
                sm.enabled_by = Some(by.to_string());
                sm.updated_at = Some(Utc::now());
            }
            matches
        };
        if ok {
            self.safe_mode.snapshot();
        }
        ok
    }

    /// Administrative token rotation.
    pub fn set_override_token(&self, token: &str) {
        {
            let mut sm = self.safe_mode.data.write();
            sm.override_token = Some(token.to_string());
            sm.updated_at = Some(Utc::now());
        }
        self.safe_mode.snapshot();
    }

    // ── Idempotency ─────────────────────────────────────────────────────────

    /// Insert the record iff no live record exists for the key. Mirrors
    /// `INSERT .. ON CONFLICT DO NOTHING`: returns false when the insert
    /// loses the race or a live record is already present.
    pub fn insert_idempotency_if_absent(&self, record: IdempotencyRecord) -> bool {
        let _gate = self.idempotency_gate.lock();
        let inserted = {
            let mut table = self.idempotency.data.write();
            match table.get(&record.id) {
                Some(existing) if existing.expires_at > Utc::now() => false,
                _ => {
                    table.insert(record.id.clone(), record);
                    true
                }
            }
        };
        if inserted {
            self.idempotency.snapshot();
        }
        inserted
    }

    /// Live record for `key`, if any.
    pub fn get_idempotency(&self, key: &str) -> Option<IdempotencyRecord> {
        self.idempotency
            .data
            .read()
            .get(key)
            .filter(|r| r.expires_at > Utc::now())
            .cloned()
    }

    pub fn complete_idempotency(
        &self,
        key: &str,
        status_code: u16,
        body: serde_json::Value,
    ) -> Result<()> {
        {
            let mut table = self.idempotency.data.write();
            let record = table
                .get_mut(key)
                .ok_or_else(|| StoreError::NotFound(format!("idempotency {key}")))?;
            record.status_code = Some(status_code);
            record.response_body = Some(body);
            record.locked = false;
        }
        self.idempotency.snapshot();
        Ok(())
    }

    pub fn delete_idempotency(&self, key: &str) {
        self.idempotency.data.write().remove(key);
        self.idempotency.snapshot();
    }

    /// Garbage-collect expired records. Returns how many were removed.
    pub fn purge_expired_idempotency(&self, now: DateTime<Utc>) -> usize {
        let removed = {
            let mut table = self.idempotency.data.write();
            let before = table.len();
            table.retain(|_, r| r.expires_at >= now);
            before - table.len()
        };
        if removed > 0 {
            self.idempotency.snapshot();
        }
        removed
    }

    /// Live records whose key starts with `prefix` (duplicate-transaction
    /// detection facade).
    pub fn idempotency_keys_with_prefix(&self, prefix: &str) -> Vec<IdempotencyRecord> {
        let now = Utc::now();
        self.idempotency
            .data
            .read()
            .values()
            .filter(|r| r.id.starts_with(prefix) && r.expires_at > now)
            .cloned()
            .collect()
    }

    // ── Security events & blocks ────────────────────────────────────────────

    pub fn append_security_event(&self, event: SecurityEvent) {
        self.security_events.data.write().push(event);
        self.security_events.snapshot();
    }

    pub fn security_events_since(&self, since: DateTime<Utc>) -> Vec<SecurityEvent> {
        self.security_events
            .data
            .read()
            .iter()
            .filter(|e| e.created_at >= since)
            .cloned()
            .collect()
    }

    /// Upsert a block keyed by target. A re-block extends the expiry.
    pub fn upsert_block(
        &self,
        target: &str,
        target_type: BlockTargetType,
        reason: &str,
        duration: chrono::Duration,
    ) -> SecurityBlock {
        let now = Utc::now();
        let block = {
            let mut blocks = self.security_blocks.data.write();
            let block = blocks
                .entry(target.to_string())
                .and_modify(|b| {
                    b.reason = reason.to_string();
                    b.blocked_at = now;
                    b.expires_at = now + duration;
                    b.lifted_at = None;
                    b.lifted_by = None;
                })
                .or_insert_with(|| SecurityBlock {
                    id: Uuid::new_v4().to_string(),
                    target: target.to_string(),
                    target_type,
                    reason: reason.to_string(),
                    blocked_at: now,
                    expires_at: now + duration,
                    lifted_at: None,
                    lifted_by: None,
                });
            block.clone()
        };
        self.security_blocks.snapshot();
        block
    }

    pub fn is_blocked(&self, target: &str) -> bool {
        let now = Utc::now();
        self.security_blocks
            .data
            .read()
            .get(target)
            .is_some_and(|b| b.is_effective(now))
    }

    pub fn lift_block(&self, target: &str, lifted_by: &str) -> bool {
        let lifted = {
            let mut blocks = self.security_blocks.data.write();
            match blocks.get_mut(target) {
                Some(b) if b.lifted_at.is_none() => {
                    b.lifted_at = Some(Utc::now());
                    b.lifted_by = Some(lifted_by.to_string());
                    true
                }
                _ => false,
            }
        };
        if lifted {
            self.security_blocks.snapshot();
        }
        lifted
    }

    // ── Audit chain ─────────────────────────────────────────────────────────

    /// Append an audit entry, chaining it to the previous entry's hash.
    pub fn append_audit(&self, action: &str, entity_type: &str, entity_id: &str) -> AuditChainEntry {
        let entry = {
            let mut chain = self.audit_chain.data.write();
            let prev_hash = chain
                .last()
                .map(|e| e.row_hash.clone())
                .unwrap_or_else(|| AUDIT_GENESIS.to_string());
            let id = Uuid::new_v4().to_string();
            let created_at = Utc::now();
            let row_hash =
                audit_row_hash(&prev_hash, &id, action, entity_type, entity_id, created_at);
            let entry = AuditChainEntry {
                id,
                action: action.to_string(),
                entity_type: entity_type.to_string(),
                entity_id: entity_id.to_string(),
                row_hash,
                prev_hash,
                created_at,
            };
            chain.push(entry.clone());
            entry
        };
        self.audit_chain.snapshot();
        entry
    }

    /// The first `limit` entries ordered by `created_at`.
    pub fn audit_entries(&self, limit: usize) -> Vec<AuditChainEntry> {
        let chain = self.audit_chain.data.read();
        let mut entries: Vec<AuditChainEntry> = chain.iter().take(limit).cloned().collect();
        entries.sort_by_key(|e| e.created_at);
        entries
    }

    /// Replace the chain wholesale. Restore path for historical chains
    /// migrated from another store; the verifier decides whether the
    /// imported chain is intact.
    pub fn import_audit_chain(&self, entries: Vec<AuditChainEntry>) {
        *self.audit_chain.data.write() = entries;
        self.audit_chain.snapshot();
    }

    // ── Perf observations ───────────────────────────────────────────────────

    pub fn append_perf_observation(&self, obs: PerfObservation) {
        self.perf_observations.data.write().push(obs);
        self.perf_observations.snapshot();
    }

    pub fn recent_perf_observations(&self, limit: usize) -> Vec<PerfObservation> {
        let observations = self.perf_observations.data.read();
        observations.iter().rev().take(limit).cloned().collect()
    }

    // ── Backup validations ──────────────────────────────────────────────────

    pub fn append_backup_validation(&self, validation: BackupValidation) {
        self.backup_validations.data.write().push(validation);
        self.backup_validations.snapshot();
    }

    pub fn latest_passed_backup(&self) -> Option<BackupValidation> {
        self.backup_validations
            .data
            .read()
            .iter()
            .filter(|v| v.status == BackupStatus::Passed)
            .max_by_key(|v| v.validated_at)
            .cloned()
    }

    // ── Deployment gate runs ────────────────────────────────────────────────

    pub fn append_gate_run(&self, run: DeploymentGateRun) {
        self.gate_runs.data.write().push(run);
        self.gate_runs.snapshot();
    }

    pub fn latest_gate_run(&self) -> Option<DeploymentGateRun> {
        self.gate_runs.data.read().last().cloned()
    }

    // ── Executive reports ───────────────────────────────────────────────────

    pub fn upsert_executive_report(&self, row: ExecutiveReportRow) {
        self.executive_reports
            .data
            .write()
            .insert(row.period_date.clone(), row);
        self.executive_reports.snapshot();
    }

    pub fn get_executive_report(&self, period_date: &str) -> Option<ExecutiveReportRow> {
        self.executive_reports.data.read().get(period_date).cloned()
    }

    pub fn mark_report_dispatched(&self, period_date: &str) -> Result<()> {
        {
            let mut reports = self.executive_reports.data.write();
            let row = reports
                .get_mut(period_date)
                .ok_or_else(|| StoreError::NotFound(format!("report {period_date}")))?;
            row.dispatched = true;
            row.dispatched_at = Some(Utc::now());
        }
        self.executive_reports.snapshot();
        Ok(())
    }
}

// ─── Business data interface ─────────────────────────────────────────────────

pub mod business {
    use super::Result;
    use chrono::{DateTime, Duration, Utc};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct StockRow {
        pub stock_id: String,
        pub product_id: String,
        pub shop_id: String,
        pub on_hand: i64,
    }

    /// A sale whose recorded amount disagrees with a derived amount
    /// (line-item sum or payment sum), both in minor units.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct SaleAmountRow {
        pub sale_id: String,
        pub shop_id: String,
        pub total: i64,
        pub derived: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct DuplicateInvoiceRow {
        pub invoice_number: String,
        pub occurrences: u32,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct MovementImbalanceRow {
        pub stock_id: String,
        pub shop_id: String,
        pub on_hand: i64,
        pub movement_sum: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct CreditBreachRow {
        pub customer_id: String,
        pub shop_id: String,
        pub outstanding: i64,
        pub credit_limit: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct OrphanedSaleItemRow {
        pub sale_item_id: String,
        pub sale_id: String,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct LargeTransactionRow {
        pub sale_id: String,
        pub user_id: String,
        pub shop_id: String,
        pub total: i64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct RapidFireRow {
        pub user_id: String,
        pub sale_count: u32,
        pub window_start: DateTime<Utc>,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct VoidSpikeRow {
        pub shop_id: String,
        pub confirmed: u32,
        pub voided: u32,
    }

    /// Typed analytic queries over the business tables. The SQL lives behind
    /// this seam; the engines only see rows.
    pub trait BusinessData: Send + Sync {
        fn negative_stock_rows(&self) -> Result<Vec<StockRow>>;
        fn sale_total_mismatches(&self, tolerance_minor: i64) -> Result<Vec<SaleAmountRow>>;
        fn payment_sum_mismatches(&self, tolerance_minor: i64) -> Result<Vec<SaleAmountRow>>;
        fn duplicate_invoice_numbers(&self) -> Result<Vec<DuplicateInvoiceRow>>;
        fn stock_movement_imbalances(&self) -> Result<Vec<MovementImbalanceRow>>;
        fn credit_limit_breaches(&self, tolerance_pct: f64) -> Result<Vec<CreditBreachRow>>;
        fn orphaned_sale_items(&self) -> Result<Vec<OrphanedSaleItemRow>>;
        /// Auto-correction hook for orphaned sale items. Returns rows deleted.
        fn delete_sale_items(&self, item_ids: &[String]) -> Result<u64>;

        fn large_transactions_since(
            &self,
            threshold_minor: i64,
            since: DateTime<Utc>,
        ) -> Result<Vec<LargeTransactionRow>>;
        fn rapid_fire_sellers(&self, min_sales: u32, window: Duration)
        -> Result<Vec<RapidFireRow>>;
        fn void_spike_shops(
            &self,
            min_confirmed: u32,
            void_fraction: f64,
            since: DateTime<Utc>,
        ) -> Result<Vec<VoidSpikeRow>>;

        // Forensic counters captured at incident creation.
        fn negative_stock_count(&self) -> Result<u64>;
        fn payment_gap_count(&self) -> Result<u64>;
        fn active_connection_count(&self) -> Result<u32>;
    }
}

// ─── Store statistics interface ──────────────────────────────────────────────

pub mod stats {
    use super::Result;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct StatementStat {
        pub query: String,
        pub mean_time_ms: f64,
        pub calls: u64,
    }

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub struct TableScanStat {
        pub table: String,
        pub seq_scans: u64,
        pub seq_tuples_read: u64,
        pub index_scans: u64,
    }

    #[derive(Debug, Clone, Copy, Serialize, Deserialize)]
    pub struct ConnectionActivity {
        pub active: u32,
        pub idle: u32,
        pub max_connections: u32,
    }

    /// Statement-level and activity statistics exposed by the underlying
    /// store, when available.
    pub trait StoreStats: Send + Sync {
        fn statement_stats(&self) -> Result<Vec<StatementStat>>;
        fn table_scan_stats(&self) -> Result<Vec<TableScanStat>>;
        fn connection_activity(&self) -> Result<ConnectionActivity>;
        fn pending_migrations(&self) -> Result<u32>;
    }
}

// ─── In-process fakes ────────────────────────────────────────────────────────

pub mod memory {
    //! Settable in-process implementations of [`BusinessData`] and
    //! [`StoreStats`]. Used by tests and by deployments that have not yet
    //! wired a SQL-backed implementation.

    use super::business::*;
    use super::stats::*;
    use super::{Result, StoreError};
    use chrono::{DateTime, Duration, Utc};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct BusinessTables {
        negative_stock: Vec<StockRow>,
        sale_total_mismatches: Vec<SaleAmountRow>,
        payment_mismatches: Vec<SaleAmountRow>,
        duplicate_invoices: Vec<DuplicateInvoiceRow>,
        movement_imbalances: Vec<MovementImbalanceRow>,
        credit_breaches: Vec<CreditBreachRow>,
        orphaned_items: Vec<OrphanedSaleItemRow>,
        large_transactions: Vec<LargeTransactionRow>,
        rapid_fire: Vec<RapidFireRow>,
        void_spikes: Vec<VoidSpikeRow>,
        active_connections: u32,
        fail_queries: bool,
    }

    /// In-memory [`BusinessData`] with settable query results.
    #[derive(Default)]
    pub struct MemoryBusinessData {
        tables: Mutex<BusinessTables>,
    }

    impl MemoryBusinessData {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_negative_stock(&self, rows: Vec<StockRow>) {
            self.tables.lock().negative_stock = rows;
        }

        pub fn set_sale_total_mismatches(&self, rows: Vec<SaleAmountRow>) {
            self.tables.lock().sale_total_mismatches = rows;
        }

        pub fn set_payment_mismatches(&self, rows: Vec<SaleAmountRow>) {
            self.tables.lock().payment_mismatches = rows;
        }

        pub fn set_duplicate_invoices(&self, rows: Vec<DuplicateInvoiceRow>) {
            self.tables.lock().duplicate_invoices = rows;
        }

        pub fn set_movement_imbalances(&self, rows: Vec<MovementImbalanceRow>) {
            self.tables.lock().movement_imbalances = rows;
        }

        pub fn set_credit_breaches(&self, rows: Vec<CreditBreachRow>) {
            self.tables.lock().credit_breaches = rows;
        }

        pub fn set_orphaned_items(&self, rows: Vec<OrphanedSaleItemRow>) {
            self.tables.lock().orphaned_items = rows;
        }

        pub fn set_large_transactions(&self, rows: Vec<LargeTransactionRow>) {
            self.tables.lock().large_transactions = rows;
        }

        pub fn set_rapid_fire(&self, rows: Vec<RapidFireRow>) {
            self.tables.lock().rapid_fire = rows;
        }

        pub fn set_void_spikes(&self, rows: Vec<VoidSpikeRow>) {
            self.tables.lock().void_spikes = rows;
        }

        pub fn set_active_connections(&self, n: u32) {
            self.tables.lock().active_connections = n;
        }

        /// Make every query fail, for error-path tests.
        pub fn set_fail_queries(&self, fail: bool) {
            self.tables.lock().fail_queries = fail;
        }

        fn guard(&self) -> Result<parking_lot::MutexGuard<'_, BusinessTables>> {
            let tables = self.tables.lock();
            if tables.fail_queries {
                return Err(StoreError::Query("injected query failure".to_string()));
            }
            Ok(tables)
        }
    }

    impl BusinessData for MemoryBusinessData {
        fn negative_stock_rows(&self) -> Result<Vec<StockRow>> {
            Ok(self.guard()?.negative_stock.clone())
        }

        fn sale_total_mismatches(&self, tolerance_minor: i64) -> Result<Vec<SaleAmountRow>> {
            Ok(self
                .guard()?
                .sale_total_mismatches
                .iter()
                .filter(|r| (r.total - r.derived).abs() > tolerance_minor)
                .cloned()
                .collect())
        }

        fn payment_sum_mismatches(&self, tolerance_minor: i64) -> Result<Vec<SaleAmountRow>> {
            Ok(self
                .guard()?
                .payment_mismatches
                .iter()
                .filter(|r| (r.total - r.derived).abs() > tolerance_minor)
                .cloned()
                .collect())
        }

        fn duplicate_invoice_numbers(&self) -> Result<Vec<DuplicateInvoiceRow>> {
            Ok(self.guard()?.duplicate_invoices.clone())
        }

        fn stock_movement_imbalances(&self) -> Result<Vec<MovementImbalanceRow>> {
            Ok(self.guard()?.movement_imbalances.clone())
        }

        fn credit_limit_breaches(&self, tolerance_pct: f64) -> Result<Vec<CreditBreachRow>> {
            let factor = 1.0 + tolerance_pct / 100.0;
            Ok(self
                .guard()?
                .credit_breaches
                .iter()
                .filter(|r| r.outstanding as f64 > r.credit_limit as f64 * factor)
                .cloned()
                .collect())
        }

        fn orphaned_sale_items(&self) -> Result<Vec<OrphanedSaleItemRow>> {
            Ok(self.guard()?.orphaned_items.clone())
        }

        fn delete_sale_items(&self, item_ids: &[String]) -> Result<u64> {
            let mut tables = self.guard()?;
            let before = tables.orphaned_items.len();
            tables
                .orphaned_items
                .retain(|r| !item_ids.contains(&r.sale_item_id));
            Ok((before - tables.orphaned_items.len()) as u64)
        }

        fn large_transactions_since(
            &self,
            threshold_minor: i64,
            _since: DateTime<Utc>,
        ) -> Result<Vec<LargeTransactionRow>> {
            Ok(self
                .guard()?
                .large_transactions
                .iter()
                .filter(|r| r.total >= threshold_minor)
                .cloned()
                .collect())
        }

        fn rapid_fire_sellers(
            &self,
            min_sales: u32,
            _window: Duration,
        ) -> Result<Vec<RapidFireRow>> {
            Ok(self
                .guard()?
                .rapid_fire
                .iter()
                .filter(|r| r.sale_count > min_sales)
                .cloned()
                .collect())
        }

        fn void_spike_shops(
            &self,
            min_confirmed: u32,
            void_fraction: f64,
            _since: DateTime<Utc>,
        ) -> Result<Vec<VoidSpikeRow>> {
            Ok(self
                .guard()?
                .void_spikes
                .iter()
                .filter(|r| {
                    r.confirmed >= min_confirmed
                        && r.voided as f64 > r.confirmed as f64 * void_fraction
                })
                .cloned()
                .collect())
        }

        fn negative_stock_count(&self) -> Result<u64> {
            Ok(self.guard()?.negative_stock.len() as u64)
        }

        fn payment_gap_count(&self) -> Result<u64> {
            Ok(self.guard()?.payment_mismatches.len() as u64)
        }

        fn active_connection_count(&self) -> Result<u32> {
            Ok(self.guard()?.active_connections)
        }
    }

    #[derive(Default)]
    struct StatsInner {
        statements: Vec<StatementStat>,
        table_scans: Vec<TableScanStat>,
        activity: Option<ConnectionActivity>,
        pending_migrations: Option<u32>,
        fail_migration_query: bool,
    }

    /// In-memory [`StoreStats`] with settable values.
    #[derive(Default)]
    pub struct MemoryStoreStats {
        inner: Mutex<StatsInner>,
    }

    impl MemoryStoreStats {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn set_statements(&self, rows: Vec<StatementStat>) {
            self.inner.lock().statements = rows;
        }

        pub fn set_table_scans(&self, rows: Vec<TableScanStat>) {
            self.inner.lock().table_scans = rows;
        }

        pub fn set_activity(&self, activity: ConnectionActivity) {
            self.inner.lock().activity = Some(activity);
        }

        pub fn set_pending_migrations(&self, n: u32) {
            self.inner.lock().pending_migrations = Some(n);
        }

        pub fn set_fail_migration_query(&self, fail: bool) {
            self.inner.lock().fail_migration_query = fail;
        }
    }

    impl StoreStats for MemoryStoreStats {
        fn statement_stats(&self) -> Result<Vec<StatementStat>> {
            Ok(self.inner.lock().statements.clone())
        }

        fn table_scan_stats(&self) -> Result<Vec<TableScanStat>> {
            Ok(self.inner.lock().table_scans.clone())
        }

        fn connection_activity(&self) -> Result<ConnectionActivity> {
            Ok(self.inner.lock().activity.unwrap_or(ConnectionActivity {
                active: 0,
                idle: 0,
                max_connections: 100,
            }))
        }

        fn pending_migrations(&self) -> Result<u32> {
            let inner = self.inner.lock();
            if inner.fail_migration_query {
                return Err(StoreError::Query("migration table unreachable".to_string()));
            }
            Ok(inner.pending_migrations.unwrap_or(0))
        }
    }
}
