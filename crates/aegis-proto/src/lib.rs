//! Shared control-plane types for the Aegis operations platform.
//!
//! Defines the persistent entities (incidents, violations, score samples,
//! blocks, audit chain entries) and the value types exchanged between the
//! engines. The business domain (sales, stock, customers) never appears here;
//! the control plane only sees opaque entity ids.

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ─── Priority & Severity ─────────────────────────────────────────────────────

/// Incident priority band. P1 is the highest; the derived ordering puts
/// P1 > P2 > P3 > P4 so `max()` picks the most urgent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P4,
    P3,
    P2,
    P1,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P1 => write!(f, "P1"),
            Self::P2 => write!(f, "P2"),
            Self::P3 => write!(f, "P3"),
            Self::P4 => write!(f, "P4"),
        }
    }
}

impl Priority {
    /// Alert severity emitted when an incident of this priority opens.
    pub fn alert_severity(self) -> AlertSeverity {
        match self {
            Self::P1 => AlertSeverity::Critical,
            Self::P2 => AlertSeverity::High,
            Self::P3 => AlertSeverity::Medium,
            Self::P4 => AlertSeverity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

// ─── Incident lifecycle ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IncidentStatus {
    Open,
    AutoHealing,
    Escalated,
    Resolved,
    Closed,
}

impl IncidentStatus {
    /// Terminal states are sticky; no engine transitions out of them.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Resolved | Self::Closed)
    }

    /// True if the incident still counts as open for gates and scoring.
    pub fn is_open(self) -> bool {
        matches!(self, Self::Open | Self::AutoHealing | Self::Escalated)
    }
}

impl std::fmt::Display for IncidentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "OPEN"),
            Self::AutoHealing => write!(f, "AUTO_HEALING"),
            Self::Escalated => write!(f, "ESCALATED"),
            Self::Resolved => write!(f, "RESOLVED"),
            Self::Closed => write!(f, "CLOSED"),
        }
    }
}

/// A durable incident record. Mutated only by the incident manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Incident {
    pub id: String,
    pub priority: Priority,
    pub status: IncidentStatus,
    pub title: String,
    /// Invariant name when the incident was opened by the invariant engine.
    pub invariant: Option<String>,
    pub details: serde_json::Value,
    pub forensic: serde_json::Value,
    pub auto_heal_attempts: u32,
    pub auto_healed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub resolved_by: Option<String>,
    pub resolved_reason: Option<String>,
}

// ─── Invariant results ───────────────────────────────────────────────────────

/// A single counter-example found by an invariant check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ViolationRecord {
    pub entity_id: String,
    pub entity_type: String,
    pub shop_id: Option<String>,
    pub detail: String,
}

/// Persisted audit row for one violation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantViolation {
    pub id: String,
    pub invariant: String,
    pub shop_id: Option<String>,
    pub entity_id: String,
    pub entity_type: String,
    pub details: String,
    pub auto_corrected: bool,
    pub incident_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Outcome of running one invariant for one cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InvariantResult {
    pub invariant: String,
    pub passed: bool,
    /// Per-invariant score: max(0, 100 - 10 * violation_count).
    pub drift_score: f64,
    pub violations: Vec<ViolationRecord>,
    pub auto_corrected: bool,
}

/// Per-invariant slice of a drift score sample.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftComponent {
    pub passed: bool,
    pub count: usize,
}

/// One composite drift score sample, written per invariant cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriftScoreSample {
    pub id: String,
    pub score: u8,
    pub components: HashMap<String, DriftComponent>,
    pub created_at: DateTime<Utc>,
}

// ─── Health score ────────────────────────────────────────────────────────────

/// The six weighted components of the composite health score.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthComponents {
    pub integrity: u8,
    pub error_rate: u8,
    pub latency: u8,
    pub incidents: u8,
    pub backup: u8,
    pub migrations: u8,
}

impl HealthComponents {
    pub fn total(&self) -> u8 {
        self.integrity
            + self.error_rate
            + self.latency
            + self.incidents
            + self.backup
            + self.migrations
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthGrade {
    A,
    B,
    C,
    D,
    F,
}

impl HealthGrade {
    /// Band mapping: A >= 90, B >= 75, C >= 60, D >= 40, else F.
    pub fn from_score(score: u8) -> Self {
        match score {
            90..=100 => Self::A,
            75..=89 => Self::B,
            60..=74 => Self::C,
            40..=59 => Self::D,
            _ => Self::F,
        }
    }
}

impl std::fmt::Display for HealthGrade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
            Self::C => write!(f, "C"),
            Self::D => write!(f, "D"),
            Self::F => write!(f, "F"),
        }
    }
}

/// One health score sample, written per health compute.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthScoreSample {
    pub id: String,
    pub score: u8,
    pub grade: HealthGrade,
    pub components: HealthComponents,
    pub safe_mode: bool,
    pub recorded_at: DateTime<Utc>,
}

/// Singleton safe-mode row. Exactly one per deployment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SafeModeState {
    pub safe_mode: bool,
    pub reason: Option<String>,
    pub enabled_at: Option<DateTime<Utc>>,
    pub enabled_by: Option<String>,
    pub override_token: Option<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

// ─── Idempotency ─────────────────────────────────────────────────────────────

/// A request-deduplication record keyed by the client-supplied key.
///
/// Invariant: `locked == true` implies `response_body` is absent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdempotencyRecord {
    pub id: String,
    pub response_body: Option<serde_json::Value>,
    pub status_code: Option<u16>,
    pub locked: bool,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

// ─── Security ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SecurityEventKind {
    LargeTransaction,
    RapidFireSales,
    VoidSpike,
    RateLimitExceeded,
    BruteForceLockout,
    AuditChainTamper,
}

impl std::fmt::Display for SecurityEventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::LargeTransaction => "LARGE_TRANSACTION",
            Self::RapidFireSales => "RAPID_FIRE_SALES",
            Self::VoidSpike => "VOID_SPIKE",
            Self::RateLimitExceeded => "RATE_LIMIT_EXCEEDED",
            Self::BruteForceLockout => "BRUTE_FORCE_LOCKOUT",
            Self::AuditChainTamper => "AUDIT_CHAIN_TAMPER",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: String,
    pub kind: SecurityEventKind,
    pub ip: Option<String>,
    pub user_id: Option<String>,
    pub details: serde_json::Value,
    pub severity: AlertSeverity,
    pub auto_blocked: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlockTargetType {
    Ip,
    UserId,
}

/// A persistent temporary block on an IP or user id. Keyed unique by target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityBlock {
    pub id: String,
    pub target: String,
    pub target_type: BlockTargetType,
    pub reason: String,
    pub blocked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub lifted_at: Option<DateTime<Utc>>,
    pub lifted_by: Option<String>,
}

impl SecurityBlock {
    /// Effective iff unexpired and not manually lifted.
    pub fn is_effective(&self, now: DateTime<Utc>) -> bool {
        self.lifted_at.is_none() && self.expires_at > now
    }
}

/// Sentinel `prev_hash` for the first entry in the audit chain.
pub const AUDIT_GENESIS: &str = "GENESIS";

/// Tamper-evident audit log entry. Append-only, never updated.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditChainEntry {
    pub id: String,
    pub action: String,
    pub entity_type: String,
    pub entity_id: String,
    pub row_hash: String,
    pub prev_hash: String,
    pub created_at: DateTime<Utc>,
}

// ─── Performance ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RiskBand {
    Low,
    Medium,
    High,
    Critical,
}

impl RiskBand {
    /// Band mapping: CRITICAL >= 70, HIGH >= 45, MEDIUM >= 20, else LOW.
    pub fn from_score(score: u8) -> Self {
        match score {
            70.. => Self::Critical,
            45..=69 => Self::High,
            20..=44 => Self::Medium,
            _ => Self::Low,
        }
    }
}

/// Per-endpoint latency observation, written per perf analysis cycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PerfObservation {
    pub id: String,
    pub endpoint: String,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub sample_count: usize,
    pub slow_query: Option<String>,
    pub index_suggestion: Option<String>,
    pub observed_at: DateTime<Utc>,
}

// ─── Backup validation ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BackupStatus {
    Pending,
    Passed,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupValidation {
    pub id: String,
    pub backup_file: String,
    pub size_kb: u64,
    pub checksum: String,
    pub restore_tested: bool,
    pub drift_clean: bool,
    pub incident_id: Option<String>,
    pub validated_at: DateTime<Utc>,
    pub status: BackupStatus,
}

// ─── Deployment gates ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateResult {
    pub name: String,
    pub passed: bool,
    pub detail: String,
    pub blocking: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentGateRun {
    pub id: String,
    pub passed: bool,
    pub gates: Vec<GateResult>,
    pub blockers: Vec<String>,
    pub triggered_by: Option<String>,
    pub created_at: DateTime<Utc>,
}

// ─── Executive report ────────────────────────────────────────────────────────

/// One executive report row per period date (YYYY-MM-DD).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutiveReportRow {
    pub period_date: String,
    pub report: serde_json::Value,
    pub dispatched: bool,
    pub dispatched_at: Option<DateTime<Utc>>,
}

// ─── Forensics ───────────────────────────────────────────────────────────────

/// Diagnostic summary captured at incident creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForensicSnapshot {
    pub negative_stock_rows: u64,
    pub payment_gap_sales: u64,
    pub active_db_connections: u32,
    pub heap_used_mb: f64,
    pub uptime_secs: u64,
}
