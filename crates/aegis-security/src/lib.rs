//! Security engine: in-process sliding rate limiter and brute-force
//! detector, SQL-backed pattern scanning, persistent blocks, and
//! tamper-evident audit chain verification.

#![forbid(unsafe_code)]

use aegis_incident::{IncidentManager, NewIncident};
use aegis_proto::{
    AlertSeverity, AuditChainEntry, BlockTargetType, Priority, SecurityEvent, SecurityEventKind,
    AUDIT_GENESIS,
};
use aegis_store::{BusinessData, OpsStore};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

// ─── Sliding-window rate limiter ─────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct RateLimiterConfig {
    pub window: ChronoDuration,
    pub limit: usize,
    pub block: ChronoDuration,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            window: ChronoDuration::seconds(60),
            limit: 100,
            block: ChronoDuration::minutes(5),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// `fresh` marks the request that tripped the block; later rejections
    /// inside the block window report `fresh: false`.
    Blocked { until: DateTime<Utc>, fresh: bool },
}

struct KeyWindow {
    hits: VecDeque<DateTime<Utc>>,
    blocked_until: Option<DateTime<Utc>>,
    last_seen: DateTime<Utc>,
}

/// Per-key sliding request window. Blocked keys stop accumulating hits.
pub struct SlidingRateLimiter {
    config: RateLimiterConfig,
    windows: Mutex<HashMap<String, KeyWindow>>,
}

impl SlidingRateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn check(&self, key: &str) -> RateDecision {
        self.check_at(key, Utc::now())
    }

    fn check_at(&self, key: &str, now: DateTime<Utc>) -> RateDecision {
        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_insert_with(|| KeyWindow {
            hits: VecDeque::new(),
            blocked_until: None,
            last_seen: now,
        });
        window.last_seen = now;

        if let Some(until) = window.blocked_until {
            if until > now {
                return RateDecision::Blocked { until, fresh: false };
            }
            window.blocked_until = None;
        }

        let cutoff = now - self.config.window;
        while window.hits.front().is_some_and(|t| *t < cutoff) {
            window.hits.pop_front();
        }
        window.hits.push_back(now);

        if window.hits.len() > self.config.limit {
            let until = now + self.config.block;
            window.blocked_until = Some(until);
            warn!(key, until = %until, "rate limit exceeded, key blocked");
            return RateDecision::Blocked { until, fresh: true };
        }
        RateDecision::Allowed
    }

    /// Drop idle windows older than twice the window length.
    pub fn cleanup(&self) -> usize {
        self.cleanup_at(Utc::now())
    }

    fn cleanup_at(&self, now: DateTime<Utc>) -> usize {
        let stale = now - self.config.window * 2;
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| {
            w.last_seen > stale || w.blocked_until.is_some_and(|until| until > now)
        });
        before - windows.len()
    }

    pub fn tracked_keys(&self) -> usize {
        self.windows.lock().len()
    }
}

// ─── Brute-force detector ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct BruteForceConfig {
    pub window: ChronoDuration,
    pub max_failures: usize,
    pub lockout: ChronoDuration,
}

impl Default for BruteForceConfig {
    fn default() -> Self {
        Self {
            window: ChronoDuration::minutes(15),
            max_failures: 10,
            lockout: ChronoDuration::minutes(30),
        }
    }
}

struct BruteEntry {
    failures: VecDeque<DateTime<Utc>>,
    locked_until: Option<DateTime<Utc>>,
}

/// Tracks authentication failures per key; locks on the Nth failure inside
/// the window. A success clears the entry.
pub struct BruteForceDetector {
    config: BruteForceConfig,
    entries: Mutex<HashMap<String, BruteEntry>>,
}

impl BruteForceDetector {
    pub fn new(config: BruteForceConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Record a failure. Returns true when the key is now locked.
    pub fn record_failure(&self, key: &str) -> bool {
        self.record_failure_at(key, Utc::now())
    }

    fn record_failure_at(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut entries = self.entries.lock();
        let entry = entries.entry(key.to_string()).or_insert_with(|| BruteEntry {
            failures: VecDeque::new(),
            locked_until: None,
        });

        if entry.locked_until.is_some_and(|until| until > now) {
            return true;
        }

        let cutoff = now - self.config.window;
        while entry.failures.front().is_some_and(|t| *t < cutoff) {
            entry.failures.pop_front();
        }
        entry.failures.push_back(now);

        if entry.failures.len() >= self.config.max_failures {
            entry.locked_until = Some(now + self.config.lockout);
            warn!(key, "brute-force lockout engaged");
            return true;
        }
        false
    }

    pub fn is_locked(&self, key: &str) -> bool {
        let now = Utc::now();
        self.entries
            .lock()
            .get(key)
            .is_some_and(|e| e.locked_until.is_some_and(|until| until > now))
    }

    pub fn record_success(&self, key: &str) {
        self.entries.lock().remove(key);
    }
}

// ─── Pattern scanner ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
pub struct ScannerConfig {
    /// Confirmed sales at or above this amount (minor units) flag as large.
    pub large_transaction_minor: i64,
    pub large_lookback: ChronoDuration,
    /// Confirmed sales by one user inside the rapid window before flagging.
    pub rapid_fire_sales: u32,
    pub rapid_fire_window: ChronoDuration,
    pub rapid_fire_block: ChronoDuration,
    /// Voided fraction of confirmed sales before a shop flags.
    pub void_fraction: f64,
    pub void_min_confirmed: u32,
    pub void_lookback: ChronoDuration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            large_transaction_minor: 1_000_000,
            large_lookback: ChronoDuration::hours(24),
            rapid_fire_sales: 20,
            rapid_fire_window: ChronoDuration::minutes(5),
            rapid_fire_block: ChronoDuration::minutes(60),
            void_fraction: 0.10,
            void_min_confirmed: 5,
            void_lookback: ChronoDuration::hours(1),
        }
    }
}

#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ScanSummary {
    pub events: usize,
    pub users_blocked: usize,
    pub incidents_opened: usize,
}

/// Periodic SQL-backed anomaly scan over the business tables.
pub struct PatternScanner {
    store: Arc<OpsStore>,
    incidents: Arc<IncidentManager>,
    config: ScannerConfig,
}

impl PatternScanner {
    pub fn new(store: Arc<OpsStore>, incidents: Arc<IncidentManager>, config: ScannerConfig) -> Self {
        Self {
            store,
            incidents,
            config,
        }
    }

    pub async fn run_scan(&self, data: &dyn BusinessData) -> ScanSummary {
        let mut summary = ScanSummary::default();
        let now = Utc::now();

        match data.large_transactions_since(
            self.config.large_transaction_minor,
            now - self.config.large_lookback,
        ) {
            Ok(rows) => {
                for row in rows {
                    self.store.append_security_event(SecurityEvent {
                        id: Uuid::new_v4().to_string(),
                        kind: SecurityEventKind::LargeTransaction,
                        ip: None,
                        user_id: Some(row.user_id.clone()),
                        details: serde_json::json!({
                            "sale_id": row.sale_id,
                            "shop_id": row.shop_id,
                            "total": row.total,
                        }),
                        severity: AlertSeverity::Medium,
                        auto_blocked: false,
                        created_at: now,
                    });
                    summary.events += 1;
                }
            }
            Err(e) => warn!(error = %e, "large transaction scan failed"),
        }

        match data.rapid_fire_sellers(self.config.rapid_fire_sales, self.config.rapid_fire_window) {
            Ok(rows) => {
                for row in rows {
                    self.store.upsert_block(
                        &row.user_id,
                        BlockTargetType::UserId,
                        "rapid-fire sales pattern",
                        self.config.rapid_fire_block,
                    );
                    self.store.append_security_event(SecurityEvent {
                        id: Uuid::new_v4().to_string(),
                        kind: SecurityEventKind::RapidFireSales,
                        ip: None,
                        user_id: Some(row.user_id.clone()),
                        details: serde_json::json!({
                            "sale_count": row.sale_count,
                            "window_start": row.window_start,
                        }),
                        severity: AlertSeverity::High,
                        auto_blocked: true,
                        created_at: now,
                    });
                    summary.events += 1;
                    summary.users_blocked += 1;
                    info!(user = %row.user_id, sales = row.sale_count, "rapid-fire user blocked");
                }
            }
            Err(e) => warn!(error = %e, "rapid-fire scan failed"),
        }

        match data.void_spike_shops(
            self.config.void_min_confirmed,
            self.config.void_fraction,
            now - self.config.void_lookback,
        ) {
            Ok(rows) => {
                for row in rows {
                    self.store.append_security_event(SecurityEvent {
                        id: Uuid::new_v4().to_string(),
                        kind: SecurityEventKind::VoidSpike,
                        ip: None,
                        user_id: None,
                        details: serde_json::json!({
                            "shop_id": row.shop_id,
                            "confirmed": row.confirmed,
                            "voided": row.voided,
                        }),
                        severity: AlertSeverity::High,
                        auto_blocked: false,
                        created_at: now,
                    });
                    summary.events += 1;
                    self.incidents
                        .create_incident(NewIncident {
                            priority: Priority::P2,
                            title: format!("Void spike in shop {}", row.shop_id),
                            invariant: None,
                            details: serde_json::json!({
                                "shop_id": row.shop_id,
                                "confirmed": row.confirmed,
                                "voided": row.voided,
                            }),
                        })
                        .await;
                    summary.incidents_opened += 1;
                }
            }
            Err(e) => warn!(error = %e, "void spike scan failed"),
        }

        summary
    }
}

// ─── Audit chain verification ────────────────────────────────────────────────

#[derive(Debug, Clone, serde::Serialize)]
pub struct ChainVerification {
    pub valid: bool,
    pub broken_at: Option<String>,
    pub checked: usize,
}

/// Continuity walk over a chain prefix ordered by `created_at`. Row hashes
/// were computed at insertion; only the links are checked here.
pub fn verify_chain_entries(entries: &[AuditChainEntry]) -> ChainVerification {
    let mut expected = AUDIT_GENESIS.to_string();
    for (i, entry) in entries.iter().enumerate() {
        if entry.prev_hash != expected {
            return ChainVerification {
                valid: false,
                broken_at: Some(entry.id.clone()),
                checked: i + 1,
            };
        }
        expected = entry.row_hash.clone();
    }
    ChainVerification {
        valid: true,
        broken_at: None,
        checked: entries.len(),
    }
}

/// Verify a bounded prefix of the persisted chain; a break opens a P1
/// incident carrying the broken id and both hashes.
pub async fn verify_audit_chain(
    store: &OpsStore,
    incidents: &IncidentManager,
    limit: usize,
) -> ChainVerification {
    let entries = store.audit_entries(limit);
    let verification = verify_chain_entries(&entries);
    if verification.valid {
        return verification;
    }

    let broken_id = verification.broken_at.clone().unwrap_or_default();
    let broken = entries.iter().find(|e| e.id == broken_id);
    let broken_index = entries.iter().position(|e| e.id == broken_id).unwrap_or(0);
    let expected = if broken_index == 0 {
        AUDIT_GENESIS.to_string()
    } else {
        entries[broken_index - 1].row_hash.clone()
    };
    let actual = broken.map(|e| e.prev_hash.clone()).unwrap_or_default();

    warn!(broken_at = %broken_id, "audit chain tamper detected");
    store.append_security_event(SecurityEvent {
        id: Uuid::new_v4().to_string(),
        kind: SecurityEventKind::AuditChainTamper,
        ip: None,
        user_id: None,
        details: serde_json::json!({"broken_at": broken_id}),
        severity: AlertSeverity::Critical,
        auto_blocked: false,
        created_at: Utc::now(),
    });
    incidents
        .create_incident(NewIncident {
            priority: Priority::P1,
            title: "AUDIT_LOG_TAMPER_DETECTED".to_string(),
            invariant: None,
            details: serde_json::json!({
                "broken_at": broken_id,
                "expected_prev_hash": expected,
                "actual_prev_hash": actual,
            }),
        })
        .await;

    verification
}

#[cfg(test)]
mod tests {
    use super::*;
    use aegis_alert::RecordingAlerter;
    use aegis_incident::NoForensics;
    use aegis_store::memory::MemoryBusinessData;
    use aegis_store::{RapidFireRow, VoidSpikeRow};

    // ─── Rate limiter ────────────────────────────────────────────────────────

    #[test]
    fn test_rate_limiter_allows_up_to_limit() {
        let limiter = SlidingRateLimiter::new(RateLimiterConfig {
            limit: 5,
            ..Default::default()
        });
        let now = Utc::now();
        for i in 0..5 {
            let at = now + ChronoDuration::milliseconds(i);
            assert_eq!(limiter.check_at("ip:1.2.3.4", at), RateDecision::Allowed);
        }
        // The 6th request inside the window trips the block.
        let decision = limiter.check_at("ip:1.2.3.4", now + ChronoDuration::milliseconds(10));
        assert!(matches!(decision, RateDecision::Blocked { fresh: true, .. }));
    }

    #[test]
    fn test_rate_limiter_blocked_requests_not_recorded() {
        let limiter = SlidingRateLimiter::new(RateLimiterConfig {
            limit: 2,
            ..Default::default()
        });
        let now = Utc::now();
        limiter.check_at("k", now);
        limiter.check_at("k", now);
        limiter.check_at("k", now); // blocks
        // While blocked, further requests are rejected without appending;
        // window length stays at limit + 1.
        for i in 0..10 {
            let decision = limiter.check_at("k", now + ChronoDuration::seconds(i));
            assert!(matches!(decision, RateDecision::Blocked { fresh: false, .. }));
        }
        let windows = limiter.windows.lock();
        assert_eq!(windows.get("k").expect("window").hits.len(), 3);
    }

    #[test]
    fn test_rate_limiter_window_slides() {
        let limiter = SlidingRateLimiter::new(RateLimiterConfig {
            limit: 2,
            window: ChronoDuration::seconds(60),
            ..Default::default()
        });
        let now = Utc::now();
        limiter.check_at("k", now);
        limiter.check_at("k", now + ChronoDuration::seconds(1));
        // 90s later the first two hits have slid out.
        let decision = limiter.check_at("k", now + ChronoDuration::seconds(90));
        assert_eq!(decision, RateDecision::Allowed);
    }

    #[test]
    fn test_rate_limiter_block_expires() {
        let limiter = SlidingRateLimiter::new(RateLimiterConfig {
            limit: 1,
            window: ChronoDuration::seconds(60),
            block: ChronoDuration::minutes(5),
        });
        let now = Utc::now();
        limiter.check_at("k", now);
        limiter.check_at("k", now); // blocks for 5 min
        let later = now + ChronoDuration::minutes(6);
        assert_eq!(limiter.check_at("k", later), RateDecision::Allowed);
    }

    #[test]
    fn test_rate_limiter_cleanup() {
        let limiter = SlidingRateLimiter::new(RateLimiterConfig::default());
        let now = Utc::now();
        limiter.check_at("stale", now - ChronoDuration::minutes(10));
        limiter.check_at("fresh", now);
        assert_eq!(limiter.tracked_keys(), 2);
        assert_eq!(limiter.cleanup_at(now), 1);
        assert_eq!(limiter.tracked_keys(), 1);
    }

    // ─── Brute force ─────────────────────────────────────────────────────────

    #[test]
    fn test_brute_force_locks_on_tenth_failure() {
        let detector = BruteForceDetector::new(BruteForceConfig::default());
        let now = Utc::now();
        for i in 0..9 {
            assert!(!detector.record_failure_at("user-1", now + ChronoDuration::seconds(i)));
        }
        assert!(detector.record_failure_at("user-1", now + ChronoDuration::seconds(9)));
        assert!(detector.is_locked("user-1"));
    }

    #[test]
    fn test_brute_force_success_clears() {
        let detector = BruteForceDetector::new(BruteForceConfig::default());
        for _ in 0..8 {
            detector.record_failure("user-2");
        }
        detector.record_success("user-2");
        assert!(!detector.record_failure("user-2"));
        assert!(!detector.is_locked("user-2"));
    }

    #[test]
    fn test_brute_force_old_failures_expire() {
        let detector = BruteForceDetector::new(BruteForceConfig::default());
        let now = Utc::now();
        for i in 0..9 {
            detector.record_failure_at("u", now - ChronoDuration::minutes(20) + ChronoDuration::seconds(i));
        }
        // Those nine failures are outside the 15-minute window.
        assert!(!detector.record_failure_at("u", now));
    }

    // ─── Pattern scanner ─────────────────────────────────────────────────────

    fn scanner() -> (
        tempfile::TempDir,
        Arc<OpsStore>,
        Arc<MemoryBusinessData>,
        PatternScanner,
    ) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(OpsStore::open(dir.path()));
        let incidents = Arc::new(IncidentManager::new(
            store.clone(),
            Arc::new(RecordingAlerter::new()),
            Arc::new(NoForensics),
        ));
        let scanner = PatternScanner::new(store.clone(), incidents, ScannerConfig::default());
        let data = Arc::new(MemoryBusinessData::new());
        (dir, store, data, scanner)
    }

    #[tokio::test]
    async fn test_scan_rapid_fire_blocks_user() {
        let (_dir, store, data, scanner) = scanner();
        data.set_rapid_fire(vec![RapidFireRow {
            user_id: "user-9".to_string(),
            sale_count: 25,
            window_start: Utc::now(),
        }]);

        let summary = scanner.run_scan(data.as_ref()).await;
        assert_eq!(summary.users_blocked, 1);
        assert!(store.is_blocked("user-9"));

        let events = store.security_events_since(Utc::now() - ChronoDuration::minutes(1));
        let event = events
            .iter()
            .find(|e| e.kind == SecurityEventKind::RapidFireSales)
            .expect("event");
        assert!(event.auto_blocked);
        assert_eq!(event.severity, AlertSeverity::High);
    }

    #[tokio::test]
    async fn test_scan_void_spike_opens_p2() {
        let (_dir, store, data, scanner) = scanner();
        data.set_void_spikes(vec![VoidSpikeRow {
            shop_id: "shop-3".to_string(),
            confirmed: 10,
            voided: 4,
        }]);

        let summary = scanner.run_scan(data.as_ref()).await;
        assert_eq!(summary.incidents_opened, 1);
        let open = store.open_incidents();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].priority, Priority::P2);
        assert!(open[0].title.contains("shop-3"));
    }

    #[tokio::test]
    async fn test_scan_clean_data_is_quiet() {
        let (_dir, store, data, scanner) = scanner();
        let summary = scanner.run_scan(data.as_ref()).await;
        assert_eq!(summary.events, 0);
        assert!(store.open_incidents().is_empty());
    }

    // ─── Audit chain verification ────────────────────────────────────────────

    fn incident_manager(store: Arc<OpsStore>) -> IncidentManager {
        IncidentManager::new(store, Arc::new(RecordingAlerter::new()), Arc::new(NoForensics))
    }

    #[tokio::test]
    async fn test_verify_intact_chain() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(OpsStore::open(dir.path()));
        let incidents = incident_manager(store.clone());
        for i in 0..5 {
            store.append_audit("sale.create", "sale", &format!("s-{i}"));
        }

        let verification = verify_audit_chain(&store, &incidents, 1000).await;
        assert!(verification.valid);
        assert_eq!(verification.checked, 5);
        assert!(store.open_incidents().is_empty());
    }

    #[tokio::test]
    async fn test_tampered_chain_opens_p1() {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = Arc::new(OpsStore::open(dir.path()));
        let incidents = incident_manager(store.clone());
        store.append_audit("sale.create", "sale", "s-a");
        store.append_audit("sale.confirm", "sale", "s-b");
        store.append_audit("sale.void", "sale", "s-c");

        // Rewrite B's prev_hash to a bogus value.
        let mut entries = store.audit_entries(1000);
        let broken_id = entries[1].id.clone();
        let expected = entries[0].row_hash.clone();
        entries[1].prev_hash = "deadbeef".to_string();
        store.import_audit_chain(entries);

        let verification = verify_audit_chain(&store, &incidents, 1000).await;
        assert!(!verification.valid);
        assert_eq!(verification.broken_at.as_deref(), Some(broken_id.as_str()));

        let open = store.open_incidents();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].priority, Priority::P1);
        assert_eq!(open[0].title, "AUDIT_LOG_TAMPER_DETECTED");
        assert_eq!(open[0].details["expected_prev_hash"], expected);
        assert_eq!(open[0].details["actual_prev_hash"], "deadbeef");
    }

    #[test]
    fn test_verify_empty_chain_is_valid() {
        let verification = verify_chain_entries(&[]);
        assert!(verification.valid);
        assert_eq!(verification.checked, 0);
    }
}
