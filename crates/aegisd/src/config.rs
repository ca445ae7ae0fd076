//! Environment-driven configuration for the Aegis daemon.
//!
//! Every knob has a default; deployments override via environment
//! variables. Cadences are read once at boot.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct AegisConfig {
    pub state_path: PathBuf,
    pub bind_addr: SocketAddr,
    /// Deployment gates run at boot only for this stage.
    pub runtime_stage: String,

    // Job cadences.
    pub invariant_interval: Duration,
    pub perf_interval: Duration,
    pub security_interval: Duration,
    pub health_interval: Duration,
    pub backup_interval: Duration,
    pub exec_report_interval: Duration,
    pub idempotency_clean_interval: Duration,
    pub rate_limiter_clean_interval: Duration,
    pub memory_sample_interval: Duration,

    // Transports.
    pub alert_webhook_url: Option<String>,
    pub executive_webhook_url: Option<String>,
    pub slack_webhook_url: Option<String>,
    pub pagerduty_routing_key: Option<String>,

    // Backups.
    pub backup_dir: Option<PathBuf>,
    pub shadow_db_url: Option<String>,
    pub restore_test_cmd: Option<String>,
    pub gpg_key_id: Option<String>,

    // Deployment gates.
    pub coverage_cmd: Option<String>,
    pub skip_coverage_gate: bool,
}

fn env_ms(key: &str, default_ms: u64) -> Duration {
    let ms = std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .unwrap_or(default_ms);
    Duration::from_millis(ms)
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

impl Default for AegisConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("./aegis-state"),
            bind_addr: "0.0.0.0:8790".parse().expect("valid default bind"),
            runtime_stage: "development".to_string(),
            invariant_interval: Duration::from_millis(300_000),
            perf_interval: Duration::from_millis(600_000),
            security_interval: Duration::from_millis(900_000),
            health_interval: Duration::from_millis(300_000),
            backup_interval: Duration::from_millis(86_400_000),
            exec_report_interval: Duration::from_millis(86_400_000),
            idempotency_clean_interval: Duration::from_millis(3_600_000),
            rate_limiter_clean_interval: Duration::from_millis(900_000),
            memory_sample_interval: Duration::from_millis(60_000),
            alert_webhook_url: None,
            executive_webhook_url: None,
            slack_webhook_url: None,
            pagerduty_routing_key: None,
            backup_dir: None,
            shadow_db_url: None,
            restore_test_cmd: None,
            gpg_key_id: None,
            coverage_cmd: None,
            skip_coverage_gate: false,
        }
    }
}

impl AegisConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            state_path: env_opt("AEGIS_STATE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.state_path),
            bind_addr: env_opt("AEGIS_BIND")
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.bind_addr),
            runtime_stage: env_opt("AEGIS_ENV").unwrap_or(defaults.runtime_stage),
            invariant_interval: env_ms("INVARIANT_INTERVAL_MS", 300_000),
            perf_interval: env_ms("PERF_INTERVAL_MS", 600_000),
            security_interval: env_ms("SECURITY_INTERVAL_MS", 900_000),
            health_interval: env_ms("HEALTH_INTERVAL_MS", 300_000),
            backup_interval: env_ms("BACKUP_INTERVAL_MS", 86_400_000),
            exec_report_interval: env_ms("EXEC_REPORT_INTERVAL_MS", 86_400_000),
            idempotency_clean_interval: env_ms("IDEMPOTENCY_CLEAN_MS", 3_600_000),
            rate_limiter_clean_interval: env_ms("RATE_LIMIT_CLEAN_MS", 900_000),
            memory_sample_interval: env_ms("MEMORY_SAMPLE_MS", 60_000),
            alert_webhook_url: env_opt("ALERT_WEBHOOK_URL"),
            executive_webhook_url: env_opt("EXECUTIVE_WEBHOOK_URL"),
            slack_webhook_url: env_opt("SLACK_WEBHOOK_URL"),
            pagerduty_routing_key: env_opt("PAGERDUTY_ROUTING_KEY"),
            backup_dir: env_opt("BACKUP_DIR").map(PathBuf::from),
            shadow_db_url: env_opt("SHADOW_DB_URL"),
            restore_test_cmd: env_opt("RESTORE_TEST_CMD"),
            gpg_key_id: env_opt("GPG_KEY_ID"),
            coverage_cmd: env_opt("COVERAGE_CMD"),
            skip_coverage_gate: env_opt("SKIP_COVERAGE_GATE")
                .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true")),
        }
    }

    pub fn is_production(&self) -> bool {
        self.runtime_stage == "production"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AegisConfig::default();
        assert_eq!(config.invariant_interval, Duration::from_secs(300));
        assert_eq!(config.health_interval, Duration::from_secs(300));
        assert_eq!(config.perf_interval, Duration::from_secs(600));
        assert_eq!(config.security_interval, Duration::from_secs(900));
        assert_eq!(config.backup_interval, Duration::from_secs(86_400));
        assert_eq!(config.idempotency_clean_interval, Duration::from_secs(3_600));
        assert!(!config.is_production());
        assert!(config.alert_webhook_url.is_none());
    }
}
