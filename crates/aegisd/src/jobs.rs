//! Registration of the periodic control-plane jobs.

use crate::state::AppState;
use aegis_cron::{JobFn, JobSpec};
use aegis_security::verify_audit_chain;
use std::sync::Arc;

/// Audit entries verified per security cycle.
const AUDIT_VERIFY_LIMIT: usize = 1000;

fn job(state: &Arc<AppState>, f: impl Fn(Arc<AppState>) -> aegis_cron::JobFuture + Send + Sync + 'static) -> JobFn {
    let state = state.clone();
    Arc::new(move || f(state.clone()))
}

/// Register every periodic job at its configured cadence.
pub fn register_jobs(state: &Arc<AppState>) {
    let scheduler = &state.scheduler;
    let config = &state.config;

    scheduler.register(JobSpec::new(
        "invariant-cycle",
        config.invariant_interval,
        true,
        job(state, |s| {
            Box::pin(async move {
                s.invariants.run_cycle(s.business.as_ref()).await;
                Ok(())
            })
        }),
    ));

    scheduler.register(JobSpec::new(
        "perf-analysis",
        config.perf_interval,
        true,
        job(state, |s| {
            Box::pin(async move {
                s.perf.run_analysis().await;
                Ok(())
            })
        }),
    ));

    scheduler.register(JobSpec::new(
        "memory-sample",
        config.memory_sample_interval,
        true,
        job(state, |s| {
            Box::pin(async move {
                s.perf.sample_memory();
                Ok(())
            })
        }),
    ));

    scheduler.register(JobSpec::new(
        "security-scan",
        config.security_interval,
        true,
        job(state, |s| {
            Box::pin(async move {
                s.scanner.run_scan(s.business.as_ref()).await;
                verify_audit_chain(&s.store, &s.incidents, AUDIT_VERIFY_LIMIT).await;
                Ok(())
            })
        }),
    ));

    scheduler.register(JobSpec::new(
        "health-score",
        config.health_interval,
        true,
        job(state, |s| {
            Box::pin(async move {
                s.health.compute().await;
                Ok(())
            })
        }),
    ));

    scheduler.register(JobSpec::new(
        "backup-validation",
        config.backup_interval,
        true,
        job(state, |s| {
            Box::pin(async move {
                s.backup_validator.run_validation().await;
                Ok(())
            })
        }),
    ));

    scheduler.register(JobSpec::new(
        "executive-report",
        config.exec_report_interval,
        false,
        job(state, |s| {
            Box::pin(async move {
                s.reporter.run().await;
                Ok(())
            })
        }),
    ));

    scheduler.register(JobSpec::new(
        "idempotency-cleanup",
        config.idempotency_clean_interval,
        true,
        job(state, |s| {
            Box::pin(async move {
                s.idempotency.purge_expired();
                Ok(())
            })
        }),
    ));

    scheduler.register(JobSpec::new(
        "rate-limiter-cleanup",
        config.rate_limiter_clean_interval,
        false,
        job(state, |s| {
            Box::pin(async move {
                s.limiter.cleanup();
                Ok(())
            })
        }),
    ));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AegisConfig;

    #[tokio::test]
    async fn test_all_jobs_registered() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = AegisConfig {
            state_path: dir.path().to_path_buf(),
            ..Default::default()
        };
        let state = AppState::bootstrap(config);
        register_jobs(&state);

        let names: Vec<String> = state
            .scheduler
            .status()
            .into_iter()
            .map(|j| j.name)
            .collect();
        for expected in [
            "invariant-cycle",
            "perf-analysis",
            "memory-sample",
            "security-scan",
            "health-score",
            "backup-validation",
            "executive-report",
            "idempotency-cleanup",
            "rate-limiter-cleanup",
        ] {
            assert!(names.contains(&expected.to_string()), "missing {expected}");
        }
    }
}
