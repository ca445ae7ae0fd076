//! Cron scheduler for the Aegis control plane.
//!
//! Registers periodic jobs, staggers first invocations across a random
//! startup window, tracks per-job counters, and exports `cron.<name>.*`
//! metrics. Jobs run concurrently; a panicking job is caught at the
//! boundary and converted into an incident without tearing anything down.

#![forbid(unsafe_code)]

use aegis_incident::{IncidentManager, NewIncident};
use aegis_metrics::MetricsRegistry;
use aegis_proto::Priority;
use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Maximum random delay before a `run_on_start` job's first invocation.
pub const DEFAULT_STAGGER: Duration = Duration::from_secs(10);

pub type JobFuture = BoxFuture<'static, anyhow::Result<()>>;
pub type JobFn = Arc<dyn Fn() -> JobFuture + Send + Sync>;

pub struct JobSpec {
    pub name: String,
    pub interval: Duration,
    pub run_on_start: bool,
    pub task: JobFn,
}

impl JobSpec {
    pub fn new(
        name: impl Into<String>,
        interval: Duration,
        run_on_start: bool,
        task: JobFn,
    ) -> Self {
        Self {
            name: name.into(),
            interval,
            run_on_start,
            task,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct JobStatus {
    pub name: String,
    pub last_run: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub run_count: u64,
}

pub struct CronScheduler {
    jobs: Mutex<Vec<JobSpec>>,
    states: Arc<RwLock<HashMap<String, JobStatus>>>,
    metrics: Arc<MetricsRegistry>,
    incidents: Option<Arc<IncidentManager>>,
    stagger_max: Duration,
    shutdown_tx: watch::Sender<bool>,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl CronScheduler {
    pub fn new(metrics: Arc<MetricsRegistry>, incidents: Option<Arc<IncidentManager>>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        Self {
            jobs: Mutex::new(Vec::new()),
            states: Arc::new(RwLock::new(HashMap::new())),
            metrics,
            incidents,
            stagger_max: DEFAULT_STAGGER,
            shutdown_tx,
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Override the startup stagger window (tests use a tiny one).
    pub fn with_stagger(mut self, stagger_max: Duration) -> Self {
        self.stagger_max = stagger_max;
        self
    }

    pub fn register(&self, spec: JobSpec) {
        self.states.write().insert(
            spec.name.clone(),
            JobStatus {
                name: spec.name.clone(),
                ..Default::default()
            },
        );
        self.jobs.lock().push(spec);
    }

    /// Spawn one task per registered job. Never serializes jobs against one
    /// another.
    pub fn start(&self) {
        let jobs: Vec<JobSpec> = self.jobs.lock().drain(..).collect();
        info!(jobs = jobs.len(), "cron scheduler starting");
        let mut handles = self.handles.lock();
        for spec in jobs {
            let states = self.states.clone();
            let metrics = self.metrics.clone();
            let incidents = self.incidents.clone();
            let mut shutdown = self.shutdown_tx.subscribe();
            let stagger_max = self.stagger_max;

            handles.push(tokio::spawn(async move {
                if spec.run_on_start {
                    let stagger = if stagger_max.is_zero() {
                        Duration::ZERO
                    } else {
                        Duration::from_millis(
                            rand::thread_rng().gen_range(0..stagger_max.as_millis() as u64),
                        )
                    };
                    tokio::select! {
                        _ = tokio::time::sleep(stagger) => {}
                        _ = shutdown.changed() => return,
                    }
                    run_job(&spec, &states, &metrics, incidents.as_deref()).await;
                }

                let mut ticker = tokio::time::interval(spec.interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                ticker.tick().await; // first tick fires immediately
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            run_job(&spec, &states, &metrics, incidents.as_deref()).await;
                        }
                        _ = shutdown.changed() => {
                            info!(job = %spec.name, "cron job stopped");
                            return;
                        }
                    }
                }
            }));
        }
    }

    pub fn status(&self) -> Vec<JobStatus> {
        let mut all: Vec<JobStatus> = self.states.read().values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Signal all jobs, then wait up to `grace` for them to drain.
    pub async fn shutdown(&self, grace: Duration) {
        let _ = self.shutdown_tx.send(true);
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        let drain = async {
            for handle in handles {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(grace, drain).await.is_err() {
            warn!("cron jobs did not drain within grace period");
        }
    }
}

async fn run_job(
    spec: &JobSpec,
    states: &RwLock<HashMap<String, JobStatus>>,
    metrics: &MetricsRegistry,
    incidents: Option<&IncidentManager>,
) {
    let task = spec.task.clone();
    // An inner spawn catches panics at the job boundary.
    let outcome = tokio::spawn(task()).await;

    let now = Utc::now();
    metrics.set_gauge(
        &format!("cron.{}.last_run_ms", spec.name),
        now.timestamp_millis() as f64,
    );

    match outcome {
        Ok(Ok(())) => {
            metrics.increment(&format!("cron.{}.success_total", spec.name));
            let mut states = states.write();
            if let Some(state) = states.get_mut(&spec.name) {
                state.last_run = Some(now);
                state.run_count += 1;
                state.last_error = None;
            }
        }
        Ok(Err(e)) => {
            metrics.increment(&format!("cron.{}.error_total", spec.name));
            error!(job = %spec.name, error = %e, "cron job failed");
            let mut states = states.write();
            if let Some(state) = states.get_mut(&spec.name) {
                state.last_run = Some(now);
                state.run_count += 1;
                state.last_error = Some(e.to_string());
            }
        }
        Err(join_err) => {
            metrics.increment(&format!("cron.{}.error_total", spec.name));
            let detail = if join_err.is_panic() {
                "panicked".to_string()
            } else {
                join_err.to_string()
            };
            error!(job = %spec.name, detail = %detail, "cron job aborted");
            {
                let mut states = states.write();
                if let Some(state) = states.get_mut(&spec.name) {
                    state.last_run = Some(now);
                    state.run_count += 1;
                    state.last_error = Some(detail.clone());
                }
            }
            if let Some(incidents) = incidents {
                incidents
                    .create_incident(NewIncident {
                        priority: Priority::P2,
                        title: format!("Scheduled job '{}' {detail}", spec.name),
                        invariant: None,
                        details: serde_json::json!({"job": spec.name, "detail": detail}),
                    })
                    .await;
            }
        }
    }
}
