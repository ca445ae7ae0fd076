//! Alert dispatch for the Aegis control plane.
//!
//! Every engine raises alerts through the [`AlertSink`] seam; the concrete
//! transport (ops webhook, PagerDuty) is chosen at bootstrap. Threshold
//! breaches from the metrics registry are forwarded by [`bind_threshold_alerts`].

#![forbid(unsafe_code)]

use aegis_metrics::{BreachSeverity, MetricsRegistry};
use aegis_proto::AlertSeverity;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

/// Webhook request timeout.
const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// Wire contract for the alert webhook.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub severity: AlertSeverity,
    pub title: String,
    pub body: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub actual_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub threshold: Option<f64>,
}

impl Alert {
    pub fn new(severity: AlertSeverity, title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            severity,
            title: title.into(),
            body: body.into(),
            metric: None,
            actual_value: None,
            threshold: None,
        }
    }
}

pub mod error {
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum AlertError {
        #[error("transport: {0}")]
        Transport(String),
    }

    pub type Result<T> = std::result::Result<T, AlertError>;
}

pub use error::{AlertError, Result};

// ─── Sink trait & transports ─────────────────────────────────────────────────

/// Where alerts go. Implementations must be safe to call concurrently.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &Alert) -> Result<()>;
}

/// POSTs the alert JSON to a configured webhook URL.
pub struct WebhookAlerter {
    client: reqwest::Client,
    url: String,
}

impl WebhookAlerter {
    pub fn new(url: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            url: url.into(),
        }
    }
}

#[async_trait]
impl AlertSink for WebhookAlerter {
    async fn send(&self, alert: &Alert) -> Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(alert)
            .send()
            .await
            .map_err(|e| AlertError::Transport(e.to_string()))?;
        if !response.status().is_success() {
            return Err(AlertError::Transport(format!(
                "webhook returned {}",
                response.status()
            )));
        }
        info!(severity = %alert.severity, title = %alert.title, "alert dispatched");
        Ok(())
    }
}

/// PagerDuty Events v2 transport; only CRITICAL alerts page.
pub struct PagerDutyAlerter {
    client: reqwest::Client,
    routing_key: String,
}

impl PagerDutyAlerter {
    pub fn new(routing_key: impl Into<String>) -> Self {
        let client = reqwest::Client::builder()
            .timeout(WEBHOOK_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            client,
            routing_key: routing_key.into(),
        }
    }
}

#[async_trait]
impl AlertSink for PagerDutyAlerter {
    async fn send(&self, alert: &Alert) -> Result<()> {
        if alert.severity < AlertSeverity::Critical {
            return Ok(());
        }
        let payload = serde_json::json!({
            "routing_key": self.routing_key,
            "event_action": "trigger",
            "payload": {
                "summary": alert.title,
                "severity": "critical",
                "source": "aegis",
                "custom_details": alert,
            },
        });
        self.client
            .post("https://events.pagerduty.com/v2/enqueue")
            .json(&payload)
            .send()
            .await
            .map_err(|e| AlertError::Transport(e.to_string()))?;
        Ok(())
    }
}

/// Fans one alert out to several sinks. A failing sink is logged and does
/// not stop the others.
pub struct MultiAlerter {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl MultiAlerter {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AlertSink for MultiAlerter {
    async fn send(&self, alert: &Alert) -> Result<()> {
        for sink in &self.sinks {
            if let Err(e) = sink.send(alert).await {
                warn!(error = %e, title = %alert.title, "alert sink failed");
            }
        }
        Ok(())
    }
}

/// Wraps a sink in a circuit breaker with transport-level retries, so a
/// dead webhook cannot stall the engines that raise alerts.
pub struct ResilientAlerter {
    inner: Arc<dyn AlertSink>,
    breaker: aegis_heal::CircuitBreaker,
    metrics: Arc<MetricsRegistry>,
}

impl ResilientAlerter {
    pub fn new(name: &str, inner: Arc<dyn AlertSink>, metrics: Arc<MetricsRegistry>) -> Self {
        let breaker = aegis_heal::CircuitBreaker::new(
            format!("alert.{name}"),
            aegis_heal::BreakerConfig::default(),
            metrics.clone(),
        );
        Self {
            inner,
            breaker,
            metrics,
        }
    }
}

#[async_trait]
impl AlertSink for ResilientAlerter {
    async fn send(&self, alert: &Alert) -> Result<()> {
        aegis_heal::with_network_retry(&self.breaker, &self.metrics, || self.inner.send(alert))
            .await
            .map_err(|e| match e {
                aegis_heal::BreakerError::Open(name) => {
                    AlertError::Transport(format!("circuit breaker '{name}' is open"))
                }
                aegis_heal::BreakerError::Inner(inner) => inner,
            })
    }
}

/// Drops alerts. Used when no webhook is configured.
pub struct NullAlerter;

#[async_trait]
impl AlertSink for NullAlerter {
    async fn send(&self, alert: &Alert) -> Result<()> {
        info!(severity = %alert.severity, title = %alert.title, "alert (no transport configured)");
        Ok(())
    }
}

/// Captures alerts in memory. Test support across the workspace.
#[derive(Default)]
pub struct RecordingAlerter {
    alerts: Mutex<Vec<Alert>>,
}

impl RecordingAlerter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn count(&self) -> usize {
        self.alerts.lock().len()
    }
}

#[async_trait]
impl AlertSink for RecordingAlerter {
    async fn send(&self, alert: &Alert) -> Result<()> {
        self.alerts.lock().push(alert.clone());
        Ok(())
    }
}

// ─── Threshold breach binding ────────────────────────────────────────────────

fn breach_severity(severity: BreachSeverity) -> AlertSeverity {
    match severity {
        BreachSeverity::Low => AlertSeverity::Low,
        BreachSeverity::Medium => AlertSeverity::Medium,
        BreachSeverity::High => AlertSeverity::High,
        BreachSeverity::Critical => AlertSeverity::Critical,
    }
}

/// Forward threshold breaches from the registry to the alert sink.
///
/// The observer runs on the writing thread, so the actual dispatch is
/// spawned onto the runtime.
pub fn bind_threshold_alerts(metrics: &MetricsRegistry, sink: Arc<dyn AlertSink>) {
    metrics.on_threshold_breach(move |breach| {
        let alert = Alert {
            severity: breach_severity(breach.threshold.severity),
            title: format!("Threshold breach: {}", breach.threshold.metric),
            body: format!(
                "{} {} {} (actual {})",
                breach.threshold.metric,
                serde_json::to_string(&breach.threshold.operator).unwrap_or_default(),
                breach.threshold.value,
                breach.actual
            ),
            metric: Some(breach.threshold.metric.clone()),
            actual_value: Some(breach.actual),
            threshold: Some(breach.threshold.value),
        };
        let sink = sink.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                if let Err(e) = sink.send(&alert).await {
                    error!(error = %e, "failed to dispatch threshold alert");
                }
            });
        } else {
            warn!(title = %alert.title, "threshold breach outside runtime, alert dropped");
        }
    });
}
