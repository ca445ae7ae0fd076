//! aegisd: the Aegis control-plane daemon.
//!
//! Runs the autonomous operations platform: invariant surveillance, health
//! scoring, incident lifecycle, security scanning, performance analysis,
//! deployment gates, and the control HTTP surface.

use aegis_alert::Alert;
use aegis_deploy::{CommandCoverage, CoverageSource, FixedCoverage, GateContext, run_deployment_gates};
use aegis_proto::AlertSeverity;
use aegisd::{AegisConfig, AppState, http, jobs};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

#[derive(Parser)]
#[command(name = "aegisd")]
#[command(about = "Aegis autonomous operations control plane")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the control plane (scheduler + HTTP surface)
    Run {
        /// State directory for control-plane persistence
        #[arg(long)]
        state: Option<PathBuf>,

        /// Bind address for the HTTP surface
        #[arg(long)]
        bind: Option<SocketAddr>,
    },

    /// Evaluate the deployment gates and exit non-zero when blocked
    Gates {
        /// State directory for control-plane persistence
        #[arg(long)]
        state: Option<PathBuf>,

        /// Skip the test-coverage gate
        #[arg(long)]
        skip_coverage: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env().add_directive("aegisd=info".parse()?))
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Run { state, bind } => run_daemon(state, bind).await,
        Commands::Gates {
            state,
            skip_coverage,
        } => run_gates(state, skip_coverage).await,
    }
}

fn load_config(state_override: Option<PathBuf>) -> AegisConfig {
    let mut config = AegisConfig::from_env();
    if let Some(state) = state_override {
        config.state_path = state;
    }
    config
}

fn gate_context(state: &Arc<AppState>, skip_coverage: bool) -> GateContext {
    let coverage: Arc<dyn CoverageSource> = match &state.config.coverage_cmd {
        Some(cmd) => Arc::new(CommandCoverage::new(cmd)),
        None => Arc::new(FixedCoverage(0.0)),
    };
    GateContext {
        store: state.store.clone(),
        metrics: state.metrics.clone(),
        stats: state.stats.clone(),
        coverage,
        // Without a coverage command the gate can only be skipped.
        skip_coverage: skip_coverage
            || state.config.skip_coverage_gate
            || state.config.coverage_cmd.is_none(),
        alerts: state.alerts.clone(),
    }
}

/// Longest the hook waits for the panic alert to land. Exceeds the webhook
/// request timeout so a healthy transport always finishes first.
const PANIC_ALERT_WAIT: Duration = Duration::from_secs(12);

fn install_panic_hook(state: &Arc<AppState>) {
    let alerts = state.alerts.clone();
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        error!(panic = %info, "panic caught by process hook");
        let alert = Alert::new(AlertSeverity::Critical, "Process panic", info.to_string());

        // The hook must not return until the CRITICAL alert has been
        // dispatched: once unwinding resumes the runtime may be torn down
        // before a detached task ever runs.
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let alerts = alerts.clone();
                let (tx, rx) = std::sync::mpsc::channel();
                handle.spawn(async move {
                    if let Err(e) = alerts.send(&alert).await {
                        error!(error = %e, "failed to send panic alert");
                    }
                    let _ = tx.send(());
                });
                if rx.recv_timeout(PANIC_ALERT_WAIT).is_err() {
                    error!("panic alert did not complete within the wait bound");
                }
            }
            Err(_) => {
                // Panic outside the runtime: drive the send on a throwaway
                // single-threaded runtime.
                let alerts = alerts.clone();
                match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(rt) => {
                        if let Err(e) = rt.block_on(alerts.send(&alert)) {
                            error!(error = %e, "failed to send panic alert");
                        }
                    }
                    Err(e) => error!(error = %e, "no runtime available for panic alert"),
                }
            }
        }
    }));
}

async fn run_daemon(state_path: Option<PathBuf>, bind: Option<SocketAddr>) -> anyhow::Result<()> {
    let mut config = load_config(state_path);
    if let Some(bind) = bind {
        config.bind_addr = bind;
    }
    info!(state = %config.state_path.display(), bind = %config.bind_addr, stage = %config.runtime_stage, "starting aegisd");

    let state = AppState::bootstrap(config);
    install_panic_hook(&state);

    // Production deploys must clear the gates before serving traffic.
    if state.config.is_production() {
        let ctx = gate_context(&state, false);
        run_deployment_gates(&ctx, Some("boot")).await?;
    }

    jobs::register_jobs(&state);
    state.scheduler.start();

    let app = http::router(state.clone());
    let listener = tokio::net::TcpListener::bind(state.config.bind_addr).await?;
    info!(addr = %state.config.bind_addr, "control surface listening");

    let shutdown_state = state.clone();
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received, draining jobs");
        shutdown_state.scheduler.shutdown(Duration::from_secs(10)).await;
    })
    .await?;

    info!("aegisd stopped");
    Ok(())
}

async fn run_gates(state_path: Option<PathBuf>, skip_coverage: bool) -> anyhow::Result<()> {
    let config = load_config(state_path);
    let state = AppState::bootstrap(config);
    let ctx = gate_context(&state, skip_coverage);

    let run = run_deployment_gates(&ctx, Some("cli")).await?;
    for gate in &run.gates {
        println!(
            "{} {:30} {}",
            if gate.passed { "PASS" } else { "FAIL" },
            gate.name,
            gate.detail
        );
    }
    println!("deployment gates passed");
    Ok(())
}
