mod api;
mod assessment;
mod config;
mod error;
mod grading;
mod kernel;
mod metrics;
mod middleware;
mod store;

use std::sync::Arc;

use anyhow::Context;
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

use crate::{
    api::{AppState, routes},
    assessment::Assessment,
    config::{AppConfig, LogFormat},
    grading::Grader,
    kernel::{ProcessKernelLauncher, SessionRegistry, registry::spawn_idle_reaper},
    metrics::MetricsRegistry,
    store::SubmissionStore,
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("failed to build config")?;
    init_tracing(&config);

    let assessment = Assessment::load(config.assessment_path.as_deref())
        .await
        .context("failed to load assessment")?;
    tracing::info!(
        title = %assessment.title,
        questions = assessment.questions.len(),
        "assessment loaded"
    );

    let metrics = Arc::new(MetricsRegistry::new());
    let launcher = Arc::new(ProcessKernelLauncher::new(config.kernel.python.clone()));
    let registry = Arc::new(SessionRegistry::new(
        launcher,
        config.kernel.startup_timeout,
        config.kernel.max_concurrent_starts,
    ));

    let reaper = config.sessions.idle_timeout.map(|idle_timeout| {
        spawn_idle_reaper(
            registry.clone(),
            metrics.clone(),
            idle_timeout,
            config.sessions.reaper_interval,
        )
    });

    let state = AppState {
        assessment: Arc::new(assessment),
        registry: registry.clone(),
        grader: Arc::new(Grader::new(config.grading.clone(), metrics.clone())),
        store: SubmissionStore::new(config.submissions_dir.clone()),
        metrics,
        max_code_bytes: config.max_code_bytes,
    };
    let app = routes(state, &config.cors_origins);

    let listener = TcpListener::bind(config.bind_addr)
        .await
        .context("failed to bind listener")?;
    tracing::info!(addr = %config.bind_addr, "notebook grader listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(reaper) = reaper {
        reaper.abort();
    }
    if !registry.is_empty() {
        tracing::info!(sessions = registry.len(), "shutting down kernels");
        registry.shutdown_all().await;
    }
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder
            .json()
            .with_current_span(false)
            .with_span_list(false)
            .init(),
        LogFormat::Compact => builder.with_target(false).compact().init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c"),
        _ = terminate => tracing::info!("received SIGTERM"),
    }
}
