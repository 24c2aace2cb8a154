use anyhow::Context;

use curator_api::app::{build_app, services};
use curator_infra::config::Config;
use curator_infra::jobs::{AlarmExecutor, AlarmExecutorConfig, Orchestrator};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    curator_observability::init();

    let config = Config::from_env().context("invalid configuration")?;
    let collaborators = services::build_collaborators(&config).await?;

    // Recovery runs inside boot, before any request is accepted.
    let orchestrator = Orchestrator::boot(collaborators, config.orchestrator.clone())
        .await
        .context("orchestrator recovery failed")?;

    let executor = AlarmExecutor::new(orchestrator.clone())
        .spawn(AlarmExecutorConfig::default().with_name(format!("alarm-{}", config.scope)));

    let app = build_app(orchestrator.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    executor.shutdown().await;
    orchestrator.wait_for_deliveries().await;
    tracing::info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
