use anyhow::Context;

use backfill_infra::config::BackfillSettings;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    backfill_observability::init();

    let settings = BackfillSettings::from_env().context("invalid configuration")?;
    let orchestrator = backfill_api::app::services::build_orchestrator(&settings).await?;

    let report = orchestrator
        .start()
        .await
        .context("startup recovery failed")?;
    tracing::info!(
        examined = report.examined,
        failed = report.failed.len(),
        "startup recovery complete"
    );
    let _retention = orchestrator.spawn_retention();

    let app = backfill_api::app::build_app(orchestrator.clone());
    let listener = tokio::net::TcpListener::bind(settings.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", settings.bind_addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown requested");
        })
        .await?;
    Ok(())
}
