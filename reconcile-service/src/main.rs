use anyhow::Result;
use reconcile_service::{app, config::AppConfig, merge::MergeWindow, metrics_server, observability};
use time::OffsetDateTime;

/// Scheduled refresh: reconcile the trailing window that ends at the
/// settle-lag cutoff and merge it into the canonical store.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let cfg = AppConfig::load()?;

    if let Some(metrics_cfg) = &cfg.metrics {
        metrics_server::init(&metrics_cfg.bind_addr)?;
    }

    let window = MergeWindow::trailing(
        OffsetDateTime::now_utc(),
        cfg.refresh.lookback(),
        cfg.refresh.settle_lag(),
    )?;
    tracing::info!(start = %window.start, end = %window.end, "refreshing trailing window");

    let pipeline = app::build_pipeline(&cfg).await?;
    let report = pipeline.run(window).await?;

    tracing::info!(?report, "refresh finished");
    Ok(())
}
