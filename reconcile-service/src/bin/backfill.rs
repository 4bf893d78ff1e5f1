use anyhow::{bail, Context, Result};
use reconcile_service::{app, config::AppConfig, merge::MergeWindow, observability};
use std::env;
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: backfill <start_rfc3339> <end_rfc3339>");
    }
    let start = OffsetDateTime::parse(&args[1], &Rfc3339).with_context(|| format!("bad start '{}'", args[1]))?;
    let end = OffsetDateTime::parse(&args[2], &Rfc3339).with_context(|| format!("bad end '{}'", args[2]))?;
    let window = MergeWindow::new(start, end)?;

    // Point RECONCILE_CONFIG at a backfill-specific file to read archived payloads.
    let cfg = AppConfig::load()?;

    let pipeline = app::build_pipeline(&cfg).await?;
    let report = pipeline.run(window).await?;

    tracing::info!(?report, "backfill finished");
    Ok(())
}
