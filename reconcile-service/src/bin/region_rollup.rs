use anyhow::{bail, Context, Result};
use reconcile_service::{app, config::AppConfig, merge::MergeWindow, observability, rollup};
use std::{env, fs::File, io};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

/// Regional rollup of a canonical window, written as CSV to a file or stdout.
#[tokio::main]
async fn main() -> Result<()> {
    observability::init_tracing();

    let args: Vec<String> = env::args().collect();
    if args.len() < 3 {
        bail!("usage: region_rollup <start_rfc3339> <end_rfc3339> [out.csv]");
    }
    let start = OffsetDateTime::parse(&args[1], &Rfc3339).with_context(|| format!("bad start '{}'", args[1]))?;
    let end = OffsetDateTime::parse(&args[2], &Rfc3339).with_context(|| format!("bad end '{}'", args[2]))?;
    let window = MergeWindow::new(start, end)?;

    let cfg = AppConfig::load()?;
    if cfg.rollup.aggregations.is_empty() {
        bail!("no [rollup.aggregations] configured");
    }
    let pool = app::connect(&cfg).await?;
    let store = app::build_store(&cfg, pool.as_ref()).await?;
    let entities = app::load_entities(&cfg, pool.as_ref()).await?;

    let outcome = rollup::rollup_window(&store, &window, &entities, &cfg.rollup.aggregations).await?;

    match args.get(3) {
        Some(path) => {
            let file = File::create(path).with_context(|| format!("creating {path}"))?;
            rollup::write_csv(file, &outcome.rollups, &cfg.rollup.aggregations)?;
        }
        None => rollup::write_csv(io::stdout().lock(), &outcome.rollups, &cfg.rollup.aggregations)?,
    }
    Ok(())
}
