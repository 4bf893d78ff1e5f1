use anyhow::{Context, Result};
use sqlx::{postgres::PgRow, PgPool, Postgres, QueryBuilder, Row};
use time::OffsetDateTime;

use crate::{
    db::ident::{quote_ident, quote_table},
    domain::{CanonicalRow, MetricMap, SourceTier},
};

/// Fetch canonical rows with `start <= ts < end`, ordered by entity then time.
///
/// `metrics` selects the metric columns to read; `entity_ids` optionally
/// restricts the result to a subset of entities.
pub async fn load_window(
    pool: &PgPool,
    table: &str,
    metrics: &[String],
    start: OffsetDateTime,
    end: OffsetDateTime,
    entity_ids: Option<&[String]>,
) -> Result<Vec<CanonicalRow>> {
    let table_sql = quote_table(table)?;
    let mut builder = QueryBuilder::<Postgres>::new("SELECT entity_id, ts, source_tier, fetched_at");
    for m in metrics {
        builder.push(", ");
        builder.push(quote_ident(m)?);
    }
    builder.push(" FROM ");
    builder.push(table_sql);
    builder.push(" WHERE ts >= ");
    builder.push_bind(start);
    builder.push(" AND ts < ");
    builder.push_bind(end);
    if let Some(ids) = entity_ids {
        builder.push(" AND entity_id = ANY(");
        builder.push_bind(ids.to_vec());
        builder.push(")");
    }
    builder.push(" ORDER BY entity_id, ts");

    let rows = builder
        .build()
        .fetch_all(pool)
        .await
        .with_context(|| format!("loading canonical window from {table}"))?;

    rows.iter().map(|row| decode_row(row, metrics)).collect()
}

fn decode_row(row: &PgRow, metrics: &[String]) -> Result<CanonicalRow> {
    let tier: String = row.try_get("source_tier")?;
    let mut values = MetricMap::new();
    for (i, m) in metrics.iter().enumerate() {
        let v: Option<f64> = row.try_get(4 + i)?;
        values.insert(m.clone(), v);
    }

    Ok(CanonicalRow {
        entity_id: row.try_get("entity_id")?,
        ts: row.try_get("ts")?,
        source_tier: tier.parse::<SourceTier>()?,
        fetched_at: row.try_get("fetched_at")?,
        metrics: values,
    })
}
