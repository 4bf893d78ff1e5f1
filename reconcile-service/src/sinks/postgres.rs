use std::collections::HashSet;

use series_client::{
    db::{ident::quote_table, load_window, quote_ident},
    CanonicalRow, SourceTier,
};
use sqlx::{postgres::PgPool, Postgres, QueryBuilder, Row};

use crate::{
    config::ConfigError,
    merge::{MergeBatch, MergeError, MergeReport, MergeWindow},
    pipeline::CanonicalStore,
    reconcile::TierPriority,
};

use super::{maybe_failpoint, FAILPOINT_AFTER_STAGE, FAILPOINT_BEFORE_COMMIT};

const STAGE_TABLE: &str = "canonical_merge_stage";
const MAX_BIND_PARAMS: usize = 65_535;

/// Canonical store backed by a PostgreSQL table keyed by `(entity_id, ts)`.
///
/// Each merge runs in one transaction: per-entity advisory locks, a staging
/// temp table filled in chunks, one `INSERT .. ON CONFLICT DO UPDATE`, commit.
/// Any error drops the transaction, which rolls it back.
pub struct PgCanonicalStore {
    pool: PgPool,
    table: String,
    table_sql: String,
    columns: Vec<String>,
    columns_sql: Vec<String>,
    chunk_size: usize,
    failpoints: HashSet<String>,
}

impl PgCanonicalStore {
    pub fn new(pool: PgPool, table: &str, columns: Vec<String>, batch_size: usize) -> Result<Self, ConfigError> {
        let invalid = |e: series_client::DomainError| ConfigError::Invalid(e.to_string());
        let table_sql = quote_table(table).map_err(invalid)?;
        let columns_sql = columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Result<Vec<_>, _>>()
            .map_err(invalid)?;
        let max_rows = MAX_BIND_PARAMS / (4 + columns.len());

        Ok(Self {
            pool,
            table: table.to_string(),
            table_sql,
            columns,
            columns_sql,
            chunk_size: batch_size.clamp(1, max_rows.max(1)),
            failpoints: HashSet::new(),
        })
    }

    pub fn with_failpoints(mut self, failpoints: &[String]) -> Self {
        self.failpoints = failpoints.iter().cloned().collect();
        self
    }

    /// Create the canonical table if missing and add any new metric columns.
    pub async fn ensure_table(&self) -> Result<(), MergeError> {
        sqlx::query(&create_table_sql(&self.table_sql, &self.columns_sql))
            .execute(&self.pool)
            .await
            .map_err(map_sqlx)?;
        for col in &self.columns_sql {
            let sql = format!(
                "ALTER TABLE {} ADD COLUMN IF NOT EXISTS {col} DOUBLE PRECISION",
                self.table_sql
            );
            sqlx::query(&sql).execute(&self.pool).await.map_err(map_sqlx)?;
        }
        Ok(())
    }

    async fn stage_chunk(
        &self,
        tx: &mut sqlx::Transaction<'_, Postgres>,
        chunk: &[CanonicalRow],
    ) -> Result<(), sqlx::Error> {
        let mut builder = QueryBuilder::<Postgres>::new(format!(
            "INSERT INTO {STAGE_TABLE} (entity_id, ts, source_tier, fetched_at{}) ",
            column_list("", &self.columns_sql)
        ));
        builder.push_values(chunk, |mut b, row| {
            b.push_bind(row.entity_id.as_str())
                .push_bind(row.ts)
                .push_bind(row.source_tier.as_str())
                .push_bind(row.fetched_at);
            for c in &self.columns {
                b.push_bind(row.metric(c));
            }
        });
        builder.build().execute(&mut **tx).await.map(|_| ())
    }

    async fn merge_in_tx(&self, batch: &MergeBatch) -> Result<MergeReport, MergeError> {
        let mut tx = self.pool.begin().await.map_err(map_sqlx)?;

        // Overlapping windows serialize per entity; sorted order avoids deadlocks.
        for id in batch.entity_ids() {
            sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
                .bind(format!("{}/{id}", self.table))
                .execute(&mut *tx)
                .await
                .map_err(map_sqlx)?;
        }

        let create_stage = format!(
            "CREATE TEMP TABLE {STAGE_TABLE} (LIKE {} INCLUDING DEFAULTS) ON COMMIT DROP",
            self.table_sql
        );
        sqlx::query(&create_stage).execute(&mut *tx).await.map_err(map_sqlx)?;

        for chunk in batch.rows().chunks(self.chunk_size) {
            self.stage_chunk(&mut tx, chunk).await.map_err(map_sqlx)?;
        }
        maybe_failpoint(&self.failpoints, FAILPOINT_AFTER_STAGE)?;

        let skipped: i64 = sqlx::query_scalar(&skipped_sql(&self.table_sql, batch.priority()))
            .fetch_one(&mut *tx)
            .await
            .map_err(map_sqlx)?;

        let returned = sqlx::query(&upsert_sql(&self.table_sql, &self.columns_sql, batch.priority()))
            .fetch_all(&mut *tx)
            .await
            .map_err(map_sqlx)?;
        let mut inserted = 0usize;
        for row in &returned {
            if row.try_get::<bool, _>("inserted").map_err(map_sqlx)? {
                inserted += 1;
            }
        }
        let updated = returned.len() - inserted;

        maybe_failpoint(&self.failpoints, FAILPOINT_BEFORE_COMMIT)?;
        tx.commit().await.map_err(map_sqlx)?;

        let skipped_lower_tier = usize::try_from(skipped).unwrap_or(0);
        Ok(MergeReport {
            inserted,
            updated,
            skipped_lower_tier,
            unchanged: batch
                .rows()
                .len()
                .saturating_sub(inserted + updated + skipped_lower_tier),
            ..Default::default()
        })
    }
}

#[async_trait::async_trait]
impl CanonicalStore for PgCanonicalStore {
    async fn merge(&self, batch: &MergeBatch) -> Result<MergeReport, MergeError> {
        if batch.is_empty() {
            return Ok(MergeReport::default());
        }
        let report = self.merge_in_tx(batch).await?;
        tracing::debug!(
            table = %self.table,
            rows = batch.rows().len(),
            inserted = report.inserted,
            updated = report.updated,
            "merge committed"
        );
        Ok(report)
    }

    async fn fetch_window(&self, window: &MergeWindow) -> Result<Vec<CanonicalRow>, MergeError> {
        load_window(&self.pool, &self.table, &self.columns, window.start, window.end, None)
            .await
            .map_err(|e| MergeError::Store(format!("{e:#}")))
    }
}

/// Unique violations and "ON CONFLICT cannot affect row a second time" are
/// conflicts; everything else is treated as transient.
fn map_sqlx(e: sqlx::Error) -> MergeError {
    if let Some(db) = e.as_database_error() {
        if matches!(db.code().as_deref(), Some("23505") | Some("21000")) {
            return MergeError::Conflict(db.message().to_string());
        }
    }
    MergeError::Store(e.to_string())
}

fn column_list(prefix: &str, columns_sql: &[String]) -> String {
    columns_sql.iter().map(|c| format!(", {prefix}{c}")).collect()
}

fn rank_sql(expr: &str, priority: &TierPriority) -> String {
    let mut sql = format!("(CASE {expr}");
    for tier in SourceTier::ALL {
        sql.push_str(&format!(" WHEN '{}' THEN {}", tier.as_str(), priority.rank(tier)));
    }
    sql.push_str(" ELSE 0 END)");
    sql
}

fn create_table_sql(table_sql: &str, columns_sql: &[String]) -> String {
    let metrics: String = columns_sql
        .iter()
        .map(|c| format!("    {c} DOUBLE PRECISION,\n"))
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {table_sql} (\n    entity_id TEXT NOT NULL,\n    ts TIMESTAMPTZ NOT NULL,\n    source_tier TEXT NOT NULL,\n    fetched_at TIMESTAMPTZ NOT NULL,\n{metrics}    PRIMARY KEY (entity_id, ts)\n)"
    )
}

fn skipped_sql(table_sql: &str, priority: &TierPriority) -> String {
    format!(
        "SELECT COUNT(*) FROM {STAGE_TABLE} s JOIN {table_sql} t USING (entity_id, ts) WHERE {} > {}",
        rank_sql("t.source_tier", priority),
        rank_sql("s.source_tier", priority)
    )
}

fn upsert_sql(table_sql: &str, columns_sql: &[String], priority: &TierPriority) -> String {
    let cols = column_list("", columns_sql);
    let set: String = columns_sql
        .iter()
        .map(|c| format!(", {c} = EXCLUDED.{c}"))
        .collect();
    format!(
        "INSERT INTO {table_sql} AS t (entity_id, ts, source_tier, fetched_at{cols}) \
         SELECT entity_id, ts, source_tier, fetched_at{cols} FROM {STAGE_TABLE} \
         ON CONFLICT (entity_id, ts) DO UPDATE SET \
         source_tier = EXCLUDED.source_tier, fetched_at = EXCLUDED.fetched_at{set} \
         WHERE {} <= {} \
         AND (t.source_tier{}) IS DISTINCT FROM (EXCLUDED.source_tier{}) \
         RETURNING (xmax = 0) AS inserted",
        rank_sql("t.source_tier", priority),
        rank_sql("EXCLUDED.source_tier", priority),
        column_list("t.", columns_sql),
        column_list("EXCLUDED.", columns_sql),
    )
}
