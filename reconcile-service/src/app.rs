//! Wiring shared by the binaries: store, entity dimension and pipeline
//! construction from an [`AppConfig`].

use std::{collections::HashMap, sync::Arc};

use anyhow::{bail, Context, Result};
use series_client::{CanonicalRow, Entity};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::{
    config::{AppConfig, StoreKind},
    merge::{MergeBatch, MergeError, MergeReport, MergeWindow, UpsertMerger},
    normalize::Normalizer,
    pipeline::{CanonicalStore, Pipeline},
    sinks::{MemoryStore, PgCanonicalStore},
    sources::{load_entities_csv, open_source},
};

/// The store selected by `store.kind`.
pub enum ConfiguredStore {
    Postgres(PgCanonicalStore),
    Memory(MemoryStore),
}

#[async_trait::async_trait]
impl CanonicalStore for ConfiguredStore {
    async fn merge(&self, batch: &MergeBatch) -> Result<MergeReport, MergeError> {
        match self {
            Self::Postgres(s) => s.merge(batch).await,
            Self::Memory(s) => s.merge(batch).await,
        }
    }

    async fn fetch_window(&self, window: &MergeWindow) -> Result<Vec<CanonicalRow>, MergeError> {
        match self {
            Self::Postgres(s) => s.fetch_window(window).await,
            Self::Memory(s) => s.fetch_window(window).await,
        }
    }
}

pub async fn connect(cfg: &AppConfig) -> Result<Option<PgPool>> {
    let Some(db) = &cfg.database else {
        return Ok(None);
    };
    let pool = PgPoolOptions::new()
        .max_connections(db.max_connections)
        .connect(&db.uri)
        .await
        .context("connecting to canonical database")?;
    Ok(Some(pool))
}

pub async fn build_store(cfg: &AppConfig, pool: Option<&PgPool>) -> Result<ConfiguredStore> {
    let store_cfg = &cfg.store;
    match store_cfg.kind {
        StoreKind::Memory => Ok(ConfiguredStore::Memory(
            MemoryStore::new(store_cfg.metrics.clone()).with_failpoints(store_cfg.failpoints.iter().cloned()),
        )),
        StoreKind::Postgres => {
            let Some(pool) = pool else {
                bail!("postgres store configured without a database");
            };
            let store = PgCanonicalStore::new(
                pool.clone(),
                &store_cfg.table,
                store_cfg.metrics.clone(),
                store_cfg.batch_size,
            )?
            .with_failpoints(&store_cfg.failpoints);
            if store_cfg.create_table {
                store.ensure_table().await?;
            }
            Ok(ConfiguredStore::Postgres(store))
        }
    }
}

/// Load the entity dimension keyed by entity id.
pub async fn load_entities(cfg: &AppConfig, pool: Option<&PgPool>) -> Result<HashMap<String, Entity>> {
    let entities = match (&cfg.entities.path, &cfg.entities.table, pool) {
        (Some(path), _, _) => load_entities_csv(path)?,
        (None, Some(table), Some(pool)) => series_client::db::load_entities(pool, table).await?,
        (None, Some(_), None) => bail!("entities.table needs a [database] section"),
        (None, None, _) => bail!("no entity source configured"),
    };
    tracing::info!(entities = entities.len(), "entity dimension loaded");
    Ok(entities.into_iter().map(|e| (e.entity_id.clone(), e)).collect())
}

pub async fn build_pipeline(cfg: &AppConfig) -> Result<Pipeline<ConfiguredStore>> {
    let pool = connect(cfg).await?;
    let store = build_store(cfg, pool.as_ref()).await?;
    let entities = load_entities(cfg, pool.as_ref()).await?;

    let sources = cfg
        .providers
        .iter()
        .map(|p| open_source(&p.profile.name, &p.source))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(Pipeline {
        sources,
        normalizer: Normalizer::new(cfg.profiles())?,
        entities: Arc::new(entities),
        settings: Arc::new(cfg.engine_settings()?),
        merger: UpsertMerger::new(store, cfg.store.max_retries, cfg.store.retry_backoff()),
    })
}
