use anyhow::Result;
use sqlx::PgPool;
use time::OffsetDateTime;

use crate::{
    db::ident::quote_table,
    domain::{Entity, EntityKind},
};

#[derive(Debug, Clone, sqlx::FromRow)]
struct EntityRow {
    entity_id: String,
    kind: String,
    name: Option<String>,
    state: Option<String>,
    region: Option<String>,
    latitude: Option<f64>,
    longitude: Option<f64>,
    valid_from: Option<OffsetDateTime>,
    valid_to: Option<OffsetDateTime>,
}

impl TryFrom<EntityRow> for Entity {
    type Error = anyhow::Error;

    fn try_from(r: EntityRow) -> Result<Self> {
        Ok(Entity {
            entity_id: r.entity_id,
            kind: r.kind.parse::<EntityKind>()?,
            name: r.name,
            state: r.state,
            region: r.region,
            latitude: r.latitude,
            longitude: r.longitude,
            valid_from: r.valid_from,
            valid_to: r.valid_to,
        })
    }
}

/// Load the entity dimension (stations and zones) from `table`.
pub async fn load_entities(pool: &PgPool, table: &str) -> Result<Vec<Entity>> {
    let sql = format!(
        r#"
        SELECT
            entity_id,
            kind,
            name,
            state,
            region,
            latitude,
            longitude,
            valid_from,
            valid_to
        FROM {}
        ORDER BY entity_id
        "#,
        quote_table(table)?
    );

    let rows = sqlx::query_as::<_, EntityRow>(&sql).fetch_all(pool).await?;
    rows.into_iter().map(Entity::try_from).collect()
}
