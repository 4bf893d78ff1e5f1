use std::path::Path;

use serde::Deserialize;
use series_client::{Entity, EntityKind};
use time::{format_description::well_known::Rfc3339, OffsetDateTime};

use crate::pipeline::SourceError;

/// Region for a German federal state code, used when the entity file leaves
/// `region` blank.
pub fn region_for_state(state: &str) -> Option<&'static str> {
    match state.trim().to_ascii_uppercase().as_str() {
        "SH" | "HB" | "NI" | "MV" | "HH" => Some("North"),
        "HE" | "NW" | "RP" | "SL" => Some("West"),
        "SN" | "ST" | "BB" | "TH" | "BE" => Some("East"),
        "BY" | "BW" | "T" => Some("South"),
        _ => None,
    }
}

#[derive(Debug, Deserialize)]
struct EntityCsvRow {
    entity_id: String,
    kind: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    latitude: Option<f64>,
    #[serde(default)]
    longitude: Option<f64>,
    #[serde(default)]
    valid_from: Option<String>,
    #[serde(default)]
    valid_to: Option<String>,
}

fn non_blank(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn parse_bound(entity_id: &str, raw: Option<String>) -> Result<Option<OffsetDateTime>, SourceError> {
    non_blank(raw)
        .map(|s| {
            OffsetDateTime::parse(&s, &Rfc3339)
                .map_err(|e| SourceError(format!("entity {entity_id}: bad validity bound '{s}': {e}")))
        })
        .transpose()
}

impl TryFrom<EntityCsvRow> for Entity {
    type Error = SourceError;

    fn try_from(r: EntityCsvRow) -> Result<Self, Self::Error> {
        let entity_id = r.entity_id.trim().to_string();
        if entity_id.is_empty() {
            return Err(SourceError("entity row with empty entity_id".to_string()));
        }
        let kind = r
            .kind
            .parse::<EntityKind>()
            .map_err(|e| SourceError(format!("entity {entity_id}: {e}")))?;
        let state = non_blank(r.state);
        let region = non_blank(r.region)
            .or_else(|| state.as_deref().and_then(region_for_state).map(str::to_string));
        let valid_from = parse_bound(&entity_id, r.valid_from)?;
        let valid_to = parse_bound(&entity_id, r.valid_to)?;

        Ok(Entity {
            entity_id,
            kind,
            name: non_blank(r.name),
            state,
            region,
            latitude: r.latitude,
            longitude: r.longitude,
            valid_from,
            valid_to,
        })
    }
}

/// Load the entity dimension from a CSV file with a header row.
///
/// Columns: `entity_id, kind, name, state, region, latitude, longitude,
/// valid_from, valid_to`. Validity bounds are RFC 3339 and may be blank.
pub fn load_entities_csv<P: AsRef<Path>>(path: P) -> Result<Vec<Entity>, SourceError> {
    let path = path.as_ref();
    let mut rdr = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .map_err(|e| SourceError(format!("failed to open entity file {}: {e}", path.display())))?;

    let mut entities = Vec::new();
    for row in rdr.deserialize::<EntityCsvRow>() {
        let row = row.map_err(|e| SourceError(format!("bad entity row in {}: {e}", path.display())))?;
        entities.push(Entity::try_from(row)?);
    }
    Ok(entities)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use time::macros::datetime;

    #[test]
    fn loads_entities_and_derives_missing_regions() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "entity_id,kind,name,state,region,latitude,longitude,valid_from,valid_to").unwrap();
        writeln!(file, "691,station,Bremen,HB,,53.04,8.80,2000-01-01T00:00:00Z,").unwrap();
        writeln!(file, "1048,station,Dresden,SN,Saxony,51.13,13.75,,2024-06-30T23:00:00Z").unwrap();
        writeln!(file, "DE-LU,zone,,,,,,,").unwrap();

        let entities = load_entities_csv(file.path()).unwrap();
        assert_eq!(entities.len(), 3);

        assert_eq!(entities[0].region.as_deref(), Some("North"));
        assert_eq!(entities[0].valid_from, Some(datetime!(2000-01-01 00:00 UTC)));
        assert_eq!(entities[0].valid_to, None);

        assert_eq!(entities[1].region.as_deref(), Some("Saxony"));
        assert_eq!(entities[1].valid_to, Some(datetime!(2024-06-30 23:00 UTC)));

        assert_eq!(entities[2].kind, EntityKind::Zone);
        assert_eq!(entities[2].region, None);
        assert_eq!(entities[2].latitude, None);
    }

    #[test]
    fn unknown_kind_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "entity_id,kind").unwrap();
        writeln!(file, "691,buoy").unwrap();
        assert!(load_entities_csv(file.path()).is_err());
    }

    #[test]
    fn state_codes_map_to_regions() {
        assert_eq!(region_for_state("by"), Some("South"));
        assert_eq!(region_for_state("NW"), Some("West"));
        assert_eq!(region_for_state("XX"), None);
    }
}
