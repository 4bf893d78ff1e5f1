pub mod db;
pub mod domain;

pub use domain::{
    CanonicalRow, DomainError, Entity, EntityKind, MetricMap, SeriesKey, SourceTier,
};
