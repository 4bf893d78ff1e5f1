pub mod entity;
pub mod hour;
pub mod observation;
pub mod tier;

pub use entity::{Entity, EntityKind};
pub use observation::{CanonicalRow, MetricMap, SeriesKey};
pub use tier::SourceTier;

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum DomainError {
    #[error("unknown source tier '{0}'")]
    UnknownTier(String),
    #[error("unknown entity kind '{0}'")]
    UnknownEntityKind(String),
    #[error("invalid SQL identifier '{0}'")]
    InvalidIdentifier(String),
}
