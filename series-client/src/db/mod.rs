pub mod canonical_queries;
pub mod entity_queries;
pub mod ident;

pub use canonical_queries::load_window;
pub use entity_queries::load_entities;
pub use ident::quote_ident;
