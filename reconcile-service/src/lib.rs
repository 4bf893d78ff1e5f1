pub mod app;
pub mod config;
pub mod grid;
pub mod interpolate;
pub mod merge;
pub mod metrics_server;
pub mod normalize;
pub mod observability;
pub mod pipeline;
pub mod reconcile;
pub mod resample;
pub mod rollup;
pub mod sinks;
pub mod sources;

pub use pipeline::{CanonicalStore, Envelope, Pipeline};
