//! Canonical store implementations.

pub mod memory;
pub mod postgres;

use std::collections::HashSet;

use series_client::{CanonicalRow, MetricMap};

use crate::merge::MergeError;

pub use memory::MemoryStore;
pub use postgres::PgCanonicalStore;

/// Named injection points inside a merge.
pub const FAILPOINT_AFTER_STAGE: &str = "after_stage";
pub const FAILPOINT_BEFORE_COMMIT: &str = "before_commit";

pub(crate) fn maybe_failpoint(failpoints: &HashSet<String>, key: &str) -> Result<(), MergeError> {
    if failpoints.contains(key) {
        Err(MergeError::Failpoint(key.to_string()))
    } else {
        Ok(())
    }
}

/// Restrict a row's metrics to the store's columns; absent columns become null.
pub(crate) fn project(row: &CanonicalRow, columns: &[String]) -> CanonicalRow {
    let metrics: MetricMap = columns.iter().map(|c| (c.clone(), row.metric(c))).collect();
    CanonicalRow {
        metrics,
        ..row.clone()
    }
}
