//! Helm chart releases: fetching, rendering, release lifecycle and drift
//! handling.

pub mod chart;
pub mod fetch;
pub mod reconciler;
pub mod storage;

pub use chart::Chart;
pub use fetch::ChartFetcher;
pub use reconciler::{ChartReconciler, Drift, ObservedRelease};
pub use storage::{ReleaseHistory, ReleaseRecord, ReleaseStatus, ReleaseStore};
