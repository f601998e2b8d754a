//! Garbage collection of resources which left the desired state.
//!
//! The collector subtracts the current graph from the inventory: every
//! recorded item without a matching component is undone through the
//! subsystem which created it, then dropped from the inventory. Item
//! failures are collected and surfaced but never abort the sweep for the
//! remaining items.

use std::{collections::BTreeMap, sync::Arc};

use futures::{StreamExt, stream};
use snafu::{ResultExt, Snafu};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    cluster::{ClusterApi, ClusterError, ObjectHandle},
    graph::DependencyGraph,
    helm::{self, ChartReconciler},
    inventory::{self, Inventory, InventoryItem, ManifestItem},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load the inventory"))]
    LoadInventory { source: inventory::Error },
}

/// The failure of one undo.
#[derive(Debug, Snafu)]
pub enum UndoError {
    #[snafu(display("failed to delete the object from the cluster"))]
    DeleteObject { source: ClusterError },

    #[snafu(display("failed to uninstall the release"))]
    UninstallRelease { source: helm::reconciler::Error },

    #[snafu(display("failed to drop the inventory record"))]
    DropRecord { source: inventory::Error },

    #[snafu(display("collection was cancelled"))]
    Cancelled,
}

/// Per-item outcomes of one collection sweep.
#[derive(Debug, Default)]
pub struct CollectionReport {
    pub removed: Vec<String>,
    pub failed: BTreeMap<String, UndoError>,
}

impl CollectionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Undoes inventory items which are no longer part of the desired state.
pub struct Collector<C> {
    cluster: Arc<C>,
    releases: Arc<ChartReconciler<C>>,
    inventory: Arc<Inventory>,
    worker_budget: usize,
}

impl<C> Collector<C>
where
    C: ClusterApi,
{
    pub fn new(
        cluster: Arc<C>,
        releases: Arc<ChartReconciler<C>>,
        inventory: Arc<Inventory>,
    ) -> Self {
        Self {
            cluster,
            releases,
            inventory,
            worker_budget: std::thread::available_parallelism()
                .map_or(1, std::num::NonZeroUsize::get),
        }
    }

    pub fn with_worker_budget(mut self, worker_budget: usize) -> Self {
        self.worker_budget = worker_budget.max(1);
        self
    }

    /// Sweeps the inventory against the graph. After a fully successful
    /// sweep the inventory ids and the graph ids are identical sets.
    pub async fn collect(
        &self,
        token: &CancellationToken,
        graph: &DependencyGraph,
    ) -> Result<CollectionReport> {
        let snapshot = self.inventory.load().await.context(LoadInventorySnafu)?;

        let survivors: Vec<InventoryItem> = snapshot
            .items()
            .filter(|item| !graph.contains(&item.id()))
            .cloned()
            .collect();

        if survivors.is_empty() {
            debug!("inventory matches the desired state, nothing to collect");
            return Ok(CollectionReport::default());
        }
        info!(count = survivors.len(), "collecting orphaned items");

        let outcomes = stream::iter(survivors)
            .map(|item| {
                let token = token.clone();
                async move {
                    let id = item.id();
                    let outcome = if token.is_cancelled() {
                        Err(UndoError::Cancelled)
                    } else {
                        self.undo(&item).await
                    };
                    (id, outcome)
                }
            })
            .buffer_unordered(self.worker_budget)
            .collect::<Vec<_>>()
            .await;

        let mut report = CollectionReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.removed.push(id),
                Err(error) => {
                    warn!(inventory.key = id, %error, "failed to collect item");
                    report.failed.insert(id, error);
                }
            }
        }
        report.removed.sort();

        Ok(report)
    }

    /// Performs the inverse operation of one item and drops its record.
    async fn undo(&self, item: &InventoryItem) -> Result<(), UndoError> {
        match item {
            InventoryItem::Manifest(manifest_item) => {
                debug!(inventory.key = item.id(), "deleting object");
                match self.cluster.delete(&manifest_handle(manifest_item)).await {
                    Ok(()) => {}
                    // Someone beat us to it; the record still has to go.
                    Err(error) if error.is_not_found() => {}
                    Err(error) => return Err(error).context(DeleteObjectSnafu),
                }
            }
            InventoryItem::Release(release_item) => {
                self.releases
                    .uninstall(&release_item.name, &release_item.namespace)
                    .await
                    .context(UninstallReleaseSnafu)?;
            }
        }

        self.inventory.delete(item).await.context(DropRecordSnafu)
    }
}

fn manifest_handle(item: &ManifestItem) -> ObjectHandle {
    ObjectHandle {
        gvk: item.gvk(),
        name: item.name.clone(),
        namespace: item.namespace.clone(),
    }
}
