//! The periodic driver of the engine.
//!
//! Per tick the controller loads the desired state from its source, executes
//! the graph and collects garbage. A tick never aborts the loop: per-node
//! failures are aggregated into a single error log line and the next tick
//! reruns the whole graph. Leader election is the deployment's concern and
//! happens outside of this crate.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use snafu::{ResultExt, Snafu};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::{
    cluster::ClusterApi,
    executor::{self, ExecutionReport, GraphExecutor},
    gc::{self, CollectionReport, Collector},
    graph::DependencyGraph,
};

type Result<T, E = Error> = std::result::Result<T, E>;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync + 'static>;

const RECONCILE_DURATION_METRIC: &str = "gitops_reconcile_duration_seconds";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to load the desired state"))]
    LoadDesiredState { source: BoxedError },

    #[snafu(display("failed to execute the desired-state graph"))]
    Execute { source: executor::Error },

    #[snafu(display("failed to collect garbage"))]
    Collect { source: gc::Error },
}

/// Produces the desired-state graph of one tick, typically from a fresh
/// working copy of the configuration repository. Implemented by the
/// configuration front-end outside of this crate.
#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    async fn load(&self) -> Result<DependencyGraph, BoxedError>;
}

/// What one tick did.
#[derive(Debug)]
pub struct TickSummary {
    pub execution: ExecutionReport,
    pub collection: CollectionReport,
    pub duration: Duration,
}

impl TickSummary {
    pub fn is_success(&self) -> bool {
        self.execution.is_success() && self.collection.is_success()
    }
}

/// The reconcile loop: load, execute, collect, repeat.
pub struct GitOpsController<C, S> {
    source: S,
    executor: GraphExecutor<C>,
    collector: Collector<C>,
    interval: Duration,
    project: String,
    repository_url: String,
}

impl<C, S> GitOpsController<C, S>
where
    C: ClusterApi + 'static,
    S: DesiredStateSource,
{
    pub fn new(
        source: S,
        executor: GraphExecutor<C>,
        collector: Collector<C>,
        interval: Duration,
        project: impl Into<String>,
        repository_url: impl Into<String>,
    ) -> Self {
        Self {
            source,
            executor,
            collector,
            interval,
            project: project.into(),
            repository_url: repository_url.into(),
        }
    }

    /// Runs ticks at the configured interval until the token is cancelled.
    pub async fn run(&self, token: &CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                () = token.cancelled() => {
                    info!("reconcile loop stopped");
                    return;
                }
                _ = interval.tick() => {}
            }

            match self.run_tick(token).await {
                Ok(summary) if summary.is_success() => {
                    info!(
                        gitops.project = self.project,
                        applied = summary.execution.applied.len(),
                        collected = summary.collection.removed.len(),
                        duration = ?summary.duration,
                        "reconcile tick finished"
                    );
                }
                Ok(summary) => {
                    // One aggregated line; the per-node details were logged
                    // where they happened.
                    error!(
                        gitops.project = self.project,
                        failed = summary.execution.failed.len(),
                        skipped = summary.execution.skipped.len(),
                        collection_failures = summary.collection.failed.len(),
                        "reconcile tick finished degraded"
                    );
                }
                Err(error) => {
                    error!(
                        gitops.project = self.project,
                        %error,
                        "reconcile tick failed"
                    );
                }
            }
        }
    }

    /// Runs exactly one tick.
    pub async fn run_tick(&self, token: &CancellationToken) -> Result<TickSummary> {
        let started = Instant::now();

        let graph = self.source.load().await.context(LoadDesiredStateSnafu)?;
        info!(
            gitops.project = self.project,
            components = graph.len(),
            "loaded desired state"
        );

        let execution = self
            .executor
            .execute(token, &graph)
            .await
            .context(ExecuteSnafu)?;
        let collection = self
            .collector
            .collect(token, &graph)
            .await
            .context(CollectSnafu)?;

        let duration = started.elapsed();
        metrics::histogram!(
            RECONCILE_DURATION_METRIC,
            "project" => self.project.clone(),
            "url" => self.repository_url.clone(),
        )
        .record(duration.as_secs_f64());

        Ok(TickSummary {
            execution,
            collection,
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use kube::core::DynamicObject;

    use super::*;
    use crate::{
        apply::ManifestApplier,
        component::{Component, ManifestComponent},
        helm::{ChartFetcher, ChartReconciler},
        inventory::{Inventory, InventoryItem},
        manifest::Manifest,
        testing::FakeCluster,
    };

    struct StaticSource {
        components: Vec<Component>,
    }

    #[async_trait]
    impl DesiredStateSource for StaticSource {
        async fn load(&self) -> Result<DependencyGraph, BoxedError> {
            let mut graph = DependencyGraph::new();
            for component in &self.components {
                graph.insert(component.clone())?;
            }
            Ok(graph)
        }
    }

    fn config_map(name: &str) -> Component {
        let object: DynamicObject = serde_yaml::from_str(&format!(
            "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {name}\n  namespace: default\n"
        ))
        .unwrap();
        Component::Manifest(ManifestComponent::new(Manifest::new(object), vec![]).unwrap())
    }

    fn controller(
        cluster: &Arc<FakeCluster>,
        inventory: &Arc<Inventory>,
        cache: &std::path::Path,
        components: Vec<Component>,
    ) -> GitOpsController<FakeCluster, StaticSource> {
        let applier = Arc::new(ManifestApplier::new(cluster.clone(), "controller"));
        let releases = Arc::new(ChartReconciler::new(
            cluster.clone(),
            ChartFetcher::new(cache),
            inventory.clone(),
            "controller",
        ));
        GitOpsController::new(
            StaticSource { components },
            GraphExecutor::new(applier, releases.clone(), inventory.clone()).with_worker_budget(2),
            Collector::new(cluster.clone(), releases, inventory.clone()).with_worker_budget(2),
            Duration::from_secs(30),
            "demo-project",
            "https://git.example.com/demo.git",
        )
    }

    /// One tick applies the graph, the next tick collects what was dropped
    /// from it. After each tick, inventory ids equal graph ids.
    #[tokio::test]
    async fn ticks_converge_inventory_and_desired_state() {
        let cache = tempfile::tempdir().unwrap();
        let inventory_dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        let inventory = Arc::new(Inventory::new(inventory_dir.path()));
        let token = CancellationToken::new();

        let first = controller(
            &cluster,
            &inventory,
            cache.path(),
            vec![config_map("a"), config_map("b")],
        );
        let summary = first.run_tick(&token).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.execution.applied.len(), 2);

        let second = controller(&cluster, &inventory, cache.path(), vec![config_map("a")]);
        let summary = second.run_tick(&token).await.unwrap();
        assert!(summary.is_success());
        assert_eq!(summary.collection.removed, vec!["b_default_ConfigMap__v1"]);

        assert!(cluster.object("ConfigMap", Some("default"), "a").is_some());
        assert!(cluster.object("ConfigMap", Some("default"), "b").is_none());

        let snapshot = inventory.load().await.unwrap();
        let ids: Vec<String> = snapshot.items().map(InventoryItem::id).collect();
        assert_eq!(ids, vec!["a_default_ConfigMap__v1"]);
    }
}
