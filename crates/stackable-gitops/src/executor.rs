//! Parallel, dependency-ordered execution of the desired-state graph.
//!
//! A single coordinator evaluates eligibility: a component becomes runnable
//! once every dependency completed successfully. Runnable components are
//! handed to worker tasks bounded by the worker budget. When a component
//! fails, everything transitively depending on it is reported as skipped,
//! not retried; the next reconcile tick reruns the whole graph.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fmt,
    sync::Arc,
};

use snafu::{ResultExt, Snafu};
use tokio::{sync::Semaphore, task::JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::{
    apply::{self, ManifestApplier},
    cluster::{ApplyOptions, ClusterApi},
    component::Component,
    graph::{self, DependencyGraph},
    helm::{self, ChartReconciler},
    inventory::{self, Inventory},
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("desired-state graph failed validation"))]
    InvalidGraph { source: graph::Error },
}

/// The failure of one component.
#[derive(Debug, Snafu)]
pub enum NodeError {
    #[snafu(display("failed to apply manifest"))]
    ApplyManifest { source: apply::Error },

    #[snafu(display("failed to reconcile release"))]
    ReconcileRelease { source: helm::reconciler::Error },

    #[snafu(display("failed to record the inventory item"))]
    RecordInventory { source: inventory::Error },

    #[snafu(display("execution was cancelled"))]
    Cancelled,
}

/// Why a component was skipped instead of executed.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SkipCause {
    /// A direct or transitive dependency failed.
    FailedDependency { dependency: String },

    /// Execution was cancelled before the component became runnable.
    Cancelled,
}

impl fmt::Display for SkipCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipCause::FailedDependency { dependency } => {
                write!(f, "dependency {dependency:?} failed")
            }
            SkipCause::Cancelled => write!(f, "execution was cancelled"),
        }
    }
}

/// Per-component outcomes of one graph execution.
#[derive(Debug, Default)]
pub struct ExecutionReport {
    pub applied: Vec<String>,
    pub failed: BTreeMap<String, NodeError>,
    pub skipped: BTreeMap<String, SkipCause>,
}

impl ExecutionReport {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

/// Executes dependency graphs with bounded parallelism.
pub struct GraphExecutor<C> {
    applier: Arc<ManifestApplier<C>>,
    releases: Arc<ChartReconciler<C>>,
    inventory: Arc<Inventory>,
    worker_budget: usize,
}

impl<C> GraphExecutor<C>
where
    C: ClusterApi + 'static,
{
    pub fn new(
        applier: Arc<ManifestApplier<C>>,
        releases: Arc<ChartReconciler<C>>,
        inventory: Arc<Inventory>,
    ) -> Self {
        Self {
            applier,
            releases,
            inventory,
            worker_budget: default_worker_budget(),
        }
    }

    pub fn with_worker_budget(mut self, worker_budget: usize) -> Self {
        self.worker_budget = worker_budget.max(1);
        self
    }

    /// Runs the graph to completion (or cancellation) and reports every
    /// component's outcome.
    pub async fn execute(
        &self,
        token: &CancellationToken,
        graph: &DependencyGraph,
    ) -> Result<ExecutionReport> {
        graph.validate().context(InvalidGraphSnafu)?;

        // Remaining unfinished dependencies per component and the reverse
        // edges, both owned by the coordinator.
        let mut waiting: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
        let mut dependents: BTreeMap<String, Vec<String>> = BTreeMap::new();
        let mut runnable: VecDeque<String> = VecDeque::new();

        for component in graph.components() {
            let id = component.id();
            let dependencies: BTreeSet<String> =
                component.dependencies().iter().cloned().collect();
            for dependency in &dependencies {
                dependents.entry(dependency.clone()).or_default().push(id.clone());
            }
            if dependencies.is_empty() {
                runnable.push_back(id);
            } else {
                waiting.insert(id, dependencies);
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.worker_budget));
        let mut workers: JoinSet<(String, Result<(), NodeError>)> = JoinSet::new();
        let mut report = ExecutionReport::default();

        loop {
            if token.is_cancelled() {
                // Stop picking up new work; in-flight workers observe the
                // token themselves.
                while let Some(id) = runnable.pop_front() {
                    report.skipped.insert(id, SkipCause::Cancelled);
                }
            } else {
                while let Some(id) = runnable.pop_front() {
                    let Some(component) = graph.get(&id).cloned() else {
                        continue;
                    };
                    workers.spawn(run_component(
                        id,
                        component,
                        self.applier.clone(),
                        self.releases.clone(),
                        self.inventory.clone(),
                        semaphore.clone(),
                        token.clone(),
                    ));
                }
            }

            let Some(joined) = workers.join_next().await else {
                break;
            };

            match joined {
                Ok((id, Ok(()))) => {
                    debug!(component.id = id, "component reconciled");
                    for dependent in dependents.remove(&id).unwrap_or_default() {
                        if let Some(remaining) = waiting.get_mut(&dependent) {
                            remaining.remove(&id);
                            if remaining.is_empty() {
                                waiting.remove(&dependent);
                                runnable.push_back(dependent);
                            }
                        }
                    }
                    report.applied.push(id);
                }
                Ok((id, Err(error))) => {
                    warn!(component.id = id, %error, "component failed");
                    skip_transitively(&id, &mut dependents, &mut waiting, &mut report.skipped);
                    report.failed.insert(id, error);
                }
                Err(join_error) => {
                    // A worker panicked; its dependents stay in `waiting` and
                    // are reported below.
                    warn!(%join_error, "component worker crashed");
                }
            }
        }

        for id in waiting.into_keys() {
            report
                .skipped
                .entry(id)
                .or_insert(SkipCause::Cancelled);
        }
        while let Some(id) = runnable.pop_front() {
            report.skipped.insert(id, SkipCause::Cancelled);
        }

        Ok(report)
    }
}

/// Marks everything transitively depending on `failed` as skipped.
fn skip_transitively(
    failed: &str,
    dependents: &mut BTreeMap<String, Vec<String>>,
    waiting: &mut BTreeMap<String, BTreeSet<String>>,
    skipped: &mut BTreeMap<String, SkipCause>,
) {
    let mut queue: VecDeque<String> = dependents.remove(failed).unwrap_or_default().into();

    while let Some(id) = queue.pop_front() {
        if waiting.remove(&id).is_none() {
            continue;
        }
        skipped.insert(
            id.clone(),
            SkipCause::FailedDependency {
                dependency: failed.to_owned(),
            },
        );
        queue.extend(dependents.remove(&id).unwrap_or_default());
    }
}

async fn run_component<C>(
    id: String,
    component: Component,
    applier: Arc<ManifestApplier<C>>,
    releases: Arc<ChartReconciler<C>>,
    inventory: Arc<Inventory>,
    semaphore: Arc<Semaphore>,
    token: CancellationToken,
) -> (String, Result<(), NodeError>)
where
    C: ClusterApi,
{
    let result = async {
        let _permit = semaphore
            .acquire_owned()
            .await
            .map_err(|_| NodeError::Cancelled)?;
        if token.is_cancelled() {
            return Err(NodeError::Cancelled);
        }

        match &component {
            Component::Manifest(manifest_component) => {
                tokio::select! {
                    () = token.cancelled() => return Err(NodeError::Cancelled),
                    applied = applier.apply(manifest_component.manifest(), ApplyOptions::default()) => {
                        applied.context(ApplyManifestSnafu)?;
                    }
                }
                // Releases persist their own observed payload, manifests are
                // recorded here.
                inventory
                    .store(&component.inventory_item(), None)
                    .await
                    .context(RecordInventorySnafu)?;
            }
            Component::HelmRelease(release_component) => {
                tokio::select! {
                    () = token.cancelled() => return Err(NodeError::Cancelled),
                    observed = releases.reconcile(release_component.release()) => {
                        observed.context(ReconcileReleaseSnafu)?;
                    }
                }
            }
        }

        Ok(())
    }
    .await;

    (id, result)
}

fn default_worker_budget() -> usize {
    std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
}

#[cfg(test)]
mod tests {
    use kube::core::DynamicObject;
    use serde_json::json;

    use super::*;
    use crate::{
        component::{HelmChart, ManifestComponent, ReleaseComponent, ReleaseDeclaration},
        helm::ChartFetcher,
        manifest::Manifest,
        testing::{FakeCluster, Op, chart_fixture},
    };

    fn manifest_component(yaml: &str, dependencies: &[&str]) -> Component {
        let object: DynamicObject = serde_yaml::from_str(yaml).unwrap();
        Component::Manifest(
            ManifestComponent::new(
                Manifest::new(object),
                dependencies.iter().map(ToString::to_string).collect(),
            )
            .unwrap(),
        )
    }

    fn namespace(name: &str) -> Component {
        manifest_component(
            &format!("apiVersion: v1\nkind: Namespace\nmetadata:\n  name: {name}\n"),
            &[],
        )
    }

    fn deployment(name: &str, namespace: &str, dependencies: &[&str]) -> Component {
        manifest_component(
            &format!(
                "apiVersion: apps/v1\nkind: Deployment\nmetadata:\n  name: {name}\n  namespace: {namespace}\n"
            ),
            dependencies,
        )
    }

    struct Setup {
        cluster: Arc<FakeCluster>,
        inventory: Arc<Inventory>,
        executor: GraphExecutor<FakeCluster>,
        _dirs: (tempfile::TempDir, tempfile::TempDir),
    }

    fn setup() -> Setup {
        let cache = tempfile::tempdir().unwrap();
        chart_fixture(
            cache.path(),
            "demo",
            "1.0.0",
            "",
            &[(
                "configmap.yaml",
                "apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {{ release.name }}\n",
            )],
        );

        let inventory_dir = tempfile::tempdir().unwrap();
        let cluster = Arc::new(FakeCluster::default());
        let inventory = Arc::new(Inventory::new(inventory_dir.path()));
        let applier = Arc::new(ManifestApplier::new(cluster.clone(), "controller"));
        let releases = Arc::new(ChartReconciler::new(
            cluster.clone(),
            ChartFetcher::new(cache.path()),
            inventory.clone(),
            "controller",
        ));
        let executor =
            GraphExecutor::new(applier, releases, inventory.clone()).with_worker_budget(4);

        Setup {
            cluster,
            inventory,
            executor,
            _dirs: (cache, inventory_dir),
        }
    }

    #[tokio::test]
    async fn applies_in_dependency_order_and_tracks_the_inventory() {
        let Setup {
            cluster,
            inventory,
            executor,
            ..
        } = setup();

        let mut graph = DependencyGraph::new();
        graph.insert(namespace("a")).unwrap();
        graph
            .insert(deployment("a", "a", &["a__Namespace__v1"]))
            .unwrap();

        let report = executor
            .execute(&CancellationToken::new(), &graph)
            .await
            .unwrap();
        assert!(report.is_success());
        assert_eq!(report.applied.len(), 2);

        // The namespace apply happened strictly before the deployment apply.
        let applies: Vec<String> = cluster
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Apply { kind, .. } => Some(kind),
                _ => None,
            })
            .collect();
        let namespace_index = applies.iter().position(|kind| kind == "Namespace").unwrap();
        let deployment_index = applies.iter().position(|kind| kind == "Deployment").unwrap();
        assert!(namespace_index < deployment_index);

        let snapshot = inventory.load().await.unwrap();
        assert!(snapshot.contains("a__Namespace__v1"));
        assert!(snapshot.contains("a_a_Deployment_apps_v1"));
        assert_eq!(snapshot.len(), 2);
    }

    #[tokio::test]
    async fn release_components_are_dispatched_to_the_chart_reconciler() {
        let Setup {
            cluster,
            inventory,
            executor,
            ..
        } = setup();

        let mut graph = DependencyGraph::new();
        graph.insert(namespace("apps")).unwrap();
        graph
            .insert(Component::HelmRelease(
                ReleaseComponent::new(
                    ReleaseDeclaration {
                        name: "demo".to_owned(),
                        namespace: "apps".to_owned(),
                        chart: HelmChart {
                            name: "demo".to_owned(),
                            repo_url: "https://charts.example.com".to_owned(),
                            version: "1.0.0".to_owned(),
                        },
                        values: json!({}),
                    },
                    vec!["apps__Namespace__v1".to_owned()],
                )
                .unwrap(),
            ))
            .unwrap();

        let report = executor
            .execute(&CancellationToken::new(), &graph)
            .await
            .unwrap();
        assert!(report.is_success());

        assert!(cluster.object("ConfigMap", Some("apps"), "demo").is_some());

        // The release item carries the observed payload, the manifest item is
        // empty.
        let snapshot = inventory.load().await.unwrap();
        assert!(snapshot.contains("demo_apps_HelmRelease"));
        let item = snapshot.get("demo_apps_HelmRelease").unwrap();
        assert!(inventory.read_payload(item).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn failed_dependencies_skip_their_dependents_transitively() {
        let Setup {
            cluster,
            inventory,
            executor,
            ..
        } = setup();
        cluster.break_applies_of("broken");

        let mut graph = DependencyGraph::new();
        graph.insert(namespace("a")).unwrap();
        graph
            .insert(deployment("broken", "a", &["a__Namespace__v1"]))
            .unwrap();
        graph
            .insert(deployment("dependent", "a", &["broken_a_Deployment_apps_v1"]))
            .unwrap();
        graph
            .insert(deployment("independent", "a", &["a__Namespace__v1"]))
            .unwrap();

        let report = executor
            .execute(&CancellationToken::new(), &graph)
            .await
            .unwrap();

        assert_eq!(report.applied.len(), 2);
        assert!(report.failed.contains_key("broken_a_Deployment_apps_v1"));
        assert_eq!(
            report.skipped.get("dependent_a_Deployment_apps_v1"),
            Some(&SkipCause::FailedDependency {
                dependency: "broken_a_Deployment_apps_v1".to_owned(),
            })
        );

        // Neither the failed nor the skipped component left an inventory
        // record behind.
        let snapshot = inventory.load().await.unwrap();
        assert!(!snapshot.contains("broken_a_Deployment_apps_v1"));
        assert!(!snapshot.contains("dependent_a_Deployment_apps_v1"));
    }

    #[tokio::test]
    async fn cancellation_stops_worker_pickup() {
        let Setup {
            cluster, executor, ..
        } = setup();

        let mut graph = DependencyGraph::new();
        graph.insert(namespace("a")).unwrap();
        graph
            .insert(deployment("a", "a", &["a__Namespace__v1"]))
            .unwrap();

        let token = CancellationToken::new();
        token.cancel();

        let report = executor.execute(&token, &graph).await.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.skipped.len(), 2);
        assert!(cluster.ops().is_empty());
    }

    #[tokio::test]
    async fn invalid_graphs_are_rejected_before_execution() {
        let Setup { executor, .. } = setup();

        let mut graph = DependencyGraph::new();
        graph.insert(deployment("a", "a", &["missing"])).unwrap();

        assert!(matches!(
            executor.execute(&CancellationToken::new(), &graph).await,
            Err(Error::InvalidGraph { .. })
        ));
    }
}
