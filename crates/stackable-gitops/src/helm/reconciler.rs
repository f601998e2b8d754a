//! Release lifecycle: install if absent, upgrade on drift, recover from
//! interruptions.
//!
//! The reconciler owns the full release lifecycle. Per release it loads the
//! recorded history, resets dangling pending records, classifies the drift
//! between the declared and the observed state and performs the matching
//! action. The observed state survives in the inventory payload of the
//! release's item and is the reference point for the next drift check.

use std::sync::Arc;

use kube::core::DynamicObject;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{ResultExt, Snafu};
use strum::Display;
use tracing::{debug, info};

use crate::{
    apply::{self, ManifestApplier},
    cluster::{ApplyOptions, ClusterApi, ClusterError, ObjectHandle},
    component::{HelmChart, ReleaseDeclaration},
    helm::{
        chart::{self, Chart, parse_documents},
        fetch::{self, ChartFetcher},
        storage::{self, ReleaseHistory, ReleaseRecord, ReleaseStatus, ReleaseStore},
    },
    inventory::{self, Inventory, InventoryItem, ReleaseItem},
    manifest::Manifest,
};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to fetch chart {chart:?}"))]
    FetchChart {
        source: fetch::Error,
        chart: String,
    },

    #[snafu(display("failed to load chart {chart:?}"))]
    LoadChart {
        source: chart::Error,
        chart: String,
    },

    #[snafu(display("failed to render release {release:?}"))]
    RenderRelease {
        source: chart::Error,
        release: String,
    },

    #[snafu(display("failed to parse the recorded manifest of release {release:?}"))]
    ParseRecordedManifest {
        source: chart::Error,
        release: String,
    },

    #[snafu(display("failed to access the release record"))]
    Storage { source: storage::Error },

    #[snafu(display("cluster request for release {release:?} failed"))]
    Cluster {
        source: ClusterError,
        release: String,
    },

    #[snafu(display("failed to apply an object of release {release:?}"))]
    ApplyObject {
        source: apply::Error,
        release: String,
    },

    #[snafu(display("failed to access the observed release payload of {release:?}"))]
    ObservedPayload {
        source: inventory::Error,
        release: String,
    },

    #[snafu(display("failed to encode the observed release {release:?}"))]
    EncodeObserved {
        source: serde_json::Error,
        release: String,
    },

    #[snafu(display("failed to parse the observed release {release:?}"))]
    ParseObserved {
        source: serde_json::Error,
        release: String,
    },
}

/// The difference between a release's declared and observed state.
#[derive(Clone, Copy, Debug, Display, Eq, PartialEq)]
#[strum(serialize_all = "lowercase")]
pub enum Drift {
    /// Declared and observed state agree, nothing to do.
    None,

    /// The declaration changed, a regular upgrade reconciles it.
    Update,

    /// Another field manager took ownership of released fields, the upgrade
    /// must force.
    Conflict,

    /// Released objects (or the observed record itself) went missing, the
    /// upgrade recreates them.
    Deleted,
}

/// The engine's last durable view of a successfully deployed release.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ObservedRelease {
    pub name: String,
    pub namespace: String,
    pub chart: HelmChart,
    #[serde(default)]
    pub values: Value,
    pub version: u32,
}

impl ObservedRelease {
    /// Structural equality against a declaration: coordinates and values.
    fn matches(&self, declaration: &ReleaseDeclaration) -> bool {
        self.name == declaration.name
            && self.namespace == declaration.namespace
            && self.chart == declaration.chart
            && self.values == declaration.values
    }
}

/// Reconciles chart releases against the cluster.
pub struct ChartReconciler<C> {
    cluster: Arc<C>,
    applier: ManifestApplier<C>,
    fetcher: ChartFetcher,
    store: ReleaseStore<C>,
    inventory: Arc<Inventory>,
}

impl<C> ChartReconciler<C>
where
    C: ClusterApi,
{
    pub fn new(
        cluster: Arc<C>,
        fetcher: ChartFetcher,
        inventory: Arc<Inventory>,
        field_manager: impl Into<String>,
    ) -> Self {
        let field_manager = field_manager.into();
        Self {
            applier: ManifestApplier::new(cluster.clone(), field_manager.clone()),
            store: ReleaseStore::new(cluster.clone(), field_manager),
            cluster,
            fetcher,
            inventory,
        }
    }

    /// Brings one release in line with its declaration and returns the
    /// resulting observed state.
    pub async fn reconcile(&self, declaration: &ReleaseDeclaration) -> Result<ObservedRelease> {
        eprintln!("DEBUG reconcile ENTRY: cache_root={:?} exists={}", self.fetcher.cache_root(), self.fetcher.cache_root().exists());
        let name = declaration.name.as_str();
        let namespace = declaration.namespace.as_str();

        let mut history = self
            .store
            .load(name, namespace)
            .await
            .context(StorageSnafu)?
            .unwrap_or_default();

        let mut recovered = false;
        if history.latest().is_some_and(|record| record.status.is_pending()) {
            info!(
                helm.release.name = name,
                helm.release.namespace = namespace,
                "found release in a pending state, resetting its dangling record"
            );
            history.drop_pending();
            if history.is_empty() {
                self.store
                    .delete(name, namespace)
                    .await
                    .context(StorageSnafu)?;
            } else {
                self.store
                    .save(name, namespace, &history)
                    .await
                    .context(StorageSnafu)?;
            }
            recovered = true;
        }

        eprintln!("DEBUG reconcile: about to fetch, cache_root={:?} exists={}", self.fetcher.cache_root(), self.fetcher.cache_root().exists());
        let chart_dir = self
            .fetcher
            .fetch(&declaration.chart)
            .await
            .context(FetchChartSnafu {
                chart: &declaration.chart.name,
            })?;
        let chart = Chart::load(&chart_dir).context(LoadChartSnafu {
            chart: &declaration.chart.name,
        })?;

        // An interrupted release is treated as absent: reinstall from
        // scratch instead of classifying drift against a half-applied state.
        if history.is_empty() || recovered {
            info!(
                helm.release.name = name,
                helm.release.namespace = namespace,
                "installing release"
            );
            return self
                .deploy(
                    &chart,
                    declaration,
                    &mut history,
                    ReleaseStatus::PendingInstall,
                    false,
                )
                .await;
        }

        let drift = self.classify(&chart, declaration).await?;
        debug!(
            helm.release.name = name,
            helm.release.namespace = namespace,
            helm.release.drift = %drift,
            "classified release drift"
        );

        match drift {
            Drift::None => {
                if let Some(observed) = self.read_observed(declaration).await? {
                    return Ok(observed);
                }
                // The payload disappeared between classification and now,
                // recreate it through a regular upgrade.
                self.deploy(
                    &chart,
                    declaration,
                    &mut history,
                    ReleaseStatus::PendingUpgrade,
                    false,
                )
                .await
            }
            Drift::Update | Drift::Deleted => {
                info!(
                    helm.release.name = name,
                    helm.release.drift = %drift,
                    "upgrading release"
                );
                self.deploy(
                    &chart,
                    declaration,
                    &mut history,
                    ReleaseStatus::PendingUpgrade,
                    false,
                )
                .await
            }
            Drift::Conflict => {
                info!(
                    helm.release.name = name,
                    helm.release.drift = %drift,
                    "upgrading release over foreign field ownership"
                );
                self.deploy(
                    &chart,
                    declaration,
                    &mut history,
                    ReleaseStatus::PendingUpgrade,
                    true,
                )
                .await
            }
        }
    }

    /// Undoes a release: deletes the objects of its last applied manifest and
    /// removes the record Secret. Does not wait for the deletions to settle.
    pub async fn uninstall(&self, name: &str, namespace: &str) -> Result<()> {
        info!(
            helm.release.name = name,
            helm.release.namespace = namespace,
            "uninstalling release"
        );

        if let Some(history) = self
            .store
            .load(name, namespace)
            .await
            .context(StorageSnafu)?
        {
            if let Some(record) = history.latest() {
                let objects = parse_documents(&record.manifest)
                    .context(ParseRecordedManifestSnafu { release: name })?;
                for object in objects {
                    let handle =
                        ObjectHandle::from_object(&object).context(ClusterSnafu { release: name })?;
                    match self.cluster.delete(&handle).await {
                        Ok(()) => {}
                        Err(error) if error.is_not_found() => {}
                        Err(error) => return Err(error).context(ClusterSnafu { release: name }),
                    }
                }
            }
        }

        self.store
            .delete(name, namespace)
            .await
            .context(StorageSnafu)
    }

    /// Renders the upgrade in dry-run mode and classifies the drift.
    async fn classify(&self, chart: &Chart, declaration: &ReleaseDeclaration) -> Result<Drift> {
        let objects = self.rendered_objects(chart, declaration).await?;

        for object in &objects {
            let handle = ObjectHandle::from_object(object).context(ClusterSnafu {
                release: &declaration.name,
            })?;

            match self.cluster.get(&handle).await {
                Ok(_) => {}
                Err(error) if error.is_not_found() => return Ok(Drift::Deleted),
                Err(error) => {
                    return Err(error).context(ClusterSnafu {
                        release: &declaration.name,
                    });
                }
            }

            let probe = self
                .applier
                .apply(
                    &Manifest::new(object.clone()),
                    ApplyOptions {
                        dry_run: true,
                        force: false,
                    },
                )
                .await;
            match probe {
                Ok(_) => {}
                Err(error) if error.as_cluster().is_some_and(ClusterError::is_conflict) => {
                    return Ok(Drift::Conflict);
                }
                Err(error) => {
                    return Err(error).context(ApplyObjectSnafu {
                        release: &declaration.name,
                    });
                }
            }
        }

        match self.read_observed(declaration).await? {
            None => Ok(Drift::Deleted),
            Some(observed) if observed.matches(declaration) => Ok(Drift::None),
            Some(_) => Ok(Drift::Update),
        }
    }

    /// Installs or upgrades: records a pending revision, applies every
    /// rendered object, promotes the revision and persists the observed
    /// release.
    async fn deploy(
        &self,
        chart: &Chart,
        declaration: &ReleaseDeclaration,
        history: &mut ReleaseHistory,
        pending: ReleaseStatus,
        force: bool,
    ) -> Result<ObservedRelease> {
        let name = declaration.name.as_str();
        let namespace = declaration.namespace.as_str();

        if pending == ReleaseStatus::PendingInstall {
            self.ensure_namespace(namespace).await?;
        }

        let objects = self.rendered_objects(chart, declaration).await?;
        let manifest = objects
            .iter()
            .map(|object| serde_yaml::to_string(object).unwrap_or_default())
            .collect::<Vec<_>>()
            .join("---\n");

        let revision = history.next_revision();
        history.push(ReleaseRecord {
            revision,
            status: pending,
            chart: declaration.chart.clone(),
            values: declaration.values.clone(),
            manifest,
        });
        self.store
            .save(name, namespace, history)
            .await
            .context(StorageSnafu)?;

        for object in &objects {
            self.applier
                .apply(
                    &Manifest::new(object.clone()),
                    ApplyOptions {
                        force,
                        dry_run: false,
                    },
                )
                .await
                .context(ApplyObjectSnafu { release: name })?;
        }

        history.promote(revision);
        self.store
            .save(name, namespace, history)
            .await
            .context(StorageSnafu)?;

        let observed = ObservedRelease {
            name: name.to_owned(),
            namespace: namespace.to_owned(),
            chart: declaration.chart.clone(),
            values: declaration.values.clone(),
            version: revision,
        };
        self.persist_observed(&observed).await?;

        Ok(observed)
    }

    /// Renders the chart and scopes namespaced objects without an explicit
    /// namespace into the release namespace.
    async fn rendered_objects(
        &self,
        chart: &Chart,
        declaration: &ReleaseDeclaration,
    ) -> Result<Vec<DynamicObject>> {
        let mut objects = chart
            .render(
                &declaration.name,
                &declaration.namespace,
                &declaration.values,
            )
            .context(RenderReleaseSnafu {
                release: &declaration.name,
            })?;

        for object in &mut objects {
            if object.metadata.namespace.is_some() {
                continue;
            }
            let Some(type_meta) = &object.types else {
                continue;
            };
            let namespaced = self
                .cluster
                .is_namespaced(&crate::manifest::gvk_of(type_meta))
                .await
                .context(ClusterSnafu {
                    release: &declaration.name,
                })?;
            if namespaced {
                object.metadata.namespace = Some(declaration.namespace.clone());
            }
        }

        Ok(objects)
    }

    /// Creates the release namespace when it does not exist yet. A create
    /// race with another worker is benign.
    async fn ensure_namespace(&self, namespace: &str) -> Result<()> {
        let object = DynamicObject {
            types: Some(kube::core::TypeMeta {
                api_version: "v1".to_owned(),
                kind: "Namespace".to_owned(),
            }),
            metadata: kube::core::ObjectMeta {
                name: Some(namespace.to_owned()),
                ..kube::core::ObjectMeta::default()
            },
            data: Value::Object(serde_json::Map::new()),
        };
        let handle = ObjectHandle::from_object(&object).context(ClusterSnafu {
            release: namespace,
        })?;

        match self.cluster.get(&handle).await {
            Ok(_) => return Ok(()),
            Err(error) if error.is_not_found() => {}
            Err(error) => return Err(error).context(ClusterSnafu { release: namespace }),
        }

        match self
            .cluster
            .apply(&object, self.applier.field_manager(), ApplyOptions::default())
            .await
        {
            Ok(_) => Ok(()),
            Err(error) if error.is_already_exists() => Ok(()),
            Err(error) => Err(error).context(ClusterSnafu { release: namespace }),
        }
    }

    fn release_item(declaration: &ReleaseDeclaration) -> InventoryItem {
        InventoryItem::Release(ReleaseItem {
            name: declaration.name.clone(),
            namespace: declaration.namespace.clone(),
        })
    }

    async fn persist_observed(&self, observed: &ObservedRelease) -> Result<()> {
        let payload = serde_json::to_vec(observed).context(EncodeObservedSnafu {
            release: &observed.name,
        })?;
        let item = InventoryItem::Release(ReleaseItem {
            name: observed.name.clone(),
            namespace: observed.namespace.clone(),
        });

        self.inventory
            .store(&item, Some(&payload))
            .await
            .context(ObservedPayloadSnafu {
                release: &observed.name,
            })
    }

    async fn read_observed(
        &self,
        declaration: &ReleaseDeclaration,
    ) -> Result<Option<ObservedRelease>> {
        let item = Self::release_item(declaration);
        let Some(payload) = self
            .inventory
            .read_payload(&item)
            .await
            .context(ObservedPayloadSnafu {
                release: &declaration.name,
            })?
        else {
            return Ok(None);
        };

        serde_json::from_slice(&payload)
            .map(Some)
            .context(ParseObservedSnafu {
                release: &declaration.name,
            })
    }
}
