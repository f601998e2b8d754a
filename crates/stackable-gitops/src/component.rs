//! Components, the nodes of the desired-state graph.
//!
//! A component is either a plain Kubernetes [`Manifest`] or the declaration
//! of a Helm chart release. Component ids double as inventory item ids: they
//! derive from the cluster identity of the component, so a desired-state
//! node and the inventory record it produces always agree.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{ResultExt, Snafu};

use crate::{
    inventory::{InventoryItem, ManifestItem, ReleaseItem},
    manifest::{self, Manifest},
};

type Result<T, E = Error> = std::result::Result<T, E>;

const DEFAULT_RELEASE_NAMESPACE: &str = "default";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("manifest component is not addressable"))]
    UnaddressableManifest { source: manifest::Error },

    #[snafu(display("helm release declares neither a name nor a chart name"))]
    UnnamedRelease,
}

/// Coordinates of a Helm chart: which chart, from where, in which version.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HelmChart {
    pub name: String,
    pub repo_url: String,
    pub version: String,
}

/// The desired state of one Helm release.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseDeclaration {
    pub name: String,
    pub namespace: String,
    pub chart: HelmChart,
    #[serde(default)]
    pub values: Value,
}

/// A manifest node together with its explicit dependencies.
#[derive(Clone, Debug)]
pub struct ManifestComponent {
    manifest: Manifest,
    dependencies: Vec<String>,
    item: ManifestItem,
}

impl ManifestComponent {
    /// Wraps a manifest. Fails when the manifest misses the metadata which
    /// makes it addressable on the cluster (name, apiVersion, kind).
    pub fn new(manifest: Manifest, dependencies: Vec<String>) -> Result<Self> {
        let name = manifest
            .name()
            .context(UnaddressableManifestSnafu)?
            .to_owned();
        let gvk = manifest.gvk().context(UnaddressableManifestSnafu)?;

        let item = ManifestItem {
            name,
            namespace: manifest.namespace().map(ToOwned::to_owned),
            kind: gvk.kind,
            group: gvk.group,
            version: gvk.version,
        };

        Ok(Self {
            manifest,
            dependencies,
            item,
        })
    }

    pub fn manifest(&self) -> &Manifest {
        &self.manifest
    }

    pub fn item(&self) -> &ManifestItem {
        &self.item
    }
}

/// A release node together with its explicit dependencies.
#[derive(Clone, Debug)]
pub struct ReleaseComponent {
    release: ReleaseDeclaration,
    dependencies: Vec<String>,
}

impl ReleaseComponent {
    /// Wraps a release declaration, filling in the defaults: an empty release
    /// name falls back to the chart name, an empty namespace to `default`.
    pub fn new(mut release: ReleaseDeclaration, dependencies: Vec<String>) -> Result<Self> {
        if release.name.is_empty() {
            if release.chart.name.is_empty() {
                return UnnamedReleaseSnafu.fail();
            }
            release.name.clone_from(&release.chart.name);
        }
        if release.namespace.is_empty() {
            release.namespace = DEFAULT_RELEASE_NAMESPACE.to_owned();
        }

        Ok(Self {
            release,
            dependencies,
        })
    }

    pub fn release(&self) -> &ReleaseDeclaration {
        &self.release
    }

    pub fn item(&self) -> ReleaseItem {
        ReleaseItem {
            name: self.release.name.clone(),
            namespace: self.release.namespace.clone(),
        }
    }
}

/// A node in the desired-state graph.
///
/// This is a closed sum type. All dispatch happens by variant, the engine
/// never probes payload types at runtime.
#[derive(Clone, Debug)]
pub enum Component {
    Manifest(ManifestComponent),
    HelmRelease(ReleaseComponent),
}

impl Component {
    /// The stable component id. Identical to the id of the inventory item
    /// the component produces when applied.
    pub fn id(&self) -> String {
        match self {
            Component::Manifest(component) => component.item().id(),
            Component::HelmRelease(component) => component.item().id(),
        }
    }

    pub fn dependencies(&self) -> &[String] {
        match self {
            Component::Manifest(component) => &component.dependencies,
            Component::HelmRelease(component) => &component.dependencies,
        }
    }

    pub fn inventory_item(&self) -> InventoryItem {
        match self {
            Component::Manifest(component) => InventoryItem::Manifest(component.item().clone()),
            Component::HelmRelease(component) => InventoryItem::Release(component.item()),
        }
    }
}
