//! Field-ownership-aware application of single manifests.
//!
//! A naive server-side apply either loses fields other managers legitimately
//! own or fights them on every re-apply. [`ManifestApplier`] therefore first
//! folds the field sets of known imposter managers (ad-hoc `kubectl` style
//! edits) into its own managed-fields entry, then applies with conflicts
//! enabled, and only for conflicts the manifest explicitly marks as ignorable
//! drops the offending fields and retries with force.

use std::sync::Arc;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::{FieldsV1, ManagedFieldsEntry};
use kube::core::DynamicObject;
use serde_json::{Value, json};
use snafu::{ResultExt, Snafu};
use tracing::debug;

use crate::{
    cluster::{ApplyOptions, ClusterApi, ClusterError, ObjectHandle},
    manifest::{ConflictPolicy, FieldPath, Manifest},
};

type Result<T, E = Error> = std::result::Result<T, E>;

/// Field managers whose entries are treated as ad-hoc human edits. Their
/// claimed fields are folded into the controller's own ownership set.
pub const DEFAULT_IMPOSTER_MANAGERS: &[&str] = &["kubectl", "k9s"];

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(transparent)]
    Cluster { source: ClusterError },

    #[snafu(display("failed to convert object for field pruning"))]
    ConvertObject { source: serde_json::Error },
}

impl Error {
    /// The underlying cluster error classification, if any.
    pub fn as_cluster(&self) -> Option<&ClusterError> {
        match self {
            Error::Cluster { source } => Some(source),
            Error::ConvertObject { .. } => None,
        }
    }
}

/// Applies manifests under a single field manager identity.
pub struct ManifestApplier<C> {
    cluster: Arc<C>,
    field_manager: String,
    imposter_managers: Vec<String>,
}

impl<C> ManifestApplier<C>
where
    C: ClusterApi,
{
    pub fn new(cluster: Arc<C>, field_manager: impl Into<String>) -> Self {
        Self {
            cluster,
            field_manager: field_manager.into(),
            imposter_managers: DEFAULT_IMPOSTER_MANAGERS
                .iter()
                .map(ToString::to_string)
                .collect(),
        }
    }

    /// Replaces the imposter manager substrings.
    pub fn with_imposter_managers(
        mut self,
        managers: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.imposter_managers = managers.into_iter().map(Into::into).collect();
        self
    }

    pub fn field_manager(&self) -> &str {
        &self.field_manager
    }

    /// Applies one manifest and returns the server's post-apply object.
    pub async fn apply(&self, manifest: &Manifest, options: ApplyOptions) -> Result<DynamicObject> {
        let handle = ObjectHandle::from_object(&manifest.object).map_err(Error::from)?;

        let current = match self.cluster.get(&handle).await {
            Ok(current) => current,
            Err(error) if error.is_not_found() => {
                return Ok(self
                    .cluster
                    .apply(&manifest.object, &self.field_manager, options)
                    .await?);
            }
            Err(error) => return Err(error.into()),
        };

        // Dry-run requests must not mutate the ownership record.
        if !options.dry_run {
            self.sanitize_managers(&handle, &current).await?;
        }

        let Some(metadata) = &manifest.metadata else {
            return Ok(self
                .cluster
                .apply(&manifest.object, &self.field_manager, options)
                .await?);
        };

        let strict = ApplyOptions {
            force: false,
            dry_run: options.dry_run,
        };
        match self
            .cluster
            .apply(&manifest.object, &self.field_manager, strict)
            .await
        {
            Ok(applied) => Ok(applied),
            Err(ClusterError::Conflict { fields, message }) => {
                let (ignorable, surfaced): (Vec<_>, Vec<_>) = fields
                    .into_iter()
                    .partition(|field| metadata.policy_for(field) == ConflictPolicy::Ignore);

                if !surfaced.is_empty() {
                    return Err(ClusterError::Conflict {
                        fields: surfaced,
                        message,
                    }
                    .into());
                }

                debug!(
                    k8s.object.name = handle.name,
                    fields = %ignorable.iter().map(ToString::to_string).collect::<Vec<_>>().join(", "),
                    "leaving conflicting fields to their current owners"
                );

                let pruned = prune_fields(&manifest.object, &ignorable)?;
                let forced = ApplyOptions {
                    force: true,
                    dry_run: options.dry_run,
                };
                Ok(self
                    .cluster
                    .apply(&pruned, &self.field_manager, forced)
                    .await?)
            }
            Err(error) => Err(error.into()),
        }
    }

    /// Folds imposter managed-fields entries into the controller's own entry
    /// and patches the cleaned list back. Subresource entries and entries of
    /// other controllers stay untouched.
    async fn sanitize_managers(
        &self,
        handle: &ObjectHandle,
        current: &DynamicObject,
    ) -> Result<()> {
        let Some(entries) = &current.metadata.managed_fields else {
            return Ok(());
        };

        let mut merged_fields: Option<Value> = None;
        let mut found_imposter = false;
        let mut sanitized: Vec<ManagedFieldsEntry> = Vec::with_capacity(entries.len());
        let mut self_template: Option<ManagedFieldsEntry> = None;

        for entry in entries {
            if entry.subresource.is_some() {
                sanitized.push(entry.clone());
                continue;
            }

            let manager = entry.manager.as_deref().unwrap_or_default();
            if manager == self.field_manager {
                if let Some(fields) = &entry.fields_v1 {
                    union_fields(merged_fields.get_or_insert_with(|| json!({})), &fields.0);
                }
                self_template = Some(entry.clone());
            } else if self.is_imposter(manager) {
                found_imposter = true;
                if let Some(fields) = &entry.fields_v1 {
                    union_fields(merged_fields.get_or_insert_with(|| json!({})), &fields.0);
                }
            } else {
                sanitized.push(entry.clone());
            }
        }

        if !found_imposter {
            return Ok(());
        }

        let mut own_entry = self_template.unwrap_or_else(|| ManagedFieldsEntry {
            api_version: current
                .types
                .as_ref()
                .map(|type_meta| type_meta.api_version.clone()),
            fields_type: Some("FieldsV1".to_owned()),
            manager: Some(self.field_manager.clone()),
            operation: Some("Apply".to_owned()),
            ..ManagedFieldsEntry::default()
        });
        own_entry.fields_v1 = merged_fields.map(FieldsV1);
        sanitized.push(own_entry);

        debug!(
            k8s.object.name = handle.name,
            "folding imposter managed-fields entries into own entry"
        );

        let patch = json!({
            "metadata": {
                "managedFields": sanitized,
            }
        });
        self.cluster
            .patch_merge(handle, &patch, &self.field_manager)
            .await?;

        Ok(())
    }

    fn is_imposter(&self, manager: &str) -> bool {
        !manager.is_empty()
            && self
                .imposter_managers
                .iter()
                .any(|imposter| manager.contains(imposter))
    }
}

/// Set-union of two FieldsV1 path-set trees, merged into `target`.
pub(crate) fn union_fields(target: &mut Value, other: &Value) {
    match (target, other) {
        (Value::Object(target_map), Value::Object(other_map)) => {
            for (key, value) in other_map {
                match target_map.get_mut(key) {
                    Some(existing) => union_fields(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        // Leaves carry no information beyond their presence.
        (_, _) => {}
    }
}

/// Returns a copy of the object with the given field paths removed.
fn prune_fields(object: &DynamicObject, paths: &[FieldPath]) -> Result<DynamicObject> {
    let mut value = serde_json::to_value(object).context(ConvertObjectSnafu)?;
    for path in paths {
        remove_path(&mut value, path);
    }
    serde_json::from_value(value).context(ConvertObjectSnafu)
}

fn remove_path(value: &mut Value, path: &FieldPath) {
    let segments: Vec<&str> = path.segments().collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return;
    };

    let mut current = value;
    for segment in parents {
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }

    if let Value::Object(map) = current {
        map.remove(*leaf);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::*;
    use crate::{
        manifest::FieldTree,
        testing::{FakeCluster, Op, fields_tree, manager_entry},
    };

    fn deployment(replicas: u64) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "web",
                "namespace": "default",
            },
            "spec": {
                "replicas": replicas,
                "revisionHistoryLimit": 10,
            },
        }))
        .unwrap()
    }

    fn replicas_ignored() -> FieldTree {
        let mut spec = BTreeMap::new();
        spec.insert(
            "replicas".to_owned(),
            FieldTree::Leaf(ConflictPolicy::Ignore),
        );
        let mut root = BTreeMap::new();
        root.insert("spec".to_owned(), FieldTree::Node(spec));
        FieldTree::Node(root)
    }

    #[tokio::test]
    async fn absent_object_is_created_with_a_single_apply() {
        let cluster = Arc::new(FakeCluster::default());
        let applier = ManifestApplier::new(cluster.clone(), "controller");

        applier
            .apply(&Manifest::new(deployment(3)), ApplyOptions::default())
            .await
            .unwrap();

        let ops = cluster.ops();
        assert!(matches!(ops.as_slice(), [Op::Get { .. }, Op::Apply { .. }]));
    }

    #[tokio::test]
    async fn apply_without_metadata_is_idempotent() {
        let cluster = Arc::new(FakeCluster::default());
        let applier = ManifestApplier::new(cluster.clone(), "controller");
        let manifest = Manifest::new(deployment(3));

        let first = applier
            .apply(&manifest, ApplyOptions::default())
            .await
            .unwrap();
        let second = applier
            .apply(&manifest, ApplyOptions::default())
            .await
            .unwrap();

        assert_eq!(first.data, second.data);
    }

    #[tokio::test]
    async fn conflict_on_ignored_field_is_pruned_and_forced() {
        let cluster = Arc::new(FakeCluster::default());
        // Another controller owns .spec.replicas with a value of 5.
        cluster.seed_with_managers(
            deployment(5),
            vec![manager_entry(
                "horizontal-pod-autoscaler",
                fields_tree(&[".spec.replicas"]),
            )],
        );

        let applier = ManifestApplier::new(cluster.clone(), "controller");
        let manifest = Manifest::with_metadata(deployment(3), replicas_ignored());

        let applied = applier
            .apply(&manifest, ApplyOptions::default())
            .await
            .unwrap();

        // The foreign owner's value survives, the remaining fields are ours.
        assert_eq!(applied.data["spec"]["replicas"], json!(5));
        assert_eq!(applied.data["spec"]["revisionHistoryLimit"], json!(10));

        let applies: Vec<_> = cluster
            .ops()
            .into_iter()
            .filter_map(|op| match op {
                Op::Apply { force, .. } => Some(force),
                _ => None,
            })
            .collect();
        assert_eq!(applies, vec![false, true]);
    }

    #[tokio::test]
    async fn conflict_on_unmarked_field_surfaces() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.seed_with_managers(
            deployment(5),
            vec![manager_entry(
                "horizontal-pod-autoscaler",
                fields_tree(&[".spec.replicas"]),
            )],
        );

        let applier = ManifestApplier::new(cluster.clone(), "controller");
        // The metadata tree exists but covers an unrelated field, so the
        // conflict must not be swallowed.
        let mut spec = BTreeMap::new();
        spec.insert("paused".to_owned(), FieldTree::Leaf(ConflictPolicy::Ignore));
        let mut root = BTreeMap::new();
        root.insert("spec".to_owned(), FieldTree::Node(spec));
        let manifest = Manifest::with_metadata(deployment(3), FieldTree::Node(root));

        let error = applier
            .apply(&manifest, ApplyOptions::default())
            .await
            .unwrap_err();
        assert!(error.as_cluster().is_some_and(ClusterError::is_conflict));
    }

    #[tokio::test]
    async fn imposter_entries_are_folded_into_own_entry() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.seed_with_managers(
            deployment(3),
            vec![
                manager_entry("kubectl-edit", fields_tree(&[".spec.replicas"])),
                manager_entry(
                    "kube-controller-manager",
                    fields_tree(&[".spec.progressDeadlineSeconds"]),
                ),
                manager_entry("controller", fields_tree(&[".spec.template"])),
            ],
        );

        let applier = ManifestApplier::new(cluster.clone(), "controller");
        applier
            .apply(&Manifest::new(deployment(3)), ApplyOptions::default())
            .await
            .unwrap();

        let entries = cluster.managed_fields("Deployment", Some("default"), "web");
        let managers: Vec<_> = entries
            .iter()
            .filter_map(|entry| entry.manager.clone())
            .collect();
        assert_eq!(managers.len(), 2);
        assert!(managers.contains(&"controller".to_owned()));
        assert!(managers.contains(&"kube-controller-manager".to_owned()));

        // The controller entry is enriched with the kubectl-edit paths.
        let own = entries
            .iter()
            .find(|entry| entry.manager.as_deref() == Some("controller"))
            .unwrap();
        let own_fields = &own.fields_v1.as_ref().unwrap().0;
        assert!(own_fields["f:spec"].get("f:replicas").is_some());
        assert!(own_fields["f:spec"].get("f:template").is_some());

        // The legitimate foreign entry is untouched.
        let foreign = entries
            .iter()
            .find(|entry| entry.manager.as_deref() == Some("kube-controller-manager"))
            .unwrap();
        let foreign_fields = &foreign.fields_v1.as_ref().unwrap().0;
        assert!(
            foreign_fields["f:spec"]
                .get("f:progressDeadlineSeconds")
                .is_some()
        );
    }

    #[tokio::test]
    async fn folded_imposters_do_not_conflict_anymore() {
        let cluster = Arc::new(FakeCluster::default());
        // Every recorded manager is an imposter.
        cluster.seed_with_managers(
            deployment(5),
            vec![manager_entry("kubectl-apply", fields_tree(&[".spec.replicas"]))],
        );

        let applier = ManifestApplier::new(cluster.clone(), "controller");
        // No force needed: after folding there is no external owner left.
        applier
            .apply(&Manifest::new(deployment(3)), ApplyOptions::default())
            .await
            .unwrap();

        let object = cluster.object("Deployment", Some("default"), "web").unwrap();
        assert_eq!(object.data["spec"]["replicas"], json!(3));
    }

    #[tokio::test]
    async fn dry_run_does_not_touch_managed_fields() {
        let cluster = Arc::new(FakeCluster::default());
        cluster.seed_with_managers(
            deployment(3),
            vec![manager_entry("kubectl-edit", fields_tree(&[".spec.replicas"]))],
        );

        let applier = ManifestApplier::new(cluster.clone(), "controller");
        applier
            .apply(
                &Manifest::new(deployment(3)),
                ApplyOptions {
                    dry_run: true,
                    force: true,
                },
            )
            .await
            .unwrap();

        assert!(
            !cluster
                .ops()
                .iter()
                .any(|op| matches!(op, Op::PatchMerge { .. }))
        );
    }

    #[test]
    fn fields_union_is_a_deep_set_union() {
        let mut target = json!({"f:spec": {"f:replicas": {}}});
        union_fields(
            &mut target,
            &json!({"f:spec": {"f:template": {"f:metadata": {}}}, "f:status": {}}),
        );

        assert_eq!(
            target,
            json!({
                "f:spec": {"f:replicas": {}, "f:template": {"f:metadata": {}}},
                "f:status": {},
            })
        );
    }

    #[test]
    fn prune_removes_only_the_addressed_leaf() {
        let object = deployment(3);
        let pruned = prune_fields(&object, &[FieldPath::parse(".spec.replicas")]).unwrap();

        assert!(pruned.data["spec"].get("replicas").is_none());
        assert_eq!(pruned.data["spec"]["revisionHistoryLimit"], json!(10));
    }
}
