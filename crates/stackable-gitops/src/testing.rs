//! In-memory test doubles shared by the unit tests.
//!
//! [`FakeCluster`] implements [`ClusterApi`] over a plain map and simulates
//! the parts of server-side apply the engine depends on: field ownership
//! tracking through managed-fields entries, conflict detection against
//! foreign owners, force semantics and merge patches. Every call is recorded
//! so tests can assert on request sequences.

use std::{
    collections::BTreeMap,
    path::Path,
    sync::{
        Mutex,
        atomic::{AtomicUsize, Ordering},
    },
};

use async_trait::async_trait;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{FieldsV1, ManagedFieldsEntry};
use kube::core::{DynamicObject, GroupVersionKind};
use serde_json::{Value, json};

use crate::{
    apply::union_fields,
    cluster::{ApplyOptions, ClusterApi, ClusterError, ObjectHandle},
    manifest::FieldPath,
};

const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "ClusterRole",
    "ClusterRoleBinding",
    "CustomResourceDefinition",
];

#[derive(Clone, Debug)]
pub(crate) enum Op {
    Get {
        kind: String,
        name: String,
    },
    Apply {
        kind: String,
        name: String,
        field_manager: String,
        force: bool,
        dry_run: bool,
    },
    PatchMerge {
        kind: String,
        name: String,
    },
    Delete {
        kind: String,
        name: String,
    },
}

#[derive(Debug, Default)]
pub(crate) struct FakeCluster {
    objects: Mutex<BTreeMap<String, DynamicObject>>,
    ops: Mutex<Vec<Op>>,
    invalidations: AtomicUsize,
    broken_names: Mutex<Vec<String>>,
}

impl FakeCluster {
    /// Stores an object without recording an operation, with a single
    /// managed-fields entry derived from its data tree per given manager.
    pub(crate) fn seed_with_managers(
        &self,
        object: DynamicObject,
        managers: Vec<ManagedFieldsEntry>,
    ) {
        let mut object = object;
        object.metadata.managed_fields = Some(managers);
        let key = self.key_of(&object);
        self.objects.lock().unwrap().insert(key, object);
    }

    pub(crate) fn seed(&self, object: DynamicObject) {
        let managers = vec![manager_entry("seed", value_to_fields_tree(&object.data))];
        self.seed_with_managers(object, managers);
    }

    pub(crate) fn object(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Option<DynamicObject> {
        self.objects
            .lock()
            .unwrap()
            .get(&key(kind, namespace, name))
            .cloned()
    }

    pub(crate) fn managed_fields(
        &self,
        kind: &str,
        namespace: Option<&str>,
        name: &str,
    ) -> Vec<ManagedFieldsEntry> {
        self.object(kind, namespace, name)
            .and_then(|object| object.metadata.managed_fields)
            .unwrap_or_default()
    }

    /// Every apply of an object with this name fails with an opaque server
    /// error from now on.
    pub(crate) fn break_applies_of(&self, name: &str) {
        self.broken_names.lock().unwrap().push(name.to_owned());
    }

    pub(crate) fn ops(&self) -> Vec<Op> {
        self.ops.lock().unwrap().clone()
    }

    fn key_of(&self, object: &DynamicObject) -> String {
        let kind = object
            .types
            .as_ref()
            .map(|type_meta| type_meta.kind.clone())
            .unwrap_or_default();
        let namespace = if kind_is_namespaced(&kind) {
            Some(
                object
                    .metadata
                    .namespace
                    .clone()
                    .unwrap_or_else(|| "default".to_owned()),
            )
        } else {
            None
        };
        key(&kind, namespace.as_deref(), object.metadata.name.as_deref().unwrap_or_default())
    }

    fn record(&self, op: Op) {
        self.ops.lock().unwrap().push(op);
    }
}

fn key(kind: &str, namespace: Option<&str>, name: &str) -> String {
    format!(
        "{kind}|{namespace}|{name}",
        namespace = namespace.unwrap_or_default()
    )
}

fn kind_is_namespaced(kind: &str) -> bool {
    !CLUSTER_SCOPED_KINDS.contains(&kind)
}

fn handle_key(handle: &ObjectHandle) -> String {
    let namespace = if kind_is_namespaced(&handle.gvk.kind) {
        Some(handle.namespace.as_deref().unwrap_or("default"))
    } else {
        None
    };
    key(&handle.gvk.kind, namespace, &handle.name)
}

#[async_trait]
impl ClusterApi for FakeCluster {
    async fn apply(
        &self,
        object: &DynamicObject,
        field_manager: &str,
        options: ApplyOptions,
    ) -> Result<DynamicObject, ClusterError> {
        let handle = ObjectHandle::from_object(object)?;
        self.record(Op::Apply {
            kind: handle.gvk.kind.clone(),
            name: handle.name.clone(),
            field_manager: field_manager.to_owned(),
            force: options.force,
            dry_run: options.dry_run,
        });

        if self.broken_names.lock().unwrap().contains(&handle.name) {
            return Err(ClusterError::Unknown {
                source: Box::new(kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".to_owned(),
                    message: "the server is on fire".to_owned(),
                    reason: "InternalError".to_owned(),
                    code: 500,
                })),
            });
        }

        let key = handle_key(&handle);
        let mut objects = self.objects.lock().unwrap();

        let Some(current) = objects.get(&key).cloned() else {
            if options.dry_run {
                return Ok(object.clone());
            }
            let mut created = object.clone();
            created.metadata.managed_fields = Some(vec![manager_entry(
                field_manager,
                value_to_fields_tree(&object.data),
            )]);
            objects.insert(key, created.clone());
            return Ok(created);
        };

        let declared = value_leaf_paths(&object.data);
        let foreign: Vec<FieldPath> = declared
            .iter()
            .filter(|path| {
                current
                    .metadata
                    .managed_fields
                    .iter()
                    .flatten()
                    .filter(|entry| entry.subresource.is_none())
                    .filter(|entry| entry.manager.as_deref() != Some(field_manager))
                    .any(|entry| {
                        entry
                            .fields_v1
                            .as_ref()
                            .is_some_and(|fields| fields_tree_contains(&fields.0, path))
                    })
            })
            .cloned()
            .collect();

        if !options.force && !foreign.is_empty() {
            let listing = foreign
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("\n- ");
            return Err(ClusterError::Conflict {
                fields: foreign,
                message: format!("Apply failed with conflicts:\n- {listing}"),
            });
        }

        let mut merged = current.clone();
        deep_merge(&mut merged.data, &object.data);

        if options.dry_run {
            return Ok(merged);
        }

        let mut entries = current.metadata.managed_fields.clone().unwrap_or_default();
        if options.force {
            for entry in entries
                .iter_mut()
                .filter(|entry| entry.manager.as_deref() != Some(field_manager))
            {
                if let Some(fields) = &mut entry.fields_v1 {
                    for path in &declared {
                        remove_fields_tree_path(&mut fields.0, path);
                    }
                }
            }
        }
        let incoming_tree = value_to_fields_tree(&object.data);
        match entries
            .iter_mut()
            .find(|entry| entry.manager.as_deref() == Some(field_manager))
        {
            Some(own) => {
                let mut fields = own
                    .fields_v1
                    .take()
                    .map(|fields| fields.0)
                    .unwrap_or_else(|| json!({}));
                union_fields(&mut fields, &incoming_tree);
                own.fields_v1 = Some(FieldsV1(fields));
            }
            None => entries.push(manager_entry(field_manager, incoming_tree)),
        }
        merged.metadata.managed_fields = Some(entries);

        objects.insert(key, merged.clone());
        Ok(merged)
    }

    async fn patch_merge(
        &self,
        handle: &ObjectHandle,
        patch: &Value,
        _field_manager: &str,
    ) -> Result<DynamicObject, ClusterError> {
        self.record(Op::PatchMerge {
            kind: handle.gvk.kind.clone(),
            name: handle.name.clone(),
        });

        let key = handle_key(handle);
        let mut objects = self.objects.lock().unwrap();
        let Some(current) = objects.get(&key) else {
            return Err(ClusterError::NotFound {
                name: handle.name.clone(),
            });
        };

        let mut value = serde_json::to_value(current).map_err(|_| ClusterError::NotFound {
            name: handle.name.clone(),
        })?;
        merge_patch(&mut value, patch);
        let patched: DynamicObject =
            serde_json::from_value(value).map_err(|_| ClusterError::NotFound {
                name: handle.name.clone(),
            })?;

        objects.insert(key, patched.clone());
        Ok(patched)
    }

    async fn get(&self, handle: &ObjectHandle) -> Result<DynamicObject, ClusterError> {
        self.record(Op::Get {
            kind: handle.gvk.kind.clone(),
            name: handle.name.clone(),
        });

        self.objects
            .lock()
            .unwrap()
            .get(&handle_key(handle))
            .cloned()
            .ok_or_else(|| ClusterError::NotFound {
                name: handle.name.clone(),
            })
    }

    async fn delete(&self, handle: &ObjectHandle) -> Result<(), ClusterError> {
        self.record(Op::Delete {
            kind: handle.gvk.kind.clone(),
            name: handle.name.clone(),
        });

        self.objects
            .lock()
            .unwrap()
            .remove(&handle_key(handle))
            .map(|_| ())
            .ok_or_else(|| ClusterError::NotFound {
                name: handle.name.clone(),
            })
    }

    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool, ClusterError> {
        Ok(kind_is_namespaced(&gvk.kind))
    }

    async fn invalidate_discovery(&self) {
        self.invalidations.fetch_add(1, Ordering::SeqCst);
    }
}

/// A managed-fields entry for `manager` owning the given FieldsV1 tree.
pub(crate) fn manager_entry(manager: &str, fields: Value) -> ManagedFieldsEntry {
    ManagedFieldsEntry {
        api_version: Some("v1".to_owned()),
        fields_type: Some("FieldsV1".to_owned()),
        fields_v1: Some(FieldsV1(fields)),
        manager: Some(manager.to_owned()),
        operation: Some("Apply".to_owned()),
        ..ManagedFieldsEntry::default()
    }
}

/// Builds a FieldsV1 path-set tree (`f:` prefixed keys) from dotted paths.
pub(crate) fn fields_tree(paths: &[&str]) -> Value {
    let mut tree = json!({});
    for path in paths {
        let mut current = &mut tree;
        for segment in FieldPath::parse(path).segments() {
            let map = current.as_object_mut().expect("tree nodes are objects");
            current = map
                .entry(format!("f:{segment}"))
                .or_insert_with(|| json!({}));
        }
    }
    tree
}

fn value_to_fields_tree(value: &Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut tree = serde_json::Map::new();
            for (key, child) in map {
                tree.insert(format!("f:{key}"), value_to_fields_tree(child));
            }
            Value::Object(tree)
        }
        _ => json!({}),
    }
}

fn value_leaf_paths(value: &Value) -> Vec<FieldPath> {
    fn walk(value: &Value, prefix: &mut Vec<String>, out: &mut Vec<FieldPath>) {
        match value {
            Value::Object(map) if !map.is_empty() => {
                for (key, child) in map {
                    prefix.push(key.clone());
                    walk(child, prefix, out);
                    prefix.pop();
                }
            }
            _ => {
                if !prefix.is_empty() {
                    out.push(FieldPath::new(prefix.iter().cloned()));
                }
            }
        }
    }

    let mut out = Vec::new();
    walk(value, &mut Vec::new(), &mut out);
    out
}

fn fields_tree_contains(tree: &Value, path: &FieldPath) -> bool {
    let mut current = tree;
    for segment in path.segments() {
        match current.get(format!("f:{segment}")) {
            Some(child) => current = child,
            None => return false,
        }
    }
    true
}

fn remove_fields_tree_path(tree: &mut Value, path: &FieldPath) {
    let segments: Vec<String> = path.segments().map(|segment| format!("f:{segment}")).collect();
    let Some((leaf, parents)) = segments.split_last() else {
        return;
    };

    let mut current = tree;
    for segment in parents {
        match current.get_mut(segment) {
            Some(next) => current = next,
            None => return,
        }
    }
    if let Value::Object(map) = current {
        map.remove(leaf);
    }
}

fn deep_merge(target: &mut Value, other: &Value) {
    match (target, other) {
        (Value::Object(target_map), Value::Object(other_map)) => {
            for (key, value) in other_map {
                match target_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, other) => *target = other.clone(),
    }
}

/// RFC 7386 style merge: objects merge recursively, `null` deletes, anything
/// else replaces.
fn merge_patch(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target_map), Value::Object(patch_map)) => {
            for (key, value) in patch_map {
                if value.is_null() {
                    target_map.remove(key);
                } else if let Some(existing) = target_map.get_mut(key) {
                    if existing.is_object() && value.is_object() {
                        merge_patch(existing, value);
                    } else {
                        target_map.insert(key.clone(), value.clone());
                    }
                } else {
                    target_map.insert(key.clone(), value.clone());
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}

/// Writes an unpacked chart fixture the way the fetcher lays charts out on
/// disk: `<root>/<name>-<version>/<name>/{Chart.yaml,values.yaml,templates/}`.
pub(crate) fn chart_fixture(
    root: &Path,
    name: &str,
    version: &str,
    values: &str,
    templates: &[(&str, &str)],
) -> std::path::PathBuf {
    let chart_dir = root.join(format!("{name}-{version}")).join(name);
    eprintln!("DEBUG chart_fixture writing to {:?}", chart_dir);
    let templates_dir = chart_dir.join("templates");
    std::fs::create_dir_all(&templates_dir).unwrap();

    std::fs::write(
        chart_dir.join("Chart.yaml"),
        format!("apiVersion: v2\nname: {name}\nversion: {version}\n"),
    )
    .unwrap();
    std::fs::write(chart_dir.join("values.yaml"), values).unwrap();
    for (file_name, contents) in templates {
        std::fs::write(templates_dir.join(file_name), contents).unwrap();
    }

    chart_dir
}
