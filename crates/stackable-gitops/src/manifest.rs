//! Dynamic manifests and their sparse field metadata.
//!
//! A [`Manifest`] wraps an arbitrary Kubernetes object together with an
//! optional [`FieldTree`] which mirrors the object's shape and attaches a
//! [`ConflictPolicy`] to individual fields. The applier consults the tree
//! when the API server reports field ownership conflicts.

use std::collections::BTreeMap;
use std::fmt;

use kube::core::{DynamicObject, GroupVersionKind, TypeMeta};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("manifest defines no metadata.name"))]
    MissingName,

    #[snafu(display("manifest defines no apiVersion or kind"))]
    MissingTypeMeta,
}

/// What to do when the API server reports a field ownership conflict on a
/// field during a non-forced server-side apply.
#[derive(Clone, Copy, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConflictPolicy {
    /// Surface the conflict to the caller. This is the behavior for every
    /// field not covered by a metadata tree leaf.
    #[default]
    Surface,

    /// Drop the field from the applied object and leave it to its current
    /// owner.
    Ignore,
}

/// A sparse mirror of a manifest's object tree.
///
/// Branches which are absent resolve to [`ConflictPolicy::Surface`]. A policy
/// only takes effect when a conflict path terminates exactly on a
/// [`FieldTree::Leaf`]; an intermediate node carrying no matching leaf is
/// ignored.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FieldTree {
    Leaf(ConflictPolicy),
    Node(BTreeMap<String, FieldTree>),
}

impl FieldTree {
    /// Resolves the policy for a dotted field path.
    pub fn policy_for(&self, path: &FieldPath) -> ConflictPolicy {
        let mut current = self;
        for segment in path.segments() {
            match current {
                FieldTree::Node(children) => match children.get(segment) {
                    Some(child) => current = child,
                    None => return ConflictPolicy::Surface,
                },
                // The path descends below a leaf, so the leaf does not match.
                FieldTree::Leaf(_) => return ConflictPolicy::Surface,
            }
        }

        match current {
            FieldTree::Leaf(policy) => *policy,
            FieldTree::Node(_) => ConflictPolicy::Surface,
        }
    }
}

/// A field reference in the JSON-path-like notation the API server uses in
/// conflict causes, for example `.spec.template.spec.dnsPolicy`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct FieldPath(Vec<String>);

impl FieldPath {
    pub fn new(segments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Parses a dotted path. A leading dot is optional, empty segments are
    /// skipped.
    pub fn parse(path: &str) -> Self {
        Self(
            path.split('.')
                .filter(|segment| !segment.is_empty())
                .map(ToOwned::to_owned)
                .collect(),
        )
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for segment in &self.0 {
            write!(f, ".{segment}")?;
        }
        Ok(())
    }
}

/// An unstructured Kubernetes object plus its optional field metadata.
#[derive(Clone, Debug)]
pub struct Manifest {
    pub object: DynamicObject,
    pub metadata: Option<FieldTree>,
}

impl Manifest {
    pub fn new(object: DynamicObject) -> Self {
        Self {
            object,
            metadata: None,
        }
    }

    pub fn with_metadata(object: DynamicObject, metadata: FieldTree) -> Self {
        Self {
            object,
            metadata: Some(metadata),
        }
    }

    pub fn name(&self) -> Result<&str> {
        self.object.metadata.name.as_deref().context(MissingNameSnafu)
    }

    pub fn namespace(&self) -> Option<&str> {
        self.object.metadata.namespace.as_deref()
    }

    pub fn type_meta(&self) -> Result<&TypeMeta> {
        self.object.types.as_ref().context(MissingTypeMetaSnafu)
    }

    pub fn gvk(&self) -> Result<GroupVersionKind> {
        let type_meta = self.type_meta()?;
        Ok(gvk_of(type_meta))
    }
}

/// Splits an `apiVersion` like `apps/v1` into its group and version parts.
/// The core group encodes as the empty string.
pub fn gvk_of(type_meta: &TypeMeta) -> GroupVersionKind {
    let (group, version) = match type_meta.api_version.rsplit_once('/') {
        Some((group, version)) => (group.to_owned(), version.to_owned()),
        None => (String::new(), type_meta.api_version.clone()),
    };

    GroupVersionKind {
        group,
        version,
        kind: type_meta.kind.clone(),
    }
}
