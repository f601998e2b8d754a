//! The durable registry of everything the engine has applied and therefore
//! owns.
//!
//! The inventory is a flat directory. Every owned item is a single file whose
//! name is the item's storage key and whose contents are the item's payload:
//! empty for plain manifests, the JSON encoded observed release for Helm
//! releases. The storage key grammar is underscore separated:
//!
//! ```text
//! ManifestItem:  <name>_<namespace>_<kind>_<group>_<version>
//! ReleaseItem:   <name>_<namespace>_HelmRelease
//! ```
//!
//! An empty group (the core API group) encodes as an empty segment, which
//! shows up as two adjacent underscores. Kubernetes object names cannot
//! contain underscores, so splitting on `_` is unambiguous. A key with any
//! other arity is a hard load error: refusing to guess beats silently
//! forgetting an owned resource.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use kube::core::{GroupVersionKind, TypeMeta};
use snafu::{ResultExt, Snafu};
use tokio::sync::Mutex;
use tracing::debug;

type Result<T, E = Error> = std::result::Result<T, E>;

const RELEASE_KIND_SUFFIX: &str = "HelmRelease";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to create inventory directory {path:?}"))]
    CreateDirectory {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to read inventory directory {path:?}"))]
    ReadDirectory {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to write inventory item {key:?}"))]
    WriteItem {
        source: std::io::Error,
        key: String,
    },

    #[snafu(display("failed to read inventory item {key:?}"))]
    ReadItem {
        source: std::io::Error,
        key: String,
    },

    #[snafu(display("failed to delete inventory item {key:?}"))]
    DeleteItem {
        source: std::io::Error,
        key: String,
    },

    #[snafu(display("inventory key {key:?} does not match the storage key grammar"))]
    MalformedKey { key: String },
}

/// A plain manifest the engine owns, identified by its cluster coordinates.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ManifestItem {
    pub name: String,
    pub namespace: Option<String>,
    pub kind: String,
    pub group: String,
    pub version: String,
}

impl ManifestItem {
    /// The storage key, which doubles as the item id.
    pub fn id(&self) -> String {
        format!(
            "{name}_{namespace}_{kind}_{group}_{version}",
            name = self.name,
            namespace = self.namespace.as_deref().unwrap_or_default(),
            kind = self.kind,
            group = self.group,
            version = self.version,
        )
    }

    pub fn type_meta(&self) -> TypeMeta {
        TypeMeta {
            api_version: if self.group.is_empty() {
                self.version.clone()
            } else {
                format!("{group}/{version}", group = self.group, version = self.version)
            },
            kind: self.kind.clone(),
        }
    }

    pub fn gvk(&self) -> GroupVersionKind {
        GroupVersionKind {
            group: self.group.clone(),
            version: self.version.clone(),
            kind: self.kind.clone(),
        }
    }
}

/// A Helm release the engine owns.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct ReleaseItem {
    pub name: String,
    pub namespace: String,
}

impl ReleaseItem {
    /// The storage key, which doubles as the item id.
    pub fn id(&self) -> String {
        format!(
            "{name}_{namespace}_{RELEASE_KIND_SUFFIX}",
            name = self.name,
            namespace = self.namespace,
        )
    }
}

/// Anything the engine tracks in its inventory.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum InventoryItem {
    Manifest(ManifestItem),
    Release(ReleaseItem),
}

impl InventoryItem {
    pub fn id(&self) -> String {
        match self {
            InventoryItem::Manifest(item) => item.id(),
            InventoryItem::Release(item) => item.id(),
        }
    }

    /// Parses a storage key back into an item. The key must have exactly the
    /// arity of one of the two grammar rules.
    pub fn parse(key: &str) -> Result<Self> {
        let segments: Vec<&str> = key.split('_').collect();

        match segments.as_slice() {
            [name, namespace, RELEASE_KIND_SUFFIX] if !name.is_empty() => {
                Ok(InventoryItem::Release(ReleaseItem {
                    name: (*name).to_owned(),
                    namespace: (*namespace).to_owned(),
                }))
            }
            [name, namespace, kind, group, version] if !name.is_empty() && !kind.is_empty() => {
                Ok(InventoryItem::Manifest(ManifestItem {
                    name: (*name).to_owned(),
                    namespace: if namespace.is_empty() {
                        None
                    } else {
                        Some((*namespace).to_owned())
                    },
                    kind: (*kind).to_owned(),
                    group: (*group).to_owned(),
                    version: (*version).to_owned(),
                }))
            }
            _ => MalformedKeySnafu { key }.fail(),
        }
    }
}

/// A point-in-time view of the inventory contents, keyed by item id.
#[derive(Clone, Debug, Default)]
pub struct InventorySnapshot {
    items: BTreeMap<String, InventoryItem>,
}

impl InventorySnapshot {
    pub fn items(&self) -> impl Iterator<Item = &InventoryItem> {
        self.items.values()
    }

    pub fn get(&self, id: &str) -> Option<&InventoryItem> {
        self.items.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.items.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// File backed inventory storage.
///
/// Writes and deletes are serialized, [`Inventory::load`] produces lock-free
/// snapshots.
#[derive(Debug)]
pub struct Inventory {
    directory: PathBuf,
    write_lock: Mutex<()>,
}

impl Inventory {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    /// Reads the whole inventory. A single malformed file name fails the
    /// load.
    pub async fn load(&self) -> Result<InventorySnapshot> {
        self.ensure_directory().await?;

        let mut entries = tokio::fs::read_dir(&self.directory)
            .await
            .context(ReadDirectorySnafu {
                path: &self.directory,
            })?;

        let mut items = BTreeMap::new();
        while let Some(entry) = entries.next_entry().await.context(ReadDirectorySnafu {
            path: &self.directory,
        })? {
            let key = entry.file_name().to_string_lossy().into_owned();
            let item = InventoryItem::parse(&key)?;
            items.insert(item.id(), item);
        }

        Ok(InventorySnapshot { items })
    }

    /// Persists an item. The payload is written verbatim; passing `None`
    /// truncates to an empty file, which is the representation of manifest
    /// items.
    pub async fn store(&self, item: &InventoryItem, payload: Option<&[u8]>) -> Result<()> {
        self.ensure_directory().await?;
        let key = item.id();
        let _guard = self.write_lock.lock().await;

        debug!(inventory.key = key, "storing inventory item");
        tokio::fs::write(self.directory.join(&key), payload.unwrap_or_default())
            .await
            .context(WriteItemSnafu { key })
    }

    /// Removes an item. Removing an item which is not present is not an
    /// error.
    pub async fn delete(&self, item: &InventoryItem) -> Result<()> {
        let key = item.id();
        let _guard = self.write_lock.lock().await;

        debug!(inventory.key = key, "deleting inventory item");
        match tokio::fs::remove_file(self.directory.join(&key)).await {
            Ok(()) => Ok(()),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(error) => Err(error).context(DeleteItemSnafu { key }),
        }
    }

    /// Membership test by item id.
    pub async fn has(&self, id: &str) -> bool {
        tokio::fs::try_exists(self.directory.join(id))
            .await
            .unwrap_or(false)
    }

    /// Reads an item's payload. `None` when the item does not exist or has an
    /// empty payload.
    pub async fn read_payload(&self, item: &InventoryItem) -> Result<Option<Vec<u8>>> {
        let key = item.id();
        match tokio::fs::read(self.directory.join(&key)).await {
            Ok(payload) if payload.is_empty() => Ok(None),
            Ok(payload) => Ok(Some(payload)),
            Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error).context(ReadItemSnafu { key }),
        }
    }

    async fn ensure_directory(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.directory)
            .await
            .context(CreateDirectorySnafu {
                path: &self.directory,
            })
    }
}
