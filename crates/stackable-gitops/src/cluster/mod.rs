//! The typed interface to the cluster.
//!
//! [`ClusterApi`] is the capability surface the rest of the engine programs
//! against: server-side apply, merge patch, get, delete, scope lookup and
//! discovery invalidation over unstructured objects. [`KubeCluster`] is the
//! production implementation on top of a [`kube::Client`] with a cached,
//! discovery-backed kind-to-resource mapping.
//!
//! All methods are safe to call from many workers in parallel. The only
//! shared mutable state is the discovery cache, which is refreshed under a
//! write lock after a `CustomResourceDefinition` is introduced.

use std::{sync::LazyLock, time::Duration};

use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    Client,
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{DynamicObject, GroupVersionKind},
    discovery::{ApiCapabilities, ApiResource, Discovery, Scope},
};
use regex::Regex;
use snafu::{OptionExt, Snafu};
use tokio::{sync::RwLock, time::Instant};
use tracing::debug;

use crate::manifest::{FieldPath, gvk_of};

type Result<T, E = ClusterError> = std::result::Result<T, E>;

/// How long a CRD may take to report `Established=True` after it was applied.
const CRD_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);
const CRD_ESTABLISH_POLL_INTERVAL: Duration = Duration::from_secs(1);

pub const CRD_KIND: &str = "CustomResourceDefinition";

/// Matches the JSON-path-like field references in server-side apply conflict
/// messages, for example `.spec.template.spec.dnsPolicy`. The reference is
/// always preceded by whitespace, which keeps dotted API groups (like
/// `networking.k8s.io/v1`) out of the match.
static CONFLICT_FIELD_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:^|\s)(\.[A-Za-z0-9_\-./\[\]"=]+)"#).expect("conflict field regex is valid")
});

#[derive(Debug, Snafu)]
pub enum ClusterError {
    #[snafu(display("object {name:?} was not found"))]
    NotFound { name: String },

    #[snafu(display("field ownership conflict: {message}"))]
    Conflict {
        fields: Vec<FieldPath>,
        message: String,
    },

    #[snafu(display("object {name:?} already exists"))]
    AlreadyExists { name: String },

    #[snafu(display("timed out {operation} after {after:?}"))]
    Timeout { operation: String, after: Duration },

    #[snafu(display("object defines no metadata.name"))]
    MissingObjectName,

    #[snafu(display("object defines no apiVersion or kind"))]
    MissingTypeMeta,

    #[snafu(display("the api server does not serve {gvk:?}"))]
    UnknownKind { gvk: GroupVersionKind },

    #[snafu(display("cluster request failed"))]
    Unknown {
        #[snafu(source(from(kube::Error, Box::new)))]
        source: Box<kube::Error>,
    },
}

impl ClusterError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, ClusterError::Conflict { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, ClusterError::AlreadyExists { .. })
    }

    /// The conflicting field paths, when this is a conflict.
    pub fn conflict_fields(&self) -> Option<&[FieldPath]> {
        match self {
            ClusterError::Conflict { fields, .. } => Some(fields),
            _ => None,
        }
    }
}

/// The cluster coordinates of one object: kind, name and (where applicable)
/// namespace.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ObjectHandle {
    pub gvk: GroupVersionKind,
    pub name: String,
    pub namespace: Option<String>,
}

impl ObjectHandle {
    pub fn from_object(object: &DynamicObject) -> Result<Self> {
        let type_meta = object.types.as_ref().context(MissingTypeMetaSnafu)?;
        let name = object
            .metadata
            .name
            .clone()
            .context(MissingObjectNameSnafu)?;

        Ok(Self {
            gvk: gvk_of(type_meta),
            name,
            namespace: object.metadata.namespace.clone(),
        })
    }
}

/// Options for a server-side apply request.
#[derive(Clone, Copy, Debug, Default)]
pub struct ApplyOptions {
    /// Let the API server evaluate the request without persisting it.
    pub dry_run: bool,

    /// Take ownership of fields currently owned by other field managers
    /// instead of failing with a conflict.
    pub force: bool,
}

/// The capability surface the engine needs from a cluster.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Server-side apply: declares ownership of every field in `object` under
    /// `field_manager` and returns the server's view of the object.
    async fn apply(
        &self,
        object: &DynamicObject,
        field_manager: &str,
        options: ApplyOptions,
    ) -> Result<DynamicObject>;

    /// Strategic-merge-free partial update via a JSON merge patch.
    async fn patch_merge(
        &self,
        handle: &ObjectHandle,
        patch: &serde_json::Value,
        field_manager: &str,
    ) -> Result<DynamicObject>;

    async fn get(&self, handle: &ObjectHandle) -> Result<DynamicObject>;

    async fn delete(&self, handle: &ObjectHandle) -> Result<()>;

    /// Whether the kind is namespace-scoped, according to the REST mapping.
    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool>;

    /// Drops the cached kind-to-resource mapping. The next lookup rebuilds it
    /// from discovery.
    async fn invalidate_discovery(&self);
}

/// Production [`ClusterApi`] backed by a [`kube::Client`].
pub struct KubeCluster {
    client: Client,
    discovery: RwLock<Option<Discovery>>,
}

impl KubeCluster {
    /// Connects the cluster interface and runs an initial discovery.
    pub async fn new(client: Client) -> Result<Self> {
        let discovery = Discovery::new(client.clone())
            .run()
            .await
            .map_err(|source| ClusterError::Unknown {
                source: Box::new(source),
            })?;

        Ok(Self {
            client,
            discovery: RwLock::new(Some(discovery)),
        })
    }

    /// Resolves a GVK against the cached mapping, rebuilding the cache once
    /// if the kind is not (or no longer) known.
    async fn resolve(&self, gvk: &GroupVersionKind) -> Result<(ApiResource, ApiCapabilities)> {
        {
            let cache = self.discovery.read().await;
            if let Some(discovery) = cache.as_ref() {
                if let Some(found) = discovery.resolve_gvk(gvk) {
                    return Ok(found);
                }
            }
        }

        let mut cache = self.discovery.write().await;
        // Another worker may have refreshed the cache while we waited for the
        // write lock.
        if let Some(discovery) = cache.as_ref() {
            if let Some(found) = discovery.resolve_gvk(gvk) {
                return Ok(found);
            }
        }

        debug!(k8s.gvk = ?gvk, "rebuilding kind-to-resource mapping from discovery");
        let refreshed = Discovery::new(self.client.clone())
            .run()
            .await
            .map_err(|source| ClusterError::Unknown {
                source: Box::new(source),
            })?;
        let found = refreshed.resolve_gvk(gvk);
        *cache = Some(refreshed);

        found.context(UnknownKindSnafu { gvk: gvk.clone() })
    }

    fn api_for(
        &self,
        resource: &ApiResource,
        capabilities: &ApiCapabilities,
        namespace: Option<&str>,
    ) -> Api<DynamicObject> {
        if capabilities.scope == Scope::Namespaced {
            Api::namespaced_with(
                self.client.clone(),
                namespace.unwrap_or("default"),
                resource,
            )
        } else {
            Api::all_with(self.client.clone(), resource)
        }
    }

    /// Polls the applied CRD until it reports `Established=True`. A missing
    /// status or condition list counts as "not yet established".
    async fn await_crd_established(&self, name: &str) -> Result<()> {
        let api: Api<DynamicObject> = Api::all_with(
            self.client.clone(),
            &ApiResource::erase::<CustomResourceDefinition>(&()),
        );

        let started = Instant::now();
        loop {
            match api.get(name).await {
                Ok(crd) => {
                    if crd_is_established(&crd) {
                        return Ok(());
                    }
                }
                // The apply has gone through, but the CRD may not be readable
                // yet.
                Err(kube::Error::Api(response)) if response.code == 404 => {}
                Err(error) => return Err(categorize(error, name)),
            }

            if started.elapsed() >= CRD_ESTABLISH_TIMEOUT {
                return TimeoutSnafu {
                    operation: format!("waiting for CustomResourceDefinition {name:?}"),
                    after: CRD_ESTABLISH_TIMEOUT,
                }
                .fail();
            }

            tokio::time::sleep(CRD_ESTABLISH_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn apply(
        &self,
        object: &DynamicObject,
        field_manager: &str,
        options: ApplyOptions,
    ) -> Result<DynamicObject> {
        let handle = ObjectHandle::from_object(object)?;
        let (resource, capabilities) = self.resolve(&handle.gvk).await?;
        let api = self.api_for(&resource, &capabilities, handle.namespace.as_deref());

        let mut params = PatchParams::apply(field_manager);
        params.force = options.force;
        params.dry_run = options.dry_run;

        let applied = api
            .patch(&handle.name, &params, &Patch::Apply(object))
            .await
            .map_err(|error| categorize(error, &handle.name))?;

        // Introducing a CRD changes the set of kinds the API server serves.
        // Throw the mapping away and hold off dependents until the new kind
        // is actually usable.
        if handle.gvk.kind == CRD_KIND && !options.dry_run {
            self.invalidate_discovery().await;
            self.await_crd_established(&handle.name).await?;
        }

        Ok(applied)
    }

    async fn patch_merge(
        &self,
        handle: &ObjectHandle,
        patch: &serde_json::Value,
        field_manager: &str,
    ) -> Result<DynamicObject> {
        let (resource, capabilities) = self.resolve(&handle.gvk).await?;
        let api = self.api_for(&resource, &capabilities, handle.namespace.as_deref());

        api.patch(
            &handle.name,
            &PatchParams::apply(field_manager),
            &Patch::Merge(patch),
        )
        .await
        .map_err(|error| categorize(error, &handle.name))
    }

    async fn get(&self, handle: &ObjectHandle) -> Result<DynamicObject> {
        let (resource, capabilities) = self.resolve(&handle.gvk).await?;
        let api = self.api_for(&resource, &capabilities, handle.namespace.as_deref());

        api.get(&handle.name)
            .await
            .map_err(|error| categorize(error, &handle.name))
    }

    async fn delete(&self, handle: &ObjectHandle) -> Result<()> {
        let (resource, capabilities) = self.resolve(&handle.gvk).await?;
        let api = self.api_for(&resource, &capabilities, handle.namespace.as_deref());

        api.delete(&handle.name, &DeleteParams::default())
            .await
            .map(|_| ())
            .map_err(|error| categorize(error, &handle.name))
    }

    async fn is_namespaced(&self, gvk: &GroupVersionKind) -> Result<bool> {
        let (_, capabilities) = self.resolve(gvk).await?;
        Ok(capabilities.scope == Scope::Namespaced)
    }

    async fn invalidate_discovery(&self) {
        *self.discovery.write().await = None;
    }
}

/// Maps a [`kube::Error`] onto the engine's error taxonomy.
fn categorize(error: kube::Error, name: &str) -> ClusterError {
    match error {
        kube::Error::Api(response) => match (response.code, response.reason.as_str()) {
            (404, _) => ClusterError::NotFound {
                name: name.to_owned(),
            },
            (409, "Conflict") => ClusterError::Conflict {
                fields: parse_conflict_fields(&response.message),
                message: response.message,
            },
            (409, "AlreadyExists") => ClusterError::AlreadyExists {
                name: name.to_owned(),
            },
            _ => ClusterError::Unknown {
                source: Box::new(kube::Error::Api(response)),
            },
        },
        other => ClusterError::Unknown {
            source: Box::new(other),
        },
    }
}

fn parse_conflict_fields(message: &str) -> Vec<FieldPath> {
    let mut fields: Vec<FieldPath> = CONFLICT_FIELD_REGEX
        .captures_iter(message)
        .map(|capture| FieldPath::parse(&capture[1]))
        .filter(|path| !path.is_empty())
        .collect();
    fields.sort();
    fields.dedup();
    fields
}

fn crd_is_established(crd: &DynamicObject) -> bool {
    crd.data
        .get("status")
        .and_then(|status| status.get("conditions"))
        .and_then(|conditions| conditions.as_array())
        .is_some_and(|conditions| {
            conditions.iter().any(|condition| {
                condition.get("type").and_then(|value| value.as_str()) == Some("Established")
                    && condition.get("status").and_then(|value| value.as_str()) == Some("True")
            })
        })
}

#[cfg(test)]
mod tests {
    use kube::core::ErrorResponse;
    use rstest::rstest;

    use super::*;

    fn api_error(code: u16, reason: &str, message: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_owned(),
            message: message.to_owned(),
            reason: reason.to_owned(),
            code,
        })
    }

    #[test]
    fn not_found_is_categorized() {
        let error = categorize(api_error(404, "NotFound", "not found"), "web");
        assert!(error.is_not_found());
    }

    #[test]
    fn already_exists_is_categorized() {
        let error = categorize(api_error(409, "AlreadyExists", "already exists"), "web");
        assert!(error.is_already_exists());
    }

    #[test]
    fn conflict_carries_field_paths() {
        let message = "Apply failed with 1 conflict: conflict with \
                       \"kubectl-client-side-apply\" using apps/v1: .spec.replicas";
        let error = categorize(api_error(409, "Conflict", message), "web");

        assert_eq!(
            error.conflict_fields(),
            Some(&[FieldPath::parse(".spec.replicas")][..])
        );
    }

    #[test]
    fn multiple_conflicts_are_collected() {
        let message = "Apply failed with 2 conflicts: conflicts with \"autoscaler\" using \
                       networking.k8s.io/v1:\n- .spec.replicas\n- .spec.template.spec.dnsPolicy";
        let fields = parse_conflict_fields(message);

        assert_eq!(
            fields,
            vec![
                FieldPath::parse(".spec.replicas"),
                FieldPath::parse(".spec.template.spec.dnsPolicy"),
            ]
        );
    }

    #[test]
    fn dotted_api_groups_are_not_mistaken_for_fields() {
        let fields =
            parse_conflict_fields("conflict with \"other\" using networking.k8s.io/v1: .spec.rules");
        assert_eq!(fields, vec![FieldPath::parse(".spec.rules")]);
    }

    #[rstest]
    #[case::established("{\"type\": \"Established\", \"status\": \"True\"}", true)]
    #[case::not_yet("{\"type\": \"Established\", \"status\": \"False\"}", false)]
    #[case::unrelated("{\"type\": \"NamesAccepted\", \"status\": \"True\"}", false)]
    fn crd_establishment(#[case] condition: &str, #[case] expected: bool) {
        let crd: DynamicObject = serde_json::from_str(&format!(
            "{{
                \"apiVersion\": \"apiextensions.k8s.io/v1\",
                \"kind\": \"CustomResourceDefinition\",
                \"metadata\": {{\"name\": \"tests.example.com\"}},
                \"status\": {{\"conditions\": [{condition}]}}
            }}"
        ))
        .unwrap();

        assert_eq!(crd_is_established(&crd), expected);
    }

    #[test]
    fn missing_status_counts_as_not_established() {
        let crd: DynamicObject = serde_json::from_str(
            "{
                \"apiVersion\": \"apiextensions.k8s.io/v1\",
                \"kind\": \"CustomResourceDefinition\",
                \"metadata\": {\"name\": \"tests.example.com\"}
            }",
        )
        .unwrap();

        assert!(!crd_is_established(&crd));
    }
}
