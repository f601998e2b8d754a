//! Durable release records, the Helm-equivalent session state.
//!
//! The engine keeps one Secret per release in the release's namespace, named
//! `sh.gitops.release.v1.<name>`. Its single data key holds the JSON encoded,
//! revision-ordered history of the release. Keeping the whole history in one
//! object makes pending-state recovery and retention pruning a single
//! read-modify-write against the cluster.

use std::sync::Arc;

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use kube::core::GroupVersionKind;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use snafu::{OptionExt, ResultExt, Snafu};
use strum::Display;

use crate::{
    cluster::{ApplyOptions, ClusterApi, ClusterError, ObjectHandle},
    component::HelmChart,
};

type Result<T, E = Error> = std::result::Result<T, E>;

/// How many revisions a release history retains.
pub const MAX_HISTORY: usize = 5;

const SECRET_NAME_PREFIX: &str = "sh.gitops.release.v1";
const SECRET_DATA_KEY: &str = "release";
const SECRET_TYPE: &str = "gitops.stackable.tech/release.v1";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to access the release record of {release:?}"))]
    Cluster {
        source: ClusterError,
        release: String,
    },

    #[snafu(display("failed to encode the release history of {release:?}"))]
    EncodeHistory {
        source: serde_json::Error,
        release: String,
    },

    #[snafu(display("release record of {release:?} carries no history payload"))]
    MissingHistoryPayload { release: String },

    #[snafu(display("failed to decode the release history of {release:?}"))]
    DecodeHistoryPayload {
        source: base64::DecodeError,
        release: String,
    },

    #[snafu(display("failed to parse the release history of {release:?}"))]
    ParseHistory {
        source: serde_json::Error,
        release: String,
    },
}

/// The lifecycle state of one release revision.
#[derive(Clone, Copy, Debug, Deserialize, Display, Eq, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
#[strum(serialize_all = "kebab-case")]
pub enum ReleaseStatus {
    Deployed,
    Superseded,
    Uninstalling,
    Failed,
    PendingInstall,
    PendingUpgrade,
    PendingRollback,
}

impl ReleaseStatus {
    /// Pending states are left behind by interrupted operations and trigger
    /// recovery on the next reconcile.
    pub fn is_pending(&self) -> bool {
        matches!(
            self,
            ReleaseStatus::PendingInstall
                | ReleaseStatus::PendingUpgrade
                | ReleaseStatus::PendingRollback
        )
    }
}

/// One revision of a release.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRecord {
    pub revision: u32,
    pub status: ReleaseStatus,
    pub chart: HelmChart,
    #[serde(default)]
    pub values: Value,
    /// The rendered multi-document manifest this revision applied. Needed to
    /// undo the release without re-rendering the chart.
    pub manifest: String,
}

/// The revision-ordered history of one release.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
#[serde(transparent)]
pub struct ReleaseHistory {
    records: Vec<ReleaseRecord>,
}

impl ReleaseHistory {
    pub fn records(&self) -> &[ReleaseRecord] {
        &self.records
    }

    pub fn latest(&self) -> Option<&ReleaseRecord> {
        self.records.last()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn next_revision(&self) -> u32 {
        self.latest().map_or(1, |record| record.revision + 1)
    }

    pub fn push(&mut self, record: ReleaseRecord) {
        self.records.push(record);
        self.records.sort_by_key(|record| record.revision);
    }

    /// Marks the given revision as deployed, supersedes every other deployed
    /// revision and prunes the history to [`MAX_HISTORY`] records.
    pub fn promote(&mut self, revision: u32) {
        for record in &mut self.records {
            if record.revision == revision {
                record.status = ReleaseStatus::Deployed;
            } else if record.status == ReleaseStatus::Deployed {
                record.status = ReleaseStatus::Superseded;
            }
        }

        while self.records.len() > MAX_HISTORY {
            self.records.remove(0);
        }
    }

    /// Drops every record left behind in a pending state.
    pub fn drop_pending(&mut self) {
        self.records.retain(|record| !record.status.is_pending());
    }
}

/// Reads and writes release histories through the cluster interface.
pub struct ReleaseStore<C> {
    cluster: Arc<C>,
    field_manager: String,
}

impl<C> ReleaseStore<C>
where
    C: ClusterApi,
{
    pub fn new(cluster: Arc<C>, field_manager: impl Into<String>) -> Self {
        Self {
            cluster,
            field_manager: field_manager.into(),
        }
    }

    /// Loads a release's history. `None` when the release has never been
    /// installed.
    pub async fn load(&self, name: &str, namespace: &str) -> Result<Option<ReleaseHistory>> {
        let secret = match self.cluster.get(&record_handle(name, namespace)).await {
            Ok(secret) => secret,
            Err(error) if error.is_not_found() => return Ok(None),
            Err(error) => return Err(error).context(ClusterSnafu { release: name }),
        };

        let encoded = secret
            .data
            .get("data")
            .and_then(|data| data.get(SECRET_DATA_KEY))
            .and_then(Value::as_str)
            .context(MissingHistoryPayloadSnafu { release: name })?;
        let decoded = BASE64
            .decode(encoded)
            .context(DecodeHistoryPayloadSnafu { release: name })?;
        let history = serde_json::from_slice(&decoded).context(ParseHistorySnafu { release: name })?;

        Ok(Some(history))
    }

    /// Writes a release's history, creating the record Secret if necessary.
    /// The record is exclusively ours, so the apply always forces.
    pub async fn save(&self, name: &str, namespace: &str, history: &ReleaseHistory) -> Result<()> {
        let payload =
            serde_json::to_vec(history).context(EncodeHistorySnafu { release: name })?;

        let secret: kube::core::DynamicObject = serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": {
                "name": record_name(name),
                "namespace": namespace,
                "labels": {
                    "app.kubernetes.io/managed-by": self.field_manager,
                    "gitops.stackable.tech/release-name": name,
                },
            },
            "type": SECRET_TYPE,
            "data": {
                "release": BASE64.encode(payload),
            },
        }))
        .context(EncodeHistorySnafu { release: name })?;

        self.cluster
            .apply(
                &secret,
                &self.field_manager,
                ApplyOptions {
                    force: true,
                    dry_run: false,
                },
            )
            .await
            .context(ClusterSnafu { release: name })?;

        Ok(())
    }

    /// Removes a release's record Secret. Removing an absent record is fine.
    pub async fn delete(&self, name: &str, namespace: &str) -> Result<()> {
        match self.cluster.delete(&record_handle(name, namespace)).await {
            Ok(()) => Ok(()),
            Err(error) if error.is_not_found() => Ok(()),
            Err(error) => Err(error).context(ClusterSnafu { release: name }),
        }
    }
}

fn record_name(release_name: &str) -> String {
    format!("{SECRET_NAME_PREFIX}.{release_name}")
}

fn record_handle(release_name: &str, namespace: &str) -> ObjectHandle {
    ObjectHandle {
        gvk: GroupVersionKind {
            group: String::new(),
            version: "v1".to_owned(),
            kind: "Secret".to_owned(),
        },
        name: record_name(release_name),
        namespace: Some(namespace.to_owned()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeCluster;

    fn record(revision: u32, status: ReleaseStatus) -> ReleaseRecord {
        ReleaseRecord {
            revision,
            status,
            chart: HelmChart {
                name: "demo".to_owned(),
                repo_url: "https://charts.example.com".to_owned(),
                version: "1.0.0".to_owned(),
            },
            values: Value::Null,
            manifest: String::new(),
        }
    }

    #[test]
    fn promote_supersedes_and_prunes() {
        let mut history = ReleaseHistory::default();
        for revision in 1..=7 {
            history.push(record(revision, ReleaseStatus::Superseded));
        }
        history.push(record(8, ReleaseStatus::PendingUpgrade));

        history.promote(8);

        assert_eq!(history.records().len(), MAX_HISTORY);
        assert_eq!(history.latest().unwrap().revision, 8);
        assert_eq!(history.latest().unwrap().status, ReleaseStatus::Deployed);
        // The oldest revisions were dropped.
        assert_eq!(history.records().first().unwrap().revision, 4);
    }

    #[test]
    fn promote_supersedes_the_previous_deployment() {
        let mut history = ReleaseHistory::default();
        history.push(record(1, ReleaseStatus::Deployed));
        history.push(record(2, ReleaseStatus::PendingUpgrade));

        history.promote(2);

        assert_eq!(history.records()[0].status, ReleaseStatus::Superseded);
        assert_eq!(history.records()[1].status, ReleaseStatus::Deployed);
    }

    #[test]
    fn drop_pending_only_drops_pending() {
        let mut history = ReleaseHistory::default();
        history.push(record(1, ReleaseStatus::Superseded));
        history.push(record(2, ReleaseStatus::Deployed));
        history.push(record(3, ReleaseStatus::PendingUpgrade));

        history.drop_pending();

        assert_eq!(history.records().len(), 2);
        assert_eq!(history.latest().unwrap().revision, 2);
        assert_eq!(history.next_revision(), 3);
    }

    #[tokio::test]
    async fn history_round_trips_through_the_record_secret() {
        let cluster = Arc::new(FakeCluster::default());
        let store = ReleaseStore::new(cluster.clone(), "controller");

        assert_eq!(store.load("demo", "apps").await.unwrap(), None);

        let mut history = ReleaseHistory::default();
        history.push(record(1, ReleaseStatus::Deployed));
        store.save("demo", "apps", &history).await.unwrap();

        let loaded = store.load("demo", "apps").await.unwrap().unwrap();
        assert_eq!(loaded, history);

        let secret = cluster
            .object("Secret", Some("apps"), "sh.gitops.release.v1.demo")
            .unwrap();
        assert_eq!(secret.data["type"], json!(SECRET_TYPE));

        store.delete("demo", "apps").await.unwrap();
        // Deleting again is silent.
        store.delete("demo", "apps").await.unwrap();
        assert_eq!(store.load("demo", "apps").await.unwrap(), None);
    }
}
