//! Resolving and retrieving chart archives.
//!
//! Two transports exist: classic HTTP repositories (an `index.yaml` mapping
//! chart names and versions to tarball URLs) and OCI registries (`oci://`
//! references pulled as `{repository}/{name}:{version}`). Fetched charts are
//! unpacked into a local cache directory keyed `<name>-<version>`; a cache
//! hit skips the network entirely. Concurrent fetches of the same chart may
//! download redundantly, the unpacked result is identical either way.

use std::{
    collections::BTreeMap,
    io::Cursor,
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use oci_distribution::{
    Reference,
    client::{Client as OciClient, ClientConfig as OciClientConfig},
    secrets::RegistryAuth,
};
use semver::Version;
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};
use tar::Archive;
use tracing::{debug, info};
use url::Url;

use crate::component::HelmChart;

type Result<T, E = Error> = std::result::Result<T, E>;

const OCI_SCHEME_PREFIX: &str = "oci://";
const INDEX_FILE: &str = "index.yaml";

/// The media type Helm registries use for the chart content layer.
const HELM_CHART_CONTENT_MEDIA_TYPE: &str = "application/vnd.cncf.helm.chart.content.v1.tar+gzip";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to parse repository url {url:?}"))]
    InvalidRepositoryUrl {
        source: url::ParseError,
        url: String,
    },

    #[snafu(display("failed to download the repository index from {url}"))]
    FetchIndex { source: reqwest::Error, url: Url },

    #[snafu(display("failed to parse the repository index from {url}"))]
    ParseIndex {
        source: serde_yaml::Error,
        url: Url,
    },

    #[snafu(display("repository serves no chart {chart:?} in version {version:?}"))]
    VersionNotFound { chart: String, version: String },

    #[snafu(display("index entry for chart {chart:?} version {version:?} lists no urls"))]
    NoChartUrls { chart: String, version: String },

    #[snafu(display("failed to download chart archive from {url}"))]
    FetchArchive { source: reqwest::Error, url: Url },

    #[snafu(display("invalid oci reference {reference:?}"))]
    InvalidOciReference {
        source: oci_distribution::ParseError,
        reference: String,
    },

    #[snafu(display("failed to pull chart from {reference:?}"))]
    PullOciChart {
        source: oci_distribution::errors::OciDistributionError,
        reference: String,
    },

    #[snafu(display("oci image {reference:?} contains no chart layer"))]
    MissingOciChartLayer { reference: String },

    #[snafu(display("failed to unpack chart archive into {path:?}"))]
    UnpackArchive {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("chart archive did not contain the expected directory {path:?}"))]
    MissingChartDirectory { path: PathBuf },
}

/// A chart repository `index.yaml`.
#[derive(Debug, Deserialize)]
struct RepositoryIndex {
    #[serde(default)]
    entries: BTreeMap<String, Vec<IndexEntry>>,
}

#[derive(Debug, Deserialize)]
struct IndexEntry {
    version: String,
    #[serde(default)]
    urls: Vec<String>,
}

/// Fetches chart archives and caches the unpacked charts on local disk.
pub struct ChartFetcher {
    http: reqwest::Client,
    cache_root: PathBuf,
}

impl ChartFetcher {
    pub fn new(cache_root: impl Into<PathBuf>) -> Self {
        Self {
            http: reqwest::Client::new(),
            cache_root: cache_root.into(),
        }
    }

    pub fn cache_root(&self) -> &Path {
        &self.cache_root
    }

    /// Resolves a chart to its unpacked directory, fetching it on a cache
    /// miss.
    pub async fn fetch(&self, chart: &HelmChart) -> Result<PathBuf> {
        let chart_dir = self.chart_directory(chart);
        eprintln!("DEBUG fetch chart_dir={:?} exists={}", chart_dir, chart_dir.join("Chart.yaml").is_file());
        eprintln!("DEBUG cache_root listing: {:?}", std::fs::read_dir(&self.cache_root).map(|rd| rd.filter_map(|e| e.ok().map(|e| e.path())).collect::<Vec<_>>()));
        if chart_dir.join("Chart.yaml").is_file() {
            debug!(
                helm.chart.name = chart.name,
                helm.chart.version = chart.version,
                "chart cache hit"
            );
            return Ok(chart_dir);
        }

        info!(
            helm.chart.name = chart.name,
            helm.chart.version = chart.version,
            helm.chart.repository = chart.repo_url,
            "fetching chart"
        );

        let destination = self.cache_root.join(version_key(chart));
        if chart.repo_url.starts_with(OCI_SCHEME_PREFIX) {
            self.fetch_oci(chart, &destination).await?;
        } else {
            self.fetch_http(chart, &destination).await?;
        }

        // Retry the read after the fetch.
        if !chart_dir.join("Chart.yaml").is_file() {
            return MissingChartDirectorySnafu { path: chart_dir }.fail();
        }
        Ok(chart_dir)
    }

    fn chart_directory(&self, chart: &HelmChart) -> PathBuf {
        self.cache_root.join(version_key(chart)).join(&chart.name)
    }

    async fn fetch_http(&self, chart: &HelmChart, destination: &Path) -> Result<()> {
        let repository = Url::parse(ensure_trailing_slash(&chart.repo_url).as_str()).context(
            InvalidRepositoryUrlSnafu {
                url: &chart.repo_url,
            },
        )?;
        let index_url = repository
            .join(INDEX_FILE)
            .context(InvalidRepositoryUrlSnafu {
                url: &chart.repo_url,
            })?;

        let index_raw = self
            .http
            .get(index_url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(FetchIndexSnafu {
                url: index_url.clone(),
            })?
            .text()
            .await
            .context(FetchIndexSnafu {
                url: index_url.clone(),
            })?;
        let index: RepositoryIndex =
            serde_yaml::from_str(&index_raw).context(ParseIndexSnafu { url: index_url })?;

        let entry = resolve_entry(&index, chart)?;
        let archive_url = entry
            .urls
            .first()
            .context(NoChartUrlsSnafu {
                chart: &chart.name,
                version: &chart.version,
            })?;
        // Index entries may carry urls relative to the repository root.
        let archive_url = repository
            .join(archive_url)
            .context(InvalidRepositoryUrlSnafu { url: archive_url })?;

        let archive = self
            .http
            .get(archive_url.clone())
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(FetchArchiveSnafu {
                url: archive_url.clone(),
            })?
            .bytes()
            .await
            .context(FetchArchiveSnafu { url: archive_url })?;

        unpack_archive(&archive, destination)
    }

    async fn fetch_oci(&self, chart: &HelmChart, destination: &Path) -> Result<()> {
        let repository = chart.repo_url.trim_start_matches(OCI_SCHEME_PREFIX);
        let reference_raw = format!(
            "{repository}/{name}:{version}",
            repository = repository.trim_end_matches('/'),
            name = chart.name,
            version = chart.version,
        );
        let reference =
            Reference::try_from(reference_raw.as_str()).context(InvalidOciReferenceSnafu {
                reference: &reference_raw,
            })?;

        let mut client = OciClient::new(OciClientConfig::default());
        let image = client
            .pull(
                &reference,
                &RegistryAuth::Anonymous,
                vec![HELM_CHART_CONTENT_MEDIA_TYPE],
            )
            .await
            .context(PullOciChartSnafu {
                reference: &reference_raw,
            })?;

        let layer = image
            .layers
            .into_iter()
            .find(|layer| layer.media_type == HELM_CHART_CONTENT_MEDIA_TYPE)
            .context(MissingOciChartLayerSnafu {
                reference: &reference_raw,
            })?;

        unpack_archive(&layer.data, destination)
    }
}

/// The cache key of one chart version.
fn version_key(chart: &HelmChart) -> String {
    format!(
        "{name}-{version}",
        name = chart.name,
        version = chart.version
    )
}

fn ensure_trailing_slash(url: &str) -> String {
    let mut url = url.trim_end_matches('/').to_owned();
    url.push('/');
    url
}

/// Picks the index entry for the requested version. An empty requested
/// version resolves to the highest semantic version the repository serves.
fn resolve_entry<'a>(index: &'a RepositoryIndex, chart: &HelmChart) -> Result<&'a IndexEntry> {
    let entries = index
        .entries
        .get(&chart.name)
        .context(VersionNotFoundSnafu {
            chart: &chart.name,
            version: &chart.version,
        })?;

    if chart.version.is_empty() {
        return entries
            .iter()
            .filter_map(|entry| {
                Version::parse(&entry.version)
                    .ok()
                    .map(|version| (version, entry))
            })
            .max_by(|(a, _), (b, _)| a.cmp(b))
            .map(|(_, entry)| entry)
            .context(VersionNotFoundSnafu {
                chart: &chart.name,
                version: &chart.version,
            });
    }

    entries
        .iter()
        .find(|entry| entry.version == chart.version)
        .context(VersionNotFoundSnafu {
            chart: &chart.name,
            version: &chart.version,
        })
}

fn unpack_archive(archive: &[u8], destination: &Path) -> Result<()> {
    std::fs::create_dir_all(destination).context(UnpackArchiveSnafu { path: destination })?;
    Archive::new(GzDecoder::new(Cursor::new(archive)))
        .unpack(destination)
        .context(UnpackArchiveSnafu { path: destination })
}
