//! Loading and rendering of unpacked charts.
//!
//! A chart on disk is a directory with a `Chart.yaml`, an optional
//! `values.yaml` carrying the default values and a `templates/` tree.
//! Templates render through minijinja against the deep merge of the default
//! values and the release's value overrides; the rendered output is a
//! multi-document YAML stream of unstructured objects.

use std::path::{Path, PathBuf};

use kube::core::DynamicObject;
use minijinja::{Environment, context};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::{ResultExt, Snafu};

type Result<T, E = Error> = std::result::Result<T, E>;

const CHART_METADATA_FILE: &str = "Chart.yaml";
const VALUES_FILE: &str = "values.yaml";
const TEMPLATES_DIRECTORY: &str = "templates";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read chart file {path:?}"))]
    ReadChartFile {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse chart metadata of {path:?}"))]
    ParseChartMetadata {
        source: serde_yaml::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse the default values of chart {chart:?}"))]
    ParseDefaultValues {
        source: serde_yaml::Error,
        chart: String,
    },

    #[snafu(display("failed to compile template {template:?}"))]
    CompileTemplate {
        source: minijinja::Error,
        template: String,
    },

    #[snafu(display("failed to render template {template:?}"))]
    RenderTemplate {
        source: minijinja::Error,
        template: String,
    },

    #[snafu(display("template {template:?} rendered an invalid YAML document"))]
    ParseRenderedDocument {
        source: serde_yaml::Error,
        template: String,
    },

    #[snafu(display("template {template:?} rendered a document which is not an object"))]
    ConvertRenderedDocument {
        source: serde_json::Error,
        template: String,
    },
}

/// The subset of `Chart.yaml` the engine cares about.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
}

#[derive(Clone, Debug)]
struct ChartTemplate {
    name: String,
    source: String,
}

/// An unpacked chart, ready to render.
#[derive(Clone, Debug)]
pub struct Chart {
    pub metadata: ChartMetadata,
    default_values: Value,
    templates: Vec<ChartTemplate>,
}

impl Chart {
    /// Loads a chart from its unpacked directory.
    ///
    /// Partial templates (files starting with `_`) and non-template files
    /// like `NOTES.txt` are skipped.
    pub fn load(directory: &Path) -> Result<Self> {
        let metadata_path = directory.join(CHART_METADATA_FILE);
        let metadata_raw =
            std::fs::read_to_string(&metadata_path).context(ReadChartFileSnafu {
                path: &metadata_path,
            })?;
        let metadata: ChartMetadata = serde_yaml::from_str(&metadata_raw)
            .context(ParseChartMetadataSnafu {
                path: &metadata_path,
            })?;

        let values_path = directory.join(VALUES_FILE);
        let default_values = if values_path.is_file() {
            let raw = std::fs::read_to_string(&values_path).context(ReadChartFileSnafu {
                path: &values_path,
            })?;
            serde_yaml::from_str::<Value>(&raw)
                .context(ParseDefaultValuesSnafu {
                    chart: &metadata.name,
                })?
        } else {
            Value::Null
        };

        let mut templates = Vec::new();
        collect_templates(
            &directory.join(TEMPLATES_DIRECTORY),
            String::new(),
            &mut templates,
        )?;
        templates.sort_by(|a, b| a.name.cmp(&b.name));

        Ok(Self {
            metadata,
            default_values,
            templates,
        })
    }

    /// The chart's default values deep-merged with the release overrides.
    /// Overrides win on scalars and lists, maps merge recursively.
    pub fn merged_values(&self, overrides: &Value) -> Value {
        let mut values = match &self.default_values {
            Value::Null => Value::Object(serde_json::Map::new()),
            other => other.clone(),
        };
        merge_values(&mut values, overrides);
        values
    }

    /// Renders every template and parses the output into unstructured
    /// objects. Empty documents are dropped.
    pub fn render(
        &self,
        release_name: &str,
        release_namespace: &str,
        overrides: &Value,
    ) -> Result<Vec<DynamicObject>> {
        let values = self.merged_values(overrides);

        let mut environment = Environment::new();
        for template in &self.templates {
            environment
                .add_template_owned(template.name.clone(), template.source.clone())
                .context(CompileTemplateSnafu {
                    template: &template.name,
                })?;
        }

        let mut objects = Vec::new();
        for template in &self.templates {
            let rendered = environment
                .get_template(&template.name)
                .and_then(|compiled| {
                    compiled.render(context! {
                        values => values,
                        release => context! {
                            name => release_name,
                            namespace => release_namespace,
                        },
                        chart => context! {
                            name => self.metadata.name,
                            version => self.metadata.version,
                        },
                    })
                })
                .context(RenderTemplateSnafu {
                    template: &template.name,
                })?;

            objects.extend(parse_documents(&rendered).map_err(|error| match error {
                Error::ParseRenderedDocument { source, .. } => Error::ParseRenderedDocument {
                    source,
                    template: template.name.clone(),
                },
                Error::ConvertRenderedDocument { source, .. } => Error::ConvertRenderedDocument {
                    source,
                    template: template.name.clone(),
                },
                other => other,
            })?);
        }

        Ok(objects)
    }
}

fn collect_templates(
    directory: &Path,
    prefix: String,
    templates: &mut Vec<ChartTemplate>,
) -> Result<()> {
    if !directory.is_dir() {
        return Ok(());
    }

    let entries = std::fs::read_dir(directory).context(ReadChartFileSnafu { path: directory })?;
    for entry in entries {
        let entry = entry.context(ReadChartFileSnafu { path: directory })?;
        let file_name = entry.file_name().to_string_lossy().into_owned();
        let path = entry.path();

        if path.is_dir() {
            collect_templates(&path, format!("{prefix}{file_name}/"), templates)?;
            continue;
        }
        if file_name.starts_with('_') || !is_template_file(&file_name) {
            continue;
        }

        let source = std::fs::read_to_string(&path).context(ReadChartFileSnafu { path: &path })?;
        templates.push(ChartTemplate {
            name: format!("{prefix}{file_name}"),
            source,
        });
    }

    Ok(())
}

fn is_template_file(file_name: &str) -> bool {
    file_name.ends_with(".yaml") || file_name.ends_with(".yml") || file_name.ends_with(".tpl")
}

/// Parses a multi-document YAML stream into unstructured objects. Documents
/// which are empty or render to `null` are skipped.
pub(crate) fn parse_documents(rendered: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();

    for document in serde_yaml::Deserializer::from_str(rendered) {
        let value = Value::deserialize(document).context(ParseRenderedDocumentSnafu {
            template: String::new(),
        })?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject =
            serde_json::from_value(value).context(ConvertRenderedDocumentSnafu {
                template: String::new(),
            })?;
        objects.push(object);
    }

    Ok(objects)
}

fn merge_values(target: &mut Value, overrides: &Value) {
    match (target, overrides) {
        (Value::Object(target_map), Value::Object(override_map)) => {
            for (key, value) in override_map {
                match target_map.get_mut(key) {
                    Some(existing) => merge_values(existing, value),
                    None => {
                        target_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (_, Value::Null) => {}
        (target, overrides) => *target = overrides.clone(),
    }
}
