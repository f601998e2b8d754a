//! Runtime options of the engine, fed from flags or the environment.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;

/// Options every deployed controller instance runs with.
#[derive(Debug, PartialEq, Eq, Parser)]
#[command(long_about = "")]
pub struct RunOptions {
    /// The namespace the controller itself runs in. Scopes leader election
    /// and the controller's field-manager identity.
    #[arg(long, env = "CONTROLLER_NAMESPACE")]
    pub controller_namespace: String,

    /// The controller name, used as the field manager on server-side apply.
    #[arg(long, env, default_value = "stackable-gitops")]
    pub controller_name: String,

    /// The project label reconcile metrics are reported under.
    #[arg(long, env)]
    pub project: String,

    /// The url of the configuration repository, used as a metric label.
    #[arg(long, env)]
    pub repository_url: String,

    /// Seconds between two reconcile ticks.
    #[arg(long, env, default_value_t = 30)]
    pub reconcile_interval: u64,

    /// Upper bound of concurrently processed components. Defaults to the
    /// number of logical cpus.
    #[arg(long, env)]
    pub worker_budget: Option<usize>,

    /// Directory the inventory lives in.
    #[arg(long, env, default_value = "/var/lib/stackable-gitops/inventory")]
    pub inventory_directory: PathBuf,

    /// Directory fetched charts are cached in. Defaults to a directory below
    /// the system temp directory.
    #[arg(long, env)]
    pub chart_cache_directory: Option<PathBuf>,
}

impl RunOptions {
    /// The field manager identity: the controller name scoped by the
    /// controller namespace.
    pub fn field_manager(&self) -> String {
        format!(
            "{name}-{namespace}",
            name = self.controller_name,
            namespace = self.controller_namespace
        )
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval)
    }

    pub fn worker_budget(&self) -> usize {
        self.worker_budget.unwrap_or_else(|| {
            std::thread::available_parallelism().map_or(1, std::num::NonZeroUsize::get)
        })
    }

    pub fn chart_cache_directory(&self) -> PathBuf {
        self.chart_cache_directory
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join("stackable-gitops-charts"))
    }
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    #[test]
    fn defaults_apply() {
        let options = RunOptions::parse_from([
            "stackable-gitops",
            "--controller-namespace",
            "gitops-system",
            "--project",
            "demo",
            "--repository-url",
            "https://git.example.com/demo.git",
        ]);

        assert_eq!(options.controller_name, "stackable-gitops");
        assert_eq!(options.field_manager(), "stackable-gitops-gitops-system");
        assert_eq!(options.reconcile_interval(), Duration::from_secs(30));
        assert!(options.worker_budget() >= 1);
        assert_eq!(
            options.inventory_directory,
            PathBuf::from("/var/lib/stackable-gitops/inventory")
        );
    }

    #[test]
    fn flags_override_defaults() {
        let options = RunOptions::parse_from([
            "stackable-gitops",
            "--controller-namespace",
            "gitops-system",
            "--controller-name",
            "gitops-staging",
            "--project",
            "demo",
            "--repository-url",
            "https://git.example.com/demo.git",
            "--reconcile-interval",
            "120",
            "--worker-budget",
            "2",
        ]);

        assert_eq!(options.field_manager(), "gitops-staging-gitops-system");
        assert_eq!(options.reconcile_interval(), Duration::from_secs(120));
        assert_eq!(options.worker_budget(), 2);
    }
}
