//! Dependency reconciliation for loaded charts.
//!
//! Ensures every dependency a chart declares is materialized under its
//! `charts/` directory before install. Missing dependencies are fetched
//! through a [`DependencyFetcher`] and the chart is then reloaded from disk;
//! the caller either gets a descriptor with everything materialized or an
//! error, never a partially reconciled chart.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use kindling_chart::{ChartError, Dependency, PackageDescriptor};
use thiserror::Error;
use tracing::{debug, info};

/// Downloads declared dependencies into a chart's `charts/` directory.
#[async_trait]
pub trait DependencyFetcher: Send + Sync {
    /// Materialize `dependencies` under `<chart_root>/charts/`.
    ///
    /// Dependencies already present are skipped unless `force_update` is set.
    async fn fetch(
        &self,
        chart_root: &Path,
        dependencies: &[Dependency],
        force_update: bool,
    ) -> anyhow::Result<()>;
}

/// Reconciliation errors.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// The dependency fetch failed.
    #[error("failed to fetch dependencies for chart {chart}: {source}")]
    DependencyFetchFailed {
        chart: String,
        #[source]
        source: anyhow::Error,
    },

    /// The chart could not be reloaded after a successful fetch.
    #[error("failed to reload chart from {path}: {reason}")]
    ReloadFailed {
        path: PathBuf,
        reason: String,
        #[source]
        source: Option<ChartError>,
    },
}

/// How a reconciliation concluded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reconciled {
    /// The chart declares no requirements at all.
    NoRequirements,

    /// Every declared dependency was already materialized.
    Satisfied,

    /// Missing dependencies were fetched and the chart reloaded.
    Fetched { missing: usize },
}

/// Result of a successful reconciliation.
#[derive(Debug, Clone)]
pub struct Reconciliation {
    /// The chart with all declared dependencies materialized.
    pub descriptor: PackageDescriptor,

    pub outcome: Reconciled,
}

/// Reconciles declared chart dependencies against the local `charts/` dir.
pub struct DependencyReconciler {
    fetcher: Arc<dyn DependencyFetcher>,
    force_update: bool,
}

impl DependencyReconciler {
    pub fn new(fetcher: Arc<dyn DependencyFetcher>) -> Self {
        Self {
            fetcher,
            force_update: false,
        }
    }

    /// Re-download dependencies even when present, once a fetch is needed.
    pub fn with_force_update(mut self, force_update: bool) -> Self {
        self.force_update = force_update;
        self
    }

    /// Ensure all dependencies declared by `pkg` are materialized.
    ///
    /// `pkg` is returned untouched when nothing is missing. Otherwise the
    /// fetcher runs against `pkg_root` and a fresh descriptor is loaded.
    pub async fn reconcile(
        &self,
        pkg: PackageDescriptor,
        pkg_root: &Path,
    ) -> Result<Reconciliation, ReconcileError> {
        if pkg.requirements().is_none() {
            debug!(chart = %pkg.name(), "Chart declares no requirements");
            return Ok(Reconciliation {
                descriptor: pkg,
                outcome: Reconciled::NoRequirements,
            });
        }

        let missing: Vec<String> = pkg
            .missing_dependencies()
            .into_iter()
            .map(|d| d.name.clone())
            .collect();

        if missing.is_empty() {
            debug!(
                chart = %pkg.name(),
                dependencies = pkg.dependencies().len(),
                "All dependencies materialized"
            );
            return Ok(Reconciliation {
                descriptor: pkg,
                outcome: Reconciled::Satisfied,
            });
        }

        info!(
            chart = %pkg.name(),
            missing = ?missing,
            root = %pkg_root.display(),
            "Fetching missing chart dependencies"
        );

        self.fetcher
            .fetch(pkg_root, pkg.dependencies(), self.force_update)
            .await
            .map_err(|source| ReconcileError::DependencyFetchFailed {
                chart: pkg.name().to_string(),
                source,
            })?;

        let reloaded =
            PackageDescriptor::load(pkg_root).map_err(|source| ReconcileError::ReloadFailed {
                path: pkg_root.to_path_buf(),
                reason: source.to_string(),
                source: Some(source),
            })?;

        let still_missing: Vec<String> = reloaded
            .missing_dependencies()
            .into_iter()
            .map(|d| d.name.clone())
            .collect();
        if !still_missing.is_empty() {
            return Err(ReconcileError::ReloadFailed {
                path: pkg_root.to_path_buf(),
                reason: format!(
                    "dependencies still missing after fetch: {}",
                    still_missing.join(", ")
                ),
                source: None,
            });
        }

        info!(
            chart = %reloaded.name(),
            fetched = missing.len(),
            "Chart dependencies reconciled"
        );

        Ok(Reconciliation {
            descriptor: reloaded,
            outcome: Reconciled::Fetched {
                missing: missing.len(),
            },
        })
    }
}
