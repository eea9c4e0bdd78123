//! Dependency fetching from chart repositories.
//!
//! Materializes a chart's declared dependencies under `charts/`, the way
//! `helm dependency update` does for Helm 2 `requirements.yaml` files.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use kindling_chart::{
    Credentials, Dependency, IndexFile, PackageDescriptor, RepositoryFile, CHARTS_DIR, CHART_FILE,
};
use kindling_reconcile::DependencyFetcher;
use tracing::{debug, info, warn};

use crate::repo_client::{chart_url_from_index, RepoClient, RepoTls};

/// Directory under the chart root that fetched dependencies are staged in.
pub const STAGING_DIR: &str = ".charts-staging";

/// Where a dependency is fetched from, parsed from its `repository` field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DependencySource {
    /// A repository URL with an `index.yaml`.
    Url(String),
    /// A repository registered in `repositories.yaml` (`@name` or `alias:name`).
    Alias(String),
    /// A chart on disk (`file://path`), relative to the parent chart.
    File(PathBuf),
}

impl DependencySource {
    pub fn parse(repository: &str) -> Result<Self> {
        let repository = repository.trim();

        if let Some(path) = repository.strip_prefix("file://") {
            return Ok(Self::File(PathBuf::from(path)));
        }
        if let Some(alias) = repository
            .strip_prefix('@')
            .or_else(|| repository.strip_prefix("alias:"))
        {
            return Ok(Self::Alias(alias.to_string()));
        }
        if repository.starts_with("http://") || repository.starts_with("https://") {
            return Ok(Self::Url(repository.to_string()));
        }

        bail!("unsupported dependency repository {repository:?}")
    }
}

/// [`DependencyFetcher`] that downloads dependencies from chart repositories.
#[derive(Debug, Clone)]
pub struct RepositoryFetcher {
    repository_dir: PathBuf,
    http_timeout: Duration,
    tls: RepoTls,
}

impl RepositoryFetcher {
    pub fn new(repository_dir: impl Into<PathBuf>, http_timeout: Duration, tls: RepoTls) -> Self {
        Self {
            repository_dir: repository_dir.into(),
            http_timeout,
            tls,
        }
    }

    async fn fetch_one(
        &self,
        client: &RepoClient,
        chart_root: &Path,
        charts_dir: &Path,
        dependency: &Dependency,
    ) -> Result<()> {
        match DependencySource::parse(&dependency.repository)? {
            DependencySource::Url(repo_url) => {
                let index = client.fetch_index(&repo_url, None).await?;
                self.download(client, &index, &repo_url, None, charts_dir, dependency)
                    .await
            }
            DependencySource::Alias(alias) => {
                let repositories = RepositoryFile::load(&self.repository_dir)?;
                let entry = repositories
                    .find(&alias)
                    .ok_or_else(|| anyhow!("repository {alias} is not registered"))?;
                let credentials = match (&entry.username, &entry.password) {
                    (Some(username), Some(password)) => Some(Credentials::new(username, password)),
                    _ => None,
                };
                let index = IndexFile::load(&entry.cached_index_path(&self.repository_dir))?;
                self.download(
                    client,
                    &index,
                    &entry.url,
                    credentials.as_ref(),
                    charts_dir,
                    dependency,
                )
                .await
            }
            DependencySource::File(path) => {
                let source = chart_root.join(path);
                let dest = charts_dir.join(&dependency.name);
                tokio::task::spawn_blocking(move || copy_chart(&source, &dest)).await?
            }
        }
    }

    async fn download(
        &self,
        client: &RepoClient,
        index: &IndexFile,
        repo_url: &str,
        credentials: Option<&Credentials>,
        charts_dir: &Path,
        dependency: &Dependency,
    ) -> Result<()> {
        let version = exact_version(&dependency.version);
        if version.is_none() && !dependency.version.trim().is_empty() {
            warn!(
                dependency = %dependency.name,
                constraint = %dependency.version,
                "Version ranges are not evaluated; using the newest published version"
            );
        }

        let url = chart_url_from_index(index, repo_url, &dependency.name, version)?;
        let path = client.download(&url, charts_dir, credentials).await?;
        info!(dependency = %dependency.name, path = %path.display(), "Fetched dependency");
        Ok(())
    }
}

#[async_trait]
impl DependencyFetcher for RepositoryFetcher {
    async fn fetch(
        &self,
        chart_root: &Path,
        dependencies: &[Dependency],
        force_update: bool,
    ) -> Result<()> {
        if !chart_root.is_dir() {
            bail!(
                "{} is not a chart directory; packaged charts cannot be updated",
                chart_root.display()
            );
        }

        let current = PackageDescriptor::load(chart_root)?;
        let charts_dir = chart_root.join(CHARTS_DIR);
        tokio::fs::create_dir_all(&charts_dir).await?;

        let wanted: Vec<&Dependency> = dependencies
            .iter()
            .filter(|dependency| {
                let present = current.is_materialized(dependency);
                if present && !force_update {
                    debug!(dependency = %dependency.name, "Dependency already present");
                }
                !present || force_update
            })
            .collect();
        if wanted.is_empty() {
            return Ok(());
        }

        // Everything lands in a staging directory first; `charts/` is only
        // touched once every dependency has been fetched.
        let client = RepoClient::new(self.http_timeout, &self.tls)?;
        let staging = chart_root.join(STAGING_DIR);
        remove_dir_if_present(&staging)?;
        fs::create_dir_all(&staging)?;

        for dependency in &wanted {
            let fetched = self
                .fetch_one(&client, chart_root, &staging, dependency)
                .await
                .with_context(|| format!("failed to fetch dependency {}", dependency.name));
            if let Err(e) = fetched {
                remove_dir_if_present(&staging)?;
                return Err(e);
            }
        }

        for dependency in &wanted {
            if current.is_materialized(dependency) {
                remove_existing(&charts_dir, &dependency.name)?;
            }
        }
        promote(&staging, &charts_dir)?;
        fs::remove_dir_all(&staging)?;

        Ok(())
    }
}

/// The version to pin, or `None` for "newest". Range constraints are
/// treated as "newest".
fn exact_version(version: &str) -> Option<&str> {
    let version = version.trim();
    let is_constraint = version.is_empty()
        || version.contains(['^', '~', '>', '<', '=', '*', ' ', '|', ','])
        || version.split('.').any(|part| part == "x" || part == "X");

    if is_constraint {
        None
    } else {
        Some(version)
    }
}

/// Remove `charts/<name>` and `charts/<name>-<version>.tgz`.
fn remove_existing(charts_dir: &Path, name: &str) -> io::Result<()> {
    for entry in fs::read_dir(charts_dir)? {
        let entry = entry?;
        let file_name = entry.file_name();
        let file_name = file_name.to_string_lossy();
        let path = entry.path();

        if path.is_dir() && file_name == name {
            fs::remove_dir_all(&path)?;
        } else if is_versioned_archive_of(&file_name, name) {
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// Move every entry of `staging` into `charts_dir`, replacing same-named
/// entries.
fn promote(staging: &Path, charts_dir: &Path) -> io::Result<()> {
    for entry in fs::read_dir(staging)? {
        let entry = entry?;
        let target = charts_dir.join(entry.file_name());
        if target.is_dir() {
            fs::remove_dir_all(&target)?;
        }
        fs::rename(entry.path(), &target)?;
    }
    Ok(())
}

fn remove_dir_if_present(dir: &Path) -> io::Result<()> {
    match fs::remove_dir_all(dir) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

fn is_versioned_archive_of(file_name: &str, name: &str) -> bool {
    file_name
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|rest| rest.strip_suffix(".tgz"))
        .map(|version| version.trim_start_matches('v'))
        .is_some_and(|version| version.starts_with(|c: char| c.is_ascii_digit()))
}

/// Copy a chart directory (or archive) into `dest`.
fn copy_chart(source: &Path, dest: &Path) -> Result<()> {
    let metadata = fs::metadata(source)
        .with_context(|| format!("dependency path {} does not exist", source.display()))?;

    if metadata.is_file() {
        let file_name = source
            .file_name()
            .ok_or_else(|| anyhow!("{} has no file name", source.display()))?;
        let parent = dest
            .parent()
            .ok_or_else(|| anyhow!("{} has no parent", dest.display()))?;
        fs::copy(source, parent.join(file_name))?;
        return Ok(());
    }

    if !source.join(CHART_FILE).is_file() {
        bail!("{} does not contain a {CHART_FILE}", source.display());
    }
    copy_dir(source, dest)?;
    Ok(())
}

fn copy_dir(source: &Path, dest: &Path) -> io::Result<()> {
    fs::create_dir_all(dest)?;
    for entry in fs::read_dir(source)? {
        let entry = entry?;
        let target = dest.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir(&entry.path(), &target)?;
        } else {
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}
