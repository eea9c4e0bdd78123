//! Chart repository metadata: `index.yaml` and the local `repositories.yaml`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::ChartError;

/// File name of a repository index, relative to the repository URL.
pub const INDEX_FILE: &str = "index.yaml";

/// File name of the local repository registry.
pub const REPOSITORIES_FILE: &str = "repositories.yaml";

/// A repository `index.yaml`.
///
/// Entries for each chart are ordered newest first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default)]
    pub entries: BTreeMap<String, Vec<ChartVersion>>,
}

/// One published version of a chart.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartVersion {
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default)]
    pub urls: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
}

impl IndexFile {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, serde_yaml::Error> {
        serde_yaml::from_slice(bytes)
    }

    /// Load a cached index file from disk.
    pub fn load(path: &Path) -> Result<Self, ChartError> {
        let bytes = fs::read(path).map_err(|e| ChartError::io(path, e))?;
        Self::from_slice(&bytes).map_err(|e| ChartError::yaml(path, INDEX_FILE, e))
    }

    /// Find a chart version. `None` or an empty version selects the newest.
    pub fn get(&self, name: &str, version: Option<&str>) -> Option<&ChartVersion> {
        let versions = self.entries.get(name)?;

        match version.map(str::trim).filter(|v| !v.is_empty()) {
            None => versions.first(),
            Some(wanted) => versions
                .iter()
                .find(|v| strip_v(&v.version) == strip_v(wanted)),
        }
    }
}

fn strip_v(version: &str) -> &str {
    version.trim().trim_start_matches('v')
}

/// Resolve a chart URL from an index entry against the repository URL.
///
/// Absolute URLs are returned unchanged; relative ones are joined onto the
/// repository base.
pub fn absolute_chart_url(repo_url: &str, chart_url: &str) -> String {
    if chart_url.starts_with("http://") || chart_url.starts_with("https://") {
        return chart_url.to_string();
    }

    format!(
        "{}/{}",
        repo_url.trim_end_matches('/'),
        chart_url.trim_start_matches("./").trim_start_matches('/')
    )
}

/// URL of the index for a repository.
pub fn index_url(repo_url: &str) -> String {
    format!("{}/{}", repo_url.trim_end_matches('/'), INDEX_FILE)
}

/// The local repository registry (`repositories.yaml`).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryFile {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default)]
    pub repositories: Vec<RepositoryEntry>,
}

/// A named repository registered locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryEntry {
    pub name: String,

    pub url: String,

    /// Path of the cached index file, if recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
}

impl RepositoryFile {
    /// Load `repositories.yaml` from a repository directory.
    pub fn load(repository_dir: &Path) -> Result<Self, ChartError> {
        let path = repository_dir.join(REPOSITORIES_FILE);
        let bytes = fs::read(&path).map_err(|e| ChartError::io(&path, e))?;
        serde_yaml::from_slice(&bytes).map_err(|e| ChartError::yaml(&path, REPOSITORIES_FILE, e))
    }

    pub fn find(&self, name: &str) -> Option<&RepositoryEntry> {
        self.repositories.iter().find(|r| r.name == name)
    }
}

impl RepositoryEntry {
    /// Location of this repository's cached index.
    ///
    /// Uses the recorded `cache` path when present, otherwise
    /// `<repository_dir>/cache/<name>-index.yaml`.
    pub fn cached_index_path(&self, repository_dir: &Path) -> PathBuf {
        match self.cache.as_deref().filter(|c| !c.is_empty()) {
            Some(cache) if Path::new(cache).is_absolute() => PathBuf::from(cache),
            Some(cache) => repository_dir.join("cache").join(cache),
            None => repository_dir
                .join("cache")
                .join(format!("{}-index.yaml", self.name)),
        }
    }
}
