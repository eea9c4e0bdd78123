//! Chart references, resolution results, and chart metadata.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Basic-auth credentials for a chart repository.
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// A reference to a chart by path, local repository name, repo-qualified
/// name, or URL.
///
/// Built once and never modified; the `with_*` methods consume the value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReference {
    name: String,
    version: Option<String>,
    repo_url: Option<String>,
    credentials: Option<Credentials>,
}

impl ArtifactReference {
    /// Create a reference. Surrounding whitespace is trimmed.
    pub fn new(name: impl AsRef<str>) -> Self {
        Self {
            name: name.as_ref().trim().to_string(),
            version: None,
            repo_url: None,
            credentials: None,
        }
    }

    /// Pin a version. An empty version means "latest".
    pub fn with_version(mut self, version: impl AsRef<str>) -> Self {
        self.version = non_empty(version.as_ref());
        self
    }

    /// Resolve through the repository at `url` instead of the local registry.
    pub fn with_repo_url(mut self, url: impl AsRef<str>) -> Self {
        self.repo_url = non_empty(url.as_ref());
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn version(&self) -> Option<&str> {
        self.version.as_deref()
    }

    pub fn repo_url(&self) -> Option<&str> {
        self.repo_url.as_deref()
    }

    pub fn credentials(&self) -> Option<&Credentials> {
        self.credentials.as_ref()
    }

    /// True if the name is written as a filesystem path (absolute or
    /// starting with `.`). Such names are never looked up remotely.
    pub fn is_explicit_path(&self) -> bool {
        Path::new(&self.name).is_absolute() || self.name.starts_with('.')
    }
}

impl fmt::Display for ArtifactReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.version {
            Some(version) => write!(f, "{}@{}", self.name, version),
            None => write!(f, "{}", self.name),
        }
    }
}

fn non_empty(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        None
    } else {
        Some(value.to_string())
    }
}

/// Where a resolved artifact came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArtifactSource {
    /// The reference named an existing path.
    LocalPath,
    /// Found in the local package repository directory.
    LocalRepository,
    /// Downloaded into the cache directory.
    Downloaded,
}

/// A chart available on the local filesystem.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedArtifact {
    /// Absolute path to the chart directory or archive.
    pub local_path: PathBuf,
    /// Whether the provenance signature was checked.
    pub verified: bool,
    pub source: ArtifactSource,
}

/// Contents of `Chart.yaml`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_version: Option<String>,
}

/// Contents of `requirements.yaml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Requirements {
    #[serde(default)]
    pub dependencies: Vec<Dependency>,
}

/// A declared chart dependency.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,

    #[serde(default)]
    pub version: String,

    /// Repository URL, `@name`/`alias:name` registry alias, or `file://` path.
    #[serde(default)]
    pub repository: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub condition: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}
