//! Chart artifact resolution.
//!
//! A reference is resolved through an ordered chain; the first stage that
//! succeeds wins:
//!
//! 1. an existing local path (optionally verified)
//! 2. explicit paths that do not exist are rejected
//! 3. a package in the local repository directory
//! 4. a remote lookup (repository URL, registered `repo/chart`, or full URL)
//! 5. a download into the cache directory
//!
//! Nothing is retried.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use kindling_chart::provenance::{recorded_digest, sha256_file, PROVENANCE_EXTENSION};
use kindling_chart::{
    ArtifactReference, ArtifactSource, Credentials, IndexFile, RepositoryFile, ResolvedArtifact,
};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::process::ToolCommand;
use crate::repo_client::{chart_url_from_index, file_name_from_url, RepoClient, RepoError, RepoTls};

/// Errors from resolving an artifact reference.
#[derive(Debug, Error)]
pub enum ResolutionError {
    #[error("chart {reference} not found: {reason}")]
    NotFound { reference: String, reason: String },

    #[error("cannot verify a directory: {path}")]
    VerificationUnsupported { path: PathBuf },

    #[error("verification of {path} failed: {source}")]
    VerificationFailed {
        path: PathBuf,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to look up {reference}: {source}")]
    Lookup {
        reference: String,
        #[source]
        source: RepoError,
    },

    #[error("failed to download {reference} (hint: running `helm repo update` may help): {source}")]
    DownloadFailed {
        reference: String,
        #[source]
        source: anyhow::Error,
    },
}

/// Filesystem layout and client settings of the resolver.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Local package repository (`<helm home>/repository`).
    pub repository_dir: PathBuf,
    /// Download cache (`<helm home>/cache/archive`).
    pub cache_dir: PathBuf,
    pub http_timeout: Duration,
}

/// Per-call resolution options.
#[derive(Debug, Clone, Default)]
pub struct ResolveOptions {
    pub verify: bool,
    pub keyring: PathBuf,
    pub tls: RepoTls,
}

/// Checks an archive against its provenance file.
#[async_trait]
pub trait ProvenanceVerifier: Send + Sync {
    /// Verify `archive` using `<archive>.prov` and the given keyring.
    async fn verify(&self, archive: &Path, keyring: &Path) -> anyhow::Result<()>;
}

/// Path of the provenance file for an archive.
pub fn provenance_path(archive: &Path) -> PathBuf {
    let mut path = archive.as_os_str().to_owned();
    path.push(".");
    path.push(PROVENANCE_EXTENSION);
    PathBuf::from(path)
}

/// [`ProvenanceVerifier`] that checks the signature with `gpg` and the
/// archive digest against the signed `files:` section.
#[derive(Debug, Clone)]
pub struct GpgVerifier {
    binary: String,
    timeout: Duration,
}

impl GpgVerifier {
    pub fn new(timeout: Duration) -> Self {
        Self {
            binary: "gpg".to_string(),
            timeout,
        }
    }

    /// Use a different `gpg` executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }
}

#[async_trait]
impl ProvenanceVerifier for GpgVerifier {
    async fn verify(&self, archive: &Path, keyring: &Path) -> anyhow::Result<()> {
        let prov = provenance_path(archive);
        if !tokio::fs::try_exists(&prov).await.unwrap_or(false) {
            bail!("provenance file {} not found", prov.display());
        }

        ToolCommand::new(&self.binary)
            .args(["--batch", "--no-default-keyring", "--keyring"])
            .arg(keyring.display().to_string())
            .arg("--verify")
            .arg(prov.display().to_string())
            .timeout(self.timeout)
            .output()
            .await
            .context("signature check failed")?;

        let file_name = archive
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| anyhow!("{} has no file name", archive.display()))?;
        let contents = tokio::fs::read_to_string(&prov).await?;
        let expected = recorded_digest(&contents, file_name)
            .ok_or_else(|| anyhow!("{} is not listed in {}", file_name, prov.display()))?;

        let archive = archive.to_path_buf();
        let actual = tokio::task::spawn_blocking(move || sha256_file(&archive)).await??;
        if actual != expected {
            bail!("digest mismatch: expected {expected}, got {actual}");
        }
        Ok(())
    }
}

/// Where to download an artifact from.
struct DownloadTarget {
    url: String,
    credentials: Option<Credentials>,
    tls: RepoTls,
}

/// Resolves artifact references to local paths.
pub struct ArtifactResolver {
    config: ResolverConfig,
    verifier: Arc<dyn ProvenanceVerifier>,
    /// Per-file-name locks serializing writes into the cache.
    download_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl ArtifactResolver {
    pub fn new(config: ResolverConfig, verifier: Arc<dyn ProvenanceVerifier>) -> Self {
        Self {
            config,
            verifier,
            download_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    pub async fn resolve(
        &self,
        reference: &ArtifactReference,
        options: &ResolveOptions,
    ) -> Result<ResolvedArtifact, ResolutionError> {
        let name = reference.name();
        if name.is_empty() {
            return Err(not_found(reference, "empty chart name"));
        }

        if let Ok(metadata) = tokio::fs::metadata(name).await {
            let path = absolute(reference, Path::new(name))?;
            if options.verify {
                if metadata.is_dir() {
                    return Err(ResolutionError::VerificationUnsupported { path });
                }
                self.verify(&path, options).await?;
            }
            debug!(path = %path.display(), "Resolved chart from local path");
            return Ok(ResolvedArtifact {
                local_path: path,
                verified: options.verify,
                source: ArtifactSource::LocalPath,
            });
        }

        if reference.is_explicit_path() {
            return Err(not_found(reference, "path does not exist"));
        }

        let in_repository = self.config.repository_dir.join(name);
        if tokio::fs::try_exists(&in_repository).await.unwrap_or(false) {
            let path = absolute(reference, &in_repository)?;
            debug!(path = %path.display(), "Resolved chart from local repository");
            return Ok(ResolvedArtifact {
                local_path: path,
                verified: false,
                source: ArtifactSource::LocalRepository,
            });
        }

        let target = self.locate(reference, options).await?;
        let path = self.download(reference, &target, options).await?;

        Ok(ResolvedArtifact {
            local_path: path,
            verified: options.verify,
            source: ArtifactSource::Downloaded,
        })
    }

    /// Translate a reference into a download URL.
    async fn locate(
        &self,
        reference: &ArtifactReference,
        options: &ResolveOptions,
    ) -> Result<DownloadTarget, ResolutionError> {
        let name = reference.name();
        let credentials = reference.credentials().cloned();

        if let Some(repo_url) = reference.repo_url() {
            let lookup = |source| ResolutionError::Lookup {
                reference: reference.to_string(),
                source,
            };
            let client = RepoClient::new(self.config.http_timeout, &options.tls).map_err(lookup)?;
            let url = client
                .find_chart_url(repo_url, name, reference.version(), credentials.as_ref())
                .await
                .map_err(lookup)?;
            info!(reference = %reference, url = %url, "Found chart in repository");
            return Ok(DownloadTarget {
                url,
                credentials,
                tls: options.tls.clone(),
            });
        }

        if name.starts_with("http://") || name.starts_with("https://") {
            return Ok(DownloadTarget {
                url: name.to_string(),
                credentials,
                tls: options.tls.clone(),
            });
        }

        if let Some((repo_name, chart)) = name.split_once('/') {
            return self
                .locate_registered(reference, repo_name, chart, credentials, options)
                .map_err(|source| ResolutionError::DownloadFailed {
                    reference: reference.to_string(),
                    source,
                });
        }

        Err(not_found(
            reference,
            "not a local path, not in the local repository, and no repository URL given",
        ))
    }

    /// Look up `repo/chart` through `repositories.yaml` and the cached index.
    fn locate_registered(
        &self,
        reference: &ArtifactReference,
        repo_name: &str,
        chart: &str,
        credentials: Option<Credentials>,
        options: &ResolveOptions,
    ) -> anyhow::Result<DownloadTarget> {
        let repositories = RepositoryFile::load(&self.config.repository_dir)?;
        let entry = repositories
            .find(repo_name)
            .ok_or_else(|| anyhow!("repository {repo_name} is not registered"))?;

        let index = IndexFile::load(&entry.cached_index_path(&self.config.repository_dir))?;
        let url = chart_url_from_index(&index, &entry.url, chart, reference.version())?;

        let credentials = credentials.or_else(|| match (&entry.username, &entry.password) {
            (Some(username), Some(password)) => Some(Credentials::new(username, password)),
            _ => None,
        });

        let tls = if options.tls.is_empty() {
            RepoTls {
                ca_file: non_empty_path(entry.ca_file.as_deref()),
                cert_file: non_empty_path(entry.cert_file.as_deref()),
                key_file: non_empty_path(entry.key_file.as_deref()),
            }
        } else {
            options.tls.clone()
        };

        info!(reference = %reference, repository = %repo_name, url = %url, "Found chart in registered repository");
        Ok(DownloadTarget {
            url,
            credentials,
            tls,
        })
    }

    async fn download(
        &self,
        reference: &ArtifactReference,
        target: &DownloadTarget,
        options: &ResolveOptions,
    ) -> Result<PathBuf, ResolutionError> {
        let failed = |source: anyhow::Error| ResolutionError::DownloadFailed {
            reference: reference.to_string(),
            source,
        };

        let file_name = file_name_from_url(&target.url).map_err(|e| failed(e.into()))?;
        let lock = self.download_lock(&file_name).await;
        let _guard = lock.lock().await;

        create_cache_dir(&self.config.cache_dir)
            .await
            .with_context(|| format!("failed to create {}", self.config.cache_dir.display()))
            .map_err(failed)?;

        let client = RepoClient::new(self.config.http_timeout, &target.tls)
            .map_err(|e| failed(e.into()))?;
        let path = client
            .download(&target.url, &self.config.cache_dir, target.credentials.as_ref())
            .await
            .map_err(|e| failed(e.into()))?;

        if options.verify {
            let prov_url = format!("{}.{}", target.url, PROVENANCE_EXTENSION);
            client
                .download(&prov_url, &self.config.cache_dir, target.credentials.as_ref())
                .await
                .map_err(|e| failed(anyhow::Error::from(e).context("failed to fetch provenance")))?;
            if let Err(e) = self.verify(&path, options).await {
                let _ = tokio::fs::remove_file(&path).await;
                let _ = tokio::fs::remove_file(provenance_path(&path)).await;
                return Err(e);
            }
        }

        absolute(reference, &path)
    }

    async fn verify(&self, path: &Path, options: &ResolveOptions) -> Result<(), ResolutionError> {
        self.verifier
            .verify(path, &options.keyring)
            .await
            .map_err(|source| {
                warn!(path = %path.display(), error = %source, "Chart verification failed");
                ResolutionError::VerificationFailed {
                    path: path.to_path_buf(),
                    source,
                }
            })
    }

    async fn download_lock(&self, file_name: &str) -> Arc<Mutex<()>> {
        let mut locks = self.download_locks.lock().await;
        locks
            .entry(file_name.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }
}

fn not_found(reference: &ArtifactReference, reason: &str) -> ResolutionError {
    ResolutionError::NotFound {
        reference: reference.to_string(),
        reason: reason.to_string(),
    }
}

fn absolute(reference: &ArtifactReference, path: &Path) -> Result<PathBuf, ResolutionError> {
    std::path::absolute(path).map_err(|e| ResolutionError::NotFound {
        reference: reference.to_string(),
        reason: format!("cannot make {} absolute: {e}", path.display()),
    })
}

fn non_empty_path(value: Option<&str>) -> Option<PathBuf> {
    value.filter(|v| !v.is_empty()).map(PathBuf::from)
}

async fn create_cache_dir(dir: &Path) -> std::io::Result<()> {
    let mut builder = tokio::fs::DirBuilder::new();
    builder.recursive(true);
    #[cfg(unix)]
    builder.mode(0o755);
    builder.create(dir).await
}
