//! HTTP client for chart repositories.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use kindling_chart::repo::{absolute_chart_url, index_url};
use kindling_chart::{Credentials, IndexFile};
use reqwest::{Certificate, Client, Identity, RequestBuilder, StatusCode};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

/// Errors talking to a chart repository.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("{url} returned {status}")]
    Status { url: String, status: StatusCode },

    #[error("invalid repository index at {url}: {source}")]
    InvalidIndex {
        url: String,
        #[source]
        source: serde_yaml::Error,
    },

    #[error("chart {name} version {version} not found in {repo_url}")]
    ChartNotFound {
        repo_url: String,
        name: String,
        version: String,
    },

    #[error("chart {name} version {version} has no download URL")]
    NoUrls { name: String, version: String },

    #[error("cannot derive a file name from {0}")]
    InvalidUrl(String),

    #[error("invalid TLS material in {path}: {reason}")]
    Tls { path: PathBuf, reason: String },
}

/// Client TLS material for repository requests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepoTls {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

impl RepoTls {
    pub fn is_empty(&self) -> bool {
        self.ca_file.is_none() && self.cert_file.is_none() && self.key_file.is_none()
    }
}

/// Fetches repository indexes and chart archives.
#[derive(Debug, Clone)]
pub struct RepoClient {
    client: Client,
}

impl RepoClient {
    pub fn new(timeout: Duration, tls: &RepoTls) -> Result<Self, RepoError> {
        let mut builder = Client::builder().timeout(timeout);

        if let Some(ca_file) = &tls.ca_file {
            let pem = fs::read(ca_file)?;
            let cert = Certificate::from_pem(&pem).map_err(|e| RepoError::Tls {
                path: ca_file.clone(),
                reason: e.to_string(),
            })?;
            builder = builder.add_root_certificate(cert);
        }

        if let (Some(cert_file), Some(key_file)) = (&tls.cert_file, &tls.key_file) {
            let mut pem = fs::read(cert_file)?;
            pem.extend_from_slice(b"\n");
            pem.extend_from_slice(&fs::read(key_file)?);
            let identity = Identity::from_pem(&pem).map_err(|e| RepoError::Tls {
                path: cert_file.clone(),
                reason: e.to_string(),
            })?;
            builder = builder.identity(identity);
        }

        Ok(Self {
            client: builder.build()?,
        })
    }

    fn get(&self, url: &str, credentials: Option<&Credentials>) -> RequestBuilder {
        let request = self.client.get(url);
        match credentials {
            Some(c) => request.basic_auth(&c.username, Some(&c.password)),
            None => request,
        }
    }

    /// Fetch and parse `<repo_url>/index.yaml`.
    pub async fn fetch_index(
        &self,
        repo_url: &str,
        credentials: Option<&Credentials>,
    ) -> Result<IndexFile, RepoError> {
        let url = index_url(repo_url);
        debug!(url = %url, "Fetching repository index");

        let response = self.get(&url, credentials).send().await?;
        if response.status() != StatusCode::OK {
            return Err(RepoError::Status {
                url,
                status: response.status(),
            });
        }

        let body = response.bytes().await?;
        IndexFile::from_slice(&body).map_err(|source| RepoError::InvalidIndex { url, source })
    }

    /// Translate a chart name and version into a download URL.
    pub async fn find_chart_url(
        &self,
        repo_url: &str,
        name: &str,
        version: Option<&str>,
        credentials: Option<&Credentials>,
    ) -> Result<String, RepoError> {
        let index = self.fetch_index(repo_url, credentials).await?;
        chart_url_from_index(&index, repo_url, name, version)
    }

    /// Download `url` into `dest_dir`, keeping the URL's file name.
    ///
    /// The body is written to a temporary file and renamed into place, so a
    /// failed download never leaves a partial archive behind.
    pub async fn download(
        &self,
        url: &str,
        dest_dir: &Path,
        credentials: Option<&Credentials>,
    ) -> Result<PathBuf, RepoError> {
        let file_name = file_name_from_url(url)?;
        let dest = dest_dir.join(&file_name);
        let temp_path = dest_dir.join(format!(".{file_name}.part"));

        debug!(url = %url, dest = %dest.display(), "Downloading");

        let mut response = self.get(url, credentials).send().await?;
        if response.status() != StatusCode::OK {
            return Err(RepoError::Status {
                url: url.to_string(),
                status: response.status(),
            });
        }

        let result = async {
            let mut file = tokio::fs::File::create(&temp_path).await?;
            let mut total = 0u64;
            while let Some(chunk) = response.chunk().await? {
                total += chunk.len() as u64;
                file.write_all(&chunk).await?;
            }
            file.sync_all().await?;
            drop(file);
            tokio::fs::rename(&temp_path, &dest).await?;
            Ok::<_, RepoError>(total)
        }
        .await;

        match result {
            Ok(size) => {
                info!(url = %url, path = %dest.display(), size, "Downloaded");
                Ok(dest)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&temp_path).await;
                Err(e)
            }
        }
    }
}

/// Look up a chart in an index and resolve its first URL.
pub fn chart_url_from_index(
    index: &IndexFile,
    repo_url: &str,
    name: &str,
    version: Option<&str>,
) -> Result<String, RepoError> {
    let wanted = version.unwrap_or_default().to_string();

    let entry = index
        .get(name, version)
        .ok_or_else(|| RepoError::ChartNotFound {
            repo_url: repo_url.to_string(),
            name: name.to_string(),
            version: if wanted.is_empty() {
                "latest".to_string()
            } else {
                wanted.clone()
            },
        })?;

    let url = entry.urls.first().ok_or_else(|| RepoError::NoUrls {
        name: name.to_string(),
        version: entry.version.clone(),
    })?;

    Ok(absolute_chart_url(repo_url, url))
}

/// Last path segment of a URL, ignoring any query or fragment.
pub fn file_name_from_url(url: &str) -> Result<String, RepoError> {
    let path = url.split(['?', '#']).next().unwrap_or_default();
    let path = path.split_once("://").map(|(_, rest)| rest).unwrap_or(path);

    match path.split_once('/') {
        Some((_, rest)) => match rest.rsplit('/').next() {
            Some(name) if !name.is_empty() => Ok(name.to_string()),
            _ => Err(RepoError::InvalidUrl(url.to_string())),
        },
        None => Err(RepoError::InvalidUrl(url.to_string())),
    }
}
