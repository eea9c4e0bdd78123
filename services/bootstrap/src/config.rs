//! Configuration for the bootstrap tool.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use directories::BaseDirs;
use kindling_chart::{ArtifactReference, Credentials};
use kindling_reconcile::ReadinessDeadline;

use crate::control_plane::{InstallOptions, DEFAULT_TILLER_IMAGE};
use crate::orchestrator::ReadinessPolicy;
use crate::release::ReleaseOptions;
use crate::repo_client::RepoTls;
use crate::resolver::{ResolveOptions, ResolverConfig};

/// Bootstrap configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Name of the kind cluster (recreated on every run).
    pub cluster_name: String,

    /// kind node image.
    pub node_image: String,

    /// Helm home; holds the repository registry and the download cache.
    pub helm_home: PathBuf,

    /// Directory the cluster kubeconfig is written to.
    pub kube_dir: PathBuf,

    /// GPG keyring used to verify charts.
    pub keyring: PathBuf,

    pub tls: RepoTls,

    pub tiller_namespace: String,
    pub tiller_service_account: String,
    pub tiller_image: String,
    pub max_history: u32,

    pub readiness_interval: Duration,
    pub readiness_timeout: Duration,
    pub readiness_policy: ReadinessPolicy,

    /// Chart to install: a path, `repo/chart`, local repository name, or URL.
    pub chart: String,
    pub chart_version: String,
    pub repo_url: Option<String>,
    pub repo_username: Option<String>,
    pub repo_password: Option<String>,
    pub verify: bool,
    pub force_dependency_update: bool,

    pub release_name: String,
    pub release_namespace: String,
    pub release_description: String,
    pub release_wait: bool,

    /// Timeout of each external tool invocation.
    pub command_timeout: Duration,

    /// Timeout of each HTTP request and of port-forward setup.
    pub http_timeout: Duration,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let string = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let home = match var("HOME") {
            Some(home) => PathBuf::from(home),
            None => BaseDirs::new()
                .map(|dirs| dirs.home_dir().to_path_buf())
                .ok_or_else(|| anyhow!("cannot determine the home directory"))?,
        };

        let helm_home = var("KINDLING_HELM_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".helm"));
        let keyring = var("KINDLING_KEYRING")
            .map(PathBuf::from)
            .unwrap_or_else(|| home.join(".gnupg").join("pubring.gpg"));

        Ok(Self {
            cluster_name: string("KINDLING_CLUSTER_NAME", "kind-ci"),
            node_image: string("KINDLING_NODE_IMAGE", "kindest/node:v1.16.2"),
            helm_home,
            kube_dir: home.join(".kube"),
            keyring,
            tls: RepoTls {
                ca_file: var("KINDLING_TLS_CA_FILE").map(PathBuf::from),
                cert_file: var("KINDLING_TLS_CERT_FILE").map(PathBuf::from),
                key_file: var("KINDLING_TLS_KEY_FILE").map(PathBuf::from),
            },
            tiller_namespace: string("KINDLING_TILLER_NAMESPACE", "kube-system"),
            tiller_service_account: string("KINDLING_TILLER_SERVICE_ACCOUNT", "tiller"),
            tiller_image: string("KINDLING_TILLER_IMAGE", DEFAULT_TILLER_IMAGE),
            max_history: parse(&var, "KINDLING_MAX_HISTORY", 200)?,
            readiness_interval: Duration::from_millis(parse(
                &var,
                "KINDLING_READINESS_INTERVAL_MS",
                500,
            )?),
            readiness_timeout: Duration::from_secs(parse(
                &var,
                "KINDLING_READINESS_TIMEOUT_SECS",
                300,
            )?),
            readiness_policy: parse(&var, "KINDLING_READINESS_POLICY", ReadinessPolicy::Fatal)?,
            chart: string("KINDLING_CHART", "rafter-charts/rafter"),
            chart_version: string("KINDLING_CHART_VERSION", ""),
            repo_url: var("KINDLING_REPO_URL"),
            repo_username: var("KINDLING_REPO_USERNAME"),
            repo_password: var("KINDLING_REPO_PASSWORD"),
            verify: parse(&var, "KINDLING_VERIFY", false)?,
            force_dependency_update: parse(&var, "KINDLING_FORCE_DEPENDENCY_UPDATE", false)?,
            release_name: string("KINDLING_RELEASE_NAME", "rafter-release"),
            release_namespace: string("KINDLING_RELEASE_NAMESPACE", "default"),
            release_description: string("KINDLING_RELEASE_DESCRIPTION", "data"),
            release_wait: parse(&var, "KINDLING_RELEASE_WAIT", true)?,
            command_timeout: Duration::from_secs(parse(
                &var,
                "KINDLING_COMMAND_TIMEOUT_SECS",
                600,
            )?),
            http_timeout: Duration::from_secs(parse(&var, "KINDLING_HTTP_TIMEOUT_SECS", 60)?),
            log_level: string("KINDLING_LOG_LEVEL", "info"),
        })
    }

    /// Download cache for chart archives.
    pub fn cache_dir(&self) -> PathBuf {
        self.helm_home.join("cache").join("archive")
    }

    /// Local chart repository and registry.
    pub fn repository_dir(&self) -> PathBuf {
        self.helm_home.join("repository")
    }

    pub fn resolver_config(&self) -> ResolverConfig {
        ResolverConfig {
            repository_dir: self.repository_dir(),
            cache_dir: self.cache_dir(),
            http_timeout: self.http_timeout,
        }
    }

    pub fn artifact_reference(&self) -> ArtifactReference {
        let mut reference = ArtifactReference::new(&self.chart).with_version(&self.chart_version);
        if let Some(url) = &self.repo_url {
            reference = reference.with_repo_url(url);
        }
        if let (Some(username), Some(password)) = (&self.repo_username, &self.repo_password) {
            reference = reference.with_credentials(Credentials::new(username, password));
        }
        reference
    }

    pub fn resolve_options(&self) -> ResolveOptions {
        ResolveOptions {
            verify: self.verify,
            keyring: self.keyring.clone(),
            tls: self.tls.clone(),
        }
    }

    pub fn install_options(&self) -> InstallOptions {
        InstallOptions {
            service_account: self.tiller_service_account.clone(),
            namespace: self.tiller_namespace.clone(),
            max_history: self.max_history,
            auto_mount_token: true,
            image: self.tiller_image.clone(),
        }
    }

    pub fn readiness_deadline(&self) -> ReadinessDeadline {
        ReadinessDeadline::new(self.readiness_interval, self.readiness_timeout)
    }

    pub fn release_options(&self) -> ReleaseOptions {
        ReleaseOptions {
            wait: self.release_wait,
            release_name: self.release_name.clone(),
            description: self.release_description.clone(),
        }
    }
}

fn parse<T, V>(var: &V, key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    V: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| anyhow!("{e}"))
            .with_context(|| format!("invalid value {raw:?} for {key}")),
    }
}
