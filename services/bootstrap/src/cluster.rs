//! Cluster lifecycle provider interface and the kind implementation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tracing::info;

use crate::process::ToolCommand;

/// A provisioned cluster and how to reach it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterHandle {
    name: String,
    kubeconfig: PathBuf,
}

impl ClusterHandle {
    pub fn new(name: impl Into<String>, kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            kubeconfig: kubeconfig.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kubeconfig(&self) -> &Path {
        &self.kubeconfig
    }
}

/// Creates and deletes disposable clusters.
#[async_trait]
pub trait ClusterProvider: Send + Sync {
    /// Create a cluster named `name` running `node_image`.
    async fn create(&self, name: &str, node_image: &str) -> Result<ClusterHandle>;

    /// Delete the cluster named `name`. Fails if it does not exist.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Path of the kubeconfig for a cluster.
    fn kubeconfig_path(&self, handle: &ClusterHandle) -> PathBuf {
        handle.kubeconfig.clone()
    }
}

/// [`ClusterProvider`] backed by the `kind` CLI.
#[derive(Debug, Clone)]
pub struct KindProvider {
    binary: String,
    kubeconfig_dir: PathBuf,
    timeout: Duration,
}

impl KindProvider {
    pub fn new(kubeconfig_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: "kind".to_string(),
            kubeconfig_dir: kubeconfig_dir.into(),
            timeout,
        }
    }

    /// Use a different `kind` executable.
    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// Where the kubeconfig for cluster `name` is written.
    pub fn kubeconfig_for(&self, name: &str) -> PathBuf {
        self.kubeconfig_dir.join(format!("kind-config-{name}"))
    }

    fn create_command(&self, name: &str, node_image: &str) -> ToolCommand {
        ToolCommand::new(&self.binary)
            .args(["create", "cluster", "--name", name, "--image", node_image])
            .arg("--kubeconfig")
            .arg(self.kubeconfig_for(name).display().to_string())
            .timeout(self.timeout)
    }

    fn delete_command(&self, name: &str) -> ToolCommand {
        ToolCommand::new(&self.binary)
            .args(["delete", "cluster", "--name", name])
            .arg("--kubeconfig")
            .arg(self.kubeconfig_for(name).display().to_string())
            .timeout(self.timeout)
    }
}

#[async_trait]
impl ClusterProvider for KindProvider {
    async fn create(&self, name: &str, node_image: &str) -> Result<ClusterHandle> {
        tokio::fs::create_dir_all(&self.kubeconfig_dir).await?;

        info!(cluster = %name, image = %node_image, "Creating kind cluster");
        self.create_command(name, node_image).output().await?;

        Ok(ClusterHandle::new(name, self.kubeconfig_for(name)))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        // `kind delete` succeeds for unknown clusters, so check first to keep
        // "nothing to delete" distinguishable from a real deletion.
        let clusters = ToolCommand::new(&self.binary)
            .args(["get", "clusters"])
            .timeout(self.timeout)
            .output()
            .await?;
        if !clusters.lines().any(|line| line.trim() == name) {
            anyhow::bail!("cluster {name} does not exist");
        }

        self.delete_command(name).output().await?;
        Ok(())
    }
}
