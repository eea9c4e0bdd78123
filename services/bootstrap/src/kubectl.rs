//! Thin `kubectl` wrapper bound to one cluster's kubeconfig.

use std::time::Duration;

use anyhow::Result;

use crate::cluster::ClusterHandle;
use crate::process::ToolCommand;

#[derive(Debug, Clone)]
pub struct Kubectl {
    binary: String,
    kubeconfig: String,
    timeout: Duration,
}

impl Kubectl {
    pub fn new(cluster: &ClusterHandle, timeout: Duration) -> Self {
        Self {
            binary: "kubectl".to_string(),
            kubeconfig: cluster.kubeconfig().display().to_string(),
            timeout,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    /// A kubectl invocation with `--kubeconfig` already set.
    pub fn command<I, S>(&self, args: I) -> ToolCommand
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        ToolCommand::new(&self.binary)
            .arg("--kubeconfig")
            .arg(&self.kubeconfig)
            .args(args)
            .timeout(self.timeout)
    }

    pub async fn run<I, S>(&self, args: I) -> Result<String>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.command(args).output().await
    }

    /// `kubectl create -f -`. Fails if any object already exists.
    pub async fn create(&self, manifest: &str) -> Result<String> {
        self.command(["create", "-f", "-"])
            .stdin(manifest.as_bytes().to_vec())
            .output()
            .await
    }

    /// Names of running pods matching `selector` in `namespace`.
    pub async fn running_pods(&self, namespace: &str, selector: &str) -> Result<Vec<String>> {
        let out = self
            .run(running_pods_args(namespace, selector, "{.items[*].metadata.name}"))
            .await?;
        Ok(out.split_whitespace().map(str::to_string).collect())
    }
}

/// Arguments for listing running pods with a jsonpath projection.
pub(crate) fn running_pods_args(namespace: &str, selector: &str, jsonpath: &str) -> Vec<String> {
    vec![
        "get".to_string(),
        "pods".to_string(),
        "--namespace".to_string(),
        namespace.to_string(),
        "--selector".to_string(),
        selector.to_string(),
        "--field-selector=status.phase=Running".to_string(),
        "--output".to_string(),
        format!("jsonpath={jsonpath}"),
    ]
}
