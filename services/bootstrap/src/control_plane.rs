//! Control-plane component (Tiller) installation and status.
//!
//! The installer renders the same objects `helm init --service-account`
//! would create and submits them with `kubectl create`. The status probe is
//! the readiness predicate: it succeeds once a Tiller pod is running.

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, info};

use crate::cluster::ClusterHandle;
use crate::kubectl::{running_pods_args, Kubectl};

/// Label selector of the Tiller pods.
pub const TILLER_SELECTOR: &str = "app=helm,name=tiller";

/// gRPC port Tiller listens on.
pub const TILLER_PORT: u16 = 44134;

/// Port of Tiller's health endpoints.
pub const TILLER_PROBE_PORT: u16 = 44135;

/// Name of the Tiller deployment and service.
pub const TILLER_DEPLOYMENT: &str = "tiller-deploy";

pub const DEFAULT_TILLER_IMAGE: &str = "gcr.io/kubernetes-helm/tiller:v2.16.1";

/// Parameters of a control-plane install.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub service_account: String,
    pub namespace: String,
    /// Maximum release revisions Tiller keeps per release. Zero means unlimited.
    pub max_history: u32,
    pub auto_mount_token: bool,
    pub image: String,
}

impl Default for InstallOptions {
    fn default() -> Self {
        Self {
            service_account: "tiller".to_string(),
            namespace: "kube-system".to_string(),
            max_history: 200,
            auto_mount_token: true,
            image: DEFAULT_TILLER_IMAGE.to_string(),
        }
    }
}

/// Installs the control-plane component into a cluster.
///
/// One-shot: installing twice into the same cluster fails.
#[async_trait]
pub trait ControlPlaneInstaller: Send + Sync {
    async fn install(&self, cluster: &ClusterHandle, options: &InstallOptions) -> Result<()>;
}

/// Reports whether the control-plane component is running.
#[async_trait]
pub trait ComponentStatus: Send + Sync {
    /// Image of the running component. An error means "not ready yet".
    async fn query_component_image(&self, cluster: &ClusterHandle, namespace: &str)
        -> Result<String>;
}

/// Render the Tiller manifests as a multi-document YAML stream.
pub fn render_manifest(options: &InstallOptions) -> Result<String> {
    let labels = json!({ "app": "helm", "name": "tiller" });

    let service_account = json!({
        "apiVersion": "v1",
        "kind": "ServiceAccount",
        "metadata": {
            "name": options.service_account,
            "namespace": options.namespace,
        },
    });

    let binding = json!({
        "apiVersion": "rbac.authorization.k8s.io/v1",
        "kind": "ClusterRoleBinding",
        "metadata": { "name": options.service_account },
        "roleRef": {
            "apiGroup": "rbac.authorization.k8s.io",
            "kind": "ClusterRole",
            "name": "cluster-admin",
        },
        "subjects": [{
            "kind": "ServiceAccount",
            "name": options.service_account,
            "namespace": options.namespace,
        }],
    });

    let probe = |path: &str| {
        json!({
            "httpGet": { "path": path, "port": TILLER_PROBE_PORT },
            "initialDelaySeconds": 1,
            "timeoutSeconds": 1,
        })
    };

    let deployment = json!({
        "apiVersion": "apps/v1",
        "kind": "Deployment",
        "metadata": {
            "name": TILLER_DEPLOYMENT,
            "namespace": options.namespace,
            "labels": labels,
        },
        "spec": {
            "replicas": 1,
            "selector": { "matchLabels": labels },
            "template": {
                "metadata": { "labels": labels },
                "spec": {
                    "serviceAccountName": options.service_account,
                    "automountServiceAccountToken": options.auto_mount_token,
                    "containers": [{
                        "name": "tiller",
                        "image": options.image,
                        "imagePullPolicy": "IfNotPresent",
                        "ports": [
                            { "name": "tiller", "containerPort": TILLER_PORT },
                            { "name": "http", "containerPort": TILLER_PROBE_PORT },
                        ],
                        "env": [
                            { "name": "TILLER_NAMESPACE", "value": options.namespace },
                            { "name": "TILLER_HISTORY_MAX", "value": options.max_history.to_string() },
                        ],
                        "livenessProbe": probe("/liveness"),
                        "readinessProbe": probe("/readiness"),
                    }],
                },
            },
        },
    });

    let service = json!({
        "apiVersion": "v1",
        "kind": "Service",
        "metadata": {
            "name": TILLER_DEPLOYMENT,
            "namespace": options.namespace,
            "labels": labels,
        },
        "spec": {
            "type": "ClusterIP",
            "selector": labels,
            "ports": [{ "name": "tiller", "port": TILLER_PORT, "targetPort": "tiller" }],
        },
    });

    let documents = [service_account, binding, deployment, service]
        .iter()
        .map(serde_yaml::to_string)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(documents.join("---\n"))
}

/// [`ControlPlaneInstaller`] that submits the Tiller manifests with kubectl.
#[derive(Debug, Clone)]
pub struct TillerInstaller {
    timeout: Duration,
}

impl TillerInstaller {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ControlPlaneInstaller for TillerInstaller {
    async fn install(&self, cluster: &ClusterHandle, options: &InstallOptions) -> Result<()> {
        let manifest = render_manifest(options)?;

        info!(
            cluster = %cluster.name(),
            namespace = %options.namespace,
            service_account = %options.service_account,
            image = %options.image,
            "Installing Tiller"
        );

        let out = Kubectl::new(cluster, self.timeout).create(&manifest).await?;
        debug!(output = %out.trim(), "kubectl create finished");
        Ok(())
    }
}

/// [`ComponentStatus`] that asks kubectl for running Tiller pods.
#[derive(Debug, Clone)]
pub struct TillerStatus {
    timeout: Duration,
}

impl TillerStatus {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl ComponentStatus for TillerStatus {
    async fn query_component_image(
        &self,
        cluster: &ClusterHandle,
        namespace: &str,
    ) -> Result<String> {
        let out = Kubectl::new(cluster, self.timeout)
            .run(running_pods_args(
                namespace,
                TILLER_SELECTOR,
                "{.items[0].spec.containers[0].image}",
            ))
            .await?;

        let image = out.trim();
        if image.is_empty() {
            bail!("no running tiller pod in {namespace}");
        }
        Ok(image.to_string())
    }
}
