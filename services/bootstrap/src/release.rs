//! Release installation through the control plane.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::process::ToolCommand;

/// Seconds the helm client waits for a Tiller connection.
pub const TILLER_CONNECTION_TIMEOUT_SECS: u64 = 300;

/// How a release is installed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReleaseOptions {
    /// Wait until all release resources are ready.
    pub wait: bool,
    pub release_name: String,
    pub description: String,
}

/// Result of a release install.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseResponse {
    pub release_name: String,
    pub namespace: String,
    /// Status reported by the control plane, e.g. `DEPLOYED`.
    pub status: String,
    pub installed_at: DateTime<Utc>,
    /// Raw installer output.
    pub output: String,
}

/// Installs charts through the control-plane component.
#[async_trait]
pub trait ReleaseInstaller: Send + Sync {
    /// Check that the control plane at `host` answers.
    async fn ping(&self, host: &str) -> Result<()>;

    async fn install_release(
        &self,
        chart_path: &Path,
        namespace: &str,
        options: &ReleaseOptions,
        host: &str,
    ) -> Result<ReleaseResponse>;
}

/// [`ReleaseInstaller`] backed by the Helm 2 CLI.
#[derive(Debug, Clone)]
pub struct HelmCliInstaller {
    binary: String,
    helm_home: PathBuf,
    timeout: Duration,
}

impl HelmCliInstaller {
    pub fn new(helm_home: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            binary: "helm".to_string(),
            helm_home: helm_home.into(),
            timeout,
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    fn command(&self, host: &str) -> ToolCommand {
        ToolCommand::new(&self.binary)
            .arg("--host")
            .arg(host)
            .arg("--home")
            .arg(self.helm_home.display().to_string())
            .arg("--tiller-connection-timeout")
            .arg(TILLER_CONNECTION_TIMEOUT_SECS.to_string())
            .timeout(self.timeout)
    }

    fn install_command(
        &self,
        chart_path: &Path,
        namespace: &str,
        options: &ReleaseOptions,
        host: &str,
    ) -> ToolCommand {
        let mut command = self
            .command(host)
            .arg("install")
            .arg(chart_path.display().to_string())
            .args(["--namespace", namespace])
            .args(["--name", options.release_name.as_str()])
            .args(["--description", options.description.as_str()]);
        if options.wait {
            command = command.arg("--wait");
        }
        command
    }
}

#[async_trait]
impl ReleaseInstaller for HelmCliInstaller {
    async fn ping(&self, host: &str) -> Result<()> {
        self.command(host).arg("version").arg("--server").output().await?;
        Ok(())
    }

    async fn install_release(
        &self,
        chart_path: &Path,
        namespace: &str,
        options: &ReleaseOptions,
        host: &str,
    ) -> Result<ReleaseResponse> {
        info!(
            release = %options.release_name,
            namespace = %namespace,
            chart = %chart_path.display(),
            "Installing release"
        );

        let output = self
            .install_command(chart_path, namespace, options, host)
            .output()
            .await?;

        Ok(ReleaseResponse {
            release_name: options.release_name.clone(),
            namespace: namespace.to_string(),
            status: parse_status(&output).unwrap_or_else(|| "UNKNOWN".to_string()),
            installed_at: Utc::now(),
            output,
        })
    }
}

/// Extract the `STATUS:` value from `helm install` output.
pub fn parse_status(output: &str) -> Option<String> {
    output
        .lines()
        .find_map(|line| line.trim().strip_prefix("STATUS:"))
        .map(|status| status.trim().to_string())
        .filter(|status| !status.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_status() {
        let output = "NAME:   rafter-release\nLAST DEPLOYED: Mon Nov 25 10:00:00 2019\nNAMESPACE: default\nSTATUS: DEPLOYED\n\nRESOURCES:\n";
        assert_eq!(parse_status(output).as_deref(), Some("DEPLOYED"));
        assert_eq!(parse_status("no status here"), None);
        assert_eq!(parse_status("STATUS:   \n"), None);
    }

    #[test]
    fn test_install_command() {
        let installer = HelmCliInstaller::new("/home/ci/.helm", Duration::from_secs(60));
        let options = ReleaseOptions {
            wait: true,
            release_name: "rafter-release".to_string(),
            description: "data".to_string(),
        };

        let command = installer.install_command(
            Path::new("/cache/rafter-0.2.0.tgz"),
            "default",
            &options,
            "127.0.0.1:40123",
        );
        assert_eq!(
            command.display(),
            "helm --host 127.0.0.1:40123 --home /home/ci/.helm --tiller-connection-timeout 300 \
             install /cache/rafter-0.2.0.tgz --namespace default --name rafter-release \
             --description data --wait"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_install_release_reads_status() {
        let temp = tempfile::TempDir::new().unwrap();
        let helm = kindling_testing::stub_tool(
            temp.path(),
            "helm",
            "printf 'NAME:   rafter-release\\nNAMESPACE: default\\nSTATUS: DEPLOYED\\n'",
        )
        .unwrap();
        let installer = HelmCliInstaller::new(temp.path().join("helm"), Duration::from_secs(5))
            .with_binary(helm.display().to_string());
        let options = ReleaseOptions {
            wait: false,
            release_name: "rafter-release".to_string(),
            description: "data".to_string(),
        };

        installer.ping("127.0.0.1:40123").await.unwrap();
        let response = installer
            .install_release(
                Path::new("/cache/rafter-0.2.0.tgz"),
                "default",
                &options,
                "127.0.0.1:40123",
            )
            .await
            .unwrap();
        assert_eq!(response.status, "DEPLOYED");
        assert_eq!(response.release_name, "rafter-release");
        assert!(response.output.contains("NAMESPACE: default"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_ping_fails_when_tiller_is_unreachable() {
        let temp = tempfile::TempDir::new().unwrap();
        let helm = kindling_testing::stub_tool(
            temp.path(),
            "helm",
            "echo 'Error: could not find tiller' >&2; exit 1",
        )
        .unwrap();
        let installer = HelmCliInstaller::new(temp.path().join("helm"), Duration::from_secs(5))
            .with_binary(helm.display().to_string());

        let err = installer.ping("127.0.0.1:40123").await.unwrap_err();
        assert!(err.to_string().contains("could not find tiller"));
    }
}
