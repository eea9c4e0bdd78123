//! Bootstrap error taxonomy.

use std::fmt;
use std::time::Duration;

use kindling_chart::ChartError;
use kindling_reconcile::ReconcileError;
use thiserror::Error;

use crate::resolver::ResolutionError;
use crate::tunnel::TunnelError;

/// A stage of the bootstrap flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    ClusterRecreate,
    ControlPlaneInstall,
    ReadinessWait,
    TunnelOpen,
    ArtifactResolve,
    DependencyReconcile,
    ReleaseInstall,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::ClusterRecreate => "cluster recreation",
            Stage::ControlPlaneInstall => "control-plane install",
            Stage::ReadinessWait => "readiness wait",
            Stage::TunnelOpen => "tunnel open",
            Stage::ArtifactResolve => "artifact resolution",
            Stage::DependencyReconcile => "dependency reconciliation",
            Stage::ReleaseInstall => "release install",
        };
        f.write_str(name)
    }
}

/// Errors that abort a bootstrap run.
#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("while starting cluster {cluster}: {source}")]
    Provisioning {
        cluster: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("while installing the control plane: {source}")]
    Install {
        #[source]
        source: anyhow::Error,
    },

    #[error("control plane in {namespace} not ready after {timeout:?}")]
    Timeout { namespace: String, timeout: Duration },

    #[error("while opening the control-plane tunnel: {0}")]
    Tunnel(#[from] TunnelError),

    #[error("while locating chart path: {0}")]
    Resolution(#[from] ResolutionError),

    #[error("while loading chart: {0}")]
    ChartLoad(#[from] ChartError),

    #[error("while reconciling dependencies: {0}")]
    Reconcile(#[from] ReconcileError),

    #[error("while installing release {release}: {source}")]
    ReleaseInstall {
        release: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("cancelled during {stage}")]
    Cancelled { stage: Stage },
}

impl BootstrapError {
    /// The stage this error belongs to.
    pub fn stage(&self) -> Stage {
        match self {
            BootstrapError::Provisioning { .. } => Stage::ClusterRecreate,
            BootstrapError::Install { .. } => Stage::ControlPlaneInstall,
            BootstrapError::Timeout { .. } => Stage::ReadinessWait,
            BootstrapError::Tunnel(_) => Stage::TunnelOpen,
            BootstrapError::Resolution(_) => Stage::ArtifactResolve,
            BootstrapError::ChartLoad(_) | BootstrapError::Reconcile(_) => {
                Stage::DependencyReconcile
            }
            BootstrapError::ReleaseInstall { .. } => Stage::ReleaseInstall,
            BootstrapError::Cancelled { stage } => *stage,
        }
    }
}
