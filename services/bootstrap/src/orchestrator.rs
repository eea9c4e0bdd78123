//! Bootstrap orchestrator.
//!
//! Runs the bootstrap stages strictly in order:
//!
//! ```text
//! Idle -> ClusterReady -> ControlPlaneInstalling -> ControlPlaneReady
//!      -> TunnelOpen -> ArtifactResolved -> DependenciesReconciled
//!      -> ReleaseInstalled
//! ```
//!
//! The first failure moves the machine to `Failed` and skips every later
//! stage. Nothing is rolled back: a provisioned cluster stays up for
//! inspection. Every stage races the shutdown signal.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::bail;
use kindling_chart::{ArtifactReference, PackageDescriptor, ResolvedArtifact};
use kindling_reconcile::{
    DependencyFetcher, DependencyReconciler, ReadinessDeadline, ReadinessGate, Reconciled,
};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::cluster::{ClusterHandle, ClusterProvider, KindProvider};
use crate::config::Config;
use crate::control_plane::{
    ComponentStatus, ControlPlaneInstaller, InstallOptions, TillerInstaller, TillerStatus,
    TILLER_PORT, TILLER_SELECTOR,
};
use crate::error::{BootstrapError, Stage};
use crate::fetch::RepositoryFetcher;
use crate::release::{HelmCliInstaller, ReleaseInstaller, ReleaseOptions, ReleaseResponse};
use crate::resolver::{
    ArtifactResolver, GpgVerifier, ProvenanceVerifier, ResolveOptions, ResolverConfig,
};
use crate::tunnel::{
    KubectlPodLocator, KubectlPortForwarder, PodLocator, PortForwarder, TunnelError,
    TunnelEstablisher, TunnelSession,
};

/// Where the bootstrap flow currently is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BootstrapState {
    Idle,
    ClusterReady,
    ControlPlaneInstalling,
    ControlPlaneReady,
    TunnelOpen,
    ArtifactResolved,
    DependenciesReconciled,
    ReleaseInstalled,
    Failed { stage: Stage, error: String },
}

impl BootstrapState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            BootstrapState::ReleaseInstalled | BootstrapState::Failed { .. }
        )
    }
}

/// What to do when the control plane misses its readiness deadline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadinessPolicy {
    /// Fail the run with [`BootstrapError::Timeout`].
    #[default]
    Fatal,
    /// Log a warning and continue.
    Ignore,
}

impl FromStr for ReadinessPolicy {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fatal" => Ok(ReadinessPolicy::Fatal),
            "ignore" => Ok(ReadinessPolicy::Ignore),
            other => bail!("unknown readiness policy {other:?} (expected \"fatal\" or \"ignore\")"),
        }
    }
}

impl fmt::Display for ReadinessPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReadinessPolicy::Fatal => f.write_str("fatal"),
            ReadinessPolicy::Ignore => f.write_str("ignore"),
        }
    }
}

/// Everything one bootstrap run needs to know.
#[derive(Debug, Clone)]
pub struct BootstrapPlan {
    pub cluster_name: String,
    pub node_image: String,
    pub install: InstallOptions,
    pub readiness: ReadinessDeadline,
    pub readiness_policy: ReadinessPolicy,
    pub artifact: ArtifactReference,
    pub resolve: ResolveOptions,
    pub force_dependency_update: bool,
    pub release_namespace: String,
    pub release: ReleaseOptions,
}

impl BootstrapPlan {
    pub fn from_config(config: &Config) -> Self {
        Self {
            cluster_name: config.cluster_name.clone(),
            node_image: config.node_image.clone(),
            install: config.install_options(),
            readiness: config.readiness_deadline(),
            readiness_policy: config.readiness_policy,
            artifact: config.artifact_reference(),
            resolve: config.resolve_options(),
            force_dependency_update: config.force_dependency_update,
            release_namespace: config.release_namespace.clone(),
            release: config.release_options(),
        }
    }
}

/// External systems the orchestrator drives.
#[derive(Clone)]
pub struct Collaborators {
    pub clusters: Arc<dyn ClusterProvider>,
    pub control_plane: Arc<dyn ControlPlaneInstaller>,
    pub status: Arc<dyn ComponentStatus>,
    pub pod_locator: Arc<dyn PodLocator>,
    pub port_forwarder: Arc<dyn PortForwarder>,
    pub verifier: Arc<dyn ProvenanceVerifier>,
    pub dependency_fetcher: Arc<dyn DependencyFetcher>,
    pub releases: Arc<dyn ReleaseInstaller>,
}

impl Collaborators {
    /// Production wiring: kind, kubectl, helm and gpg.
    pub fn from_config(config: &Config) -> Self {
        let timeout = config.command_timeout;
        Self {
            clusters: Arc::new(KindProvider::new(&config.kube_dir, timeout)),
            control_plane: Arc::new(TillerInstaller::new(timeout)),
            status: Arc::new(TillerStatus::new(timeout)),
            pod_locator: Arc::new(KubectlPodLocator::new(timeout)),
            port_forwarder: Arc::new(KubectlPortForwarder::new(config.http_timeout)),
            verifier: Arc::new(GpgVerifier::new(timeout)),
            dependency_fetcher: Arc::new(RepositoryFetcher::new(
                config.repository_dir(),
                config.http_timeout,
                config.tls.clone(),
            )),
            releases: Arc::new(HelmCliInstaller::new(&config.helm_home, timeout)),
        }
    }
}

/// Result of a completed run.
#[derive(Debug, Clone)]
pub struct BootstrapOutcome {
    pub cluster: ClusterHandle,
    pub artifact: ResolvedArtifact,
    pub chart: PackageDescriptor,
    pub reconciled: Reconciled,
    pub release: ReleaseResponse,
}

/// Drives one bootstrap run through its stages.
pub struct Orchestrator {
    plan: BootstrapPlan,
    collaborators: Collaborators,
    resolver: ArtifactResolver,
    tunnels: TunnelEstablisher,
    reconciler: DependencyReconciler,
    state: BootstrapState,
    history: Vec<BootstrapState>,
}

impl Orchestrator {
    pub fn new(
        plan: BootstrapPlan,
        resolver_config: ResolverConfig,
        collaborators: Collaborators,
    ) -> Self {
        let resolver = ArtifactResolver::new(resolver_config, Arc::clone(&collaborators.verifier));
        let tunnels = TunnelEstablisher::new(
            Arc::clone(&collaborators.pod_locator),
            Arc::clone(&collaborators.port_forwarder),
            TILLER_PORT,
        );
        let reconciler = DependencyReconciler::new(Arc::clone(&collaborators.dependency_fetcher))
            .with_force_update(plan.force_dependency_update);

        Self {
            plan,
            collaborators,
            resolver,
            tunnels,
            reconciler,
            state: BootstrapState::Idle,
            history: vec![BootstrapState::Idle],
        }
    }

    pub fn state(&self) -> &BootstrapState {
        &self.state
    }

    /// Every state entered so far, starting with `Idle`.
    pub fn history(&self) -> &[BootstrapState] {
        &self.history
    }

    /// Run all stages. Fails with [`BootstrapError::Cancelled`] if
    /// `shutdown` flips to `true` before the run completes.
    pub async fn run(
        &mut self,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        match self.execute(&mut shutdown).await {
            Ok(outcome) => {
                info!(
                    cluster = %outcome.cluster.name(),
                    release = %outcome.release.release_name,
                    status = %outcome.release.status,
                    "Bootstrap complete"
                );
                Ok(outcome)
            }
            Err(err) => {
                let stage = err.stage();
                error!(stage = %stage, error = %err, "Bootstrap failed");
                self.transition(BootstrapState::Failed {
                    stage,
                    error: err.to_string(),
                });
                Err(err)
            }
        }
    }

    fn transition(&mut self, next: BootstrapState) {
        debug!(from = ?self.state, to = ?next, "State transition");
        self.state = next.clone();
        self.history.push(next);
    }

    async fn execute(
        &mut self,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        let cluster = guarded(Stage::ClusterRecreate, shutdown, self.recreate_cluster()).await?;
        self.transition(BootstrapState::ClusterReady);

        self.transition(BootstrapState::ControlPlaneInstalling);
        info!(namespace = %self.plan.install.namespace, "Installing control plane");
        guarded(Stage::ControlPlaneInstall, shutdown, async {
            self.collaborators
                .control_plane
                .install(&cluster, &self.plan.install)
                .await
                .map_err(|source| BootstrapError::Install { source })
        })
        .await?;

        guarded(Stage::ReadinessWait, shutdown, self.await_control_plane(&cluster)).await?;
        self.transition(BootstrapState::ControlPlaneReady);

        let tunnel = guarded(Stage::TunnelOpen, shutdown, self.open_tunnel(&cluster)).await?;
        self.transition(BootstrapState::TunnelOpen);

        let result = self.deploy(cluster, &tunnel, shutdown).await;
        tunnel.close().await;
        result
    }

    /// Stages that run while the tunnel is open.
    async fn deploy(
        &mut self,
        cluster: ClusterHandle,
        tunnel: &TunnelSession,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<BootstrapOutcome, BootstrapError> {
        info!(reference = %self.plan.artifact, "Resolving chart");
        let artifact = guarded(Stage::ArtifactResolve, shutdown, async {
            let artifact = self
                .resolver
                .resolve(&self.plan.artifact, &self.plan.resolve)
                .await?;
            Ok::<_, BootstrapError>(artifact)
        })
        .await?;
        info!(
            path = %artifact.local_path.display(),
            source = ?artifact.source,
            verified = artifact.verified,
            "Chart resolved"
        );
        self.transition(BootstrapState::ArtifactResolved);

        let reconciliation = guarded(Stage::DependencyReconcile, shutdown, async {
            let chart = PackageDescriptor::load(&artifact.local_path)?;
            let reconciliation = self.reconciler.reconcile(chart, &artifact.local_path).await?;
            Ok::<_, BootstrapError>(reconciliation)
        })
        .await?;
        info!(
            chart = %reconciliation.descriptor.name(),
            outcome = ?reconciliation.outcome,
            "Dependencies reconciled"
        );
        self.transition(BootstrapState::DependenciesReconciled);

        let host = tunnel.address();
        let release = guarded(Stage::ReleaseInstall, shutdown, async {
            self.collaborators
                .releases
                .install_release(
                    &artifact.local_path,
                    &self.plan.release_namespace,
                    &self.plan.release,
                    &host,
                )
                .await
                .map_err(|source| BootstrapError::ReleaseInstall {
                    release: self.plan.release.release_name.clone(),
                    source,
                })
        })
        .await?;
        self.transition(BootstrapState::ReleaseInstalled);

        Ok(BootstrapOutcome {
            cluster,
            artifact,
            chart: reconciliation.descriptor,
            reconciled: reconciliation.outcome,
            release,
        })
    }

    /// Delete any stale cluster of the same name, then create a fresh one.
    async fn recreate_cluster(&self) -> Result<ClusterHandle, BootstrapError> {
        let name = &self.plan.cluster_name;

        match self.collaborators.clusters.delete(name).await {
            Ok(()) => info!(cluster = %name, "Deleted old cluster"),
            Err(e) => debug!(cluster = %name, error = %e, "No old cluster deleted"),
        }

        info!(cluster = %name, image = %self.plan.node_image, "Creating cluster");
        self.collaborators
            .clusters
            .create(name, &self.plan.node_image)
            .await
            .map_err(|source| BootstrapError::Provisioning {
                cluster: name.clone(),
                source,
            })
    }

    async fn await_control_plane(&self, cluster: &ClusterHandle) -> Result<(), BootstrapError> {
        let deadline = self.plan.readiness;
        let namespace = self.plan.install.namespace.clone();
        info!(
            namespace = %namespace,
            poll_interval_ms = deadline.poll_interval.as_millis() as u64,
            timeout_secs = deadline.total_timeout.as_secs(),
            "Waiting for control plane"
        );

        let status = Arc::clone(&self.collaborators.status);
        let probe_cluster = cluster.clone();
        let probe_namespace = namespace.clone();
        let ready = ReadinessGate::new(deadline)
            .wait(move || {
                let status = Arc::clone(&status);
                let cluster = probe_cluster.clone();
                let namespace = probe_namespace.clone();
                async move {
                    match status.query_component_image(&cluster, &namespace).await {
                        Ok(image) => {
                            debug!(image = %image, "Control plane running");
                            true
                        }
                        Err(e) => {
                            debug!(error = %e, "Control plane not ready");
                            false
                        }
                    }
                }
            })
            .await;

        if ready {
            info!(namespace = %namespace, "Control plane ready");
            return Ok(());
        }

        match self.plan.readiness_policy {
            ReadinessPolicy::Fatal => Err(BootstrapError::Timeout {
                namespace,
                timeout: deadline.total_timeout,
            }),
            ReadinessPolicy::Ignore => {
                warn!(
                    namespace = %namespace,
                    timeout_secs = deadline.total_timeout.as_secs(),
                    "Control plane not ready before deadline; continuing"
                );
                Ok(())
            }
        }
    }

    async fn open_tunnel(&self, cluster: &ClusterHandle) -> Result<TunnelSession, BootstrapError> {
        let namespace = &self.plan.install.namespace;
        let tunnel = self.tunnels.open(cluster, namespace, TILLER_SELECTOR).await?;

        let address = tunnel.address();
        if let Err(source) = self.collaborators.releases.ping(&address).await {
            tunnel.close().await;
            return Err(TunnelError::Unreachable { address, source }.into());
        }
        info!(address = %address, "Control plane pinged");
        Ok(tunnel)
    }
}

/// Run `fut` unless `shutdown` fires first.
async fn guarded<T, F>(
    stage: Stage,
    shutdown: &mut watch::Receiver<bool>,
    fut: F,
) -> Result<T, BootstrapError>
where
    F: Future<Output = Result<T, BootstrapError>>,
{
    if *shutdown.borrow() {
        return Err(BootstrapError::Cancelled { stage });
    }

    tokio::select! {
        result = fut => result,
        _ = shutdown_requested(shutdown) => {
            warn!(stage = %stage, "Shutdown requested");
            Err(BootstrapError::Cancelled { stage })
        }
    }
}

/// Resolves once the shutdown flag is set. Never resolves if the sender is
/// gone without having set it.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_readiness_policy_parse() {
        assert_eq!("fatal".parse::<ReadinessPolicy>().unwrap(), ReadinessPolicy::Fatal);
        assert_eq!(" Ignore ".parse::<ReadinessPolicy>().unwrap(), ReadinessPolicy::Ignore);
        assert!("sometimes".parse::<ReadinessPolicy>().is_err());
        assert_eq!(ReadinessPolicy::default(), ReadinessPolicy::Fatal);
        assert_eq!(ReadinessPolicy::Ignore.to_string(), "ignore");
    }

    #[tokio::test]
    async fn test_guarded_passes_result_through() {
        let (_tx, mut rx) = watch::channel(false);
        let value = guarded(Stage::ReleaseInstall, &mut rx, async { Ok(7) })
            .await
            .unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_guarded_cancels_when_already_shut_down() {
        let (_tx, mut rx) = watch::channel(true);
        let err = guarded(Stage::TunnelOpen, &mut rx, async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            BootstrapError::Cancelled {
                stage: Stage::TunnelOpen
            }
        ));
    }

    #[tokio::test]
    async fn test_guarded_cancels_pending_stage() {
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
            let _ = tx.send(true);
        });

        let err = guarded(Stage::ReadinessWait, &mut rx, async {
            std::future::pending::<Result<(), BootstrapError>>().await
        })
        .await
        .unwrap_err();
        assert_eq!(err.stage(), Stage::ReadinessWait);
    }

    #[tokio::test]
    async fn test_dropped_sender_never_cancels() {
        let (tx, mut rx) = watch::channel(false);
        drop(tx);
        let value = guarded(Stage::ArtifactResolve, &mut rx, async {
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
            Ok("done")
        })
        .await
        .unwrap();
        assert_eq!(value, "done");
    }
}
