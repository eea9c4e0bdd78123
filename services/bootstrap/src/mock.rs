//! In-memory collaborators for tests and local development.
//!
//! Every mock records what it was asked to do in a shared [`CallLog`], so a
//! test can assert on the order of external effects across collaborators.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{bail, Result};
use async_trait::async_trait;
use chrono::Utc;
use kindling_chart::{Dependency, CHARTS_DIR, CHART_FILE};
use kindling_reconcile::DependencyFetcher;
use tokio::net::TcpStream;
use tracing::info;

use crate::cluster::{ClusterHandle, ClusterProvider};
use crate::control_plane::{
    ComponentStatus, ControlPlaneInstaller, InstallOptions, DEFAULT_TILLER_IMAGE,
};
use crate::orchestrator::Collaborators;
use crate::release::{ReleaseInstaller, ReleaseOptions, ReleaseResponse};
use crate::resolver::ProvenanceVerifier;
use crate::tunnel::{Forward, PodLocator, PortForwarder};

/// Ordered record of external effects.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    entries: Arc<Mutex<Vec<String>>>,
}

impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, entry: impl Into<String>) {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        entries.push(entry.into());
    }

    pub fn entries(&self) -> Vec<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// True if any entry starts with `prefix`.
    pub fn contains(&self, prefix: &str) -> bool {
        self.entries().iter().any(|e| e.starts_with(prefix))
    }
}

/// Cluster provider that tracks clusters in memory.
#[derive(Debug)]
pub struct MockClusterProvider {
    log: CallLog,
    existing: Mutex<HashSet<String>>,
    fail_create: bool,
}

impl MockClusterProvider {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            existing: Mutex::new(HashSet::new()),
            fail_create: false,
        }
    }

    /// A provider where `name` already exists.
    pub fn with_existing(self, name: &str) -> Self {
        self.existing
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string());
        self
    }

    /// A provider whose creates always fail.
    pub fn failing(log: CallLog) -> Self {
        Self {
            fail_create: true,
            ..Self::new(log)
        }
    }
}

#[async_trait]
impl ClusterProvider for MockClusterProvider {
    async fn create(&self, name: &str, node_image: &str) -> Result<ClusterHandle> {
        self.log.record(format!("cluster.create {name}"));
        if self.fail_create {
            bail!("Mock cluster provider configured to fail");
        }

        let mut existing = self.existing.lock().unwrap_or_else(|e| e.into_inner());
        if !existing.insert(name.to_string()) {
            bail!("cluster {name} already exists");
        }

        info!(cluster = %name, image = %node_image, "[MOCK] Created cluster");
        Ok(ClusterHandle::new(
            name,
            PathBuf::from("/tmp/kindling-mock").join(format!("kind-config-{name}")),
        ))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.log.record(format!("cluster.delete {name}"));
        let mut existing = self.existing.lock().unwrap_or_else(|e| e.into_inner());
        if !existing.remove(name) {
            bail!("cluster {name} does not exist");
        }
        Ok(())
    }
}

/// Control-plane installer that refuses to install twice.
#[derive(Debug)]
pub struct MockControlPlaneInstaller {
    log: CallLog,
    installed: Mutex<HashSet<String>>,
    fail: bool,
}

impl MockControlPlaneInstaller {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            installed: Mutex::new(HashSet::new()),
            fail: false,
        }
    }

    pub fn failing(log: CallLog) -> Self {
        Self {
            fail: true,
            ..Self::new(log)
        }
    }
}

#[async_trait]
impl ControlPlaneInstaller for MockControlPlaneInstaller {
    async fn install(&self, cluster: &ClusterHandle, options: &InstallOptions) -> Result<()> {
        self.log
            .record(format!("control_plane.install {}", options.namespace));
        if self.fail {
            bail!("Mock control plane installer configured to fail");
        }

        let mut installed = self.installed.lock().unwrap_or_else(|e| e.into_inner());
        if !installed.insert(cluster.name().to_string()) {
            bail!("control plane already installed in {}", cluster.name());
        }
        Ok(())
    }
}

/// Component status that reports ready after a number of probes.
#[derive(Debug)]
pub struct MockComponentStatus {
    ready_after: Option<u32>,
    probes: AtomicU32,
}

impl MockComponentStatus {
    /// Ready on probe number `probes + 1`.
    pub fn ready_after(probes: u32) -> Self {
        Self {
            ready_after: Some(probes),
            probes: AtomicU32::new(0),
        }
    }

    pub fn never_ready() -> Self {
        Self {
            ready_after: None,
            probes: AtomicU32::new(0),
        }
    }

    pub fn probes(&self) -> u32 {
        self.probes.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ComponentStatus for MockComponentStatus {
    async fn query_component_image(
        &self,
        _cluster: &ClusterHandle,
        namespace: &str,
    ) -> Result<String> {
        let probe = self.probes.fetch_add(1, Ordering::SeqCst);
        match self.ready_after {
            Some(after) if probe >= after => Ok(DEFAULT_TILLER_IMAGE.to_string()),
            _ => bail!("no running tiller pod in {namespace}"),
        }
    }
}

/// Pod locator with a fixed answer.
#[derive(Debug)]
pub struct MockPodLocator {
    pod: Option<String>,
    namespace: Option<String>,
}

impl MockPodLocator {
    /// Finds `pod` in every namespace.
    pub fn with_pod(pod: &str) -> Self {
        Self {
            pod: Some(pod.to_string()),
            namespace: None,
        }
    }

    /// Finds `pod` only in `namespace`.
    pub fn with_pod_in(pod: &str, namespace: &str) -> Self {
        Self {
            pod: Some(pod.to_string()),
            namespace: Some(namespace.to_string()),
        }
    }

    pub fn empty() -> Self {
        Self {
            pod: None,
            namespace: None,
        }
    }
}

#[async_trait]
impl PodLocator for MockPodLocator {
    async fn find_running_pod(
        &self,
        _cluster: &ClusterHandle,
        namespace: &str,
        _selector: &str,
    ) -> Result<Option<String>> {
        match &self.namespace {
            Some(only) if only != namespace => Ok(None),
            _ => Ok(self.pod.clone()),
        }
    }
}

/// Port forwarder that dials a fixed local address.
#[derive(Debug)]
pub struct MockPortForwarder {
    target: SocketAddr,
    log: CallLog,
}

impl MockPortForwarder {
    pub fn new(target: SocketAddr, log: CallLog) -> Self {
        Self { target, log }
    }
}

/// Records `tunnel.close` once the last reference is dropped.
struct MockForward {
    target: SocketAddr,
    log: CallLog,
}

impl Drop for MockForward {
    fn drop(&mut self) {
        self.log.record("tunnel.close");
    }
}

#[async_trait]
impl Forward for MockForward {
    async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect(self.target).await
    }
}

#[async_trait]
impl PortForwarder for MockPortForwarder {
    async fn forward(
        &self,
        _cluster: &ClusterHandle,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<Arc<dyn Forward>> {
        self.log
            .record(format!("tunnel.forward {namespace}/{pod}:{port}"));
        Ok(Arc::new(MockForward {
            target: self.target,
            log: self.log.clone(),
        }))
    }
}

/// Release installer that records installs and reports `DEPLOYED`.
#[derive(Debug)]
pub struct MockReleaseInstaller {
    log: CallLog,
    fail_ping: bool,
    fail_install: bool,
    hang_install: bool,
}

impl MockReleaseInstaller {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            fail_ping: false,
            fail_install: false,
            hang_install: false,
        }
    }

    pub fn unreachable(log: CallLog) -> Self {
        Self {
            fail_ping: true,
            ..Self::new(log)
        }
    }

    pub fn failing(log: CallLog) -> Self {
        Self {
            fail_install: true,
            ..Self::new(log)
        }
    }

    /// Installs never complete.
    pub fn hanging(log: CallLog) -> Self {
        Self {
            hang_install: true,
            ..Self::new(log)
        }
    }
}

#[async_trait]
impl ReleaseInstaller for MockReleaseInstaller {
    async fn ping(&self, _host: &str) -> Result<()> {
        self.log.record("release.ping");
        if self.fail_ping {
            bail!("connection refused");
        }
        Ok(())
    }

    async fn install_release(
        &self,
        chart_path: &Path,
        namespace: &str,
        options: &ReleaseOptions,
        _host: &str,
    ) -> Result<ReleaseResponse> {
        self.log
            .record(format!("release.install {}", options.release_name));
        if self.fail_install {
            bail!("Mock release installer configured to fail");
        }
        if self.hang_install {
            std::future::pending::<()>().await;
        }

        Ok(ReleaseResponse {
            release_name: options.release_name.clone(),
            namespace: namespace.to_string(),
            status: "DEPLOYED".to_string(),
            installed_at: Utc::now(),
            output: format!("[MOCK] installed {}", chart_path.display()),
        })
    }
}

/// Provenance verifier with a fixed verdict.
#[derive(Debug)]
pub struct MockVerifier {
    accept: bool,
    calls: AtomicU32,
}

impl MockVerifier {
    pub fn accepting() -> Self {
        Self {
            accept: true,
            calls: AtomicU32::new(0),
        }
    }

    pub fn rejecting() -> Self {
        Self {
            accept: false,
            calls: AtomicU32::new(0),
        }
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ProvenanceVerifier for MockVerifier {
    async fn verify(&self, archive: &Path, _keyring: &Path) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.accept {
            bail!("signature of {} does not match", archive.display());
        }
        Ok(())
    }
}

/// Dependency fetcher that writes a minimal chart for each missing
/// dependency.
#[derive(Debug, Default)]
pub struct MockDependencyFetcher {
    calls: AtomicU32,
}

impl MockDependencyFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DependencyFetcher for MockDependencyFetcher {
    async fn fetch(
        &self,
        chart_root: &Path,
        dependencies: &[Dependency],
        _force_update: bool,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for dependency in dependencies {
            let dir = chart_root.join(CHARTS_DIR).join(&dependency.name);
            tokio::fs::create_dir_all(&dir).await?;
            tokio::fs::write(
                dir.join(CHART_FILE),
                format!(
                    "name: {}\nversion: {}\n",
                    dependency.name, dependency.version
                ),
            )
            .await?;
        }
        Ok(())
    }
}

/// A full set of healthy mock collaborators sharing `log`.
///
/// The tunnel forwards to `forward_target`; nothing dials it unless a test
/// connects to the tunnel.
pub fn collaborators(log: &CallLog, forward_target: SocketAddr) -> Collaborators {
    Collaborators {
        clusters: Arc::new(MockClusterProvider::new(log.clone())),
        control_plane: Arc::new(MockControlPlaneInstaller::new(log.clone())),
        status: Arc::new(MockComponentStatus::ready_after(0)),
        pod_locator: Arc::new(MockPodLocator::with_pod("tiller-deploy-5d6cc99fc-xk2v8")),
        port_forwarder: Arc::new(MockPortForwarder::new(forward_target, log.clone())),
        verifier: Arc::new(MockVerifier::accepting()),
        dependency_fetcher: Arc::new(MockDependencyFetcher::new()),
        releases: Arc::new(MockReleaseInstaller::new(log.clone())),
    }
}
