//! Local tunnel to the in-cluster control-plane component.
//!
//! A tunnel is negotiated in three steps:
//! - find a running pod matching a label selector
//! - open a port-forward to the pod's service port
//! - bind a local listener and relay every accepted connection through the
//!   forward
//!
//! At most one tunnel per `(cluster, namespace, selector)` may be open.

use std::collections::HashSet;
use std::io;
use std::net::SocketAddr;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{copy_bidirectional, AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::process::Child;
use tokio::sync::oneshot;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::cluster::ClusterHandle;
use crate::kubectl::Kubectl;

/// Errors from opening or using a tunnel.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("no running pod matching {selector} in namespace {namespace}")]
    ComponentNotFound { namespace: String, selector: String },

    #[error("a tunnel to {selector} in {namespace} on cluster {cluster} is already open")]
    AlreadyOpen {
        cluster: String,
        namespace: String,
        selector: String,
    },

    #[error("failed to look up pods in {namespace}: {source}")]
    Lookup {
        namespace: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to forward to pod {pod}: {source}")]
    Forward {
        pod: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("control plane at {address} is unreachable: {source}")]
    Unreachable {
        address: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to bind local tunnel port: {0}")]
    Bind(#[source] io::Error),
}

/// Finds the pod backing the control-plane component.
#[async_trait]
pub trait PodLocator: Send + Sync {
    /// Name of a running pod matching `selector`, if any.
    async fn find_running_pod(
        &self,
        cluster: &ClusterHandle,
        namespace: &str,
        selector: &str,
    ) -> Result<Option<String>>;
}

/// Opens a forward to a port of a pod.
#[async_trait]
pub trait PortForwarder: Send + Sync {
    async fn forward(
        &self,
        cluster: &ClusterHandle,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<Arc<dyn Forward>>;
}

/// An open forward. Dropping the last reference closes it.
#[async_trait]
pub trait Forward: Send + Sync {
    /// Dial the remote port.
    async fn connect(&self) -> io::Result<TcpStream>;
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct TunnelKey {
    cluster: String,
    namespace: String,
    selector: String,
}

type ActiveTunnels = Arc<Mutex<HashSet<TunnelKey>>>;

/// Holds a tunnel key in the active set until dropped.
struct Reservation {
    active: ActiveTunnels,
    key: TunnelKey,
}

impl Reservation {
    fn acquire(active: &ActiveTunnels, key: TunnelKey) -> Result<Self, TunnelError> {
        let mut guard = active.lock().unwrap_or_else(|e| e.into_inner());
        if !guard.insert(key.clone()) {
            return Err(TunnelError::AlreadyOpen {
                cluster: key.cluster,
                namespace: key.namespace,
                selector: key.selector,
            });
        }
        Ok(Self {
            active: Arc::clone(active),
            key,
        })
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        let mut guard = self.active.lock().unwrap_or_else(|e| e.into_inner());
        guard.remove(&self.key);
    }
}

/// Negotiates tunnels to a fixed remote port.
pub struct TunnelEstablisher {
    locator: Arc<dyn PodLocator>,
    forwarder: Arc<dyn PortForwarder>,
    remote_port: u16,
    active: ActiveTunnels,
}

impl TunnelEstablisher {
    pub fn new(
        locator: Arc<dyn PodLocator>,
        forwarder: Arc<dyn PortForwarder>,
        remote_port: u16,
    ) -> Self {
        Self {
            locator,
            forwarder,
            remote_port,
            active: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Open a tunnel to the component matching `selector` in `namespace`.
    pub async fn open(
        &self,
        cluster: &ClusterHandle,
        namespace: &str,
        selector: &str,
    ) -> Result<TunnelSession, TunnelError> {
        let reservation = Reservation::acquire(
            &self.active,
            TunnelKey {
                cluster: cluster.name().to_string(),
                namespace: namespace.to_string(),
                selector: selector.to_string(),
            },
        )?;

        let pod = self
            .locator
            .find_running_pod(cluster, namespace, selector)
            .await
            .map_err(|source| TunnelError::Lookup {
                namespace: namespace.to_string(),
                source,
            })?
            .ok_or_else(|| TunnelError::ComponentNotFound {
                namespace: namespace.to_string(),
                selector: selector.to_string(),
            })?;

        let forward = self
            .forwarder
            .forward(cluster, namespace, &pod, self.remote_port)
            .await
            .map_err(|source| TunnelError::Forward {
                pod: pod.clone(),
                source,
            })?;

        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .map_err(TunnelError::Bind)?;
        let local_addr = listener.local_addr().map_err(TunnelError::Bind)?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let relay = tokio::spawn(relay(listener, forward, shutdown_rx));

        info!(
            local_addr = %local_addr,
            namespace = %namespace,
            pod = %pod,
            remote_port = self.remote_port,
            "Tunnel open"
        );

        Ok(TunnelSession {
            local_addr,
            namespace: namespace.to_string(),
            selector: selector.to_string(),
            pod,
            shutdown: Some(shutdown_tx),
            relay: Some(relay),
            _reservation: reservation,
        })
    }
}

async fn relay(
    listener: TcpListener,
    forward: Arc<dyn Forward>,
    mut shutdown: oneshot::Receiver<()>,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => break,
            accepted = listener.accept() => match accepted {
                Ok((mut inbound, peer)) => {
                    let forward = Arc::clone(&forward);
                    connections.spawn(async move {
                        let mut outbound = match forward.connect().await {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!(peer = %peer, error = %e, "Tunnel dial failed");
                                return;
                            }
                        };
                        match copy_bidirectional(&mut inbound, &mut outbound).await {
                            Ok((sent, received)) => {
                                debug!(peer = %peer, sent, received, "Tunnel connection closed");
                            }
                            Err(e) => debug!(peer = %peer, error = %e, "Tunnel connection error"),
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "Tunnel accept error");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            },
            Some(_) = connections.join_next(), if !connections.is_empty() => {}
        }
    }

    connections.shutdown().await;
}

/// An open tunnel. Release it with [`TunnelSession::close`]; dropping it
/// also stops the relay and frees the key.
pub struct TunnelSession {
    local_addr: SocketAddr,
    namespace: String,
    selector: String,
    pod: String,
    shutdown: Option<oneshot::Sender<()>>,
    relay: Option<JoinHandle<()>>,
    _reservation: Reservation,
}

impl TunnelSession {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// `host:port` form of the local address.
    pub fn address(&self) -> String {
        self.local_addr.to_string()
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn selector(&self) -> &str {
        &self.selector
    }

    pub fn pod(&self) -> &str {
        &self.pod
    }

    /// Stop the relay and wait for it to exit.
    pub async fn close(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(relay) = self.relay.take() {
            if let Err(e) = relay.await {
                warn!(error = %e, "Tunnel relay ended abnormally");
            }
        }
        info!(local_addr = %self.local_addr, "Tunnel closed");
    }
}

impl Drop for TunnelSession {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(relay) = self.relay.take() {
            relay.abort();
        }
    }
}

impl std::fmt::Debug for TunnelSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TunnelSession")
            .field("local_addr", &self.local_addr)
            .field("namespace", &self.namespace)
            .field("selector", &self.selector)
            .field("pod", &self.pod)
            .finish()
    }
}

/// [`PodLocator`] backed by `kubectl get pods`.
#[derive(Debug, Clone)]
pub struct KubectlPodLocator {
    timeout: Duration,
}

impl KubectlPodLocator {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

#[async_trait]
impl PodLocator for KubectlPodLocator {
    async fn find_running_pod(
        &self,
        cluster: &ClusterHandle,
        namespace: &str,
        selector: &str,
    ) -> Result<Option<String>> {
        let pods = Kubectl::new(cluster, self.timeout)
            .running_pods(namespace, selector)
            .await?;
        Ok(pods.into_iter().next())
    }
}

/// [`PortForwarder`] backed by `kubectl port-forward`.
#[derive(Debug, Clone)]
pub struct KubectlPortForwarder {
    connect_timeout: Duration,
}

impl KubectlPortForwarder {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

/// A running `kubectl port-forward`. The child is killed on drop.
struct KubectlForward {
    local_port: u16,
    _child: Mutex<Child>,
}

#[async_trait]
impl Forward for KubectlForward {
    async fn connect(&self) -> io::Result<TcpStream> {
        TcpStream::connect(("127.0.0.1", self.local_port)).await
    }
}

#[async_trait]
impl PortForwarder for KubectlPortForwarder {
    async fn forward(
        &self,
        cluster: &ClusterHandle,
        namespace: &str,
        pod: &str,
        port: u16,
    ) -> Result<Arc<dyn Forward>> {
        let command = Kubectl::new(cluster, self.connect_timeout).command([
            "port-forward".to_string(),
            "--namespace".to_string(),
            namespace.to_string(),
            format!("pod/{pod}"),
            format!(":{port}"),
        ]);
        debug!(command = %command.display(), "Starting port-forward");

        let mut child = command
            .to_command()
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("failed to spawn kubectl port-forward")?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout of kubectl port-forward was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr of kubectl port-forward was not captured"))?;

        let mut stdout = BufReader::new(stdout).lines();
        let wait_for_port = async {
            while let Some(line) = stdout.next_line().await? {
                if let Some(local_port) = parse_forwarding_line(&line) {
                    return Ok(Some(local_port));
                }
            }
            Ok::<_, io::Error>(None)
        };

        let local_port = match tokio::time::timeout(self.connect_timeout, wait_for_port).await {
            Ok(Ok(Some(local_port))) => local_port,
            Ok(Ok(None)) => {
                let mut message = String::new();
                let mut stderr = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = stderr.next_line().await {
                    message.push_str(line.trim());
                    message.push(' ');
                }
                anyhow::bail!("kubectl port-forward exited: {}", message.trim());
            }
            Ok(Err(e)) => return Err(e).context("failed to read kubectl port-forward output"),
            Err(_) => anyhow::bail!(
                "kubectl port-forward did not report a local port within {:?}",
                self.connect_timeout
            ),
        };

        // Keep the pipes drained for the lifetime of the forward.
        tokio::spawn(async move {
            let mut stderr = BufReader::new(stderr).lines();
            let (mut stdout_open, mut stderr_open) = (true, true);
            while stdout_open || stderr_open {
                tokio::select! {
                    line = stdout.next_line(), if stdout_open => match line {
                        Ok(Some(line)) => debug!(line = %line, "port-forward"),
                        _ => stdout_open = false,
                    },
                    line = stderr.next_line(), if stderr_open => match line {
                        Ok(Some(line)) => warn!(line = %line, "port-forward"),
                        _ => stderr_open = false,
                    },
                }
            }
        });

        Ok(Arc::new(KubectlForward {
            local_port,
            _child: Mutex::new(child),
        }))
    }
}

/// Parse the local port from a `Forwarding from 127.0.0.1:<port> -> <remote>`
/// line printed by `kubectl port-forward`.
pub fn parse_forwarding_line(line: &str) -> Option<u16> {
    let rest = line.trim().strip_prefix("Forwarding from 127.0.0.1:")?;
    let port = rest.split_whitespace().next()?;
    port.parse().ok()
}
