//! Integration tests for tunnel negotiation.
//!
//! The "remote" end of every tunnel is a local TCP echo backend reached
//! through the mock port forwarder.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use kindling_bootstrap::control_plane::{TILLER_PORT, TILLER_SELECTOR};
use kindling_bootstrap::mock::{CallLog, MockPodLocator, MockPortForwarder};
use kindling_bootstrap::{ClusterHandle, TunnelError, TunnelEstablisher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

struct TcpEchoBackend {
    addr: SocketAddr,
    _shutdown_tx: oneshot::Sender<()>,
}

impl TcpEchoBackend {
    async fn spawn() -> io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, mut shutdown_rx) = oneshot::channel::<()>();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((mut stream, _)) => {
                            tokio::spawn(async move {
                                let mut buf = vec![0u8; 8192];
                                loop {
                                    match stream.read(&mut buf).await {
                                        Ok(0) | Err(_) => break,
                                        Ok(n) => {
                                            if stream.write_all(&buf[..n]).await.is_err() {
                                                break;
                                            }
                                        }
                                    }
                                }
                            });
                        }
                        Err(_) => break,
                    },
                    _ = &mut shutdown_rx => break,
                }
            }
        });

        Ok(Self {
            addr,
            _shutdown_tx: shutdown_tx,
        })
    }
}

fn cluster() -> ClusterHandle {
    ClusterHandle::new("kind-ci", "/tmp/kind-config-kind-ci")
}

fn establisher(locator: MockPodLocator, target: SocketAddr, log: &CallLog) -> TunnelEstablisher {
    TunnelEstablisher::new(
        Arc::new(locator),
        Arc::new(MockPortForwarder::new(target, log.clone())),
        TILLER_PORT,
    )
}

async fn echo_through(addr: SocketAddr, payload: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(payload).await.unwrap();
    let mut buf = vec![0u8; payload.len()];
    stream.read_exact(&mut buf).await.unwrap();
    buf
}

#[tokio::test]
async fn test_tunnel_relays_to_component() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let log = CallLog::new();
    let tunnels = establisher(
        MockPodLocator::with_pod("tiller-deploy-abc"),
        backend.addr,
        &log,
    );

    let session = tunnels
        .open(&cluster(), "kube-system", TILLER_SELECTOR)
        .await
        .unwrap();

    assert!(session.local_addr().ip().is_loopback());
    assert_ne!(session.local_addr().port(), 0);
    assert_eq!(session.pod(), "tiller-deploy-abc");
    assert_eq!(
        log.entries(),
        [format!("tunnel.forward kube-system/tiller-deploy-abc:{TILLER_PORT}")]
    );

    assert_eq!(echo_through(session.local_addr(), b"ping").await, b"ping");
    assert_eq!(echo_through(session.local_addr(), b"second").await, b"second");

    session.close().await;
    assert_eq!(log.entries().last().unwrap(), "tunnel.close");
}

#[tokio::test]
async fn test_missing_component_is_not_found_and_binds_nothing() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let log = CallLog::new();
    let tunnels = establisher(
        MockPodLocator::with_pod_in("tiller-deploy-abc", "kube-system"),
        backend.addr,
        &log,
    );

    let err = tunnels
        .open(&cluster(), "tooling", TILLER_SELECTOR)
        .await
        .unwrap_err();

    assert!(matches!(err, TunnelError::ComponentNotFound { .. }));
    assert!(log.entries().is_empty());

    // The failed attempt holds no reservation.
    let session = tunnels
        .open(&cluster(), "kube-system", TILLER_SELECTOR)
        .await
        .unwrap();
    session.close().await;
}

#[tokio::test]
async fn test_second_open_is_rejected_until_closed() {
    let backend = TcpEchoBackend::spawn().await.unwrap();
    let log = CallLog::new();
    let tunnels = establisher(
        MockPodLocator::with_pod("tiller-deploy-abc"),
        backend.addr,
        &log,
    );

    let first = tunnels
        .open(&cluster(), "kube-system", TILLER_SELECTOR)
        .await
        .unwrap();

    let err = tunnels
        .open(&cluster(), "kube-system", TILLER_SELECTOR)
        .await
        .unwrap_err();
    assert!(matches!(err, TunnelError::AlreadyOpen { .. }));

    // A different selector is a different tunnel.
    let other = tunnels
        .open(&cluster(), "kube-system", "app=helm,name=other")
        .await
        .unwrap();
    other.close().await;

    let first_addr = first.local_addr();
    first.close().await;
    assert!(TcpStream::connect(first_addr).await.is_err());

    let reopened = tunnels
        .open(&cluster(), "kube-system", TILLER_SELECTOR)
        .await
        .unwrap();
    assert_eq!(echo_through(reopened.local_addr(), b"again").await, b"again");
    drop(reopened);

    // Drop also releases the key.
    let after_drop = tunnels
        .open(&cluster(), "kube-system", TILLER_SELECTOR)
        .await
        .unwrap();
    after_drop.close().await;
}

#[tokio::test]
async fn test_empty_namespace_has_no_component() {
    let log = CallLog::new();
    let tunnels = establisher(
        MockPodLocator::empty(),
        "127.0.0.1:9".parse().unwrap(),
        &log,
    );

    let err = tunnels
        .open(&cluster(), "kube-system", TILLER_SELECTOR)
        .await
        .unwrap_err();
    assert!(err.to_string().contains(TILLER_SELECTOR));
}
