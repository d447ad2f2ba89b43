use crate::errors::{PodwireError, Result};
use crate::k8s::client::K8sClient;
use std::net::SocketAddr;
use tokio::io::copy_bidirectional;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Remote port the SSH server listens on inside the mutated pod.
pub const REMOTE_SSH_PORT: u16 = 2222;

/// The single primary forward from a local ephemeral port to the pod's SSH
/// port. Every SSH tunnel and the foreground terminal dials through this.
///
/// Grounded on `pkg/remote/portforward.go`'s `ensureRemoteSSHPortForward`
/// and `pkg/k8s/client.go`'s `PortForward`.
pub struct PrimaryForward {
    pub local_addr: SocketAddr,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PrimaryForward {
    pub fn local_port(&self) -> u16 {
        self.local_addr.port()
    }

    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Starts the primary port-forward: binds an OS-assigned local port, then
/// for every accepted connection opens the pod's `portforward` subresource
/// to `REMOTE_SSH_PORT` and pipes bytes both ways. Blocks until the listener
/// is bound and ready to accept (not until a connection actually succeeds —
/// the forward is lazy per spec.md's "started in a background task").
pub async fn start_primary_forward(
    client: K8sClient,
    namespace: String,
    pod_name: String,
) -> Result<PrimaryForward> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|_| PodwireError::PodNotReady)?;
    let local_addr = listener
        .local_addr()
        .map_err(|_| PodwireError::PodNotReady)?;

    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let task = tokio::spawn(accept_loop(listener, client, namespace, pod_name, task_cancel));

    Ok(PrimaryForward {
        local_addr,
        cancel,
        task,
    })
}

async fn accept_loop(
    listener: TcpListener,
    client: K8sClient,
    namespace: String,
    pod_name: String,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let (conn, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "accept on primary port-forward listener failed");
                        continue;
                    }
                };
                debug!(%peer, "accepted primary port-forward connection");
                let client = client.clone();
                let namespace = namespace.clone();
                let pod_name = pod_name.clone();
                tokio::spawn(async move {
                    if let Err(err) = pump_connection(client, namespace, pod_name, conn).await {
                        warn!(%err, "primary port-forward connection ended with error");
                    }
                });
            }
        }
    }
}

async fn pump_connection(
    client: K8sClient,
    namespace: String,
    pod_name: String,
    mut local: tokio::net::TcpStream,
) -> Result<()> {
    let mut remote = client
        .port_forward_pod(&namespace, &pod_name, REMOTE_SSH_PORT)
        .await?;
    copy_bidirectional(&mut local, &mut remote)
        .await
        .map_err(|_| PodwireError::PodNotReady)?;
    Ok(())
}
