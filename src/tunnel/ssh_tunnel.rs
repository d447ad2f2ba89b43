use crate::errors::{PodwireError, Result};
use crate::session::types::{Direction, PortMapping};
use russh::client::{self, Handle};
use russh::keys::PrivateKeyWithHashAlg;
use russh::{Channel, Disconnect};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::io::copy_bidirectional;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// The SSH host is always dialed through the primary cluster port-forward,
/// never directly — so the hostname is always loopback.
const SSH_USER: &str = "root";

type ForwardedSender = mpsc::UnboundedSender<Channel<client::Msg>>;
type ForwardRegistry = Arc<Mutex<HashMap<u16, ForwardedSender>>>;

/// Routes channels `russh` hands to the client `Handler` for reverse
/// tunnels back to whichever listener loop registered that port.
/// `server_channel_open_forwarded_tcpip` is a callback, not a return
/// value, so this registry is the hand-off point between it and
/// `run_reverse_listener`.
#[derive(Clone, Default)]
struct ForwardRouter(ForwardRegistry);

impl ForwardRouter {
    fn register(&self, port: u16) -> mpsc::UnboundedReceiver<Channel<client::Msg>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.0.lock().unwrap().insert(port, tx);
        rx
    }

    fn unregister(&self, port: u16) {
        self.0.lock().unwrap().remove(&port);
    }

    fn route(&self, port: u16, channel: Channel<client::Msg>) {
        let sender = self.0.lock().unwrap().get(&port).cloned();
        match sender {
            Some(sender) => {
                let _ = sender.send(channel);
            }
            None => warn!(port, "received forwarded channel for an unregistered reverse tunnel"),
        }
    }
}

pub struct AcceptAnyHostKey {
    forwards: ForwardRouter,
}

impl client::Handler for AcceptAnyHostKey {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::ssh_key::PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        // the SSH endpoint is the pod this process just patched into
        // existence over an authenticated Kubernetes API connection; there
        // is no independently-trusted host key to pin against, matching
        // the Go source's `ssh.InsecureIgnoreHostKey`.
        Ok(true)
    }

    /// Delivers a channel the remote sshd opened in response to an earlier
    /// `tcpip_forward` request, routing it to whichever reverse tunnel
    /// registered that port.
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<client::Msg>,
        _connected_address: &str,
        connected_port: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut client::Session,
    ) -> std::result::Result<(), Self::Error> {
        self.forwards.route(connected_port as u16, channel);
        Ok(())
    }
}

/// A connected SSH session plus the reverse-tunnel channel router shared
/// with its `Handler`. Opaque to callers outside this module beyond
/// `connect`/`disconnect`/`start_tunnel`.
pub struct SshSession {
    handle: Handle<AcceptAnyHostKey>,
    forwards: ForwardRouter,
}

/// Handle type used everywhere a caller needs to hold onto a connected SSH
/// session (dialing further tunnels, disconnecting on teardown) without
/// naming the private `Handler` impl.
pub type SshHandle = SshSession;

/// Opens the SSH client session over the already-established primary
/// port-forward (`local_forward_addr`), authenticating with the private
/// key generated by the key store.
pub async fn connect(local_forward_addr: SocketAddr, private_key_path: &Path) -> Result<SshSession> {
    let forwards = ForwardRouter::default();
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(
        config,
        local_forward_addr,
        AcceptAnyHostKey {
            forwards: forwards.clone(),
        },
    )
    .await
    .map_err(|_| PodwireError::PodNotReady)?;

    let key_data = tokio::fs::read_to_string(private_key_path)
        .await
        .map_err(|_| PodwireError::PodNotReady)?;
    let key_pair = russh::keys::decode_secret_key(&key_data, None).map_err(|_| PodwireError::PodNotReady)?;

    let authenticated = session
        .authenticate_publickey(
            SSH_USER,
            PrivateKeyWithHashAlg::new(Arc::new(key_pair), session.best_supported_rsa_hash().await.ok().flatten()),
        )
        .await
        .map_err(|_| PodwireError::PodNotReady)?;

    if !authenticated.success() {
        return Err(PodwireError::PodNotReady);
    }

    Ok(SshSession { handle: session, forwards })
}

/// Binds an OS-assigned port and immediately releases it, for the
/// `remote_port == 0` reverse-tunnel case: rather than trust a round-trip
/// through `tcpip_forward`'s reply for the bound port, a concrete free
/// port is chosen up front and requested by number, matching spec.md §9's
/// "ask the OS, don't guess" port-discovery note.
async fn ephemeral_port() -> Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))
        .await
        .map_err(|_| PodwireError::PodNotReady)?;
    let port = listener.local_addr().map_err(|_| PodwireError::PodNotReady)?.port();
    drop(listener);
    Ok(port)
}

/// One running forward or reverse tunnel: a listener task plus however many
/// per-connection tasks are currently alive. `mapping` reflects the actual
/// bound port once the `L==0`/`R==0` ephemeral case has been resolved to a
/// concrete port, so callers can log/observe it.
pub struct SshTunnel {
    pub mapping: PortMapping,
    cancel: CancellationToken,
    task: tokio::task::JoinHandle<()>,
}

impl SshTunnel {
    pub async fn stop(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Starts one tunnel per spec.md §4.5: forward tunnels listen locally and
/// dial through the SSH session; reverse tunnels ask the remote sshd to
/// listen and dial back locally. Grounded on `pkg/ssh/tunnel.go`'s
/// `SSHTunnel` (listener task + per-connection task pair).
pub async fn start_tunnel(session: Arc<SshSession>, mapping: PortMapping) -> Result<SshTunnel> {
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();

    let (task, mapping) = match mapping.direction {
        Direction::Forward => {
            let listener = TcpListener::bind(("127.0.0.1", mapping.local_port))
                .await
                .map_err(|_| PodwireError::PodNotReady)?;
            let mut mapping = mapping;
            mapping.local_port = listener
                .local_addr()
                .map_err(|_| PodwireError::PodNotReady)?
                .port();
            info!(local_port = mapping.local_port, remote_port = mapping.remote_port, "forward tunnel bound");
            (tokio::spawn(run_forward_listener(listener, session, mapping, task_cancel)), mapping)
        }
        Direction::Reverse => {
            let mut mapping = mapping;
            if mapping.remote_port == 0 {
                mapping.remote_port = ephemeral_port().await?;
            }
            let rx = session.forwards.register(mapping.remote_port);
            session
                .handle
                .tcpip_forward("127.0.0.1", mapping.remote_port as u32)
                .await
                .map_err(|_| PodwireError::PodNotReady)?;
            info!(local_port = mapping.local_port, remote_port = mapping.remote_port, "reverse tunnel bound");
            (tokio::spawn(run_reverse_listener(session, mapping, rx, task_cancel)), mapping)
        }
    };

    Ok(SshTunnel {
        mapping,
        cancel,
        task,
    })
}

async fn run_forward_listener(
    listener: TcpListener,
    session: Arc<SshSession>,
    mapping: PortMapping,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            accepted = listener.accept() => {
                let (local, peer) = match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        warn!(%err, "tunnel listener accept failed");
                        continue;
                    }
                };
                debug!(%peer, local_port = mapping.local_port, "accepted forward tunnel connection");
                let session = session.clone();
                tokio::spawn(async move {
                    if let Err(err) = pump_forward(session, mapping, local).await {
                        warn!(%err, "forward tunnel connection ended with error");
                    }
                });
            }
        }
    }
}

async fn pump_forward(session: Arc<SshSession>, mapping: PortMapping, mut local: TcpStream) -> Result<()> {
    let channel = session
        .handle
        .channel_open_direct_tcpip("127.0.0.1", mapping.remote_port as u32, "127.0.0.1", 0)
        .await
        .map_err(|_| PodwireError::PodNotReady)?;
    let mut remote = channel.into_stream();
    copy_bidirectional(&mut local, &mut remote)
        .await
        .map_err(|_| PodwireError::PodNotReady)?;
    Ok(())
}

/// Reverse-tunnel listener: receives channels the `Handler` routed in from
/// `server_channel_open_forwarded_tcpip` (one per inbound connection the
/// remote sshd accepted on the forwarded port) and pipes each to the local
/// endpoint. Grounded on `pkg/ssh/tunnel.go`'s `SSHTunnel` reverse-mode
/// loop.
async fn run_reverse_listener(
    session: Arc<SshSession>,
    mapping: PortMapping,
    mut forwarded: mpsc::UnboundedReceiver<Channel<client::Msg>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = session
                    .handle
                    .cancel_tcpip_forward("127.0.0.1", mapping.remote_port as u32)
                    .await;
                session.forwards.unregister(mapping.remote_port);
                return;
            }
            next = forwarded.recv() => {
                let Some(channel) = next else { return };
                debug!(remote_port = mapping.remote_port, local_port = mapping.local_port, "accepted reverse tunnel connection");
                tokio::spawn(pump_reverse(mapping, channel));
            }
        }
    }
}

async fn pump_reverse(mapping: PortMapping, channel: Channel<client::Msg>) {
    let mut remote = channel.into_stream();
    match TcpStream::connect(("127.0.0.1", mapping.local_port)).await {
        Ok(mut local) => {
            if let Err(err) = copy_bidirectional(&mut local, &mut remote).await {
                warn!(%err, "reverse tunnel connection ended with error");
            }
        }
        Err(err) => warn!(%err, local_port = mapping.local_port, "reverse tunnel dial failed"),
    }
}

pub async fn disconnect(session: &SshSession) {
    let _ = session
        .handle
        .disconnect(Disconnect::ByApplication, "", "English")
        .await;
}
