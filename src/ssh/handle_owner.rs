//! Handle Owner Task
//!
//! Only one task owns the `Handle<ClientHandler>` of an established transport
//! (together with the handles of any jump hosts it was dialed through). All
//! other components talk to it through a cloneable [`HandleController`] that
//! sends commands over an mpsc channel and awaits the reply on a oneshot.
//!
//! ```ignore
//! let controller = spawn_handle_owner_task(transport, "user@host:22".into());
//! let channel = controller.open_direct_tcpip("localhost", 8080, "127.0.0.1", 0).await?;
//! let bound_port = controller.tcpip_forward("127.0.0.1", 0).await?;
//! ```

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use russh::client::{Handle, Msg};
use russh::Channel;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::client::ClientHandler;
use super::error::SshError;
use super::proxy::Transport;

const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Outcome of a liveness ping
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PingResult {
    Ok,
    /// No answer within the ping timeout
    Timeout,
    /// Transport is gone
    IoError,
}

/// Commands sent to the Handle Owner Task
pub enum HandleCommand {
    /// Open a direct-tcpip channel (forward tunnels, jump dials)
    ChannelOpenDirectTcpip {
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
        reply_tx: oneshot::Sender<Result<Channel<Msg>, russh::Error>>,
    },

    /// Request remote listener (tcpip-forward)
    TcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
    },

    /// Cancel remote listener
    CancelTcpipForward {
        address: String,
        port: u32,
        reply_tx: oneshot::Sender<Result<(), russh::Error>>,
    },

    Ping {
        reply_tx: oneshot::Sender<PingResult>,
    },

    Disconnect,
}

/// Cloneable controller for the Handle Owner Task
#[derive(Clone)]
pub struct HandleController {
    cmd_tx: mpsc::Sender<HandleCommand>,
    /// Fires once when the owner task shuts the transport down
    disconnect_tx: broadcast::Sender<()>,
}

impl HandleController {
    /// Subscribe to transport shutdown.
    ///
    /// The receiver yields (or reports `Closed`) once the owner task exits.
    pub fn subscribe_disconnect(&self) -> broadcast::Receiver<()> {
        self.disconnect_tx.subscribe()
    }

    /// Open a direct-tcpip channel: the remote peer dials `host:port`
    pub async fn open_direct_tcpip(
        &self,
        host: &str,
        port: u32,
        originator_host: &str,
        originator_port: u32,
    ) -> Result<Channel<Msg>, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::ChannelOpenDirectTcpip {
                host: host.to_string(),
                port,
                originator_host: originator_host.to_string(),
                originator_port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ChannelError(e.to_string()))
    }

    /// Request a remote listener (tcpip-forward)
    ///
    /// Returns the actual bound port (differs from `port` when it was 0)
    pub async fn tcpip_forward(&self, address: &str, port: u32) -> Result<u32, SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::TcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))
    }

    /// Cancel a remote listener
    pub async fn cancel_tcpip_forward(&self, address: &str, port: u32) -> Result<(), SshError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.cmd_tx
            .send(HandleCommand::CancelTcpipForward {
                address: address.to_string(),
                port,
                reply_tx,
            })
            .await
            .map_err(|_| SshError::Disconnected)?;
        reply_rx
            .await
            .map_err(|_| SshError::Disconnected)?
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))
    }

    pub async fn disconnect(&self) {
        let _ = self.cmd_tx.send(HandleCommand::Disconnect).await;
    }

    /// Send one keepalive request over the transport
    pub async fn ping(&self) -> PingResult {
        let (reply_tx, reply_rx) = oneshot::channel();
        if self.cmd_tx.send(HandleCommand::Ping { reply_tx }).await.is_err() {
            return PingResult::IoError;
        }
        reply_rx.await.unwrap_or(PingResult::IoError)
    }

    /// Check if the Handle Owner Task is still running
    pub fn is_connected(&self) -> bool {
        !self.cmd_tx.is_closed()
    }
}

/// What the owner task needs from the transport handle
///
/// Everything but `tcpip_forward` runs concurrently on a shared handle, so a
/// channel open the server is slow to confirm never holds up pings or other
/// dials.
pub trait TransportHandle: Send + Sync + 'static {
    fn open_direct_tcpip(
        &self,
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
    ) -> impl Future<Output = Result<Channel<Msg>, russh::Error>> + Send;

    fn tcpip_forward(
        &mut self,
        address: String,
        port: u32,
    ) -> impl Future<Output = Result<u32, russh::Error>> + Send;

    fn cancel_tcpip_forward(
        &self,
        address: String,
        port: u32,
    ) -> impl Future<Output = Result<(), russh::Error>> + Send;

    /// Resolves once the peer has answered a keep-alive request
    fn ping(&self) -> impl Future<Output = Result<(), russh::Error>> + Send;

    fn is_closed(&self) -> bool;

    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}

impl TransportHandle for Handle<ClientHandler> {
    fn open_direct_tcpip(
        &self,
        host: String,
        port: u32,
        originator_host: String,
        originator_port: u32,
    ) -> impl Future<Output = Result<Channel<Msg>, russh::Error>> + Send {
        self.channel_open_direct_tcpip(host, port, originator_host, originator_port)
    }

    fn tcpip_forward(
        &mut self,
        address: String,
        port: u32,
    ) -> impl Future<Output = Result<u32, russh::Error>> + Send {
        Handle::tcpip_forward(self, address, port)
    }

    fn cancel_tcpip_forward(
        &self,
        address: String,
        port: u32,
    ) -> impl Future<Output = Result<(), russh::Error>> + Send {
        Handle::cancel_tcpip_forward(self, address, port)
    }

    fn ping(&self) -> impl Future<Output = Result<(), russh::Error>> + Send {
        // keepalive@openssh.com with want_reply, awaiting the answer
        self.send_ping()
    }

    fn is_closed(&self) -> bool {
        Handle::is_closed(self)
    }

    fn disconnect(&self) -> impl Future<Output = ()> + Send {
        async move {
            let _ = Handle::disconnect(self, russh::Disconnect::ByApplication, "Session closed", "en")
                .await;
        }
    }
}

/// Spawn the Handle Owner Task, consuming the transport
pub fn spawn_handle_owner_task(transport: Transport, label: String) -> HandleController {
    let Transport {
        jump_handles,
        target_handle,
    } = transport;
    spawn_owner(target_handle, jump_handles, label)
}

fn spawn_owner<H: TransportHandle>(
    handle: H,
    jump_handles: Vec<Handle<ClientHandler>>,
    label: String,
) -> HandleController {
    let (cmd_tx, cmd_rx) = mpsc::channel::<HandleCommand>(64);
    let (disconnect_tx, _) = broadcast::channel::<()>(1);

    tokio::spawn(run_owner(
        handle,
        jump_handles,
        Arc::from(label),
        cmd_rx,
        disconnect_tx.clone(),
    ));

    HandleController {
        cmd_tx,
        disconnect_tx,
    }
}

struct ForwardRequest {
    address: String,
    port: u32,
    reply_tx: oneshot::Sender<Result<u32, russh::Error>>,
}

async fn run_owner<H: TransportHandle>(
    handle: H,
    jump_handles: Vec<Handle<ClientHandler>>,
    label: Arc<str>,
    mut cmd_rx: mpsc::Receiver<HandleCommand>,
    disconnect_tx: broadcast::Sender<()>,
) {
    let mut handle = Arc::new(handle);
    let mut in_flight: JoinSet<()> = JoinSet::new();
    let mut forwards: VecDeque<ForwardRequest> = VecDeque::new();

    debug!("Handle owner task started for {}", label);

    loop {
        // tcpip-forward borrows the handle mutably: run queued ones once no
        // concurrent request holds a clone
        while !forwards.is_empty() {
            let Some(exclusive) = Arc::get_mut(&mut handle) else {
                break;
            };
            if let Some(request) = forwards.pop_front() {
                request_forward(exclusive, request).await;
            }
        }

        tokio::select! {
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else { break };
                match cmd {
                    HandleCommand::ChannelOpenDirectTcpip {
                        host,
                        port,
                        originator_host,
                        originator_port,
                        reply_tx,
                    } => {
                        let handle = handle.clone();
                        in_flight.spawn(async move {
                            let result = handle
                                .open_direct_tcpip(host, port, originator_host, originator_port)
                                .await;
                            if reply_tx.send(result).is_err() {
                                // channel is dropped here and the server closes it
                                warn!("Caller dropped before receiving direct_tcpip result");
                            }
                        });
                    }

                    HandleCommand::TcpipForward {
                        address,
                        port,
                        reply_tx,
                    } => forwards.push_back(ForwardRequest {
                        address,
                        port,
                        reply_tx,
                    }),

                    HandleCommand::CancelTcpipForward {
                        address,
                        port,
                        reply_tx,
                    } => {
                        let handle = handle.clone();
                        in_flight.spawn(async move {
                            let _ = reply_tx.send(handle.cancel_tcpip_forward(address, port).await);
                        });
                    }

                    HandleCommand::Ping { reply_tx } => {
                        let handle = handle.clone();
                        let label = label.clone();
                        in_flight.spawn(async move {
                            let _ = reply_tx.send(ping_handle(&*handle, &label).await);
                        });
                    }

                    HandleCommand::Disconnect => {
                        info!("Disconnect requested for {}", label);
                        break;
                    }
                }
            }
            Some(_) = in_flight.join_next(), if !in_flight.is_empty() => {}
        }
    }

    // Notify subscribers first so tunnels stop using this transport
    let _ = disconnect_tx.send(());
    // dropping the requests' reply senders fails their callers
    in_flight.abort_all();
    for request in forwards.drain(..) {
        let _ = request.reply_tx.send(Err(russh::Error::Disconnect));
    }
    drain_pending_commands(&mut cmd_rx);

    handle.disconnect().await;
    disconnect_jump_hosts(jump_handles).await;
    debug!("Handle owner task terminated for {}", label);
}

async fn request_forward<H: TransportHandle>(handle: &mut H, request: ForwardRequest) {
    let ForwardRequest {
        address,
        port,
        reply_tx,
    } = request;
    match handle.tcpip_forward(address.clone(), port).await {
        Ok(bound_port) => {
            if reply_tx.send(Ok(bound_port)).is_err() {
                // nobody will ever serve this listener
                warn!(
                    "Caller dropped after tcpip_forward succeeded. \
                     Cancelling orphaned forward {}:{}",
                    address, bound_port
                );
                let _ = handle.cancel_tcpip_forward(address, bound_port).await;
            }
        }
        Err(e) => {
            let _ = reply_tx.send(Err(e));
        }
    }
}

async fn ping_handle<H: TransportHandle>(handle: &H, label: &str) -> PingResult {
    if handle.is_closed() {
        return PingResult::IoError;
    }
    match tokio::time::timeout(PING_TIMEOUT, handle.ping()).await {
        // a dying session also completes the ping
        Ok(Ok(())) if handle.is_closed() => PingResult::IoError,
        Ok(Ok(())) => {
            debug!("Keepalive OK for {}", label);
            PingResult::Ok
        }
        Ok(Err(e)) => {
            warn!("Keepalive failed for {}: {}", label, e);
            PingResult::IoError
        }
        Err(_) => {
            warn!("Keepalive timeout for {} ({}s)", label, PING_TIMEOUT.as_secs());
            PingResult::Timeout
        }
    }
}

/// Close intermediate hops, innermost first
pub(crate) async fn disconnect_jump_hosts(jump_handles: Vec<Handle<ClientHandler>>) {
    for handle in jump_handles.into_iter().rev() {
        let _ = handle
            .disconnect(russh::Disconnect::ByApplication, "Jump closed", "en")
            .await;
    }
}

/// Drain all pending commands, returning Disconnected error to each
fn drain_pending_commands(cmd_rx: &mut mpsc::Receiver<HandleCommand>) {
    cmd_rx.close();

    while let Ok(cmd) = cmd_rx.try_recv() {
        match cmd {
            HandleCommand::ChannelOpenDirectTcpip { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::TcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::CancelTcpipForward { reply_tx, .. } => {
                let _ = reply_tx.send(Err(russh::Error::Disconnect));
            }
            HandleCommand::Ping { reply_tx } => {
                let _ = reply_tx.send(PingResult::IoError);
            }
            HandleCommand::Disconnect => {}
        }
    }
}

#[cfg(test)]
impl HandleController {
    /// Controller wired to a bare command channel, for driving callers in tests
    pub(crate) fn from_channel(cmd_tx: mpsc::Sender<HandleCommand>) -> Self {
        let (disconnect_tx, _) = broadcast::channel(1);
        Self {
            cmd_tx,
            disconnect_tx,
        }
    }
}
