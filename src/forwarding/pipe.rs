//! Pipes
//!
//! A pipe is a tunnel without SSH: it listens on a local endpoint and dials
//! the remote endpoint directly for every accepted connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::listener::bind_listener;
use super::relay::{relay, RelayOptions};
use crate::config::{PipeConfig, DEFAULT_INTERVAL_SECS};
use crate::registry::Registry;
use crate::ssh::{Endpoint, SshError};

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

pub type PipeRegistry = Registry<Arc<Pipe>>;

struct Registration {
    id: u64,
    registry: Weak<PipeRegistry>,
}

pub struct Pipe {
    local: Endpoint,
    remote: Endpoint,
    stoppable: bool,
    retry_interval: Duration,

    registration: Mutex<Option<Registration>>,
    listening: watch::Sender<Option<String>>,
    clients: Mutex<HashMap<String, CancellationToken>>,
    terminate: CancellationToken,
    stopped: AtomicBool,
}

impl Pipe {
    pub fn new(local: Endpoint, remote: Endpoint, stoppable: bool) -> Arc<Self> {
        let (listening, _) = watch::channel(None);
        Arc::new(Self {
            local,
            remote,
            stoppable,
            retry_interval: Duration::from_secs(DEFAULT_INTERVAL_SECS),
            registration: Mutex::new(None),
            listening,
            clients: Mutex::new(HashMap::new()),
            terminate: CancellationToken::new(),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn from_config(conf: &PipeConfig, stoppable: bool) -> Result<Arc<Self>, SshError> {
        Ok(Self::new(
            Endpoint::parse(&conf.local)?,
            Endpoint::parse(&conf.remote)?,
            stoppable,
        ))
    }

    pub fn register(self: &Arc<Self>, registry: &Arc<PipeRegistry>) -> u64 {
        let id = registry.add(self.clone());
        *self.registration.lock() = Some(Registration {
            id,
            registry: Arc::downgrade(registry),
        });
        id
    }

    /// Listen and relay until `stop`; a failed listener is reopened after a pause
    pub async fn start(self: &Arc<Self>) {
        info!("Starting pipe {}", self);
        loop {
            if let Err(e) = self.serve().await {
                warn!("Pipe {} listener closed: {}", self, e);
            }
            tokio::select! {
                _ = self.terminate.cancelled() => break,
                _ = tokio::time::sleep(self.retry_interval) => {}
            }
        }
        info!("Pipe {} terminated", self);
    }

    pub async fn stop(&self) {
        if !self.stoppable {
            warn!("Pipe {} is not stoppable", self);
            return;
        }
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }

        self.terminate.cancel();
        self.clients.lock().clear();

        let mut listening = self.listening.subscribe();
        let _ = tokio::time::timeout(STOP_TIMEOUT, listening.wait_for(Option::is_none)).await;

        if let Some(reg) = self.registration.lock().take() {
            if let Some(registry) = reg.registry.upgrade() {
                let _ = registry.delete(reg.id);
            }
        }
        info!("Pipe {} stopped", self);
    }

    pub fn listener_addr(&self) -> Option<String> {
        self.listening.borrow().clone()
    }

    pub fn active_clients_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.remote
    }

    pub fn is_stoppable(&self) -> bool {
        self.stoppable
    }

    pub fn id(&self) -> Option<u64> {
        self.registration.lock().as_ref().map(|r| r.id)
    }

    async fn serve(self: &Arc<Self>) -> Result<(), SshError> {
        if self.terminate.is_cancelled() {
            return Ok(());
        }
        let listener = bind_listener(&self.local).await?;
        let addr = listener.local_addr()?;
        self.listening.send_replace(Some(addr.to_string()));
        info!("Pipe listening on {} -> {}", addr, self.remote);

        let result = self.accept_loop(&listener).await;

        drop(listener);
        self.listening.send_replace(None);
        result
    }

    async fn accept_loop(self: &Arc<Self>, listener: &TcpListener) -> Result<(), SshError> {
        loop {
            tokio::select! {
                _ = self.terminate.cancelled() => return Ok(()),
                accepted = listener.accept() => {
                    let (stream, peer) = accepted?;
                    let pipe = self.clone();
                    tokio::spawn(async move {
                        match TcpStream::connect((pipe.remote.host.as_str(), pipe.remote.port)).await {
                            Ok(remote) => pipe.track_relay(peer.to_string(), stream, remote),
                            Err(e) => warn!("Pipe {} cannot reach {}: {}", pipe, pipe.remote, e),
                        }
                    });
                }
            }
        }
    }

    fn track_relay(self: &Arc<Self>, peer: String, local: TcpStream, remote: TcpStream) {
        let token = self.terminate.child_token();
        {
            let mut clients = self.clients.lock();
            if self.terminate.is_cancelled() {
                return;
            }
            clients.insert(peer.clone(), token.clone());
        }

        let pipe = Arc::downgrade(self);
        let options = RelayOptions::new().cancel_token(token).on_close(move || {
            if let Some(pipe) = pipe.upgrade() {
                pipe.clients.lock().remove(&peer);
                debug!("Pipe {} closed connection from {}", pipe, peer);
            }
        });
        relay(local, remote, options);
    }
}

impl fmt::Display for Pipe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.local, self.remote)
    }
}
