//! Server-side remote listeners (`tcpip-forward`)
//!
//! Every registration owns a TCP listener, an accept loop that hands each
//! accepted connection back to the client as a `forwarded-tcpip` channel, and
//! a liveness task. Both tasks stop on the registration's token, which is
//! cancelled by `cancel-tcpip-forward`, by a failed liveness check, or when
//! the SSH connection ends.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use russh::server::Handle;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::forwarding::{relay, RelayOptions};

/// One live `tcpip-forward`
struct ForwardRegistration {
    bind_address: String,
    token: CancellationToken,
}

/// Remote listeners of one SSH connection, keyed by the literal `addr:port`
#[derive(Default)]
pub struct ForwardTable {
    forwards: Mutex<HashMap<String, ForwardRegistration>>,
}

impl ForwardTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn key(address: &str, port: u32) -> String {
        format!("{}:{}", address, port)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.forwards.lock().contains_key(key)
    }

    /// Bind addresses of the live forwards
    pub fn bind_addresses(&self) -> Vec<String> {
        self.forwards
            .lock()
            .values()
            .map(|r| r.bind_address.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.forwards.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Close the listener registered under `key`. Returns whether one existed.
    pub fn cancel(&self, key: &str) -> bool {
        match self.forwards.lock().remove(key) {
            Some(registration) => {
                registration.token.cancel();
                info!("Remote forward {} closed", registration.bind_address);
                true
            }
            None => false,
        }
    }

    /// Drop the entry under `key` if its listener is already closed
    fn remove_closed(&self, key: &str) {
        let mut forwards = self.forwards.lock();
        if forwards.get(key).is_some_and(|r| r.token.is_cancelled()) {
            forwards.remove(key);
        }
    }

    /// Close every listener (connection teardown)
    pub fn cancel_all(&self) {
        for (_, registration) in self.forwards.lock().drain() {
            registration.token.cancel();
            debug!("Remote forward {} closed with its connection", registration.bind_address);
        }
    }

    /// Register `listener` under `key` and start its accept loop and liveness
    /// task. `address`/`port` are reported to the client on every channel.
    pub fn register(
        self: &Arc<Self>,
        key: String,
        listener: TcpListener,
        spec: ForwardSpec,
    ) {
        let token = CancellationToken::new();
        let bind_address = listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_else(|_| key.clone());

        self.forwards.lock().insert(
            key.clone(),
            ForwardRegistration {
                bind_address: bind_address.clone(),
                token: token.clone(),
            },
        );
        info!("Remote forward listening on {}", bind_address);

        tokio::spawn(accept_loop(listener, spec.clone(), token.clone()));
        tokio::spawn(liveness_task(
            Arc::downgrade(self),
            key,
            token,
            spec.alive,
            spec.liveness_interval,
        ));
    }
}

/// What a forward needs to reach back to its client
#[derive(Clone)]
pub struct ForwardSpec {
    pub handle: Handle,
    /// Address and port as the client asked for them (port as bound)
    pub address: String,
    pub port: u32,
    /// false once the SSH connection has ended
    pub alive: watch::Receiver<bool>,
    pub liveness_interval: Duration,
}

async fn accept_loop(listener: TcpListener, spec: ForwardSpec, token: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = token.cancelled() => break,
            accepted = listener.accept() => accepted,
        };

        let (stream, peer) = match accepted {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!("Remote forward {}:{} accept failed: {}", spec.address, spec.port, e);
                token.cancel();
                break;
            }
        };
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to set TCP_NODELAY: {}", e);
        }

        let spec = spec.clone();
        tokio::spawn(async move {
            let channel = match spec
                .handle
                .channel_open_forwarded_tcpip(
                    spec.address.clone(),
                    spec.port,
                    peer.ip().to_string(),
                    peer.port() as u32,
                )
                .await
            {
                Ok(channel) => channel,
                Err(e) => {
                    warn!("Failed to open forwarded-tcpip channel for {}: {}", peer, e);
                    return;
                }
            };
            debug!("Relaying {} to client via {}:{}", peer, spec.address, spec.port);
            relay(stream, channel.into_stream(), RelayOptions::new());
        });
    }
    debug!("Accept loop for {}:{} exited", spec.address, spec.port);
}

async fn liveness_task(
    table: Weak<ForwardTable>,
    key: String,
    token: CancellationToken,
    mut alive: watch::Receiver<bool>,
    interval: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        let connected = tokio::select! {
            _ = token.cancelled() => {
                // the accept loop may have closed the listener on its own
                if let Some(table) = table.upgrade() {
                    table.remove_closed(&key);
                }
                return;
            }
            _ = ticker.tick() => *alive.borrow(),
            changed = alive.changed() => changed.is_ok() && *alive.borrow(),
        };
        if connected {
            continue;
        }

        warn!("Client of remote forward {} is gone, closing it", key);
        match table.upgrade() {
            Some(table) => {
                table.cancel(&key);
            }
            None => token.cancel(),
        }
        return;
    }
}
