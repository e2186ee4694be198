//! russh client handler
//!
//! Verifies the server host key and routes `forwarded-tcpip` channels opened
//! by the server to the reverse tunnel that requested the remote listener.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use russh::client::{self, Msg};
use russh::keys::PublicKey;
use russh::Channel;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::error::SshError;
use super::known_hosts::HostKeyVerifier;

/// One connection accepted by a remote listener and relayed back to us
pub struct ForwardedConnection {
    pub channel: Channel<Msg>,
    pub originator_address: String,
    pub originator_port: u32,
}

/// Remote listeners of one transport: (address, bound port) -> receiver
#[derive(Clone, Default)]
pub struct ForwardRoutes {
    routes: Arc<Mutex<HashMap<(String, u32), mpsc::Sender<ForwardedConnection>>>>,
}

impl ForwardRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, address: &str, port: u32, tx: mpsc::Sender<ForwardedConnection>) {
        self.routes.lock().insert((address.to_string(), port), tx);
    }

    pub fn remove(&self, address: &str, port: u32) {
        self.routes.lock().remove(&(address.to_string(), port));
    }

    /// Exact match first, then a unique match on the port alone (servers may
    /// report a normalized bind address)
    pub fn lookup(&self, address: &str, port: u32) -> Option<mpsc::Sender<ForwardedConnection>> {
        let routes = self.routes.lock();
        if let Some(tx) = routes.get(&(address.to_string(), port)) {
            return Some(tx.clone());
        }
        let mut by_port = routes.iter().filter(|((_, p), _)| *p == port);
        match (by_port.next(), by_port.next()) {
            (Some((_, tx)), None) => Some(tx.clone()),
            _ => None,
        }
    }

    /// Drop every route; pending acceptors see their channel close
    pub fn clear(&self) {
        self.routes.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.routes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Client handler for russh callbacks
pub struct ClientHandler {
    /// Target host for key verification
    host: String,
    port: u16,
    verifier: HostKeyVerifier,
    routes: ForwardRoutes,
}

impl ClientHandler {
    pub fn new(host: String, port: u16, verifier: HostKeyVerifier, routes: ForwardRoutes) -> Self {
        Self {
            host,
            port,
            verifier,
            routes,
        }
    }
}

impl client::Handler for ClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        self.verifier
            .check(&self.host, self.port, server_public_key)
            .map(|_| true)
    }

    /// Called when someone connects to a remote listener we requested
    async fn server_channel_open_forwarded_tcpip(
        &mut self,
        channel: Channel<Msg>,
        connected_address: &str,
        connected_port: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        debug!(
            "Server opened forwarded-tcpip channel: {}:{} from {}:{}",
            connected_address, connected_port, originator_address, originator_port
        );

        let Some(tx) = self.routes.lookup(connected_address, connected_port) else {
            warn!(
                "No remote listener registered for {}:{}, dropping connection",
                connected_address, connected_port
            );
            return Ok(());
        };

        let conn = ForwardedConnection {
            channel,
            originator_address: originator_address.to_string(),
            originator_port,
        };
        // never block the SSH event loop on a slow acceptor
        tokio::spawn(async move {
            if tx.send(conn).await.is_err() {
                info!("Remote listener closed before the connection was accepted");
            }
        });

        Ok(())
    }
}
