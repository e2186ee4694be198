//! russh server handler
//!
//! Serves the forwarding subset of the protocol on one SSH connection:
//! `tcpip-forward` / `cancel-tcpip-forward` global requests and
//! `direct-tcpip` channels. Session channels are either refused or closed
//! right away; shell and exec are not provided.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::forward::{ForwardSpec, ForwardTable};
use super::keys::AuthorizedKeys;
use crate::forwarding::{relay, RelayOptions};
use crate::ssh::SshError;

/// Who may log in
pub struct AuthPolicy {
    keys: AuthorizedKeys,
    password: Option<String>,
    disable_auth: bool,
}

impl AuthPolicy {
    pub fn new(keys: AuthorizedKeys, password: Option<String>, disable_auth: bool) -> Self {
        Self {
            keys,
            password: password.filter(|p| !p.is_empty()),
            disable_auth,
        }
    }

    /// At least one way to get in exists
    pub fn is_usable(&self) -> bool {
        self.disable_auth || !self.keys.is_empty() || self.password.is_some()
    }

    pub fn accepts_key(&self, key: &PublicKey) -> bool {
        self.disable_auth || self.keys.contains(key)
    }

    pub fn accepts_password(&self, password: &str) -> bool {
        self.disable_auth || self.password.as_deref() == Some(password)
    }

    fn methods(&self) -> MethodSet {
        let mut methods = vec![MethodKind::PublicKey];
        if self.password.is_some() {
            methods.push(MethodKind::Password);
        }
        MethodSet::from(&methods[..])
    }

    fn reject(&self) -> Auth {
        Auth::Reject {
            proceed_with_methods: Some(self.methods()),
            partial_success: false,
        }
    }
}

pub struct ServerHandler {
    peer: Option<SocketAddr>,
    auth: Arc<AuthPolicy>,
    disable_shell: bool,
    forwards: Arc<ForwardTable>,
    /// Flips to false when the connection ends
    alive: watch::Receiver<bool>,
    liveness_interval: Duration,
}

impl ServerHandler {
    pub fn new(
        peer: Option<SocketAddr>,
        auth: Arc<AuthPolicy>,
        disable_shell: bool,
        forwards: Arc<ForwardTable>,
        alive: watch::Receiver<bool>,
        liveness_interval: Duration,
    ) -> Self {
        Self {
            peer,
            auth,
            disable_shell,
            forwards,
            alive,
            liveness_interval,
        }
    }

    fn peer(&self) -> String {
        self.peer
            .map(|p| p.to_string())
            .unwrap_or_else(|| "unknown peer".into())
    }
}

impl server::Handler for ServerHandler {
    type Error = SshError;

    async fn auth_none(&mut self, user: &str) -> Result<Auth, Self::Error> {
        if self.auth.disable_auth {
            info!("Accepting {} from {} without authentication", user, self.peer());
            return Ok(Auth::Accept);
        }
        Ok(self.auth.reject())
    }

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if self.auth.accepts_password(password) {
            info!("Password accepted for {} from {}", user, self.peer());
            return Ok(Auth::Accept);
        }
        warn!("Password rejected for {} from {}", user, self.peer());
        Ok(self.auth.reject())
    }

    async fn auth_publickey_offered(
        &mut self,
        _user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.auth.accepts_key(public_key) {
            return Ok(Auth::Accept);
        }
        Ok(self.auth.reject())
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if self.auth.accepts_key(public_key) {
            info!("Public key accepted for {} from {}", user, self.peer());
            return Ok(Auth::Accept);
        }
        warn!("Public key rejected for {} from {}", user, self.peer());
        Ok(self.auth.reject())
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        if self.disable_shell {
            debug!("Refusing session channel from {}", self.peer());
            return Ok(false);
        }
        debug!("Session channel from {} accepted and closed", self.peer());
        tokio::spawn(async move {
            let _ = channel.close().await;
        });
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        originator_address: &str,
        originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(port) = u16::try_from(port_to_connect) else {
            warn!("direct-tcpip to invalid port {}", port_to_connect);
            return Ok(false);
        };
        debug!(
            "direct-tcpip to {}:{} from {}:{}",
            host_to_connect, port, originator_address, originator_port
        );

        let host = host_to_connect.to_string();
        tokio::spawn(async move {
            match TcpStream::connect((host.as_str(), port)).await {
                Ok(stream) => {
                    if let Err(e) = stream.set_nodelay(true) {
                        debug!("Failed to set TCP_NODELAY: {}", e);
                    }
                    relay(channel.into_stream(), stream, RelayOptions::new());
                }
                Err(e) => {
                    warn!("direct-tcpip dial to {}:{} failed: {}", host, port, e);
                    let _ = channel.close().await;
                }
            }
        });
        Ok(true)
    }

    async fn tcpip_forward(
        &mut self,
        address: &str,
        port: &mut u32,
        session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(requested_port) = u16::try_from(*port) else {
            warn!("tcpip-forward for invalid port {}", port);
            return Ok(false);
        };
        let requested = ForwardTable::key(address, *port);
        if requested_port != 0 && self.forwards.contains(&requested) {
            warn!("tcpip-forward {} already active", requested);
            return Ok(false);
        }

        let bind_host = match address {
            "" | "*" => "0.0.0.0",
            other => other,
        };
        let listener = match TcpListener::bind((bind_host, requested_port)).await {
            Ok(listener) => listener,
            Err(e) => {
                warn!("tcpip-forward bind {} failed: {}", requested, e);
                return Ok(false);
            }
        };
        let bound_port = match listener.local_addr() {
            Ok(addr) => addr.port() as u32,
            Err(e) => {
                warn!("tcpip-forward {} has no local address: {}", requested, e);
                return Ok(false);
            }
        };
        // the reply carries the bound port when 0 was requested
        *port = bound_port;

        self.forwards.register(
            ForwardTable::key(address, bound_port),
            listener,
            ForwardSpec {
                handle: session.handle(),
                address: address.to_string(),
                port: bound_port,
                alive: self.alive.clone(),
                liveness_interval: self.liveness_interval,
            },
        );
        Ok(true)
    }

    async fn cancel_tcpip_forward(
        &mut self,
        address: &str,
        port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let key = ForwardTable::key(address, port);
        if !self.forwards.cancel(&key) {
            debug!("cancel-tcpip-forward for unknown {}", key);
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::Algorithm;
    use russh::keys::PrivateKey;

    fn random_public() -> PublicKey {
        PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
            .unwrap()
            .public_key()
            .clone()
    }

    #[test]
    fn test_auth_policy() {
        let allowed = random_public();
        let policy = AuthPolicy::new(
            AuthorizedKeys::from_keys(vec![allowed.clone()]),
            Some("hunter2".into()),
            false,
        );
        assert!(policy.is_usable());
        assert!(policy.accepts_key(&allowed));
        assert!(!policy.accepts_key(&random_public()));
        assert!(policy.accepts_password("hunter2"));
        assert!(!policy.accepts_password("hunter3"));
    }

    #[test]
    fn test_empty_password_never_matches() {
        let policy = AuthPolicy::new(AuthorizedKeys::default(), Some(String::new()), false);
        assert!(!policy.is_usable());
        assert!(!policy.accepts_password(""));
    }

    #[test]
    fn test_disable_auth_accepts_everything() {
        let policy = AuthPolicy::new(AuthorizedKeys::default(), None, true);
        assert!(policy.is_usable());
        assert!(policy.accepts_key(&random_public()));
        assert!(policy.accepts_password("anything"));
    }
}
