//! Transport dialing: direct and through a chain of jump hosts
//!
//! Multi-hop connections use `direct-tcpip` channels to carry SSH over SSH:
//! ```text
//! Client --SSH--> [Jump1] --direct-tcpip--> [Jump2] --direct-tcpip--> ... --> [JumpN] --direct-tcpip--> [Target]
//! ```
//!
//! 1. Connect to Jump1 via SSH → Handle1
//! 2. Open direct-tcpip to Jump2 → Channel1, wrapped as a `ChannelStream`
//! 3. Connect to Jump2 via SSH over Stream1 → Handle2
//! 4. Repeat until JumpN, then open the final channel to the target
//! 5. Connect to the target via SSH over the final stream
//!
//! Every hop authenticates with its own credentials and is verified with the
//! same host key policy as the target. If any hop fails, the hops already
//! established are disconnected before the error is returned.

use std::path::PathBuf;
use std::sync::Arc;

use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::PrivateKey;
use tracing::{debug, info, warn};

use super::client::{ClientHandler, ForwardRoutes};
use super::error::SshError;
use super::handle_owner::disconnect_jump_hosts;
use super::known_hosts::HostKeyVerifier;

/// Credentials for one SSH hop
#[derive(Debug, Clone, Default)]
pub struct Credentials {
    pub username: String,
    /// Private key file; ignored when it does not exist or cannot be parsed
    pub identity: Option<PathBuf>,
    pub password: Option<String>,
}

/// One SSH server on the path to the target (or the target itself)
#[derive(Debug, Clone)]
pub struct ProxyHop {
    pub host: String,
    pub port: u16,
    pub credentials: Credentials,
}

impl ProxyHop {
    pub fn label(&self) -> String {
        format!("{}@{}:{}", self.credentials.username, self.host, self.port)
    }
}

/// An authenticated transport, plus the jump hosts it runs through
pub struct Transport {
    /// Order: [jump1, jump2, ..., jumpN]
    pub jump_handles: Vec<Handle<ClientHandler>>,
    pub target_handle: Handle<ClientHandler>,
}

/// Methods a hop can authenticate with
enum AuthPlan {
    Key(PrivateKey, Option<String>),
    Password(String),
}

impl AuthPlan {
    /// Private key preferred, password as fallback. Neither is a configuration
    /// error, not a transient one.
    fn resolve(hop: &ProxyHop) -> Result<Self, SshError> {
        let password = hop
            .credentials
            .password
            .clone()
            .filter(|p| !p.is_empty());

        if let Some(path) = &hop.credentials.identity {
            match russh::keys::load_secret_key(path, None) {
                Ok(key) => return Ok(AuthPlan::Key(key, password)),
                Err(e) => debug!("Identity {:?} not usable for {}: {}", path, hop.label(), e),
            }
        }

        match password {
            Some(password) => Ok(AuthPlan::Password(password)),
            None => Err(SshError::Config(format!(
                "No usable identity and no password for {}",
                hop.label()
            ))),
        }
    }
}

fn client_config() -> Arc<client::Config> {
    Arc::new(client::Config {
        // liveness is driven by the connection manager's keep-alive loop
        inactivity_timeout: None,
        keepalive_interval: None,
        ..Default::default()
    })
}

async fn authenticate(
    handle: &mut Handle<ClientHandler>,
    hop: &ProxyHop,
    plan: AuthPlan,
) -> Result<(), SshError> {
    let username = hop.credentials.username.as_str();

    let password = match plan {
        AuthPlan::Key(key, password) => {
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            let result = handle
                .authenticate_publickey(username, key_with_hash)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
            if result.success() {
                return Ok(());
            }
            debug!("Public key rejected by {}", hop.label());
            password
        }
        AuthPlan::Password(password) => Some(password),
    };

    if let Some(password) = password {
        let result = handle
            .authenticate_password(username, password)
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?;
        if result.success() {
            return Ok(());
        }
    }

    Err(SshError::AuthenticationFailed(format!(
        "Authentication to {} rejected",
        hop.label()
    )))
}

/// TCP connect + SSH handshake + authentication to a single host
async fn direct_connect(
    hop: &ProxyHop,
    verifier: &HostKeyVerifier,
    routes: ForwardRoutes,
) -> Result<Handle<ClientHandler>, SshError> {
    let plan = AuthPlan::resolve(hop)?;
    let handler = ClientHandler::new(hop.host.clone(), hop.port, verifier.clone(), routes);

    debug!("Connecting to {}", hop.label());
    let mut handle = client::connect(client_config(), (hop.host.as_str(), hop.port), handler).await?;

    authenticate(&mut handle, hop, plan).await?;
    info!("Authenticated to {}", hop.label());
    Ok(handle)
}

/// SSH handshake + authentication over a channel of the previous hop
async fn connect_via_stream(
    hop: &ProxyHop,
    stream: russh::ChannelStream<client::Msg>,
    verifier: &HostKeyVerifier,
    routes: ForwardRoutes,
) -> Result<Handle<ClientHandler>, SshError> {
    let plan = AuthPlan::resolve(hop)?;
    let handler = ClientHandler::new(hop.host.clone(), hop.port, verifier.clone(), routes);

    debug!("Connecting via stream to {} (SSH-over-SSH)", hop.label());
    let mut handle = client::connect_stream(client_config(), stream, handler).await?;

    authenticate(&mut handle, hop, plan).await?;
    info!("Authenticated via stream to {}", hop.label());
    Ok(handle)
}

/// Dial `target` directly
pub async fn connect_direct(
    target: &ProxyHop,
    verifier: &HostKeyVerifier,
    routes: ForwardRoutes,
) -> Result<Transport, SshError> {
    let target_handle = direct_connect(target, verifier, routes).await?;
    Ok(Transport {
        jump_handles: Vec::new(),
        target_handle,
    })
}

/// Dial `target` through `chain` (first element = nearest hop)
pub async fn connect_via_proxy(
    chain: &[ProxyHop],
    target: &ProxyHop,
    verifier: &HostKeyVerifier,
    routes: ForwardRoutes,
) -> Result<Transport, SshError> {
    if chain.is_empty() {
        return connect_direct(target, verifier, routes).await;
    }

    info!(
        "Establishing multi-hop SSH: {} jump hosts to {}",
        chain.len(),
        target.label()
    );

    let mut jump_handles: Vec<Handle<ClientHandler>> = Vec::with_capacity(chain.len());
    match dial_chain(chain, target, verifier, routes, &mut jump_handles).await {
        Ok(target_handle) => Ok(Transport {
            jump_handles,
            target_handle,
        }),
        Err(e) => {
            warn!("Jump chain to {} failed: {}", target.label(), e);
            disconnect_jump_hosts(jump_handles).await;
            Err(e)
        }
    }
}

async fn dial_chain(
    chain: &[ProxyHop],
    target: &ProxyHop,
    verifier: &HostKeyVerifier,
    routes: ForwardRoutes,
    jump_handles: &mut Vec<Handle<ClientHandler>>,
) -> Result<Handle<ClientHandler>, SshError> {
    let mut current_stream: Option<russh::ChannelStream<client::Msg>> = None;

    for (i, hop) in chain.iter().enumerate() {
        info!("Jump host {}: connecting to {}", i + 1, hop.label());

        let handle = match current_stream.take() {
            Some(stream) => connect_via_stream(hop, stream, verifier, ForwardRoutes::new()).await?,
            None => direct_connect(hop, verifier, ForwardRoutes::new()).await?,
        };

        let next = chain.get(i + 1).unwrap_or(target);
        let opened = handle
            .channel_open_direct_tcpip(next.host.as_str(), next.port as u32, "127.0.0.1", 0)
            .await;
        jump_handles.push(handle);

        let channel = opened.map_err(|e| {
            SshError::ConnectionFailed(format!(
                "Failed to open tunnel from {} to {}: {}",
                hop.label(),
                next.label(),
                e
            ))
        })?;
        current_stream = Some(channel.into_stream());
    }

    let stream = current_stream.ok_or_else(|| {
        SshError::ConnectionFailed("No stream available for target connection".into())
    })?;

    info!("Connecting to target {} through final tunnel", target.label());
    connect_via_stream(target, stream, verifier, routes).await
}

/// Handshake with `target` without authenticating. Used to run the host key
/// verifier (typically in lenient mode to record a new host).
pub async fn handshake_only(target: &ProxyHop, verifier: &HostKeyVerifier) -> Result<(), SshError> {
    let handler = ClientHandler::new(
        target.host.clone(),
        target.port,
        verifier.clone(),
        ForwardRoutes::new(),
    );
    let handle = client::connect(client_config(), (target.host.as_str(), target.port), handler).await?;
    let _ = handle
        .disconnect(russh::Disconnect::ByApplication, "Key grabbed", "en")
        .await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::known_hosts::HostKeyPolicy;
    use russh::keys::ssh_key::rand_core::OsRng;
    use russh::keys::ssh_key::{Algorithm, LineEnding};
    use tempfile::tempdir;

    fn hop(identity: Option<PathBuf>, password: Option<&str>) -> ProxyHop {
        ProxyHop {
            host: "127.0.0.1".into(),
            port: 1,
            credentials: Credentials {
                username: "tester".into(),
                identity,
                password: password.map(str::to_string),
            },
        }
    }

    #[test]
    fn test_no_credentials_is_config_error() {
        let temp = tempdir().unwrap();
        let missing = temp.path().join("id_missing");
        assert!(matches!(
            AuthPlan::resolve(&hop(Some(missing), None)),
            Err(SshError::Config(_))
        ));
        assert!(matches!(
            AuthPlan::resolve(&hop(None, Some(""))),
            Err(SshError::Config(_))
        ));
    }

    #[test]
    fn test_key_preferred_over_password() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("id_ed25519");
        let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap();
        std::fs::write(&path, key.to_openssh(LineEnding::LF).unwrap().as_bytes()).unwrap();

        match AuthPlan::resolve(&hop(Some(path), Some("secret"))).unwrap() {
            AuthPlan::Key(_, fallback) => assert_eq!(fallback.as_deref(), Some("secret")),
            AuthPlan::Password(_) => panic!("expected key auth"),
        }
        assert!(matches!(
            AuthPlan::resolve(&hop(None, Some("secret"))).unwrap(),
            AuthPlan::Password(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_first_hop_fails() {
        let temp = tempdir().unwrap();
        let verifier = HostKeyVerifier::new(HostKeyPolicy::Insecure, temp.path().join("kh"));
        // port 1 on loopback is closed
        let chain = vec![hop(None, Some("pw")), hop(None, Some("pw"))];
        let result = connect_via_proxy(&chain, &hop(None, Some("pw")), &verifier, ForwardRoutes::new()).await;
        assert!(matches!(result, Err(ref e) if !e.is_fatal()));
    }
}
