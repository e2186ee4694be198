//! Configuration Types

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Reconnect, keep-alive and liveness checks all default to this
pub const DEFAULT_INTERVAL_SECS: u64 = 5;

pub const DEFAULT_SSHD_LISTEN_ADDRESS: &str = ":2222";

/// Top-level configuration file
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigFile {
    /// Shared transport for tunnels without a dedicated one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sshclient: Option<ClientTransportConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tunnel: Vec<TunnelConfig>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sshd: Option<ServerConfig>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pipe: Vec<PipeConfig>,
}

/// One Connection Manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientTransportConfig {
    /// Private key path
    #[serde(default = "default_identity")]
    pub identity: String,

    #[serde(default)]
    pub password: String,

    #[serde(default = "default_known_hosts")]
    pub known_hosts: String,

    /// `[user@]host[:port]`
    pub server: String,

    /// Skip host key verification entirely
    #[serde(default)]
    pub insecure: bool,

    #[serde(default)]
    pub quiet: bool,

    /// Traversal order: the first entry is dialed first
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub jump_hosts: Vec<JumpHostSpec>,

    #[serde(default = "default_interval")]
    pub reconnect_interval_secs: u64,

    #[serde(default = "default_interval")]
    pub keepalive_interval_secs: u64,
}

/// Intermediate host of a jump chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JumpHostSpec {
    /// `[user@]host[:port]`
    pub uri: String,

    /// Falls back to the transport identity when empty
    #[serde(default)]
    pub identity: String,

    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelConfig {
    pub local: String,
    pub remote: String,

    /// true: local listener, remote dial. false: remote listener, local dial.
    #[serde(default)]
    pub forward: bool,

    /// Dedicated transport; the shared one is used when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sshclient: Option<ClientTransportConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Host key path, generated when missing
    #[serde(default = "default_server_key")]
    pub server_key: String,

    /// Files or http(s) URLs in authorized_keys format
    #[serde(default = "default_authorized_keys")]
    pub authorized_keys: Vec<String>,

    #[serde(default)]
    pub authorized_password: String,

    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    #[serde(default)]
    pub disable_shell: bool,

    /// Accept every client without authentication
    #[serde(default)]
    pub disable_auth: bool,

    #[serde(default = "default_interval")]
    pub liveness_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipeConfig {
    pub local: String,
    pub remote: String,
}

impl ClientTransportConfig {
    pub fn new(server: impl Into<String>) -> Self {
        Self {
            identity: default_identity(),
            password: String::new(),
            known_hosts: default_known_hosts(),
            server: server.into(),
            insecure: false,
            quiet: false,
            jump_hosts: Vec::new(),
            reconnect_interval_secs: DEFAULT_INTERVAL_SECS,
            keepalive_interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }

    pub fn reconnect_interval(&self) -> Duration {
        secs_or_default(self.reconnect_interval_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        secs_or_default(self.keepalive_interval_secs)
    }
}

impl ServerConfig {
    pub fn new(listen_address: impl Into<String>) -> Self {
        Self {
            server_key: default_server_key(),
            authorized_keys: default_authorized_keys(),
            authorized_password: String::new(),
            listen_address: listen_address.into(),
            disable_shell: false,
            disable_auth: false,
            liveness_interval_secs: DEFAULT_INTERVAL_SECS,
        }
    }

    pub fn liveness_interval(&self) -> Duration {
        secs_or_default(self.liveness_interval_secs)
    }
}

/// Expand a leading `~` to the home directory
pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    } else if path == "~" {
        if let Some(home) = dirs::home_dir() {
            return home;
        }
    }
    PathBuf::from(path)
}

fn secs_or_default(secs: u64) -> Duration {
    if secs == 0 {
        Duration::from_secs(DEFAULT_INTERVAL_SECS)
    } else {
        Duration::from_secs(secs)
    }
}

fn default_identity() -> String {
    "~/.ssh/id_rsa".to_string()
}

fn default_known_hosts() -> String {
    "~/.ssh/known_hosts".to_string()
}

fn default_server_key() -> String {
    "./server_key".to_string()
}

fn default_authorized_keys() -> Vec<String> {
    vec!["~/.ssh/authorized_keys".to_string()]
}

fn default_listen_address() -> String {
    DEFAULT_SSHD_LISTEN_ADDRESS.to_string()
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}
