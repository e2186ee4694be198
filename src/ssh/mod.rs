//! SSH module - client transport built on russh
//!
//! # Features
//! - Reconnecting transport with a readiness gate (see `connection`)
//! - ProxyJump (jump host) chains, each hop with its own credentials
//! - Host key verification via a known_hosts file
//! - Remote listeners (`tcpip-forward`) routed back to their owners

mod client;
mod connection;
mod endpoint;
mod error;
mod handle_owner;
pub mod known_hosts;
mod proxy;

pub use client::{ClientHandler, ForwardRoutes, ForwardedConnection};
pub use connection::{ConnectionManager, ConnectionStatus, RemoteListener};
pub use endpoint::{Endpoint, SshUrl, DEFAULT_SSH_PORT};
pub use error::SshError;
pub use handle_owner::{
    spawn_handle_owner_task, HandleCommand, HandleController, PingResult, TransportHandle,
};
pub use known_hosts::{HostKeyPolicy, HostKeyVerification, HostKeyVerifier, KnownHostsStore};
pub use proxy::{connect_direct, connect_via_proxy, Credentials, ProxyHop, Transport};
