//! TCP listener helpers shared by tunnels, pipes and the server

use std::io::ErrorKind;

use tokio::net::TcpListener;

use crate::ssh::{Endpoint, SshError};

/// Bind a TCP listener, turning common failures into readable errors
pub async fn bind_listener(endpoint: &Endpoint) -> Result<TcpListener, SshError> {
    let addr = endpoint.to_string();
    TcpListener::bind((endpoint.host.as_str(), endpoint.port))
        .await
        .map_err(|e| match e.kind() {
            ErrorKind::AddrInUse => SshError::ConnectionFailed(format!(
                "Port already in use: {}. Another application may be using this port.",
                addr
            )),
            ErrorKind::PermissionDenied => SshError::ConnectionFailed(format!(
                "Permission denied binding to {}. Ports below 1024 require elevated privileges.",
                addr
            )),
            ErrorKind::AddrNotAvailable => SshError::ConnectionFailed(format!(
                "Address not available: {}. The specified address is not valid on this system.",
                addr
            )),
            _ => SshError::ConnectionFailed(format!("Failed to bind to {}: {}", addr, e)),
        })
}
