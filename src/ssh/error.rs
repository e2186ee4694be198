//! SSH Error types

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SshError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// Misconfiguration (no credentials, empty listen address...). Never retried.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Host is not in known_hosts and the verifier runs in strict mode
    #[error(
        "Host key verification failed: unknown host {host}. Fingerprint: {fingerprint}. \
         Run `burrow grabpubkey` to trust it"
    )]
    HostKeyUnknown { host: String, fingerprint: String },

    /// Host presented a key different from the stored one
    #[error(
        "HOST KEY VERIFICATION FAILED: key for {host} has changed! Expected: {expected}, \
         Actual: {actual}. This could indicate a man-in-the-middle attack. \
         If the change is legitimate, remove the old entry from the known_hosts file"
    )]
    HostKeyChanged {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("Channel error: {0}")]
    ChannelError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("SSH protocol error: {0}")]
    ProtocolError(String),

    #[error("Key error: {0}")]
    KeyError(String),

    #[error("Disconnected")]
    Disconnected,
}

impl SshError {
    /// Configuration and trust failures stop the owning component instead of
    /// being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SshError::Config(_) | SshError::HostKeyUnknown { .. } | SshError::HostKeyChanged { .. }
        )
    }
}

impl From<russh::Error> for SshError {
    fn from(err: russh::Error) -> Self {
        SshError::ProtocolError(err.to_string())
    }
}

impl From<russh::keys::Error> for SshError {
    fn from(err: russh::keys::Error) -> Self {
        SshError::KeyError(err.to_string())
    }
}
