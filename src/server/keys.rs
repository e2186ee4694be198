//! Server key material: the host key and the authorized client keys

use std::path::Path;

use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::{PrivateKey, PublicKey};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::config::expand_tilde;
use crate::ssh::SshError;

/// Load the host key at `path`, generating an Ed25519 key (and `<path>.pub`)
/// when it does not exist yet
pub async fn load_or_generate_host_key(path: &Path) -> Result<PrivateKey, SshError> {
    if tokio::fs::try_exists(path).await? {
        info!("Loading host key from {}", path.display());
        return russh::keys::load_secret_key(path, None).map_err(|e| {
            SshError::Config(format!("Failed to load host key {}: {}", path.display(), e))
        });
    }

    info!("Generating new Ed25519 host key at {}", path.display());
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)
        .map_err(|e| SshError::KeyError(format!("Failed to generate host key: {}", e)))?;

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let private = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| SshError::KeyError(format!("Failed to encode host key: {}", e)))?;
    let mut file = create_private_file(path).await?;
    file.write_all(private.as_bytes()).await?;
    file.flush().await?;

    let public = key
        .public_key()
        .to_openssh()
        .map_err(|e| SshError::KeyError(format!("Failed to encode host public key: {}", e)))?;
    let mut pub_path = path.as_os_str().to_owned();
    pub_path.push(".pub");
    tokio::fs::write(&pub_path, format!("{}\n", public)).await?;

    Ok(key)
}

/// Create `path` readable by its owner only; the mode is set at creation
async fn create_private_file(path: &Path) -> Result<tokio::fs::File, SshError> {
    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    options.mode(0o600);
    Ok(options.open(path).await?)
}

/// Keys allowed to authenticate
#[derive(Debug, Clone, Default)]
pub struct AuthorizedKeys {
    keys: Vec<PublicKey>,
}

impl AuthorizedKeys {
    /// Load every source (file path or http(s) URL). A source that cannot be
    /// read is skipped with a warning.
    pub async fn load(sources: &[String]) -> Self {
        let mut keys = Vec::new();
        for source in sources {
            match read_source(source).await {
                Ok(contents) => {
                    let parsed = parse_authorized_keys(&contents);
                    info!("Loaded {} authorized keys from {}", parsed.len(), source);
                    keys.extend(parsed);
                }
                Err(e) => warn!("Cannot read authorized keys from {}: {}", source, e),
            }
        }
        Self { keys }
    }

    pub fn from_keys(keys: Vec<PublicKey>) -> Self {
        Self { keys }
    }

    pub fn contains(&self, key: &PublicKey) -> bool {
        self.keys.iter().any(|k| k.key_data() == key.key_data())
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

async fn read_source(source: &str) -> Result<String, SshError> {
    if source.starts_with("http://") || source.starts_with("https://") {
        let response = reqwest::get(source)
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| SshError::ConnectionFailed(e.to_string()))?;
        return response
            .text()
            .await
            .map_err(|e| SshError::ConnectionFailed(e.to_string()));
    }
    Ok(tokio::fs::read_to_string(expand_tilde(source)).await?)
}

/// Parse authorized_keys content. Entries may carry a leading options field.
pub fn parse_authorized_keys(contents: &str) -> Vec<PublicKey> {
    let mut keys = Vec::new();
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let parsed = PublicKey::from_openssh(line).or_else(|e| match line.split_once(char::is_whitespace) {
            Some((_options, rest)) => PublicKey::from_openssh(rest.trim_start()),
            None => Err(e),
        });
        match parsed {
            Ok(key) => keys.push(key),
            Err(e) => warn!("Skipping malformed authorized key line: {}", e),
        }
    }
    keys
}
