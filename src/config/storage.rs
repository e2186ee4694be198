//! Configuration Storage
//!
//! Reads the JSON configuration file consumed by `burrow run`.

use std::path::{Path, PathBuf};

use tokio::fs;

use super::types::ConfigFile;

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid config file: {0}")]
    Invalid(String),
}

/// Load and validate a configuration file
pub async fn load_config(path: impl AsRef<Path>) -> Result<ConfigFile, ConfigError> {
    let path = path.as_ref();
    let contents = fs::read_to_string(path)
        .await
        .map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
    parse_config(&contents)
}

pub fn parse_config(contents: &str) -> Result<ConfigFile, ConfigError> {
    let config: ConfigFile = serde_json::from_str(contents)?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &ConfigFile) -> Result<(), ConfigError> {
    if config.sshd.is_none() && config.tunnel.is_empty() && config.pipe.is_empty() {
        return Err(ConfigError::Invalid(
            "you need to fill at least one of the `sshd`, `tunnel` or `pipe` sections".into(),
        ));
    }

    if let Some(sshd) = &config.sshd {
        if sshd.listen_address.trim().is_empty() {
            return Err(ConfigError::Invalid("sshd.listen_address is empty".into()));
        }
    }

    // a tunnel needs a transport from somewhere
    for tunnel in &config.tunnel {
        if tunnel.sshclient.is_none() && config.sshclient.is_none() {
            return Err(ConfigError::Invalid(format!(
                "tunnel {} -> {} has no `sshclient` and there is no global one",
                tunnel.local, tunnel.remote
            )));
        }
    }

    Ok(())
}
