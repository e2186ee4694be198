//! Configuration Management Module
//!
//! JSON configuration file model and loader.

pub mod storage;
pub mod types;

pub use storage::{load_config, parse_config, ConfigError};
pub use types::{
    expand_tilde, ClientTransportConfig, ConfigFile, JumpHostSpec, PipeConfig, ServerConfig,
    TunnelConfig, DEFAULT_INTERVAL_SECS,
};
