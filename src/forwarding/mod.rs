//! Port Forwarding Module
//!
//! Client-side tunnels over an SSH transport, plain TCP pipes, and the relay
//! primitive every forward is built on.

mod listener;
pub mod pipe;
pub mod relay;
pub mod tunnel;

pub use listener::bind_listener;
pub use pipe::{Pipe, PipeRegistry};
pub use relay::{relay, RelayOptions, RelayStats};
pub use tunnel::{Tunnel, TunnelDirection, TunnelRegistry};
