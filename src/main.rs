use std::process::ExitCode;
use std::sync::Arc;

use clap::{Args, Parser, Subcommand};
use tokio::task::JoinSet;
use tracing::{error, info};

use burrow::config::{self, ClientTransportConfig, ConfigFile, JumpHostSpec, ServerConfig};
use burrow::forwarding::{Pipe, PipeRegistry, Tunnel, TunnelDirection, TunnelRegistry};
use burrow::server::ForwardingServer;
use burrow::ssh::{ConnectionManager, SshError};

#[derive(Parser)]
#[command(name = "burrow", about = "Resilient SSH tunnels", version)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run everything described in a JSON config file
    Run {
        /// Path to the config file
        config: String,
    },
    /// Start the forwarding SSH server
    Sshd(SshdArgs),
    /// Start a single tunnel
    Tun {
        #[command(subcommand)]
        direction: TunCommand,
    },
    /// Record a server's host key in the known_hosts file
    #[command(name = "grabpubkey")]
    GrabPubkey {
        /// Server, as [user@]host[:port]
        server: String,
        #[arg(short = 'k', long, default_value = "~/.ssh/known_hosts")]
        known_hosts: String,
    },
}

#[derive(Subcommand)]
enum TunCommand {
    /// Listen locally, connect to the remote endpoint through the server
    Forward(TunArgs),
    /// Listen on the server, connect to the local endpoint
    Reverse(TunArgs),
}

#[derive(Args)]
struct TunArgs {
    /// Server, as [user@]host[:port]
    server: String,
    /// Local endpoint
    #[arg(short = 'l', long, default_value = "127.0.0.1:2222")]
    local: String,
    /// Remote endpoint
    #[arg(short = 'r', long, default_value = "127.0.0.1:2222")]
    remote: String,
    /// Private key path
    #[arg(short = 'i', long, default_value = "~/.ssh/id_rsa")]
    identity: String,
    /// Password, used when the key is missing or rejected
    #[arg(short = 'p', long, default_value = "")]
    password: String,
    #[arg(short = 'k', long, default_value = "~/.ssh/known_hosts")]
    known_hosts: String,
    /// Jump hosts, nearest first, as [user@]host[:port]
    #[arg(short = 'j', long = "jump-host")]
    jump_hosts: Vec<String>,
    /// Skip host key verification
    #[arg(short = 'u', long)]
    insecure: bool,
    /// Only log warnings and errors
    #[arg(short = 'q', long)]
    quiet: bool,
}

#[derive(Args)]
struct SshdArgs {
    #[arg(short = 'k', long, default_value = "./server_key")]
    server_key: String,
    /// Authorized keys file or http(s) URL; repeatable
    #[arg(short = 'K', long = "authorized-keys")]
    authorized_keys: Vec<String>,
    #[arg(short = 'p', long, default_value = "")]
    authorized_password: String,
    #[arg(short = 'P', long, default_value = ":2222")]
    listen_address: String,
    #[arg(short = 'T', long)]
    disable_shell: bool,
    /// Accept every client without authentication
    #[arg(short = 'D', long)]
    disable_auth: bool,
    #[arg(short = 'q', long)]
    quiet: bool,
}

impl TunArgs {
    fn transport(&self) -> ClientTransportConfig {
        let mut conf = ClientTransportConfig::new(self.server.clone());
        conf.identity = self.identity.clone();
        conf.password = self.password.clone();
        conf.known_hosts = self.known_hosts.clone();
        conf.insecure = self.insecure;
        conf.quiet = self.quiet;
        conf.jump_hosts = self
            .jump_hosts
            .iter()
            .map(|uri| JumpHostSpec {
                uri: uri.clone(),
                identity: String::new(),
                password: String::new(),
            })
            .collect();
        conf
    }
}

impl SshdArgs {
    fn server_config(&self) -> ServerConfig {
        let mut conf = ServerConfig::new(self.listen_address.clone());
        conf.server_key = self.server_key.clone();
        if !self.authorized_keys.is_empty() {
            conf.authorized_keys = self.authorized_keys.clone();
        }
        conf.authorized_password = self.authorized_password.clone();
        conf.disable_shell = self.disable_shell;
        conf.disable_auth = self.disable_auth;
        conf
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Run { config } => cmd_run(&config).await,
        Command::Sshd(args) => {
            burrow::init_logging(args.quiet);
            let file = ConfigFile {
                sshd: Some(args.server_config()),
                ..Default::default()
            };
            run_components(file).await
        }
        Command::Tun { direction } => {
            let (args, forward) = match direction {
                TunCommand::Forward(args) => (args, true),
                TunCommand::Reverse(args) => (args, false),
            };
            burrow::init_logging(args.quiet);
            let file = ConfigFile {
                sshclient: Some(args.transport()),
                tunnel: vec![config::TunnelConfig {
                    local: args.local.clone(),
                    remote: args.remote.clone(),
                    forward,
                    sshclient: None,
                }],
                ..Default::default()
            };
            run_components(file).await
        }
        Command::GrabPubkey {
            server,
            known_hosts,
        } => {
            burrow::init_logging(false);
            let mut conf = ClientTransportConfig::new(server);
            conf.known_hosts = known_hosts;
            grab_pubkey(&conf).await
        }
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            eprintln!("burrow: {}", e);
            ExitCode::FAILURE
        }
    }
}

async fn cmd_run(path: &str) -> Result<(), SshError> {
    let file = config::load_config(config::expand_tilde(path))
        .await
        .map_err(|e| SshError::Config(e.to_string()))?;
    let quiet = file.sshclient.as_ref().is_some_and(|c| c.quiet);
    burrow::init_logging(quiet);
    run_components(file).await
}

async fn grab_pubkey(conf: &ClientTransportConfig) -> Result<(), SshError> {
    let manager = ConnectionManager::new(conf)?;
    manager.grab_pubkey().await?;
    println!("Host key of {} stored in {}", manager.server(), conf.known_hosts);
    Ok(())
}

/// Start every component of `file` and run until Ctrl-C or a fatal error
async fn run_components(file: ConfigFile) -> Result<(), SshError> {
    let mut tasks: JoinSet<Result<(), SshError>> = JoinSet::new();
    let tunnels = Arc::new(TunnelRegistry::new());
    let pipes = Arc::new(PipeRegistry::new());

    if let Some(sshd) = &file.sshd {
        let server = ForwardingServer::new(sshd).await?;
        tasks.spawn(async move { server.start().await });
    }

    let shared = match &file.sshclient {
        Some(conf) if file.tunnel.iter().any(|t| t.sshclient.is_none()) => {
            let manager = ConnectionManager::new(conf)?;
            let runner = manager.clone();
            tasks.spawn(async move { runner.start().await });
            Some(manager)
        }
        _ => None,
    };

    for conf in &file.tunnel {
        let tunnel = Tunnel::from_config(conf, shared.as_ref(), false)?;
        let id = tunnel.register(&tunnels);
        info!(
            "Tunnel #{} {} ({})",
            id,
            tunnel,
            match tunnel.direction() {
                TunnelDirection::Forward => "forward",
                TunnelDirection::Reverse => "reverse",
            }
        );
        tasks.spawn(async move { tunnel.start().await });
    }

    for conf in &file.pipe {
        let pipe = Pipe::from_config(conf, false)?;
        pipe.register(&pipes);
        tasks.spawn(async move {
            pipe.start().await;
            Ok(())
        });
    }

    if tasks.is_empty() {
        return Err(SshError::Config("nothing to run".into()));
    }

    let result = tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
        outcome = wait_for_failure(&mut tasks) => outcome,
    };

    if let Some(manager) = &shared {
        manager.close().await;
    }
    tasks.abort_all();
    result
}

/// First component that stops with an error; Ok once every component ended
async fn wait_for_failure(tasks: &mut JoinSet<Result<(), SshError>>) -> Result<(), SshError> {
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(e) if e.is_cancelled() => {}
            Err(e) => return Err(SshError::ConnectionFailed(format!("task failed: {}", e))),
        }
    }
    Ok(())
}
