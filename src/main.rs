//! Sluice CLI
//!
//! Exposes a local service through a sluice relay.
//!
//! - `sluice tcp` starts a hello HTTP server on a fresh Unix socket (or
//!   uses `--upstream`) and publishes it as a TCP endpoint
//! - `sluice relay` runs the development relay
//! - `sluice login` stores an authtoken in the config file

#![deny(clippy::correctness)]
#![warn(clippy::suspicious)]
#![warn(clippy::style)]
#![warn(clippy::complexity)]
#![warn(clippy::perf)]

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use sluice::client::{pipe_name, Destination, Session, AUTHTOKEN_ENV, DEFAULT_SERVER};
use sluice::config::Config;
use sluice::hello::HelloServer;
use sluice::protocol::ProxyProto;
use sluice::relay::RelayServer;

#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(author, version, about = "Expose a local pipe or port through a relay")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Relay address: host[:port] (wss) or a ws:// / wss:// URL.
    /// Defaults to the local development relay.
    #[arg(short, long, global = true, env = "SLUICE_SERVER")]
    server: Option<String>,

    /// Authtoken for the relay
    #[arg(short = 'k', long, global = true, env = AUTHTOKEN_ENV)]
    token: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Publish a local service as a TCP endpoint
    Tcp(TcpArgs),

    /// Run a development relay
    Relay(RelayArgs),

    /// Save an authtoken to the config file
    Login,
}

#[derive(Parser, Debug)]
struct TcpArgs {
    /// Socket path for the built-in hello server (default: fresh temp path)
    #[arg(short, long)]
    pipe: Option<std::path::PathBuf>,

    /// Forward to this destination instead of the hello server
    /// (`unix:/path/to.sock` or `host:port`)
    #[arg(short, long)]
    upstream: Option<Destination>,

    /// Session metadata reported to the relay
    #[arg(long)]
    metadata: Option<String>,

    /// Endpoint metadata reported to the relay
    #[arg(long)]
    tunnel_metadata: Option<String>,

    /// Request a specific public address (host:port)
    #[arg(long)]
    remote_addr: Option<String>,

    /// Upstream description shown by the relay
    #[arg(long)]
    forwards_to: Option<String>,

    /// PROXY protocol header for forwarded connections ("", 1 or 2)
    #[arg(long, default_value = "")]
    proxy_proto: ProxyProto,

    /// Only accept public connections from this CIDR (repeatable)
    #[arg(long = "allow-cidr")]
    allow_cidr: Vec<String>,

    /// Refuse public connections from this CIDR (repeatable)
    #[arg(long = "deny-cidr")]
    deny_cidr: Vec<String>,
}

#[derive(Parser, Debug)]
struct RelayArgs {
    /// Control connection listen address
    #[arg(short, long)]
    listen: Option<String>,

    /// Host advertised in endpoint URLs
    #[arg(long)]
    public_host: Option<String>,

    /// Interface endpoint listeners bind to
    #[arg(long)]
    bind_host: Option<String>,

    /// Accepted authtoken (repeatable; none accepts any token)
    #[arg(long = "relay-token")]
    relay_token: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = Config::load().unwrap_or_default();

    match cli.command {
        Some(Commands::Tcp(args)) => {
            init_logging(cli.verbose);
            let server = cli
                .server
                .or(config.auth.server.clone())
                .unwrap_or_else(|| DEFAULT_SERVER.to_string());
            run_tcp(cli.token, &server, args, &config).await
        }
        Some(Commands::Relay(args)) => {
            init_logging(cli.verbose);
            run_relay(args, &config).await
        }
        Some(Commands::Login) => run_login(cli.server),
        None => {
            eprintln!("No command specified. Use --help for usage information.");
            eprintln!();
            eprintln!("Quick start:");
            eprintln!("  sluice relay --relay-token secret          Run a local relay");
            eprintln!("  sluice tcp -k secret                       Publish a hello server");
            eprintln!("  sluice login                               Save your authtoken");
            std::process::exit(1);
        }
    }
}

async fn run_tcp(
    cli_token: Option<String>,
    server: &str,
    args: TcpArgs,
    config: &Config,
) -> Result<()> {
    let token = cli_token.or(config.auth.token.clone()).ok_or_else(|| {
        anyhow::anyhow!(
            "Authtoken required. Use --token, set {}, \n\
             or add it to the config file at {:?}.",
            AUTHTOKEN_ENV,
            Config::config_path().unwrap_or_default()
        )
    })?;

    // The hello server must be listening before the endpoint goes live.
    let (destination, hello) = match args.upstream {
        Some(upstream) => (upstream, None),
        None => {
            let path = args.pipe.unwrap_or_else(pipe_name);
            let server = HelloServer::bind(&path)
                .with_context(|| format!("Failed to bind {}", path.display()))?;
            (Destination::Pipe(path), Some(server))
        }
    };
    let hello_task = hello.map(|server| {
        tokio::spawn(async move {
            if let Err(e) = server.run().await {
                warn!("Hello server stopped: {}", e);
            }
        })
    });

    let mut builder = Session::builder()
        .server_addr(server)
        .authtoken(token);
    if let Some(metadata) = args.metadata.or(config.session.metadata.clone()) {
        builder = builder.metadata(metadata);
    }
    if let Some(interval) = config.session.heartbeat_interval() {
        builder = builder.heartbeat_interval(interval);
    }
    if let Some(connect_timeout) = config.session.connect_timeout() {
        builder = builder.connect_timeout(connect_timeout);
    }

    let session = builder
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", server))?;

    let mut status = session.status();
    let status_task = tokio::spawn(async move {
        while status.changed().await.is_ok() {
            let current = status.borrow_and_update().clone();
            if current.is_connected() {
                info!("Relay connection: {}", current);
            } else {
                warn!("Relay connection: {}", current);
            }
        }
    });

    let mut endpoint = session
        .tcp_endpoint()
        .proxy_proto(args.proxy_proto)
        .forwards_to(
            args.forwards_to
                .unwrap_or_else(|| destination.to_string()),
        );
    if let Some(metadata) = args.tunnel_metadata {
        endpoint = endpoint.metadata(metadata);
    }
    if let Some(addr) = args.remote_addr {
        endpoint = endpoint.remote_addr(addr);
    }
    for cidr in args.allow_cidr {
        endpoint = endpoint.allow_cidr(cidr);
    }
    for cidr in args.deny_cidr {
        endpoint = endpoint.deny_cidr(cidr);
    }

    let mut tunnel = endpoint.listen().await.context("Failed to open endpoint")?;

    println!("Forwarding {} -> {}", tunnel.url(), destination);

    let result = tokio::select! {
        result = tunnel.forward(destination) => result.context("Forwarding failed"),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    };

    if let Err(e) = tunnel.close().await {
        warn!("Failed to close endpoint: {}", e);
    }
    session.close().await;
    status_task.abort();
    if let Some(task) = hello_task {
        task.abort();
    }

    result
}

async fn run_relay(args: RelayArgs, config: &Config) -> Result<()> {
    let mut relay_config = config.relay.to_relay_config();
    if let Some(listen) = args.listen {
        relay_config.listen = listen;
    }
    if let Some(public_host) = args.public_host {
        relay_config.public_host = Some(public_host);
    }
    if let Some(bind_host) = args.bind_host {
        relay_config.bind_host = bind_host;
    }
    if !args.relay_token.is_empty() {
        relay_config.tokens = args.relay_token;
    }
    if relay_config.tokens.is_empty() {
        warn!("No relay tokens configured, any non-empty token is accepted");
    }

    let listen = relay_config.listen.clone();
    let relay = RelayServer::bind(relay_config)
        .await
        .with_context(|| format!("Failed to bind relay on {}", listen))?;
    let addr = relay.local_addr()?;
    println!("Relay listening on ws://{}", addr);

    tokio::select! {
        result = relay.run() => result.context("Relay stopped"),
        _ = tokio::signal::ctrl_c() => {
            info!("Interrupted, shutting down");
            Ok(())
        }
    }
}

fn run_login(server: Option<String>) -> Result<()> {
    println!("Paste the authtoken issued by your relay operator.");
    println!();

    print!("Authtoken: ");
    use std::io::{self, Write};
    io::stdout().flush()?;

    let mut token = String::new();
    io::stdin().read_line(&mut token)?;
    let token = token.trim().to_string();

    if token.is_empty() {
        anyhow::bail!("No token provided");
    }

    let mut config = Config::load().unwrap_or_default();
    config.auth.token = Some(token);
    if server.is_some() {
        config.auth.server = server;
    }
    config.save()?;

    println!();
    println!(
        "Token saved to {:?}",
        Config::config_path().unwrap_or_default()
    );
    println!("You can now run: sluice tcp");

    Ok(())
}

fn init_logging(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    });

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init();
}
