#![forbid(unsafe_code)]

use std::net::Ipv4Addr;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};

use nbt::config::{self, Config};
use nbt::protocol::name::NetbiosName;
use nbt::protocol::name_type;
use nbt::resolver::NameResolver;
use nbt::server::NameServer;
use nbt::session::{NetbiosContext, NetbiosSession};

#[derive(Parser, Debug)]
#[command(name = "nbt", version, about = "NetBIOS over TCP/IP name and session tool")]
struct Cli {
    /// Configuration file (TOML)
    #[arg(short, long, global = true)]
    config: Option<String>,

    /// Log at debug level unless RUST_LOG is set
    #[arg(short, long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Resolve a NetBIOS name to its addresses
    Query {
        name: String,
        /// Name type byte, e.g. 0x20 for a file server
        #[arg(short = 't', long, default_value = "0x20", value_parser = parse_type)]
        name_type: u8,
    },
    /// List the nodes answering for a name
    List {
        name: String,
        #[arg(short = 't', long, default_value = "0x20", value_parser = parse_type)]
        name_type: u8,
    },
    /// Show the names registered on a node
    Status { address: Ipv4Addr },
    /// Send a text datagram to the node owning a name
    Send {
        name: String,
        message: String,
        #[arg(short = 't', long, default_value = "0x03", value_parser = parse_type)]
        name_type: u8,
    },
    /// Open a session to a host and report the result
    Connect {
        host: String,
        /// Calling name to use instead of a generated one
        #[arg(long)]
        local_name: Option<String>,
    },
    /// Run the name server until Ctrl-C
    Serve,
}

fn parse_type(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };
    parsed.map_err(|e| format!("invalid name type '{}': {}", s, e))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.debug { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();

    let config = match &cli.config {
        Some(path) => config::load_config(path)?,
        None => {
            let mut config = Config::default();
            config.validate()?;
            config
        }
    };
    let config = Arc::new(config);

    match cli.command {
        Command::Query { name, name_type } => {
            let resolver = NameResolver::new(config.clone()).await?;
            match resolver.find_name(&name, name_type, config.lookup_timeout()).await? {
                Some(nb) => {
                    for addr in nb.addresses() {
                        println!("{}\t{}", addr, nb);
                    }
                }
                None => println!("{}<{:02X}> not found", name, name_type),
            }
        }
        Command::List { name, name_type } => {
            let resolver = NameResolver::new(config.clone()).await?;
            let nodes = resolver.find_name_list(&name, name_type, config.lookup_timeout()).await?;
            if nodes.is_empty() {
                println!("no nodes answered for {}<{:02X}>", name, name_type);
            }
            for node in nodes {
                println!("{}", node);
            }
        }
        Command::Status { address } => {
            let resolver = NameResolver::new(config.clone()).await?;
            match resolver.find_names_for_address(address, 1).await? {
                Some(names) => {
                    for nb in names.iter() {
                        println!("{:<15} <{:02X}> {}", nb.name(), nb.name_type(), name_type::as_str(nb.name_type()));
                    }
                }
                None => println!("{} returned a malformed adapter status", address),
            }
        }
        Command::Send { name, message, name_type } => {
            let resolver = NameResolver::new(config.clone()).await?;
            match resolver.find_name(&name, name_type, config.lookup_timeout()).await? {
                Some(to) => {
                    let from = NetbiosName::new(&config.local_host_name(), name_type::WORKSTATION, false);
                    resolver.send_datagram(&from, &to, message.as_bytes()).await?;
                    println!("sent {} bytes to {}", message.len(), to);
                }
                None => println!("{}<{:02X}> not found", name, name_type),
            }
        }
        Command::Connect { host, local_name } => {
            let ctx = NetbiosContext::new(config.clone()).await?;
            let mut session = NetbiosSession::new(ctx);
            session.connect(&host, local_name.as_deref(), None).await?;
            println!(
                "{} session to {} at {:?} as {}",
                session.protocol_name(),
                session.remote_name().map(|n| n.to_string()).unwrap_or_default(),
                session.remote_address(),
                session.local_name().map(|n| n.to_string()).unwrap_or_default(),
            );
            session.close().await;
        }
        Command::Serve => {
            let server = NameServer::bind(config.clone()).await?;
            info!(addr = %server.local_addr()?, "NetBIOS name server running");

            let shutdown = tokio::signal::ctrl_c();
            tokio::pin!(shutdown);

            tokio::select! {
                result = server.clone().serve() => {
                    if let Err(e) = &result {
                        error!("Name server error: {:?}", e);
                    }
                    result?;
                }
                _ = &mut shutdown => {
                    info!("Shutting down");
                    let names = server.local_names().await;
                    for nb in names.iter() {
                        if let Err(e) = server.release_name(nb.name(), nb.name_type()).await {
                            error!(name = %nb, "release failed: {:?}", e);
                        }
                    }
                }
            }
        }
    }

    Ok(())
}
