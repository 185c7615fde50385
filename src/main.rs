//! linkrpc - command-line client for a linkrpc peer.
//!
//! Links to a single peer, issues one call or control frame and exits.

use bytes::Bytes;
use clap::{Parser, Subcommand};
use colored::Colorize;
use linkrpc_client::{reconnect, Client, Config, DispatchError, Dispatcher, TcpTransport};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "linkrpc")]
#[command(about = "Command-line client for linkrpc peers")]
#[command(version)]
struct Cli {
    /// Peer address (overrides the config file)
    #[arg(short, long, env = "LINKRPC_ADDR")]
    addr: Option<String>,

    /// YAML config file
    #[arg(short, long, env = "LINKRPC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Call a remote target and print the result
    Call {
        /// Target name
        target: String,

        /// Arguments (raw text, or @file to read from file)
        args: Option<String>,
    },

    /// Send a control frame
    Ctrl {
        /// Control code
        #[arg(allow_hyphen_values = true)]
        code: i32,

        /// Payload (raw text, or @file to read from file)
        data: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        eprintln!("{}: {}", "Error".red(), e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = Config::load_from(cli.config.as_deref())?;
    if let Some(addr) = cli.addr {
        config.link.addr = addr;
    }
    if let Some(ref path) = cli.config {
        tracing::info!("Loaded config from {}", path.display());
    }

    let transport = TcpTransport::new(config.link.connect_timeout());
    let dispatcher = Dispatcher::new(Arc::new(transport));
    dispatcher.on_fatal(|err| {
        eprintln!("{}: {}", "Fatal".red(), err);
        std::process::exit(1);
    });
    reconnect::install(&dispatcher, config.dispatch.reconnect_policy());

    let client = Client::new(dispatcher).with_call_timeout(config.dispatch.call_timeout());
    if let Err(e) = client.dispatcher().link(&config.link.addr).await {
        eprintln!("{}: {}", "Connection failed".red(), e);
        std::process::exit(1);
    }

    let outcome = execute(&client, cli.command).await;
    client.close().await;
    outcome
}

async fn execute(client: &Client, command: Commands) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Call { target, args } => {
            let args = match args {
                Some(arg) => read_arg(&arg)?,
                None => Bytes::new(),
            };
            match client.call(&target, args).await {
                Ok(result) => {
                    println!("{}", format_result(&result));
                    Ok(())
                }
                Err(DispatchError::Remote(message)) => {
                    eprintln!("{}: {}", "Remote error".red(), message);
                    std::process::exit(1);
                }
                Err(e) => Err(e.into()),
            }
        }
        Commands::Ctrl { code, data } => {
            let data = match data {
                Some(arg) => read_arg(&arg)?,
                None => Bytes::new(),
            };
            client.send_ctrl(code, data).await?;
            println!("{} control code {}", "Sent".green(), code);
            Ok(())
        }
    }
}

/// Reads an argument given inline or as `@path`.
fn read_arg(arg: &str) -> Result<Bytes, Box<dyn std::error::Error>> {
    if let Some(path) = arg.strip_prefix('@') {
        Ok(Bytes::from(std::fs::read(path)?))
    } else {
        Ok(Bytes::copy_from_slice(arg.as_bytes()))
    }
}

fn format_result(result: &[u8]) -> String {
    match std::str::from_utf8(result) {
        Ok(text) => text.to_string(),
        Err(_) => format!("<{} bytes> {:02x?}", result.len(), result),
    }
}
