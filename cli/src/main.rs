//! `bftkv`: run a replica, or talk to one
//!
//! ```text
//!   bftkv serve --port 8089 --peer 10.0.0.2:8089
//!   bftkv shell --node 127.0.0.1:8089
//!   bftkv send --node 127.0.0.1:8089 /get '{"key": "..."}'
//! ```

use anyhow::{anyhow, Context, Result};
use bftkv_core::network::Node;
use bftkv_core::protocol::{Message, MessageHeader};
use bftkv_core::{Client, NodeConfig};
use clap::{Args, Parser, Subcommand};
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::net::SocketAddr;
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod commands;
mod keystore;
mod ui;

use commands::CommandHandler;
use keystore::KeyStore;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a replica
    Serve(ServeArgs),

    /// Interactive shell against a running node
    Shell {
        /// Node address
        #[arg(short, long, default_value = "127.0.0.1:8089")]
        node: String,
    },

    /// Send one raw frame and print the reply
    Send {
        /// Node address
        #[arg(short, long, default_value = "127.0.0.1:8089")]
        node: String,

        /// 4-byte header tag, e.g. PING or /new
        header: String,

        /// Frame body, sent as is
        body: Option<String>,
    },
}

#[derive(Args, Debug)]
struct ServeArgs {
    /// TOML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Port to listen on
    #[arg(short, long)]
    port: Option<u16>,

    /// Directory holding node.key (created if missing)
    #[arg(short, long)]
    key_dir: Option<PathBuf>,

    /// Host announced to peers
    #[arg(short, long)]
    advertise: Option<String>,

    /// Peer to link with on startup (host:port), repeatable
    #[arg(long = "peer")]
    peers: Vec<String>,
}

impl ServeArgs {
    /// File settings first, flags on top
    fn into_config(self) -> Result<NodeConfig> {
        let mut config = match &self.config {
            Some(path) => NodeConfig::load(path)?,
            None => NodeConfig::default(),
        };

        if let Some(port) = self.port {
            config.listen = SocketAddr::new(config.listen.ip(), port);
        }
        if let Some(key_dir) = self.key_dir {
            config.key_dir = key_dir;
        }
        if let Some(advertise) = self.advertise {
            config.advertise_host = advertise;
        }
        config.peers.extend(self.peers);

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Command::Serve(_) => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .init();

    match cli.command {
        Command::Serve(args) => serve(args).await,
        Command::Shell { node } => shell(&node).await,
        Command::Send { node, header, body } => send(&node, &header, body.as_deref()).await,
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let config = args.into_config()?;

    let mut keystore = KeyStore::new(config.key_path());
    let keypair = keystore.load_or_create()?;

    ui::print_banner();
    println!("{} {}", "Node:".bright_green(), keystore.name());
    println!(
        "{} {}",
        "Public key:".bright_green(),
        hex::encode(&keypair.public_key().to_bytes()[..8])
    );

    let node = Node::bind(config, keypair).await?;
    println!("{} {}", "Listening:".bright_green(), node.local_addr());
    println!();

    tokio::select! {
        result = node.run() => result.context("Node stopped")?,
        _ = tokio::signal::ctrl_c() => info!("Interrupted, shutting down"),
    }
    Ok(())
}

async fn shell(node: &str) -> Result<()> {
    let client = Client::connect(node)
        .await
        .with_context(|| format!("Could not reach {}", node))?;

    ui::print_banner();
    println!("{} {}", "Node:".bright_green(), node);
    println!("{}", "'help' lists commands, 'quit' leaves".bright_yellow());
    println!();

    let mut handler = CommandHandler::new(client);
    let mut editor = DefaultEditor::new()?;
    let history = PathBuf::from(".bftkv_history");
    if editor.load_history(&history).is_err() {
        tracing::debug!(path = %history.display(), "No shell history yet");
    }

    while let Some(line) = read_line(&mut editor, &handler)? {
        match line.as_str() {
            "" => {}
            "quit" | "exit" => break,
            "help" => ui::print_help(),
            command => {
                if let Err(e) = handler.handle_command(command).await {
                    ui::print_error(&format!("{:#}", e));
                }
            }
        }
    }

    println!("{}", "Bye".bright_green());
    if let Err(e) = editor.save_history(&history) {
        tracing::debug!(error = %e, "Could not save shell history");
    }
    Ok(())
}

/// Next trimmed input line; `None` on end of input. Ctrl-C clears the line.
fn read_line(editor: &mut DefaultEditor, handler: &CommandHandler) -> Result<Option<String>> {
    let prompt = match handler.prompt_key() {
        Some(key) => format!("{} [{}]> ", "bftkv".bright_cyan(), key),
        None => format!("{}> ", "bftkv".bright_cyan()),
    };
    match editor.readline(&prompt) {
        Ok(line) => {
            let line = line.trim().to_string();
            if !line.is_empty() {
                editor.add_history_entry(line.as_str())?;
            }
            Ok(Some(line))
        }
        Err(ReadlineError::Interrupted) => Ok(Some(String::new())),
        Err(ReadlineError::Eof) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

async fn send(node: &str, header: &str, body: Option<&str>) -> Result<()> {
    let header = MessageHeader::parse(header)
        .ok_or_else(|| anyhow!("Header must be exactly 4 bytes, got {:?}", header))?;
    let msg = Message::with_raw(header, body.unwrap_or_default().as_bytes().to_vec());

    let mut client = Client::connect(node)
        .await
        .with_context(|| format!("Could not reach {}", node))?;
    let reply = client.request(msg).await?;
    ui::print_reply(&reply);
    Ok(())
}
