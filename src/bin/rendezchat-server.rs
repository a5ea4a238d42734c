//! Rendezchat directory server.
//!
//! Authenticates users against a directory of key files and brokers
//! introductions between them. Chat traffic never passes through it.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

use rendezchat::{
    ChatConfig, DEFAULT_HOST, DEFAULT_SERVER_PORT, DirKeyStore, DirectoryServer, KeyStore,
};

/// Name the server's own key files are stored under.
const SERVER_KEY_NAME: &str = "server";

#[derive(Parser)]
#[command(name = "rendezchat-server")]
#[command(about = "Rendezvous server for end-to-end encrypted peer chat")]
struct Cli {
    /// Address to listen on
    #[arg(long, default_value = DEFAULT_HOST)]
    host: String,

    /// Port to run the server on
    #[arg(short, long, default_value_t = DEFAULT_SERVER_PORT)]
    port: u16,

    /// Directory holding the hex-encoded key files
    #[arg(short, long, default_value = "key_pairs")]
    keys: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let keys = DirKeyStore::new(&cli.keys);
    let identity = keys
        .identity(SERVER_KEY_NAME)
        .with_context(|| format!("Failed to load server keys from {}", cli.keys.display()))?;

    let server = DirectoryServer::bind(
        (cli.host.as_str(), cli.port),
        identity,
        Arc::new(keys),
        ChatConfig::default(),
    )
    .await
    .with_context(|| format!("Failed to listen on {}:{}", cli.host, cli.port))?;

    server.run().await?;
    Ok(())
}
