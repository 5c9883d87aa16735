//! netnext backend
//!
//! Session-routing server for the netnext relay network.

mod config;
mod service;

use std::path::PathBuf;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use config::Config;

/// netnext - session routing backend for a UDP relay network
#[derive(Parser)]
#[command(name = "netnext")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the UDP backend
    Serve {
        /// Listen address, overrides the config file
        #[arg(short, long)]
        bind: Option<String>,
    },

    /// Generate a router keypair and a buyer signing keypair
    Keygen,

    /// Print the configuration in effect as TOML
    Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)?,
        None => Config::default(),
    };

    if let Commands::Serve { bind: Some(bind) } = &cli.command {
        config.server.listen_addr.clone_from(bind);
    }

    config.validate()?;

    let level = if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Serve { .. } => service::serve(&config).await?,
        Commands::Keygen => generate_keys(),
        Commands::Config => print!("{}", config.to_toml()?),
    }

    Ok(())
}

/// Print a fresh router X25519 keypair and buyer Ed25519 keypair
fn generate_keys() {
    use netnext_crypto::signatures::SigningKey;
    use netnext_crypto::x25519::PrivateKey;

    let mut rng = rand_core::OsRng;

    let router = PrivateKey::generate(&mut rng);
    println!("Router keypair (X25519, base64)");
    println!("  private: {}", STANDARD.encode(router.to_bytes()));
    println!("  public:  {}", STANDARD.encode(router.public_key().to_bytes()));
    println!();

    let buyer = SigningKey::generate(&mut rng);
    println!("Buyer keypair (Ed25519, hex)");
    println!("  private: {}", hex::encode(buyer.to_bytes()));
    println!("  public:  {}", hex::encode(buyer.verifying_key().to_bytes()));
    println!();
    println!("Put the router private key in [keys] router_private_key.");
}
