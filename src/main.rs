//! Dnsveil - covert QUIC-over-DNS tunnel.

use anyhow::{bail, Context as _, Result};
use clap::{Parser, Subcommand};
use dnsveil::socks::{Socks5Dialer, TargetDialer};
use dnsveil::{ClientArgs, ServerArgs, ServerOptions, TunnelOptions};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "dnsveil")]
#[command(version)]
#[command(about = "Covert QUIC-over-DNS tunnel", long_about = None)]
struct Cli {
    /// Log level: debug, info, warn or error
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the client: a local SOCKS5 proxy tunnelled through DNS
    Client {
        /// Tunnel domain the server is authoritative for
        #[arg(long)]
        domain: String,

        /// Local SOCKS5 listen address
        #[arg(long, default_value = "127.0.0.1:1080")]
        listen: String,

        /// Recursive DNS resolver address (host:port)
        #[arg(long)]
        resolver: String,

        /// Server public key file, for certificate pinning
        #[arg(long)]
        pubkey_file: PathBuf,

        /// TX worker pool size
        #[arg(long, default_value_t = TunnelOptions::default().num_tx_workers)]
        tx_workers: usize,

        /// Polls per burst
        #[arg(long, default_value_t = TunnelOptions::default().parallel_polls)]
        parallel_polls: usize,
    },

    /// Run the server: DNS listener, QUIC terminator, target dialer
    Server {
        /// Allowed tunnel domain (repeatable)
        #[arg(long = "domain")]
        domains: Vec<String>,

        /// DNS listen port
        #[arg(long, default_value_t = 5353)]
        dns_port: u16,

        /// Target type: direct or socks5
        #[arg(long, default_value = "direct")]
        target_type: String,

        /// Upstream SOCKS5 address (required when --target-type=socks5)
        #[arg(long)]
        target: Option<String>,

        /// Ed25519 private key file
        #[arg(long)]
        privkey_file: PathBuf,

        /// Max fragments packed per DNS response
        #[arg(long, default_value_t = ServerOptions::default().max_frags_per_response)]
        max_frags: usize,
    },

    /// Generate an Ed25519 key pair and print its fingerprint
    Genkey {
        /// Private key output file
        #[arg(long)]
        privkey_file: PathBuf,

        /// Public key output file
        #[arg(long)]
        pubkey_file: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.log_level.as_str() {
        "debug" => log::LevelFilter::Debug,
        "info" => log::LevelFilter::Info,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        other => bail!("invalid log level: {other}"),
    };
    env_logger::Builder::new()
        .filter_level(level)
        .format_timestamp_secs()
        .init();

    // quinn defers to the process-wide rustls provider.
    let _ = rustls::crypto::ring::default_provider().install_default();

    match cli.command {
        Commands::Client {
            domain,
            listen,
            resolver,
            pubkey_file,
            tx_workers,
            parallel_polls,
        } => {
            let tunnel = TunnelOptions {
                num_tx_workers: tx_workers,
                parallel_polls,
                ..Default::default()
            };
            dnsveil::run_client(ClientArgs {
                listen,
                resolver,
                domain,
                pubkey_file,
                tunnel,
            })
            .await
        }

        Commands::Server {
            domains,
            dns_port,
            target_type,
            target,
            privkey_file,
            max_frags,
        } => {
            let dialer = match target_type.as_str() {
                "direct" => TargetDialer::Direct,
                "socks5" => {
                    let Some(proxy) = target else {
                        bail!("--target is required when --target-type=socks5");
                    };
                    log::info!("using SOCKS5 upstream {proxy}");
                    TargetDialer::Socks5(Socks5Dialer::new(proxy))
                }
                other => bail!("invalid target type: {other}"),
            };
            let options = ServerOptions {
                max_frags_per_response: max_frags,
                ..Default::default()
            };
            dnsveil::run_server(ServerArgs {
                dns_port,
                domains,
                privkey_file,
                target: dialer,
                options,
            })
            .await
        }

        Commands::Genkey {
            privkey_file,
            pubkey_file,
        } => {
            let key_pair = dnsveil::keys::generate_keypair()?;
            dnsveil::keys::save_private_key(&key_pair, &privkey_file)
                .with_context(|| format!("failed to write {}", privkey_file.display()))?;
            println!("private key saved to {}", privkey_file.display());
            dnsveil::keys::save_public_key(&key_pair, &pubkey_file)
                .with_context(|| format!("failed to write {}", pubkey_file.display()))?;
            println!("public key saved to {}", pubkey_file.display());
            println!(
                "fingerprint: {}",
                dnsveil::keys::fingerprint(key_pair.public_key_raw())
            );
            Ok(())
        }
    }
}
