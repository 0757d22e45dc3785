//! dnsveil - covert message transport over DNS
//!
//! `send` reads a message and pushes it through the tunnel; `serve`
//! receives until interrupted, then prints the reassembled message and
//! a gap report; `genkey` mints a shared key.

use std::io::Read;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use rand::rngs::OsRng;
use rand::RngCore;

use dnsveil::{
    config, ChunkCipher, DnsCarrier, DnsServer, LabelCodec, RawConfig, Receiver, Sender,
    SessionError,
};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_INFO: &str = env!("DNSVEIL_BUILD_INFO");

#[derive(Parser)]
#[command(name = "dnsveil")]
#[command(version = VERSION)]
#[command(about = "Covert message transport over DNS", long_about = None)]
struct Cli {
    /// Enable verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct SharedOpts {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Tunnel base domain (e.g. t.example.com)
    #[arg(short, long)]
    domain: Option<String>,

    /// Pre-shared key, 64 hex characters
    #[arg(short, long, env = "DNSVEIL_KEY")]
    key: Option<String>,

    /// File containing the key as hex text
    #[arg(long, value_name = "FILE")]
    key_file: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a message through the tunnel (agent side)
    Send {
        #[command(flatten)]
        shared: SharedOpts,

        /// Tunnel server address
        #[arg(short, long)]
        server: Option<String>,

        /// Plaintext bytes per chunk
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Per-query timeout in seconds
        #[arg(long)]
        timeout: Option<u64>,

        /// Retransmission cap per chunk
        #[arg(long)]
        max_retries: Option<u32>,

        /// Read the message from this file instead of standard input
        file: Option<PathBuf>,
    },

    /// Receive messages until interrupted (server side)
    Serve {
        #[command(flatten)]
        shared: SharedOpts,

        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,

        /// Write the reassembled message here instead of standard output
        #[arg(short, long, value_name = "FILE")]
        output: Option<PathBuf>,
    },

    /// Generate a fresh 32-byte shared key as hex
    Genkey,
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };

    let mut logger = env_logger::Builder::from_default_env();
    if verbose >= 3 {
        logger.filter_module("dnsveil", log::LevelFilter::Trace);
        logger.filter_level(log::LevelFilter::Debug);
    } else {
        logger.filter_level(level);
    }
    logger
        .format_timestamp_millis()
        .format_module_path(true)
        .init();
}

fn resolve_config(shared: SharedOpts, overrides: RawConfig) -> Result<config::TunnelConfig> {
    let file = match &shared.config {
        Some(path) => RawConfig::load(path)?,
        None => RawConfig::default(),
    };
    let cli = RawConfig {
        key: shared.key,
        key_file: shared.key_file,
        domain: shared.domain,
        ..overrides
    };
    Ok(config::resolve(cli.over(file))?)
}

async fn run_send(
    shared: SharedOpts,
    server: Option<String>,
    chunk_size: Option<usize>,
    timeout: Option<u64>,
    max_retries: Option<u32>,
    file: Option<PathBuf>,
) -> Result<()> {
    let config = resolve_config(
        shared,
        RawConfig {
            server,
            chunk_size,
            timeout_secs: timeout,
            max_retries,
            ..RawConfig::default()
        },
    )?;

    let message = match &file {
        Some(path) => {
            std::fs::read(path).with_context(|| format!("reading {}", path.display()))?
        }
        None => {
            let mut buf = Vec::new();
            std::io::stdin()
                .read_to_end(&mut buf)
                .context("reading message from stdin")?;
            buf
        }
    };
    log::info!(
        "message of {} bytes for {} via {}",
        message.len(),
        config.domain,
        config.server
    );

    let carrier = Arc::new(DnsCarrier::new(config.server, config.timeout));
    let sender = Sender::new(&config, carrier, &message)?;
    let report = sender.run().await?;

    println!(
        "delivered {} bytes as {} chunks ({} retransmissions, {} fast) in {:.2?}",
        message.len(),
        report.chunks,
        report.retransmissions,
        report.fast_retransmits,
        report.elapsed
    );
    Ok(())
}

async fn run_serve(
    shared: SharedOpts,
    bind: Option<String>,
    output: Option<PathBuf>,
) -> Result<()> {
    let config = resolve_config(
        shared,
        RawConfig {
            server: bind,
            ..RawConfig::default()
        },
    )?;

    let receiver = Arc::new(Receiver::new(
        LabelCodec::new(config.domain.clone()),
        ChunkCipher::new(&config.key),
    ));
    let server = DnsServer::bind(config.server, Arc::clone(&receiver))
        .await
        .context("binding tunnel server")?;

    println!(
        "serving tunnel domain {} on {} (Ctrl-C to stop and reassemble)",
        config.domain,
        server.local_addr()?
    );

    tokio::select! {
        _ = server.run() => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("interrupt: reassembling");
        }
    }

    let result = receiver.reassemble().await;
    eprintln!();
    eprintln!("received sequences: {:?}", result.received);
    eprintln!("missing sequences:  {:?}", result.missing);
    if result.auth_failures > 0 {
        eprintln!("rejected {} chunks for bad authentication", result.auth_failures);
    }
    if !result.is_complete() {
        eprintln!("warning: message is incomplete");
    }

    match &output {
        Some(path) => {
            std::fs::write(path, &result.message)
                .with_context(|| format!("writing {}", path.display()))?;
            eprintln!("wrote {} bytes to {}", result.message.len(), path.display());
        }
        None => {
            println!("{}", String::from_utf8_lossy(&result.message));
        }
    }
    Ok(())
}

fn run_genkey() {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    println!("{}", hex::encode(key));
}

fn exit_code(error: &anyhow::Error) -> i32 {
    match error.downcast_ref::<SessionError>() {
        Some(SessionError::NoPeer { .. }) => 2,
        Some(SessionError::PermanentLoss { .. }) => 3,
        None => 1,
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging(cli.verbose);
    log::debug!("dnsveil {VERSION} ({BUILD_INFO})");

    let result = match cli.command {
        Commands::Send {
            shared,
            server,
            chunk_size,
            timeout,
            max_retries,
            file,
        } => run_send(shared, server, chunk_size, timeout, max_retries, file).await,
        Commands::Serve {
            shared,
            bind,
            output,
        } => run_serve(shared, bind, output).await,
        Commands::Genkey => {
            run_genkey();
            Ok(())
        }
    };

    if let Err(error) = result {
        log::error!("{error:#}");
        std::process::exit(exit_code(&error));
    }
}
