mod config;

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use ferry_transfer::{TracingLogger, TransferStats, bind_udp, receive_file};
use tracing::info;

use crate::config::{ClientSettings, resolve_server};

#[derive(Parser)]
#[command(name = "ferry-client", about = "Fetch a file from a ferry server over UDP")]
struct Cli {
    /// Name of the file to request, relative to the server's root
    filename: String,

    /// Server address as HOST:PORT (overrides FERRY_SERVER)
    #[arg(short, long)]
    server: Option<String>,

    /// Directory to write the file into (overrides FERRY_OUTPUT_DIR)
    #[arg(short, long)]
    output_dir: Option<PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ferry_client=info,ferry_transfer=info".into()),
        )
        .init();

    let cli = Cli::parse();
    let mut settings = ClientSettings::from_env()?;
    if let Some(server) = cli.server {
        settings.server = server;
    }
    if let Some(dir) = cli.output_dir {
        settings.output_dir = dir;
    }

    let server = resolve_server(&settings.server)?;
    let local = SocketAddr::new(
        if server.is_ipv4() {
            Ipv4Addr::UNSPECIFIED.into()
        } else {
            Ipv6Addr::UNSPECIFIED.into()
        },
        0,
    );
    let socket = bind_udp(local, settings.socket_buffer).context("cannot bind UDP socket")?;
    info!("Requesting {} from {}", cli.filename, server);

    let stats = TransferStats::new();
    let outcome = receive_file(
        &socket,
        &settings.receiver_config(server),
        &cli.filename,
        &stats,
        &TracingLogger,
    )
    .with_context(|| format!("transfer of {} failed", cli.filename))?;

    let secs = outcome.elapsed.as_secs_f64();
    let rate = if secs > 0.0 {
        outcome.metadata.file_size as f64 / secs / 1024.0 / 1024.0
    } else {
        0.0
    };
    info!(
        "Received {} bytes in {} chunks to {} ({:.2}s, {:.2} MB/s, {} resend requests, {} duplicates)",
        outcome.metadata.file_size,
        outcome.metadata.total_chunks,
        outcome.path.display(),
        secs,
        rate,
        stats.retransmits.load(std::sync::atomic::Ordering::Relaxed),
        stats.duplicates.load(std::sync::atomic::Ordering::Relaxed),
    );
    Ok(())
}
