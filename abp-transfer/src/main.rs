//! Entry point for `abp-transfer`.
//!
//! Parses CLI arguments and runs either the **serve** or **send** mode.  All
//! protocol work lives in the library; `main.rs` owns only process setup
//! (logging, signal handling, argument parsing).

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};

use abp_transfer::config::ServerConfig;
use abp_transfer::packet::MAX_SEGMENT_SIZE;
use abp_transfer::registry::AdmissionPolicy;
use abp_transfer::server::Server;
use abp_transfer::socket::Socket;
use abp_transfer::store::OutputPolicy;
use abp_transfer::timer::TimerConfig;
use abp_transfer::uploader::{UploadConfig, Uploader};

/// Alternating-bit file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Subcommand)]
enum Mode {
    /// Receive files from any number of senders.
    Serve {
        /// UDP port to listen on.
        port: u16,
        /// Session cap; a handshake that brings the registry to this size is refused.
        max_sessions: usize,
        /// Local address to bind.
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind_ip: IpAddr,
        /// Write files under this directory, using only their final name component.
        #[arg(long)]
        output_dir: Option<PathBuf>,
        /// Do not keep sessions for refused handshakes.
        #[arg(long)]
        strict_admission: bool,
        /// Payload bytes per data message.
        #[arg(long, default_value_t = MAX_SEGMENT_SIZE)]
        segment_size: usize,
    },
    /// Upload one file to a server.
    Send {
        /// Server address (e.g. 127.0.0.1:9000).
        server: SocketAddr,
        /// File to upload.
        path: PathBuf,
        /// Name to store the file under (defaults to the file name).
        #[arg(long)]
        name: Option<String>,
        /// Payload bytes per data message; must match the server.
        #[arg(long, default_value_t = MAX_SEGMENT_SIZE)]
        segment_size: usize,
        /// Initial retransmit timeout in milliseconds.
        #[arg(long, default_value_t = 500)]
        timeout_ms: u64,
        /// Consecutive timeouts tolerated per message.
        #[arg(long, default_value_t = 8)]
        max_retries: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // RUST_LOG overrides the default level.
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Serve {
            port,
            max_sessions,
            bind_ip,
            output_dir,
            strict_admission,
            segment_size,
        } => {
            if segment_size == 0 {
                bail!("--segment-size must be at least 1");
            }
            let config = ServerConfig {
                bind: SocketAddr::new(bind_ip, port),
                max_sessions,
                segment_size,
                admission: if strict_admission {
                    AdmissionPolicy::Strict
                } else {
                    AdmissionPolicy::Permissive
                },
                output: output_dir.map_or(OutputPolicy::Verbatim, OutputPolicy::Confined),
            };
            let server = Server::bind(&config)
                .await
                .with_context(|| format!("cannot bind {}", config.bind))?;
            let report = server.run_until_ctrl_c().await?;
            log::info!(
                "served {} file(s); {} session(s) abandoned",
                report.metrics.completed,
                report.abandoned_sessions
            );
        }
        Mode::Send {
            server,
            path,
            name,
            segment_size,
            timeout_ms,
            max_retries,
        } => {
            if segment_size == 0 {
                bail!("--segment-size must be at least 1");
            }
            let local: SocketAddr = if server.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let socket = Socket::bind(local).await.context("cannot bind local socket")?;
            let config = UploadConfig {
                segment_size,
                timer: TimerConfig {
                    initial_rto: Duration::from_millis(timeout_ms),
                    max_retries,
                    ..TimerConfig::default()
                },
            };
            let mut uploader = Uploader::new(socket, server, config);
            let report = uploader
                .upload_file(&path, name.as_deref())
                .await
                .with_context(|| format!("upload of {} failed", path.display()))?;
            println!(
                "sent {} bytes in {} segment(s), {} retransmission(s)",
                report.bytes, report.segments, report.retransmissions
            );
        }
    }

    Ok(())
}
