//! Client settings: `FERRY_*` environment variables, overridden by CLI flags.

use std::net::{SocketAddr, ToSocketAddrs};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use ferry_transfer::config::{parse_opt, parse_or};
use ferry_transfer::receiver::DEFAULT_MAX_CHUNKS;
use ferry_transfer::transport::DEFAULT_SOCKET_BUFFER;
use ferry_transfer::{ReceiverConfig, TrackerConfig};

pub struct ClientSettings {
    /// `host:port` as given. Resolved by [`resolve_server`].
    pub server: String,
    pub output_dir: PathBuf,
    pub socket_buffer: usize,
    pub tracker: TrackerConfig,
    pub idle_timeout: Option<Duration>,
    pub max_chunks: u32,
}

impl ClientSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = TrackerConfig::default();

        let server: String = parse_or(&var, "FERRY_SERVER", "127.0.0.1:8080".to_string())?;
        let output_dir: PathBuf = parse_or(&var, "FERRY_OUTPUT_DIR", PathBuf::from("."))?;
        let socket_buffer: usize = parse_or(&var, "FERRY_SOCKET_BUFFER", DEFAULT_SOCKET_BUFFER)?;

        let ack_batch: u32 = parse_or(&var, "FERRY_ACK_BATCH", defaults.ack_batch)?;
        if ack_batch == 0 {
            bail!("FERRY_ACK_BATCH must be at least 1");
        }
        let resend_ms: u64 = parse_or(
            &var,
            "FERRY_RESEND_TIMEOUT_MS",
            defaults.resend_timeout.as_millis() as u64,
        )?;
        let suppression_ms: u64 = parse_or(
            &var,
            "FERRY_SUPPRESSION_MS",
            defaults.suppression.as_millis() as u64,
        )?;
        let idle_secs: Option<u64> = parse_opt(&var, "FERRY_IDLE_TIMEOUT_SECS")?;
        let max_chunks: u32 = parse_or(&var, "FERRY_MAX_CHUNKS", DEFAULT_MAX_CHUNKS)?;

        Ok(Self {
            server,
            output_dir,
            socket_buffer,
            tracker: TrackerConfig {
                ack_batch,
                resend_timeout: Duration::from_millis(resend_ms),
                suppression: Duration::from_millis(suppression_ms),
            },
            idle_timeout: idle_secs.map(Duration::from_secs),
            max_chunks,
        })
    }

    pub fn receiver_config(&self, server: SocketAddr) -> ReceiverConfig {
        ReceiverConfig {
            server,
            output_dir: self.output_dir.clone(),
            tracker: self.tracker,
            idle_timeout: self.idle_timeout,
            max_chunks: self.max_chunks,
            ..ReceiverConfig::default()
        }
    }
}

/// First address `host:port` resolves to.
pub fn resolve_server(server: &str) -> Result<SocketAddr> {
    server
        .to_socket_addrs()
        .with_context(|| format!("cannot resolve server address {:?}", server))?
        .next()
        .with_context(|| format!("server address {:?} resolved to nothing", server))
}
