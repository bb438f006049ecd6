//! Server settings from `FERRY_*` environment variables.

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Result, bail};
use ferry_transfer::config::parse_or;
use ferry_transfer::transport::DEFAULT_SOCKET_BUFFER;
use ferry_transfer::{EvictionPolicy, MAX_CHUNK_SIZE, OverflowPolicy, SenderConfig};

pub struct ServerSettings {
    pub bind: SocketAddr,
    pub socket_buffer: usize,
    pub transfer: SenderConfig,
}

impl ServerSettings {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from any key lookup. Unset or blank keys take their default.
    pub fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = SenderConfig::default();

        let host: IpAddr = parse_or(&var, "FERRY_HOST", IpAddr::from([0, 0, 0, 0]))?;
        let port: u16 = parse_or(&var, "FERRY_PORT", 8080)?;
        let root: PathBuf = parse_or(&var, "FERRY_ROOT", PathBuf::from("."))?;

        let chunk_size: u32 = parse_or(&var, "FERRY_CHUNK_SIZE", defaults.chunk_size)?;
        if chunk_size == 0 || chunk_size > MAX_CHUNK_SIZE {
            bail!("FERRY_CHUNK_SIZE must be between 1 and {}, got {}", MAX_CHUNK_SIZE, chunk_size);
        }
        let ring_capacity: usize = parse_or(&var, "FERRY_RING_CAPACITY", defaults.ring_capacity)?;
        if ring_capacity == 0 {
            bail!("FERRY_RING_CAPACITY must be at least 1");
        }
        let max_sessions: usize = parse_or(&var, "FERRY_MAX_SESSIONS", defaults.max_sessions)?;
        if max_sessions == 0 {
            bail!("FERRY_MAX_SESSIONS must be at least 1");
        }

        let overflow: OverflowPolicy = parse_or(&var, "FERRY_OVERFLOW", defaults.overflow)?;
        let eviction: EvictionPolicy = parse_or(&var, "FERRY_EVICTION", defaults.eviction)?;
        let resend_ms: u64 = parse_or(
            &var,
            "FERRY_RESEND_TIMEOUT_MS",
            defaults.resend_timeout.as_millis() as u64,
        )?;
        let session_secs: u64 = parse_or(
            &var,
            "FERRY_SESSION_TIMEOUT_SECS",
            defaults.session_timeout.as_secs(),
        )?;
        let socket_buffer: usize = parse_or(&var, "FERRY_SOCKET_BUFFER", DEFAULT_SOCKET_BUFFER)?;

        Ok(Self {
            bind: SocketAddr::new(host, port),
            socket_buffer,
            transfer: SenderConfig {
                root,
                chunk_size,
                ring_capacity,
                overflow,
                eviction,
                resend_timeout: Duration::from_millis(resend_ms),
                session_timeout: Duration::from_secs(session_secs),
                max_sessions,
                ..defaults
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn settings(pairs: &[(&str, &str)]) -> Result<ServerSettings> {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ServerSettings::from_lookup(|key| env.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let s = settings(&[]).unwrap();
        assert_eq!(s.bind, "0.0.0.0:8080".parse::<SocketAddr>().unwrap());
        assert_eq!(s.socket_buffer, 4 * 1024 * 1024);
        assert_eq!(s.transfer.chunk_size, 1024);
        assert_eq!(s.transfer.ring_capacity, 65536);
        assert_eq!(s.transfer.overflow, OverflowPolicy::Reject);
        assert_eq!(s.transfer.eviction, EvictionPolicy::ForceAck);
        assert_eq!(s.transfer.resend_timeout, Duration::from_secs(5));
        assert_eq!(s.transfer.session_timeout, Duration::from_secs(60));
        assert_eq!(s.transfer.max_sessions, 64);
    }

    #[test]
    fn overrides() {
        let s = settings(&[
            ("FERRY_HOST", "::1"),
            ("FERRY_PORT", "9000"),
            ("FERRY_ROOT", "/srv/files"),
            ("FERRY_CHUNK_SIZE", "1400"),
            ("FERRY_OVERFLOW", "alias"),
            ("FERRY_EVICTION", "retry:4"),
            ("FERRY_RESEND_TIMEOUT_MS", "250"),
            ("FERRY_MAX_SESSIONS", "1"),
        ])
        .unwrap();
        assert_eq!(s.bind, "[::1]:9000".parse::<SocketAddr>().unwrap());
        assert_eq!(s.transfer.root, PathBuf::from("/srv/files"));
        assert_eq!(s.transfer.chunk_size, 1400);
        assert_eq!(s.transfer.overflow, OverflowPolicy::Alias);
        assert_eq!(s.transfer.eviction, EvictionPolicy::RetryThenFail { max_attempts: 4 });
        assert_eq!(s.transfer.resend_timeout, Duration::from_millis(250));
        assert_eq!(s.transfer.max_sessions, 1);
    }

    #[test]
    fn blank_values_fall_back_to_defaults() {
        let s = settings(&[("FERRY_PORT", "  ")]).unwrap();
        assert_eq!(s.bind.port(), 8080);
    }

    #[test]
    fn rejects_bad_values() {
        assert!(settings(&[("FERRY_PORT", "http")]).is_err());
        assert!(settings(&[("FERRY_CHUNK_SIZE", "0")]).is_err());
        assert!(settings(&[("FERRY_CHUNK_SIZE", "1401")]).is_err());
        assert!(settings(&[("FERRY_RING_CAPACITY", "0")]).is_err());
        assert!(settings(&[("FERRY_EVICTION", "forever")]).is_err());
        assert!(settings(&[("FERRY_HOST", "localhost")]).is_err());
    }
}
