//! Configuration for the transport core
//!
//! [`TransportConfig`] holds every tunable the registry, resolver and
//! ingestion pipeline read. Each field has a default, so a TOML file only
//! needs to list what it overrides:
//!
//! ```toml
//! network = "external"
//! stream_idle_timeout_ms = 600000
//! respond_to_keepalive = false
//!
//! [tls]
//! cert_path = "/etc/sip/cert.pem"
//! key_path = "/etc/sip/key.pem"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Transport core configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Name of the network these sockets belong to
    pub network: String,

    /// Idle timeout for UDP connections
    pub udp_idle_timeout_ms: u64,

    /// Idle timeout for TCP and TLS connections
    pub stream_idle_timeout_ms: u64,

    /// Period of the idle sweep
    pub sweep_interval_ms: u64,

    /// How long a sender waits for a connection's send lock
    pub lock_wait_buffer_ms: u64,

    /// TCP connect timeout
    pub connect_timeout_ms: u64,

    /// TLS handshake timeout
    pub tls_handshake_timeout_ms: u64,

    /// Per-query DNS timeout
    pub dns_timeout_ms: u64,

    /// Datagrams shorter than this made only of CR/LF are keepalives
    pub max_keepalive_size: usize,

    /// Answer keepalives with a bare CRLF
    pub respond_to_keepalive: bool,

    /// Largest datagram the UDP listener reads
    pub max_udp_packet_size: usize,

    /// Largest framed message (headers plus body) read from a stream
    pub max_stream_message_size: usize,

    /// Cap on open TCP + TLS connections
    pub max_stream_connections: usize,

    /// Workers in the SIP processing lane
    pub worker_count: usize,

    /// Queued units of work per lane before inbound messages are dropped
    pub queue_capacity: usize,

    /// TLS material
    pub tls: TlsSettings,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            network: "default".to_string(),
            udp_idle_timeout_ms: 60_000,
            stream_idle_timeout_ms: 14_400_000,
            sweep_interval_ms: 60_000,
            lock_wait_buffer_ms: 1_000,
            connect_timeout_ms: 1_000,
            tls_handshake_timeout_ms: 3_000,
            dns_timeout_ms: 5_000,
            max_keepalive_size: 10,
            respond_to_keepalive: true,
            max_udp_packet_size: 65_535,
            max_stream_message_size: 65_535,
            max_stream_connections: 4_096,
            worker_count: 4,
            queue_capacity: 10_000,
            tls: TlsSettings::default(),
        }
    }
}

impl TransportConfig {
    /// Create a configuration with defaults for the named network
    pub fn new(network: impl Into<String>) -> Self {
        Self {
            network: network.into(),
            ..Default::default()
        }
    }

    /// Parse a configuration from TOML text
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)
            .map_err(|e| Error::config(format!("invalid transport config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_toml_str(&text)
    }

    /// Reject values the rest of the crate cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(Error::config("worker_count must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(Error::config("queue_capacity must be at least 1"));
        }
        if self.sweep_interval_ms == 0 {
            return Err(Error::config("sweep_interval_ms must be positive"));
        }
        if self.max_udp_packet_size == 0 || self.max_stream_message_size == 0 {
            return Err(Error::config("message size limits must be positive"));
        }
        Ok(())
    }

    /// Idle timeout applied to new connections of `transport`
    pub fn idle_timeout(&self, transport: Transport) -> Duration {
        if transport.is_reliable() {
            Duration::from_millis(self.stream_idle_timeout_ms)
        } else {
            Duration::from_millis(self.udp_idle_timeout_ms)
        }
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_millis(self.sweep_interval_ms)
    }

    pub fn lock_wait_buffer(&self) -> Duration {
        Duration::from_millis(self.lock_wait_buffer_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn tls_handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.tls_handshake_timeout_ms)
    }

    pub fn dns_timeout(&self) -> Duration {
        Duration::from_millis(self.dns_timeout_ms)
    }

    /// Set both idle timeouts
    pub fn with_idle_timeouts(mut self, udp: Duration, stream: Duration) -> Self {
        self.udp_idle_timeout_ms = udp.as_millis() as u64;
        self.stream_idle_timeout_ms = stream.as_millis() as u64;
        self
    }

    /// Set the sweep period
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_ms = interval.as_millis() as u64;
        self
    }

    /// Set the send lock wait buffer
    pub fn with_lock_wait_buffer(mut self, wait: Duration) -> Self {
        self.lock_wait_buffer_ms = wait.as_millis() as u64;
        self
    }

    /// Enable or disable keepalive replies
    pub fn with_keepalive_response(mut self, respond: bool) -> Self {
        self.respond_to_keepalive = respond;
        self
    }

    /// Set the worker lane size
    pub fn with_workers(mut self, worker_count: usize, queue_capacity: usize) -> Self {
        self.worker_count = worker_count;
        self.queue_capacity = queue_capacity;
        self
    }

    /// Set the stream connection cap
    pub fn with_max_stream_connections(mut self, limit: usize) -> Self {
        self.max_stream_connections = limit;
        self
    }

    /// Set TLS material
    pub fn with_tls(mut self, tls: TlsSettings) -> Self {
        self.tls = tls;
        self
    }
}

/// Certificate material for TLS listeners and outbound TLS connections
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TlsSettings {
    /// PEM certificate chain presented by listeners
    pub cert_path: Option<PathBuf>,

    /// PEM private key (PKCS#8 or RSA) for `cert_path`
    pub key_path: Option<PathBuf>,

    /// PEM bundle of CAs trusted for outbound connections
    pub ca_path: Option<PathBuf>,

    /// Disable server certificate verification. Test setups only.
    #[cfg(feature = "dev-insecure-tls")]
    pub insecure_skip_verify: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_stack_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.idle_timeout(Transport::Udp), Duration::from_secs(60));
        assert_eq!(config.idle_timeout(Transport::Tls), Duration::from_secs(14_400));
        assert_eq!(config.lock_wait_buffer(), Duration::from_millis(1000));
        assert_eq!(config.max_keepalive_size, 10);
        assert!(config.respond_to_keepalive);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config = TransportConfig::from_toml_str(
            r#"
            network = "external"
            stream_idle_timeout_ms = 600000
            respond_to_keepalive = false

            [tls]
            cert_path = "/etc/sip/cert.pem"
            "#,
        )
        .unwrap();

        assert_eq!(config.network, "external");
        assert_eq!(config.idle_timeout(Transport::Tcp), Duration::from_secs(600));
        assert_eq!(config.idle_timeout(Transport::Udp), Duration::from_secs(60));
        assert!(!config.respond_to_keepalive);
        assert_eq!(config.tls.cert_path, Some(PathBuf::from("/etc/sip/cert.pem")));
        assert!(config.tls.key_path.is_none());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(TransportConfig::from_toml_str("worker_count = 0").is_err());
        assert!(TransportConfig::from_toml_str("worker_count = \"four\"").is_err());
    }

    #[test]
    fn test_serialized_defaults_parse_back() {
        let text = toml::to_string(&TransportConfig::default()).unwrap();
        let config = TransportConfig::from_toml_str(&text).unwrap();
        assert_eq!(config.sweep_interval(), Duration::from_secs(60));
    }
}
