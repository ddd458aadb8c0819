//! Network, endpoint and connection settings.

use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::packet::MAX_CID_LEN;
use crate::transport_params::TransportParams;

/// Settings for a [`Network`](crate::network::Network).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Name given to the loop thread
    pub thread_name: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            thread_name: "quic-loop".to_string(),
        }
    }
}

/// Settings for one UDP endpoint.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct EndpointConfig {
    /// Length of locally issued connection ids
    pub cid_len: usize,
    /// Receive buffer size; larger datagrams are truncated by the socket
    pub max_datagram_size: usize,
    /// Minimum spacing between datagrams sent from this endpoint; 0 disables pacing
    pub pacing_interval_us: u64,
    /// Defaults for connections created on this endpoint
    pub connection: ConnectionConfig,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            cid_len: 8,
            max_datagram_size: 65527,
            pacing_interval_us: 0,
            connection: ConnectionConfig::default(),
        }
    }
}

impl EndpointConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cid_len == 0 || self.cid_len > MAX_CID_LEN {
            return Err(Error::Config(format!(
                "cid_len must be within 1..={}, got {}",
                MAX_CID_LEN, self.cid_len
            )));
        }
        if self.max_datagram_size < 1200 {
            return Err(Error::Config(format!(
                "max_datagram_size {} is below the QUIC minimum of 1200",
                self.max_datagram_size
            )));
        }
        self.connection.validate()
    }

    pub fn pacing_interval(&self) -> Option<Duration> {
        (self.pacing_interval_us > 0).then(|| Duration::from_micros(self.pacing_interval_us))
    }
}

/// Per-connection limits, advertised to the peer as transport parameters.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ConnectionConfig {
    /// How long a closing connection lingers in Draining
    pub drain_linger_ms: u64,
    pub idle_timeout_ms: u64,
    pub initial_max_data: u64,
    pub initial_max_stream_data: u64,
    pub initial_max_streams_bidi: u64,
    pub initial_max_streams_uni: u64,
    pub max_udp_payload_size: u64,
    pub active_connection_id_limit: u64,
    pub disable_active_migration: bool,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            drain_linger_ms: 300,
            idle_timeout_ms: 30_000,
            initial_max_data: 1 << 24,
            initial_max_stream_data: 1 << 20,
            initial_max_streams_bidi: 100,
            initial_max_streams_uni: 100,
            max_udp_payload_size: 1452,
            active_connection_id_limit: 4,
            disable_active_migration: false,
        }
    }
}

impl ConnectionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.active_connection_id_limit < 2 {
            return Err(Error::Config(
                "active_connection_id_limit must be at least 2".to_string(),
            ));
        }
        if self.max_udp_payload_size < 1200 {
            return Err(Error::Config(format!(
                "max_udp_payload_size {} is below 1200",
                self.max_udp_payload_size
            )));
        }
        Ok(())
    }

    pub fn drain_linger(&self) -> Duration {
        Duration::from_millis(self.drain_linger_ms)
    }

    /// Local transport parameters in the latest layout.
    pub fn transport_params(&self) -> TransportParams {
        TransportParams {
            initial_max_stream_data_bidi_local: self.initial_max_stream_data,
            initial_max_stream_data_bidi_remote: self.initial_max_stream_data,
            initial_max_stream_data_uni: self.initial_max_stream_data,
            initial_max_data: self.initial_max_data,
            initial_max_streams_bidi: self.initial_max_streams_bidi,
            initial_max_streams_uni: self.initial_max_streams_uni,
            max_idle_timeout_ms: self.idle_timeout_ms,
            max_udp_payload_size: self.max_udp_payload_size,
            ack_delay_exponent: 3,
            max_ack_delay_ms: 25,
            active_connection_id_limit: self.active_connection_id_limit,
            disable_active_migration: self.disable_active_migration,
            ..TransportParams::default()
        }
    }
}
