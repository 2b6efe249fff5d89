//! Transport configuration.

use std::time::Duration;

use tds_protocol::{DEFAULT_PACKET_SIZE, MIN_PACKET_SIZE, SMP_HEADER_SIZE};

use crate::error::{Result, TransportError};

/// Settings negotiated or chosen when a connection is set up.
///
/// Use the builder methods or [`TransportConfig::from_connection_string()`]
/// to construct instances.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct TransportConfig {
    /// Negotiated maximum physical packet size including the 8-byte header
    /// (default: 4096).
    pub packet_size: u16,

    /// Whether MARS framing is active on this connection.
    pub mars: bool,

    /// How long a blocked operation may go without progress before the
    /// error hook is consulted. `None` waits forever.
    pub query_timeout: Option<Duration>,

    /// Read/write slice used by the network owner so queued writes and
    /// timeouts are noticed while a read is pending (default: 20ms).
    pub poll_interval: Duration,

    /// Maximum number of idle packet buffers kept for reuse (default: 8).
    pub packet_cache_size: usize,

    /// SMP window assumed for both directions when a session opens
    /// (default: 4).
    pub initial_window: u32,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            packet_size: DEFAULT_PACKET_SIZE as u16,
            mars: false,
            query_timeout: None,
            poll_interval: Duration::from_millis(20),
            packet_cache_size: 8,
            initial_window: 4,
        }
    }
}

impl TransportConfig {
    /// Create a configuration with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the negotiated packet size.
    #[must_use]
    pub fn packet_size(mut self, size: u16) -> Self {
        self.packet_size = size;
        self
    }

    /// Enable or disable MARS framing.
    #[must_use]
    pub fn mars(mut self, enabled: bool) -> Self {
        self.mars = enabled;
        self
    }

    /// Set the query timeout.
    #[must_use]
    pub fn query_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.query_timeout = timeout;
        self
    }

    /// Set the network poll interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the packet buffer cache size.
    #[must_use]
    pub fn packet_cache_size(mut self, size: usize) -> Self {
        self.packet_cache_size = size;
        self
    }

    /// Set the initial SMP window.
    #[must_use]
    pub fn initial_window(mut self, window: u32) -> Self {
        self.initial_window = window;
        self
    }

    /// Parse the transport-relevant keys of an ADO.NET style connection string.
    ///
    /// Recognised keys are `Packet Size`, `MultipleActiveResultSets` (or
    /// `MARS`) and `Command Timeout` (or `Query Timeout`, in seconds, `0`
    /// meaning no timeout). Unknown keys are ignored so the same string can
    /// be shared with higher layers.
    pub fn from_connection_string(conn_str: &str) -> Result<Self> {
        let mut config = Self::default();

        for part in conn_str.split(';') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            let (key, value) = part
                .split_once('=')
                .ok_or_else(|| TransportError::Config(format!("invalid key-value: {part}")))?;

            let key = key.trim().to_lowercase();
            let value = value.trim();

            match key.as_str() {
                "packet size" => {
                    config.packet_size = value.parse().map_err(|_| {
                        TransportError::Config(format!("invalid packet size: {value}"))
                    })?;
                }
                "multipleactiveresultsets" | "mars" => {
                    config.mars = parse_bool(value)?;
                }
                "command timeout" | "query timeout" => {
                    let secs: u64 = value.parse().map_err(|_| {
                        TransportError::Config(format!("invalid timeout: {value}"))
                    })?;
                    config.query_timeout = (secs > 0).then(|| Duration::from_secs(secs));
                }
                _ => {
                    tracing::debug!(key = %key, "ignoring connection string key");
                }
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// Check that the settings can be used to drive a connection.
    pub fn validate(&self) -> Result<()> {
        if usize::from(self.packet_size) < MIN_PACKET_SIZE {
            return Err(TransportError::Config(format!(
                "packet size {} is below the minimum of {MIN_PACKET_SIZE}",
                self.packet_size
            )));
        }
        if self.initial_window == 0 {
            return Err(TransportError::Config(
                "initial window must allow at least one frame".to_string(),
            ));
        }
        if self.poll_interval.is_zero() {
            return Err(TransportError::Config(
                "poll interval must be non-zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Bytes in front of the TDS header in every outgoing buffer.
    pub(crate) fn frame_offset(&self) -> usize {
        if self.mars { SMP_HEADER_SIZE } else { 0 }
    }

    /// Capacity of a buffer that holds one full-size packet plus framing.
    pub(crate) fn buffer_capacity(&self) -> usize {
        self.frame_offset() + usize::from(self.packet_size)
    }
}

fn parse_bool(value: &str) -> Result<bool> {
    match value.to_lowercase().as_str() {
        "true" | "yes" | "1" => Ok(true),
        "false" | "no" | "0" => Ok(false),
        _ => Err(TransportError::Config(format!("invalid boolean: {value}"))),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TransportConfig::default();
        assert_eq!(config.packet_size, 4096);
        assert!(!config.mars);
        assert!(config.query_timeout.is_none());
        assert_eq!(config.buffer_capacity(), 4096);
        assert_eq!(config.mars(true).buffer_capacity(), 4096 + 16);
    }

    #[test]
    fn test_connection_string() {
        let config = TransportConfig::from_connection_string(
            "Server=db;Packet Size=8192;MultipleActiveResultSets=True;Command Timeout=30",
        )
        .unwrap();
        assert_eq!(config.packet_size, 8192);
        assert!(config.mars);
        assert_eq!(config.query_timeout, Some(Duration::from_secs(30)));

        let config = TransportConfig::from_connection_string("MARS=no;Query Timeout=0").unwrap();
        assert!(!config.mars);
        assert!(config.query_timeout.is_none());
    }

    #[test]
    fn test_connection_string_errors() {
        assert!(TransportConfig::from_connection_string("Packet Size").is_err());
        assert!(TransportConfig::from_connection_string("Packet Size=lots").is_err());
        assert!(TransportConfig::from_connection_string("MARS=maybe").is_err());
        assert!(matches!(
            TransportConfig::from_connection_string("Packet Size=256"),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn test_validate_poll_interval() {
        let config = TransportConfig::new().poll_interval(Duration::ZERO);
        assert!(config.validate().is_err());
    }
}
