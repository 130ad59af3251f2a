//! Link configuration
//!
//! All tunables of the engine in one serde-friendly structure. Durations are stored
//! as milliseconds so configuration files stay plain JSON.

use crate::checksum::ChecksumKind;
use crate::codec::{FrameCodec, CHUNK_HEADER_LEN, DEFAULT_CHUNK_SIZE};
use crate::opcodes;
use crate::types::{BandError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// ATT header bytes subtracted from the MTU to get the usable write size
pub const ATT_HEADER_LEN: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecConfig {
    pub chunk_size: usize,
    pub checksum: ChecksumKind,
    pub reassembly_timeout_ms: u64,
    /// Opcodes whose payload starts with a u16 packet index
    pub sequenced_opcodes: Vec<u8>,
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            checksum: ChecksumKind::Crc16,
            reassembly_timeout_ms: 1500,
            sequenced_opcodes: opcodes::SEQUENCED.to_vec(),
        }
    }
}

impl CodecConfig {
    pub fn build(&self) -> FrameCodec {
        FrameCodec::with_settings(
            self.chunk_size,
            self.checksum.build(),
            self.sequenced_opcodes.iter().copied(),
        )
        .with_reassembly_timeout(Duration::from_millis(self.reassembly_timeout_ms))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub default_timeout_ms: u64,
    /// How long a late response to a timed-out request is recognised and dropped
    pub stale_window_ms: u64,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: 3000,
            stale_window_ms: 5000,
        }
    }
}

impl ChannelConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }

    pub fn stale_window(&self) -> Duration {
        Duration::from_millis(self.stale_window_ms)
    }
}

/// Whether reconnection gives up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReconnectMode {
    /// Fail after `max_attempts` attempts or once `deadline_ms` has elapsed
    #[default]
    Bounded,
    /// Retry until an explicit disconnect
    Unbounded,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub mode: ReconnectMode,
    pub max_attempts: u32,
    pub deadline_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    pub connect_timeout_ms: u64,
    /// Silence on the notify characteristic longer than this marks the link unhealthy
    pub rx_timeout_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            mode: ReconnectMode::Bounded,
            max_attempts: 5,
            deadline_ms: 60_000,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            backoff_multiplier: 2.0,
            connect_timeout_ms: 10_000,
            rx_timeout_ms: 120_000,
        }
    }
}

impl ReconnectConfig {
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    pub fn deadline(&self) -> Duration {
        Duration::from_millis(self.deadline_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn rx_timeout(&self) -> Duration {
        Duration::from_millis(self.rx_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Extra attempts per chunk after a notify timeout
    pub chunk_retries: u32,
    pub init_timeout_ms: u64,
    pub chunk_timeout_ms: u64,
    pub validate_timeout_ms: u64,
    /// Chunks per acknowledgement for targets using cumulative acks
    pub window: usize,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_retries: 2,
            init_timeout_ms: 5000,
            chunk_timeout_ms: 5000,
            validate_timeout_ms: 10_000,
            window: 4,
        }
    }
}

impl TransferConfig {
    pub fn init_timeout(&self) -> Duration {
        Duration::from_millis(self.init_timeout_ms)
    }

    pub fn chunk_timeout(&self) -> Duration {
        Duration::from_millis(self.chunk_timeout_ms)
    }

    pub fn validate_timeout(&self) -> Duration {
        Duration::from_millis(self.validate_timeout_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub start_timeout_ms: u64,
    pub stop_timeout_ms: u64,
    pub wear_calibration_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            start_timeout_ms: 3000,
            stop_timeout_ms: 2000,
            wear_calibration_timeout_ms: 120_000,
        }
    }
}

impl SessionConfig {
    pub fn start_timeout(&self) -> Duration {
        Duration::from_millis(self.start_timeout_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn wear_calibration_timeout(&self) -> Duration {
        Duration::from_millis(self.wear_calibration_timeout_ms)
    }
}

/// Top-level configuration for one [`crate::link::BandLink`]
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub codec: CodecConfig,
    pub channel: ChannelConfig,
    pub reconnect: ReconnectConfig,
    pub transfer: TransferConfig,
    pub sessions: SessionConfig,
}

impl LinkConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: LinkConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_json_str(&contents)
    }

    /// Chunk size to use for a given ATT MTU
    pub fn chunk_size_for_mtu(mtu: usize) -> usize {
        mtu.saturating_sub(ATT_HEADER_LEN)
    }

    pub fn validate(&self) -> Result<()> {
        if self.codec.chunk_size <= CHUNK_HEADER_LEN {
            return Err(BandError::Config(format!(
                "codec.chunk_size must be larger than {}",
                CHUNK_HEADER_LEN
            )));
        }
        let timeouts = [
            ("channel.default_timeout_ms", self.channel.default_timeout_ms),
            ("reconnect.connect_timeout_ms", self.reconnect.connect_timeout_ms),
            ("transfer.init_timeout_ms", self.transfer.init_timeout_ms),
            ("transfer.chunk_timeout_ms", self.transfer.chunk_timeout_ms),
            ("transfer.validate_timeout_ms", self.transfer.validate_timeout_ms),
            ("sessions.start_timeout_ms", self.sessions.start_timeout_ms),
            ("sessions.stop_timeout_ms", self.sessions.stop_timeout_ms),
            (
                "sessions.wear_calibration_timeout_ms",
                self.sessions.wear_calibration_timeout_ms,
            ),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(BandError::Config(format!("{} must be non-zero", name)));
            }
        }
        if self.reconnect.backoff_multiplier < 1.0 {
            return Err(BandError::Config(
                "reconnect.backoff_multiplier must be at least 1.0".to_string(),
            ));
        }
        if self.transfer.window == 0 {
            return Err(BandError::Config(
                "transfer.window must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = LinkConfig::default();
        config.validate().unwrap();
        assert_eq!(config.codec.chunk_size, 20);
        assert_eq!(
            config.sessions.wear_calibration_timeout(),
            Duration::from_secs(120)
        );
        assert_eq!(config.reconnect.mode, ReconnectMode::Bounded);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config = LinkConfig::from_json_str(
            r#"{ "codec": { "chunk_size": 244, "checksum": "sum8" },
                 "reconnect": { "mode": "unbounded" } }"#,
        )
        .unwrap();
        assert_eq!(config.codec.chunk_size, 244);
        assert_eq!(config.codec.checksum, ChecksumKind::Sum8);
        assert_eq!(config.reconnect.mode, ReconnectMode::Unbounded);
        assert_eq!(config.reconnect.max_attempts, 5);
        assert_eq!(config.channel.default_timeout_ms, 3000);
    }

    #[test]
    fn test_rejects_invalid_values() {
        assert!(matches!(
            LinkConfig::from_json_str(r#"{ "codec": { "chunk_size": 3 } }"#),
            Err(BandError::Config(_))
        ));
        assert!(matches!(
            LinkConfig::from_json_str(r#"{ "channel": { "default_timeout_ms": 0 } }"#),
            Err(BandError::Config(_))
        ));
        assert!(matches!(
            LinkConfig::from_json_str(r#"{ "reconnect": { "backoff_multiplier": 0.5 } }"#),
            Err(BandError::Config(_))
        ));
        assert!(matches!(
            LinkConfig::from_json_str("not json"),
            Err(BandError::Json(_))
        ));
    }

    #[test]
    fn test_chunk_size_for_mtu() {
        assert_eq!(LinkConfig::chunk_size_for_mtu(23), 20);
        assert_eq!(LinkConfig::chunk_size_for_mtu(247), 244);
    }

    #[test]
    fn test_serialize_round_trip_preserves_values() {
        let mut config = LinkConfig::default();
        config.transfer.chunk_retries = 7;
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(LinkConfig::from_json_str(&json).unwrap(), config);
    }
}
