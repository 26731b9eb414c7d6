//! Shuffle layer configuration
//!
//! Configuration is primarily environment-driven (the preload layer above
//! us cannot take command line arguments), with TOML round-trip support for
//! driver programs that prefer a file. All knobs have documented defaults.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;

use crate::constants::{self, is_env_truthy, maybe_env};
use crate::placement::PlacementProtocol;
use crate::wire::FrameSpec;

/// Fallback values for knobs the environment leaves unset
pub mod defaults {
    /// Default identifier length in bytes
    pub const FNAME_LEN: u8 = 8;

    /// Default payload length in bytes
    ///
    /// 48 bytes matches a typical particle record (position, momentum,
    /// and a handful of scalar fields) after the identifier is stripped.
    pub const DATA_LEN: u8 = 48;

    /// Default per-record padding
    pub const EXTRA_LEN: u8 = 0;

    /// Default receiver radix (0 = every rank is a receiver)
    pub const RECV_RADIX: u32 = 0;

    /// Default grace period before teardown reductions, in seconds
    pub const FINALIZE_PAUSE_SECS: u64 = 0;
}

/// Runtime configuration for one shuffle instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShuffleConfig {
    /// Identifier length in bytes, 1..=254
    pub fname_len: u8,

    /// Payload length in bytes
    ///
    /// Constrained by `fname_len + data_len + extra_len + 1 <= 255`.
    pub data_len: u8,

    /// Zero padding reserved per record for opaque per-rank metadata
    pub extra_len: u8,

    /// Transport protocol string for the RPC fabric
    pub proto: String,

    /// Required prefix of the interface IPv4 address
    pub subnet: String,

    /// Inclusive port search range
    pub min_port: u16,
    pub max_port: u16,

    /// Bits cleared in the receiver mask, 0..=8
    pub recv_radix: u32,

    /// Placement virtual-node factor
    pub virtual_factor: usize,

    /// Placement protocol
    pub placement_protocol: PlacementProtocol,

    /// Bypass the placement engine in favor of plain modulo hashing
    /// (diagnostic runs only)
    pub bypass_placement: bool,

    /// Disable the local-bypass fast path; local records traverse the RPC
    /// path and hit the sink's foreign-write entry (diagnostic)
    pub force_rpc: bool,

    /// Select the scalable multi-hop backend instead of the direct one
    pub use_multihop: bool,

    /// Direct backend only: block for every reply instead of flushing the
    /// queue and waiting for callbacks at epoch end
    pub force_sync: bool,

    /// Bound on the backend outbound queue, in records
    pub queue_depth: usize,

    /// World barrier right before the soft epoch flush
    pub pre_flush_barrier: bool,

    /// World barrier after the soft epoch flush; required when the sink
    /// must see all epoch-k records before any epoch-k+1 record
    pub epoch_barrier: bool,

    /// World barrier before records of the new epoch are admitted
    pub post_start_barrier: bool,

    /// Seconds to sleep before teardown reductions
    pub finalize_pause_secs: u64,

    /// Per-record SEND/RECV/LO trace lines are appended here when set
    /// (testing only)
    #[serde(default)]
    pub test_log: Option<PathBuf>,
}

impl Default for ShuffleConfig {
    fn default() -> Self {
        Self {
            fname_len: defaults::FNAME_LEN,
            data_len: defaults::DATA_LEN,
            extra_len: defaults::EXTRA_LEN,
            proto: constants::DEFAULT_PROTO.to_string(),
            subnet: constants::DEFAULT_SUBNET.to_string(),
            min_port: constants::DEFAULT_MIN_PORT,
            max_port: constants::DEFAULT_MAX_PORT,
            recv_radix: defaults::RECV_RADIX,
            virtual_factor: constants::DEFAULT_VIRTUAL_FACTOR,
            placement_protocol: PlacementProtocol::Ring,
            bypass_placement: false,
            force_rpc: false,
            use_multihop: false,
            force_sync: false,
            queue_depth: constants::DEFAULT_QUEUE_DEPTH,
            pre_flush_barrier: false,
            epoch_barrier: true,
            post_start_barrier: false,
            finalize_pause_secs: defaults::FINALIZE_PAUSE_SECS,
            test_log: None,
        }
    }
}

impl ShuffleConfig {
    /// Build a configuration from `SHUFFLE_*` environment variables,
    /// starting from the defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Some(v) = maybe_env("SHUFFLE_Mercury_proto") {
            cfg.proto = v;
        }
        if let Some(v) = maybe_env("SHUFFLE_Subnet") {
            cfg.subnet = v;
        }
        if let Some(v) = maybe_env("SHUFFLE_Min_port") {
            cfg.min_port = parse_env("SHUFFLE_Min_port", &v)?;
        }
        if let Some(v) = maybe_env("SHUFFLE_Max_port") {
            cfg.max_port = parse_env("SHUFFLE_Max_port", &v)?;
        }
        if let Some(v) = maybe_env("SHUFFLE_Recv_radix") {
            // out-of-range radix values are clamped, not rejected
            let radix: u32 = parse_env("SHUFFLE_Recv_radix", &v)?;
            cfg.recv_radix = radix.min(constants::MAX_RECV_RADIX);
        }
        if let Some(v) = maybe_env("SHUFFLE_Virtual_factor") {
            cfg.virtual_factor = parse_env("SHUFFLE_Virtual_factor", &v)?;
        }
        if let Some(v) = maybe_env("SHUFFLE_Placement_protocol") {
            cfg.placement_protocol = PlacementProtocol::from_str(&v)
                .map_err(|_| ConfigError::UnknownPlacementProtocol(v))?;
        }
        if let Some(v) = maybe_env("SHUFFLE_Finalize_pause") {
            cfg.finalize_pause_secs = parse_env::<i64>("SHUFFLE_Finalize_pause", &v)?.max(0) as u64;
        }
        if let Some(v) = maybe_env("SHUFFLE_Queue_depth") {
            cfg.queue_depth = parse_env("SHUFFLE_Queue_depth", &v)?;
        }
        if let Some(v) = maybe_env("SHUFFLE_Test_log") {
            cfg.test_log = Some(PathBuf::from(v));
        }

        cfg.bypass_placement = is_env_truthy("SHUFFLE_Bypass_placement");
        cfg.force_rpc = is_env_truthy("SHUFFLE_Force_rpc");
        cfg.use_multihop = is_env_truthy("SHUFFLE_Use_multihop");
        cfg.force_sync = is_env_truthy("SHUFFLE_Force_sync");
        cfg.pre_flush_barrier = is_env_truthy("SHUFFLE_Pre_flush_barrier");
        cfg.post_start_barrier = is_env_truthy("SHUFFLE_Post_start_barrier");
        if is_env_truthy("SHUFFLE_No_epoch_barrier") {
            cfg.epoch_barrier = false;
        }

        Ok(cfg)
    }

    /// Set the per-record shape established by the simulation.
    pub fn with_record_shape(mut self, fname_len: u8, data_len: u8, extra_len: u8) -> Self {
        self.fname_len = fname_len;
        self.data_len = data_len;
        self.extra_len = extra_len;
        self
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ReadError(format!("Failed to read config file: {}", e)))?;

        let config: ShuffleConfig = toml::from_str(&contents)
            .map_err(|e| ConfigError::ParseError(format!("Failed to parse config: {}", e)))?;

        config.validate()?;

        Ok(config)
    }

    /// Validate the configuration and derive the frame shape.
    pub fn validate(&self) -> Result<FrameSpec, ConfigError> {
        if self.fname_len == 0 {
            return Err(ConfigError::ValidationError(
                "identifier length cannot be zero".to_string(),
            ));
        }

        let total =
            self.fname_len as usize + 1 + self.data_len as usize + self.extra_len as usize;
        if total > constants::MAX_FRAME_LEN {
            return Err(ConfigError::FrameTooLarge {
                total,
                max: constants::MAX_FRAME_LEN,
            });
        }

        if self.max_port < self.min_port {
            return Err(ConfigError::ValidationError("bad min-max port".to_string()));
        }
        if self.min_port < 1 {
            return Err(ConfigError::ValidationError("bad min port".to_string()));
        }

        if self.recv_radix > constants::MAX_RECV_RADIX {
            return Err(ConfigError::ValidationError(format!(
                "receiver radix {} exceeds {}",
                self.recv_radix,
                constants::MAX_RECV_RADIX
            )));
        }

        if self.queue_depth == 0 {
            return Err(ConfigError::ValidationError(
                "queue depth cannot be zero".to_string(),
            ));
        }

        if self.subnet.is_empty() {
            return Err(ConfigError::ValidationError(
                "subnet prefix cannot be empty".to_string(),
            ));
        }

        Ok(FrameSpec {
            fname_len: self.fname_len,
            data_len: self.data_len,
            extra_len: self.extra_len,
        })
    }

    /// Receiver mask: the low `recv_radix` bits cleared.
    pub fn receiver_mask(&self) -> u32 {
        !0u32 << self.recv_radix
    }

    /// Senders per receiver: `2^recv_radix`, in 1..=256.
    pub fn receiver_rate(&self) -> u32 {
        1u32 << self.recv_radix
    }
}

fn parse_env<T: FromStr>(key: &'static str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::BadValue {
        key,
        value: value.to_string(),
    })
}

/// Configuration error types
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Bad value for {key}: {value:?}")]
    BadValue { key: &'static str, value: String },

    #[error("Unknown placement protocol: {0}")]
    UnknownPlacementProtocol(String),

    #[error("Record frame is {total} bytes, limit is {max}")]
    FrameTooLarge { total: usize, max: usize },

    #[error("Configuration validation error: {0}")]
    ValidationError(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let cfg = ShuffleConfig::default();
        let frame = cfg.validate().unwrap();
        assert_eq!(frame.frame_len(), 8 + 1 + 48);
        assert_eq!(cfg.receiver_mask(), !0u32);
        assert_eq!(cfg.receiver_rate(), 1);
    }

    #[test]
    fn test_oversized_frame_rejected() {
        // 100 + 150 + 10 + 1 = 261 > 255
        let cfg = ShuffleConfig::default().with_record_shape(100, 150, 10);
        match cfg.validate() {
            Err(ConfigError::FrameTooLarge { total, max }) => {
                assert_eq!(total, 261);
                assert_eq!(max, 255);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_zero_id_length_rejected() {
        let cfg = ShuffleConfig::default().with_record_shape(0, 10, 0);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_port_range_rejected() {
        let mut cfg = ShuffleConfig::default();
        cfg.min_port = 6000;
        cfg.max_port = 5000;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_receiver_mask_math() {
        let mut cfg = ShuffleConfig::default();
        cfg.recv_radix = 2;
        assert_eq!(cfg.receiver_rate(), 4);
        assert_eq!(cfg.receiver_mask() & 0b11, 0);
        assert_eq!(5 & cfg.receiver_mask(), 4);
    }

    #[test]
    fn test_config_toml_round_trip() {
        let cfg = ShuffleConfig::default();
        let toml_str = toml::to_string(&cfg).unwrap();
        let back: ShuffleConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(cfg.fname_len, back.fname_len);
        assert_eq!(cfg.placement_protocol, back.placement_protocol);
        assert_eq!(cfg.queue_depth, back.queue_depth);
    }
}
