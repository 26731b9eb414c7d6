//! Error types for the shuffle layer.
//!
//! Configuration and init-time problems surface as [`ShuffleError`] so they
//! can be handled (and tested) before any record is in flight. Runtime
//! invariant violations - a malformed inbound frame, a transport failure
//! after a record has been buffered - are fatal and panic instead, because
//! the shuffler cannot recover a record whose fate the backend already owns.

use crate::config::ConfigError;
use crate::sink::SinkError;

/// Error type for shuffle operations
#[derive(Debug, thiserror::Error)]
pub enum ShuffleError {
    /// Invalid or inconsistent configuration
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// No local interface matched the configured subnet prefix
    #[error("no ip addr matching subnet {0}*")]
    NoIpAddr(String),

    /// Port probing exhausted the configured range and the ephemeral fallback
    #[error("no free ports in [{0},{1}]")]
    NoFreePorts(u16, u16),

    /// Interface enumeration or trace-log setup failed
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The write sink rejected a record
    #[error(transparent)]
    Sink(#[from] SinkError),
}

pub type ShuffleResult<T> = Result<T, ShuffleError>;
