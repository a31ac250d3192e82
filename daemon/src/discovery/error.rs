//! Error types for the discovery layer.

use std::io::Error as IoError;
use std::net::{AddrParseError, IpAddr};
use thiserror::Error;

use super::node::NodeId;

/// Error type for discovery operations.
#[derive(Error, Debug)]
pub enum DiscoveryError {
    /// I/O error during network operations.
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    /// Address parsing error.
    #[error("Invalid address: {0}")]
    InvalidAddress(#[from] AddrParseError),

    /// Invalid URL format.
    #[error("Invalid merinode URL: {0}")]
    InvalidUrl(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Address rejected by the network restriction list.
    #[error("Address {0} is rejected by the network restriction list")]
    RestrictedAddress(IpAddr),

    /// Self-referential operation (e.g., bonding with our own identity).
    #[error("Cannot perform operation on self")]
    SelfOperation,

    /// Inbound request received before the table completed its first refresh.
    #[error("Discovery table is not initialized yet")]
    TableNotInitialized,

    /// The table or scheduler has been closed.
    #[error("Discovery table is closed")]
    TableClosed,

    /// The mutual liveness handshake with a node failed.
    #[error("Bonding with node {0} failed")]
    BondFailed(NodeId),

    /// A network-facing wait did not complete in time.
    #[error("Timed out waiting for {0}")]
    Timeout(&'static str),

    /// Channel send error.
    #[error("Channel send error: {0}")]
    ChannelError(String),
}

/// Result type alias for discovery operations.
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;
