//! Peer-to-peer connection management.
//!
//! Only the outbound side lives here: the dial scheduler consumes the
//! discovery table and keeps per-role connection counts at their targets.
//! Session establishment itself belongs to the [`dial::Connector`]
//! collaborator.

pub mod dial;

pub use dial::{Connector, DialConfig, DialScheduler};
