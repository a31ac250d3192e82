// Meridian Daemon Library
// Exposes the peer discovery table and the outbound dial scheduler

pub mod discovery;
pub mod p2p;
