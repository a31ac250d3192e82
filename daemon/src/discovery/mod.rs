//! Peer discovery for Meridian nodes.
//!
//! The table keeps a continuously refreshed directory of reachable nodes,
//! classified by role, and feeds it to the dial scheduler. Kademlia-style
//! routing applies to the one role where closest-key lookups pay off; the
//! other roles live in flat recency stores.
//!
//! ## Pieces
//!
//! - **Storage**: one store per role behind a shared capability trait,
//!   distance-bucketed with IP-diversity caps, or flat recency.
//! - **Bonding**: the mutual liveness handshake (PING/PONG both ways)
//!   required before a node is queried or stored, with per-identity
//!   deduplication of concurrent attempts.
//! - **Lookup**: iterative FINDNODE walk with a bounded fan-out.
//! - **Table**: orchestrates the above and runs the refresh and
//!   revalidate maintenance loops.
//!
//! Wire format, packet crypto and socket handling belong to the
//! [`transport::Transport`] collaborator, not to this module.
//!
//! ## Node URL Format
//!
//! ```text
//! merinode://<node_id_hex>@<ip>:<port>[?tcp=<port>&role=<role>]
//! ```
//!
//! Example: `merinode://1a2b3c4d5e6f...@192.168.1.1:7660?role=validator`

pub mod bonding;
pub mod config;
pub mod error;
pub mod lookup;
pub mod netutil;
pub mod node;
pub mod storage;
pub mod table;
pub mod testing;
pub mod transport;
pub mod url;

pub use config::DiscoveryConfig;
pub use error::{DiscoveryError, DiscoveryResult};
pub use node::{Node, NodeId, NodeRole};
pub use storage::NodeStorage;
pub use table::DiscoveryTable;
pub use transport::Transport;
pub use url::MeriNodeUrl;
