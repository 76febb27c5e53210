pub mod config;
pub mod core;
pub mod identity;
pub mod types;

pub(crate) mod merkle;
pub(crate) mod pathfinder;
pub(crate) mod peers;
pub(crate) mod router;
pub(crate) mod traffic;
pub(crate) mod wire;

// Re-export primary public API
pub use crate::config::Config;
pub use crate::core::{new_packet_conn, PacketConnImpl, PathEntry, PeerInfo, TreeEntry};
pub use crate::identity::NodeKey;
pub use crate::types::{Error, LinkConn, PacketConn, Result};
