//! P2P Networking module
//!
//! Peer-to-peer networking and header synchronization.
//!
//! # Features
//! - Framed wire protocol over any [`transport::Transport`]
//! - Version handshake, ping keep-alive and timeouts per peer
//! - Capacity limits, inbound eviction and misbehavior scoring
//! - Gossip address book with new/tried tables and feelers
//! - Ban list and discouragement
//! - Anchor peers remembered across restarts
//! - Headers-first sync with a single sync peer
//! - Batched block announcements

pub mod addrman;
pub mod anchors;
pub mod banman;
pub mod message;
pub mod node;
pub mod peer;
pub mod peer_set;
pub mod protocol;
pub mod relay;
pub mod server;
pub mod sync;
pub mod transport;

pub use addrman::{AddrInfo, AddrManError, AddressBook};
pub use banman::{BanEntry, BanError, BanRegistry};
pub use message::{GetHeadersMessage, InventoryVector, Message, MessageError, VersionMessage};
pub use node::{Node, NodeConfig, NodeError, NodeEvent, NodeStatus};
pub use peer::{
    ConnectionType, PeerConnection, PeerError, PeerId, PeerInfo, PeerState, Permissions,
};
pub use peer_set::{AdmissionError, Misbehavior, PeerSet, PeerSetConfig};
pub use protocol::{
    NetworkAddress, ServiceFlags, TimestampedAddress, MAX_HEADERS_SIZE, MIN_PROTOCOL_VERSION,
    PROTOCOL_VERSION,
};
pub use relay::AnnouncementScheduler;
pub use server::{CodecError, MessageCodec, MessageHeader};
pub use sync::ChainSyncEngine;
pub use transport::{MemoryNetwork, MemoryTransport, TcpTransport, Transport};
