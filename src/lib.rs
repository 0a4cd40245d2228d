//! Unicity P2P: peer-to-peer networking for a proof-of-work node
//!
//! This crate provides the networking core of a headers-first node:
//! - Wire protocol codec with checksums and size limits
//! - Per-peer handshake state machine with ping and timeouts
//! - Peer admission, inbound eviction and misbehavior scoring
//! - Address book (new/tried tables) and feeler connections
//! - Ban list with persistence and time-limited discouragement
//! - Header sync, fork choice, reorgs and block invalidation
//! - Batched block announcements
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use unicity_p2p::network::{Node, NodeConfig, TcpTransport};
//! use unicity_p2p::util::SystemClock;
//!
//! # async fn run() -> Result<(), unicity_p2p::network::NodeError> {
//! let node = Node::new(NodeConfig::regtest(), Arc::new(TcpTransport), SystemClock::shared())?;
//! let hashes = node.generate_blocks(5, [0u8; 20]).await?;
//! println!("Tip {} at height {}", hashes[4], node.height().await);
//! node.start().await?;
//! # Ok(())
//! # }
//! ```

pub mod core;
pub mod crypto;
pub mod network;
pub mod util;

// Re-export commonly used types
pub use core::{BlockHash, BlockHeader, ChainState, ChainType, NetworkParams};
pub use network::{Node, NodeConfig, NodeError, NodeStatus};
pub use util::{Clock, MockClock, SharedClock, SystemClock};
