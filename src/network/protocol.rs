//! Wire protocol constants and shared address types

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

// =============================================================================
// Protocol Constants
// =============================================================================

/// Current protocol version
pub const PROTOCOL_VERSION: i32 = 1;

/// Minimum supported protocol version
pub const MIN_PROTOCOL_VERSION: i32 = 1;

/// Wire header: magic(4) + command(12) + length(4) + checksum(4)
pub const MESSAGE_HEADER_SIZE: usize = 24;
pub const COMMAND_SIZE: usize = 12;

/// Largest object a CompactSize may describe
pub const MAX_SIZE: u64 = 0x0200_0000;

/// Single message payload limit (4 MB)
pub const MAX_PROTOCOL_MESSAGE_LENGTH: usize = 4 * 1000 * 1000;

/// Bytes a peer may have buffered but unprocessed before it is dropped (5 MB)
pub const DEFAULT_RECV_FLOOD_SIZE: usize = 5 * 1000 * 1000;

pub const MAX_LOCATOR_SZ: usize = 101;
pub const MAX_INV_SIZE: usize = 50_000;
pub const MAX_HEADERS_SIZE: usize = 2000;
pub const MAX_ADDR_SIZE: usize = 1000;
/// Address book table capacities
pub const MAX_NEW_ADDRESSES: usize = 16_384;
pub const MAX_TRIED_ADDRESSES: usize = 4_096;
pub const MAX_SUBVERSION_LENGTH: usize = 256;

pub const DEFAULT_MAX_OUTBOUND_CONNECTIONS: usize = 8;
pub const DEFAULT_MAX_INBOUND_CONNECTIONS: usize = 125;
/// Inbound connections accepted from a single IP
pub const MAX_INBOUND_PER_IP: usize = 2;

pub const VERSION_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);
pub const PING_INTERVAL: Duration = Duration::from_secs(2 * 60);
pub const PING_TIMEOUT: Duration = Duration::from_secs(20 * 60);
pub const INACTIVITY_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Inventory type for block hash announcements
pub const MSG_BLOCK: u32 = 2;

/// Message commands
pub mod commands {
    pub const VERSION: &str = "version";
    pub const VERACK: &str = "verack";
    pub const ADDR: &str = "addr";
    pub const GETADDR: &str = "getaddr";
    pub const INV: &str = "inv";
    pub const GETHEADERS: &str = "getheaders";
    pub const HEADERS: &str = "headers";
    pub const PING: &str = "ping";
    pub const PONG: &str = "pong";
}

/// User agent advertised in VERSION
pub fn user_agent() -> String {
    format!("/unicity-p2p:{}/", env!("CARGO_PKG_VERSION"))
}

bitflags! {
    /// Services a node advertises
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
    pub struct ServiceFlags: u64 {
        const NODE_NETWORK = 1 << 0;
    }
}

impl Default for ServiceFlags {
    fn default() -> Self {
        ServiceFlags::empty()
    }
}

// =============================================================================
// Network Address
// =============================================================================

/// Peer address as it appears on the wire: IPv4 addresses are stored
/// v4-mapped in the 16-byte field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetworkAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
}

impl NetworkAddress {
    pub fn new(services: u64, ip: [u8; 16], port: u16) -> Self {
        Self { services, ip, port }
    }

    pub fn from_socket_addr(addr: SocketAddr, services: ServiceFlags) -> Self {
        let ip = match addr.ip() {
            IpAddr::V4(v4) => v4.to_ipv6_mapped().octets(),
            IpAddr::V6(v6) => v6.octets(),
        };
        Self::new(services.bits(), ip, addr.port())
    }

    pub fn from_ipv4(services: ServiceFlags, ip: Ipv4Addr, port: u16) -> Self {
        Self::new(services.bits(), ip.to_ipv6_mapped().octets(), port)
    }

    pub fn ip_addr(&self) -> IpAddr {
        let v6 = Ipv6Addr::from(self.ip);
        match v6.to_ipv4_mapped() {
            Some(v4) => IpAddr::V4(v4),
            None => IpAddr::V6(v6),
        }
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip_addr(), self.port)
    }

    pub fn services(&self) -> ServiceFlags {
        ServiceFlags::from_bits_truncate(self.services)
    }

    pub fn is_ipv4(&self) -> bool {
        matches!(self.ip_addr(), IpAddr::V4(_))
    }

    /// Unspecified address or port zero
    pub fn is_null(&self) -> bool {
        self.port == 0 || self.ip_addr().is_unspecified()
    }

    /// Whether this address is worth gossiping and dialing
    pub fn is_routable(&self) -> bool {
        if self.is_null() {
            return false;
        }
        match self.ip_addr() {
            IpAddr::V4(v4) => {
                !(v4.is_private()
                    || v4.is_loopback()
                    || v4.is_link_local()
                    || v4.is_broadcast()
                    || v4.is_documentation()
                    || v4.octets()[0] == 0)
            }
            IpAddr::V6(v6) => {
                let first = v6.segments()[0];
                !(v6.is_loopback()
                    || (first & 0xfe00) == 0xfc00 // unique local
                    || (first & 0xffc0) == 0xfe80) // link local
            }
        }
    }

    /// Key used by the address book and ban registry
    pub fn key(&self) -> String {
        self.socket_addr().to_string()
    }
}

impl Default for NetworkAddress {
    fn default() -> Self {
        Self::new(0, Ipv4Addr::UNSPECIFIED.to_ipv6_mapped().octets(), 0)
    }
}

impl fmt::Display for NetworkAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.socket_addr())
    }
}

/// Address with the last time it was seen, as carried in ADDR
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimestampedAddress {
    pub timestamp: u32,
    pub address: NetworkAddress,
}

impl TimestampedAddress {
    pub fn new(timestamp: u32, address: NetworkAddress) -> Self {
        Self { timestamp, address }
    }
}
