//! Network message types for P2P communication
//!
//! Every command the node understands is one variant of [`Message`]. Payloads
//! use Bitcoin-style little-endian encoding with CompactSize length prefixes.
//! Fixed-shape payloads (VERACK, GETADDR) must be exactly empty; PING/PONG
//! only read the leading nonce and ignore anything after it.

use crate::core::block::{BlockError, BlockHash, BlockHeader, BLOCK_HEADER_SIZE};
use crate::network::protocol::{
    commands, NetworkAddress, TimestampedAddress, MAX_ADDR_SIZE, MAX_HEADERS_SIZE, MAX_INV_SIZE,
    MAX_LOCATOR_SZ, MAX_SIZE, MAX_SUBVERSION_LENGTH, MSG_BLOCK, PROTOCOL_VERSION,
};
use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

/// Payload decoding errors
#[derive(Error, Debug, PartialEq)]
pub enum MessageError {
    #[error("Truncated payload: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },
    #[error("CompactSize value {0} exceeds maximum")]
    SizeTooLarge(u64),
    #[error("Too many {what}: {count} (max {max})")]
    TooManyItems {
        what: &'static str,
        count: u64,
        max: usize,
    },
    #[error("User agent too long: {0} bytes")]
    UserAgentTooLong(usize),
    #[error("Unexpected {len}-byte payload for {command}")]
    UnexpectedPayload { command: &'static str, len: usize },
    #[error("Invalid header: {0}")]
    InvalidHeader(#[from] BlockError),
}

// =============================================================================
// Payload types
// =============================================================================

/// VERSION payload
#[derive(Debug, Clone, PartialEq)]
pub struct VersionMessage {
    pub version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv: NetworkAddress,
    pub addr_from: NetworkAddress,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    pub fn new(services: u64, timestamp: i64, nonce: u64, start_height: i32) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            services,
            timestamp,
            addr_recv: NetworkAddress::default(),
            addr_from: NetworkAddress::default(),
            nonce,
            user_agent: crate::network::protocol::user_agent(),
            start_height,
            relay: true,
        }
    }
}

/// Inventory entry announcing an object by hash
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InventoryVector {
    pub inv_type: u32,
    pub hash: BlockHash,
}

impl InventoryVector {
    pub fn block(hash: BlockHash) -> Self {
        Self {
            inv_type: MSG_BLOCK,
            hash,
        }
    }

    pub fn is_block(&self) -> bool {
        self.inv_type == MSG_BLOCK
    }
}

/// GETHEADERS payload
#[derive(Debug, Clone, PartialEq)]
pub struct GetHeadersMessage {
    pub version: u32,
    pub locator: Vec<BlockHash>,
    /// Zero means "as many as allowed"
    pub hash_stop: BlockHash,
}

/// Network message types
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// Handshake opener
    Version(VersionMessage),
    /// Handshake acknowledgement
    Verack,
    /// Keep-alive ping
    Ping(u64),
    /// Keep-alive pong response
    Pong(u64),
    /// Request known addresses
    GetAddr,
    /// Gossiped addresses
    Addr(Vec<TimestampedAddress>),
    /// Block announcements
    Inv(Vec<InventoryVector>),
    /// Request headers after a locator
    GetHeaders(GetHeadersMessage),
    /// Header batch
    Headers(Vec<BlockHeader>),
    /// Any command this node does not implement
    Unknown { command: String, payload_len: usize },
}

impl Message {
    /// Wire command string
    pub fn command(&self) -> &str {
        match self {
            Message::Version(_) => commands::VERSION,
            Message::Verack => commands::VERACK,
            Message::Ping(_) => commands::PING,
            Message::Pong(_) => commands::PONG,
            Message::GetAddr => commands::GETADDR,
            Message::Addr(_) => commands::ADDR,
            Message::Inv(_) => commands::INV,
            Message::GetHeaders(_) => commands::GETHEADERS,
            Message::Headers(_) => commands::HEADERS,
            Message::Unknown { command, .. } => command,
        }
    }

    /// Serialize the payload (without wire header)
    pub fn encode_payload(&self) -> BytesMut {
        let mut buf = BytesMut::new();
        match self {
            Message::Version(v) => {
                buf.put_i32_le(v.version);
                buf.put_u64_le(v.services);
                buf.put_i64_le(v.timestamp);
                put_network_address(&mut buf, &v.addr_recv);
                put_network_address(&mut buf, &v.addr_from);
                buf.put_u64_le(v.nonce);
                put_compact_size(&mut buf, v.user_agent.len() as u64);
                buf.put_slice(v.user_agent.as_bytes());
                buf.put_i32_le(v.start_height);
                buf.put_u8(v.relay as u8);
            }
            Message::Verack | Message::GetAddr | Message::Unknown { .. } => {}
            Message::Ping(nonce) | Message::Pong(nonce) => buf.put_u64_le(*nonce),
            Message::Addr(addrs) => {
                put_compact_size(&mut buf, addrs.len() as u64);
                for entry in addrs {
                    buf.put_u32_le(entry.timestamp);
                    put_network_address(&mut buf, &entry.address);
                }
            }
            Message::Inv(items) => {
                put_compact_size(&mut buf, items.len() as u64);
                for item in items {
                    buf.put_u32_le(item.inv_type);
                    buf.put_slice(item.hash.as_bytes());
                }
            }
            Message::GetHeaders(req) => {
                buf.put_u32_le(req.version);
                put_compact_size(&mut buf, req.locator.len() as u64);
                for hash in &req.locator {
                    buf.put_slice(hash.as_bytes());
                }
                buf.put_slice(req.hash_stop.as_bytes());
            }
            Message::Headers(headers) => {
                buf.reserve(9 + headers.len() * BLOCK_HEADER_SIZE);
                put_compact_size(&mut buf, headers.len() as u64);
                for header in headers {
                    buf.put_slice(&header.serialize());
                }
            }
        }
        buf
    }

    /// Decode a payload for `command`
    pub fn decode(command: &str, payload: &[u8]) -> Result<Message, MessageError> {
        let mut r = PayloadReader::new(payload);
        let msg = match command {
            commands::VERSION => Message::Version(decode_version(&mut r)?),
            commands::VERACK => {
                expect_empty(commands::VERACK, payload)?;
                Message::Verack
            }
            commands::GETADDR => {
                expect_empty(commands::GETADDR, payload)?;
                Message::GetAddr
            }
            commands::PING => Message::Ping(r.u64()?),
            commands::PONG => Message::Pong(r.u64()?),
            commands::ADDR => {
                let count = r.count("addresses", MAX_ADDR_SIZE)?;
                let mut addrs = Vec::with_capacity(count);
                for _ in 0..count {
                    let timestamp = r.u32()?;
                    let address = r.network_address()?;
                    addrs.push(TimestampedAddress::new(timestamp, address));
                }
                Message::Addr(addrs)
            }
            commands::INV => {
                let count = r.count("inventory items", MAX_INV_SIZE)?;
                let mut items = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    let inv_type = r.u32()?;
                    let hash = r.hash()?;
                    items.push(InventoryVector { inv_type, hash });
                }
                Message::Inv(items)
            }
            commands::GETHEADERS => {
                let version = r.u32()?;
                let count = r.count("locator hashes", MAX_LOCATOR_SZ)?;
                let mut locator = Vec::with_capacity(count);
                for _ in 0..count {
                    locator.push(r.hash()?);
                }
                let hash_stop = r.hash()?;
                Message::GetHeaders(GetHeadersMessage {
                    version,
                    locator,
                    hash_stop,
                })
            }
            commands::HEADERS => {
                let count = r.count("headers", MAX_HEADERS_SIZE)?;
                let mut headers = Vec::with_capacity(count);
                for _ in 0..count {
                    let bytes = r.bytes(BLOCK_HEADER_SIZE)?;
                    headers.push(BlockHeader::deserialize(bytes)?);
                }
                Message::Headers(headers)
            }
            other => Message::Unknown {
                command: other.to_string(),
                payload_len: payload.len(),
            },
        };
        Ok(msg)
    }
}

fn decode_version(r: &mut PayloadReader<'_>) -> Result<VersionMessage, MessageError> {
    let version = r.i32()?;
    let services = r.u64()?;
    let timestamp = r.i64()?;
    let addr_recv = r.network_address()?;
    let addr_from = r.network_address()?;
    let nonce = r.u64()?;

    let ua_len = r.compact_size()? as usize;
    if ua_len > MAX_SUBVERSION_LENGTH {
        return Err(MessageError::UserAgentTooLong(ua_len));
    }
    let user_agent = String::from_utf8_lossy(r.bytes(ua_len)?).into_owned();
    let start_height = r.i32()?;
    // Older peers omit the relay flag
    let relay = if r.remaining() > 0 { r.u8()? != 0 } else { true };

    Ok(VersionMessage {
        version,
        services,
        timestamp,
        addr_recv,
        addr_from,
        nonce,
        user_agent,
        start_height,
        relay,
    })
}

fn expect_empty(command: &'static str, payload: &[u8]) -> Result<(), MessageError> {
    if payload.is_empty() {
        Ok(())
    } else {
        Err(MessageError::UnexpectedPayload {
            command,
            len: payload.len(),
        })
    }
}

// =============================================================================
// Primitive encoding
// =============================================================================

/// Write a CompactSize length prefix
pub fn put_compact_size(buf: &mut BytesMut, value: u64) {
    if value < 0xfd {
        buf.put_u8(value as u8);
    } else if value <= 0xffff {
        buf.put_u8(0xfd);
        buf.put_u16_le(value as u16);
    } else if value <= 0xffff_ffff {
        buf.put_u8(0xfe);
        buf.put_u32_le(value as u32);
    } else {
        buf.put_u8(0xff);
        buf.put_u64_le(value);
    }
}

fn put_network_address(buf: &mut BytesMut, addr: &NetworkAddress) {
    buf.put_u64_le(addr.services);
    buf.put_slice(&addr.ip);
    // Port is big-endian on the wire
    buf.put_u16(addr.port);
}

/// Bounds-checked cursor over a payload
struct PayloadReader<'a> {
    buf: &'a [u8],
}

impl<'a> PayloadReader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn remaining(&self) -> usize {
        self.buf.remaining()
    }

    fn need(&self, n: usize) -> Result<(), MessageError> {
        if self.buf.remaining() < n {
            return Err(MessageError::Truncated {
                needed: n,
                remaining: self.buf.remaining(),
            });
        }
        Ok(())
    }

    fn u8(&mut self) -> Result<u8, MessageError> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self) -> Result<u32, MessageError> {
        self.need(4)?;
        Ok(self.buf.get_u32_le())
    }

    fn i32(&mut self) -> Result<i32, MessageError> {
        self.need(4)?;
        Ok(self.buf.get_i32_le())
    }

    fn u64(&mut self) -> Result<u64, MessageError> {
        self.need(8)?;
        Ok(self.buf.get_u64_le())
    }

    fn i64(&mut self) -> Result<i64, MessageError> {
        self.need(8)?;
        Ok(self.buf.get_i64_le())
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], MessageError> {
        self.need(n)?;
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Ok(head)
    }

    fn hash(&mut self) -> Result<BlockHash, MessageError> {
        let mut out = [0u8; 32];
        out.copy_from_slice(self.bytes(32)?);
        Ok(BlockHash(out))
    }

    fn compact_size(&mut self) -> Result<u64, MessageError> {
        let value = match self.u8()? {
            0xfd => {
                self.need(2)?;
                self.buf.get_u16_le() as u64
            }
            0xfe => self.u32()? as u64,
            0xff => self.u64()?,
            small => small as u64,
        };
        if value > MAX_SIZE {
            return Err(MessageError::SizeTooLarge(value));
        }
        Ok(value)
    }

    /// Element count bounded by a per-message maximum
    fn count(&mut self, what: &'static str, max: usize) -> Result<usize, MessageError> {
        let count = self.compact_size()?;
        if count > max as u64 {
            return Err(MessageError::TooManyItems { what, count, max });
        }
        Ok(count as usize)
    }

    fn network_address(&mut self) -> Result<NetworkAddress, MessageError> {
        let services = self.u64()?;
        let mut ip = [0u8; 16];
        ip.copy_from_slice(self.bytes(16)?);
        self.need(2)?;
        let port = self.buf.get_u16();
        Ok(NetworkAddress::new(services, ip, port))
    }
}
