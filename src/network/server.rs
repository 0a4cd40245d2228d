//! Message framing and per-connection I/O
//!
//! [`MessageCodec`] turns a byte stream into [`Frame`]s and back. The
//! connection task owns one socket: it forwards decoded frames to the node
//! and drains the peer's outbound mailbox. Dropping the mailbox sender
//! closes the connection once every queued message has been written.

use crate::crypto::{checksum, CHECKSUM_SIZE};
use crate::network::message::{Message, MessageError};
use crate::network::node::NodeEvent;
use crate::network::peer::PeerId;
use crate::network::protocol::{
    COMMAND_SIZE, DEFAULT_RECV_FLOOD_SIZE, MAX_PROTOCOL_MESSAGE_LENGTH, MESSAGE_HEADER_SIZE,
};
use crate::network::transport::BoxedStream;
use bytes::{Buf, BufMut, BytesMut};
use futures::sink::SinkExt;
use futures::stream::StreamExt;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::codec::{Decoder, Encoder, Framed};

/// Framing errors; all of them end the connection
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Bad magic: {0:#010x}")]
    BadMagic(u32),
    #[error("Oversized message: {0} bytes")]
    Oversized(u32),
    #[error("Checksum mismatch for {0}")]
    ChecksumMismatch(String),
    #[error("Receive buffer flooded: {0} bytes")]
    Flood(usize),
    #[error("Malformed {command} payload: {source}")]
    Payload {
        command: String,
        #[source]
        source: MessageError,
    },
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

// =============================================================================
// Wire header
// =============================================================================

/// The 24-byte header in front of every payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageHeader {
    pub magic: u32,
    pub command: String,
    pub length: u32,
    pub checksum: [u8; CHECKSUM_SIZE],
}

impl MessageHeader {
    /// Header describing `payload` under `command`
    pub fn for_payload(magic: u32, command: &str, payload: &[u8]) -> Self {
        Self {
            magic,
            command: command.to_string(),
            length: payload.len() as u32,
            checksum: checksum(payload),
        }
    }

    pub fn write_to(&self, dst: &mut BytesMut) {
        let mut command = [0u8; COMMAND_SIZE];
        let name = self.command.as_bytes();
        let n = name.len().min(COMMAND_SIZE);
        command[..n].copy_from_slice(&name[..n]);

        dst.put_u32_le(self.magic);
        dst.put_slice(&command);
        dst.put_u32_le(self.length);
        dst.put_slice(&self.checksum);
    }
}

/// Result of looking at the front of a receive buffer
#[derive(Debug)]
pub enum HeaderParse {
    /// A complete, acceptable header
    Header(MessageHeader),
    /// Fewer than 24 bytes buffered so far
    Incomplete,
    /// Wrong network or oversized length; the connection must be dropped
    Invalid(CodecError),
}

/// Parse a wire header from the start of `buf` without consuming it
pub fn parse_header(buf: &[u8], magic: u32) -> HeaderParse {
    if buf.len() < MESSAGE_HEADER_SIZE {
        return HeaderParse::Incomplete;
    }

    let got_magic = (&buf[0..4]).get_u32_le();
    if got_magic != magic {
        return HeaderParse::Invalid(CodecError::BadMagic(got_magic));
    }

    let raw_command = &buf[4..4 + COMMAND_SIZE];
    let end = raw_command.iter().position(|b| *b == 0).unwrap_or(COMMAND_SIZE);
    let command = String::from_utf8_lossy(&raw_command[..end]).into_owned();

    let mut cursor = &buf[4 + COMMAND_SIZE..MESSAGE_HEADER_SIZE];
    let length = cursor.get_u32_le();
    if length as usize > MAX_PROTOCOL_MESSAGE_LENGTH {
        return HeaderParse::Invalid(CodecError::Oversized(length));
    }

    let mut sum = [0u8; CHECKSUM_SIZE];
    cursor.copy_to_slice(&mut sum);

    HeaderParse::Header(MessageHeader {
        magic: got_magic,
        command,
        length,
        checksum: sum,
    })
}

// =============================================================================
// Codec
// =============================================================================

/// A decoded message with the header it arrived under
#[derive(Debug, Clone)]
pub struct Frame {
    pub header: MessageHeader,
    pub message: Message,
}

impl Frame {
    /// Bytes this frame occupied on the wire
    pub fn wire_size(&self) -> usize {
        MESSAGE_HEADER_SIZE + self.header.length as usize
    }
}

/// Magic-checked, checksummed message framing
#[derive(Debug)]
pub struct MessageCodec {
    magic: u32,
    /// Header already parsed while waiting for its payload
    pending: Option<MessageHeader>,
}

impl MessageCodec {
    pub fn new(magic: u32) -> Self {
        Self {
            magic,
            pending: None,
        }
    }
}

impl Decoder for MessageCodec {
    type Item = Frame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() > DEFAULT_RECV_FLOOD_SIZE {
            return Err(CodecError::Flood(src.len()));
        }

        let header = match self.pending.take() {
            Some(header) => header,
            None => match parse_header(src, self.magic) {
                HeaderParse::Header(header) => {
                    src.advance(MESSAGE_HEADER_SIZE);
                    header
                }
                HeaderParse::Incomplete => return Ok(None),
                HeaderParse::Invalid(e) => return Err(e),
            },
        };

        let len = header.length as usize;
        if src.len() < len {
            src.reserve(len - src.len());
            self.pending = Some(header);
            return Ok(None);
        }

        let payload = src.split_to(len);
        if checksum(&payload) != header.checksum {
            return Err(CodecError::ChecksumMismatch(header.command));
        }

        let message = Message::decode(&header.command, &payload).map_err(|source| CodecError::Payload {
            command: header.command.clone(),
            source,
        })?;

        Ok(Some(Frame { header, message }))
    }
}

impl Encoder<Message> for MessageCodec {
    type Error = CodecError;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let payload = item.encode_payload();
        let header = MessageHeader::for_payload(self.magic, item.command(), &payload);

        dst.reserve(MESSAGE_HEADER_SIZE + payload.len());
        header.write_to(dst);
        dst.put_slice(&payload);
        Ok(())
    }
}

// =============================================================================
// Connection task
// =============================================================================

/// Drive one peer socket until either side closes it.
///
/// Decoded messages go to the node as [`NodeEvent::Message`]; a final
/// [`NodeEvent::Disconnected`] is always sent when the task ends.
pub async fn handle_connection(
    peer_id: PeerId,
    stream: BoxedStream,
    magic: u32,
    mut outbox: mpsc::Receiver<Message>,
    events: mpsc::Sender<NodeEvent>,
) {
    let framed = Framed::new(stream, MessageCodec::new(magic));
    let (mut writer, mut reader) = framed.split();

    let reason = loop {
        tokio::select! {
            frame = reader.next() => match frame {
                Some(Ok(frame)) => {
                    let bytes = frame.wire_size();
                    let event = NodeEvent::Message { peer_id, msg: frame.message, bytes };
                    if events.send(event).await.is_err() {
                        break "node stopped".to_string();
                    }
                }
                Some(Err(e)) => {
                    log::warn!("Peer {}: dropping connection: {}", peer_id, e);
                    break e.to_string();
                }
                None => break "closed by remote".to_string(),
            },
            out = outbox.recv() => match out {
                Some(msg) => {
                    log::trace!("Peer {}: sending {}", peer_id, msg.command());
                    if let Err(e) = writer.send(msg).await {
                        log::debug!("Peer {}: write failed: {}", peer_id, e);
                        break e.to_string();
                    }
                }
                None => break "disconnect requested".to_string(),
            },
        }
    };

    let _ = writer.close().await;
    log::debug!("Peer {}: connection closed ({})", peer_id, reason);
    let _ = events.send(NodeEvent::Disconnected { peer_id, reason }).await;
}
