use std::ascii;
use std::fmt::{self, Display, Formatter};

use sha2::digest::FixedOutput;
use sha2::{Digest, Sha256};

use crate::error::{Error, NetResult};
use crate::wire_protocol::buffer::{ByteBufferComposer, ByteBufferParser, IOBuffer};
use crate::wire_protocol::node::Chain;

pub(crate) const HEADER_LEN: usize = 4 + 12 + 4 + 4;

/// Payloads advertising more than this can never be buffered in one piece.
pub const MAX_PAYLOAD_LEN: usize = IOBuffer::CAPACITY - HEADER_LEN;

/// The commands the session layer understands. Anything else on the wire is
/// carried opaquely so subscribers can still see it and the codec can
/// round-trip it.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Command {
    Version,
    Verack,
    Ping,
    Pong,
    GetAddr,
    Addr,
    Unknown([u8; 12]),
}

impl Command {
    // ASCII string identifying the packet content, NULL padded (non-NULL padding results in packet rejected)
    pub(crate) fn to_wire(&self) -> [u8; 12] {
        match self {
            Command::Version => *b"version\0\0\0\0\0",
            Command::Verack => *b"verack\0\0\0\0\0\0",
            Command::Ping => *b"ping\0\0\0\0\0\0\0\0",
            Command::Pong => *b"pong\0\0\0\0\0\0\0\0",
            Command::GetAddr => *b"getaddr\0\0\0\0\0",
            Command::Addr => *b"addr\0\0\0\0\0\0\0\0",
            Command::Unknown(raw) => *raw,
        }
    }

    pub(crate) fn from_wire(raw: [u8; 12]) -> NetResult<Self> {
        let name_len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        let (name, padding) = raw.split_at(name_len);
        if name.is_empty()
            || padding.iter().any(|&b| b != 0)
            || name.iter().any(|&b| !b.is_ascii_graphic())
        {
            return Err(Error::BadStream(format!(
                "'{}' ({:?}) is not a well-formed bitcoin command",
                printable(&raw),
                raw
            )));
        }

        let command = match name {
            b"version" => Command::Version,
            b"verack" => Command::Verack,
            b"ping" => Command::Ping,
            b"pong" => Command::Pong,
            b"getaddr" => Command::GetAddr,
            b"addr" => Command::Addr,
            _ => Command::Unknown(raw),
        };
        Ok(command)
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        let raw = self.to_wire();
        let name_len = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        write!(f, "{}", printable(&raw[..name_len]))
    }
}

fn printable(bytes: &[u8]) -> String {
    let mut result = String::new();
    for &c in bytes {
        result.push_str(std::str::from_utf8(&ascii::escape_default(c).collect::<Vec<u8>>()).unwrap())
    }
    result
}

/// Almost all integers are encoded in little endian. Only IP or port number are encoded big endian.
pub struct RawMessage {
    pub chain: Chain,
    pub command: Command,
    pub payload: Vec<u8>,
}

impl RawMessage {
    pub fn new(chain: Chain, command: Command, payload: Vec<u8>) -> Self {
        RawMessage {
            chain,
            command,
            payload,
        }
    }

    /// Message structure (see https://en.bitcoin.it/wiki/Protocol_documentation#Message_structure)
    ///
    /// size | field    | type     | description
    /// ---  | -----    | ----     | ------------
    /// 4    | magic    | u32      | Magic value indicating message origin network, and used to seek to next message when stream state is unknown
    /// 12   | command  | [u8; 12] | ASCII string identifying the packet content, NULL padded (non-NULL padding results in packet rejected)
    /// 4    | length   | u32      | Length of payload in number of bytes
    /// 4    | checksum | u32      | First 4 bytes of sha256(sha256(payload))
    /// ?    | payload  | Vec<u8>  | The actual data
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut c = ByteBufferComposer::new();
        c.append(&self.chain.magic_value().to_le_bytes());
        c.append(&self.command.to_wire());
        c.append(&(self.payload.len() as u32).to_le_bytes());
        let checksum = sha256(&sha256(self.payload.as_slice()));
        c.append(&checksum[..4]);
        c.append(&self.payload);
        c.result()
    }

    /// Consumes one message from the front of `buffer` if a complete one is
    /// there. A wrong magic, an oversized length claim or a checksum
    /// mismatch poison the stream and are errors; an incomplete message is
    /// simply not yet consumable.
    pub fn try_consume_message(buffer: &mut IOBuffer, expected_chain: Chain) -> NetResult<MessageParseOutcome> {
        let mut parser = ByteBufferParser::new(buffer.content());

        if parser.remaining() < HEADER_LEN {
            return Ok(MessageParseOutcome::NoMessage);
        }

        let magic = parser.read_u32_le()?;
        let chain = Chain::try_from(magic)?;
        if chain != expected_chain {
            return Err(Error::BadStream(format!(
                "expected network chain {expected_chain:?}, but got a message from {chain:?}"
            )));
        }

        let command_bytes: [u8; 12] = parser.read(12)?.try_into().unwrap();
        let payload_len = parser.read_u32_le()? as usize;
        if payload_len > MAX_PAYLOAD_LEN {
            return Err(Error::BadStream(format!(
                "message claims a {payload_len} byte payload, bound is {MAX_PAYLOAD_LEN}"
            )));
        }
        let checksum: [u8; 4] = parser.read(4)?.try_into().unwrap();

        if parser.remaining() < payload_len {
            return Ok(MessageParseOutcome::NoMessage);
        }

        let payload = parser.read(payload_len)?.to_vec();
        Self::verify_checksum(&payload, &checksum)?;

        let command = match Command::from_wire(command_bytes) {
            Ok(command) => command,
            Err(err) => {
                buffer.shift_left(parser.pos());
                log::warn!("{}", err);
                return Ok(MessageParseOutcome::SkippedMessage);
            }
        };

        log::debug!("receiving command '{}' ({} byte payload)", command, payload.len());
        buffer.shift_left(parser.pos());

        Ok(MessageParseOutcome::Message(RawMessage {
            chain,
            command,
            payload,
        }))
    }

    fn verify_checksum(payload: &[u8], checksum: &[u8]) -> NetResult<()> {
        if *checksum == sha256(&sha256(payload))[..4] {
            Ok(())
        } else {
            Err(Error::BadStream("payload checksum mismatch".to_string()))
        }
    }
}

pub enum MessageParseOutcome {
    Message(RawMessage),
    SkippedMessage,
    NoMessage,
}

pub(crate) fn sha256(input: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::default();
    hasher.update(input);
    hasher.finalize_fixed().into()
}
