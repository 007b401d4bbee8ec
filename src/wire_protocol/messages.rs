use std::net::{IpAddr, Ipv4Addr, SocketAddr};

use crate::authority::{unix_time, NetworkAddress};
use crate::error::{Error, NetResult};
use crate::wire_protocol::buffer::{ByteBufferComposer, ByteBufferParser};
use crate::wire_protocol::node::{Chain, NodeDesc};
use crate::wire_protocol::raw_message::{Command, RawMessage};

/// Upper bound on entries per `addr` message, as deployed.
const MAX_ADDR_ENTRIES: u64 = 1000;

#[derive(Clone, Debug, PartialEq)]
pub enum ProtocolMessage {
    Version(VersionMessage),
    Verack(VerackMessage),
    Ping(PingMessage),
    Pong(PongMessage),
    GetAddr(GetAddrMessage),
    Addr(AddrMessage),
    Unknown(UnknownMessage),
}

impl ProtocolMessage {
    pub fn command(&self) -> Command {
        match self {
            ProtocolMessage::Version(_) => Command::Version,
            ProtocolMessage::Verack(_) => Command::Verack,
            ProtocolMessage::Ping(_) => Command::Ping,
            ProtocolMessage::Pong(_) => Command::Pong,
            ProtocolMessage::GetAddr(_) => Command::GetAddr,
            ProtocolMessage::Addr(_) => Command::Addr,
            ProtocolMessage::Unknown(message) => Command::Unknown(message.command),
        }
    }

    pub fn to_raw_message(&self, chain: Chain) -> RawMessage {
        let payload = match self {
            ProtocolMessage::Version(message) => message.to_payload(),
            ProtocolMessage::Verack(_) | ProtocolMessage::GetAddr(_) => vec![],
            ProtocolMessage::Ping(message) => message.nonce.to_le_bytes().to_vec(),
            ProtocolMessage::Pong(message) => message.nonce.to_le_bytes().to_vec(),
            ProtocolMessage::Addr(message) => message.to_payload(),
            ProtocolMessage::Unknown(message) => message.payload.clone(),
        };
        RawMessage::new(chain, self.command(), payload)
    }

    pub fn to_bytes(&self, chain: Chain) -> Vec<u8> {
        self.to_raw_message(chain).to_bytes()
    }
}

impl TryFrom<RawMessage> for ProtocolMessage {
    type Error = Error;

    fn try_from(raw: RawMessage) -> NetResult<Self> {
        let message = match raw.command {
            Command::Version => ProtocolMessage::Version(VersionMessage::from_payload(&raw.payload)?),
            Command::Verack => ProtocolMessage::Verack(VerackMessage),
            Command::Ping => ProtocolMessage::Ping(PingMessage::from_payload(&raw.payload)?),
            Command::Pong => {
                let ping = PingMessage::from_payload(&raw.payload)?;
                ProtocolMessage::Pong(PongMessage { nonce: ping.nonce })
            }
            Command::GetAddr => ProtocolMessage::GetAddr(GetAddrMessage),
            Command::Addr => ProtocolMessage::Addr(AddrMessage::from_payload(&raw.payload)?),
            Command::Unknown(command) => ProtocolMessage::Unknown(UnknownMessage {
                command,
                payload: raw.payload,
            }),
        };
        Ok(message)
    }
}

/// https://en.bitcoin.it/wiki/Protocol_documentation#version
///
/// size | field        | type     | description
/// ---  | -----        | ----     | ------------
/// 4    | version      | i32      | Identifies protocol version being used by the node
/// 8    | services     | u64      | bitfield of features to be enabled for this connection
/// 8    | timestamp    | i64      | standard UNIX timestamp in seconds
/// 26   | addr_recv    | net_addr | The network address of the node receiving this message
/// 26   | addr_from    | net_addr | The network address of the node emitting this message
/// 8    | nonce        | u64      | Node random nonce, used to detect connections to self
/// ?    | user_agent   | var_str  | User Agent (0x00 if string is 0 bytes long)
/// 4    | start_height | i32      | The last block received by the emitting node
/// 1    | relay        | bool     | Whether the remote peer should announce relayed transactions or not, see BIP 0037
#[derive(Clone, Debug, PartialEq)]
pub struct VersionMessage {
    pub protocol_version: i32,
    pub services: u64,
    pub timestamp: i64,
    pub addr_recv_services: u64,
    pub addr_recv: SocketAddr,
    pub addr_from_services: u64,
    pub addr_from: SocketAddr,
    pub nonce: u64,
    pub user_agent: String,
    pub start_height: i32,
    pub relay: bool,
}

impl VersionMessage {
    pub fn new(addr_recv: SocketAddr, nonce: u64, me: &NodeDesc) -> Self {
        let services = me.services.as_bitmask();
        VersionMessage {
            protocol_version: me.protocol_version,
            services,
            timestamp: unix_time() as i64,
            addr_recv_services: 0,
            addr_recv,
            addr_from_services: services,
            // our own address is unroutable from the peer's side anyway
            addr_from: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            nonce,
            user_agent: me.sub_ver.clone(),
            start_height: me.start_height,
            relay: true,
        }
    }

    pub(crate) fn from_payload(payload: &[u8]) -> NetResult<Self> {
        let mut parser = ByteBufferParser::new(payload);

        let protocol_version = parser.read_i32_le()?;
        let services = parser.read_u64_le()?;
        let timestamp = parser.read_i64_le()?;
        let (addr_recv_services, addr_recv) = parser.parse_net_addr()?;
        let (addr_from_services, addr_from) = parser.parse_net_addr()?;
        let nonce = parser.read_u64_le()?;
        let user_agent = parser.read_var_string()?;
        let start_height = parser.read_i32_le()?;
        // the relay flag only exists from BIP 0037 on; absent means relay
        let relay = if parser.remaining() == 0 {
            true
        } else {
            parser.read_u8()? != 0
        };

        Ok(VersionMessage {
            protocol_version,
            services,
            timestamp,
            addr_recv_services,
            addr_recv,
            addr_from_services,
            addr_from,
            nonce,
            user_agent,
            start_height,
            relay,
        })
    }

    pub(crate) fn to_payload(&self) -> Vec<u8> {
        let mut composer = ByteBufferComposer::new();
        composer.append(&self.protocol_version.to_le_bytes());
        composer.append(&self.services.to_le_bytes());
        composer.append(&self.timestamp.to_le_bytes());
        composer.append_net_addr(self.addr_recv_services, &self.addr_recv);
        composer.append_net_addr(self.addr_from_services, &self.addr_from);
        composer.append(&self.nonce.to_le_bytes());
        composer.append_var_string(&self.user_agent);
        composer.append(&self.start_height.to_le_bytes());
        composer.append(&[u8::from(self.relay)]);
        composer.result()
    }
}

/// _A "verack" packet shall be sent if the version packet was accepted._
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VerackMessage;

/// Keepalive probe carrying a random nonce (BIP 0031); answered by a `pong`
/// echoing the same nonce.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PingMessage {
    pub nonce: u64,
}

impl PingMessage {
    fn from_payload(payload: &[u8]) -> NetResult<Self> {
        let mut parser = ByteBufferParser::new(payload);
        let nonce = parser.read_u64_le()?;
        Ok(PingMessage { nonce })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PongMessage {
    pub nonce: u64,
}

/// Request for a batch of known peer addresses. Empty payload.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct GetAddrMessage;

/// https://en.bitcoin.it/wiki/Protocol_documentation#addr
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AddrMessage {
    pub addresses: Vec<NetworkAddress>,
}

impl AddrMessage {
    fn from_payload(payload: &[u8]) -> NetResult<Self> {
        let mut parser = ByteBufferParser::new(payload);
        let count = parser.read_varint()?;
        if count > MAX_ADDR_ENTRIES {
            return Err(Error::BadStream(format!(
                "addr message claims {count} entries, bound is {MAX_ADDR_ENTRIES}"
            )));
        }
        let mut addresses = Vec::with_capacity(count as usize);
        for _ in 0..count {
            addresses.push(parser.parse_net_addr_with_time()?);
        }
        Ok(AddrMessage { addresses })
    }

    fn to_payload(&self) -> Vec<u8> {
        let mut composer = ByteBufferComposer::new();
        composer.append_varint(self.addresses.len() as u64);
        for address in &self.addresses {
            composer.append_net_addr_with_time(address);
        }
        composer.result()
    }
}

/// A command outside the session vocabulary; payload travels untouched.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnknownMessage {
    pub command: [u8; 12],
    pub payload: Vec<u8>,
}
