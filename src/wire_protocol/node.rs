use std::ops::BitAnd;

use strum::{EnumIter, IntoEnumIterator};

use crate::error::Error;

/// Everything a `version` message tells us about a node, ours or a peer's.
#[derive(Clone, Debug)]
pub struct NodeDesc {
    pub chain: Chain,
    pub protocol_version: i32,
    pub services: NodeServiceSet,
    pub sub_ver: String,
    pub start_height: i32,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, EnumIter)]
pub enum Chain {
    Mainnet,
    Testnet3,
    Regtest,
}

impl Chain {
    pub fn magic_value(&self) -> u32 {
        match self {
            Chain::Mainnet => 0xD9B4BEF9,
            Chain::Testnet3 => 0x0709110B,
            Chain::Regtest => 0xDAB5BFFA,
        }
    }
}

impl TryFrom<u32> for Chain {
    type Error = Error;

    fn try_from(magic_value: u32) -> Result<Self, Self::Error> {
        for c in Self::iter() {
            if c.magic_value() == magic_value {
                return Ok(c);
            }
        }
        Err(Error::BadStream(format!("no chain known having magic value {magic_value:#010x}")))
    }
}

#[derive(Clone, Debug, PartialEq)]
pub struct NodeServiceSet(pub Vec<NodeService>);

impl NodeServiceSet {
    pub fn as_bitmask(&self) -> u64 {
        let mut bitset = 0x0_u64;
        for bit in self.0.iter() {
            bitset |= bit.as_u64();
        }
        bitset
    }

    /// Service bits we don't model are dropped; keep the raw mask around
    /// when byte-exact round-trips matter.
    pub fn from_bitmask(mask: u64) -> Self {
        let mut services = vec![];

        for e in NodeService::iter() {
            if mask.bitand(e.as_u64()) != 0 {
                services.push(e);
            }
        }

        NodeServiceSet(services)
    }
}

#[derive(Copy, Clone, Debug, PartialEq)]
#[repr(u64)]
#[derive(EnumIter)]
pub enum NodeService {
    NodeNetwork = 0x1, // bit mask value
    NodeGetUtxo = 0x2,
    NodeBloom = 0x4,
    NodeWitness = 0x8,
    NodeNetworkLimited = 0x400,
}

impl NodeService {
    pub fn as_u64(self) -> u64 {
        self as u64
    }
}
