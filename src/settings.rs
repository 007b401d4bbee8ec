use std::path::PathBuf;
use std::time::Duration;

use crate::authority::Authority;
use crate::wire_protocol::node::{Chain, NodeService};

/// Matches bitcoin core v24.
pub const PROTOCOL_VERSION: i32 = 70016;

pub const USER_AGENT: &str = "/bitcoin-net:0.1.0/";

/// Runtime tunables of the p2p service. Construct one of the network
/// presets and override individual fields as needed.
#[derive(Clone, Debug)]
pub struct Settings {
    pub network: Chain,
    /// Worker count for the runtime the embedding application builds.
    pub threads: usize,
    pub protocol_version: i32,
    /// Service bitfield advertised in outgoing `version` messages.
    pub services: u64,
    pub user_agent: String,
    pub host_pool_capacity: usize,
    pub outbound_connections: usize,
    pub inbound_connection_limit: usize,
    pub inbound_port: u16,
    pub connect_timeout_seconds: u64,
    pub channel_handshake_seconds: u64,
    pub channel_germination_seconds: u64,
    pub channel_inactivity_minutes: u64,
    pub channel_expiration_minutes: u64,
    pub hosts_file: PathBuf,
    /// Bootstrap endpoints, `host:port`, resolved at seeding time.
    pub seeds: Vec<String>,
    pub blacklists: Vec<Authority>,
}

impl Settings {
    pub fn mainnet() -> Self {
        Settings {
            network: Chain::Mainnet,
            inbound_port: 8333,
            seeds: vec![
                "seed.bitcoin.sipa.be:8333".to_string(),
                "dnsseed.bluematt.me:8333".to_string(),
                "seed.bitcoinstats.com:8333".to_string(),
                "seed.btc.petertodd.org:8333".to_string(),
            ],
            ..Settings::base(Chain::Mainnet)
        }
    }

    pub fn testnet() -> Self {
        Settings {
            network: Chain::Testnet3,
            inbound_port: 18333,
            seeds: vec![
                "testnet-seed.bitcoin.jonasschnelli.ch:18333".to_string(),
                "seed.tbtc.petertodd.org:18333".to_string(),
                "testnet-seed.bluematt.me:18333".to_string(),
            ],
            ..Settings::base(Chain::Testnet3)
        }
    }

    /// Local regression testing: no seeding, peers are added manually.
    pub fn regtest() -> Self {
        Settings {
            network: Chain::Regtest,
            inbound_port: 18444,
            host_pool_capacity: 0,
            outbound_connections: 0,
            ..Settings::base(Chain::Regtest)
        }
    }

    fn base(network: Chain) -> Self {
        Settings {
            network,
            threads: 4,
            protocol_version: PROTOCOL_VERSION,
            services: NodeService::NodeNetwork.as_u64(),
            user_agent: USER_AGENT.to_string(),
            host_pool_capacity: 1000,
            outbound_connections: 8,
            inbound_connection_limit: 8,
            inbound_port: 8333,
            connect_timeout_seconds: 5,
            channel_handshake_seconds: 30,
            channel_germination_seconds: 30,
            channel_inactivity_minutes: 10,
            channel_expiration_minutes: 90,
            hosts_file: PathBuf::from("hosts.cache"),
            seeds: vec![],
            blacklists: vec![],
        }
    }

    pub(crate) fn blacklisted(&self, authority: &Authority) -> bool {
        self.blacklists.contains(authority)
    }

    pub(crate) fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }

    pub(crate) fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_handshake_seconds)
    }

    pub(crate) fn germination_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_germination_seconds)
    }

    pub(crate) fn inactivity_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_inactivity_minutes * 60)
    }

    pub(crate) fn expiration_timeout(&self) -> Duration {
        Duration::from_secs(self.channel_expiration_minutes * 60)
    }
}
