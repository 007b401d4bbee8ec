//! Bitcoin P2P network session library: outbound/inbound/seed/manual
//! connection management, the version handshake, a host address pool and a
//! broadcast-capable registry of live channels over the Bitcoin wire
//! protocol.

pub mod authority;
pub mod channel;
pub mod connections;
pub mod conversation;
pub mod error;
pub mod hosts;
pub mod p2p;
pub mod settings;
pub mod wire_protocol;

mod sessions;

pub use authority::{Authority, NetworkAddress};
pub use channel::{Channel, ChannelState};
pub use connections::Connections;
pub use error::{Error, NetResult};
pub use p2p::{P2p, ServiceState};
pub use settings::Settings;
