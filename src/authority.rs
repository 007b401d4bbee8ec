use std::fmt::{self, Display, Formatter};
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::Error;

/// A peer endpoint: IP address plus port. Equality and hashing are by
/// address+port, which keys the connections registry and the host pool.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct Authority(SocketAddr);

impl Authority {
    pub fn new(ip: IpAddr, port: u16) -> Self {
        Authority(SocketAddr::new(ip, port))
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip()
    }

    pub fn port(&self) -> u16 {
        self.0.port()
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.0
    }
}

impl From<SocketAddr> for Authority {
    fn from(addr: SocketAddr) -> Self {
        Authority(addr)
    }
}

impl Display for Authority {
    // SocketAddr already renders IPv6 in the bracketed `[addr]:port` form
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Authority {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<SocketAddr>() {
            Ok(addr) => Ok(Authority(addr)),
            Err(_) => Err(Error::BadStream(format!("'{s}' is not an authority (expected address:port)"))),
        }
    }
}

/// An authority as it travels on the wire and lives in the host pool:
/// service bits plus a last-seen timestamp.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct NetworkAddress {
    pub timestamp: u32,
    pub services: u64,
    pub authority: Authority,
}

impl NetworkAddress {
    pub fn new(authority: Authority, services: u64, timestamp: u32) -> Self {
        NetworkAddress {
            timestamp,
            services,
            authority,
        }
    }

    /// Record for an authority we know nothing else about yet.
    pub fn from_authority(authority: Authority) -> Self {
        NetworkAddress::new(authority, 0, unix_time() as u32)
    }
}

pub(crate) fn unix_time() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
