use thiserror::Error;

pub type NetResult<T> = Result<T, Error>;

/// Failure codes surfaced by the public operations. Each code is
/// distinguishable to callers; transient per-peer failures are absorbed by
/// the owning session and reported as `OperationFailed` only when the whole
/// session cannot make progress.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum Error {
    #[error("operation failed")]
    OperationFailed,

    #[error("object does not exist")]
    NotFound,

    #[error("address already in use")]
    AddressInUse,

    #[error("address is blocked")]
    AddressBlocked,

    #[error("channel timed out")]
    ChannelTimeout,

    #[error("channel stopped")]
    ChannelStopped,

    /// Codec-level failure: bad magic, bad checksum, truncated or oversized
    /// payload. Terminates the channel it occurred on.
    #[error("bad stream: {0}")]
    BadStream(String),

    /// Handshake protocol violation, including self-connection detection.
    #[error("protocol violation: {0}")]
    ChannelProxy(String),

    #[error("peer throttling")]
    PeerThrottling,

    /// Transport failure. Never crosses the service boundary; sessions
    /// absorb it and report `OperationFailed` when it matters.
    #[error("transport: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value.to_string())
    }
}
