// Client error taxonomy.
//
// Errors are Clone so a single failure can resolve a pending command cell,
// be latched in a writer's deferred-error slot, and still be reported on the
// reader channel without inventing separate error values per consumer.

pub type Result<T> = std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// Malformed frame, unexpected acknowledgement payload, or name
    /// validation failure. Fatal to the connection, never retried here.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// EOF, transport error, or incomplete read. Fatal to the connection;
    /// the owning aggregator decides whether to reconnect.
    #[error("connection dropped: {0}")]
    Dropped(String),

    /// Error frame received from the peer.
    #[error("peer error: {0}")]
    RemotePeer(String),

    /// A discovery endpoint failed; excluded from that refresh cycle,
    /// never fatal to the manager.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// A message was finished or requeued twice, or used after its owning
    /// connection was released.
    #[error("connection already released")]
    AlreadyReleased,
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Dropped(err.to_string())
    }
}

impl From<quill_wire::Error> for Error {
    fn from(err: quill_wire::Error) -> Self {
        Error::Protocol(err.to_string())
    }
}
