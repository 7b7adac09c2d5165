//! src/error.rs
//!
//! Defines the library's custom, comprehensive `Error` enum using `thiserror`.

use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum Error {
    /// Admission was denied because the store's configured byte capacity
    /// would be exceeded. The store is left unchanged.
    #[error("store is at capacity")]
    StoreFull,

    #[error("keys must be non-empty")]
    InvalidKey,

    /// The local write succeeded but the required acknowledgements did not
    /// arrive within the write deadline. The local copy is retained and
    /// converges through background gossip.
    #[error("write did not reach quorum within {0:?}")]
    QuorumTimeout(Duration),

    /// Signature verification failed on an inbound wire message.
    #[error("message signature missing or invalid")]
    Forbidden,

    #[error("transport unavailable: {0}")]
    Transport(String),

    #[error("unknown peer: {0}")]
    UnknownPeer(String),

    #[error("node is shutting down")]
    Shutdown,

    #[error("configuration error: {0}")]
    Config(#[from] figment::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to serialize or deserialize: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("failed to encode message record: {0}")]
    Encoding(#[from] serde_json::Error),

    #[error("cannot resolve peer address {0}")]
    AddrResolve(String),

    #[error("send to {0} timed out")]
    SendTimeout(SocketAddr),

    #[error("TLS configuration error: {0}")]
    TlsConfig(String),

    #[error("failed to initiate connection to {0}: {1}")]
    ConnectFailed(SocketAddr, #[source] quinn::ConnectError),

    #[error("connection to {0} failed during establishment: {1}")]
    ConnectionEstablishFailed(SocketAddr, #[source] quinn::ConnectionError),

    #[error("an established connection failed: {0}")]
    Connection(#[from] quinn::ConnectionError),

    #[error("failed to write to network stream: {0}")]
    WriteStream(#[from] quinn::WriteError),

    #[error("failed to read from network stream: {0}")]
    ReadStream(#[from] quinn::ReadToEndError),
}
