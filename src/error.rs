//! Main Crate Error

use crate::common::Id;
use crate::protocol::RpcError;

#[derive(thiserror::Error, Debug)]
/// Kadmos crate error enum.
///
/// These are invariant violations; they are never retried. Remote-call
/// failures are represented separately as [RpcError] values.
pub enum Error {
    /// Indicates an identifier that is not exactly 20 bytes.
    #[error("Invalid Id size, expected 20 bytes, got {0}")]
    InvalidIdSize(usize),

    /// Indicates an identifier hex string that could not be decoded.
    #[error("Invalid Id encoding: {0}")]
    InvalidIdEncoding(String),

    /// A node cannot add itself as a contact.
    #[error("A node cannot add its own id as a contact")]
    SelfContact,

    /// A lookup was attempted before any contact was learned.
    #[error("Cannot lookup with an empty routing table")]
    EmptyRoutingTable,

    /// A server handler received a request from its own id.
    #[error("Received a request from our own id")]
    LoopbackRequest,

    /// An eviction was requested for a contact that is not in its bucket.
    #[error("Contact {0} is not present in its bucket")]
    ContactNotFound(Id),

    /// The router was used before the owning Dht wired it up.
    #[error("Router is not initialized")]
    RouterNotWired,

    /// A request envelope was missing the key its kind requires.
    #[error("Request is missing a key")]
    MissingRequestKey,

    /// A store request envelope was missing its value.
    #[error("Request is missing a value")]
    MissingRequestValue,

    #[error(transparent)]
    /// Transparent [RpcError], for operations that surface a remote failure.
    Rpc(#[from] RpcError),

    /// Failed to encode or decode a snapshot.
    #[error("Snapshot encoding error: {0}")]
    Bencode(#[from] serde_bencode::Error),

    /// A snapshot referenced an endpoint the protocol factory does not know.
    #[error("No protocol handle for endpoint {0}")]
    UnknownEndpoint(String),
}
