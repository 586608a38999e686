//! The outward seam between the DHT core and a concrete transport.

use std::fmt::Debug;

use bytes::Bytes;

use crate::common::{Contact, Id};

/// The interface through which the DHT reaches a remote peer.
///
/// A concrete transport (UDP, HTTP, in-process, ...) implements these four
/// operations; the core never sees sockets or wire formats. All failures are
/// reported as [RpcError] values, never panics.
pub trait Protocol: Send + Sync + Debug {
    /// Check that the peer is alive. The peer learns `sender` as a side effect.
    fn ping(&self, sender: &Contact) -> Result<(), RpcError>;

    /// Ask the peer for up to K contacts closest to `key`.
    fn find_node(&self, sender: &Contact, key: Id) -> Result<Vec<Contact>, RpcError>;

    /// Ask the peer for the value stored under `key`, falling back to its
    /// closest contacts when it doesn't hold the value.
    fn find_value(&self, sender: &Contact, key: Id) -> Result<FindValueReply, RpcError>;

    /// Ask the peer to store a key/value pair, either as a replica
    /// (`is_cached == false`) or as an opportunistic cache entry.
    fn store(
        &self,
        sender: &Contact,
        key: Id,
        value: Bytes,
        is_cached: bool,
        expiration_secs: u64,
    ) -> Result<(), RpcError>;

    /// An opaque endpoint description, stable across restarts, used to
    /// rebuild this handle from a snapshot.
    fn endpoint(&self) -> String;
}

#[derive(Debug, Clone)]
/// Reply to a FIND_VALUE request: either the value itself, or the peer's
/// closest contacts to the key.
pub struct FindValueReply {
    pub contacts: Option<Vec<Contact>>,
    pub value: Option<Bytes>,
}

impl FindValueReply {
    pub fn value(value: Bytes) -> Self {
        FindValueReply {
            contacts: None,
            value: Some(value),
        }
    }

    pub fn contacts(contacts: Vec<Contact>) -> Self {
        FindValueReply {
            contacts: Some(contacts),
            value: None,
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, Default, PartialEq, Eq)]
#[error("rpc failure (timeout: {timeout}, id mismatch: {id_mismatch}, peer error: {peer_error}, protocol error: {protocol_error})")]
/// The outcome of a failed remote call.
///
/// A value, not an exception: remote-call failures feed the eviction and
/// replacement policy instead of aborting the caller.
pub struct RpcError {
    /// The peer did not respond in time.
    pub timeout: bool,
    /// The peer responded with an id other than the one we contacted.
    pub id_mismatch: bool,
    /// The peer reported an error of its own.
    pub peer_error: bool,
    /// The transport failed to deliver or decode the message.
    pub protocol_error: bool,
    pub peer_error_message: Option<String>,
    pub protocol_error_message: Option<String>,
}

impl RpcError {
    pub fn timeout() -> Self {
        RpcError {
            timeout: true,
            ..Default::default()
        }
    }

    pub fn id_mismatch() -> Self {
        RpcError {
            id_mismatch: true,
            ..Default::default()
        }
    }

    pub fn peer(message: impl Into<String>) -> Self {
        RpcError {
            peer_error: true,
            peer_error_message: Some(message.into()),
            ..Default::default()
        }
    }

    pub fn protocol(message: impl Into<String>) -> Self {
        RpcError {
            protocol_error: true,
            protocol_error_message: Some(message.into()),
            ..Default::default()
        }
    }

    /// True if any failure flag is set.
    pub fn has_error(&self) -> bool {
        self.timeout || self.id_mismatch || self.peer_error || self.protocol_error
    }
}
