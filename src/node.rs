//! Server-side handlers for the four Kademlia RPCs.

use std::fmt::{self, Debug, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use tracing::trace;

use crate::common::{self, Contact, Id};
use crate::dht::Inner;
use crate::protocol::{FindValueReply, Protocol};
use crate::storage::StoreValue;
use crate::{Error, Result};

#[derive(Clone)]
/// The local peer's server side: validates and learns senders, then answers
/// Ping / Store / FindNode / FindValue against the owning Dht's state.
pub struct Node {
    pub(crate) inner: Arc<Inner>,
}

impl Node {
    // === Getters ===

    pub fn id(&self) -> Id {
        self.inner.id()
    }

    pub fn our_contact(&self) -> Contact {
        self.inner.our_contact()
    }

    // === Public Methods ===

    /// Answer a ping with our own contact.
    ///
    /// Learning the sender has an anti-entropy side effect: a newly learned
    /// contact is seeded with every stored key it is now closer to than any
    /// other contact we know of.
    pub fn ping(&self, sender: &Contact) -> Result<Contact> {
        self.validate(sender)?;
        self.inner.learn_sender(sender, true)?;

        Ok(self.our_contact())
    }

    /// Store a key/value pair on behalf of the sender, into the cache tier
    /// when `is_cached`, otherwise into the republish tier.
    pub fn store(
        &self,
        sender: &Contact,
        key: Id,
        value: Bytes,
        is_cached: bool,
        expiration_secs: u64,
    ) -> Result<()> {
        self.validate(sender)?;
        self.inner.learn_sender(sender, true)?;

        trace!(%key, is_cached, "Storing value for peer");

        let entry = StoreValue::new(value, expiration_secs);

        if is_cached {
            self.inner.cache.set(key, entry);
        } else {
            self.inner.republish.set(key, entry);
        }

        Ok(())
    }

    /// Return up to K contacts closest to `key`, excluding the sender.
    pub fn find_node(&self, sender: &Contact, key: Id) -> Result<Vec<Contact>> {
        self.validate(sender)?;
        self.inner.learn_sender(sender, false)?;

        Ok(self.closest_excluding(sender, &key))
    }

    /// Return the value under `key` when the republish or cache tier holds
    /// it, otherwise behave exactly like [Node::find_node].
    pub fn find_value(&self, sender: &Contact, key: Id) -> Result<FindValueReply> {
        self.validate(sender)?;
        self.inner.learn_sender(sender, false)?;

        for store in [&self.inner.republish, &self.inner.cache] {
            if let Some(entry) = store.get(&key) {
                if !entry.is_expired() {
                    return Ok(FindValueReply::value(entry.value));
                }
            }
        }

        Ok(FindValueReply::contacts(self.closest_excluding(sender, &key)))
    }

    /// Dispatch a transport-agnostic request envelope to the matching
    /// handler. An adapter marshals these to and from the wire.
    pub fn handle(&self, request: ServerRequest) -> Result<ServerResponse> {
        let sender = Contact::new(request.sender_id, request.protocol.clone());

        let body = match request.kind {
            RequestKind::Ping => ResponseBody::Pong(self.ping(&sender)?),
            RequestKind::Store => {
                let key = request.key.ok_or(Error::MissingRequestKey)?;
                let value = request.value.ok_or(Error::MissingRequestValue)?;

                self.store(
                    &sender,
                    key,
                    value,
                    request.is_cached,
                    request.expiration_secs,
                )?;

                ResponseBody::Stored
            }
            RequestKind::FindNode => {
                let key = request.key.ok_or(Error::MissingRequestKey)?;

                ResponseBody::Nodes(self.find_node(&sender, key)?)
            }
            RequestKind::FindValue => {
                let key = request.key.ok_or(Error::MissingRequestKey)?;

                ResponseBody::Value(self.find_value(&sender, key)?)
            }
        };

        Ok(ServerResponse {
            correlation_id: request.correlation_id,
            body,
        })
    }

    // === Private Methods ===

    fn validate(&self, sender: &Contact) -> Result<()> {
        if sender.id == self.id() {
            return Err(Error::LoopbackRequest);
        }

        Ok(())
    }

    fn closest_excluding(&self, sender: &Contact, key: &Id) -> Vec<Contact> {
        let k = self.inner.config.k;

        let mut contacts = common::lock(&self.inner.bucket_list).closest(key, k + 1);
        contacts.retain(|contact| contact.id != sender.id);
        contacts.truncate(k);

        contacts
    }
}

impl Debug for Node {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "Node({})", self.id())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Ping,
    Store,
    FindNode,
    FindValue,
}

#[derive(Clone)]
/// The generic request envelope a transport adapter marshals from the wire.
/// Serialization of this shape is the adapter's concern, not the core's.
pub struct ServerRequest {
    /// Handle through which the sender can be reached for a reply or a
    /// follow-up call.
    pub protocol: Arc<dyn Protocol>,
    /// Name of the concrete transport, e.g. "virtual" or "udp".
    pub protocol_name: String,
    pub correlation_id: Id,
    pub sender_id: Id,
    pub kind: RequestKind,
    pub key: Option<Id>,
    pub value: Option<Bytes>,
    pub is_cached: bool,
    pub expiration_secs: u64,
}

impl ServerRequest {
    pub fn new(
        protocol: Arc<dyn Protocol>,
        protocol_name: impl Into<String>,
        sender_id: Id,
        kind: RequestKind,
    ) -> Self {
        ServerRequest {
            protocol,
            protocol_name: protocol_name.into(),
            correlation_id: Id::random(),
            sender_id,
            kind,
            key: None,
            value: None,
            is_cached: false,
            expiration_secs: 0,
        }
    }

    // === Options ===

    pub fn with_key(mut self, key: Id) -> Self {
        self.key = Some(key);
        self
    }

    pub fn with_value(mut self, value: Bytes) -> Self {
        self.value = Some(value);
        self
    }

    pub fn with_cached(mut self, is_cached: bool) -> Self {
        self.is_cached = is_cached;
        self
    }

    pub fn with_expiration(mut self, expiration_secs: u64) -> Self {
        self.expiration_secs = expiration_secs;
        self
    }
}

impl Debug for ServerRequest {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ServerRequest({:?}, from {}, correlation {})",
            self.kind, self.sender_id, self.correlation_id
        )
    }
}

#[derive(Debug)]
pub struct ServerResponse {
    pub correlation_id: Id,
    pub body: ResponseBody,
}

#[derive(Debug)]
pub enum ResponseBody {
    Pong(Contact),
    Stored,
    Nodes(Vec<Contact>),
    Value(FindValueReply),
}
