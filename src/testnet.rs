//! In-process network of nodes over a loopback [Protocol], for tests and
//! examples.

use std::fmt::{self, Debug, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use bytes::Bytes;

use crate::common::{self, Contact, Id};
use crate::config::Config;
use crate::dht::Dht;
use crate::node::Node;
use crate::protocol::{FindValueReply, Protocol, RpcError};
use crate::Result;

/// A loopback protocol handle calling straight into a bound [Node].
///
/// Created unbound so contacts can exist before their node does; calls to
/// an unbound or deliberately unresponsive handle fail with a timeout, which
/// is also how dead peers are simulated. Every ping and store is recorded
/// for assertions.
pub struct VirtualProtocol {
    id: Id,
    node: RwLock<Option<Node>>,
    unresponsive: AtomicBool,
    pings: Mutex<Vec<Id>>,
    stores: Mutex<Vec<StoreRecord>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One recorded STORE call against a [VirtualProtocol].
pub struct StoreRecord {
    pub sender: Id,
    pub key: Id,
    pub is_cached: bool,
    pub expiration_secs: u64,
}

impl VirtualProtocol {
    pub fn new(id: Id) -> Self {
        VirtualProtocol {
            id,
            node: RwLock::new(None),
            unresponsive: AtomicBool::new(false),
            pings: Mutex::new(Vec::new()),
            stores: Mutex::new(Vec::new()),
        }
    }

    // === Getters ===

    pub fn id(&self) -> Id {
        self.id
    }

    /// Sender ids of every ping received so far.
    pub fn pings(&self) -> Vec<Id> {
        common::lock(&self.pings).clone()
    }

    /// Every store call received so far, in order.
    pub fn stores(&self) -> Vec<StoreRecord> {
        common::lock(&self.stores).clone()
    }

    // === Public Methods ===

    /// Attach the serving node. Calls before this point time out.
    pub fn bind(&self, node: Node) {
        *common::write(&self.node) = Some(node);
    }

    /// Make every subsequent call time out, simulating a dead peer.
    pub fn set_unresponsive(&self, unresponsive: bool) {
        self.unresponsive.store(unresponsive, Ordering::SeqCst);
    }

    // === Private Methods ===

    fn node(&self) -> std::result::Result<Node, RpcError> {
        if self.unresponsive.load(Ordering::SeqCst) {
            return Err(RpcError::timeout());
        }

        common::read(&self.node).clone().ok_or_else(RpcError::timeout)
    }
}

impl Protocol for VirtualProtocol {
    fn ping(&self, sender: &Contact) -> std::result::Result<(), RpcError> {
        // Attempts count even against an unbound or unresponsive handle, so
        // tests can observe who was health-checked.
        common::lock(&self.pings).push(sender.id);

        let node = self.node()?;

        node.ping(sender)
            .map(|_| ())
            .map_err(|error| RpcError::peer(error.to_string()))
    }

    fn find_node(&self, sender: &Contact, key: Id) -> std::result::Result<Vec<Contact>, RpcError> {
        self.node()?
            .find_node(sender, key)
            .map_err(|error| RpcError::peer(error.to_string()))
    }

    fn find_value(
        &self,
        sender: &Contact,
        key: Id,
    ) -> std::result::Result<FindValueReply, RpcError> {
        self.node()?
            .find_value(sender, key)
            .map_err(|error| RpcError::peer(error.to_string()))
    }

    fn store(
        &self,
        sender: &Contact,
        key: Id,
        value: Bytes,
        is_cached: bool,
        expiration_secs: u64,
    ) -> std::result::Result<(), RpcError> {
        let node = self.node()?;

        common::lock(&self.stores).push(StoreRecord {
            sender: sender.id,
            key,
            is_cached,
            expiration_secs,
        });

        node.store(sender, key, value, is_cached, expiration_secs)
            .map_err(|error| RpcError::peer(error.to_string()))
    }

    fn endpoint(&self) -> String {
        format!("virtual:{}", self.id)
    }
}

impl Debug for VirtualProtocol {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "VirtualProtocol({})", self.id)
    }
}

/// A network of virtual nodes, all bootstrapped against the first.
pub struct Testnet {
    pub dhts: Vec<Dht>,
    protocols: Vec<Arc<VirtualProtocol>>,
}

impl Testnet {
    /// Create `count` interconnected nodes with background maintenance off,
    /// so tests drive maintenance passes deterministically.
    pub fn new(count: usize) -> Result<Testnet> {
        Self::with_config(count, Config::default().with_maintenance(false))
    }

    pub fn with_config(count: usize, config: Config) -> Result<Testnet> {
        let mut protocols = Vec::with_capacity(count);
        let mut dhts = Vec::with_capacity(count);

        for _ in 0..count {
            let id = Id::random();
            let protocol = Arc::new(VirtualProtocol::new(id));
            let dht = Dht::new(id, protocol.clone(), config.clone());

            protocol.bind(dht.node());

            protocols.push(protocol);
            dhts.push(dht);
        }

        let testnet = Testnet { dhts, protocols };

        for i in 1..count {
            testnet.dhts[i].bootstrap(testnet.contact(0))?;
        }

        Ok(testnet)
    }

    // === Getters ===

    pub fn contact(&self, index: usize) -> Contact {
        Contact::new(
            self.protocols[index].id(),
            self.protocols[index].clone() as Arc<dyn Protocol>,
        )
    }

    pub fn protocol(&self, index: usize) -> Arc<VirtualProtocol> {
        self.protocols[index].clone()
    }

    /// Resolve an endpoint string back to the matching live handle, the
    /// factory shape snapshot restoration expects.
    pub fn protocol_by_endpoint(&self, endpoint: &str) -> Option<Arc<dyn Protocol>> {
        self.protocols
            .iter()
            .find(|protocol| protocol.endpoint() == endpoint)
            .map(|protocol| protocol.clone() as Arc<dyn Protocol>)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn unbound_handle_times_out() {
        let id = Id::random();
        let protocol = VirtualProtocol::new(id);
        let sender = Contact::new(Id::random(), Arc::new(VirtualProtocol::new(Id::random())));

        let error = protocol.ping(&sender).unwrap_err();
        assert!(error.timeout);
    }

    #[test]
    fn unresponsive_handle_times_out() {
        let testnet = Testnet::new(2).unwrap();

        testnet.protocol(1).set_unresponsive(true);

        let error = testnet
            .protocol(1)
            .ping(&testnet.contact(0))
            .unwrap_err();
        assert!(error.timeout);
    }

    #[test]
    fn bootstrap_connects_nodes() {
        let testnet = Testnet::new(3).unwrap();

        // Everyone learned the bootstrap node, and it learned everyone.
        for i in 1..3 {
            assert!(testnet.dhts[i].contains(&testnet.dhts[0].id()));
            assert!(testnet.dhts[0].contains(&testnet.dhts[i].id()));
        }
    }
}
