//! Contact admission, liveness pings, eviction and bootstrap behavior.

use std::sync::Arc;

use kadmos::testnet::{Testnet, VirtualProtocol};
use kadmos::{
    Config, Contact, Dht, Error, Id, RequestKind, ResponseBody, RpcError, ServerRequest,
    DEFAULT_K,
};

fn no_maintenance() -> Config {
    Config::default().with_maintenance(false)
}

fn id_from(bytes: [u8; 20]) -> Id {
    Id::from_bytes(bytes).unwrap()
}

/// A node at id zero plus 21 crafted contacts that all land in one bucket
/// which fills at exactly K and is not eligible to split: the contacts
/// share five leading bits and the bucket excludes the node's own id.
fn crowded_node() -> (Dht, Vec<Contact>, Vec<Arc<VirtualProtocol>>) {
    let our_id = id_from([0_u8; 20]);
    let protocol = Arc::new(VirtualProtocol::new(our_id));
    let dht = Dht::new(our_id, protocol.clone(), no_maintenance());
    protocol.bind(dht.node());

    let mut contacts = Vec::new();
    let mut protocols = Vec::new();

    for i in 0..=DEFAULT_K {
        let mut bytes = [0_u8; 20];
        bytes[0] = 0b1000_1000 | (i as u8 % 8);
        bytes[19] = i as u8;

        let id = id_from(bytes);
        let contact_protocol = Arc::new(VirtualProtocol::new(id));

        contacts.push(Contact::new(id, contact_protocol.clone()));
        protocols.push(contact_protocol);
    }

    (dht, contacts, protocols)
}

#[test]
fn full_bucket_pings_only_the_least_recent() {
    let (dht, contacts, protocols) = crowded_node();

    for contact in contacts.iter().take(DEFAULT_K) {
        dht.add_contact(contact.clone()).unwrap();
    }

    assert!(protocols.iter().all(|protocol| protocol.pings().is_empty()));

    // The 21st contact overflows the bucket; only the head is checked.
    dht.add_contact(contacts[DEFAULT_K].clone()).unwrap();

    assert_eq!(protocols[0].pings(), vec![dht.id()]);
    for protocol in protocols.iter().skip(1) {
        assert!(protocol.pings().is_empty());
    }

    // One failed ping is below the eviction limit; the table is unchanged.
    assert_eq!(dht.routing_table_size(), DEFAULT_K);
    assert!(dht.contains(&contacts[0].id));
    assert!(!dht.contains(&contacts[DEFAULT_K].id));
}

#[test]
fn eviction_after_repeated_failures_promotes_pending_contact() {
    let (dht, contacts, _protocols) = crowded_node();

    for contact in contacts.iter().take(DEFAULT_K) {
        dht.add_contact(contact.clone()).unwrap();
    }

    // Overflowing queues the newcomer as pending and fails one ping.
    dht.add_contact(contacts[DEFAULT_K].clone()).unwrap();

    // Three more failures stay below the limit of five.
    for _ in 0..3 {
        dht.handle_error(&RpcError::timeout(), &contacts[0]);
    }
    assert!(dht.contains(&contacts[0].id));

    // The fifth consecutive failure evicts and promotes the newcomer.
    dht.handle_error(&RpcError::timeout(), &contacts[0]);

    assert!(!dht.contains(&contacts[0].id));
    assert!(dht.contains(&contacts[DEFAULT_K].id));
    assert_eq!(dht.routing_table_size(), DEFAULT_K);
}

#[test]
fn successful_interaction_resets_the_failure_streak() {
    let testnet = Testnet::new(2).unwrap();

    let peer = testnet.contact(1);

    for _ in 0..4 {
        testnet.dhts[0].handle_error(&RpcError::timeout(), &peer);
    }

    // Re-admission on a successful interaction clears the counter.
    testnet.dhts[0].add_contact(peer.clone()).unwrap();

    for _ in 0..4 {
        testnet.dhts[0].handle_error(&RpcError::timeout(), &peer);
    }

    assert!(testnet.dhts[0].contains(&peer.id));
}

#[test]
fn bootstrap_learns_the_peers_contacts() {
    let config = no_maintenance();

    let mut dhts = Vec::new();
    let mut protocols = Vec::new();

    for _ in 0..4 {
        let id = Id::random();
        let protocol = Arc::new(VirtualProtocol::new(id));
        let dht = Dht::new(id, protocol.clone(), config.clone());

        protocol.bind(dht.node());
        protocols.push(protocol);
        dhts.push(dht);
    }

    let contact = |i: usize| Contact::new(dhts[i].id(), protocols[i].clone() as _);

    // B knows C and D; A knows only B.
    dhts[1].add_contact(contact(2)).unwrap();
    dhts[1].add_contact(contact(3)).unwrap();

    dhts[0].bootstrap(contact(1)).unwrap();

    for i in 1..4 {
        assert!(dhts[0].contains(&dhts[i].id()));
    }

    // The bootstrap peer learned us as the sender of the locate call.
    assert!(dhts[1].contains(&dhts[0].id()));
}

#[test]
fn bootstrap_against_dead_peer_fails() {
    let testnet = Testnet::new(1).unwrap();

    let id = Id::random();
    let protocol = Arc::new(VirtualProtocol::new(id));
    let dht = Dht::new(id, protocol.clone(), no_maintenance());
    protocol.bind(dht.node());

    testnet.protocol(0).set_unresponsive(true);

    assert!(matches!(
        dht.bootstrap(testnet.contact(0)),
        Err(Error::Rpc(_))
    ));
}

#[test]
fn request_envelopes_dispatch_to_handlers() {
    let testnet = Testnet::new(2).unwrap();

    let node = testnet.dhts[0].node();
    let sender_id = testnet.dhts[1].id();
    let sender_protocol = testnet.protocol(1) as Arc<dyn kadmos::Protocol>;

    let request = ServerRequest::new(
        sender_protocol.clone(),
        "virtual",
        sender_id,
        RequestKind::Ping,
    );
    let correlation_id = request.correlation_id;

    let response = node.handle(request).unwrap();
    assert_eq!(response.correlation_id, correlation_id);
    assert!(matches!(
        response.body,
        ResponseBody::Pong(contact) if contact.id == testnet.dhts[0].id()
    ));

    // FindNode without a key is a malformed envelope.
    let request = ServerRequest::new(
        sender_protocol.clone(),
        "virtual",
        sender_id,
        RequestKind::FindNode,
    );
    assert!(matches!(
        node.handle(request),
        Err(Error::MissingRequestKey)
    ));

    // A request from our own id never reaches a handler.
    let request = ServerRequest::new(
        sender_protocol,
        "virtual",
        testnet.dhts[0].id(),
        RequestKind::Ping,
    );
    assert!(matches!(node.handle(request), Err(Error::LoopbackRequest)));
}
