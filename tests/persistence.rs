//! Snapshots, republishing, expiration sweeps and anti-entropy seeding.

use std::sync::Arc;
use std::time::Duration;

use kadmos::testnet::{Testnet, VirtualProtocol};
use kadmos::{Bytes, Config, Contact, Dht, Error, Id, Protocol, Snapshot};

fn no_maintenance() -> Config {
    Config::default().with_maintenance(false)
}

#[test]
fn snapshot_roundtrip_restores_table_and_storage() {
    let testnet = Testnet::new(3).unwrap();

    let key = Id::from_data(b"persisted");
    let value = Bytes::from_static(b"value");
    testnet.dhts[1].store(key, value.clone()).unwrap();

    let snapshot = testnet.dhts[1].snapshot();
    let bytes = snapshot.to_bytes().unwrap();
    let decoded = Snapshot::from_bytes(&bytes).unwrap();

    let restored = Dht::restore(
        &decoded,
        |endpoint| {
            testnet
                .protocol_by_endpoint(endpoint)
                .ok_or_else(|| Error::UnknownEndpoint(endpoint.to_string()))
        },
        no_maintenance(),
    )
    .unwrap();

    assert_eq!(restored.id(), testnet.dhts[1].id());
    assert_eq!(
        restored.routing_table_size(),
        testnet.dhts[1].routing_table_size()
    );
    assert!(restored.originator_storage().contains(&key));
    assert_eq!(restored.find_value(key).unwrap(), Some(value));

    // The restored protocol handles are live, not placeholders.
    assert!(!restored.find_node(Id::random()).unwrap().is_empty());
}

#[test]
fn restore_fails_on_unknown_endpoint() {
    let testnet = Testnet::new(2).unwrap();
    let snapshot = testnet.dhts[1].snapshot();

    let result = Dht::restore(
        &snapshot,
        |endpoint| Err(Error::UnknownEndpoint(endpoint.to_string())),
        no_maintenance(),
    );

    assert!(matches!(result, Err(Error::UnknownEndpoint(_))));
}

#[test]
fn republish_pushes_aged_entries_to_close_contacts() {
    let config = Config {
        key_republish_interval: Duration::ZERO,
        ..no_maintenance()
    };
    let testnet = Testnet::with_config(3, config).unwrap();

    let key = Id::from_data(b"republished");
    testnet.dhts[0].store(key, Bytes::from_static(b"value")).unwrap();

    assert!(testnet.dhts[1].republish_storage().contains(&key));
    assert!(!testnet.dhts[0].republish_storage().contains(&key));

    // With a zero interval the entry is due immediately; node 1 pushes it
    // back out to its own closest contacts, which include node 0.
    testnet.dhts[1].republish_keys();

    assert!(testnet.dhts[0].republish_storage().contains(&key));
}

#[test]
fn expiration_sweep_clears_dead_entries_but_not_originated_ones() {
    let testnet = Testnet::with_config(2, no_maintenance().with_expiration_secs(0)).unwrap();

    let key = Id::from_data(b"ephemeral");
    testnet.dhts[0].store(key, Bytes::from_static(b"value")).unwrap();

    assert!(testnet.dhts[1].republish_storage().contains(&key));

    testnet.dhts[1].expire_keys();
    assert!(!testnet.dhts[1].republish_storage().contains(&key));

    // Authored values never expire locally.
    testnet.dhts[0].expire_keys();
    assert!(testnet.dhts[0].originator_storage().contains(&key));
}

#[test]
fn new_contact_is_seeded_with_keys_it_is_closest_to() {
    let config = no_maintenance();

    let key = Id::from_data(b"seeded");

    // A far-away holder node and an even farther publisher.
    let holder_id = Id::from_data(b"holder");
    let holder_protocol = Arc::new(VirtualProtocol::new(holder_id));
    let holder = Dht::new(holder_id, holder_protocol.clone(), config.clone());
    holder_protocol.bind(holder.node());

    let publisher_id = Id::from_data(b"publisher");
    let publisher_protocol = Arc::new(VirtualProtocol::new(publisher_id));
    let publisher = Dht::new(publisher_id, publisher_protocol.clone(), config.clone());
    publisher_protocol.bind(publisher.node());

    publisher
        .add_contact(Contact::new(holder_id, holder_protocol.clone()))
        .unwrap();
    publisher.store(key, Bytes::from_static(b"value")).unwrap();

    assert!(holder.republish_storage().contains(&key));

    // A newcomer at the key itself pings the holder and receives the entry
    // without ever asking for it.
    let newcomer_protocol = Arc::new(VirtualProtocol::new(key));
    let newcomer = Dht::new(key, newcomer_protocol.clone(), config);
    newcomer_protocol.bind(newcomer.node());

    holder_protocol
        .ping(&Contact::new(key, newcomer_protocol.clone()))
        .unwrap();

    assert!(newcomer.republish_storage().contains(&key));

    // A second ping from the now-known contact does not re-seed.
    let stores_before = newcomer_protocol.stores().len();
    holder_protocol
        .ping(&Contact::new(key, newcomer_protocol.clone()))
        .unwrap();
    assert_eq!(newcomer_protocol.stores().len(), stores_before);
}
