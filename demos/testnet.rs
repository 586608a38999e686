//! Spin up an in-memory testnet, store a value, and resolve it from another
//! node, with the engine's tracing output visible.
//!
//! Run with `cargo run --example testnet`.

use kadmos::testnet::Testnet;
use kadmos::{Bytes, Id};
use tracing::{info, Level};

fn main() -> kadmos::Result<()> {
    tracing_subscriber::fmt().with_max_level(Level::DEBUG).init();

    let testnet = Testnet::new(5)?;

    let key = Id::from_data(b"demo-key");
    let value = Bytes::from_static(b"hello from the testnet");

    info!(%key, "Storing value");
    testnet.dhts[0].store(key, value)?;

    let resolved = testnet.dhts[4].find_value(key)?;
    info!(%key, ?resolved, "Resolved value");

    Ok(())
}
