#![doc = include_str!("../README.md")]

// Modules
mod bucket_list;
mod common;
mod config;
mod dht;
mod error;
mod kbucket;
mod node;
mod protocol;
mod router;
mod snapshot;
mod storage;
pub mod testnet;

// Public API
pub use crate::bucket_list::{Admission, BucketList, DEFAULT_B};
pub use crate::common::{BucketRange, Contact, Distance, Id, ID_BITS, ID_SIZE, STALE_AFTER};
pub use crate::config::{Config, DEFAULT_ALPHA, DEFAULT_EVICTION_LIMIT, DEFAULT_EXPIRATION_SECS};
pub use crate::dht::Dht;
pub use crate::error::Error;
pub use crate::kbucket::{KBucket, DEFAULT_K};
pub use crate::node::{Node, RequestKind, ResponseBody, ServerRequest, ServerResponse};
pub use crate::protocol::{FindValueReply, Protocol, RpcError};
pub use crate::router::{Lookup, LookupResult, ParallelRouter, Router, RpcCall};
pub use crate::snapshot::Snapshot;
pub use crate::storage::{MemoryStore, Storage, StoreValue};

// Re-exports
pub use bytes::Bytes;

/// Alias for the crate-wide Result type.
pub type Result<T> = std::result::Result<T, Error>;
