//! The parameter-store side of sparsefleet.
//!
//! A [`Shard`] owns the entries for one contiguous range of the key space
//! and applies the configured update handler per key; it can be driven
//! embedded (direct method calls) or free-standing behind the
//! [`ShardService`] gRPC surface. The [`KvClient`] routes ascending key
//! vectors to shards, fans out concurrently and reassembles responses in
//! key order. The [`codec`] module implements the three transport filters:
//! fixed-byte float quantization, payload compression and key caching.

pub mod client;
pub mod codec;
pub mod reporter;
pub mod service;
pub mod shard;

pub use client::{KvClient, TransportOpts};
pub use reporter::TimeReporter;
pub use service::{serve_shard, ShardHandle, ShardService};
pub use shard::{AnyShard, Shard};
