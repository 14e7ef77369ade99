//! Files split into one shard per storage node, stored and reassembled by a
//! stateless coordinator.
//!
//! Every role speaks the single-exchange framed protocol in [`protocol`]:
//! the [`client::Client`] talks to the [`coordinator::Coordinator`], which fans
//! each request out to the [`storage_node::StorageNode`]s of its
//! [`config::Topology`] and joins on all of them before answering.

pub mod backend;
pub mod blobstore;
pub mod chunker;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod net;
pub mod protocol;
pub mod storage_node;

pub use error::{Error, FanoutError};
