//! A persistent, memory-mapped storage substrate in four layers: a block
//! pool ([`pool`]) carving fixed-unit blocks out of chunked mappings, a
//! paged vector ([`vector`]) giving each block pool an O(1)-addressable
//! sparse array, a double-array trie ([`trie`]) mapping strings to integer
//! IDs, and a blob store ([`blob`]) mapping IDs to arbitrary bytes. The
//! trie and blob store both sit directly on the pool and paged vector; all
//! four share the concurrency discipline in [`sync`].

pub mod blob;
pub mod error;
pub(crate) mod mapping;
pub mod pool;
pub(crate) mod sync;
pub mod trie;
pub mod vector;

pub use blob::{BlobOptions, BlobStore};
pub use error::{Error, FormatError, IoError};
pub use pool::{OpenFlags, Pool, PoolOptions};
pub use trie::{AlreadyPresent, DATrie, KeyId, TrieOptions};
pub use vector::PagedVector;
