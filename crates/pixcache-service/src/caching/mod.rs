//! # Caching infrastructure
//!
//! Images are expensive to fetch and expensive to keep around, so they are cached in two
//! layers:
//!
//! - An in-memory layer, the [`MemoryCache`], holding decoded images. It is bounded both by an
//!   entry count and by a byte budget, and evicts least recently used entries first.
//! - A durable layer, the [`Store`], holding the raw bytes of every image that was ever fetched
//!   successfully. [`DiskStore`] is the file system implementation.
//!
//! A load request goes through the following steps:
//! - First, it goes through the in-memory layer. This happens synchronously on the caller's
//!   context and never blocks.
//! - On miss, a background unit reads the raw bytes from the durable store and decodes them.
//! - On miss, it fetches the bytes from the network, stages them in the store, and promotes the
//!   staged write to the final location.
//! - The promoted entry is read back and decoded, exactly like a store hit would be.
//!
//! ## [`ResourceKey`]
//!
//! The [`ResourceKey`] identifies an image across all layers. It is the key of the in-memory
//! cache, of the task registry, and its SHA256 hash forms the file name in the durable store.
//!
//! ## [`LoadError`]
//!
//! Every stage of the resolver chain reports failures as a [`LoadError`]. None of them are
//! fatal: a missing or broken store entry moves on to the network, and a failed fetch just ends
//! the request without a delivery.

mod error;
mod fs;
mod key;
mod memory;

pub use error::{LoadError, LoadResult};
pub use fs::{DiskStore, Store};
pub use key::ResourceKey;
pub use memory::MemoryCache;
