//! An asynchronous image loading cache.
//!
//! The [`ImageLoader`](loader::ImageLoader) returns images from memory right away, and loads
//! everything else in the background: first from a durable on-disk store, then from the network.
//! Loaded images are delivered to the display slots that are still interested in them.

#[macro_use]
pub mod metrics;

pub mod caching;
pub mod config;
pub mod decode;
pub mod dispatch;
pub mod download;
pub mod executor;
pub mod loader;
pub mod logging;
pub mod registry;
pub mod utils;
