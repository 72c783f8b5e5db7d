//! Pixcache.
//!
//! Command line frontend of the pixcache image loader. It loads images through the same memory
//! cache, durable store and fetcher an embedding application would use, and reports how each
//! image was resolved.

#![warn(missing_debug_implementations, unused_crate_dependencies, clippy::all)]

mod cli;
mod slot;

fn main() {
    match cli::execute() {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            pixcache_service::logging::ensure_log_error(&error);
            std::process::exit(1);
        }
    }
}
