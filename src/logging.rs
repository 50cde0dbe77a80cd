//! Printing what the resolver does.
//!
//! All components report through [tracing] macros. This module installs a
//! subscriber printing them to stderr for applications that do not bring
//! their own.

use tracing_subscriber::EnvFilter;

/// Sets up logging of events reported by the resolver.
///
/// Use the RUST_LOG environment variable to override the defaults.
///
/// E.g. to enable debug level logging:
///   RUST_LOG=DEBUG
///
/// Or to only see what happens to leases:
///   RUST_LOG=whitepages::resolver::lease_manager=TRACE
///
/// Calling this more than once or after another subscriber was installed
/// is harmless.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_thread_ids(true)
        .without_time()
        .try_init()
        .ok();
}
