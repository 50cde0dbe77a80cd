//! A client-side resolver for a leased, replicated name service.
//!
//! Agents in a multi-node system find each other through a directory
//! service, the white pages. It maps logical names to typed addresses and
//! lets every agent publish its own addresses under a lease that has to be
//! renewed before it runs out.
//!
//! This crate implements the client side of that service: a resolver that
//! answers lookups from a local cache where it can, merges concurrent
//! requests into single round trips, keeps the local agent's bindings
//! alive, and picks the fastest of the known directory servers. It also
//! finds the directory service in the first place via an external registry.
//!
//! How messages travel between agents is up to the application. It
//! provides an implementation of [`net::MessageTransport`].
//!
//! # Modules
//!
//! * [base] contains the value types of the address book and the messages
//!   exchanged with the directory service,
//! * [resolver] contains the [`Resolver`][resolver::Resolver] and its
//!   handler chain,
//! * [net] contains the transport seam, batching and retrying of messages,
//!   and server selection,
//! * [bootstrap] finds the directory service through an external registry,
//! * [utils] contains small helpers shared by the other modules.
//!
//! # Reference of Feature Flags
//!
//! * `logging`: Enables the
#![cfg_attr(feature = "logging", doc = "  [logging]")]
#![cfg_attr(not(feature = "logging"), doc = "  logging")]
//!   module with a ready-made
//!   [tracing-subscriber](https://github.com/tokio-rs/tracing) setup.
//! * `serde`: Enables serialization of the value types in [base] via
//!   [serde](https://serde.rs/).

#![cfg_attr(docsrs, feature(doc_cfg))]

pub mod base;
pub mod bootstrap;
#[cfg(feature = "logging")]
pub mod logging;
pub mod net;
pub mod resolver;
pub mod utils;
