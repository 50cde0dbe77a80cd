//! The client side of the directory service protocol.
//!
//! * [`select`] keeps track of the known directory servers, scores them
//!   by their response times, and picks the one to talk to next.
//! * [`transport`] batches lookups and modifications for many names into
//!   messages, retries them until they are answered, and routes answers
//!   to the [`LookupClient`][transport::LookupClient] and
//!   [`ModifyClient`][transport::ModifyClient] that asked.

pub mod select;
pub mod transport;
