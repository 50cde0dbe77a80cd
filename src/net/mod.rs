//! Exchanging messages with the directory service.
//!
//! How messages travel is not this crate's business. A
//! [`MessageTransport`] moves [`Message`]s between endpoints named by a
//! [`MessageAddress`][crate::base::MessageAddress] and hands incoming
//! messages to the registered [`MessageHandler`]s.
//!
//! The [`client`] sub-module builds reliable batched request/answer
//! exchanges on top of such a transport.

use std::sync::Weak;

use crate::base::Message;

pub mod client;

//------------ MessageTransport ----------------------------------------------

/// Moves messages between endpoints.
///
/// Delivery is unreliable: messages may be lost, delayed, or delivered
/// more than once. Callers retry on their own.
pub trait MessageTransport: Send + Sync {
    /// Sends a message without waiting for anything.
    ///
    /// Queries are addressed via their target, answers via theirs.
    fn send(&self, message: Message);

    /// Registers a handler for incoming messages.
    ///
    /// The transport only keeps a weak reference and drops handlers that
    /// have gone away.
    fn register_handler(&self, handler: Weak<dyn MessageHandler>);
}

//------------ MessageHandler ------------------------------------------------

/// Receives incoming messages.
pub trait MessageHandler: Send + Sync {
    /// Processes a message.
    ///
    /// This is called on the transport's task and must not block.
    fn receive(&self, message: Message);
}
