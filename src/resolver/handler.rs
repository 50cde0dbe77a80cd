//! The interfaces between the resolver and its handlers.

use tokio::time::Instant;

use crate::base::AddressEntry;

use super::request::{Outcome, Request, Response};

//------------ Handler -------------------------------------------------------

/// A stage of the resolver's handler chain.
///
/// The resolver passes each submitted request through its handlers in a
/// fixed order until one of them stops it.
pub trait Handler: Send + Sync {
    /// Processes a request on its way down the chain.
    ///
    /// A handler returns one of three things:
    ///
    /// * the response, resolved via [`Response::set_result`], if it
    ///   answered the request itself. The chain stops.
    /// * an unresolved response, which may be a new response for a
    ///   transformed request, to let the next handler continue.
    /// * `None` if it will see to it that the response is resolved later.
    ///   The chain stops.
    fn submit(&self, response: Response) -> Option<Response>;

    /// Learns about the result of a remote round trip.
    ///
    /// This is called on every handler once the directory service
    /// answered, including the handlers that did not send the request. The
    /// `ttl` is the absolute time until which the result may be cached.
    fn execute(
        &self,
        request: &Request,
        result: &Outcome,
        ttl: Option<Instant>,
    ) {
        let _ = (request, result, ttl);
    }

    /// Resolves everything still waiting because the resolver goes away.
    fn shutdown(&self) {}
}

//------------ Dispatch ------------------------------------------------------

/// Delivers the results of remote round trips to all handlers.
pub trait Dispatch: Send + Sync {
    /// Calls [`Handler::execute`] on every handler.
    fn execute(&self, request: &Request, result: &Outcome, ttl: Option<Instant>);
}

//------------ BindObserver --------------------------------------------------

/// Where an observed binding came from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BindSource {
    /// A bind or unbind submitted by a local caller.
    Local,

    /// A local-only hint.
    Hint,
}

/// Observes local binds, unbinds, and hints.
///
/// Observers are told about bindings when they are submitted, not when
/// the directory service acknowledged them. They must not block.
pub trait BindObserver: Send + Sync {
    /// An entry was bound or hinted.
    fn bound(&self, entry: &AddressEntry, source: BindSource);

    /// An entry was unbound or unhinted.
    fn unbound(&self, entry: &AddressEntry, source: BindSource);
}

//------------ HintService ---------------------------------------------------

/// Publishes local-only bindings.
///
/// Hints answer lookups like cached entries but never expire and are never
/// sent to the directory service.
pub trait HintService: Send + Sync {
    /// Adds a hint.
    fn hint(&self, entry: AddressEntry);

    /// Removes a hint.
    fn unhint(&self, entry: AddressEntry);
}
