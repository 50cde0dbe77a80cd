//! Ordering of binds and unbinds per name and type.
//!
//! At most one bind or unbind per name and type is on its way to the lease
//! manager at any time. A request identical to the one in flight is folded
//! into it and shares its result. A different request supersedes it: the
//! callers waiting for the earlier request learn that they lost and the new
//! request goes ahead.
//!
//! A bind of a different entry than the acknowledged one without
//! `overwrite` is an exception. The lease manager refuses it, so it neither
//! supersedes nor waits for the request in flight.

use std::collections::HashMap;
use std::mem;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::base::AddressEntry;

use super::handler::Handler;
use super::request::{Error, Outcome, Reply, Request, Response};

//------------ LeaseHandler ---------------------------------------------------

/// Serializes binds and unbinds of the same name and type.
#[derive(Default)]
pub struct LeaseHandler {
    slots: Mutex<HashMap<(String, String), Slot>>,
}

#[derive(Default)]
struct Slot {
    /// The acknowledged entry and when its lease expires.
    current: Option<(AddressEntry, Instant)>,

    /// The request in flight.
    in_flight: Option<Request>,

    /// The responses waiting for the request in flight.
    waiters: Vec<Response>,

    /// Binds passed on without becoming the request in flight.
    refused: Vec<Response>,
}

impl Slot {
    fn is_empty(&self) -> bool {
        self.current.is_none()
            && self.in_flight.is_none()
            && self.refused.is_empty()
    }

    /// Returns whether the lease manager will refuse `request`.
    fn refuses(&self, request: &Request) -> bool {
        match (request, &self.current) {
            (
                Request::Bind {
                    entry, overwrite, ..
                },
                Some((current, _)),
            ) => !overwrite && current != entry,
            _ => false,
        }
    }
}

impl LeaseHandler {
    /// Creates a new lease handler.
    pub fn new() -> Self {
        Default::default()
    }

    /// Returns the acknowledged entry of a name and type.
    pub fn current(&self, name: &str, typ: &str) -> Option<(AddressEntry, Instant)> {
        self.slots
            .lock()
            .get(&(name.into(), typ.into()))
            .and_then(|slot| slot.current.clone())
    }

    /// Returns the number of requests in flight.
    pub fn in_flight(&self) -> usize {
        self.slots
            .lock()
            .values()
            .filter(|slot| slot.in_flight.is_some())
            .count()
    }
}

impl Handler for LeaseHandler {
    fn submit(&self, response: Response) -> Option<Response> {
        let entry = match response.request() {
            Request::Bind { entry, .. } | Request::Unbind { entry, .. } => {
                entry.clone()
            }
            _ => return Some(response),
        };
        let request = response.request().clone();
        let superseded = {
            let mut slots = self.slots.lock();
            let slot = slots
                .entry((entry.name().into(), entry.typ().into()))
                .or_default();
            match &slot.in_flight {
                Some(in_flight) if in_flight.key() == request.key() => {
                    trace!("folding {request} into the one in flight");
                    slot.waiters.push(response);
                    return None;
                }
                _ if slot.refuses(&request) => {
                    trace!("{request} conflicts with the acknowledged entry");
                    slot.refused.push(response.clone());
                    return Some(response);
                }
                Some(in_flight) => {
                    debug!("{request} supersedes {in_flight}");
                }
                None => {}
            }
            slot.in_flight = Some(request.clone());
            mem::replace(&mut slot.waiters, vec![response.clone()])
        };
        for waiter in superseded {
            waiter.set_result(Err(Error::Superseded(Box::new(request.clone()))));
        }
        Some(response)
    }

    fn execute(
        &self,
        request: &Request,
        result: &Outcome,
        _ttl: Option<Instant>,
    ) {
        let entry = match request {
            Request::Bind { entry, .. } | Request::Unbind { entry, .. } => entry,
            _ => return,
        };
        let waiters = {
            let mut slots = self.slots.lock();
            let key = (entry.name().to_string(), entry.typ().to_string());
            let slot = match slots.get_mut(&key) {
                Some(slot) => slot,
                None => return,
            };
            let answered = slot
                .in_flight
                .as_ref()
                .map(|in_flight| in_flight.key() == request.key())
                .unwrap_or(false);
            let is_current = slot
                .current
                .as_ref()
                .map(|(current, _)| current == entry)
                .unwrap_or(false);
            // A server denial drops the whole lease, a local refusal
            // never is the request in flight.
            match (request, result) {
                (Request::Bind { .. }, Ok(Reply::Bound { expires })) => {
                    if answered || is_current {
                        slot.current = Some((entry.clone(), *expires));
                    }
                }
                (Request::Bind { .. }, Err(_)) if answered || is_current => {
                    slot.current = None;
                }
                (Request::Unbind { .. }, _) if answered || is_current => {
                    slot.current = None;
                }
                _ => {}
            }
            let mut waiters = if answered {
                slot.in_flight = None;
                mem::take(&mut slot.waiters)
            } else {
                Vec::new()
            };
            let request_key = request.key();
            let (refused, kept): (Vec<_>, Vec<_>) = mem::take(&mut slot.refused)
                .into_iter()
                .partition(|waiter: &Response| waiter.request().key() == request_key);
            slot.refused = kept;
            waiters.extend(refused);
            if slot.is_empty() {
                slots.remove(&key);
            }
            waiters
        };
        for waiter in waiters {
            waiter.set_result(result.clone());
        }
    }

    fn shutdown(&self) {
        let slots = mem::take(&mut *self.slots.lock());
        let waiters = slots
            .into_values()
            .flat_map(|slot| slot.waiters.into_iter().chain(slot.refused));
        for waiter in waiters {
            waiter.set_result(Err(Error::Shutdown));
        }
    }
}

//============ Testing =======================================================
