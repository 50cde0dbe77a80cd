//! Merging of duplicate requests and per-request timeouts.
//!
//! The batch handler is the first stage of the chain. It makes sure that
//! equivalent lookups submitted while one is outstanding share a single
//! round trip, it turns single-type lookups into lookups of all entries
//! of a name so they can be cached, and it enforces the timeout of every
//! request.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::base::{AddressEntry, VERSION_TYPE};

use super::handler::Handler;
use super::request::{Error, Outcome, Reply, Request, RequestKey, Response};

//------------ Config ---------------------------------------------------------

/// Configuration of the batch handler.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// The timeout of requests that do not set their own.
    default_timeout: Option<Duration>,
}

impl Config {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the timeout of requests that do not set their own.
    ///
    /// The default is to wait forever.
    pub fn set_default_timeout(&mut self, value: Option<Duration>) {
        self.default_timeout = value
    }

    /// Returns the default timeout.
    pub fn default_timeout(&self) -> Option<Duration> {
        self.default_timeout
    }
}

//------------ BatchHandler ---------------------------------------------------

/// Merges equivalent lookups into one round trip.
pub struct BatchHandler {
    /// The configuration.
    config: Config,

    /// The name of the local agent.
    agent: Arc<str>,

    /// A weak reference to ourselves for callbacks.
    me: Weak<Self>,

    /// The mutable state.
    inner: Mutex<Inner>,
}

#[derive(Default)]
struct Inner {
    /// Outstanding lookups and the responses waiting for them.
    pending: HashMap<RequestKey, Vec<Waiter>>,

    /// Binds submitted but not yet acknowledged, keyed by name and type.
    binds: HashMap<(String, String), AddressEntry>,

    /// The version entries bound for the local agent.
    versions: HashMap<String, AddressEntry>,
}

/// A response waiting for an outstanding lookup.
struct Waiter {
    /// The caller's response.
    response: Response,

    /// The type the caller asked for if the lookup was promoted.
    typ: Option<String>,
}

impl Waiter {
    /// Resolves the caller's response from the outstanding lookup's result.
    fn resolve(self, result: &Outcome) {
        let result = match (self.typ, result) {
            (Some(typ), Ok(Reply::Entries(entries))) => {
                Ok(Reply::Entry(entries.get(&typ).cloned()))
            }
            (_, result) => result.clone(),
        };
        self.response.set_result(result);
    }
}

impl BatchHandler {
    /// Creates a new handler for the local `agent`.
    pub fn new(agent: Arc<str>, config: Config) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| Self {
            config,
            agent,
            me: me.clone(),
            inner: Default::default(),
        })
    }

    /// Returns the number of outstanding lookups.
    pub fn pending(&self) -> usize {
        self.inner.lock().pending.len()
    }

    /// Starts the timeout of a request.
    fn start_timer(&self, response: &Response) {
        let timeout = match response
            .request()
            .timeout()
            .or(self.config.default_timeout)
        {
            Some(timeout) => timeout,
            None => return,
        };
        let me = self.me.clone();
        let timed = response.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if timed.set_result(Err(Error::Timeout)) {
                debug!("{} timed out", timed.request());
                if let Some(me) = me.upgrade() {
                    me.forget_resolved(&timed.request().key());
                }
            }
        });
        response.on_complete(move |_| handle.abort());
    }

    /// Answers a lookup from binds made by this node.
    fn local_answer(&self, name: &str, typ: &str) -> Option<AddressEntry> {
        let inner = self.inner.lock();
        if let Some(entry) = inner.binds.get(&(name.into(), typ.into())) {
            return Some(entry.clone());
        }
        if typ == VERSION_TYPE && name == self.agent.as_ref() {
            return inner.versions.get(name).cloned();
        }
        None
    }

    /// Adds a lookup to an outstanding one or starts a new one.
    ///
    /// Returns the response to forward down the chain if a new lookup was
    /// started.
    fn batch(
        &self,
        key: RequestKey,
        forward: Request,
        waiter: Waiter,
    ) -> Option<Response> {
        {
            let mut inner = self.inner.lock();
            match inner.pending.entry(key.clone()) {
                Entry::Occupied(mut waiters) => {
                    trace!("merging {} into outstanding lookup", forward);
                    waiters.get_mut().push(waiter);
                    return None;
                }
                Entry::Vacant(slot) => {
                    slot.insert(vec![waiter]);
                }
            }
        }
        let forward = Response::new(forward);
        let me = self.me.clone();
        forward.on_complete(move |result| {
            if let Some(me) = me.upgrade() {
                me.complete(&key, result)
            }
        });
        Some(forward)
    }

    /// Resolves everyone waiting for the lookup with `key`.
    fn complete(&self, key: &RequestKey, result: &Outcome) {
        let waiters = self.inner.lock().pending.remove(key);
        for waiter in waiters.into_iter().flatten() {
            waiter.resolve(result)
        }
    }

    /// Drops an outstanding lookup once all its waiters have given up.
    fn forget_resolved(&self, key: &RequestKey) {
        let key = match key {
            RequestKey::Get(name, _) => RequestKey::GetAll(name.clone()),
            key => key.clone(),
        };
        let mut inner = self.inner.lock();
        if let Some(waiters) = inner.pending.get(&key) {
            if waiters.iter().all(|waiter| waiter.response.is_available()) {
                trace!("dropping abandoned lookup {key:?}");
                inner.pending.remove(&key);
            }
        }
    }
}

impl Handler for BatchHandler {
    fn submit(&self, response: Response) -> Option<Response> {
        self.start_timer(&response);
        match response.request().clone() {
            Request::Get {
                name,
                typ,
                use_cache,
                timeout,
            } => {
                if let Some(entry) = self.local_answer(&name, &typ) {
                    trace!("answering {} from local binds", response.request());
                    response.set_result(Ok(Reply::Entry(Some(entry))));
                    return Some(response);
                }
                let key = RequestKey::GetAll(name.clone());
                let forward = Request::GetAll {
                    name,
                    use_cache,
                    timeout,
                };
                self.batch(
                    key,
                    forward,
                    Waiter {
                        response,
                        typ: Some(typ),
                    },
                )
            }
            request @ (Request::GetAll { .. } | Request::List { .. }) => self
                .batch(
                    request.key(),
                    request,
                    Waiter {
                        response,
                        typ: None,
                    },
                ),
            Request::Bind { entry, .. } => {
                self.inner.lock().binds.insert(
                    (entry.name().into(), entry.typ().into()),
                    entry.clone(),
                );
                Some(response)
            }
            Request::Unbind { entry, .. } => {
                let mut inner = self.inner.lock();
                let key = (entry.name().to_string(), entry.typ().to_string());
                if inner.binds.get(&key) == Some(&entry) {
                    inner.binds.remove(&key);
                }
                drop(inner);
                Some(response)
            }
        }
    }

    fn execute(
        &self,
        request: &Request,
        result: &Outcome,
        _ttl: Option<Instant>,
    ) {
        match request {
            Request::GetAll { .. } | Request::List { .. } => {
                self.complete(&request.key(), result)
            }
            Request::Bind { entry, .. } => {
                let mut inner = self.inner.lock();
                let key = (entry.name().to_string(), entry.typ().to_string());
                if inner.binds.get(&key) == Some(entry) {
                    inner.binds.remove(&key);
                }
                if result.is_ok()
                    && entry.typ() == VERSION_TYPE
                    && entry.name() == self.agent.as_ref()
                {
                    inner
                        .versions
                        .insert(entry.name().into(), entry.clone());
                }
            }
            Request::Unbind { entry, .. } => {
                let mut inner = self.inner.lock();
                if inner.versions.get(entry.name()) == Some(entry) {
                    inner.versions.remove(entry.name());
                }
            }
            Request::Get { .. } => {}
        }
    }

    fn shutdown(&self) {
        let pending = std::mem::take(&mut self.inner.lock().pending);
        for waiter in pending.into_values().flatten() {
            waiter.response.set_result(Err(Error::Shutdown));
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::entry_map;

    fn handler() -> Arc<BatchHandler> {
        BatchHandler::new("node1".into(), Config::new())
    }

    #[tokio::test]
    async fn get_is_promoted() {
        let batch = handler();
        let response = Response::new(Request::get("AgentX", "-RMI"));
        let forward = batch.submit(response.clone()).unwrap();
        assert_eq!(forward.request(), &Request::get_all("AgentX"));

        let entry = AddressEntry::new("AgentX", "-RMI", "rmi://x");
        forward.set_result(Ok(Reply::Entries(entry_map([entry.clone()]))));
        assert_eq!(response.result(), Some(Ok(Reply::Entry(Some(entry)))));
    }

    #[tokio::test]
    async fn duplicates_share_one_lookup() {
        let batch = handler();
        let first = Response::new(Request::get_all("AgentX"));
        let second = Response::new(Request::get_all("AgentX").bypass_cache());
        let third = Response::new(Request::get("AgentX", "-TCP"));
        assert!(batch.submit(first.clone()).is_some());
        assert!(batch.submit(second.clone()).is_none());
        assert!(batch.submit(third.clone()).is_none());
        assert_eq!(batch.pending(), 1);

        batch.execute(
            &Request::get_all("AgentX"),
            &Ok(Reply::Entries(Default::default())),
            None,
        );
        assert_eq!(first.result(), Some(Ok(Reply::Entries(Default::default()))));
        assert_eq!(second.result(), first.result());
        assert_eq!(third.result(), Some(Ok(Reply::Entry(None))));
        assert_eq!(batch.pending(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts() {
        let batch = handler();
        let response = Response::new(
            Request::get_all("AgentX").with_timeout(Duration::from_secs(2)),
        );
        assert!(batch.submit(response.clone()).is_some());
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!response.is_available());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(response.result(), Some(Err(Error::Timeout)));
        assert_eq!(batch.pending(), 0);
    }

    #[tokio::test]
    async fn pending_bind_answers_get() {
        let batch = handler();
        let entry = AddressEntry::new("AgentX", "-RMI", "rmi://x");
        batch.submit(Response::new(Request::bind(entry.clone())));
        let response = Response::new(Request::get("AgentX", "-RMI"));
        let answered = batch.submit(response.clone()).unwrap();
        assert!(answered.ptr_eq(&response));
        assert_eq!(response.result(), Some(Ok(Reply::Entry(Some(entry)))));
    }

    #[tokio::test]
    async fn local_version() {
        let batch = handler();
        let version = AddressEntry::new("node1", VERSION_TYPE, "1.2");
        batch.submit(Response::new(Request::bind(version.clone())));
        batch.execute(
            &Request::bind(version.clone()),
            &Ok(Reply::Bound {
                expires: Instant::now(),
            }),
            None,
        );
        let response = Response::new(Request::get("node1", VERSION_TYPE));
        batch.submit(response.clone());
        assert_eq!(response.result(), Some(Ok(Reply::Entry(Some(version)))));
    }

    #[tokio::test]
    async fn shutdown_resolves_waiters() {
        let batch = handler();
        let response = Response::new(Request::list("agents"));
        batch.submit(response.clone());
        batch.shutdown();
        assert_eq!(response.result(), Some(Err(Error::Shutdown)));
    }
}
