//! The resolver and its handler chain.
//!
//! A [`Resolver`] answers [`Request`]s about the white pages: which
//! addresses a name is bound to, which names exist under a suffix, and
//! binding or unbinding the local agent's own entries. Every request
//! passes through a fixed chain of [handlers][Handler]:
//!
//! * the [batch handler][batch] merges equivalent lookups, answers from
//!   binds still in flight, and enforces timeouts,
//! * the caches for [entries] and [lists] answer lookups locally,
//! * the [lease handler][lease_handler] allows one bind or unbind per name
//!   and type at a time,
//! * the [remote handler][remote] sends the rest to the directory service
//!   via the [client transport][crate::net::client::transport] or the
//!   [lease manager][lease_manager].
//!
//! Results from the directory service are broadcast to all handlers so
//! each can update its own state. Callers only ever see the [`Response`]
//! they got from [`Resolver::submit`].
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use whitepages::net::MessageTransport;
//! use whitepages::resolver::{Config, Request, Resolver};
//!
//! # async fn run(transport: Arc<dyn MessageTransport>) {
//! let resolver = Resolver::new("node1".into(), transport, Config::default());
//! let response = resolver.submit(Request::get("AgentX", "-RMI"));
//! match response.wait().await {
//!     Ok(reply) => println!("{reply:?}"),
//!     Err(err) => eprintln!("{err}"),
//! }
//! # }
//! ```

use std::sync::{Arc, Weak};
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::trace;

use crate::base::{AddressEntry, CounterUids, UidService};
use crate::net::client::select::{self, SelectManager};
use crate::net::client::transport::{self, ClientTransport};
use crate::net::MessageTransport;

use self::batch::BatchHandler;
use self::entries::CacheEntriesHandler;
use self::lease_handler::LeaseHandler;
use self::lease_manager::LeaseManager;
use self::lists::CacheListsHandler;
use self::remote::RemoteHandler;

pub use self::handler::{BindObserver, BindSource, Dispatch, Handler, HintService};
pub use self::request::{Error, Outcome, Reply, Request, RequestKey, Response};

pub mod batch;
pub mod cache;
pub mod entries;
pub mod handler;
pub mod lease_handler;
pub mod lease_manager;
pub mod lists;
pub mod remote;
pub mod request;

//------------ Config ---------------------------------------------------------

/// Configuration of a resolver and all its components.
#[derive(Clone, Debug, Default)]
pub struct Config {
    /// The batch handler.
    pub batch: batch::Config,

    /// The cache for entries of names.
    pub entries: cache::Config,

    /// The cache for listings.
    pub lists: cache::Config,

    /// The lease manager.
    pub lease: lease_manager::Config,

    /// The remote handler.
    pub remote: remote::Config,

    /// Server selection.
    pub select: select::Config,

    /// The client transport.
    pub transport: transport::Config,
}

//------------ Resolver -------------------------------------------------------

/// Answers requests through the handler chain.
///
/// The resolver owns all its components. Dropping it resolves every
/// response still waiting with [`Error::Shutdown`] and ends all background
/// tasks.
pub struct Resolver {
    /// The name of the local agent.
    agent: Arc<str>,

    batch: Arc<BatchHandler>,
    entries: Arc<CacheEntriesHandler>,
    lease_handler: Arc<LeaseHandler>,
    lease_manager: Arc<LeaseManager>,
    select: Arc<SelectManager>,
    transport: Arc<ClientTransport>,

    /// The handler chain in order.
    handlers: Vec<Arc<dyn Handler>>,

    /// Who to tell about local bindings.
    observers: Mutex<Vec<Weak<dyn BindObserver>>>,
}

impl Resolver {
    /// Creates a resolver for the local `agent`.
    ///
    /// Record identifiers are issued by a counter owned by `agent` that
    /// starts at the current time in milliseconds. This must be called
    /// from within a Tokio runtime.
    pub fn new(
        agent: Arc<str>,
        transport: Arc<dyn MessageTransport>,
        config: Config,
    ) -> Arc<Self> {
        let start = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|since| since.as_millis() as u64)
            .unwrap_or(1);
        let uids = Arc::new(CounterUids::starting_at(agent.clone(), start));
        Self::with_uids(agent, transport, uids, config)
    }

    /// Creates a resolver with the given source of record identifiers.
    pub fn with_uids(
        agent: Arc<str>,
        transport: Arc<dyn MessageTransport>,
        uids: Arc<dyn UidService>,
        config: Config,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| {
            let dispatch: Weak<dyn Dispatch> = me.clone();
            let select = Arc::new(SelectManager::new(config.select));
            let transport = ClientTransport::new(
                agent.clone(),
                transport,
                select.clone(),
                config.transport,
            );
            let lease_manager = LeaseManager::new(
                agent.clone(),
                transport.clone(),
                uids,
                dispatch.clone(),
                config.lease,
            );
            let batch = BatchHandler::new(agent.clone(), config.batch);
            let entries = Arc::new(CacheEntriesHandler::new(config.entries));
            let lists = Arc::new(CacheListsHandler::new(config.lists));
            let lease_handler = Arc::new(LeaseHandler::new());
            let remote = RemoteHandler::new(
                transport.clone(),
                lease_manager.clone(),
                dispatch,
                config.remote,
            );
            let handlers: Vec<Arc<dyn Handler>> = vec![
                batch.clone(),
                entries.clone(),
                lists,
                lease_handler.clone(),
                remote,
            ];
            let observer: Weak<dyn BindObserver> = Arc::downgrade(&select) as _;
            Self {
                agent,
                batch,
                entries,
                lease_handler,
                lease_manager,
                select,
                transport,
                handlers,
                observers: Mutex::new(vec![observer]),
            }
        })
    }

    /// Returns the name of the local agent.
    pub fn agent(&self) -> &Arc<str> {
        &self.agent
    }

    /// Returns the batch handler.
    pub fn batch(&self) -> &Arc<BatchHandler> {
        &self.batch
    }

    /// Returns the lease handler.
    pub fn lease_handler(&self) -> &Arc<LeaseHandler> {
        &self.lease_handler
    }

    /// Returns the lease manager.
    pub fn lease_manager(&self) -> &Arc<LeaseManager> {
        &self.lease_manager
    }

    /// Returns the server selection.
    pub fn select(&self) -> &Arc<SelectManager> {
        &self.select
    }

    /// Returns the client transport.
    pub fn transport(&self) -> &Arc<ClientTransport> {
        &self.transport
    }

    /// Registers an observer of local binds, unbinds, and hints.
    pub fn add_observer(&self, observer: Weak<dyn BindObserver>) {
        self.observers.lock().push(observer)
    }

    /// Submits a request.
    ///
    /// The returned response may already be available if the request was
    /// answered locally.
    pub fn submit(&self, request: Request) -> Response {
        let response = Response::new(request);
        match response.request() {
            Request::Bind { entry, .. } => {
                self.notify(entry, BindSource::Local, true)
            }
            Request::Unbind { entry, .. } => {
                self.notify(entry, BindSource::Local, false)
            }
            _ => {}
        }
        let mut current = response.clone();
        for handler in &self.handlers {
            current = match handler.submit(current) {
                Some(next) if !next.is_available() => next,
                _ => break,
            };
        }
        response
    }

    /// Tells the observers about a binding.
    fn notify(&self, entry: &AddressEntry, source: BindSource, bound: bool) {
        let observers: Vec<_> = {
            let mut observers = self.observers.lock();
            observers.retain(|observer| observer.strong_count() > 0);
            observers.iter().filter_map(Weak::upgrade).collect()
        };
        for observer in observers {
            if bound {
                observer.bound(entry, source)
            } else {
                observer.unbound(entry, source)
            }
        }
    }
}

impl Dispatch for Resolver {
    fn execute(&self, request: &Request, result: &Outcome, ttl: Option<Instant>) {
        trace!("{request}: {result:?}");
        for handler in &self.handlers {
            handler.execute(request, result, ttl)
        }
    }
}

impl HintService for Resolver {
    fn hint(&self, entry: AddressEntry) {
        self.entries.hint(entry.clone());
        self.notify(&entry, BindSource::Hint, true)
    }

    fn unhint(&self, entry: AddressEntry) {
        self.entries.unhint(&entry);
        self.notify(&entry, BindSource::Hint, false)
    }
}

impl Drop for Resolver {
    fn drop(&mut self) {
        for handler in &self.handlers {
            handler.shutdown()
        }
    }
}

//============ Testing =======================================================
