//! Requests to the resolver and their asynchronous responses.
//!
//! A caller submits a [`Request`] and gets back a [`Response`]. The
//! response is resolved exactly once, either right away from local state
//! or later when the directory service answered. Callers can poll it,
//! register a callback, or await it.

use std::collections::BTreeSet;
use std::error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::base::{AddressEntry, EntryMap, LeaseDenied};

//------------ Request -------------------------------------------------------

/// A request to the resolver.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Request {
    /// Look up the entry of one type of a name.
    Get {
        /// The name to look up.
        name: String,

        /// The type of entry wanted.
        typ: String,

        /// Whether a cached answer is acceptable.
        use_cache: bool,

        /// How long the caller is willing to wait.
        timeout: Option<Duration>,
    },

    /// Look up all entries of a name.
    GetAll {
        /// The name to look up.
        name: String,

        /// Whether a cached answer is acceptable.
        use_cache: bool,

        /// How long the caller is willing to wait.
        timeout: Option<Duration>,
    },

    /// List the names ending in a suffix.
    List {
        /// The suffix, starting with a dot.
        suffix: String,

        /// Whether a cached answer is acceptable.
        use_cache: bool,

        /// How long the caller is willing to wait.
        timeout: Option<Duration>,
    },

    /// Bind an entry under a lease.
    Bind {
        /// The entry to bind.
        entry: AddressEntry,

        /// Whether to replace a different entry bound for the same type.
        overwrite: bool,

        /// Whether to keep renewing the lease.
        renewal: bool,

        /// The identity the binding is made for, if not the local agent.
        requester: Option<Arc<str>>,

        /// How long the caller is willing to wait.
        timeout: Option<Duration>,
    },

    /// Remove a bound entry.
    Unbind {
        /// The entry to remove.
        entry: AddressEntry,

        /// How long the caller is willing to wait.
        timeout: Option<Duration>,
    },
}

impl Request {
    /// Creates a lookup of one type of a name.
    pub fn get(name: impl Into<String>, typ: impl Into<String>) -> Self {
        Request::Get {
            name: name.into(),
            typ: typ.into(),
            use_cache: true,
            timeout: None,
        }
    }

    /// Creates a lookup of all entries of a name.
    pub fn get_all(name: impl Into<String>) -> Self {
        Request::GetAll {
            name: name.into(),
            use_cache: true,
            timeout: None,
        }
    }

    /// Creates a listing of the names ending in `suffix`.
    ///
    /// A leading dot is added if missing.
    pub fn list(suffix: impl Into<String>) -> Self {
        let mut suffix = suffix.into();
        if !suffix.starts_with('.') {
            suffix.insert(0, '.');
        }
        Request::List {
            suffix,
            use_cache: true,
            timeout: None,
        }
    }

    /// Creates a renewed bind that does not overwrite other bindings.
    pub fn bind(entry: AddressEntry) -> Self {
        Request::Bind {
            entry,
            overwrite: false,
            renewal: true,
            requester: None,
            timeout: None,
        }
    }

    /// Creates an unbind.
    pub fn unbind(entry: AddressEntry) -> Self {
        Request::Unbind {
            entry,
            timeout: None,
        }
    }

    /// Sets how long the caller is willing to wait.
    pub fn with_timeout(mut self, value: Duration) -> Self {
        match &mut self {
            Request::Get { timeout, .. }
            | Request::GetAll { timeout, .. }
            | Request::List { timeout, .. }
            | Request::Bind { timeout, .. }
            | Request::Unbind { timeout, .. } => *timeout = Some(value),
        }
        self
    }

    /// Makes a lookup skip the cache.
    ///
    /// Has no effect on binds and unbinds.
    pub fn bypass_cache(mut self) -> Self {
        match &mut self {
            Request::Get { use_cache, .. }
            | Request::GetAll { use_cache, .. }
            | Request::List { use_cache, .. } => *use_cache = false,
            Request::Bind { .. } | Request::Unbind { .. } => {}
        }
        self
    }

    /// Sets whether a bind replaces a different binding.
    pub fn overwrite(mut self, value: bool) -> Self {
        if let Request::Bind { overwrite, .. } = &mut self {
            *overwrite = value
        }
        self
    }

    /// Sets whether a bind is renewed.
    pub fn renewal(mut self, value: bool) -> Self {
        if let Request::Bind { renewal, .. } = &mut self {
            *renewal = value
        }
        self
    }

    /// Sets the identity a bind is made for.
    pub fn requester(mut self, value: impl Into<Arc<str>>) -> Self {
        if let Request::Bind { requester, .. } = &mut self {
            *requester = Some(value.into())
        }
        self
    }

    /// Returns how long the caller is willing to wait.
    pub fn timeout(&self) -> Option<Duration> {
        match self {
            Request::Get { timeout, .. }
            | Request::GetAll { timeout, .. }
            | Request::List { timeout, .. }
            | Request::Bind { timeout, .. }
            | Request::Unbind { timeout, .. } => *timeout,
        }
    }

    /// Returns whether a cached answer is acceptable.
    ///
    /// Always false for binds and unbinds.
    pub fn use_cache(&self) -> bool {
        match self {
            Request::Get { use_cache, .. }
            | Request::GetAll { use_cache, .. }
            | Request::List { use_cache, .. } => *use_cache,
            Request::Bind { .. } | Request::Unbind { .. } => false,
        }
    }

    /// Returns the name or suffix the request is about.
    pub fn name(&self) -> &str {
        match self {
            Request::Get { name, .. } | Request::GetAll { name, .. } => name,
            Request::List { suffix, .. } => suffix,
            Request::Bind { entry, .. } | Request::Unbind { entry, .. } => {
                entry.name()
            }
        }
    }

    /// Returns the key identifying equivalent requests.
    ///
    /// Requests with equal keys are answered by the same round trip.
    /// Flags and timeouts are not part of the key.
    pub fn key(&self) -> RequestKey {
        match self {
            Request::Get { name, typ, .. } => {
                RequestKey::Get(name.clone(), typ.clone())
            }
            Request::GetAll { name, .. } => RequestKey::GetAll(name.clone()),
            Request::List { suffix, .. } => RequestKey::List(suffix.clone()),
            Request::Bind { entry, .. } => RequestKey::Bind(entry.clone()),
            Request::Unbind { entry, .. } => {
                RequestKey::Unbind(entry.clone())
            }
        }
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Request::Get { name, typ, .. } => write!(f, "get {name} {typ}"),
            Request::GetAll { name, .. } => write!(f, "get-all {name}"),
            Request::List { suffix, .. } => write!(f, "list {suffix}"),
            Request::Bind { entry, .. } => write!(f, "bind {entry}"),
            Request::Unbind { entry, .. } => write!(f, "unbind {entry}"),
        }
    }
}

//------------ RequestKey ----------------------------------------------------

/// The identity of a request for the purpose of merging duplicates.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub enum RequestKey {
    /// A lookup of one type of a name.
    Get(String, String),

    /// A lookup of all entries of a name.
    GetAll(String),

    /// A listing of a suffix.
    List(String),

    /// A bind of an entry.
    Bind(AddressEntry),

    /// An unbind of an entry.
    Unbind(AddressEntry),
}

//------------ Reply ---------------------------------------------------------

/// The successful result of a request.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Reply {
    /// The entry of a `Get`, `None` if the name has no such type.
    Entry(Option<AddressEntry>),

    /// The entries of a `GetAll`, empty if the name is not bound.
    Entries(EntryMap),

    /// The names of a `List`.
    Names(BTreeSet<String>),

    /// A bind was granted until the given time.
    Bound {
        /// When the lease expires unless renewed.
        expires: Instant,
    },

    /// An unbind was acknowledged.
    Unbound,
}

//------------ Error ---------------------------------------------------------

/// The reasons a request can fail.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Error {
    /// No result arrived within the request's timeout.
    Timeout,

    /// The directory service refused the binding.
    Denied(LeaseDenied),

    /// A later request for the same binding replaced this one.
    Superseded(Box<Request>),

    /// The resolver was shut down before a result arrived.
    Shutdown,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Timeout => f.write_str("request timed out"),
            Error::Denied(denied) => write!(f, "{denied}"),
            Error::Superseded(by) => write!(f, "superseded by {by}"),
            Error::Shutdown => f.write_str("resolver shut down"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Denied(denied) => Some(denied),
            Error::Timeout | Error::Superseded(_) | Error::Shutdown => None,
        }
    }
}

/// The result of a request.
pub type Outcome = Result<Reply, Error>;

//------------ Response ------------------------------------------------------

/// A callback run when a response is resolved.
type Callback = Box<dyn FnOnce(&Outcome) + Send>;

/// The pending or available result of a request.
///
/// Responses are cheap to clone; all clones share the same result. The
/// first call to [`set_result`][Self::set_result] wins, later calls are
/// no-ops that return `false`.
#[derive(Clone)]
pub struct Response {
    inner: Arc<Inner>,
}

struct Inner {
    /// The request this is the response to.
    request: Request,

    /// The result and the callbacks waiting for it.
    state: Mutex<State>,

    /// Wakes tasks awaiting the result.
    notify: Notify,
}

#[derive(Default)]
struct State {
    result: Option<Outcome>,
    callbacks: Vec<Callback>,
}

impl Response {
    /// Creates a new, unresolved response to `request`.
    pub fn new(request: Request) -> Self {
        Self {
            inner: Arc::new(Inner {
                request,
                state: Mutex::new(State::default()),
                notify: Notify::new(),
            }),
        }
    }

    /// Returns the request.
    pub fn request(&self) -> &Request {
        &self.inner.request
    }

    /// Returns whether the result is available.
    pub fn is_available(&self) -> bool {
        self.inner.state.lock().result.is_some()
    }

    /// Returns the result if it is available.
    pub fn result(&self) -> Option<Outcome> {
        self.inner.state.lock().result.clone()
    }

    /// Resolves the response.
    ///
    /// Returns `false` and drops `result` if the response was resolved
    /// before. Callbacks run on the calling thread after the lock has been
    /// released.
    pub fn set_result(&self, result: Outcome) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            if state.result.is_some() {
                return false;
            }
            state.result = Some(result.clone());
            std::mem::take(&mut state.callbacks)
        };
        self.inner.notify.notify_waiters();
        for callback in callbacks {
            callback(&result)
        }
        true
    }

    /// Registers a callback for the result.
    ///
    /// If the result is already available, the callback runs right away.
    pub fn on_complete(&self, callback: impl FnOnce(&Outcome) + Send + 'static) {
        let result = {
            let mut state = self.inner.state.lock();
            match &state.result {
                Some(result) => result.clone(),
                None => {
                    state.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&result)
    }

    /// Waits for the result.
    pub async fn wait(&self) -> Outcome {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if let Some(result) = self.result() {
                return result;
            }
            notified.await;
        }
    }

    /// Returns whether both values are handles to the same response.
    pub fn ptr_eq(&self, other: &Response) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Response {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Response")
            .field("request", &self.inner.request)
            .field("result", &self.inner.state.lock().result)
            .finish()
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn list_adds_dot() {
        assert_eq!(Request::list("agents").name(), ".agents");
        assert_eq!(Request::list(".agents").name(), ".agents");
    }

    #[test]
    fn key_ignores_flags() {
        let a = Request::get_all("AgentX");
        let b = Request::get_all("AgentX")
            .bypass_cache()
            .with_timeout(Duration::from_secs(1));
        assert_ne!(a, b);
        assert_eq!(a.key(), b.key());
    }

    #[test]
    fn first_result_wins() {
        let response = Response::new(Request::get_all("AgentX"));
        assert!(!response.is_available());
        assert!(response.set_result(Err(Error::Timeout)));
        assert!(!response.set_result(Ok(Reply::Entries(EntryMap::new()))));
        assert_eq!(response.result(), Some(Err(Error::Timeout)));
    }

    #[test]
    fn callbacks_run_once() {
        let count = Arc::new(AtomicUsize::new(0));
        let response = Response::new(Request::get_all("AgentX"));
        let early = count.clone();
        response.on_complete(move |_| {
            early.fetch_add(1, Ordering::SeqCst);
        });
        response.set_result(Ok(Reply::Unbound));
        response.set_result(Ok(Reply::Unbound));
        assert_eq!(count.load(Ordering::SeqCst), 1);

        let late = count.clone();
        response.on_complete(move |result| {
            assert_eq!(result, &Ok(Reply::Unbound));
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn wait_for_result() {
        let response = Response::new(Request::get_all("AgentX"));
        let waiter = response.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        tokio::task::yield_now().await;
        response.set_result(Ok(Reply::Unbound));
        assert_eq!(task.await.unwrap(), Ok(Reply::Unbound));
    }
}
