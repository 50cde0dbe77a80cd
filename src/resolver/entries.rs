//! Caching of the entries of names.

use std::collections::HashMap;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::base::{AddressEntry, EntryMap};

use super::cache::{Config, ExpiringCache};
use super::handler::Handler;
use super::request::{Outcome, Reply, Request, Response};

//------------ CacheEntriesHandler -------------------------------------------

/// Answers entry lookups from cached results and local hints.
///
/// Both `Get` and `GetAll` are served from the entries of the name. A
/// name with no entries is cached as well and answers lookups with an
/// empty result.
pub struct CacheEntriesHandler {
    /// The configuration.
    config: Config,

    /// Results received from the directory service.
    cache: ExpiringCache<String, EntryMap>,

    /// Local-only entries. They overlay the cached results and never
    /// expire.
    hints: Mutex<HashMap<String, EntryMap>>,

    /// Serializes read-modify-write updates of cached values.
    update: Mutex<()>,
}

impl CacheEntriesHandler {
    /// Creates a new handler.
    pub fn new(config: Config) -> Self {
        Self {
            cache: ExpiringCache::new(config.max_entries()),
            config,
            hints: Default::default(),
            update: Default::default(),
        }
    }

    /// Adds a local-only entry.
    pub fn hint(&self, entry: AddressEntry) {
        debug!("adding hint {entry}");
        self.hints
            .lock()
            .entry(entry.name().into())
            .or_default()
            .insert(entry.typ().into(), entry);
    }

    /// Removes a local-only entry if it is still current.
    pub fn unhint(&self, entry: &AddressEntry) {
        let mut hints = self.hints.lock();
        if let Some(map) = hints.get_mut(entry.name()) {
            if map.get(entry.typ()) == Some(entry) {
                debug!("removing hint {entry}");
                map.remove(entry.typ());
                if map.is_empty() {
                    hints.remove(entry.name());
                }
            }
        }
    }

    /// Returns the hint for `typ` under `name`.
    fn hinted(&self, name: &str, typ: &str) -> Option<AddressEntry> {
        self.hints.lock().get(name)?.get(typ).cloned()
    }

    /// Returns the entries of `name` available locally.
    ///
    /// Hints alone only answer when the cache may be used. A bypassing
    /// lookup without a fresh cached result goes to the directory service.
    fn lookup(&self, name: &str, use_cache: bool) -> Option<EntryMap> {
        let now = Instant::now();
        let hints = self.hints.lock().get(name).cloned();
        let cached = self.cache.get(&name.to_string(), now).filter(|cached| {
            use_cache
                || now.duration_since(cached.fetched)
                    < self.config.min_bypass_time()
        });
        match (cached, hints) {
            (None, Some(hints)) if use_cache => Some(hints),
            (None, _) => None,
            (Some(cached), None) => Some(cached.value.clone()),
            (Some(cached), Some(hints)) => {
                let mut res = cached.value.clone();
                res.extend(hints);
                Some(res)
            }
        }
    }

    /// Caches the entries of a name until `ttl`.
    fn store(&self, name: &str, entries: &EntryMap, ttl: Instant) {
        let now = Instant::now();
        let expires = ttl.min(now + self.config.max_ttd());
        if expires <= now {
            debug!("not caching expired entries of {name}");
            return;
        }
        trace!("caching {} entries of {name}", entries.len());
        let _guard = self.update.lock();
        self.cache.insert(name.into(), entries.clone(), expires, now);
    }

    /// Patches the cached entries of a name after a successful bind.
    ///
    /// The patched result expires no later than before or than the lease.
    fn bound(&self, entry: &AddressEntry, expires: Instant) {
        let now = Instant::now();
        let key = entry.name().to_string();
        let _guard = self.update.lock();
        if let Some(cached) = self.cache.get(&key, now) {
            let mut entries = cached.value.clone();
            entries.insert(entry.typ().into(), entry.clone());
            let expires = cached.expires.min(expires);
            self.cache.replace(key, entries, expires, &cached);
        }
    }

    /// Patches the cached entries of a name after a successful unbind.
    fn unbound(&self, entry: &AddressEntry) {
        let now = Instant::now();
        let key = entry.name().to_string();
        let _guard = self.update.lock();
        if let Some(cached) = self.cache.get(&key, now) {
            if cached.value.get(entry.typ()) == Some(entry) {
                let mut entries = cached.value.clone();
                entries.remove(entry.typ());
                self.cache.replace(key, entries, cached.expires, &cached);
            }
        }
    }
}

impl Handler for CacheEntriesHandler {
    fn submit(&self, response: Response) -> Option<Response> {
        let reply = match response.request() {
            Request::Get {
                name,
                typ,
                use_cache,
                ..
            } => match self.hinted(name, typ) {
                Some(hint) => Some(Reply::Entry(Some(hint))),
                None => self
                    .lookup(name, *use_cache)
                    .map(|mut entries| Reply::Entry(entries.remove(typ))),
            },
            Request::GetAll {
                name, use_cache, ..
            } => self.lookup(name, *use_cache).map(Reply::Entries),
            _ => None,
        };
        if let Some(reply) = reply {
            trace!("answering {} from cache", response.request());
            response.set_result(Ok(reply));
        }
        Some(response)
    }

    fn execute(
        &self,
        request: &Request,
        result: &Outcome,
        ttl: Option<Instant>,
    ) {
        match (request, result) {
            (Request::GetAll { name, .. }, Ok(Reply::Entries(entries))) => {
                if let Some(ttl) = ttl {
                    self.store(name, entries, ttl)
                }
            }
            (Request::Bind { entry, .. }, Ok(Reply::Bound { expires })) => {
                self.bound(entry, *expires)
            }
            (Request::Unbind { entry, .. }, Ok(Reply::Unbound)) => {
                self.unbound(entry)
            }
            _ => {}
        }
    }
}

//============ Testing =======================================================
