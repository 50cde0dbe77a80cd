//! Caching of name listings.

use std::collections::BTreeSet;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::base::AddressEntry;

use super::cache::{Config, ExpiringCache};
use super::handler::Handler;
use super::request::{Outcome, Reply, Request, Response};

//------------ CacheListsHandler ---------------------------------------------

/// Answers list requests from cached listings.
pub struct CacheListsHandler {
    /// The configuration.
    config: Config,

    /// Listings keyed by suffix.
    cache: ExpiringCache<String, BTreeSet<String>>,

    /// Serializes read-modify-write updates of cached values.
    update: Mutex<()>,
}

impl CacheListsHandler {
    /// Creates a new handler.
    pub fn new(config: Config) -> Self {
        Self {
            cache: ExpiringCache::new(config.max_entries()),
            config,
            update: Default::default(),
        }
    }

    fn lookup(&self, suffix: &str, use_cache: bool) -> Option<BTreeSet<String>> {
        let now = Instant::now();
        self.cache
            .get(&suffix.to_string(), now)
            .filter(|cached| {
                use_cache
                    || now.duration_since(cached.fetched)
                        < self.config.min_bypass_time()
            })
            .map(|cached| cached.value.clone())
    }

    fn store(&self, suffix: &str, names: &BTreeSet<String>, ttl: Instant) {
        let now = Instant::now();
        let expires = ttl.min(now + self.config.max_ttd());
        if expires <= now {
            debug!("not caching expired listing of {suffix}");
            return;
        }
        let _guard = self.update.lock();
        self.cache.insert(suffix.into(), names.clone(), expires, now);
    }

    /// Adds a newly bound name to all cached listings it belongs to.
    fn bound(&self, entry: &AddressEntry) {
        let now = Instant::now();
        let _guard = self.update.lock();
        for suffix in self.cache.keys(now) {
            if !matches_suffix(entry.name(), &suffix) {
                continue;
            }
            if let Some(cached) = self.cache.get(&suffix, now) {
                if !cached.value.contains(entry.name()) {
                    trace!("adding {} to listing {suffix}", entry.name());
                    let mut names = cached.value.clone();
                    names.insert(entry.name().into());
                    self.cache.replace(
                        (*suffix).clone(),
                        names,
                        cached.expires,
                        &cached,
                    );
                }
            }
        }
    }

    /// Drops all cached listings an unbound name belongs to.
    ///
    /// The name may still have entries of other types, so the listings
    /// are refetched rather than patched.
    fn unbound(&self, entry: &AddressEntry) {
        let now = Instant::now();
        let _guard = self.update.lock();
        for suffix in self.cache.keys(now) {
            if matches_suffix(entry.name(), &suffix) {
                trace!("dropping listing {suffix}");
                self.cache.remove(&suffix);
            }
        }
    }
}

impl Handler for CacheListsHandler {
    fn submit(&self, response: Response) -> Option<Response> {
        if let Request::List {
            suffix, use_cache, ..
        } = response.request()
        {
            if let Some(names) = self.lookup(suffix, *use_cache) {
                trace!("answering {} from cache", response.request());
                response.set_result(Ok(Reply::Names(names)));
            }
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
            (Request::List { suffix, .. }, Ok(Reply::Names(names))) => {
                if let Some(ttl) = ttl {
                    self.store(suffix, names, ttl)
                }
            }
            (Request::Bind { entry, .. }, Ok(Reply::Bound { .. })) => {
                self.bound(entry)
            }
            (Request::Unbind { entry, .. }, Ok(Reply::Unbound)) => {
                self.unbound(entry)
            }
            _ => {}
        }
    }
}

//------------ Helper Functions ----------------------------------------------

/// Returns whether `name` belongs to the listing of `suffix`.
///
/// The listing of the bare dot contains all names.
pub fn matches_suffix(name: &str, suffix: &str) -> bool {
    suffix == "." || (name.len() > suffix.len() && name.ends_with(suffix))
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn names(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|name| name.to_string()).collect()
    }

    fn list(handler: &CacheListsHandler, suffix: &str) -> Option<Outcome> {
        handler
            .submit(Response::new(Request::list(suffix)))
            .and_then(|response| response.result())
    }

    #[test]
    fn suffixes() {
        assert!(matches_suffix("a.agents", ".agents"));
        assert!(!matches_suffix(".agents", ".agents"));
        assert!(!matches_suffix("a.other", ".agents"));
        assert!(matches_suffix("anything", "."));
    }

    #[tokio::test(start_paused = true)]
    async fn bind_and_unbind_update_listings() {
        let handler = CacheListsHandler::new(Config::new());
        handler.execute(
            &Request::list(".agents"),
            &Ok(Reply::Names(names(&["a.agents"]))),
            Some(Instant::now() + Duration::from_secs(60)),
        );
        assert_eq!(
            list(&handler, ".agents"),
            Some(Ok(Reply::Names(names(&["a.agents"]))))
        );

        let entry = AddressEntry::new("b.agents", "-RMI", "rmi://b");
        handler.execute(
            &Request::bind(entry.clone()),
            &Ok(Reply::Bound {
                expires: Instant::now() + Duration::from_secs(60),
            }),
            None,
        );
        assert_eq!(
            list(&handler, ".agents"),
            Some(Ok(Reply::Names(names(&["a.agents", "b.agents"]))))
        );

        handler.execute(&Request::unbind(entry), &Ok(Reply::Unbound), None);
        assert_eq!(list(&handler, ".agents"), None);
    }
}
