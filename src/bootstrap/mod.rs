//! Finding the directory service.
//!
//! Before the resolver can ask the directory service anything, it needs to
//! know at least one of its servers. The bootstrap lookup finds them via an
//! external registry described by boot entries, usually read from a
//! [boot table][conf].
//!
//! Each boot entry gets its own state machine. It starts out looking the
//! entry up through a [`Probe`]. Once found, the result is published as a
//! local hint and, if the registry resolved the symbolic name to a
//! different identity, an alias from the symbolic name to that identity is
//! hinted as well. From then on the result is verified periodically. If
//! verification fails, the hints are withdrawn and the entry is looked up
//! again.
//!
//! Local binds of a boot entry's own name are published to the registry
//! through the probe. This is how a directory server makes itself known.
//!
//! All state changes happen on the bootstrap's own background task.
//! Hints, unhints, and observed binds are queued and applied on the next
//! run.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::base::AddressEntry;
use crate::resolver::{BindObserver, BindSource, HintService, Resolver};
use crate::utils::config::DefMinMax;
use crate::utils::restart::Restart;

pub mod conf;

/// How long to wait before trying a failed lookup again.
const LOOKUP_RETRY: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(30),
    Duration::from_millis(100),
    Duration::from_secs(3600),
);

/// How long to wait between verifications.
const VERIFY_DELAY: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(60),
    Duration::from_secs(1),
    Duration::from_secs(24 * 3600),
);

//------------ Config ---------------------------------------------------------

/// Configuration of a bootstrap lookup.
#[derive(Clone, Debug)]
pub struct Config {
    lookup_retry: Duration,
    verify_delay: Duration,
    allow_alias_change: bool,
}

impl Config {
    /// Creates a new config with default values.
    ///
    /// The default values are documented at the relevant set_* methods.
    pub fn new() -> Self {
        Default::default()
    }

    /// Set how long to wait before trying a failed lookup again.
    ///
    /// The value has to be at least 100 milliseconds, at most one hour and
    /// the default is 30 seconds.
    pub fn set_lookup_retry(&mut self, value: Duration) {
        self.lookup_retry = LOOKUP_RETRY.limit(value)
    }

    /// Set how long to wait between verifications of a found entry.
    ///
    /// The value has to be at least one second, at most one day and the
    /// default is one minute.
    pub fn set_verify_delay(&mut self, value: Duration) {
        self.verify_delay = VERIFY_DELAY.limit(value)
    }

    /// Set whether verification may switch an alias to a new identity.
    ///
    /// If not allowed, an alias stays with the identity found first as
    /// long as that identity can be verified at all. The default is
    /// `false`.
    pub fn set_allow_alias_change(&mut self, value: bool) {
        self.allow_alias_change = value
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            lookup_retry: LOOKUP_RETRY.default(),
            verify_delay: VERIFY_DELAY.default(),
            allow_alias_change: false,
        }
    }
}

//------------ Probe ---------------------------------------------------------

/// The future returned by a probe.
pub type ProbeFuture<'a> =
    Pin<Box<dyn Future<Output = Option<AddressEntry>> + Send + 'a>>;

/// Access to an external registry.
pub trait Probe: Send + Sync + 'static {
    /// Looks up what the registry has for a boot entry.
    fn lookup<'a>(&'a self, boot: &'a AddressEntry) -> ProbeFuture<'a>;

    /// Looks up a boot entry again to confirm an earlier result.
    ///
    /// The default asks the registry the same way as a lookup does.
    fn verify<'a>(
        &'a self,
        boot: &'a AddressEntry,
        found: &'a AddressEntry,
    ) -> ProbeFuture<'a> {
        let _ = found;
        self.lookup(boot)
    }

    /// Publishes a local binding under a boot entry.
    ///
    /// The default does nothing.
    fn publish(&self, boot: &AddressEntry, entry: &AddressEntry) {
        let _ = (boot, entry);
    }

    /// Withdraws a local binding from a boot entry.
    ///
    /// The default does nothing.
    fn withdraw(&self, boot: &AddressEntry, entry: &AddressEntry) {
        let _ = (boot, entry);
    }
}

//------------ StaticProbe ---------------------------------------------------

/// A registry kept in memory.
///
/// Entries are registered under the URI of the boot entry that finds them.
#[derive(Debug, Default)]
pub struct StaticProbe {
    table: RwLock<HashMap<String, AddressEntry>>,
}

impl StaticProbe {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Default::default()
    }

    /// Registers the entry found under `uri`.
    pub fn set(&self, uri: impl Into<String>, entry: AddressEntry) {
        self.table.write().insert(uri.into(), entry);
    }

    /// Removes what is registered under `uri`.
    pub fn remove(&self, uri: &str) {
        self.table.write().remove(uri);
    }

    /// Returns what is registered under `uri`.
    pub fn get(&self, uri: &str) -> Option<AddressEntry> {
        self.table.read().get(uri).cloned()
    }
}

impl Probe for StaticProbe {
    fn lookup<'a>(&'a self, boot: &'a AddressEntry) -> ProbeFuture<'a> {
        let res = self.get(boot.uri());
        Box::pin(async move { res })
    }

    fn publish(&self, boot: &AddressEntry, entry: &AddressEntry) {
        self.set(boot.uri(), entry.clone())
    }

    fn withdraw(&self, boot: &AddressEntry, entry: &AddressEntry) {
        let mut table = self.table.write();
        if table.get(boot.uri()) == Some(entry) {
            table.remove(boot.uri());
        }
    }
}

impl<P: Probe> Probe for Arc<P> {
    fn lookup<'a>(&'a self, boot: &'a AddressEntry) -> ProbeFuture<'a> {
        (**self).lookup(boot)
    }

    fn verify<'a>(
        &'a self,
        boot: &'a AddressEntry,
        found: &'a AddressEntry,
    ) -> ProbeFuture<'a> {
        (**self).verify(boot, found)
    }

    fn publish(&self, boot: &AddressEntry, entry: &AddressEntry) {
        (**self).publish(boot, entry)
    }

    fn withdraw(&self, boot: &AddressEntry, entry: &AddressEntry) {
        (**self).withdraw(boot, entry)
    }
}

//------------ State ---------------------------------------------------------

/// The state of a boot entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    /// Looking for the entry.
    Lookup,

    /// Found, verifying periodically.
    Verify,

    /// Unhinted, about to be dropped.
    Cancel,
}

//------------ LookupTimer ---------------------------------------------------

/// The state machine of one boot entry.
#[derive(Clone, Debug)]
struct LookupTimer {
    /// The symbolic name looked up.
    id: String,

    /// The local binding published for the name, if any.
    bind_entry: Option<AddressEntry>,

    /// What the registry returned.
    found: Option<AddressEntry>,

    /// The identity the alias points to once established.
    alias_id: Option<String>,

    /// The hinted alias, if any.
    alias_entry: Option<AddressEntry>,

    /// What happens on the next run.
    state: State,

    /// When the next run is due.
    due: Instant,
}

impl LookupTimer {
    fn new(boot: &AddressEntry, now: Instant) -> Self {
        Self {
            id: boot.name().into(),
            bind_entry: None,
            found: None,
            alias_id: None,
            alias_entry: None,
            state: State::Lookup,
            due: now,
        }
    }

    /// Forgets the found entry and returns the hints to withdraw.
    fn retract(&mut self) -> Vec<AddressEntry> {
        self.found.take().into_iter().chain(self.alias_entry.take()).collect()
    }
}

/// A change queued for the next run.
enum Change {
    Hint(AddressEntry),
    Unhint(AddressEntry),
    Bound(AddressEntry),
    Unbound(AddressEntry),
}

/// Hints to publish and withdraw after a run.
#[derive(Default)]
struct Hints {
    add: Vec<AddressEntry>,
    remove: Vec<AddressEntry>,
}

//------------ BootstrapLookup -----------------------------------------------

/// Finds the directory service through an external registry.
pub struct BootstrapLookup<P> {
    config: Config,
    probe: P,

    /// Where found entries are published.
    hints: Weak<dyn HintService>,

    /// The state machines by boot entry.
    timers: Mutex<HashMap<AddressEntry, LookupTimer>>,

    /// Changes waiting for the next run.
    queue: Mutex<Vec<Change>>,

    /// Runs the state machines.
    runner: Restart,
}

impl<P: Probe> BootstrapLookup<P> {
    /// Creates a new bootstrap lookup publishing to `hints`.
    ///
    /// This must be called from within a Tokio runtime.
    pub fn new(probe: P, hints: Weak<dyn HintService>, config: Config) -> Arc<Self> {
        Arc::new_cyclic(|me: &Weak<Self>| Self {
            runner: Restart::spawn("bootstrap", me.clone(), |this| async move {
                this.run().await
            }),
            config,
            probe,
            hints,
            timers: Default::default(),
            queue: Default::default(),
        })
    }

    /// Creates a new bootstrap lookup for a resolver.
    ///
    /// Found entries become hints of the resolver and the bootstrap lookup
    /// observes the resolver's binds.
    pub fn for_resolver(
        resolver: &Arc<Resolver>,
        probe: P,
        config: Config,
    ) -> Arc<Self> {
        let hints: Weak<dyn HintService> = Arc::downgrade(resolver) as _;
        let res = Self::new(probe, hints, config);
        let observer: Weak<dyn BindObserver> = Arc::downgrade(&res) as _;
        resolver.add_observer(observer);
        res
    }

    /// Returns the probe.
    pub fn probe(&self) -> &P {
        &self.probe
    }

    /// Starts looking up a boot entry.
    pub fn hint(&self, boot: AddressEntry) {
        self.enqueue(Change::Hint(boot))
    }

    /// Stops looking up a boot entry and withdraws what it found.
    pub fn unhint(&self, boot: AddressEntry) {
        self.enqueue(Change::Unhint(boot))
    }

    /// Returns the state of a boot entry.
    pub fn state(&self, boot: &AddressEntry) -> Option<State> {
        self.timers.lock().get(boot).map(|timer| timer.state)
    }

    /// Returns what was found for a boot entry.
    pub fn found(&self, boot: &AddressEntry) -> Option<AddressEntry> {
        self.timers.lock().get(boot).and_then(|timer| timer.found.clone())
    }

    fn enqueue(&self, change: Change) {
        self.queue.lock().push(change);
        self.runner.restart()
    }

    /// Runs all due state machines.
    async fn run(&self) {
        let mut hints = self.apply_changes();

        let now = Instant::now();
        let due: Vec<_> = self
            .timers
            .lock()
            .iter()
            .filter(|(_, timer)| timer.state != State::Cancel && timer.due <= now)
            .map(|(boot, timer)| (boot.clone(), timer.state, timer.found.clone()))
            .collect();

        for (boot, state, found) in due {
            let probed = match (state, &found) {
                (State::Verify, Some(found)) => self.probe.verify(&boot, found).await,
                _ => self.probe.lookup(&boot).await,
            };
            let now = Instant::now();
            let mut timers = self.timers.lock();
            let timer = match timers.get_mut(&boot) {
                Some(timer) if timer.state == state => timer,
                _ => continue,
            };
            match state {
                State::Lookup => self.looked_up(&boot, timer, probed, now, &mut hints),
                State::Verify => self.verified(&boot, timer, probed, now, &mut hints),
                State::Cancel => {}
            }
        }

        if let Some(service) = self.hints.upgrade() {
            for entry in hints.remove {
                service.unhint(entry)
            }
            for entry in hints.add {
                service.hint(entry)
            }
        }

        let next = self.timers.lock().values().map(|timer| timer.due).min();
        if let Some(next) = next {
            self.runner.schedule_at(next)
        }
    }

    /// Applies queued changes.
    fn apply_changes(&self) -> Hints {
        let changes = std::mem::take(&mut *self.queue.lock());
        let now = Instant::now();
        let mut hints = Hints::default();
        let mut timers = self.timers.lock();
        for change in changes {
            match change {
                Change::Hint(boot) => {
                    if !timers.contains_key(&boot) {
                        info!("bootstrap: looking up {boot}");
                        let timer = LookupTimer::new(&boot, now);
                        timers.insert(boot, timer);
                    }
                }
                Change::Unhint(boot) => {
                    if let Some(timer) = timers.get_mut(&boot) {
                        info!("bootstrap: dropping {boot}");
                        timer.state = State::Cancel;
                        hints.remove.extend(timer.retract());
                        if let Some(entry) = timer.bind_entry.take() {
                            self.probe.withdraw(&boot, &entry)
                        }
                    }
                }
                Change::Bound(entry) => {
                    for (boot, timer) in timers.iter_mut() {
                        if timer.id == entry.name()
                            && timer.bind_entry.as_ref() != Some(&entry)
                        {
                            debug!("bootstrap: publishing {entry} under {boot}");
                            self.probe.publish(boot, &entry);
                            timer.bind_entry = Some(entry.clone());
                            if timer.state == State::Lookup {
                                timer.due = now;
                            }
                        }
                    }
                }
                Change::Unbound(entry) => {
                    for (boot, timer) in timers.iter_mut() {
                        if timer.bind_entry.as_ref() == Some(&entry) {
                            debug!("bootstrap: withdrawing {entry} from {boot}");
                            self.probe.withdraw(boot, &entry);
                            timer.bind_entry = None;
                        }
                    }
                }
            }
        }
        timers.retain(|_, timer| timer.state != State::Cancel);
        hints
    }

    /// Processes the result of a lookup.
    fn looked_up(
        &self,
        boot: &AddressEntry,
        timer: &mut LookupTimer,
        probed: Option<AddressEntry>,
        now: Instant,
        hints: &mut Hints,
    ) {
        let found = match probed {
            Some(found) => found,
            None => {
                debug!("bootstrap: {boot} not found");
                timer.due = now + self.config.lookup_retry;
                return;
            }
        };
        if let Some(alias_id) = &timer.alias_id {
            if found.name() != alias_id && !self.config.allow_alias_change {
                warn!(
                    "bootstrap: {boot} now names {}, waiting for {alias_id}",
                    found.name()
                );
                timer.due = now + self.config.lookup_retry;
                return;
            }
        }
        info!("bootstrap: {boot} found {found}");
        if found.name() != timer.id {
            let alias = AddressEntry::alias(timer.id.as_str(), found.name());
            timer.alias_id = Some(found.name().into());
            timer.alias_entry = Some(alias.clone());
            hints.add.push(alias);
        }
        hints.add.push(found.clone());
        timer.found = Some(found);
        timer.state = State::Verify;
        timer.due = now + self.config.verify_delay;
    }

    /// Processes the result of a verification.
    fn verified(
        &self,
        boot: &AddressEntry,
        timer: &mut LookupTimer,
        probed: Option<AddressEntry>,
        now: Instant,
        hints: &mut Hints,
    ) {
        if probed.is_some() && probed == timer.found {
            timer.due = now + self.config.verify_delay;
            return;
        }
        if let (Some(probed), Some(alias_id)) = (&probed, &timer.alias_id) {
            if probed.name() != alias_id && !self.config.allow_alias_change {
                warn!(
                    "bootstrap: {boot} now names {}, keeping {alias_id}",
                    probed.name()
                );
                timer.due = now + self.config.verify_delay;
                return;
            }
        }
        info!("bootstrap: {boot} changed, looking up again");
        hints.remove.extend(timer.retract());
        timer.state = State::Lookup;
        timer.due = now;
    }
}

impl<P: Probe> BindObserver for BootstrapLookup<P> {
    fn bound(&self, entry: &AddressEntry, source: BindSource) {
        if source == BindSource::Local && !entry.is_alias() {
            self.enqueue(Change::Bound(entry.clone()))
        }
    }

    fn unbound(&self, entry: &AddressEntry, source: BindSource) {
        if source == BindSource::Local && !entry.is_alias() {
            self.enqueue(Change::Unbound(entry.clone()))
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[derive(Default)]
    struct Published {
        hints: Mutex<Vec<AddressEntry>>,
    }

    impl HintService for Published {
        fn hint(&self, entry: AddressEntry) {
            self.hints.lock().push(entry)
        }

        fn unhint(&self, entry: AddressEntry) {
            self.hints.lock().retain(|hint| hint != &entry)
        }
    }

    fn boot() -> AddressEntry {
        AddressEntry::new("WP", "-RMI", "rmi://registry/WP")
    }

    fn setup(
        config: Config,
    ) -> (Arc<Published>, Arc<StaticProbe>, Arc<BootstrapLookup<Arc<StaticProbe>>>) {
        let published = Arc::new(Published::default());
        let probe = Arc::new(StaticProbe::new());
        let hints: Weak<dyn HintService> = Arc::downgrade(&published) as _;
        let lookup = BootstrapLookup::new(probe.clone(), hints, config);
        (published, probe, lookup)
    }

    fn server(name: &str) -> AddressEntry {
        AddressEntry::new(name, "-RMI", format!("rmi://{name}"))
    }

    #[tokio::test(start_paused = true)]
    async fn failed_lookup_is_retried() {
        let (published, probe, lookup) = setup(Config::new());
        lookup.hint(boot());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(lookup.state(&boot()), Some(State::Lookup));
        assert!(published.hints.lock().is_empty());

        probe.set("rmi://registry/WP", server("WP-1"));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(lookup.state(&boot()), Some(State::Verify));
        assert_eq!(
            published.hints.lock().clone(),
            vec![AddressEntry::alias("WP", "WP-1"), server("WP-1")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn no_alias_for_same_name() {
        let (published, probe, lookup) = setup(Config::new());
        probe.set("rmi://registry/WP", server("WP"));
        lookup.hint(boot());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(published.hints.lock().clone(), vec![server("WP")]);
    }

    #[tokio::test(start_paused = true)]
    async fn mismatch_returns_to_lookup() {
        let mut config = Config::new();
        config.set_allow_alias_change(true);
        let (published, probe, lookup) = setup(config);
        probe.set("rmi://registry/WP", server("WP-1"));
        lookup.hint(boot());
        tokio::time::sleep(Duration::from_millis(1)).await;

        probe.set("rmi://registry/WP", server("WP-2"));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(lookup.found(&boot()), Some(server("WP-2")));
        assert_eq!(
            published.hints.lock().clone(),
            vec![AddressEntry::alias("WP", "WP-2"), server("WP-2")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn established_alias_is_kept() {
        let (published, probe, lookup) = setup(Config::new());
        probe.set("rmi://registry/WP", server("WP-1"));
        lookup.hint(boot());
        tokio::time::sleep(Duration::from_millis(1)).await;

        probe.set("rmi://registry/WP", server("WP-2"));
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(lookup.state(&boot()), Some(State::Verify));
        assert_eq!(lookup.found(&boot()), Some(server("WP-1")));
        assert!(published.hints.lock().contains(&server("WP-1")));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_verify_withdraws_hints() {
        let (published, probe, lookup) = setup(Config::new());
        probe.set("rmi://registry/WP", server("WP-1"));
        lookup.hint(boot());
        tokio::time::sleep(Duration::from_millis(1)).await;

        probe.remove("rmi://registry/WP");
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(lookup.state(&boot()), Some(State::Lookup));
        assert!(published.hints.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn established_alias_survives_lookup() {
        let (published, probe, lookup) = setup(Config::new());
        probe.set("rmi://registry/WP", server("WP-1"));
        lookup.hint(boot());
        tokio::time::sleep(Duration::from_millis(1)).await;

        probe.remove("rmi://registry/WP");
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(lookup.state(&boot()), Some(State::Lookup));

        probe.set("rmi://registry/WP", server("WP-2"));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(lookup.state(&boot()), Some(State::Lookup));
        assert_eq!(lookup.found(&boot()), None);
        assert!(published.hints.lock().is_empty());

        probe.set("rmi://registry/WP", server("WP-1"));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(lookup.state(&boot()), Some(State::Verify));
        assert_eq!(
            published.hints.lock().clone(),
            vec![AddressEntry::alias("WP", "WP-1"), server("WP-1")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn alias_change_after_failed_verify() {
        let mut config = Config::new();
        config.set_allow_alias_change(true);
        let (published, probe, lookup) = setup(config);
        probe.set("rmi://registry/WP", server("WP-1"));
        lookup.hint(boot());
        tokio::time::sleep(Duration::from_millis(1)).await;

        probe.remove("rmi://registry/WP");
        tokio::time::sleep(Duration::from_secs(61)).await;
        probe.set("rmi://registry/WP", server("WP-2"));
        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(lookup.state(&boot()), Some(State::Verify));
        assert_eq!(lookup.found(&boot()), Some(server("WP-2")));
        assert_eq!(
            published.hints.lock().clone(),
            vec![AddressEntry::alias("WP", "WP-2"), server("WP-2")]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn unhint_cancels() {
        let (published, probe, lookup) = setup(Config::new());
        probe.set("rmi://registry/WP", server("WP-1"));
        lookup.hint(boot());
        tokio::time::sleep(Duration::from_millis(1)).await;
        lookup.unhint(boot());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(lookup.state(&boot()), None);
        assert!(published.hints.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn local_binds_are_published() {
        let (_, probe, lookup) = setup(Config::new());
        lookup.hint(boot());
        tokio::time::sleep(Duration::from_millis(1)).await;
        lookup.bound(&server("WP"), BindSource::Local);
        lookup.bound(&server("Other"), BindSource::Local);
        lookup.bound(&AddressEntry::new("WP", "-TCP", "tcp://x"), BindSource::Hint);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(probe.get("rmi://registry/WP"), Some(server("WP")));

        lookup.unbound(&server("WP"), BindSource::Local);
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(probe.get("rmi://registry/WP"), None);
    }
}
