//! Choosing the directory server to talk to.
//!
//! The select manager keeps a pool of known servers and a response time
//! estimate for each. Servers enter the pool when an entry naming them is
//! bound or hinted locally and leave it when the last such entry is gone.
//! An entry names a server if its name starts with the configured alias
//! prefix: an alias entry names the target of its alias URI, any other
//! entry names itself.
//!
//! Response times are smoothed the way TCP estimates its retransmission
//! timeout: the mean is kept as a fixed point value scaled by eight and
//! updated with a gain of 1/8, the mean deviation is scaled by four and
//! updated with a gain of 1/4. The score of a server is the mean plus four
//! times the deviation. Lost exchanges are fed in as samples of double
//! their elapsed time. A server that has not been measured for a while
//! drifts back toward the default score so it eventually gets tried
//! again.
//!
//! To keep clients from all piling onto the same server, every score is
//! multiplied with a small random factor before the servers are compared.
//! Once made, a choice sticks for the scoring period.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::random;
use tokio::time::Instant;
use tracing::{debug, info, trace};

use crate::base::{AddressEntry, MessageAddress};
use crate::resolver::handler::{BindObserver, BindSource};
use crate::utils::config::DefMinMax;

/// How long a selection is kept before servers are compared again.
const SCORING_PERIOD: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(2),
    Duration::ZERO,
    Duration::from_secs(60),
);

/// How long a measurement is trusted before it decays.
const MAX_AGE: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(60),
    Duration::from_secs(1),
    Duration::from_secs(3600),
);

/// The score of servers that have not been measured yet.
const DEFAULT_SCORE: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(500),
    Duration::from_millis(1),
    Duration::from_secs(60),
);

/// The weight of the random jitter applied to scores.
const RANDOM_WEIGHT: DefMinMax<f64> = DefMinMax::new(0.1, 0.0, 1.0);

/// The shortest time to wait for an answer.
const MIN_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(200),
    Duration::from_millis(10),
    Duration::from_secs(60),
);

/// The longest time to wait for an answer.
const MAX_TIMEOUT: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(30),
    Duration::from_millis(100),
    Duration::from_secs(600),
);

/// The factor between a server's score and the time to wait for it.
const TIMEOUT_FACTOR: DefMinMax<f64> = DefMinMax::new(3.0, 1.0, 100.0);

/// The granularity of send deadlines.
const DEADLINE_GRANULARITY: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_millis(100),
    Duration::from_millis(1),
    Duration::from_secs(10),
);

/// The default prefix of entries naming directory servers.
const ALIAS_PREFIX: &str = "WP";

//------------ Config ---------------------------------------------------------

/// Configuration of a select manager.
#[derive(Clone, Debug)]
pub struct Config {
    scoring_period: Duration,
    max_age: Duration,
    default_score: Duration,
    random_weight: f64,
    min_timeout: Duration,
    max_timeout: Duration,
    timeout_factor: f64,
    deadline_granularity: Duration,
    alias_prefix: String,
}

impl Config {
    /// Creates a new config with default values.
    ///
    /// The default values are documented at the relevant set_* methods.
    pub fn new() -> Self {
        Default::default()
    }

    /// Set how long a selection sticks.
    ///
    /// The value has to be at most 60 seconds and the default is two
    /// seconds.
    pub fn set_scoring_period(&mut self, value: Duration) {
        self.scoring_period = SCORING_PERIOD.limit(value)
    }

    /// Set how long a measurement is trusted before it decays.
    ///
    /// The value has to be at least one second, at most one hour and the
    /// default is one minute.
    pub fn set_max_age(&mut self, value: Duration) {
        self.max_age = MAX_AGE.limit(value)
    }

    /// Set the score of servers that have not been measured.
    ///
    /// The value has to be at least one millisecond, at most 60 seconds
    /// and the default is 500 milliseconds.
    pub fn set_default_score(&mut self, value: Duration) {
        self.default_score = DEFAULT_SCORE.limit(value)
    }

    /// Set the weight of the random jitter.
    ///
    /// A score is multiplied with a random factor between one minus and
    /// one plus the weight. The value has to be between zero and one and
    /// the default is 0.1.
    pub fn set_random_weight(&mut self, value: f64) {
        self.random_weight = RANDOM_WEIGHT.limit(value)
    }

    /// Set the shortest time to wait for an answer.
    ///
    /// The value has to be at least ten milliseconds, at most 60 seconds
    /// and the default is 200 milliseconds.
    pub fn set_min_timeout(&mut self, value: Duration) {
        self.min_timeout = MIN_TIMEOUT.limit(value)
    }

    /// Set the longest time to wait for an answer.
    ///
    /// The value has to be at least 100 milliseconds, at most ten minutes
    /// and the default is 30 seconds.
    pub fn set_max_timeout(&mut self, value: Duration) {
        self.max_timeout = MAX_TIMEOUT.limit(value)
    }

    /// Set the factor between a server's score and its timeout.
    ///
    /// The value has to be between 1 and 100 and the default is 3.
    pub fn set_timeout_factor(&mut self, value: f64) {
        self.timeout_factor = TIMEOUT_FACTOR.limit(value)
    }

    /// Set the granularity of send deadlines.
    ///
    /// The value has to be at least one millisecond, at most ten seconds
    /// and the default is 100 milliseconds.
    pub fn set_deadline_granularity(&mut self, value: Duration) {
        self.deadline_granularity = DEADLINE_GRANULARITY.limit(value)
    }

    /// Set the prefix of entry names that name directory servers.
    ///
    /// The default is `"WP"`.
    pub fn set_alias_prefix(&mut self, value: impl Into<String>) {
        self.alias_prefix = value.into()
    }

    /// Returns the prefix of entry names that name directory servers.
    pub fn alias_prefix(&self) -> &str {
        &self.alias_prefix
    }

    /// Returns the timeout for a score.
    fn timeout(&self, score: Duration) -> Duration {
        score
            .mul_f64(self.timeout_factor)
            .max(self.min_timeout)
            .min(self.max_timeout.max(self.min_timeout))
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            scoring_period: SCORING_PERIOD.default(),
            max_age: MAX_AGE.default(),
            default_score: DEFAULT_SCORE.default(),
            random_weight: RANDOM_WEIGHT.default(),
            min_timeout: MIN_TIMEOUT.default(),
            max_timeout: MAX_TIMEOUT.default(),
            timeout_factor: TIMEOUT_FACTOR.default(),
            deadline_granularity: DEADLINE_GRANULARITY.default(),
            alias_prefix: ALIAS_PREFIX.into(),
        }
    }
}

//------------ SelectManager --------------------------------------------------

/// A callback run when a server was added to the pool.
type Listener = Box<dyn Fn() + Send + Sync>;

/// The pool of directory servers and their scores.
pub struct SelectManager {
    /// The configuration.
    config: Config,

    /// The origin for rounding deadlines.
    epoch: Instant,

    /// The mutable state.
    inner: Mutex<Inner>,

    /// Callbacks for new servers.
    listeners: Mutex<Vec<Listener>>,
}

#[derive(Default)]
struct Inner {
    /// The known servers.
    servers: HashMap<Arc<str>, ServerScore>,

    /// The server named by each observed entry, keyed by name and type.
    aliases: HashMap<(String, String), Arc<str>>,

    /// The current choice and until when it sticks.
    selection: Option<(Arc<str>, Instant)>,

    /// Addresses handed out, keyed by server and deadline.
    addresses: HashMap<(Arc<str>, Instant), Arc<MessageAddress>>,
}

impl SelectManager {
    /// Creates an empty pool.
    pub fn new(config: Config) -> Self {
        Self {
            config,
            epoch: Instant::now(),
            inner: Default::default(),
            listeners: Default::default(),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Registers a callback run whenever a server joins the pool.
    pub fn add_listener(&self, listener: impl Fn() + Send + Sync + 'static) {
        self.listeners.lock().push(Box::new(listener))
    }

    /// Returns the names of the known servers.
    pub fn servers(&self) -> Vec<Arc<str>> {
        let mut res: Vec<_> =
            self.inner.lock().servers.keys().cloned().collect();
        res.sort();
        res
    }

    /// Returns whether `server` is in the pool.
    pub fn contains(&self, server: &str) -> bool {
        self.inner.lock().servers.contains_key(server)
    }

    /// Returns the server an entry names, if any.
    pub fn alias_server<'a>(&self, entry: &'a AddressEntry) -> Option<&'a str> {
        if !entry.name().starts_with(self.config.alias_prefix()) {
            return None;
        }
        if entry.is_alias() {
            entry.alias_target()
        } else {
            Some(entry.name())
        }
    }

    /// Adds the server named by `entry` to the pool.
    ///
    /// Returns whether the entry names a server.
    pub fn add_alias(&self, entry: &AddressEntry) -> bool {
        let server = match self.alias_server(entry) {
            Some(server) => server,
            None => return false,
        };
        let key = (entry.name().to_string(), entry.typ().to_string());
        let added = {
            let mut inner = self.inner.lock();
            if let Some(old) = inner.aliases.get(&key).cloned() {
                if old.as_ref() == server {
                    return true;
                }
                inner.drop_alias(&old, &key);
            }
            let existing = inner
                .servers
                .get_key_value(server)
                .map(|(server, _)| server.clone());
            let (server, added) = match existing {
                Some(server) => (server, false),
                None => {
                    let server: Arc<str> = server.into();
                    inner
                        .servers
                        .insert(server.clone(), ServerScore::default());
                    (server, true)
                }
            };
            if let Some(score) = inner.servers.get_mut(&server) {
                score.aliases.insert(key.clone());
            }
            inner.aliases.insert(key, server);
            added
        };
        if added {
            info!("directory server {server} joined the pool");
            for listener in self.listeners.lock().iter() {
                listener()
            }
        }
        true
    }

    /// Removes an entry naming a server from the pool.
    ///
    /// The server leaves the pool with its last entry.
    pub fn remove_alias(&self, entry: &AddressEntry) -> bool {
        let server = match self.alias_server(entry) {
            Some(server) => server,
            None => return false,
        };
        let key = (entry.name().to_string(), entry.typ().to_string());
        let mut inner = self.inner.lock();
        match inner.aliases.get(&key).cloned() {
            Some(current) if current.as_ref() == server => {
                inner.aliases.remove(&key);
                inner.drop_alias(&current, &key);
            }
            _ => {}
        }
        true
    }

    /// Feeds the outcome of an exchange with `server` into its score.
    ///
    /// If `timeout` is set, the exchange was given up on after `rtt`.
    pub fn update(&self, server: &str, rtt: Duration, timeout: bool) {
        let mut sample = i64::try_from(rtt.as_millis()).unwrap_or(i64::MAX / 16);
        if timeout {
            sample = sample.saturating_mul(2);
        }
        let now = Instant::now();
        let mut inner = self.inner.lock();
        match inner.servers.get_mut(server) {
            Some(score) => {
                score.update(sample, now);
                trace!(
                    "server {server}: sample {sample}ms, mean {}ms",
                    score.mean()
                );
            }
            None => debug!("ignoring sample for unknown server {server}"),
        }
    }

    /// Returns the current score of `server`.
    pub fn score(&self, server: &str) -> Option<Duration> {
        let now = Instant::now();
        self.inner
            .lock()
            .servers
            .get(server)
            .map(|score| score.score(&self.config, now))
    }

    /// Returns the smoothed mean response time of `server`.
    pub fn mean(&self, server: &str) -> Option<Duration> {
        self.inner
            .lock()
            .servers
            .get(server)
            .filter(|score| score.update_time.is_some())
            .map(|score| Duration::from_millis(score.mean().max(0) as u64))
    }

    /// Returns how long to wait for an answer from `server`.
    pub fn timeout(&self, server: &str) -> Option<Duration> {
        self.score(server).map(|score| self.config.timeout(score))
    }

    /// Picks the server for the next query.
    ///
    /// Returns the server's address with the send deadline attached or
    /// `None` if no server is known. Addresses are shared between calls
    /// that end up with the same rounded deadline.
    pub fn select(&self) -> Option<Arc<MessageAddress>> {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let server = match inner.selection.clone() {
            Some((server, until))
                if now < until && inner.servers.contains_key(&server) =>
            {
                server
            }
            _ => {
                let server = inner.choose(&self.config, now)?;
                trace!("selected directory server {server}");
                inner.selection =
                    Some((server.clone(), now + self.config.scoring_period));
                server
            }
        };
        let score = inner.servers.get(&server)?.score(&self.config, now);
        let deadline = self.round_up(now + self.config.timeout(score));
        inner.addresses.retain(|(_, deadline), _| *deadline > now);
        let address = inner
            .addresses
            .entry((server.clone(), deadline))
            .or_insert_with(|| {
                Arc::new(MessageAddress::with_deadline(server, deadline))
            })
            .clone();
        Some(address)
    }

    /// Rounds an instant up to the deadline granularity.
    fn round_up(&self, instant: Instant) -> Instant {
        let granularity = self.config.deadline_granularity.as_nanos().max(1);
        let offset = instant.duration_since(self.epoch).as_nanos();
        let rounded = (offset + granularity - 1) / granularity * granularity;
        self.epoch + Duration::from_nanos(rounded as u64)
    }
}

impl Inner {
    /// Removes an entry from a server, dropping the server if it was the
    /// last one.
    fn drop_alias(&mut self, server: &Arc<str>, key: &(String, String)) {
        let empty = match self.servers.get_mut(server) {
            Some(score) => {
                score.aliases.remove(key);
                score.aliases.is_empty()
            }
            None => false,
        };
        if empty {
            info!("directory server {server} left the pool");
            self.servers.remove(server);
            self.addresses.retain(|(name, _), _| name != server);
            if matches!(&self.selection, Some((name, _)) if name == server) {
                self.selection = None;
            }
        }
    }

    /// Picks the server with the lowest jittered score.
    fn choose(&self, config: &Config, now: Instant) -> Option<Arc<str>> {
        self.servers
            .iter()
            .map(|(server, score)| {
                let jitter = 1.0 + config.random_weight * (2.0 * random::<f64>() - 1.0);
                (server, score.score(config, now).as_secs_f64() * jitter)
            })
            .min_by(|left, right| left.1.total_cmp(&right.1))
            .map(|(server, _)| server.clone())
    }
}

impl BindObserver for SelectManager {
    fn bound(&self, entry: &AddressEntry, _source: BindSource) {
        self.add_alias(entry);
    }

    fn unbound(&self, entry: &AddressEntry, _source: BindSource) {
        self.remove_alias(entry);
    }
}

//------------ ServerScore ----------------------------------------------------

/// The response time estimate of a server.
#[derive(Debug, Default)]
struct ServerScore {
    /// The entries naming the server.
    aliases: HashSet<(String, String)>,

    /// The smoothed mean in milliseconds, scaled by eight.
    average: i64,

    /// The smoothed mean deviation in milliseconds, scaled by four.
    variance: i64,

    /// When the last sample was taken, `None` if never.
    update_time: Option<Instant>,
}

impl ServerScore {
    /// Adds a sample in milliseconds.
    fn update(&mut self, sample: i64, now: Instant) {
        if self.update_time.is_none() {
            self.average = sample << 3;
            self.variance = sample << 1;
        } else {
            let mut delta = sample - (self.average >> 3);
            self.average += delta;
            if self.average <= 0 {
                self.average = 1;
            }
            if delta < 0 {
                delta = -delta;
            }
            delta -= self.variance >> 2;
            self.variance += delta;
            if self.variance <= 0 {
                self.variance = 1;
            }
        }
        self.update_time = Some(now);
    }

    /// Returns the smoothed mean in milliseconds.
    fn mean(&self) -> i64 {
        self.average >> 3
    }

    /// Returns the score at `now`.
    fn score(&self, config: &Config, now: Instant) -> Duration {
        let updated = match self.update_time {
            Some(updated) => updated,
            None => return config.default_score,
        };
        let measured =
            Duration::from_millis(((self.average >> 3) + self.variance).max(0) as u64);
        let age = now.duration_since(updated);
        if age <= config.max_age {
            return measured;
        }
        let blend = (age - config.max_age).as_secs_f64()
            / config.max_age.as_secs_f64();
        if blend >= 1.0 {
            return config.default_score;
        }
        let measured = measured.as_secs_f64();
        let default = config.default_score.as_secs_f64();
        Duration::from_secs_f64(measured + (default - measured) * blend)
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use rstest::rstest;

    fn server(name: &str) -> AddressEntry {
        AddressEntry::new(name, "-RMI", format!("rmi://{name}"))
    }

    fn quiet() -> Config {
        let mut config = Config::new();
        config.set_random_weight(0.0);
        config.set_scoring_period(Duration::ZERO);
        config
    }

    #[test]
    fn alias_entries() {
        let select = SelectManager::new(Config::new());
        assert_eq!(select.alias_server(&server("WP-1")), Some("WP-1"));
        assert_eq!(
            select.alias_server(&AddressEntry::alias("WP", "WP-2")),
            Some("WP-2")
        );
        assert_eq!(select.alias_server(&server("AgentX")), None);
    }

    #[tokio::test(start_paused = true)]
    async fn last_alias_removes_server() {
        let select = SelectManager::new(quiet());
        let own = server("WP-1");
        let alias = AddressEntry::alias("WP", "WP-1");
        select.add_alias(&own);
        select.add_alias(&alias);
        assert_eq!(select.servers(), vec![Arc::<str>::from("WP-1")]);
        assert!(select.select().is_some());

        select.remove_alias(&own);
        assert!(select.contains("WP-1"));
        select.remove_alias(&alias);
        assert!(!select.contains("WP-1"));
        assert!(select.select().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn listeners_hear_new_servers() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        let select = SelectManager::new(quiet());
        let count = Arc::new(AtomicUsize::new(0));
        let seen = count.clone();
        select.add_listener(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        select.add_alias(&server("WP-1"));
        select.add_alias(&AddressEntry::alias("WP", "WP-1"));
        select.add_alias(&server("WP-2"));
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn samples_converge() {
        let select = SelectManager::new(quiet());
        select.add_alias(&server("WP-1"));
        select.update("WP-1", Duration::from_millis(1000), false);
        for _ in 0..100 {
            select.update("WP-1", Duration::from_millis(100), false);
        }
        assert_eq!(select.mean("WP-1"), Some(Duration::from_millis(100)));
    }

    #[rstest]
    #[case(None)]
    #[case(Some(Duration::from_millis(40)))]
    #[tokio::test(start_paused = true)]
    async fn timeout_counts_double(#[case] history: Option<Duration>) {
        let select = SelectManager::new(quiet());
        select.add_alias(&server("WP-1"));
        select.add_alias(&server("WP-2"));
        if let Some(rtt) = history {
            select.update("WP-1", rtt, false);
            select.update("WP-2", rtt, false);
        }
        select.update("WP-1", Duration::from_millis(100), true);
        select.update("WP-2", Duration::from_millis(200), false);
        assert_eq!(select.score("WP-1"), select.score("WP-2"));
        assert_eq!(select.mean("WP-1"), select.mean("WP-2"));
    }

    #[tokio::test(start_paused = true)]
    async fn fastest_server_wins() {
        let select = SelectManager::new(quiet());
        select.add_alias(&server("WP-1"));
        select.add_alias(&server("WP-2"));
        select.update("WP-1", Duration::from_millis(300), false);
        select.update("WP-2", Duration::from_millis(30), false);
        assert_eq!(select.select().unwrap().name(), "WP-2");
    }

    #[tokio::test(start_paused = true)]
    async fn idle_scores_decay() {
        let mut config = quiet();
        config.set_max_age(Duration::from_secs(10));
        config.set_default_score(Duration::from_millis(500));
        let select = SelectManager::new(config);
        select.add_alias(&server("WP-1"));
        select.update("WP-1", Duration::from_millis(50), false);
        assert_eq!(select.score("WP-1"), Some(Duration::from_millis(150)));
        tokio::time::advance(Duration::from_secs(20)).await;
        assert_eq!(select.score("WP-1"), Some(Duration::from_millis(500)));
    }

    #[tokio::test(start_paused = true)]
    async fn addresses_are_memoized() {
        let select = SelectManager::new(quiet());
        select.add_alias(&server("WP-1"));
        tokio::time::advance(Duration::from_millis(1)).await;
        let first = select.select().unwrap();
        tokio::time::advance(Duration::from_millis(49)).await;
        let second = select.select().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        // Default score 500ms times three.
        let deadline = first.deadline().unwrap();
        assert!(deadline >= Instant::now() + Duration::from_millis(1499));
    }

    #[tokio::test(start_paused = true)]
    async fn timeouts_are_clamped() {
        let mut config = quiet();
        config.set_max_timeout(Duration::from_secs(1));
        let select = SelectManager::new(config);
        select.add_alias(&server("WP-1"));
        assert_eq!(select.timeout("WP-1"), Some(Duration::from_secs(1)));
        select.update("WP-1", Duration::from_millis(10), false);
        assert_eq!(select.timeout("WP-1"), Some(Duration::from_millis(200)));
    }
}
