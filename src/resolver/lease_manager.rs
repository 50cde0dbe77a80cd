//! Keeping bindings alive at the directory service.
//!
//! The lease manager owns the client's view of every lease it holds. There
//! is one lease per name carrying all bound types of that name. Any change
//! to the bound entries creates a new [`Record`] with a fresh identifier
//! that replaces the previous one at the service.
//!
//! Acknowledged leases are renewed ahead of their expiry by sending only
//! the record's identifier. If the service has forgotten the lease, the
//! full record is sent again under the same identifier. A denial ends the
//! lease.
//!
//! The outcome of every exchange is broadcast to the resolver's handlers
//! via [`Dispatch::execute`].

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::base::{
    AddressEntry, EntryMap, LeaseDenied, ModifyAnswer, ModifyQuery, Record,
    Uid, UidService,
};
use crate::net::client::transport::{ClientTransport, ModifyClient};
use crate::utils::config::DefMinMax;
use crate::utils::restart::Restart;

use super::handler::Dispatch;
use super::request::{Error, Outcome, Reply, Request};

/// The share of a lease's remaining time after which it is renewed.
const RENEW_RATIO: DefMinMax<f64> = DefMinMax::new(0.75, 0.1, 0.95);

/// The weight of the previous estimate when smoothing round trip times.
const RTT_WEIGHT: DefMinMax<f64> = DefMinMax::new(0.75, 0.0, 0.99);

/// How often leases are checked for renewal.
const CHECK_PERIOD: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(5),
    Duration::from_millis(100),
    Duration::from_secs(300),
);

/// The lease length asked for.
const DEFAULT_TTD: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(240),
    Duration::from_secs(1),
    Duration::from_secs(24 * 3600),
);

//------------ Config ---------------------------------------------------------

/// Configuration of the lease manager.
#[derive(Clone, Debug)]
pub struct Config {
    renew_ratio: f64,
    rtt_weight: f64,
    check_period: Duration,
    default_ttd: Duration,
}

impl Config {
    /// Creates a new config with default values.
    ///
    /// The default values are documented at the relevant set_* methods.
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the share of a lease's remaining time after which it is renewed.
    ///
    /// The value has to be between 0.1 and 0.95 and the default is 0.75.
    pub fn set_renew_ratio(&mut self, value: f64) {
        self.renew_ratio = RENEW_RATIO.limit(value)
    }

    /// Set the weight of the previous round trip estimate.
    ///
    /// The value has to be between 0 and 0.99 and the default is 0.75.
    pub fn set_rtt_weight(&mut self, value: f64) {
        self.rtt_weight = RTT_WEIGHT.limit(value)
    }

    /// Set how often leases are checked for renewal.
    ///
    /// The value has to be at least 100 milliseconds, at most five minutes
    /// and the default is five seconds.
    pub fn set_check_period(&mut self, value: Duration) {
        self.check_period = CHECK_PERIOD.limit(value)
    }

    /// Returns the renewal check period.
    pub fn check_period(&self) -> Duration {
        self.check_period
    }

    /// Set the lease length asked for.
    ///
    /// The value has to be at least one second, at most one day and the
    /// default is four minutes.
    pub fn set_default_ttd(&mut self, value: Duration) {
        self.default_ttd = DEFAULT_TTD.limit(value)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            renew_ratio: RENEW_RATIO.default(),
            rtt_weight: RTT_WEIGHT.default(),
            check_period: CHECK_PERIOD.default(),
            default_ttd: DEFAULT_TTD.default(),
        }
    }
}

//------------ ClientLease ----------------------------------------------------

/// The client's view of the lease of one name.
#[derive(Clone, Debug)]
pub struct ClientLease {
    /// The identifier of the current record.
    uid: Uid,

    /// The bound entries.
    entries: EntryMap,

    /// The entries of the last acknowledged record.
    granted: EntryMap,

    /// Whether to keep renewing.
    renewal: bool,

    /// The identity the lease is held for if not the local agent.
    requester: Option<Arc<str>>,

    /// When the current record was first sent.
    bind_time: Instant,

    /// When the current record was last acknowledged.
    bound_time: Option<Instant>,

    /// When the outstanding exchange was sent, if there is one.
    send_time: Option<Instant>,

    /// The smoothed round trip time.
    round_trip_time: Option<Duration>,

    /// When the lease runs out.
    expire_time: Option<Instant>,

    /// Removed entries waiting for the acknowledgement of their removal.
    unbinding: Vec<AddressEntry>,
}

impl ClientLease {
    fn new(uid: Uid, now: Instant) -> Self {
        Self {
            uid,
            entries: EntryMap::new(),
            granted: EntryMap::new(),
            renewal: false,
            requester: None,
            bind_time: now,
            bound_time: None,
            send_time: None,
            round_trip_time: None,
            expire_time: None,
            unbinding: Vec::new(),
        }
    }

    /// Returns the identifier of the current record.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// Returns the bound entries.
    pub fn entries(&self) -> &EntryMap {
        &self.entries
    }

    /// Returns the entries the directory service has acknowledged.
    pub fn granted(&self) -> &EntryMap {
        &self.granted
    }

    /// Returns when the current record was first sent.
    pub fn bind_time(&self) -> Instant {
        self.bind_time
    }

    /// Returns when the current record was last acknowledged.
    pub fn bound_time(&self) -> Option<Instant> {
        self.bound_time
    }

    /// Returns when the outstanding exchange was sent.
    pub fn send_time(&self) -> Option<Instant> {
        self.send_time
    }

    /// Returns the smoothed round trip time.
    pub fn round_trip_time(&self) -> Option<Duration> {
        self.round_trip_time
    }

    /// Returns when the lease runs out.
    pub fn expire_time(&self) -> Option<Instant> {
        self.expire_time
    }

    /// Wraps a query for the requester.
    fn wrap(&self, query: ModifyQuery) -> ModifyQuery {
        match &self.requester {
            Some(requester) => query.tagged(requester.clone()),
            None => query,
        }
    }

    /// Returns the current record.
    fn record(&self, ttd: Duration) -> Record {
        Record::new(self.uid.clone(), ttd, self.entries.clone())
    }
}

//------------ LeaseManager ---------------------------------------------------

/// A notification for the handlers.
type Event = (Request, Outcome, Option<Instant>);

/// Binds, renews, and unbinds entries at the directory service.
pub struct LeaseManager {
    /// The configuration.
    config: Config,

    /// The name of the local agent.
    agent: Arc<str>,

    /// The transport to the directory service.
    transport: Arc<ClientTransport>,

    /// The source of record identifiers.
    uids: Arc<dyn UidService>,

    /// Where to deliver outcomes.
    dispatch: Weak<dyn Dispatch>,

    /// The leases by name.
    leases: Mutex<HashMap<String, ClientLease>>,

    /// Runs the renewal sweep.
    renewer: Restart,
}

impl LeaseManager {
    /// Creates a new lease manager.
    ///
    /// The manager registers itself with `transport` for modify answers.
    /// This must be called from within a Tokio runtime.
    pub fn new(
        agent: Arc<str>,
        transport: Arc<ClientTransport>,
        uids: Arc<dyn UidService>,
        dispatch: Weak<dyn Dispatch>,
        config: Config,
    ) -> Arc<Self> {
        let res = Arc::new_cyclic(|me: &Weak<Self>| Self {
            renewer: Restart::spawn("lease-renewal", me.clone(), |this| async move {
                this.renew()
            }),
            config,
            agent,
            transport,
            uids,
            dispatch,
            leases: Default::default(),
        });
        let client: Weak<dyn ModifyClient> = Arc::downgrade(&res) as _;
        res.transport.add_modify_client(client);
        res.renewer.schedule(res.config.check_period);
        res
    }

    /// Returns a copy of the lease of `name`.
    pub fn lease(&self, name: &str) -> Option<ClientLease> {
        self.leases.lock().get(name).cloned()
    }

    /// Binds an entry.
    ///
    /// The outcome is delivered via [`Dispatch::execute`] for a bind
    /// request of `entry`.
    pub fn bind(
        &self,
        entry: AddressEntry,
        overwrite: bool,
        renewal: bool,
        requester: Option<Arc<str>>,
    ) {
        let now = Instant::now();
        let requester =
            requester.filter(|requester| requester.as_ref() != self.agent.as_ref());
        let mut events = Vec::new();
        let mut send = None;
        {
            let mut leases = self.leases.lock();
            let lease = leases.entry(entry.name().into()).or_insert_with(|| {
                ClientLease::new(self.uids.next_uid(), now)
            });
            match lease.entries.get(entry.typ()) {
                Some(current) if current == &entry => {
                    lease.renewal |= renewal;
                    if let (Some(_), Some(expires)) =
                        (lease.bound_time, lease.expire_time)
                    {
                        events.push((
                            Request::bind(entry),
                            Ok(Reply::Bound { expires }),
                            Some(expires),
                        ));
                    }
                }
                _ if refuses(&lease.granted, &entry, overwrite) => {
                    let granted =
                        lease.granted.get(entry.typ()).map(|granted| granted.uri());
                    let denied = LeaseDenied::new(
                        lease.uid.clone(),
                        format!(
                            "{} {} is bound to {}",
                            entry.name(),
                            entry.typ(),
                            granted.unwrap_or_default()
                        ),
                        Some(Record::new(
                            lease.uid.clone(),
                            self.config.default_ttd,
                            lease.granted.clone(),
                        )),
                    );
                    debug!("refusing to overwrite: {denied}");
                    events.push((
                        Request::bind(entry),
                        Err(Error::Denied(denied)),
                        None,
                    ));
                }
                _ => {
                    if lease.requester != requester && !lease.entries.is_empty()
                    {
                        warn!(
                            "lease of {} changes hands from {} to {}",
                            entry.name(),
                            lease.requester.as_deref().unwrap_or(&self.agent),
                            requester.as_deref().unwrap_or(&self.agent),
                        );
                    }
                    lease.requester = requester;
                    lease.renewal |= renewal;
                    lease.unbinding.retain(|unbinding| unbinding != &entry);
                    lease.entries.insert(entry.typ().into(), entry.clone());
                    send = Some(self.new_version(entry.name(), lease, now));
                }
            }
        }
        if let Some((name, query)) = send {
            self.transport.modify([(name, query)].into());
        }
        self.dispatch(events)
    }

    /// Unbinds an entry.
    ///
    /// The outcome is delivered via [`Dispatch::execute`] for an unbind
    /// request of `entry`.
    pub fn unbind(&self, entry: AddressEntry) {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut send = None;
        {
            let mut leases = self.leases.lock();
            match leases.get_mut(entry.name()) {
                Some(lease) if lease.entries.get(entry.typ()) == Some(&entry) => {
                    lease.entries.remove(entry.typ());
                    lease.unbinding.push(entry.clone());
                    send = Some(self.new_version(entry.name(), lease, now));
                }
                _ => {
                    trace!("{entry} is not bound");
                    events.push((Request::unbind(entry), Ok(Reply::Unbound), None));
                }
            }
        }
        if let Some((name, query)) = send {
            self.transport.modify([(name, query)].into());
        }
        self.dispatch(events)
    }

    /// Gives a lease a new record and returns the query to send it.
    fn new_version(
        &self,
        name: &str,
        lease: &mut ClientLease,
        now: Instant,
    ) -> (String, ModifyQuery) {
        lease.uid = self.uids.next_uid();
        lease.bind_time = now;
        lease.bound_time = None;
        lease.send_time = Some(now);
        trace!("sending record {} for {name}", lease.uid);
        let query = ModifyQuery::Record(lease.record(self.config.default_ttd));
        (name.into(), lease.wrap(query))
    }

    /// Runs the renewal sweep.
    fn renew(&self) {
        let now = Instant::now();
        let mut queries = HashMap::new();
        let mut events = Vec::new();
        {
            let mut leases = self.leases.lock();
            leases.retain(|name, lease| {
                let (bound, expire) = match (lease.bound_time, lease.expire_time)
                {
                    (Some(bound), Some(expire)) => (bound, expire),
                    _ => return true,
                };
                if !lease.renewal {
                    if now < expire {
                        return true;
                    }
                    info!("lease of {name} lapsed");
                    for entry in lease.entries.values() {
                        events.push((
                            Request::unbind(entry.clone()),
                            Ok(Reply::Unbound),
                            None,
                        ));
                    }
                    return false;
                }
                if lease.send_time.is_some() {
                    return true;
                }
                let at = renewal_time(
                    bound,
                    expire,
                    lease.round_trip_time.unwrap_or_default(),
                    self.config.renew_ratio,
                    self.config.check_period,
                );
                if now >= at {
                    trace!("renewing lease {} of {name}", lease.uid);
                    lease.send_time = Some(now);
                    let query = lease.wrap(ModifyQuery::Renew(lease.uid.clone()));
                    queries.insert(name.clone(), query);
                }
                true
            });
        }
        self.renewer.schedule(self.config.check_period);
        if !queries.is_empty() {
            self.transport.modify(queries)
        }
        self.dispatch(events)
    }

    /// Delivers events to the handlers.
    fn dispatch(&self, events: Vec<Event>) {
        if events.is_empty() {
            return;
        }
        if let Some(dispatch) = self.dispatch.upgrade() {
            for (request, result, ttl) in events {
                dispatch.execute(&request, &result, ttl)
            }
        }
    }
}

impl ModifyClient for LeaseManager {
    fn modify_answers(
        &self,
        base_time: Instant,
        answers: HashMap<String, ModifyAnswer>,
    ) {
        let now = Instant::now();
        let mut events = Vec::new();
        let mut resend = HashMap::new();
        {
            let mut leases = self.leases.lock();
            for (name, answer) in answers {
                let lease = match leases.get_mut(&name) {
                    Some(lease) if lease.uid == *answer.uid() => lease,
                    _ => {
                        debug!("discarding stale answer for lease of {name}");
                        continue;
                    }
                };
                match answer {
                    ModifyAnswer::Lease(granted) => {
                        if let Some(sent) = lease.send_time.take() {
                            let sample = now.saturating_duration_since(sent);
                            let weight = self.config.rtt_weight;
                            lease.round_trip_time = Some(match lease.round_trip_time {
                                Some(old) => {
                                    old.mul_f64(weight) + sample.mul_f64(1.0 - weight)
                                }
                                None => sample,
                            });
                        }
                        let expires = base_time + granted.ttd();
                        lease.bound_time = Some(now);
                        lease.expire_time = Some(expires);
                        lease.granted = lease.entries.clone();
                        trace!("lease {} of {name} runs until {expires:?}", lease.uid);
                        for entry in lease.entries.values() {
                            events.push((
                                Request::bind(entry.clone()),
                                Ok(Reply::Bound { expires }),
                                Some(expires),
                            ));
                        }
                        for entry in lease.unbinding.drain(..) {
                            events.push((Request::unbind(entry), Ok(Reply::Unbound), None));
                        }
                        if lease.entries.is_empty() {
                            debug!("lease of {name} released");
                            leases.remove(&name);
                        }
                    }
                    ModifyAnswer::NotKnown(_) => {
                        debug!("lease {} of {name} not known, sending record", lease.uid);
                        lease.send_time = Some(now);
                        let query = ModifyQuery::Record(
                            lease.record(self.config.default_ttd),
                        );
                        resend.insert(name, lease.wrap(query));
                    }
                    ModifyAnswer::Denied(denied) => {
                        warn!("{denied}");
                        if let Some(lease) = leases.remove(&name) {
                            for entry in lease.entries.into_values() {
                                events.push((
                                    Request::bind(entry),
                                    Err(Error::Denied(denied.clone())),
                                    None,
                                ));
                            }
                            for entry in lease.unbinding {
                                events.push((
                                    Request::unbind(entry),
                                    Err(Error::Denied(denied.clone())),
                                    None,
                                ));
                            }
                        }
                    }
                }
            }
        }
        if !resend.is_empty() {
            self.transport.modify(resend)
        }
        self.dispatch(events)
    }
}

//------------ Helper Functions ----------------------------------------------

/// Returns whether a bind of `entry` has to be refused.
///
/// Only an acknowledged entry of the same type is protected. A bind that
/// has not been granted yet can always be replaced.
pub fn refuses(granted: &EntryMap, entry: &AddressEntry, overwrite: bool) -> bool {
    !overwrite
        && granted
            .get(entry.typ())
            .map(|granted| granted != entry)
            .unwrap_or(false)
}

/// Returns when a lease should be renewed.
///
/// This is the given share of the time between the last acknowledgement
/// and the expiry less one round trip, moved one check period earlier so
/// the sweep does not miss it. It is never before the acknowledgement.
pub fn renewal_time(
    bound: Instant,
    expire: Instant,
    round_trip_time: Duration,
    renew_ratio: f64,
    check_period: Duration,
) -> Instant {
    let span = expire
        .saturating_duration_since(bound)
        .saturating_sub(round_trip_time);
    let at = bound + span.mul_f64(renew_ratio);
    at.checked_sub(check_period).unwrap_or(bound).max(bound)
}

//============ Testing =======================================================
