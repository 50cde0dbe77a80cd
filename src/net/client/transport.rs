//! Reliable batched exchanges with the directory service.
//!
//! The client transport keeps one table of outstanding work per direction,
//! lookups and modifications, with at most one entry per name. Work handed
//! to it is merged into these tables and sent by a background task, so
//! everything that arrives at about the same time travels in one message
//! per server.
//!
//! Each sent entry carries the deadline of the address it was sent to. Once
//! the deadline passes, the server is charged with a lost exchange and the
//! entry is sent again, possibly to a different server. Entries stay in the
//! table until a matching answer arrives.
//!
//! Answers are queued by the receiving side and processed by a second
//! background task. An answer for a name is only accepted if it matches
//! what is currently outstanding for that name. Accepted answers are passed
//! on to the registered [`LookupClient`]s and [`ModifyClient`]s together
//! with the base time their relative times count from.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::base::{
    Answer, AnswerPayload, LeaseNotKnown, LookupAnswer, LookupQuery, Message,
    MessageAddress, ModifyAnswer, ModifyQuery, Query, QueryPayload,
};
use crate::net::{MessageHandler, MessageTransport};
use crate::utils::config::DefMinMax;
use crate::utils::restart::Restart;

use super::select::SelectManager;

/// How often outstanding work is checked at the least.
const CHECK_PERIOD: DefMinMax<Duration> = DefMinMax::new(
    Duration::from_secs(1),
    Duration::from_millis(10),
    Duration::from_secs(60),
);

//------------ Config ---------------------------------------------------------

/// Configuration of a client transport.
#[derive(Clone, Debug)]
pub struct Config {
    /// The longest time between two checks of outstanding work.
    check_period: Duration,

    /// Whether to trust the servers' clocks.
    use_server_time: bool,
}

impl Config {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the longest time between two checks of outstanding work.
    ///
    /// The value has to be at least ten milliseconds, at most 60 seconds
    /// and the default is one second.
    pub fn set_check_period(&mut self, value: Duration) {
        self.check_period = CHECK_PERIOD.limit(value)
    }

    /// Returns the check period.
    pub fn check_period(&self) -> Duration {
        self.check_period
    }

    /// Set whether relative times count from the server's reply time.
    ///
    /// Even if set, this only applies to answers that ask for it. Otherwise
    /// the base time is estimated as half the round trip after the query
    /// was sent. The default is true.
    pub fn set_use_server_time(&mut self, value: bool) {
        self.use_server_time = value
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_period: CHECK_PERIOD.default(),
            use_server_time: true,
        }
    }
}

//------------ Clients --------------------------------------------------------

/// Receives accepted lookup answers.
pub trait LookupClient: Send + Sync {
    /// Processes answers whose relative times count from `base_time`.
    fn lookup_answers(
        &self,
        base_time: Instant,
        answers: HashMap<String, LookupAnswer>,
    );
}

/// Receives accepted modify answers.
pub trait ModifyClient: Send + Sync {
    /// Processes answers whose relative times count from `base_time`.
    fn modify_answers(
        &self,
        base_time: Instant,
        answers: HashMap<String, ModifyAnswer>,
    );
}

/// Wraps outgoing modifications, for instance to sign them.
pub trait Protect: Send + Sync {
    /// Returns the query to send in place of `query`.
    fn protect(&self, name: &str, query: ModifyQuery) -> ModifyQuery;
}

//------------ ClientTransport -----------------------------------------------

/// Sends lookups and modifications until they are answered.
pub struct ClientTransport {
    /// The configuration.
    config: Config,

    /// The name of the local agent.
    agent: Arc<str>,

    /// The underlying message transport.
    transport: Arc<dyn MessageTransport>,

    /// The server pool.
    select: Arc<SelectManager>,

    /// The wrapper for outgoing modifications.
    protect: Mutex<Option<Arc<dyn Protect>>>,

    /// The receivers of lookup answers.
    lookup_clients: Mutex<Vec<Weak<dyn LookupClient>>>,

    /// The receivers of modify answers.
    modify_clients: Mutex<Vec<Weak<dyn ModifyClient>>>,

    /// The outstanding work.
    inner: Mutex<Inner>,

    /// Answers waiting to be processed.
    incoming: Mutex<VecDeque<Answer>>,

    /// Runs the send and retry task.
    sender: Restart,

    /// Runs the receive task.
    receiver: Restart,
}

#[derive(Default)]
struct Inner {
    lookups: HashMap<String, Pending<LookupQuery>>,
    modifies: HashMap<String, Pending<ModifyQuery>>,
}

/// Outstanding work for one name.
#[derive(Clone, Debug)]
struct Pending<Q> {
    /// When the query was last sent, `None` if it still has to be.
    send_time: Option<Instant>,

    /// When to give up on the last send.
    deadline: Option<Instant>,

    /// Where the query was last sent to.
    target: Option<Arc<MessageAddress>>,

    /// The query.
    query: Q,
}

impl<Q> Pending<Q> {
    fn new(query: Q) -> Self {
        Self {
            send_time: None,
            deadline: None,
            target: None,
            query,
        }
    }

    /// Returns whether the last send was given up on at `now`.
    ///
    /// Marks the entry for sending again and returns the server and send
    /// time of the lost exchange.
    fn expire(&mut self, now: Instant) -> Option<(Arc<str>, Instant)> {
        match (self.send_time, self.deadline) {
            (Some(sent), Some(deadline)) if deadline <= now => {
                let target = self.target.take()?;
                self.send_time = None;
                self.deadline = None;
                Some((target.name().into(), sent))
            }
            _ => None,
        }
    }

    /// Marks the entry as sent to `target`.
    fn sent(&mut self, target: &Arc<MessageAddress>, now: Instant) {
        self.send_time = Some(now);
        self.deadline = target.deadline();
        self.target = Some(target.clone());
    }
}

impl ClientTransport {
    /// Creates a client transport for the local `agent`.
    ///
    /// The new value registers itself with `transport` for incoming
    /// messages and with `select` for new servers. This must be called
    /// from within a Tokio runtime.
    pub fn new(
        agent: Arc<str>,
        transport: Arc<dyn MessageTransport>,
        select: Arc<SelectManager>,
        config: Config,
    ) -> Arc<Self> {
        let res = Arc::new_cyclic(|me: &Weak<Self>| {
            let listener = me.clone();
            select.add_listener(move || {
                if let Some(this) = listener.upgrade() {
                    this.sender.restart()
                }
            });
            Self {
                config,
                agent,
                transport,
                select,
                protect: Default::default(),
                lookup_clients: Default::default(),
                modify_clients: Default::default(),
                inner: Default::default(),
                incoming: Default::default(),
                sender: Restart::spawn(
                    "client-transport-send",
                    me.clone(),
                    |this| async move { this.send_pending() },
                ),
                receiver: Restart::spawn(
                    "client-transport-receive",
                    me.clone(),
                    |this| async move { this.process_incoming() },
                ),
            }
        });
        let handler: Weak<dyn MessageHandler> = Arc::downgrade(&res) as _;
        res.transport.register_handler(handler);
        res
    }

    /// Returns the name of the local agent.
    pub fn agent(&self) -> &Arc<str> {
        &self.agent
    }

    /// Returns the server pool.
    pub fn select(&self) -> &Arc<SelectManager> {
        &self.select
    }

    /// Registers a receiver for lookup answers.
    pub fn add_lookup_client(&self, client: Weak<dyn LookupClient>) {
        self.lookup_clients.lock().push(client)
    }

    /// Registers a receiver for modify answers.
    pub fn add_modify_client(&self, client: Weak<dyn ModifyClient>) {
        self.modify_clients.lock().push(client)
    }

    /// Sets the wrapper for outgoing modifications.
    pub fn set_protect(&self, protect: Arc<dyn Protect>) {
        *self.protect.lock() = Some(protect)
    }

    /// Returns the number of names with outstanding lookups.
    pub fn pending_lookups(&self) -> usize {
        self.inner.lock().lookups.len()
    }

    /// Returns the number of names with outstanding modifications.
    pub fn pending_modifies(&self) -> usize {
        self.inner.lock().modifies.len()
    }

    /// Queues lookups.
    ///
    /// A lookup already outstanding for a name is only replaced if the new
    /// query asks for more: a full fetch outranks validation.
    pub fn lookup(&self, queries: HashMap<String, LookupQuery>) {
        let mut added = false;
        {
            let mut inner = self.inner.lock();
            for (name, query) in queries {
                if should_send_lookup(inner.lookups.get(&name), &query) {
                    inner.lookups.insert(name, Pending::new(query));
                    added = true;
                } else {
                    trace!("lookup of {name} already outstanding");
                }
            }
        }
        if added {
            self.sender.restart()
        }
    }

    /// Queues modifications.
    ///
    /// A modification replaces whatever different modification is
    /// outstanding for a name.
    pub fn modify(&self, queries: HashMap<String, ModifyQuery>) {
        let mut added = false;
        {
            let mut inner = self.inner.lock();
            for (name, query) in queries {
                let current = inner.modifies.get(&name);
                if current.map(|pending| pending.query != query).unwrap_or(true) {
                    inner.modifies.insert(name, Pending::new(query));
                    added = true;
                } else {
                    trace!("modification of {name} already outstanding");
                }
            }
        }
        if added {
            self.sender.restart()
        }
    }

    /// Sends everything due and schedules the next check.
    fn send_pending(&self) {
        let now = Instant::now();
        let mut lookups = HashMap::<_, HashMap<_, _>>::new();
        let mut modifies = HashMap::<_, HashMap<_, _>>::new();
        let mut not_known = HashMap::new();
        let next = {
            let mut inner = self.inner.lock();
            let inner = &mut *inner;

            let mut lost = HashSet::new();
            lost.extend(
                inner
                    .lookups
                    .values_mut()
                    .filter_map(|pending| pending.expire(now)),
            );
            inner.modifies.retain(|name, pending| {
                let expired = match pending.expire(now) {
                    Some(expired) => expired,
                    None => return true,
                };
                lost.insert(expired);
                if name.as_str() == self.agent.as_ref()
                    && pending.query.is_renewal()
                {
                    debug!("renewal of {name} got lost, assuming lease unknown");
                    not_known.insert(
                        name.clone(),
                        ModifyAnswer::NotKnown(LeaseNotKnown::new(
                            pending.query.uid().clone(),
                        )),
                    );
                    return false;
                }
                true
            });
            for (server, sent) in lost {
                debug!("exchange with {server} timed out");
                self.select.update(&server, now.duration_since(sent), true);
            }

            if let Some(target) = self.select.select() {
                for (name, pending) in inner.lookups.iter_mut() {
                    if pending.send_time.is_none() {
                        pending.sent(&target, now);
                        lookups
                            .entry(target.clone())
                            .or_default()
                            .insert(name.clone(), pending.query.clone());
                    }
                }
                for (name, pending) in inner.modifies.iter_mut() {
                    if pending.send_time.is_none() {
                        pending.sent(&target, now);
                        modifies
                            .entry(target.clone())
                            .or_default()
                            .insert(name.clone(), pending.query.clone());
                    }
                }
            } else if !inner.lookups.is_empty() || !inner.modifies.is_empty() {
                debug!("no directory server known, holding outstanding work");
            }

            inner
                .lookups
                .values()
                .filter_map(|pending| pending.deadline)
                .chain(inner.modifies.values().filter_map(|pending| pending.deadline))
                .min()
        };

        if let Some(next) = next {
            self.sender
                .schedule_at(next.min(now + self.config.check_period))
        }

        for (target, queries) in lookups {
            self.send(target, now, QueryPayload::Lookup(queries))
        }
        if !modifies.is_empty() {
            let protect = self.protect.lock().clone();
            for (target, mut queries) in modifies {
                if let Some(protect) = &protect {
                    queries = queries
                        .into_iter()
                        .map(|(name, query)| {
                            let query = protect.protect(&name, query);
                            (name, query)
                        })
                        .collect();
                }
                self.send(target, now, QueryPayload::Modify(queries))
            }
        }
        if !not_known.is_empty() {
            self.deliver_modify(now, not_known)
        }
    }

    /// Sends a query.
    fn send(
        &self,
        target: Arc<MessageAddress>,
        now: Instant,
        payload: QueryPayload,
    ) {
        trace!(
            "sending {} query for {} names to {target}",
            payload.action(),
            payload.len()
        );
        self.transport.send(Message::Query(Query {
            source: self.agent.clone(),
            target,
            send_time: now,
            payload,
        }))
    }

    /// Processes all queued answers.
    fn process_incoming(&self) {
        loop {
            let answer = match self.incoming.lock().pop_front() {
                Some(answer) => answer,
                None => break,
            };
            self.process_answer(answer)
        }
    }

    /// Processes one answer.
    fn process_answer(&self, answer: Answer) {
        let now = Instant::now();
        let rtt = now.saturating_duration_since(answer.send_time);
        let base_time = if self.config.use_server_time && answer.use_server_time
        {
            answer.reply_time
        } else {
            answer.send_time + rtt / 2
        };
        self.select.update(&answer.source, rtt, false);

        match answer.payload {
            AnswerPayload::Lookup(answers) => {
                let accepted = {
                    let mut inner = self.inner.lock();
                    let mut accepted = HashMap::new();
                    for (name, item) in answers {
                        let matches = inner
                            .lookups
                            .get(&name)
                            .map(|pending| {
                                pending.send_time.is_some()
                                    && lookup_matches(&pending.query, &item)
                            })
                            .unwrap_or(false);
                        if matches {
                            inner.lookups.remove(&name);
                            accepted.insert(name, item);
                        } else {
                            debug!(
                                "discarding stale lookup answer for {name} from {}",
                                answer.source
                            );
                        }
                    }
                    accepted
                };
                if !accepted.is_empty() {
                    self.deliver_lookup(base_time, accepted)
                }
            }
            AnswerPayload::Modify(answers) => {
                let accepted = {
                    let mut inner = self.inner.lock();
                    let mut accepted = HashMap::new();
                    for (name, item) in answers {
                        let matches = inner
                            .modifies
                            .get(&name)
                            .map(|pending| {
                                pending.send_time.is_some()
                                    && pending.query.uid() == item.uid()
                            })
                            .unwrap_or(false);
                        if matches {
                            inner.modifies.remove(&name);
                            accepted.insert(name, item);
                        } else {
                            debug!(
                                "discarding stale modify answer for {name} from {}",
                                answer.source
                            );
                        }
                    }
                    accepted
                };
                if !accepted.is_empty() {
                    self.deliver_modify(base_time, accepted)
                }
            }
            AnswerPayload::Forward(_) => {
                debug!("ignoring forward answer from {}", answer.source)
            }
        }
    }

    fn deliver_lookup(
        &self,
        base_time: Instant,
        answers: HashMap<String, LookupAnswer>,
    ) {
        let clients = upgrade_all(&self.lookup_clients);
        for client in clients {
            client.lookup_answers(base_time, answers.clone())
        }
    }

    fn deliver_modify(
        &self,
        base_time: Instant,
        answers: HashMap<String, ModifyAnswer>,
    ) {
        let clients = upgrade_all(&self.modify_clients);
        for client in clients {
            client.modify_answers(base_time, answers.clone())
        }
    }
}

impl MessageHandler for ClientTransport {
    fn receive(&self, message: Message) {
        match message {
            Message::Answer(answer) if answer.target == self.agent => {
                self.incoming.lock().push_back(answer);
                self.receiver.restart();
            }
            Message::Answer(answer) => {
                trace!("ignoring answer for {}", answer.target)
            }
            Message::Query(query) => {
                trace!("ignoring {} query from {}", query.action(), query.source)
            }
        }
    }
}

//------------ Helper Functions ----------------------------------------------

/// Returns whether a new lookup needs to replace the outstanding one.
fn should_send_lookup(
    current: Option<&Pending<LookupQuery>>,
    query: &LookupQuery,
) -> bool {
    match current {
        None => true,
        Some(pending) => match (&pending.query, query) {
            (LookupQuery::Full, _) => false,
            (LookupQuery::Validate(old), LookupQuery::Validate(new)) => {
                old != new
            }
            (LookupQuery::Validate(_), LookupQuery::Full) => true,
        },
    }
}

/// Returns whether an answer is an answer to the outstanding lookup.
fn lookup_matches(query: &LookupQuery, answer: &LookupAnswer) -> bool {
    match (query, answer) {
        (LookupQuery::Validate(uid), LookupAnswer::Valid(valid)) => {
            valid.uid() == uid
        }
        (LookupQuery::Full, LookupAnswer::Valid(_)) => false,
        (_, LookupAnswer::Record(_) | LookupAnswer::Listing(_)) => true,
    }
}

/// Upgrades the live clients and forgets the others.
fn upgrade_all<T: ?Sized>(clients: &Mutex<Vec<Weak<T>>>) -> Vec<Arc<T>> {
    let mut clients = clients.lock();
    clients.retain(|client| client.strong_count() > 0);
    clients.iter().filter_map(Weak::upgrade).collect()
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::{Lease, Record, RecordIsValid, Uid};
    use crate::net::client::select;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Query>>,
    }

    impl MessageTransport for Recorder {
        fn send(&self, message: Message) {
            if let Message::Query(query) = message {
                self.sent.lock().push(query)
            }
        }

        fn register_handler(&self, _handler: Weak<dyn MessageHandler>) {}
    }

    #[derive(Default)]
    struct Answers {
        lookups: Mutex<Vec<HashMap<String, LookupAnswer>>>,
        modifies: Mutex<Vec<HashMap<String, ModifyAnswer>>>,
    }

    impl LookupClient for Answers {
        fn lookup_answers(&self, _: Instant, answers: HashMap<String, LookupAnswer>) {
            self.lookups.lock().push(answers)
        }
    }

    impl ModifyClient for Answers {
        fn modify_answers(&self, _: Instant, answers: HashMap<String, ModifyAnswer>) {
            self.modifies.lock().push(answers)
        }
    }

    struct Setup {
        recorder: Arc<Recorder>,
        answers: Arc<Answers>,
        transport: Arc<ClientTransport>,
    }

    fn setup() -> Setup {
        let mut config = select::Config::new();
        config.set_random_weight(0.0);
        let select = Arc::new(SelectManager::new(config));
        select.add_alias(&crate::base::AddressEntry::new("WP-1", "-RMI", "rmi://1"));
        let recorder = Arc::new(Recorder::default());
        let transport = ClientTransport::new(
            "node1".into(),
            recorder.clone(),
            select,
            Config::new(),
        );
        let answers = Arc::new(Answers::default());
        let lookup: Weak<dyn LookupClient> = Arc::downgrade(&answers) as _;
        let modify: Weak<dyn ModifyClient> = Arc::downgrade(&answers) as _;
        transport.add_lookup_client(lookup);
        transport.add_modify_client(modify);
        Setup {
            recorder,
            answers,
            transport,
        }
    }

    fn answer(query: &Query, payload: AnswerPayload) -> Message {
        Message::Answer(Answer {
            source: query.target.name().into(),
            target: "node1".into(),
            send_time: query.send_time,
            reply_time: Instant::now(),
            use_server_time: false,
            payload,
        })
    }

    fn names(names: &[&str], query: LookupQuery) -> HashMap<String, LookupQuery> {
        names
            .iter()
            .map(|name| (name.to_string(), query.clone()))
            .collect()
    }

    #[test]
    fn lookup_promotion() {
        let uid = Uid::new("s", 1);
        let validate = Pending::new(LookupQuery::Validate(uid.clone()));
        let full = Pending::new(LookupQuery::Full);
        assert!(should_send_lookup(None, &LookupQuery::Full));
        assert!(should_send_lookup(Some(&validate), &LookupQuery::Full));
        assert!(!should_send_lookup(
            Some(&validate),
            &LookupQuery::Validate(uid.clone())
        ));
        assert!(!should_send_lookup(Some(&full), &LookupQuery::Validate(uid)));
    }

    #[tokio::test(start_paused = true)]
    async fn lookups_are_batched() {
        let setup = setup();
        setup.transport.lookup(names(&["A", "B"], LookupQuery::Full));
        setup.transport.lookup(names(&["B", "C"], LookupQuery::Full));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let sent = setup.recorder.sent.lock().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].payload.len(), 3);
        assert_eq!(sent[0].target.name(), "WP-1");
    }

    #[tokio::test(start_paused = true)]
    async fn lost_queries_are_resent() {
        let setup = setup();
        setup.transport.lookup(names(&["A"], LookupQuery::Full));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(setup.recorder.sent.lock().len(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(setup.recorder.sent.lock().len(), 2);
        let timeout = setup.transport.select().timeout("WP-1").unwrap();
        assert!(timeout > Duration::from_millis(1500));
    }

    #[tokio::test(start_paused = true)]
    async fn matching_answers_are_delivered() {
        let setup = setup();
        setup.transport.lookup(names(&["A"], LookupQuery::Full));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let query = setup.recorder.sent.lock()[0].clone();

        let record = Record::from_entries(Uid::new("s", 1), Duration::from_secs(60), []);
        // An answer for a name we never asked about.
        let stale = [("B".to_string(), LookupAnswer::Record(record.clone()))];
        setup.transport.receive(answer(&query, AnswerPayload::Lookup(stale.into())));
        let good = [("A".to_string(), LookupAnswer::Record(record))];
        setup.transport.receive(answer(&query, AnswerPayload::Lookup(good.into())));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let delivered = setup.answers.lookups.lock().clone();
        assert_eq!(delivered.len(), 1);
        assert!(delivered[0].contains_key("A"));
        assert_eq!(setup.transport.pending_lookups(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn valid_answer_needs_validation_query() {
        let setup = setup();
        setup.transport.lookup(names(&["A"], LookupQuery::Full));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let query = setup.recorder.sent.lock()[0].clone();
        let valid = RecordIsValid::new(Uid::new("s", 1), Duration::from_secs(60));
        let payload = [("A".to_string(), LookupAnswer::Valid(valid))];
        setup.transport.receive(answer(&query, AnswerPayload::Lookup(payload.into())));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(setup.answers.lookups.lock().is_empty());
        assert_eq!(setup.transport.pending_lookups(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lost_own_renewal_is_not_known() {
        let setup = setup();
        let uid = Uid::new("node1", 3);
        let renew = [("node1".to_string(), ModifyQuery::Renew(uid.clone()))];
        setup.transport.modify(renew.into());
        tokio::time::sleep(Duration::from_secs(3)).await;

        let delivered = setup.answers.modifies.lock().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(
            delivered[0].get("node1"),
            Some(&ModifyAnswer::NotKnown(LeaseNotKnown::new(uid)))
        );
        assert_eq!(setup.transport.pending_modifies(), 0);
    }

    struct Signer;

    impl Protect for Signer {
        fn protect(&self, _name: &str, query: ModifyQuery) -> ModifyQuery {
            query.tagged("signer")
        }
    }

    #[tokio::test(start_paused = true)]
    async fn modifications_are_protected() {
        let setup = setup();
        setup.transport.set_protect(Arc::new(Signer));
        let uid = Uid::new("node1", 7);
        let record = Record::from_entries(uid.clone(), Duration::from_secs(60), []);
        setup
            .transport
            .modify([("A".to_string(), ModifyQuery::Record(record.clone()))].into());
        setup.transport.lookup(names(&["B"], LookupQuery::Full));
        tokio::time::sleep(Duration::from_millis(1)).await;

        let sent = setup.recorder.sent.lock().clone();
        let modify = sent
            .iter()
            .find_map(|query| match &query.payload {
                QueryPayload::Modify(map) => Some((query.clone(), map.clone())),
                _ => None,
            })
            .unwrap();
        match modify.1.get("A") {
            Some(ModifyQuery::Tagged(tag)) => {
                assert_eq!(tag.agent(), "signer");
                assert_eq!(tag.query(), &ModifyQuery::Record(record));
            }
            other => panic!("unexpected query {other:?}"),
        }
        assert!(sent
            .iter()
            .any(|query| matches!(query.payload, QueryPayload::Lookup(_))));

        // The answer is matched against the unprotected query.
        let lease = ModifyAnswer::Lease(Lease::new(uid, Duration::from_secs(60)));
        let payload = [("A".to_string(), lease.clone())];
        setup
            .transport
            .receive(answer(&modify.0, AnswerPayload::Modify(payload.into())));
        tokio::time::sleep(Duration::from_millis(1)).await;
        let delivered = setup.answers.modifies.lock().clone();
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].get("A"), Some(&lease));
        assert_eq!(setup.transport.pending_modifies(), 0);
    }
}
