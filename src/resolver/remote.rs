//! The terminal handler talking to the directory service.
//!
//! Lookups are handed to the [`ClientTransport`], binds and unbinds to the
//! [`LeaseManager`]. The remote handler never resolves a response itself.
//! Results travel back through [`Dispatch::execute`] where the batch and
//! lease handlers resolve the responses waiting for them.
//!
//! The handler remembers the last record or listing received per name. A
//! later lookup of the same name only asks the service whether that
//! version is still current.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use moka::sync::Cache;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::base::{Listing, LookupAnswer, LookupQuery, Record, Uid};
use crate::net::client::transport::{ClientTransport, LookupClient};
use crate::utils::config::DefMinMax;

use super::cache::lru_cache;
use super::handler::{Dispatch, Handler};
use super::lease_manager::LeaseManager;
use super::request::{Outcome, Reply, Request, Response};

/// Configuration limit for the number of remembered versions.
const MAX_REMEMBERED: DefMinMax<u64> = DefMinMax::new(10_000, 0, 1_000_000_000);

//------------ Config ---------------------------------------------------------

/// Configuration of the remote handler.
#[derive(Clone, Debug)]
pub struct Config {
    /// Maximum number of remembered versions.
    max_remembered: u64,
}

impl Config {
    /// Creates a new config with default values.
    pub fn new() -> Self {
        Default::default()
    }

    /// Set the maximum number of records and listings remembered.
    ///
    /// With zero, every lookup fetches the full record. The value has to
    /// be at most 1,000,000,000 and the default is 10,000.
    pub fn set_max_remembered(&mut self, value: u64) {
        self.max_remembered = MAX_REMEMBERED.limit(value)
    }

    /// Returns the maximum number of remembered versions.
    pub fn max_remembered(&self) -> u64 {
        self.max_remembered
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_remembered: MAX_REMEMBERED.default(),
        }
    }
}

//------------ Known ----------------------------------------------------------

/// A version received from the service.
#[derive(Clone, Debug)]
enum Known {
    Record(Record),
    Listing(Listing),
}

impl Known {
    fn uid(&self) -> &Uid {
        match self {
            Known::Record(record) => record.uid(),
            Known::Listing(listing) => listing.uid(),
        }
    }

    /// Returns the request and result this version answers.
    fn result(&self, name: &str) -> (Request, Outcome) {
        match self {
            Known::Record(record) => (
                Request::get_all(name),
                Ok(Reply::Entries(record.data().clone())),
            ),
            Known::Listing(listing) => (
                Request::list(name),
                Ok(Reply::Names(listing.names().clone())),
            ),
        }
    }
}

//------------ RemoteHandler -------------------------------------------------

/// Sends what the local handlers could not answer.
pub struct RemoteHandler {
    /// The transport for lookups.
    transport: Arc<ClientTransport>,

    /// The lease manager for binds and unbinds.
    leases: Arc<LeaseManager>,

    /// Where to deliver results.
    dispatch: Weak<dyn Dispatch>,

    /// The last version received per name or suffix.
    known: Cache<String, Known>,
}

impl RemoteHandler {
    /// Creates a new remote handler.
    ///
    /// The handler registers itself with `transport` for lookup answers.
    pub fn new(
        transport: Arc<ClientTransport>,
        leases: Arc<LeaseManager>,
        dispatch: Weak<dyn Dispatch>,
        config: Config,
    ) -> Arc<Self> {
        let res = Arc::new(Self {
            transport,
            leases,
            dispatch,
            known: lru_cache(config.max_remembered),
        });
        let client: Weak<dyn LookupClient> = Arc::downgrade(&res) as _;
        res.transport.add_lookup_client(client);
        res
    }

    /// Returns the identifier of the version remembered for a name.
    pub fn known_uid(&self, name: &str) -> Option<Uid> {
        self.known.get(name).map(|known| known.uid().clone())
    }

    /// Asks the service about a name or suffix.
    fn lookup(&self, name: &str) {
        let query = match self.known.get(name) {
            Some(known) => LookupQuery::Validate(known.uid().clone()),
            None => LookupQuery::Full,
        };
        trace!("looking up {name} ({query:?})");
        self.transport.lookup([(name.to_string(), query)].into())
    }
}

impl Handler for RemoteHandler {
    fn submit(&self, response: Response) -> Option<Response> {
        match response.request() {
            Request::Get { name, .. } | Request::GetAll { name, .. } => {
                self.lookup(name)
            }
            Request::List { suffix, .. } => self.lookup(suffix),
            Request::Bind {
                entry,
                overwrite,
                renewal,
                requester,
                ..
            } => self.leases.bind(
                entry.clone(),
                *overwrite,
                *renewal,
                requester.clone(),
            ),
            Request::Unbind { entry, .. } => self.leases.unbind(entry.clone()),
        }
        None
    }
}

impl LookupClient for RemoteHandler {
    fn lookup_answers(
        &self,
        base_time: Instant,
        answers: HashMap<String, LookupAnswer>,
    ) {
        let mut events = Vec::new();
        let mut refetch = HashMap::new();
        for (name, answer) in answers {
            let (known, ttd) = match answer {
                LookupAnswer::Record(record) => {
                    let ttd = record.ttd();
                    (Known::Record(record), ttd)
                }
                LookupAnswer::Listing(listing) => {
                    let ttd = listing.ttd();
                    (Known::Listing(listing), ttd)
                }
                LookupAnswer::Valid(valid) => match self.known.get(&name) {
                    Some(known) if known.uid() == valid.uid() => {
                        (known, valid.ttd())
                    }
                    _ => {
                        debug!("{name}: validated version is gone, fetching");
                        self.known.invalidate(&name);
                        refetch.insert(name, LookupQuery::Full);
                        continue;
                    }
                },
            };
            let (request, result) = known.result(&name);
            events.push((request, result, base_time + ttd));
            self.known.insert(name, known);
        }
        if !refetch.is_empty() {
            self.transport.lookup(refetch)
        }
        if let Some(dispatch) = self.dispatch.upgrade() {
            for (request, result, ttl) in events {
                dispatch.execute(&request, &result, Some(ttl))
            }
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;
    use crate::base::{
        entry_map, AddressEntry, CounterUids, Message, Query, QueryPayload,
        RecordIsValid,
    };
    use crate::net::client::select::{self, SelectManager};
    use crate::net::client::transport;
    use crate::net::{MessageHandler, MessageTransport};
    use crate::resolver::lease_manager;
    use parking_lot::Mutex;
    use std::collections::BTreeSet;
    use std::time::Duration;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<Query>>,
    }

    impl Recorder {
        fn lookups(&self) -> Vec<HashMap<String, LookupQuery>> {
            self.sent
                .lock()
                .iter()
                .filter_map(|query| match &query.payload {
                    QueryPayload::Lookup(map) => Some(map.clone()),
                    _ => None,
                })
                .collect()
        }
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
    struct Events {
        events: Mutex<Vec<(Request, Outcome, Option<Instant>)>>,
    }

    impl Dispatch for Events {
        fn execute(&self, request: &Request, result: &Outcome, ttl: Option<Instant>) {
            self.events
                .lock()
                .push((request.clone(), result.clone(), ttl))
        }
    }

    fn setup() -> (Arc<Recorder>, Arc<Events>, Arc<RemoteHandler>) {
        let select = Arc::new(SelectManager::new(select::Config::new()));
        select.add_alias(&AddressEntry::new("WP-1", "-RMI", "rmi://1"));
        let recorder = Arc::new(Recorder::default());
        let transport = ClientTransport::new(
            "node1".into(),
            recorder.clone(),
            select,
            transport::Config::new(),
        );
        let events = Arc::new(Events::default());
        let dispatch: Weak<dyn Dispatch> = Arc::downgrade(&events) as _;
        let leases = LeaseManager::new(
            "node1".into(),
            transport.clone(),
            Arc::new(CounterUids::new("node1")),
            dispatch.clone(),
            lease_manager::Config::new(),
        );
        let remote = RemoteHandler::new(transport, leases, dispatch, Config::new());
        (recorder, events, remote)
    }

    fn record(id: u64) -> Record {
        Record::from_entries(
            Uid::new("WP-1", id),
            Duration::from_secs(30),
            [AddressEntry::new("AgentX", "-RMI", "rmi://x")],
        )
    }

    #[tokio::test(start_paused = true)]
    async fn records_are_dispatched() {
        let (_, events, remote) = setup();
        let base = Instant::now();
        remote.lookup_answers(
            base,
            [("AgentX".to_string(), LookupAnswer::Record(record(1)))].into(),
        );
        assert_eq!(
            events.events.lock().clone(),
            vec![(
                Request::get_all("AgentX"),
                Ok(Reply::Entries(entry_map([AddressEntry::new(
                    "AgentX", "-RMI", "rmi://x"
                )]))),
                Some(base + Duration::from_secs(30))
            )]
        );
        assert_eq!(remote.known_uid("AgentX"), Some(Uid::new("WP-1", 1)));
    }

    #[tokio::test(start_paused = true)]
    async fn remembered_versions_are_validated() {
        let (recorder, events, remote) = setup();
        remote.lookup_answers(
            Instant::now(),
            [("AgentX".to_string(), LookupAnswer::Record(record(1)))].into(),
        );
        assert!(remote.submit(Response::new(Request::get_all("AgentX"))).is_none());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(
            recorder.lookups()[0].get("AgentX"),
            Some(&LookupQuery::Validate(Uid::new("WP-1", 1)))
        );

        let base = Instant::now();
        let valid = RecordIsValid::new(Uid::new("WP-1", 1), Duration::from_secs(60));
        remote.lookup_answers(
            base,
            [("AgentX".to_string(), LookupAnswer::Valid(valid))].into(),
        );
        let last = events.events.lock().last().cloned().unwrap();
        assert_eq!(last.0, Request::get_all("AgentX"));
        assert_eq!(last.2, Some(base + Duration::from_secs(60)));
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_validation_refetches() {
        let (recorder, events, remote) = setup();
        let valid = RecordIsValid::new(Uid::new("WP-1", 7), Duration::from_secs(60));
        remote.lookup_answers(
            Instant::now(),
            [("AgentX".to_string(), LookupAnswer::Valid(valid))].into(),
        );
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(events.events.lock().is_empty());
        assert_eq!(
            recorder.lookups()[0].get("AgentX"),
            Some(&LookupQuery::Full)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn listings_answer_lists() {
        let (recorder, events, remote) = setup();
        remote.submit(Response::new(Request::list("agents")));
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(
            recorder.lookups()[0].get(".agents"),
            Some(&LookupQuery::Full)
        );

        let names: BTreeSet<String> = ["a.agents".to_string()].into();
        let listing =
            Listing::new(Uid::new("WP-1", 2), Duration::from_secs(10), names.clone());
        remote.lookup_answers(
            Instant::now(),
            [(".agents".to_string(), LookupAnswer::Listing(listing))].into(),
        );
        let last = events.events.lock().last().cloned().unwrap();
        assert_eq!(last.0, Request::list(".agents"));
        assert_eq!(last.1, Ok(Reply::Names(names)));
    }
}
