//! An in-process directory server for the integration tests.
#![allow(dead_code)]

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use whitepages::base::{
    Answer, AnswerPayload, Lease, LeaseDenied, LeaseNotKnown, Listing,
    LookupAnswer, LookupQuery, Message, ModifyAnswer, ModifyQuery, Query,
    QueryPayload, Record, RecordIsValid, Uid,
};
use whitepages::net::{MessageHandler, MessageTransport};

//------------ MockServer ----------------------------------------------------

/// A directory server keeping its records in memory.
pub struct MockServer {
    /// The server's name.
    name: String,

    /// The relative time to death handed out with lookups.
    lookup_ttd: Mutex<Duration>,

    /// The records by name.
    records: Mutex<HashMap<String, Record>>,

    /// Names whose binds are refused.
    denied: Mutex<HashSet<String>>,

    /// Issues listing identifiers.
    next_uid: AtomicU64,
}

impl MockServer {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.into(),
            lookup_ttd: Mutex::new(Duration::from_secs(60)),
            records: Default::default(),
            denied: Default::default(),
            next_uid: AtomicU64::new(1),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn set_lookup_ttd(&self, ttd: Duration) {
        *self.lookup_ttd.lock() = ttd
    }

    pub fn insert(&self, name: &str, record: Record) {
        self.records.lock().insert(name.into(), record);
    }

    pub fn record(&self, name: &str) -> Option<Record> {
        self.records.lock().get(name).cloned()
    }

    /// Forgets all records as if the server restarted.
    pub fn forget(&self) {
        self.records.lock().clear()
    }

    pub fn deny(&self, name: &str) {
        self.denied.lock().insert(name.into());
    }

    fn uid(&self) -> Uid {
        Uid::new(self.name.as_str(), self.next_uid.fetch_add(1, Ordering::SeqCst))
    }

    /// Answers a query.
    pub fn answer(&self, query: &Query) -> Answer {
        let payload = match &query.payload {
            QueryPayload::Lookup(names) => AnswerPayload::Lookup(
                names
                    .iter()
                    .map(|(name, query)| (name.clone(), self.lookup(name, query)))
                    .collect(),
            ),
            QueryPayload::Modify(names) | QueryPayload::Forward(names) => {
                AnswerPayload::Modify(
                    names
                        .iter()
                        .map(|(name, query)| (name.clone(), self.modify(name, query)))
                        .collect(),
                )
            }
        };
        Answer {
            source: self.name.as_str().into(),
            target: query.source.clone(),
            send_time: query.send_time,
            reply_time: Instant::now(),
            use_server_time: true,
            payload,
        }
    }

    fn lookup(&self, name: &str, query: &LookupQuery) -> LookupAnswer {
        let ttd = *self.lookup_ttd.lock();
        let records = self.records.lock();
        if name.starts_with('.') {
            let names: BTreeSet<String> = records
                .keys()
                .filter(|key| key.ends_with(name) && key.len() > name.len())
                .cloned()
                .collect();
            return LookupAnswer::Listing(Listing::new(self.uid(), ttd, names));
        }
        match (records.get(name), query) {
            (Some(record), LookupQuery::Validate(uid)) if record.uid() == uid => {
                LookupAnswer::Valid(RecordIsValid::new(uid.clone(), ttd))
            }
            (Some(record), _) => LookupAnswer::Record(Record::new(
                record.uid().clone(),
                ttd,
                record.data().clone(),
            )),
            (None, _) => LookupAnswer::Record(Record::from_entries(self.uid(), ttd, [])),
        }
    }

    fn modify(&self, name: &str, query: &ModifyQuery) -> ModifyAnswer {
        let mut records = self.records.lock();
        match query.untagged() {
            ModifyQuery::Record(record) => {
                if self.denied.lock().contains(name) {
                    return ModifyAnswer::Denied(LeaseDenied::new(
                        record.uid().clone(),
                        format!("{name} is reserved"),
                        records.get(name).cloned(),
                    ));
                }
                let lease = Lease::new(record.uid().clone(), record.ttd());
                if record.is_empty() {
                    records.remove(name);
                } else {
                    records.insert(name.into(), record.clone());
                }
                ModifyAnswer::Lease(lease)
            }
            ModifyQuery::Renew(uid) => match records.get(name) {
                Some(record) if record.uid() == uid => {
                    ModifyAnswer::Lease(Lease::new(uid.clone(), record.ttd()))
                }
                _ => ModifyAnswer::NotKnown(LeaseNotKnown::new(uid.clone())),
            },
            ModifyQuery::Tagged(_) => {
                unreachable!("untagged query is never tagged")
            }
        }
    }
}

//------------ MockNetwork ---------------------------------------------------

/// A message transport connecting the client to mock servers.
#[derive(Default)]
pub struct MockNetwork {
    servers: Mutex<HashMap<String, Arc<MockServer>>>,
    handlers: Mutex<Vec<Weak<dyn MessageHandler>>>,
    sent: Mutex<Vec<Query>>,

    /// How many of the next queries are lost.
    lose: AtomicUsize,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Default::default()
    }

    pub fn add_server(&self, server: Arc<MockServer>) {
        self.servers.lock().insert(server.name().into(), server);
    }

    /// Loses the next `count` queries.
    pub fn lose(&self, count: usize) {
        self.lose.store(count, Ordering::SeqCst)
    }

    /// Returns all queries sent so far.
    pub fn sent(&self) -> Vec<Query> {
        self.sent.lock().clone()
    }

    pub fn lookups(&self) -> Vec<HashMap<String, LookupQuery>> {
        self.sent()
            .into_iter()
            .filter_map(|query| match query.payload {
                QueryPayload::Lookup(map) => Some(map),
                _ => None,
            })
            .collect()
    }

    pub fn modifies(&self) -> Vec<HashMap<String, ModifyQuery>> {
        self.sent()
            .into_iter()
            .filter_map(|query| match query.payload {
                QueryPayload::Modify(map) => Some(map),
                _ => None,
            })
            .collect()
    }
}

impl MessageTransport for MockNetwork {
    fn send(&self, message: Message) {
        let query = match message {
            Message::Query(query) => query,
            Message::Answer(_) => return,
        };
        self.sent.lock().push(query.clone());
        let lost = self
            .lose
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if lost {
            return;
        }
        let server = self.servers.lock().get(query.target.name()).cloned();
        let Some(server) = server else { return };
        let answer = Message::Answer(server.answer(&query));
        let handlers: Vec<_> = self
            .handlers
            .lock()
            .iter()
            .filter_map(Weak::upgrade)
            .collect();
        for handler in handlers {
            handler.receive(answer.clone())
        }
    }

    fn register_handler(&self, handler: Weak<dyn MessageHandler>) {
        self.handlers.lock().push(handler)
    }
}
