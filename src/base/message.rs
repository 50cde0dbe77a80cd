//! Messages exchanged between a client and the directory service.
//!
//! A [`Query`] carries the work for many names at once, an [`Answer`]
//! carries the results for some or all of them. Both are tagged with an
//! [`Action`] that says whether names are looked up or modified. Names
//! starting with a dot are list queries for all names ending in that
//! suffix.
//!
//! How these messages are encoded and delivered is left to the
//! [`MessageTransport`][crate::net::MessageTransport].

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use tokio::time::Instant;

use super::lease::{Lease, LeaseDenied, LeaseNotKnown, RecordIsValid};
use super::name_tag::NameTag;
use super::record::{Listing, Record};
use super::uid::Uid;

//------------ Action --------------------------------------------------------

/// What a message asks of or tells about its names.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Action {
    /// Read the bindings of names.
    Lookup,

    /// Bind, renew, or unbind names.
    Modify,

    /// Server to server forwarding of modifications.
    Forward,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Action::Lookup => "lookup",
            Action::Modify => "modify",
            Action::Forward => "forward",
        })
    }
}

//------------ MessageAddress ------------------------------------------------

/// The address of a message endpoint.
///
/// An address may carry a deadline after which delivery is pointless. The
/// transport is free to drop messages past their deadline.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct MessageAddress {
    /// The name of the endpoint.
    name: Arc<str>,

    /// When delivery stops being useful.
    deadline: Option<Instant>,
}

impl MessageAddress {
    /// Creates an address without a deadline.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            deadline: None,
        }
    }

    /// Creates an address with a delivery deadline.
    pub fn with_deadline(name: impl Into<Arc<str>>, deadline: Instant) -> Self {
        Self {
            name: name.into(),
            deadline: Some(deadline),
        }
    }

    /// Returns the name of the endpoint.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the delivery deadline.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }
}

impl fmt::Display for MessageAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(&self.name)
    }
}

//------------ LookupQuery ---------------------------------------------------

/// The lookup payload for one name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LookupQuery {
    /// Fetch the full record.
    Full,

    /// Confirm that the record with this identifier is still current.
    Validate(Uid),
}

impl LookupQuery {
    /// Returns whether this is a validating query.
    pub fn is_validate(&self) -> bool {
        matches!(self, LookupQuery::Validate(_))
    }
}

//------------ ModifyQuery ---------------------------------------------------

/// The modify payload for one name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ModifyQuery {
    /// Bind the name to the record's entries.
    Record(Record),

    /// Renew the lease of the record with this identifier.
    Renew(Uid),

    /// A query made on behalf of another identity.
    Tagged(Box<NameTag<ModifyQuery>>),
}

impl ModifyQuery {
    /// Returns the query without any identity tags.
    pub fn untagged(&self) -> &ModifyQuery {
        match self {
            ModifyQuery::Tagged(tag) => tag.query().untagged(),
            other => other,
        }
    }

    /// Returns the identifier of the record this query is about.
    pub fn uid(&self) -> &Uid {
        match self {
            ModifyQuery::Record(record) => record.uid(),
            ModifyQuery::Renew(uid) => uid,
            ModifyQuery::Tagged(tag) => tag.query().uid(),
        }
    }

    /// Returns whether this renews by identifier only.
    pub fn is_renewal(&self) -> bool {
        matches!(self.untagged(), ModifyQuery::Renew(_))
    }

    /// Wraps the query with a requester identity.
    pub fn tagged(self, agent: impl Into<Arc<str>>) -> Self {
        ModifyQuery::Tagged(Box::new(NameTag::new(agent, self)))
    }
}

//------------ LookupAnswer --------------------------------------------------

/// The lookup result for one name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum LookupAnswer {
    /// The full record of a name.
    Record(Record),

    /// The names matching a list query.
    Listing(Listing),

    /// The client's copy is still current.
    Valid(RecordIsValid),
}

impl LookupAnswer {
    /// Returns the identifier of the answered version.
    pub fn uid(&self) -> &Uid {
        match self {
            LookupAnswer::Record(record) => record.uid(),
            LookupAnswer::Listing(listing) => listing.uid(),
            LookupAnswer::Valid(valid) => valid.uid(),
        }
    }
}

//------------ ModifyAnswer --------------------------------------------------

/// The modify result for one name.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum ModifyAnswer {
    /// The binding was granted or renewed.
    Lease(Lease),

    /// The binding was refused.
    Denied(LeaseDenied),

    /// The renewal referred to an unknown lease.
    NotKnown(LeaseNotKnown),
}

impl ModifyAnswer {
    /// Returns the identifier of the record the answer is about.
    pub fn uid(&self) -> &Uid {
        match self {
            ModifyAnswer::Lease(lease) => lease.uid(),
            ModifyAnswer::Denied(denied) => denied.uid(),
            ModifyAnswer::NotKnown(not_known) => not_known.uid(),
        }
    }
}

//------------ Query ---------------------------------------------------------

/// The per-name payload of a query.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum QueryPayload {
    /// Lookups by name.
    Lookup(HashMap<String, LookupQuery>),

    /// Modifications by name.
    Modify(HashMap<String, ModifyQuery>),

    /// Forwarded modifications by name.
    Forward(HashMap<String, ModifyQuery>),
}

impl QueryPayload {
    /// Returns the action of the payload.
    pub fn action(&self) -> Action {
        match self {
            QueryPayload::Lookup(_) => Action::Lookup,
            QueryPayload::Modify(_) => Action::Modify,
            QueryPayload::Forward(_) => Action::Forward,
        }
    }

    /// Returns the number of names in the payload.
    pub fn len(&self) -> usize {
        match self {
            QueryPayload::Lookup(map) => map.len(),
            QueryPayload::Modify(map) | QueryPayload::Forward(map) => {
                map.len()
            }
        }
    }

    /// Returns whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A request sent to the directory service.
#[derive(Clone, Debug)]
pub struct Query {
    /// The sending identity.
    pub source: Arc<str>,

    /// The server the query is for.
    pub target: Arc<MessageAddress>,

    /// When the query was sent.
    pub send_time: Instant,

    /// The names and what to do with them.
    pub payload: QueryPayload,
}

impl Query {
    /// Returns the action of the query.
    pub fn action(&self) -> Action {
        self.payload.action()
    }
}

//------------ Answer --------------------------------------------------------

/// The per-name payload of an answer.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum AnswerPayload {
    /// Lookup results by name.
    Lookup(HashMap<String, LookupAnswer>),

    /// Modify results by name.
    Modify(HashMap<String, ModifyAnswer>),

    /// Forward results by name.
    Forward(HashMap<String, ModifyAnswer>),
}

impl AnswerPayload {
    /// Returns the action of the payload.
    pub fn action(&self) -> Action {
        match self {
            AnswerPayload::Lookup(_) => Action::Lookup,
            AnswerPayload::Modify(_) => Action::Modify,
            AnswerPayload::Forward(_) => Action::Forward,
        }
    }
}

/// A reply from the directory service.
#[derive(Clone, Debug)]
pub struct Answer {
    /// The answering server.
    pub source: Arc<str>,

    /// The identity the answer is for.
    pub target: Arc<str>,

    /// The send time of the query, echoed back.
    pub send_time: Instant,

    /// When the server sent the answer, by the server's clock.
    pub reply_time: Instant,

    /// Whether relative times in the answer count from `reply_time`.
    ///
    /// If not set, the client estimates the base time from the round
    /// trip.
    pub use_server_time: bool,

    /// The results by name.
    pub payload: AnswerPayload,
}

impl Answer {
    /// Returns the action of the answer.
    pub fn action(&self) -> Action {
        self.payload.action()
    }
}

//------------ Message -------------------------------------------------------

/// Any message between client and directory service.
#[derive(Clone, Debug)]
pub enum Message {
    /// A client request.
    Query(Query),

    /// A server reply.
    Answer(Answer),
}

impl Message {
    /// Returns the action of the message.
    pub fn action(&self) -> Action {
        match self {
            Message::Query(query) => query.action(),
            Message::Answer(answer) => answer.action(),
        }
    }
}

//============ Testing =======================================================
