//! Basics.
//!
//! This module provides the value types of the address book and the
//! messages exchanged with the directory service. None of them have any
//! behavior beyond construction, access, and validation.
//!
//! * [`AddressEntry`] is one typed binding of a name to an address.
//! * [`Record`] is the versioned bundle of all entries of one name,
//!   identified by a [`Uid`]. A record is never changed in place; a new
//!   version always gets a fresh identifier.
//! * [`Lease`], [`LeaseDenied`], [`LeaseNotKnown`], and [`RecordIsValid`]
//!   are the answers of the service to modifications and validations.
//! * [`NameTag`] wraps a payload with the identity that requested it.
//! * The [message] module contains the batched [`Query`] and [`Answer`]
//!   messages.

pub mod entry;
pub mod lease;
pub mod message;
pub mod name_tag;
pub mod record;
pub mod uid;

pub use self::entry::{AddressEntry, ALIAS_TYPE, VERSION_TYPE};
pub use self::lease::{Lease, LeaseDenied, LeaseNotKnown, RecordIsValid};
pub use self::message::{
    Action, Answer, AnswerPayload, LookupAnswer, LookupQuery, Message,
    MessageAddress, ModifyAnswer, ModifyQuery, Query, QueryPayload,
};
pub use self::name_tag::NameTag;
pub use self::record::{entry_map, EntryMap, Listing, Record};
pub use self::uid::{CounterUids, Uid, UidService};
