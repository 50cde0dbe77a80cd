//! Versioned snapshots of the bindings of a name.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use super::entry::AddressEntry;
use super::uid::Uid;

//------------ EntryMap ------------------------------------------------------

/// The entries of one name keyed by their type.
pub type EntryMap = BTreeMap<String, AddressEntry>;

/// Collects entries into an entry map.
///
/// Later entries replace earlier ones of the same type.
pub fn entry_map(entries: impl IntoIterator<Item = AddressEntry>) -> EntryMap {
    entries
        .into_iter()
        .map(|entry| (entry.typ().to_string(), entry))
        .collect()
}

//------------ Record --------------------------------------------------------

/// The authoritative snapshot of all bindings of one name.
///
/// A record is never changed in place. Replacing any of its entries means
/// creating a new record with a fresh identifier, which lets holders of an
/// identifier detect that their copy is stale.
///
/// A record without entries states that the name is not bound.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Record {
    /// The identifier of this version.
    uid: Uid,

    /// The time to death relative to the time the record was sent.
    ttd: Duration,

    /// The entries keyed by type.
    data: EntryMap,
}

impl Record {
    /// Creates a new record.
    pub fn new(uid: Uid, ttd: Duration, data: EntryMap) -> Self {
        Self { uid, ttd, data }
    }

    /// Creates a new record from a list of entries.
    pub fn from_entries(
        uid: Uid,
        ttd: Duration,
        entries: impl IntoIterator<Item = AddressEntry>,
    ) -> Self {
        Self::new(uid, ttd, entry_map(entries))
    }

    /// Returns the identifier of this version.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// Returns the relative time to death.
    pub fn ttd(&self) -> Duration {
        self.ttd
    }

    /// Returns the entries.
    pub fn data(&self) -> &EntryMap {
        &self.data
    }

    /// Converts the record into its entries.
    pub fn into_data(self) -> EntryMap {
        self.data
    }

    /// Returns the entry for the given type.
    pub fn get(&self, typ: &str) -> Option<&AddressEntry> {
        self.data.get(typ)
    }

    /// Returns whether the record has no entries.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Returns whether all entries are valid and share one name.
    pub fn is_consistent(&self) -> bool {
        let mut names = self.data.values().map(AddressEntry::name);
        let first = names.next();
        self.data
            .iter()
            .all(|(typ, entry)| typ == entry.typ() && entry.is_valid())
            && names.all(|name| Some(name) == first)
    }
}

impl fmt::Display for Record {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "record {} ttd {:?} [", self.uid, self.ttd)?;
        for (i, entry) in self.data.values().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{entry}")?;
        }
        f.write_str("]")
    }
}

//------------ Listing -------------------------------------------------------

/// The answer to a list query: the names ending in a suffix.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Listing {
    /// The identifier of this version.
    uid: Uid,

    /// The time to death relative to the time the listing was sent.
    ttd: Duration,

    /// The names.
    names: BTreeSet<String>,
}

impl Listing {
    /// Creates a new listing.
    pub fn new(uid: Uid, ttd: Duration, names: BTreeSet<String>) -> Self {
        Self { uid, ttd, names }
    }

    /// Returns the identifier of this version.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// Returns the relative time to death.
    pub fn ttd(&self) -> Duration {
        self.ttd
    }

    /// Returns the names.
    pub fn names(&self) -> &BTreeSet<String> {
        &self.names
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn consistency() {
        let uid = Uid::new("n", 1);
        let good = Record::from_entries(
            uid.clone(),
            Duration::from_secs(60),
            [
                AddressEntry::new("A", "-RMI", "rmi://a"),
                AddressEntry::new("A", "-HTTP", "http://a"),
            ],
        );
        assert!(good.is_consistent());
        assert_eq!(good.get("-RMI").map(AddressEntry::uri), Some("rmi://a"));

        let mixed = Record::from_entries(
            uid.clone(),
            Duration::from_secs(60),
            [
                AddressEntry::new("A", "-RMI", "rmi://a"),
                AddressEntry::new("B", "-HTTP", "http://b"),
            ],
        );
        assert!(!mixed.is_consistent());

        let empty = Record::new(uid, Duration::from_secs(60), EntryMap::new());
        assert!(empty.is_empty());
        assert!(empty.is_consistent());
    }
}
