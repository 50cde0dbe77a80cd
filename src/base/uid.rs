//! Unique identifiers.
//!
//! A [`Uid`] versions records and correlates lease acknowledgements with
//! the record they acknowledge. Identifiers are only ever compared for
//! equality.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

//------------ Uid -----------------------------------------------------------

/// A globally unique identifier.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Uid {
    /// The identity that issued the identifier.
    owner: Arc<str>,

    /// A number unique for the owner.
    id: u64,
}

impl Uid {
    /// Creates a new identifier.
    pub fn new(owner: impl Into<Arc<str>>, id: u64) -> Self {
        Self {
            owner: owner.into(),
            id,
        }
    }

    /// Returns the identity that issued the identifier.
    pub fn owner(&self) -> &str {
        &self.owner
    }

    /// Returns the per-owner number.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl fmt::Display for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.owner, self.id)
    }
}

//------------ UidService ----------------------------------------------------

/// A source of fresh unique identifiers.
pub trait UidService: Send + Sync {
    /// Returns an identifier that has never been returned before.
    fn next_uid(&self) -> Uid;
}

//------------ CounterUids ---------------------------------------------------

/// Issues identifiers from a counter scoped by an owner name.
///
/// Identifiers are unique as long as the owner name is unique and the
/// service is not recreated with the same name during the lifetime of the
/// records it versioned. Adding a start offset (such as the process start
/// time) avoids collisions across restarts.
#[derive(Debug)]
pub struct CounterUids {
    /// The owner recorded in every identifier.
    owner: Arc<str>,

    /// The next number.
    next: AtomicU64,
}

impl CounterUids {
    /// Creates a service counting from one.
    pub fn new(owner: impl Into<Arc<str>>) -> Self {
        Self::starting_at(owner, 1)
    }

    /// Creates a service counting from `start`.
    pub fn starting_at(owner: impl Into<Arc<str>>, start: u64) -> Self {
        Self {
            owner: owner.into(),
            next: AtomicU64::new(start),
        }
    }
}

impl UidService for CounterUids {
    fn next_uid(&self) -> Uid {
        Uid {
            owner: self.owner.clone(),
            id: self.next.fetch_add(1, Ordering::Relaxed),
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn counter_uids_are_distinct() {
        let uids = CounterUids::new("node1");
        let a = uids.next_uid();
        let b = uids.next_uid();
        assert_ne!(a, b);
        assert_eq!(a.owner(), "node1");
        assert_eq!(a.clone(), a);
        assert_eq!(format!("{a}"), "node1/1");
    }
}
