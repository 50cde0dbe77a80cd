//! Answers of the directory service to lookups and modifications.

use std::error;
use std::fmt;
use std::time::Duration;

use super::record::Record;
use super::uid::Uid;

//------------ Lease ---------------------------------------------------------

/// A grant of a binding for a limited time.
///
/// Sent in answer to a new record or to a renewal by identifier.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Lease {
    /// The identifier of the record that was granted.
    uid: Uid,

    /// How long the lease lasts, relative to the time it was sent.
    ttd: Duration,
}

impl Lease {
    /// Creates a new lease.
    pub fn new(uid: Uid, ttd: Duration) -> Self {
        Self { uid, ttd }
    }

    /// Returns the identifier of the granted record.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// Returns the relative time to death.
    pub fn ttd(&self) -> Duration {
        self.ttd
    }
}

//------------ LeaseDenied ---------------------------------------------------

/// The refusal of a binding.
///
/// This is terminal for the bind attempt that sent the record.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LeaseDenied {
    /// The identifier of the refused record.
    uid: Uid,

    /// Why the binding was refused.
    reason: String,

    /// The record the service holds instead, if it wants to tell.
    consensus: Option<Record>,
}

impl LeaseDenied {
    /// Creates a new denial.
    pub fn new(
        uid: Uid,
        reason: impl Into<String>,
        consensus: Option<Record>,
    ) -> Self {
        Self {
            uid,
            reason: reason.into(),
            consensus,
        }
    }

    /// Returns the identifier of the refused record.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// Returns the reason given for the denial.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    /// Returns the record the service holds instead.
    pub fn consensus(&self) -> Option<&Record> {
        self.consensus.as_ref()
    }
}

impl fmt::Display for LeaseDenied {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "lease {} denied: {}", self.uid, self.reason)
    }
}

impl error::Error for LeaseDenied {}

//------------ LeaseNotKnown -------------------------------------------------

/// The service does not know the lease a renewal referred to.
///
/// The client recovers by sending the full record again.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct LeaseNotKnown {
    /// The identifier the renewal referred to.
    uid: Uid,
}

impl LeaseNotKnown {
    /// Creates a new value.
    pub fn new(uid: Uid) -> Self {
        Self { uid }
    }

    /// Returns the identifier the renewal referred to.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }
}

//------------ RecordIsValid -------------------------------------------------

/// Confirms that a client's copy of a record is still current.
///
/// Sent in answer to a validating lookup instead of the full record.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RecordIsValid {
    /// The identifier of the confirmed record.
    uid: Uid,

    /// How much longer the record is valid, relative to the time sent.
    ttd: Duration,
}

impl RecordIsValid {
    /// Creates a new value.
    pub fn new(uid: Uid, ttd: Duration) -> Self {
        Self { uid, ttd }
    }

    /// Returns the identifier of the confirmed record.
    pub fn uid(&self) -> &Uid {
        &self.uid
    }

    /// Returns the relative time to death.
    pub fn ttd(&self) -> Duration {
        self.ttd
    }
}
