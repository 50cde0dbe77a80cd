//! Requester identity tags.

use std::fmt;
use std::sync::Arc;

//------------ NameTag -------------------------------------------------------

/// Wraps a payload with the identity of the agent that requested it.
///
/// Modifications made by a node on behalf of one of its agents carry the
/// agent's name so the service can tell owners apart.
#[derive(Clone, Debug, Eq, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct NameTag<T> {
    /// The requesting identity.
    agent: Arc<str>,

    /// The wrapped payload.
    query: T,
}

impl<T> NameTag<T> {
    /// Creates a new tag.
    pub fn new(agent: impl Into<Arc<str>>, query: T) -> Self {
        Self {
            agent: agent.into(),
            query,
        }
    }

    /// Returns the requesting identity.
    pub fn agent(&self) -> &str {
        &self.agent
    }

    /// Returns the wrapped payload.
    pub fn query(&self) -> &T {
        &self.query
    }

    /// Unwraps the payload.
    pub fn into_query(self) -> T {
        self.query
    }
}

impl<T: fmt::Display> fmt::Display for NameTag<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (for {})", self.query, self.agent)
    }
}
