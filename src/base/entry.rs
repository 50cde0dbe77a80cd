//! Typed name to address bindings.

use std::error;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

//------------ Well-known Types ----------------------------------------------

/// The type of an alias entry.
///
/// The URI of an alias entry names the identity the alias points to in the
/// form `name:///<identity>`.
pub const ALIAS_TYPE: &str = "alias";

/// The type of an entry that marks the version of an agent's transport.
pub const VERSION_TYPE: &str = "version";

/// The URI scheme prefix used by alias entries.
const ALIAS_SCHEME: &str = "name:///";

//------------ AddressEntry --------------------------------------------------

/// A single binding of a name to an address for a given type.
///
/// A name can have many entries, at most one per type. Entries are
/// immutable and compared structurally.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AddressEntry {
    /// The name of the entity.
    name: Arc<str>,

    /// The kind of binding.
    typ: Arc<str>,

    /// The address.
    uri: Arc<str>,
}

impl AddressEntry {
    /// Creates a new entry.
    pub fn new(
        name: impl Into<Arc<str>>,
        typ: impl Into<Arc<str>>,
        uri: impl Into<Arc<str>>,
    ) -> Self {
        Self {
            name: name.into(),
            typ: typ.into(),
            uri: uri.into(),
        }
    }

    /// Creates an alias entry pointing `name` at `target`.
    pub fn alias(name: impl Into<Arc<str>>, target: &str) -> Self {
        Self::new(name, ALIAS_TYPE, format!("{ALIAS_SCHEME}{target}"))
    }

    /// Returns the name of the entry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the type of the entry.
    pub fn typ(&self) -> &str {
        &self.typ
    }

    /// Returns the address of the entry.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Returns whether this is an alias entry.
    pub fn is_alias(&self) -> bool {
        &*self.typ == ALIAS_TYPE
    }

    /// Returns the identity an alias entry points to.
    ///
    /// Returns `None` if this is not an alias entry or the URI is not of
    /// the form `name:///<identity>`.
    pub fn alias_target(&self) -> Option<&str> {
        if !self.is_alias() {
            return None;
        }
        self.uri
            .strip_prefix(ALIAS_SCHEME)
            .filter(|target| !target.is_empty())
    }

    /// Returns whether all parts of the entry are non-empty and free of
    /// whitespace.
    pub fn is_valid(&self) -> bool {
        [&self.name, &self.typ, &self.uri].iter().all(|part| {
            !part.is_empty() && !part.chars().any(char::is_whitespace)
        })
    }
}

impl fmt::Display for AddressEntry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} {} {}", self.name, self.typ, self.uri)
    }
}

impl FromStr for AddressEntry {
    type Err = EntryError;

    /// Parses an entry from its whitespace separated presentation form.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let (Some(name), Some(typ), Some(uri)) =
            (words.next(), words.next(), words.next())
        else {
            return Err(EntryError::MissingField);
        };
        if words.next().is_some() {
            return Err(EntryError::TrailingData);
        }
        Ok(Self::new(name, typ, uri))
    }
}

//------------ EntryError ----------------------------------------------------

/// An error happened while parsing an address entry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum EntryError {
    /// Fewer than three fields.
    MissingField,

    /// More than three fields.
    TrailingData,
}

impl fmt::Display for EntryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            EntryError::MissingField => {
                f.write_str("expected name, type, and uri")
            }
            EntryError::TrailingData => f.write_str("trailing data"),
        }
    }
}

impl error::Error for EntryError {}

//============ Testing =======================================================
