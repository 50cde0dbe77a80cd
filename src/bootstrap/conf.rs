//! Reading the boot table.
//!
//! The boot table lists where to look for the directory service before any
//! of its servers is known. Each line holds one boot entry in the
//! presentation form of an [`AddressEntry`]: the symbolic name, the type,
//! and the URI of the external registry to ask. Everything after a `#` is
//! a comment.
//!
//! ```text
//! # name  type  registry
//! WP      -RMI  rmi://registry.example:1099/WP
//! ```
//!
//! A table is read leniently. Lines that do not parse are logged and
//! skipped so that one bad line does not take the whole table with it.

use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use std::{error, fmt};

use tracing::warn;

use crate::base::entry::EntryError;
use crate::base::AddressEntry;

//------------ Functions -----------------------------------------------------

/// Loads the boot table from a file.
pub fn load(path: impl AsRef<Path>) -> Result<Vec<AddressEntry>, Error> {
    parse(BufReader::new(File::open(path)?))
}

/// Parses a boot table.
///
/// Only reading the input can fail. Malformed lines are skipped.
pub fn parse(input: impl BufRead) -> Result<Vec<AddressEntry>, Error> {
    let mut res = Vec::new();
    for (idx, line) in input.lines().enumerate() {
        match parse_line(&line?, idx + 1) {
            Ok(Some(entry)) => res.push(entry),
            Ok(None) => {}
            Err(err) => warn!("boot table: {err}"),
        }
    }
    Ok(res)
}

/// Parses a boot table held in a string.
pub fn parse_str(input: &str) -> Vec<AddressEntry> {
    // Reading from a slice cannot fail.
    parse(input.as_bytes()).unwrap_or_default()
}

/// Parses a single line.
///
/// Returns `Ok(None)` for empty and comment lines.
pub fn parse_line(line: &str, number: usize) -> Result<Option<AddressEntry>, Error> {
    let line = match line.find('#') {
        Some(pos) => &line[..pos],
        None => line,
    };
    if line.trim().is_empty() {
        return Ok(None);
    }
    match line.parse::<AddressEntry>() {
        Ok(entry) => Ok(Some(entry)),
        Err(error) => Err(Error::Parse {
            line: number,
            error,
        }),
    }
}

//------------ Error ---------------------------------------------------------

/// An error happened while reading the boot table.
#[derive(Debug)]
pub enum Error {
    /// Reading the input failed.
    Io(io::Error),

    /// A line could not be parsed.
    Parse {
        /// The line number, starting at one.
        line: usize,

        /// What was wrong with it.
        error: EntryError,
    },
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "{err}"),
            Error::Parse { line, error } => write!(f, "line {line}: {error}"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::Parse { error, .. } => Some(error),
        }
    }
}

//============ Testing =======================================================

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn bad_lines_are_skipped() {
        let table = "\
            # boot table\n\
            WP -RMI rmi://registry:1099/WP\n\
            \n\
            broken line\n\
            WP -HTTP http://registry/WP  # second transport\n\
            too many fields here at all\n";
        assert_eq!(
            parse_str(table),
            vec![
                AddressEntry::new("WP", "-RMI", "rmi://registry:1099/WP"),
                AddressEntry::new("WP", "-HTTP", "http://registry/WP"),
            ]
        );
    }

    #[test]
    fn line_errors() {
        assert!(matches!(parse_line("  # only a comment", 1), Ok(None)));
        match parse_line("WP -RMI", 7) {
            Err(Error::Parse { line, error }) => {
                assert_eq!(line, 7);
                assert_eq!(error, EntryError::MissingField);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_file() {
        assert!(matches!(
            load("/nonexistent/whitepages/boot.table"),
            Err(Error::Io(_))
        ));
    }
}
