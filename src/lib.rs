pub mod alphabet;
pub mod bytes;
pub mod config;
pub mod engine;
pub mod ids;
pub mod index;
pub mod registry;
pub mod tables;
pub mod variant;

#[macro_use]
extern crate serde_derive;

use fnv::FnvHashMap as HashMap;
use fnv::FnvHashSet as HashSet;
use std::{fmt, io, path::PathBuf};

#[derive(Debug)]
pub enum Error {
    /// Both half-pages of an index node failed their checksum.
    CorruptedPage,
    IO(io::Error),
    /// Another process holds the exclusive lock on a database file.
    LockedByAnotherProcess(PathBuf),
    /// An internal invariant did not hold; the current operation was discarded.
    AssertionFailed(&'static str),
    /// A CA/PA id was registered twice with different definitions.
    DuplicateUniqueId(u32),
    /// Inserted amino-acid sequence over 7 aa, or a region over the codec budget.
    SequenceTooLong,
    /// Simple modifications of one variant overlap or are out of order.
    OverlappingModifications,
    RequestTerminated,
    /// A stored record did not decode cleanly.
    BadRecord(&'static str),
    TruncatedData,
    BadConfig(String),
    Context(String, Box<Error>),
}

impl Error {
    pub fn with_context<S>(self, msg: S) -> Error
    where
        S: Into<String>,
    {
        Error::Context(msg.into(), Box::new(self))
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Error {
        Error::IO(err)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Context(msg, inner) => write!(f, "{}: {}", msg, inner),
            other => write!(f, "{:?}", other),
        }
    }
}

impl std::error::Error for Error {}

/// CA/PA ids start at 1; zero marks "not assigned yet".
pub const NULL_ID: u32 = 0;
