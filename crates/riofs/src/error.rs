//! Error type shared by every file operation.
//!
//! Recoverable conditions (execution failures, sandbox rejections) never
//! show up here: they are posted into readable files so that clients which
//! only speak the file protocol can observe them. This enum is reserved for
//! genuinely invalid requests.

use std::{fmt, io};

pub type Result<T> = ::std::result::Result<T, Error>;

/// Protocol-level errors, reported to clients as error replies.
#[derive(Debug)]
pub enum Error {
    /// Write to a read-only file or read of a write-only file.
    Permission,

    /// Malformed command written to a control-style file.
    Usage(String),

    /// Walk to a missing child, goto of an unknown version.
    NotFound(String),

    /// Operation on a fid the server does not know.
    BadFid(u32),

    /// The referent of a weak handle (terminal, widget) is gone.
    Gone,

    /// Underlying I/O failure (PTY write, OS file access).
    Io(io::Error),

    /// A `state` payload that cannot be parsed or has the wrong version.
    CorruptState(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Permission => write!(f, "permission denied"),
            Error::Usage(msg) => write!(f, "usage: {msg}"),
            Error::NotFound(what) => write!(f, "{what}: not found"),
            Error::BadFid(fid) => write!(f, "unknown fid {fid}"),
            Error::Gone => write!(f, "no longer exists"),
            Error::Io(e) => write!(f, "{e}"),
            Error::CorruptState(msg) => write!(f, "corrupt state: {msg}"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::CorruptState(e.to_string())
    }
}

#[macro_export]
macro_rules! usage {
    ($($arg:tt)*) => {
        $crate::error::Error::Usage(format!($($arg)*))
    };
}

#[macro_export]
macro_rules! not_found {
    ($($arg:tt)*) => {
        $crate::error::Error::NotFound(format!($($arg)*))
    };
}
