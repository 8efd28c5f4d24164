use std::fmt::Display;
use std::io;

/// shaledb errors.
#[derive(Debug)]
pub enum Error {
    /// On-disk data failed validation: a checksum or magic number mismatch,
    /// a malformed varint, a truncated record, or an unexpected tag byte.
    /// The first value names the structure that failed to decode. A file
    /// that produced this error must be treated as unusable.
    Corruption(&'static str, String),
    /// An IO error from the underlying file system.
    Io(io::Error),
    /// A blob index referenced a file number the manager does not track.
    /// Readers report this as corruption of the referencing index.
    FileNotFound(u64),
    /// Misconfigured options or misuse of an API, refused up front.
    InvalidArgument(String),
}

impl Error {
    pub(crate) fn corruption(what: &'static str, reason: impl Into<String>) -> Self {
        Error::Corruption(what, reason.into())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            Error::Corruption(what, reason) => write!(f, "corruption in {what}: {reason}"),
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::FileNotFound(number) => write!(f, "blob file {number} is not tracked"),
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {msg}"),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error::Io(err)
    }
}

/// A shaledb Result returning Error.
pub type Result<T> = std::result::Result<T, Error>;
