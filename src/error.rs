// Error taxonomy for the BDE core.
use std::fmt;

// Header-parse failure variants, wrapped rather than flattened.
use crate::header::HeaderError;
// Metadata/entry-stream parse failure variants, wrapped rather than flattened.
use crate::metadata::MetadataError;

// Define an enumeration for every fallible operation this crate exposes.
#[derive(Debug)]
pub enum Error {
    InvalidArgument(String),
    NotOpen,
    AlreadyOpen,
    StillLocked,
    // Wraps a header-parse failure; see `HeaderError`.
    Header(HeaderError),
    // Wraps a metadata/entry-stream parse failure; see `MetadataError`.
    Metadata(MetadataError),
    // A real I/O failure, or a short/out-of-range read synthesized as one.
    Io { position: u64, len: usize, source: std::io::Error },
    UnsupportedFormat(String),
    Corrupted(String),
    Crypto(String),
    Aborted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::InvalidArgument(msg) => write!(f, "invalid argument: {}", msg),
            Error::NotOpen => write!(f, "volume is not open"),
            Error::AlreadyOpen => write!(f, "volume is already open"),
            Error::StillLocked => write!(f, "volume is still locked"),
            Error::Header(e) => write!(f, "invalid volume header: {}", e),
            Error::Metadata(e) => write!(f, "invalid metadata: {}", e),
            Error::Io { position, len, source } => {
                write!(f, "I/O error at offset {} (len {}): {}", position, len, source)
            }
            Error::UnsupportedFormat(msg) => write!(f, "unsupported format: {}", msg),
            Error::Corrupted(msg) => write!(f, "corrupted metadata: {}", msg),
            Error::Crypto(msg) => write!(f, "cryptographic error: {}", msg),
            Error::Aborted => write!(f, "operation aborted"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Header(e) => Some(e),
            Error::Metadata(e) => Some(e),
            Error::Io { source, .. } => Some(source),
            _ => None,
        }
    }
}

impl From<HeaderError> for Error {
    fn from(e: HeaderError) -> Self {
        Error::Header(e)
    }
}

impl From<MetadataError> for Error {
    fn from(e: MetadataError) -> Self {
        Error::Metadata(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io { position: 0, len: 0, source: e }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
