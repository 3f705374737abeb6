use std::{error, fmt, io, result};

/// Outcomes a name-service lookup or build can surface to its caller.
///
/// `Range` is the only retryable kind: the caller may enlarge its scratch
/// buffer and repeat the query. `Unavailable` covers a missing or corrupt
/// database and unsupported address families; a caller falls back to its
/// next source. `InvalidInput` is raised by the build side only and aborts
/// the build.
#[derive(Debug)]
pub enum NssError {
    NotFound,
    Range,
    Unavailable,
    InvalidInput(&'static str),
    IoError(io::Error),
}

impl From<io::Error> for NssError {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            NssError::Unavailable
        } else {
            NssError::IoError(e)
        }
    }
}

impl From<mcdb::Error> for NssError {
    fn from(e: mcdb::Error) -> Self {
        match e {
            mcdb::Error::Range => NssError::Range,
            mcdb::Error::Unavailable
            | mcdb::Error::HeaderTooShort(_)
            | mcdb::Error::SlotOutOfRange(_) => NssError::Unavailable,
            mcdb::Error::RecordTooLarge => NssError::InvalidInput("record too large"),
            mcdb::Error::IoError(err) => NssError::IoError(err),
        }
    }
}

impl fmt::Display for NssError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            NssError::NotFound => write!(f, "Entry not found"),
            NssError::Range => write!(f, "Buffer too small, retry with a larger one"),
            NssError::Unavailable => write!(f, "Database unavailable"),
            NssError::InvalidInput(what) => write!(f, "Invalid input: {}", what),
            NssError::IoError(_) => write!(f, "I/O Error"),
        }
    }
}

impl error::Error for NssError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            NssError::IoError(ref err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = result::Result<T, NssError>;
