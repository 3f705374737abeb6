use std::{error, fmt, io, result};

/// Unified errors for opening, reading and building constant database files
#[derive(Debug)]
pub enum Error {
    IoError(io::Error),
    /// database file does not exist (callers may fall back elsewhere)
    Unavailable,
    /// file is too short to hold the 4096 byte slot header
    HeaderTooShort(u64),
    /// a slot descriptor points past the end of the file
    SlotOutOfRange(u8),
    /// caller-supplied buffer too small; retry with a larger one
    Range,
    /// key or value too large for the on-disk u32 length fields
    RecordTooLarge,
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        if e.kind() == io::ErrorKind::NotFound {
            Error::Unavailable
        } else {
            Error::IoError(e)
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::IoError(_) => write!(f, "I/O Error"),
            Error::Unavailable => write!(f, "Database file not available"),
            Error::HeaderTooShort(sz) => {
                write!(f, "File of {} bytes is too short for the slot header", sz)
            }
            Error::SlotOutOfRange(slot) => {
                write!(f, "Slot {} bucket extends past the end of the file", slot)
            }
            Error::Range => write!(f, "Buffer too small"),
            Error::RecordTooLarge => write!(f, "Record key or value exceeds the format limit"),
        }
    }
}

impl error::Error for Error {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            Error::IoError(ref err) => Some(err),
            _ => None,
        }
    }
}

pub type Result<T> = result::Result<T, Error>;
