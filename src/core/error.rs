use std::fmt;

#[derive(Debug)]
pub enum Error {
    Io(std::io::Error),
    NoSpace { needed: u64, available: u64 },
    MapFailed(std::io::Error),
    InvalidParams(&'static str),
    ArchiveError(String),
    ReplayLost,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(err) => write!(f, "io error: {err}"),
            Error::NoSpace { needed, available } => write!(
                f,
                "insufficient usable storage: needed={needed} available={available}"
            ),
            Error::MapFailed(err) => write!(f, "error mapping raw log: {err}"),
            Error::InvalidParams(msg) => write!(f, "invalid params: {msg}"),
            Error::ArchiveError(msg) => write!(f, "archive error: {msg}"),
            Error::ReplayLost => write!(f, "replay session lost before merge"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(err) => Some(err),
            Error::MapFailed(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(value: std::io::Error) -> Self {
        Error::Io(value)
    }
}

pub type Result<T> = std::result::Result<T, Error>;
