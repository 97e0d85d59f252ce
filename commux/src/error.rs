//! Error types for the commux runtime.

use std::io;

/// Runtime operation errors.
#[derive(Debug)]
pub enum Error {
    /// A caller-supplied parameter is invalid.
    InvalidParam(&'static str),
    /// Memory allocation failed.
    NoMemory,
    /// IO error from the OS or the underlying transport.
    Io(io::Error),
    /// The requested operation is not supported by any selected transport.
    Unsupported(&'static str),
    /// No usable transport device was found.
    NoDevice,
    /// Temporary back-pressure from a transport; retry after a progress pump.
    NoResource,
    /// Events were already pending when arming; skip the wait and re-progress.
    Busy,
    /// A bounded internal table is full.
    ExceededLimit(&'static str),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidParam(what) => write!(f, "invalid parameter: {}", what),
            Error::NoMemory => write!(f, "out of memory"),
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::Unsupported(what) => write!(f, "unsupported: {}", what),
            Error::NoDevice => write!(f, "no usable transport device"),
            Error::NoResource => write!(f, "transport resources temporarily exhausted"),
            Error::Busy => write!(f, "events already pending"),
            Error::ExceededLimit(what) => write!(f, "limit exceeded: {}", what),
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

impl From<nix::errno::Errno> for Error {
    fn from(e: nix::errno::Errno) -> Self {
        Error::Io(io::Error::from_raw_os_error(e as i32))
    }
}

/// Result type for commux operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_strings() {
        assert_eq!(Error::NoDevice.to_string(), "no usable transport device");
        assert_eq!(Error::Busy.to_string(), "events already pending");
        assert_eq!(
            Error::ExceededLimit("ep configurations").to_string(),
            "limit exceeded: ep configurations"
        );
    }

    #[test]
    fn test_io_source_preserved() {
        let e = Error::from(io::Error::from_raw_os_error(libc_eagain()));
        assert!(std::error::Error::source(&e).is_some());
    }

    fn libc_eagain() -> i32 {
        nix::errno::Errno::EAGAIN as i32
    }
}
