use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Errors that stop the whole run.
///
/// Anything that only affects a single connection is handled inside the
/// connection state machine and shows up as a statistics counter instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration: {0}")]
    Config(String),

    #[error("failed lookup: {host}: {source}")]
    Resolve {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("no source address shares an address family with any target")]
    NoCompatibleSource,

    #[error("connection pool exhausted ({capacity} records)")]
    PoolExhausted { capacity: usize },

    #[error("{op}(): {source}")]
    Socket {
        op: &'static str,
        #[source]
        source: io::Error,
    },

    #[error("[{local}] -> [{peer}]: {source}")]
    Connection {
        local: String,
        peer: String,
        #[source]
        source: io::Error,
    },

    #[error("{source_addr} -> {target}: connect(): {reason}")]
    Pretest {
        source_addr: String,
        target: SocketAddr,
        reason: String,
    },

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    pub fn socket(op: &'static str, source: io::Error) -> Error {
        Error::Socket { op, source }
    }

    /// Operator hint for errors caused by running out of descriptors.
    pub fn hint(&self) -> Option<&'static str> {
        let source = match self {
            Error::Socket { source, .. } => source,
            Error::Connection { source, .. } => source,
            Error::Io(source) => source,
            _ => return None,
        };
        match source.raw_os_error() {
            Some(libc::EMFILE) | Some(libc::ENFILE) => {
                Some("use ulimit to increase available file descriptors")
            }
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptor_exhaustion_carries_a_hint() {
        let err = Error::socket("socket", io::Error::from_raw_os_error(libc::EMFILE));
        assert!(err.hint().unwrap().contains("ulimit"));
        assert!(err.to_string().starts_with("socket(): "));
    }

    #[test]
    fn other_errors_have_no_hint() {
        let err = Error::socket("bind", io::Error::from_raw_os_error(libc::EADDRINUSE));
        assert!(err.hint().is_none());
        assert!(Error::NoCompatibleSource.hint().is_none());
    }
}
