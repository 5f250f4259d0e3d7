use std::io;

use thiserror::Error;

use crate::completion::Opcode;
use crate::queue::{Qd, QueueKind};
use crate::token::QToken;

#[derive(Debug, Error)]
pub enum Error {
    #[error("queue {0} is not registered")]
    NotFound(Qd),

    #[error("queue {0} is already registered")]
    AlreadyRegistered(Qd),

    #[error("token {0} is unknown or already consumed")]
    InvalidToken(QToken),

    #[error("no tokens to wait on")]
    NoTokens,

    #[error("{op} is not supported on {kind} queues")]
    Unsupported { op: &'static str, kind: QueueKind },

    #[error("{op} is not implemented for {kind} queues")]
    Unimplemented { op: &'static str, kind: QueueKind },

    #[error("connection reset")]
    ConnectionReset,

    #[error("connection aborted")]
    ConnectionAborted,

    #[error("transport error (os error {0})")]
    Transport(i32),

    /// A result was unpacked as the wrong kind of value, such as asking an
    /// accept result for a buffer.
    #[error("{opcode} result carries no {expected}")]
    Mismatch { opcode: Opcode, expected: &'static str },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Map a positive errno, as reported by a syscall or a completion entry.
    pub fn from_errno(code: i32) -> Self {
        match code {
            libc::ECONNRESET | libc::EPIPE => Error::ConnectionReset,
            libc::ECONNABORTED | libc::ECANCELED => Error::ConnectionAborted,
            code => Error::Transport(code),
        }
    }

    pub fn raw_os_error(&self) -> Option<i32> {
        match *self {
            Error::ConnectionReset => Some(libc::ECONNRESET),
            Error::ConnectionAborted => Some(libc::ECONNABORTED),
            Error::Transport(code) => Some(code),
            _ => None,
        }
    }

    /// True for the two ways a connection ends underneath a pending token.
    pub fn is_disconnect(&self) -> bool {
        matches!(self, Error::ConnectionReset | Error::ConnectionAborted)
    }

    pub(crate) fn unsupported(op: &'static str, kind: QueueKind) -> Self {
        Error::Unsupported { op, kind }
    }

    pub(crate) fn unimplemented(op: &'static str, kind: QueueKind) -> Self {
        Error::Unimplemented { op, kind }
    }
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::from_errno(errno as i32)
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.raw_os_error() {
            Some(code) => Error::from_errno(code),
            None => Error::Transport(libc::EIO),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_mapping() {
        assert!(matches!(Error::from_errno(libc::ECONNRESET), Error::ConnectionReset));
        assert!(matches!(Error::from_errno(libc::EPIPE), Error::ConnectionReset));
        assert!(matches!(Error::from_errno(libc::ECANCELED), Error::ConnectionAborted));
        assert!(matches!(Error::from_errno(libc::ENOENT), Error::Transport(libc::ENOENT)));
    }

    #[test]
    fn io_error_keeps_code() {
        let err = Error::from(io::Error::from_raw_os_error(libc::EACCES));
        assert_eq!(err.raw_os_error(), Some(libc::EACCES));
    }

    #[test]
    fn display() {
        let err = Error::unsupported("listen", QueueKind::File);
        assert_eq!(err.to_string(), "listen is not supported on file queues");
    }
}
