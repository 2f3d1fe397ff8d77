//! Common result plumbing shared by the network and startup paths.

use std::fmt;
use std::io;

pub type NetResult<T> = Result<T, NetError>;

/// Outcome of a non-blocking network operation. `Wait` means the socket
/// would block and the operation should be retried on the next readiness
/// event; everything else is fatal for the connection.
#[derive(Debug, Eq, PartialEq)]
pub enum NetError {
    Wait,
    Fatal(io::ErrorKind),
}

impl From<io::Error> for NetError {
    #[inline]
    fn from(io_error: io::Error) -> Self {
        match io_error.kind() {
            io::ErrorKind::WouldBlock => NetError::Wait,
            kind => NetError::Fatal(kind),
        }
    }
}

pub trait ErrorUtils {
    fn has_failed(&self) -> bool;
}

impl<T> ErrorUtils for NetResult<T> {
    fn has_failed(&self) -> bool {
        match self {
            Ok(_) => false,
            Err(NetError::Wait) => false,
            _ => true,
        }
    }
}

/* Process exit codes. */
pub const EXIT_OK: i32 = 0;
pub const EXIT_HELP: i32 = 1;
pub const EXIT_UNKNOWNOPT: i32 = 2;
pub const EXIT_NOWORLD: i32 = 3;
pub const EXIT_CONFIGDIRS: i32 = 4;
pub const EXIT_NOAUTH: i32 = 5;
pub const EXIT_HOMEDIR: i32 = 6;
pub const EXIT_NOSUCHWORLD: i32 = 7;
pub const EXIT_CONFIGERR: i32 = 8;
pub const EXIT_SOCKET: i32 = 9;
pub const EXIT_BIND: i32 = 10;
pub const EXIT_LISTEN: i32 = 11;
pub const EXIT_NOHOST: i32 = 12;
pub const EXIT_RESOLV: i32 = 13;
pub const EXIT_CONNECT: i32 = 15;

/// A fatal startup problem: a message for stderr and the process exit
/// code from the table above.
#[derive(Debug)]
pub struct StartupError {
    pub code: i32,
    pub message: String,
}

impl StartupError {
    pub fn new(code: i32, message: impl Into<String>) -> StartupError {
        StartupError {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for StartupError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wouldblock_is_wait() {
        let err: NetError = io::Error::from(io::ErrorKind::WouldBlock).into();
        assert_eq!(err, NetError::Wait);
        assert!(!Err::<(), _>(err).has_failed());
    }

    #[test]
    fn test_other_errors_are_fatal() {
        let err: NetError = io::Error::from(io::ErrorKind::ConnectionReset).into();
        assert_eq!(err, NetError::Fatal(io::ErrorKind::ConnectionReset));
        assert!(Err::<(), _>(err).has_failed());
    }
}
