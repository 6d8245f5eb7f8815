use failure::{Backtrace, Context, Fail};
use std::fmt;
use std::net::SocketAddrV4;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Debug, Eq, Fail, PartialEq)]
pub enum ErrorKind {
    #[fail(display = "failed to bind KRPC socket on port {}", port)]
    BindError { port: u16 },

    #[fail(display = "failed to send datagram to {}", to)]
    SendError { to: SocketAddrV4 },

    #[fail(display = "local socket address unavailable")]
    AddrUnavailable,

    #[fail(display = "query to {} timed out", to)]
    Timeout { to: SocketAddrV4 },

    #[fail(display = "peer returned error {}: {}", code, message)]
    ErrorResponse { code: i64, message: String },

    #[fail(display = "peer at {} sent a reply of an unexpected shape", to)]
    UnexpectedResponse { to: SocketAddrV4 },

    #[fail(display = "shared transport state lock was poisoned")]
    LockPoisoned,
}

impl Error {
    pub fn kind(&self) -> &ErrorKind {
        self.inner.get_context()
    }
}

impl Fail for Error {
    fn cause(&self) -> Option<&dyn Fail> {
        self.inner.cause()
    }

    fn backtrace(&self) -> Option<&Backtrace> {
        self.inner.backtrace()
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.inner, f)
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Error {
        Error {
            inner: Context::new(kind),
        }
    }
}

impl From<Context<ErrorKind>> for Error {
    fn from(inner: Context<ErrorKind>) -> Error {
        Error { inner }
    }
}
