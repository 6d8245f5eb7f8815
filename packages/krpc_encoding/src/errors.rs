use failure::{Backtrace, Context, Fail};
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub struct Error {
    inner: Context<ErrorKind>,
}

#[derive(Clone, Debug, Eq, Fail, PartialEq)]
pub enum ErrorKind {
    #[fail(display = "input ended while a value was still open")]
    UnexpectedEnd,

    #[fail(display = "unknown type prefix {:#04x} at offset {}", prefix, offset)]
    UnknownPrefix { prefix: u8, offset: usize },

    #[fail(display = "malformed integer at offset {}", offset)]
    InvalidInteger { offset: usize },

    #[fail(display = "malformed string length descriptor at offset {}", offset)]
    InvalidLengthDescriptor { offset: usize },

    #[fail(display = "{} trailing byte(s) after a complete value", count)]
    TrailingBytes { count: usize },

    #[fail(display = "duplicate dictionary key {:?}", key)]
    DuplicateKey { key: String },

    #[fail(display = "node id must be 20 bytes, got {}", len)]
    InvalidNodeIdLength { len: usize },

    #[fail(display = "compact node info length {} is not a multiple of 26", len)]
    InvalidCompactNodes { len: usize },

    #[fail(display = "compact peer info must be 6 bytes, got {}", len)]
    InvalidCompactPeer { len: usize },

    #[fail(display = "message is missing required key {:?}", key)]
    MissingKey { key: &'static str },

    #[fail(display = "message key {:?} holds a value of the wrong type", key)]
    WrongType { key: &'static str },

    #[fail(display = "unknown message kind {:?}", kind)]
    UnknownMessageKind { kind: String },

    #[fail(display = "unknown query method {:?}", method)]
    UnknownMethod { method: String },
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
