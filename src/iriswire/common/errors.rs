use std::fmt::{Debug, Display};
use std::{fmt, io, result};
use std::net::AddrParseError;
use std::sync::PoisonError;

use tokio_rustls::rustls;

use crate::iriswire::pg::protocol::error_codes;

#[derive(Debug)]
pub struct Error {
    err: Box<ErrorKind>, // use a Box to keep the Result type smaller
}

#[derive(Debug)]
pub enum ErrorKind {
    Timeout,
    PoisonError,
    ClosedError,
    StringError(String),
    ConfigError(String),
    /// ProtocolError is fatal for the connection: framing is broken or the
    /// client violated the v3 message flow.
    ProtocolError(String),
    /// SqlError carries a SQLSTATE and is reported to the client as an
    /// ErrorResponse without closing the connection.
    SqlError { sqlstate: &'static str, message: String },
    IOError(io::Error),
    YAMLError(serde_yaml::Error),
    TlsError(rustls::Error),
    UTF8Error(std::str::Utf8Error),
    ArrayFromSliceError(std::array::TryFromSliceError),
}

pub type Result<T> = result::Result<T, Error>;

impl Error {
    pub fn new<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(s.to_string())),
        }
    }

    pub fn config<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::ConfigError(s.to_string())),
        }
    }

    pub fn protocol_error<S: ToString>(s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::ProtocolError(s.to_string())),
        }
    }

    pub fn sql<S: ToString>(sqlstate: &'static str, s: S) -> Self {
        Error {
            err: Box::new(ErrorKind::SqlError {
                sqlstate,
                message: s.to_string(),
            }),
        }
    }

    pub fn auth_failed<S: ToString>(s: S) -> Self {
        Self::sql(error_codes::INVALID_AUTHORIZATION_SPECIFICATION, s)
    }

    pub fn query_canceled() -> Self {
        Self::sql(error_codes::QUERY_CANCELED, "canceling statement due to user request")
    }

    pub fn timeout() -> Self {
        Error {
            err: Box::new(ErrorKind::Timeout),
        }
    }

    pub fn closed() -> Self {
        Error {
            err: Box::new(ErrorKind::ClosedError),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.err
    }

    /// The SQLSTATE to report to the client for this error.
    pub fn sqlstate(&self) -> &'static str {
        match self.kind() {
            ErrorKind::SqlError { sqlstate, .. } => sqlstate,
            ErrorKind::ProtocolError(_) => error_codes::PROTOCOL_VIOLATION,
            ErrorKind::Timeout => error_codes::QUERY_CANCELED,
            ErrorKind::IOError(_) | ErrorKind::ClosedError => error_codes::CONNECTION_EXCEPTION,
            _ => error_codes::INTERNAL_ERROR,
        }
    }

    /// True if the connection cannot continue after this error.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::ProtocolError(_)
                | ErrorKind::IOError(_)
                | ErrorKind::ClosedError
                | ErrorKind::TlsError(_)
        )
    }
}

impl From<&str> for Error {
    fn from(err: &str) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(String::from(err))),
        }
    }
}

impl From<String> for Error {
    fn from(err: String) -> Self {
        Error {
            err: Box::new(ErrorKind::StringError(err)),
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::IOError(err)),
        }
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::YAMLError(err)),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(err: std::str::Utf8Error) -> Self {
        Error {
            err: Box::new(ErrorKind::UTF8Error(err)),
        }
    }
}

impl From<std::string::FromUtf8Error> for Error {
    fn from(err: std::string::FromUtf8Error) -> Self {
        Error {
            err: Box::new(ErrorKind::UTF8Error(err.utf8_error())),
        }
    }
}

impl From<std::array::TryFromSliceError> for Error {
    fn from(err: std::array::TryFromSliceError) -> Self {
        Error {
            err: Box::new(ErrorKind::ArrayFromSliceError(err)),
        }
    }
}

impl From<AddrParseError> for Error {
    fn from(err: AddrParseError) -> Self {
        Error::config(err)
    }
}

impl<Guard> From<PoisonError<Guard>> for Error {
    fn from(_err: PoisonError<Guard>) -> Self {
        Error {
            err: Box::new(ErrorKind::PoisonError),
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error {
            err: Box::new(ErrorKind::TlsError(err)),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        std::fmt::Display::fmt(&self.err, f)
    }
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ErrorKind::ClosedError => f.write_str("socket/file is closed"),
            ErrorKind::PoisonError => f.write_str("another thread panicked while holding the mutex"),
            ErrorKind::StringError(s) => f.write_str(s),
            ErrorKind::ConfigError(s) => f.write_fmt(format_args!("config error: {}", s)),
            ErrorKind::ProtocolError(s) => f.write_fmt(format_args!("protocol violation: {}", s)),
            ErrorKind::SqlError { message, .. } => f.write_str(message),
            ErrorKind::IOError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::YAMLError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::TlsError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::UTF8Error(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::ArrayFromSliceError(e) => std::fmt::Display::fmt(&e, f),
            ErrorKind::Timeout => f.write_str("operation timed out"),
        }
    }
}

impl PartialEq for ErrorKind {
    fn eq(&self, other: &Self) -> bool {
        std::mem::discriminant(self) == std::mem::discriminant(other)
    }
}

impl Eq for ErrorKind {}
