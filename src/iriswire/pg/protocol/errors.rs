use std::fmt;
use std::fmt::{Display, Formatter};

use strum::EnumString;

/// Severity reported in the `S` field of ErrorResponse/NoticeResponse.
#[derive(EnumString, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Debug)]
#[strum(serialize_all = "UPPERCASE")]
#[repr(u8)]
pub enum ErrorSeverity {
    Log,
    Info,
    Debug,
    Notice,
    Warning,
    Error,
    Panic,
    Fatal,
}

impl ErrorSeverity {
    pub fn as_str(&self) -> &'static str {
        match *self {
            ErrorSeverity::Fatal => "FATAL",
            ErrorSeverity::Panic => "PANIC",
            ErrorSeverity::Error => "ERROR",
            ErrorSeverity::Warning => "WARNING",
            ErrorSeverity::Notice => "NOTICE",
            ErrorSeverity::Debug => "DEBUG",
            ErrorSeverity::Info => "INFO",
            ErrorSeverity::Log => "LOG",
        }
    }
}

impl Display for ErrorSeverity {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Field tags used inside ErrorResponse/NoticeResponse bodies.
#[derive(Copy, Clone, Eq, PartialEq)]
pub struct ErrorFieldTag(u8);

impl ErrorFieldTag {
    pub const NULL_TERMINATOR: ErrorFieldTag = ErrorFieldTag::new_unchecked(0);
    pub const SEVERITY: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'S');
    pub const SEVERITY_NON_LOCALIZED: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'V');
    pub const CODE: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'C');
    pub const MESSAGE: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'M');
    pub const MESSAGE_DETAIL: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'D');
    pub const MESSAGE_HINT: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'H');
    pub const POSITION: ErrorFieldTag = ErrorFieldTag::new_unchecked(b'P');

    pub const fn new_unchecked(b: u8) -> Self {
        ErrorFieldTag(b)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }
}
