use std::fmt::{Debug, Display, Formatter};

use crate::iriswire::{Error, Result};

pub const SSL_ALLOWED: u8 = b'S';
pub const SSL_NOT_ALLOWED: u8 = b'N';
pub const SSL_REQUEST: i32 = 80877103;
pub const CANCEL_REQUEST: i32 = 80877102;
pub const GSS_ENC_REQUEST: i32 = 80877104;
pub const PROTOCOL_VERSION: i32 = 196608; // 0x00030000

// Tag defines the Postgres protocol message type tag bytes
#[derive(Copy, Clone, Eq, PartialEq, Hash)]
pub struct Tag(u8);

impl Tag {
    // includes Startup, CancelRequest, SSLRequest
    pub const UNTAGGED: Tag = Tag(0);
    // Frontend
    pub const BIND: Tag = Tag::new_unchecked(b'B');
    // close prepared statement or portal
    pub const CLOSE: Tag = Tag::new_unchecked(b'C');
    pub const COPY_FAIL: Tag = Tag::new_unchecked(b'f');
    pub const DESCRIBE: Tag = Tag::new_unchecked(b'D');
    pub const EXECUTE: Tag = Tag::new_unchecked(b'E');
    pub const FLUSH: Tag = Tag::new_unchecked(b'H');
    pub const FUNCTION_CALL: Tag = Tag::new_unchecked(b'F');
    pub const PARSE: Tag = Tag::new_unchecked(b'P');
    // also used for GSSAPI and SASL responses
    pub const PASSWORD_MESSAGE: Tag = Tag::new_unchecked(b'p');
    pub const QUERY: Tag = Tag::new_unchecked(b'Q');
    pub const SYNC: Tag = Tag::new_unchecked(b'S');
    pub const TERMINATE: Tag = Tag::new_unchecked(b'X');
    // Frontend + Backend
    pub const COPY_DATA: Tag = Tag::new_unchecked(b'd');
    pub const COPY_DONE: Tag = Tag::new_unchecked(b'c');
    // Backend
    // one of AuthenticationOk, AuthenticationCleartextPassword, AuthenticationSASL,
    // AuthenticationSASLContinue, AuthenticationSASLFinal, AuthenticationGSS, ...
    pub const AUTHENTICATION: Tag = Tag::new_unchecked(b'R');
    pub const BACKEND_KEY_DATA: Tag = Tag::new_unchecked(b'K');
    pub const BIND_COMPLETE: Tag = Tag::new_unchecked(b'2');
    pub const CLOSE_COMPLETE: Tag = Tag::new_unchecked(b'3');
    pub const COMMAND_COMPLETE: Tag = Tag::new_unchecked(b'C');
    pub const COPY_IN_RESPONSE: Tag = Tag::new_unchecked(b'G');
    pub const COPY_OUT_RESPONSE: Tag = Tag::new_unchecked(b'H');
    pub const DATA_ROW: Tag = Tag::new_unchecked(b'D');
    pub const EMPTY_QUERY_RESPONSE: Tag = Tag::new_unchecked(b'I');
    pub const ERROR_RESPONSE: Tag = Tag::new_unchecked(b'E');
    pub const NO_DATA: Tag = Tag::new_unchecked(b'n');
    pub const NOTICE_RESPONSE: Tag = Tag::new_unchecked(b'N');
    pub const PARAMETER_DESCRIPTION: Tag = Tag::new_unchecked(b't');
    pub const PARAMETER_STATUS: Tag = Tag::new_unchecked(b'S');
    pub const PARSE_COMPLETE: Tag = Tag::new_unchecked(b'1');
    pub const PORTAL_SUSPENDED: Tag = Tag::new_unchecked(b's');
    pub const READY_FOR_QUERY: Tag = Tag::new_unchecked(b'Z');
    pub const ROW_DESCRIPTION: Tag = Tag::new_unchecked(b'T');

    /// new validates that the byte is a tag a frontend is allowed to send.
    /// Backend-only tags are constructed through the constants above.
    pub fn new_frontend(b: u8) -> Result<Self> {
        match b {
            b'B' | b'C' | b'D' | b'E' | b'F' | b'H' | b'P' | b'Q' | b'S' | b'X' | b'c' | b'd'
            | b'f' | b'p' => Ok(Tag(b)),
            _ => Err(Error::protocol_error(format!(
                "unknown frontend message tag '{}'",
                b as char
            ))),
        }
    }

    pub const fn new_unchecked(b: u8) -> Self {
        Tag(b)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    fn name(&self) -> &'static str {
        match self.0 {
            0 => "Untagged",
            b'1' => "ParseComplete",
            b'2' => "BindComplete",
            b'3' => "CloseComplete",
            b'B' => "Bind",
            b'C' => "Close/CommandComplete",
            b'D' => "Describe/DataRow",
            b'E' => "Execute/ErrorResponse",
            b'F' => "FunctionCall",
            b'G' => "CopyInResponse",
            b'H' => "Flush/CopyOutResponse",
            b'I' => "EmptyQueryResponse",
            b'K' => "BackendKeyData",
            b'N' => "NoticeResponse",
            b'P' => "Parse",
            b'Q' => "Query",
            b'R' => "Authentication",
            b'S' => "Sync/ParameterStatus",
            b'T' => "RowDescription",
            b'X' => "Terminate",
            b'Z' => "ReadyForQuery",
            b'c' => "CopyDone",
            b'd' => "CopyData",
            b'f' => "CopyFail",
            b'n' => "NoData",
            b'p' => "PasswordMessage",
            b's' => "PortalSuspended",
            b't' => "ParameterDescription",
            _ => "",
        }
    }
}

impl Display for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = self.name();
        if name.is_empty() {
            f.write_fmt(format_args!("unknown message tag '{}'", self.0 as char))
        } else {
            f.write_str(name)
        }
    }
}

impl Debug for Tag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        Display::fmt(self, f)
    }
}
