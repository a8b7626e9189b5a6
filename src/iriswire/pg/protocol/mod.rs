pub mod error_codes;
mod errors;
mod message;
mod message_builder;
mod message_error_builder;
mod message_reader;
mod oids;
mod startup_params;
mod tag;

pub use self::errors::{ErrorFieldTag, ErrorSeverity};
pub use self::message::{Header, Message, MessageParser, MIN_MESSAGE_LEN};
pub use self::message_builder::MessageBuilder;
pub use self::message_error_builder::MessageErrorBuilder;
pub use self::message_reader::MessageReader;
pub use self::oids::{pg_oid_for_iris_type, type_size, OID_INT4, OID_TEXT, OID_VECTOR};
pub use self::startup_params::StartupParams;
pub use self::tag::{
    Tag, CANCEL_REQUEST, GSS_ENC_REQUEST, PROTOCOL_VERSION, SSL_ALLOWED, SSL_NOT_ALLOWED,
    SSL_REQUEST,
};
