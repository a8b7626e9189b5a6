mod client;
mod client_state;
mod copy;
mod portal;
pub mod protocol;

pub use self::client::{ClientConn, ConnContext};
pub use self::client_state::{ConnState, TxStatus};
pub use self::copy::{parse_copy, CopyCommand, CopyOptions, CsvDecoder};
pub use self::portal::{substitute_params, Portal, PreparedStatement};
