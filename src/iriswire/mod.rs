pub mod common;
pub mod config;
pub mod auth;
pub mod iris;
pub mod sql;
pub mod pg;
pub mod server;

pub use common::{Error, ErrorKind, Result};
