use std::fmt::{Display, Formatter};

use crate::iriswire::{Error, Result};

/// Connection lifecycle. Transitions are driven by client messages; error
/// paths stay within the current scope until the next Sync (extended flow)
/// or ReadyForQuery (simple flow).
#[derive(strum::Display, Debug, Clone, Copy, Eq, PartialEq)]
pub enum ConnState {
    SslProbe,
    Startup,
    Authenticating,
    Ready,
    SimpleQuery,
    Extended,
    CopyIn,
    CopyOut,
    Terminated,
}

impl ConnState {
    pub fn transition(&mut self, to: ConnState) -> Result<()> {
        let allowed = matches!(
            (*self, to),
            (ConnState::SslProbe, ConnState::Startup)
                | (ConnState::Startup, ConnState::Authenticating)
                | (ConnState::Authenticating, ConnState::Ready)
                | (ConnState::Ready, ConnState::SimpleQuery)
                | (ConnState::Ready, ConnState::Extended)
                | (ConnState::SimpleQuery, ConnState::CopyIn)
                | (ConnState::SimpleQuery, ConnState::CopyOut)
                | (ConnState::SimpleQuery, ConnState::Ready)
                | (ConnState::Extended, ConnState::Ready)
                | (ConnState::Extended, ConnState::Extended)
                | (ConnState::CopyIn, ConnState::SimpleQuery)
                | (ConnState::CopyOut, ConnState::SimpleQuery)
                | (_, ConnState::Terminated)
        );
        if !allowed {
            return Err(Error::protocol_error(format!(
                "invalid connection state transition {} -> {}",
                self, to
            )));
        }
        *self = to;
        Ok(())
    }
}

/// Transaction status as reported in ReadyForQuery.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TxStatus {
    Idle,
    InTransaction,
    FailedTransaction,
}

impl TxStatus {
    pub fn as_byte(&self) -> u8 {
        match self {
            TxStatus::Idle => b'I',
            TxStatus::InTransaction => b'T',
            TxStatus::FailedTransaction => b'E',
        }
    }
}

impl Display for TxStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            TxStatus::Idle => "idle",
            TxStatus::InTransaction => "in_tx",
            TxStatus::FailedTransaction => "failed_tx",
        })
    }
}
