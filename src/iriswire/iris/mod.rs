mod bridge;
pub mod memory;
mod pool;

pub use self::bridge::{
    Bridge, BridgeHandle, Column, ExecOutcome, Interrupt, IrisConnector, IrisSession,
};
pub use self::memory::MemoryEngine;
pub use self::pool::{PooledSession, SessionPool};
