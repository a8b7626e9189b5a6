//! Registry of live connections keyed by backend pid, consulted by the
//! transient cancel-request connections. The lock is held only across
//! insert/remove/lookup; the bridge call happens after it is released.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;
use tracing::{debug, info};

use crate::iriswire::iris::Bridge;

#[derive(Clone)]
pub struct CancelToken {
    pub secret: i32,
    /// connection key used for bridge cancel_current
    pub key: u64,
    /// observed by the target at its next bridge-call boundary
    pub flag: Arc<AtomicBool>,
}

#[derive(Default)]
pub struct CancelRegistry {
    inner: Mutex<FnvHashMap<i32, CancelToken>>,
}

impl CancelRegistry {
    pub fn new() -> Self {
        CancelRegistry::default()
    }

    pub fn register(&self, pid: i32, token: CancelToken) {
        self.inner.lock().unwrap().insert(pid, token);
    }

    pub fn unregister(&self, pid: i32) {
        self.inner.lock().unwrap().remove(&pid);
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    /// Process a CancelRequest. A mismatched secret or unknown pid is
    /// silently ignored; nothing observable happens to any connection.
    pub fn cancel(&self, pid: i32, secret: i32, bridge: &Bridge) -> bool {
        let token = self.inner.lock().unwrap().get(&pid).cloned();
        match token {
            Some(token) if token.secret == secret => {
                info!(pid, "cancel request matched, aborting in-flight query");
                token.flag.store(true, Ordering::SeqCst);
                bridge.cancel_current(token.key);
                true
            }
            Some(_) => {
                debug!(pid, "cancel request with mismatched secret ignored");
                false
            }
            None => {
                debug!(pid, "cancel request for unknown pid ignored");
                false
            }
        }
    }
}
