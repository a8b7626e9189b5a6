//! Bounded pool of reusable IRIS sessions. `acquire` waits for a permit
//! and validates idle sessions with the backend's ping probe before
//! handing them out; `release` returns the session or closes it.

use std::sync::{Arc, Mutex};

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::debug;

use crate::iriswire::iris::bridge::{IrisConnector, IrisSession};
use crate::iriswire::{Error, Result};

pub struct SessionPool {
    connector: Arc<dyn IrisConnector>,
    idle: Arc<Mutex<Vec<Box<dyn IrisSession>>>>,
    permits: Arc<Semaphore>,
}

/// A session checked out of the pool. The semaphore permit rides along so
/// capacity is respected even while the session is pinned to a transaction.
pub struct PooledSession {
    session: Option<Box<dyn IrisSession>>,
    _permit: OwnedSemaphorePermit,
}

impl PooledSession {
    pub fn session(&self) -> &dyn IrisSession {
        self.session.as_deref().expect("session already taken")
    }

    pub fn session_mut(&mut self) -> &mut dyn IrisSession {
        self.session.as_deref_mut().expect("session already taken")
    }

    /// Drop the underlying session instead of returning it to the pool.
    pub fn discard(&mut self) {
        self.session = None;
    }

    fn take(&mut self) -> Option<Box<dyn IrisSession>> {
        self.session.take()
    }
}

impl SessionPool {
    pub fn new(connector: Arc<dyn IrisConnector>, capacity: u32) -> Self {
        SessionPool {
            connector,
            idle: Arc::new(Mutex::new(Vec::with_capacity(capacity as usize))),
            permits: Arc::new(Semaphore::new(capacity.max(1) as usize)),
        }
    }

    pub async fn acquire(&self) -> Result<PooledSession> {
        let permit = self
            .permits
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::closed())?;

        // validate an idle session off the scheduler thread; a dead one is
        // dropped and replaced with a fresh connect
        let idle = self.idle.clone();
        let connector = self.connector.clone();
        let session = tokio::task::spawn_blocking(move || -> Result<Box<dyn IrisSession>> {
            loop {
                let candidate = idle.lock().unwrap().pop();
                match candidate {
                    Some(mut session) => {
                        if session.ping() {
                            return Ok(session);
                        }
                        debug!("dropping pooled IRIS session that failed validation");
                    }
                    None => return connector.connect(),
                }
            }
        })
        .await
        .map_err(|e| Error::new(format!("worker thread failed: {}", e)))??;

        Ok(PooledSession {
            session: Some(session),
            _permit: permit,
        })
    }

    pub fn release(&self, pooled: &mut PooledSession) {
        if let Some(session) = pooled.take() {
            self.idle.lock().unwrap().push(session);
        }
        // dropping the permit (when PooledSession drops) frees capacity
    }
}
