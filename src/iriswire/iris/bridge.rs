//! The bridge is the sole point of contact with the IRIS SQL engine. All
//! backend calls are blocking from the caller's view; the async wrapper
//! runs them on the blocking thread pool so the connection task never
//! occupies the I/O scheduler while IRIS works.

use std::sync::{Arc, Mutex};

use fnv::FnvHashMap;
use tracing::debug;

use crate::iriswire::iris::pool::{PooledSession, SessionPool};
use crate::iriswire::{Error, Result};

/// Column metadata as reported by IRIS for a result set.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub iris_type: String,
    pub size: i32,
}

impl Column {
    pub fn new(name: &str, iris_type: &str) -> Self {
        Column {
            name: name.to_string(),
            iris_type: iris_type.to_string(),
            size: -1,
        }
    }
}

/// Result of one statement. Row values arrive already rendered to text;
/// None is SQL NULL.
#[derive(Debug, Default)]
pub struct ExecOutcome {
    pub columns: Vec<Column>,
    pub rows: Vec<Vec<Option<String>>>,
    pub affected: u64,
}

/// Handle for aborting the statement a session is currently running.
/// Implementations terminate the underlying IRIS session if they cannot
/// interrupt mid-statement.
pub trait Interrupt: Send + Sync {
    fn interrupt(&self);
}

/// One blocking IRIS session. Implementations are provided by the
/// embedding host (or the in-memory engine for development and tests).
pub trait IrisSession: Send + Sync {
    fn execute(&mut self, sql: &str, params: &[Option<String>]) -> Result<ExecOutcome>;
    fn execute_many(&mut self, sql: &str, batches: &[Vec<Option<String>>]) -> Result<u64>;
    fn begin(&mut self) -> Result<()>;
    fn commit(&mut self) -> Result<()>;
    fn rollback(&mut self) -> Result<()>;
    /// Cheap validation probe for pooled sessions, a `SELECT 1` equivalent.
    fn ping(&mut self) -> bool;
    fn interrupt_handle(&self) -> Arc<dyn Interrupt>;
}

pub trait IrisConnector: Send + Sync {
    fn connect(&self) -> Result<Box<dyn IrisSession>>;
    fn user_exists(&self, name: &str) -> Result<bool>;
}

pub struct Bridge {
    pool: SessionPool,
    connector: Arc<dyn IrisConnector>,
    inflight: Mutex<FnvHashMap<u64, Arc<dyn Interrupt>>>,
}

impl Bridge {
    pub fn new(connector: Arc<dyn IrisConnector>, pool_size: u32) -> Self {
        Bridge {
            pool: SessionPool::new(connector.clone(), pool_size),
            connector,
            inflight: Mutex::new(FnvHashMap::default()),
        }
    }

    pub async fn user_exists(&self, name: &str) -> Result<bool> {
        let connector = self.connector.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || connector.user_exists(&name))
            .await
            .map_err(|e| Error::new(format!("worker thread failed: {}", e)))?
    }

    /// Abort the statement currently running under the given connection
    /// key. Returns false if nothing is in flight for that key.
    pub fn cancel_current(&self, key: u64) -> bool {
        let handle = self.inflight.lock().unwrap().get(&key).cloned();
        match handle {
            Some(interrupt) => {
                debug!(key, "interrupting in-flight IRIS call");
                interrupt.interrupt();
                true
            }
            None => false,
        }
    }

    fn register(&self, key: u64, session: &dyn IrisSession) {
        self.inflight
            .lock()
            .unwrap()
            .insert(key, session.interrupt_handle());
    }

    fn unregister(&self, key: u64) {
        self.inflight.lock().unwrap().remove(&key);
    }
}

/// What to do with the session once a call returns.
enum Disposition {
    /// Keep the session pinned to this handle (open transaction); a failed
    /// statement inside the transaction keeps the pin so ROLLBACK reaches
    /// the same session.
    Pin,
    /// Pin only when the call succeeds (BEGIN).
    PinOnSuccess,
    /// Return it to the pool.
    Release,
}

/// Per-connection view of the bridge. Holds the session pinned for the
/// duration of an open transaction so all statements inside it run on the
/// same IRIS session.
pub struct BridgeHandle {
    bridge: Arc<Bridge>,
    key: u64,
    pinned: Option<PooledSession>,
}

impl BridgeHandle {
    pub fn new(bridge: Arc<Bridge>, key: u64) -> Self {
        BridgeHandle {
            bridge,
            key,
            pinned: None,
        }
    }

    pub fn in_transaction(&self) -> bool {
        self.pinned.is_some()
    }

    pub async fn execute(
        &mut self,
        sql: String,
        params: Vec<Option<String>>,
    ) -> Result<ExecOutcome> {
        // inside a transaction the session stays pinned even when the
        // statement fails, ROLLBACK must reach the same session
        let disposition = if self.in_transaction() {
            Disposition::Pin
        } else {
            Disposition::Release
        };
        self.call(disposition, move |s| s.execute(&sql, &params)).await
    }

    pub async fn execute_many(
        &mut self,
        sql: String,
        batches: Vec<Vec<Option<String>>>,
    ) -> Result<u64> {
        let disposition = if self.in_transaction() {
            Disposition::Pin
        } else {
            Disposition::Release
        };
        self.call(disposition, move |s| s.execute_many(&sql, &batches))
            .await
    }

    /// Begin a transaction and pin the session until commit or rollback.
    pub async fn begin(&mut self) -> Result<()> {
        self.call(Disposition::PinOnSuccess, |s| s.begin()).await
    }

    pub async fn commit(&mut self) -> Result<()> {
        self.call(Disposition::Release, |s| s.commit()).await
    }

    pub async fn rollback(&mut self) -> Result<()> {
        self.call(Disposition::Release, |s| s.rollback()).await
    }

    pub async fn user_exists(&self, name: &str) -> Result<bool> {
        self.bridge.user_exists(name).await
    }

    async fn call<T, F>(&mut self, disposition: Disposition, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut dyn IrisSession) -> Result<T> + Send + 'static,
    {
        let mut pooled = match self.pinned.take() {
            Some(p) => p,
            None => self.bridge.pool.acquire().await?,
        };
        self.bridge.register(self.key, pooled.session());

        let (mut pooled, result) = tokio::task::spawn_blocking(move || {
            let result = f(pooled.session_mut());
            (pooled, result)
        })
        .await
        .map_err(|e| Error::new(format!("worker thread failed: {}", e)))?;

        self.bridge.unregister(self.key);
        match disposition {
            Disposition::Pin => self.pinned = Some(pooled),
            Disposition::PinOnSuccess if result.is_ok() => self.pinned = Some(pooled),
            _ => self.bridge.pool.release(&mut pooled),
        }
        result
    }
}

impl Drop for BridgeHandle {
    fn drop(&mut self) {
        if let Some(mut pooled) = self.pinned.take() {
            // a session dropped mid-transaction is not safe to reuse
            pooled.discard();
        }
    }
}
