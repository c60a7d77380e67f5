//! One pooled database handle per target.
//!
//! The pool is reached through two small object-safe traits so that the
//! reconciler and executor never name a concrete driver:
//! - [`Connector`] turns [`PoolSettings`] into a live [`Backend`].
//! - [`Backend`] pings, runs raw SQL and closes.
//!
//! [`driver::SqlxConnector`] is the production connector. Timeouts and the
//! single reopen attempt live in [`ConnectionPool`], not in the backends.

pub mod driver;
pub mod dsn;

use crate::{
    config::{Driver, Target},
    error::{ConnectionError, QueryError},
    metrics::TargetLabels,
};
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use secrecy::SecretString;
use std::{
    sync::{Arc, RwLock},
    time::Duration,
};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// A driver-native column value, before coercion.
#[derive(Clone, Debug, PartialEq)]
pub enum ColumnValue {
    Int(i64),
    UInt(u64),
    Float(f64),
    Timestamp(DateTime<Utc>),
    Bool(bool),
    Bytes(Vec<u8>),
    Text(String),
    Null,
    /// A type the backend does not map; carries the driver's type name.
    Unsupported(String),
}

/// Result set of one query: column names plus row values in column order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct QueryRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<ColumnValue>>,
}

pub trait Backend: Send + Sync {
    fn ping(&self) -> BoxFuture<'_, Result<(), ConnectionError>>;

    /// Run `sql` verbatim, without parameter binding.
    fn query<'a>(&'a self, sql: &'a str) -> BoxFuture<'a, Result<QueryRows, QueryError>>;

    fn close(&self) -> BoxFuture<'_, Result<(), ConnectionError>>;
}

pub trait Connector: Send + Sync {
    /// Create a pool for `settings`. Must not block on network I/O.
    ///
    /// # Errors
    ///
    /// Returns a [`ConnectionError`] if the driver is not available or the
    /// settings cannot be turned into connection options.
    fn open(&self, settings: &PoolSettings) -> Result<Arc<dyn Backend>, ConnectionError>;
}

/// Everything needed to (re)open a target's pool.
///
/// `dsn` is the only source of connection details; backends parse it.
#[derive(Clone, Debug)]
pub struct PoolSettings {
    pub labels: TargetLabels,
    pub driver: Driver,
    pub dsn: SecretString,
    pub max_idle: u32,
    pub max_open: u32,
    pub max_lifetime: Option<Duration>,
}

impl From<&Target> for PoolSettings {
    fn from(target: &Target) -> Self {
        Self {
            labels: TargetLabels::new(&target.id, &target.database),
            driver: target.driver.clone(),
            dsn: dsn::build(target),
            max_idle: target.max_idle_cons,
            max_open: target.max_open_cons,
            max_lifetime: target.max_lifetime,
        }
    }
}

pub struct ConnectionPool {
    settings: PoolSettings,
    connector: Arc<dyn Connector>,
    backend: RwLock<Arc<dyn Backend>>,
}

impl ConnectionPool {
    /// Open the pool for `settings`.
    ///
    /// # Errors
    ///
    /// Propagates the connector's [`ConnectionError`].
    pub fn open(
        settings: PoolSettings,
        connector: Arc<dyn Connector>,
    ) -> Result<Self, ConnectionError> {
        let backend = connector.open(&settings)?;

        Ok(Self {
            settings,
            connector,
            backend: RwLock::new(backend),
        })
    }

    #[must_use]
    pub const fn labels(&self) -> &TargetLabels {
        &self.settings.labels
    }

    #[must_use]
    pub const fn settings(&self) -> &PoolSettings {
        &self.settings
    }

    fn backend(&self) -> Arc<dyn Backend> {
        let guard = match self.backend.read() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Arc::clone(&guard)
    }

    /// Ping under `limit`.
    ///
    /// # Errors
    ///
    /// Returns the ping failure, or [`ConnectionError::Timeout`].
    pub async fn ping(&self, limit: Duration) -> Result<(), ConnectionError> {
        let backend = self.backend();
        match timeout(limit, backend.ping()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(limit)),
        }
    }

    /// Ping, and on failure reopen the pool once and ping again.
    ///
    /// Returns `false` if the target is still unreachable after the reopen.
    pub async fn ensure_healthy(&self, limit: Duration) -> bool {
        let Err(e) = self.ping(limit).await else {
            return true;
        };

        info!(target_id = %self.settings.labels.id, error = %e, "ping failed, reopening pool");

        if let Err(e) = self.reopen().await {
            warn!(target_id = %self.settings.labels.id, error = %e, "reopening pool failed");
            return false;
        }

        match self.ping(limit).await {
            Ok(()) => true,
            Err(e) => {
                warn!(target_id = %self.settings.labels.id, error = %e, "target unreachable after reopen");
                false
            }
        }
    }

    async fn reopen(&self) -> Result<(), ConnectionError> {
        let fresh = self.connector.open(&self.settings)?;

        let stale = {
            let mut guard = match self.backend.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            std::mem::replace(&mut *guard, fresh)
        };

        if let Err(e) = stale.close().await {
            debug!(target_id = %self.settings.labels.id, error = %e, "closing replaced pool failed");
        }

        Ok(())
    }

    /// Run `sql` under `limit`.
    ///
    /// # Errors
    ///
    /// Returns the backend's [`QueryError`], or [`QueryError::Timeout`].
    pub async fn query(&self, sql: &str, limit: Duration) -> Result<QueryRows, QueryError> {
        let backend = self.backend();
        match timeout(limit, backend.query(sql)).await {
            Ok(result) => result,
            Err(_) => Err(QueryError::Timeout(limit)),
        }
    }

    /// Close the underlying pool.
    ///
    /// # Errors
    ///
    /// Returns the backend's close failure.
    pub async fn close(&self) -> Result<(), ConnectionError> {
        self.backend().close().await
    }
}
