//! Storage connectivity: the driver seam, parameterized statements, and the
//! connector that opens one session per logical operation with bounded retry.

use crate::config::DatabaseConfig;
use crate::device::DeviceIdentity;
use async_trait::async_trait;
use backoff::backoff::{Backoff, Constant};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

/// Errors that can occur while talking to the storage engine
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Failed to connect to database: {0}")]
    Connect(String),

    #[error("Maximum number of connection attempts exceeded ({attempts} attempts)")]
    ConnectExhausted { attempts: u32 },

    #[error("Statement on table '{table}' failed: {message}")]
    Execute { table: String, message: String },
}

impl StorageError {
    /// Whether this error must stop the process.
    pub fn is_fatal(&self) -> bool {
        matches!(self, StorageError::ConnectExhausted { .. })
    }
}

/// A bound statement parameter
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Timestamp(NaiveDateTime),
    Date(NaiveDate),
    Time(NaiveTime),
    Text(String),
}

/// SQL text plus its bound parameters, scoped to one device table.
#[derive(Debug, Clone, PartialEq)]
pub struct Statement {
    pub table: DeviceIdentity,
    pub sql: String,
    pub params: Vec<SqlValue>,
}

impl Statement {
    pub fn new(table: DeviceIdentity, sql: impl Into<String>) -> Self {
        Self {
            table,
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    pub fn bind(mut self, value: SqlValue) -> Self {
        self.params.push(value);
        self
    }
}

/// Opens sessions against the storage engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait StorageDriver: Send + Sync {
    /// Open a fresh session. Every call creates a new network resource.
    async fn open(&self) -> Result<Box<dyn StorageSession>, StorageError>;
}

/// A live storage session owned by a single operation.
#[async_trait]
pub trait StorageSession: Send {
    /// Execute a statement, returning the number of affected rows.
    async fn execute(&mut self, statement: &Statement) -> Result<u64, StorageError>;

    /// Release the session.
    async fn close(self: Box<Self>) -> Result<(), StorageError>;
}

/// Connection retry settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt
    pub max_retries: u32,
    /// Fixed pause between attempts
    pub interval: Duration,
}

impl RetryPolicy {
    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 10,
            interval: Duration::from_secs(5),
        }
    }
}

impl From<&DatabaseConfig> for RetryPolicy {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            interval: config.retry_interval(),
        }
    }
}

/// Owns storage connectivity. Sessions are never pooled or shared.
#[derive(Clone)]
pub struct StorageConnector {
    driver: Arc<dyn StorageDriver>,
    policy: RetryPolicy,
}

impl StorageConnector {
    pub fn new(driver: Arc<dyn StorageDriver>, policy: RetryPolicy) -> Self {
        Self { driver, policy }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Open a session, retrying at a fixed interval.
    ///
    /// Returns [`StorageError::ConnectExhausted`] once every attempt has failed;
    /// callers treat that as fatal for the process.
    #[instrument(skip(self))]
    pub async fn connect(&self) -> Result<Box<dyn StorageSession>, StorageError> {
        let mut backoff = Constant::new(self.policy.interval);
        let total_attempts = self.policy.total_attempts();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.driver.open().await {
                Ok(session) => {
                    if attempt > 1 {
                        info!(attempt = attempt, "Connected to database after retrying");
                    } else {
                        debug!("Connected to database");
                    }
                    return Ok(session);
                }
                Err(e) => {
                    metrics::counter!("bridge.storage.connect_failures").increment(1);
                    error!(
                        attempt = attempt,
                        max_attempts = total_attempts,
                        error = %e,
                        "Could not connect to database"
                    );

                    if attempt >= total_attempts {
                        error!(attempts = attempt, "Maximum number of connection attempts exceeded");
                        return Err(StorageError::ConnectExhausted { attempts: attempt });
                    }

                    if let Some(delay) = backoff.next_backoff() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Run one statement in its own session, releasing the session afterwards.
    pub async fn execute(&self, statement: &Statement) -> Result<u64, StorageError> {
        let mut session = self.connect().await?;
        let result = session.execute(statement).await;

        if let Err(e) = session.close().await {
            warn!(table = %statement.table, error = %e, "Failed to close database session");
        }

        result
    }

    /// Open and immediately release a session to prove the database is reachable.
    pub async fn probe(&self) -> Result<(), StorageError> {
        let session = self.connect().await?;
        session.close().await
    }
}
