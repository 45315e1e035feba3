use crate::config::DatabaseConfig;
use crate::storage::{SqlValue, Statement, StorageDriver, StorageError, StorageSession};
use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgConnection};
use sqlx::{ConnectOptions, Connection};
use std::time::Duration;
use tracing::{debug, instrument};

/// PostgreSQL implementation of [`StorageDriver`], one connection per session.
pub struct PgDriver {
    options: PgConnectOptions,
    connect_timeout: Duration,
}

impl PgDriver {
    pub fn new(config: &DatabaseConfig) -> Self {
        let mut options = PgConnectOptions::new()
            .host(&config.server)
            .port(config.port)
            .database(&config.database)
            .username(&config.username)
            .application_name(&config.application_name);

        if let Some(ref password) = config.password {
            options = options.password(password);
        }

        Self {
            options,
            connect_timeout: config.connect_timeout(),
        }
    }
}

#[async_trait]
impl StorageDriver for PgDriver {
    #[instrument(skip(self))]
    async fn open(&self) -> Result<Box<dyn StorageSession>, StorageError> {
        let conn = tokio::time::timeout(self.connect_timeout, self.options.connect())
            .await
            .map_err(|_| {
                StorageError::Connect(format!(
                    "timed out after {}s",
                    self.connect_timeout.as_secs()
                ))
            })?
            .map_err(|e| StorageError::Connect(e.to_string()))?;

        debug!("Opened PostgreSQL connection");

        Ok(Box::new(PgSession { conn }))
    }
}

struct PgSession {
    conn: PgConnection,
}

#[async_trait]
impl StorageSession for PgSession {
    async fn execute(&mut self, statement: &Statement) -> Result<u64, StorageError> {
        let mut query = sqlx::query(&statement.sql);

        for param in &statement.params {
            query = match param {
                SqlValue::Timestamp(ts) => query.bind(*ts),
                SqlValue::Date(date) => query.bind(*date),
                SqlValue::Time(time) => query.bind(*time),
                SqlValue::Text(text) => query.bind(text.as_str()),
            };
        }

        let result = query
            .execute(&mut self.conn)
            .await
            .map_err(|e| StorageError::Execute {
                table: statement.table.to_string(),
                message: e.to_string(),
            })?;

        Ok(result.rows_affected())
    }

    async fn close(self: Box<Self>) -> Result<(), StorageError> {
        let session = *self;
        session
            .conn
            .close()
            .await
            .map_err(|e| StorageError::Connect(e.to_string()))
    }
}
