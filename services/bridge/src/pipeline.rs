//! Message handling: topic → device table → insert → timer reset.

use crate::broker_link::InboundMessage;
use crate::device::{DeviceIdentity, IngestRecord};
use crate::storage::{SqlValue, Statement, StorageConnector, StorageError};
use crate::table_registry::TableRegistry;
use crate::timeout_supervisor::{DeviceExpiry, DeviceTimeoutSupervisor};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Errors that stop ingestion entirely
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("Storage is unavailable: {0}")]
    Fatal(#[source] StorageError),
}

/// What happened to a single message or timeout event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    Stored,
    Dropped,
}

/// Handles messages delivered by the broker link and expiries from the supervisor.
pub struct IngestionPipeline {
    connector: StorageConnector,
    tables: TableRegistry,
    supervisor: Arc<DeviceTimeoutSupervisor>,
}

impl IngestionPipeline {
    pub fn new(connector: StorageConnector, supervisor: Arc<DeviceTimeoutSupervisor>) -> Self {
        Self {
            tables: TableRegistry::new(connector.clone()),
            connector,
            supervisor,
        }
    }

    pub fn supervisor(&self) -> &Arc<DeviceTimeoutSupervisor> {
        &self.supervisor
    }

    /// The parameterized insert for a record.
    pub fn insert_statement(record: &IngestRecord) -> Statement {
        Statement::new(
            record.device.clone(),
            format!(
                "INSERT INTO {} (TS, date, time, device, message) VALUES ($1, $2, $3, $4, $5)",
                record.device.quoted()
            ),
        )
        .bind(SqlValue::Timestamp(record.timestamp))
        .bind(SqlValue::Date(record.date))
        .bind(SqlValue::Time(record.time))
        .bind(SqlValue::Text(record.device.to_string()))
        .bind(SqlValue::Text(record.payload.clone()))
    }

    /// Handle one broker message.
    ///
    /// Malformed topics and storage write failures drop the message and return
    /// `Ok`. Only connect exhaustion is returned as an error.
    #[instrument(skip(self, payload), fields(payload_size = payload.len()))]
    pub async fn on_message(&self, topic: &str, payload: &[u8]) -> Result<Disposition, IngestError> {
        metrics::counter!("bridge.messages.received").increment(1);

        let device = match DeviceIdentity::from_topic(topic) {
            Ok(device) => device,
            Err(e) => {
                warn!(error = %e, "Malformed topic, skipping message");
                metrics::counter!("bridge.messages.dropped").increment(1);
                return Ok(Disposition::Dropped);
            }
        };

        let payload = String::from_utf8_lossy(payload).into_owned();
        info!(device = %device, payload = %payload, "Received message");

        let result = self.store(&device, payload).await;

        // Any well-formed message proves the device is alive, stored or not
        self.supervisor.on_activity(&device);

        Self::settle(&device, result)
    }

    /// Write the synthetic timeout record for a device that went silent.
    #[instrument(skip(self))]
    pub async fn on_timeout(&self, device: &DeviceIdentity) -> Result<Disposition, IngestError> {
        info!(device = %device, "Received timeout for device");

        let record = IngestRecord::timeout(device.clone());
        let result = self.insert(&record).await;

        Self::settle(device, result)
    }

    async fn store(&self, device: &DeviceIdentity, payload: String) -> Result<(), StorageError> {
        self.tables.ensure_table(device).await?;

        let record = IngestRecord::new(device.clone(), payload);
        self.insert(&record).await
    }

    async fn insert(&self, record: &IngestRecord) -> Result<(), StorageError> {
        self.connector
            .execute(&Self::insert_statement(record))
            .await?;

        metrics::counter!("bridge.records.inserted").increment(1);
        info!(
            device = %record.device,
            payload = %record.payload,
            "Successfully inserted record"
        );
        Ok(())
    }

    fn settle(
        device: &DeviceIdentity,
        result: Result<(), StorageError>,
    ) -> Result<Disposition, IngestError> {
        match result {
            Ok(()) => Ok(Disposition::Stored),
            Err(e) if e.is_fatal() => {
                error!(device = %device, error = %e, "Dropping record, storage is unreachable");
                metrics::counter!("bridge.messages.dropped").increment(1);
                Err(IngestError::Fatal(e))
            }
            Err(e) => {
                error!(device = %device, error = %e, "Failed to insert data into database");
                metrics::counter!("bridge.records.failed").increment(1);
                metrics::counter!("bridge.messages.dropped").increment(1);
                Ok(Disposition::Dropped)
            }
        }
    }
}

/// Drains the broker queue and the expiry channel, one event at a time.
pub struct IngestWorker {
    pipeline: Arc<IngestionPipeline>,
    messages: mpsc::Receiver<InboundMessage>,
    expired: mpsc::UnboundedReceiver<DeviceExpiry>,
}

impl IngestWorker {
    pub fn new(
        pipeline: Arc<IngestionPipeline>,
        messages: mpsc::Receiver<InboundMessage>,
        expired: mpsc::UnboundedReceiver<DeviceExpiry>,
    ) -> Self {
        Self {
            pipeline,
            messages,
            expired,
        }
    }

    /// Run until shutdown, the broker queue closes, or storage becomes unreachable.
    pub async fn run(mut self, shutdown: CancellationToken) -> Result<(), IngestError> {
        info!("Ingest worker started");

        let result = loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!("Ingest worker received shutdown signal");
                    break Ok(());
                }
                Some(expiry) = self.expired.recv() => {
                    if !self.pipeline.supervisor().is_current(&expiry) {
                        debug!(device = %expiry.device, "Device re-armed since expiry, skipping timeout");
                        continue;
                    }
                    if let Err(e) = self.pipeline.on_timeout(&expiry.device).await {
                        break Err(e);
                    }
                }
                message = self.messages.recv() => {
                    let Some(message) = message else {
                        info!("Broker queue closed");
                        break Ok(());
                    };
                    if let Err(e) = self.pipeline.on_message(&message.topic, &message.payload).await {
                        break Err(e);
                    }
                }
            }
        };

        self.pipeline.supervisor().shutdown();

        let discarded = self.messages.len();
        if discarded > 0 {
            warn!(discarded = discarded, "Discarding queued messages on exit");
            metrics::counter!("bridge.messages.dropped").increment(discarded as u64);
        }

        info!("Ingest worker stopped");
        result
    }
}
