use crate::broker_link::{BrokerError, BrokerLink};
use crate::config::BridgeConfig;
use crate::pipeline::{IngestError, IngestWorker, IngestionPipeline};
use crate::storage::{RetryPolicy, StorageConnector, StorageDriver, StorageError};
use crate::timeout_supervisor::DeviceTimeoutSupervisor;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error(transparent)]
    Storage(#[from] StorageError),

    #[error(transparent)]
    Ingest(#[from] IngestError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("Task failed: {0}")]
    Task(String),
}

/// Every component of a running bridge, built once at startup.
pub struct Bridge {
    connector: StorageConnector,
    supervisor: Arc<DeviceTimeoutSupervisor>,
    link: BrokerLink,
    worker: IngestWorker,
}

impl Bridge {
    pub fn new(config: &BridgeConfig, driver: Arc<dyn StorageDriver>) -> Result<Self, BridgeError> {
        let connector = StorageConnector::new(driver, RetryPolicy::from(&config.database));

        let (expired_tx, expired_rx) = mpsc::unbounded_channel();
        let supervisor = Arc::new(DeviceTimeoutSupervisor::new(
            config.devices.idle_window(),
            expired_tx,
        ));

        let (queue_tx, queue_rx) = mpsc::channel(config.broker.queue_capacity);
        let link = BrokerLink::new(&config.broker, queue_tx)?;

        let pipeline = Arc::new(IngestionPipeline::new(connector.clone(), Arc::clone(&supervisor)));
        let worker = IngestWorker::new(pipeline, queue_rx, expired_rx);

        Ok(Self {
            connector,
            supervisor,
            link,
            worker,
        })
    }

    /// Verify storage is reachable, then run until shutdown or a fatal error.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), BridgeError> {
        info!("Testing database connection");
        self.connector.probe().await?;
        info!("Database connection verified");

        // Stop the broker link when the worker stops, and vice versa
        let stop = shutdown.child_token();

        let link_handle = tokio::spawn(self.link.run(stop.clone()));
        let worker_handle = tokio::spawn({
            let stop = stop.clone();
            let worker = self.worker;
            async move {
                let result = worker.run(stop.clone()).await;
                stop.cancel();
                result
            }
        });

        let worker_result = worker_handle
            .await
            .map_err(|e| BridgeError::Task(e.to_string()))?;
        stop.cancel();

        let link_result = link_handle
            .await
            .map_err(|e| BridgeError::Task(e.to_string()))?;

        self.supervisor.shutdown();

        if let Err(ref e) = worker_result {
            error!(error = %e, "Ingest worker stopped on fatal error");
        }
        worker_result?;
        link_result?;

        info!("Bridge stopped");
        Ok(())
    }
}
