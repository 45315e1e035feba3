//! Nier Bridge Service
//!
//! Ingestion bridge between an MQTT broker and a SQL database. Every message
//! published under `<root>/<device>/...` is written to a per-device table that
//! is created on first sight of the device. Devices that stay silent for the
//! configured idle window get a synthetic `timeout` record.
//!
//! ## Architecture
//!
//! ```text
//!  MQTT Broker
//!       │
//!       ▼
//! ┌──────────────┐   bounded    ┌──────────────┐          ┌──────────────┐
//! │ Broker       │    queue     │ Ingest       │─────────▶│ Table        │
//! │ Link         │─────────────▶│ Worker       │          │ Registry     │
//! └──────────────┘              └──────────────┘          └──────────────┘
//!                                  ▲      │                      │
//!                          expired │      │ insert               ▼
//!                                  │      ▼               ┌──────────────┐
//!                        ┌──────────────┐ │               │ Storage      │
//!                        │ Timeout      │ └──────────────▶│ Connector    │
//!                        │ Supervisor   │                 └──────────────┘
//!                        └──────────────┘                        │
//!                                                                 ▼
//!                                                            PostgreSQL
//! ```

pub mod bridge;
pub mod broker_link;
pub mod config;
pub mod device;
pub mod pipeline;
pub mod postgres;
pub mod storage;
pub mod table_registry;
pub mod timeout_supervisor;

pub use bridge::{Bridge, BridgeError};
pub use broker_link::{BrokerError, BrokerLink, InboundMessage};
pub use config::{BridgeConfig, ConfigValidationError};
pub use device::{DeviceIdentity, IngestRecord, TopicError};
pub use pipeline::{Disposition, IngestError, IngestWorker, IngestionPipeline};
pub use postgres::PgDriver;
pub use storage::{
    RetryPolicy, SqlValue, Statement, StorageConnector, StorageDriver, StorageError, StorageSession,
};
pub use table_registry::TableRegistry;
pub use timeout_supervisor::{DeviceExpiry, DeviceTimeoutSupervisor};
