use crate::device::DeviceIdentity;
use crate::storage::{Statement, StorageConnector, StorageError};
use tracing::{debug, instrument};

/// Ensures a device table exists before the first insert.
///
/// Existence is left to the engine's `IF NOT EXISTS`; nothing is cached here,
/// so every call costs a round trip but concurrent calls stay harmless.
#[derive(Clone)]
pub struct TableRegistry {
    connector: StorageConnector,
}

impl TableRegistry {
    pub fn new(connector: StorageConnector) -> Self {
        Self { connector }
    }

    /// The conditional DDL for a device table.
    pub fn create_statement(device: &DeviceIdentity) -> Statement {
        Statement::new(
            device.clone(),
            format!(
                "CREATE TABLE IF NOT EXISTS {} (TS TIMESTAMP, date DATE, time TIME, device VARCHAR(255), message TEXT)",
                device.quoted()
            ),
        )
    }

    #[instrument(skip(self, device), fields(device = %device))]
    pub async fn ensure_table(&self, device: &DeviceIdentity) -> Result<(), StorageError> {
        self.connector
            .execute(&Self::create_statement(device))
            .await?;

        debug!("Device table ensured");
        Ok(())
    }
}
