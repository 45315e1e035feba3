//! Device identities derived from MQTT topics, and the records written for them.

use chrono::{Local, NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use std::fmt;
use thiserror::Error;

/// Longest identifier Postgres keeps without truncation.
pub const MAX_IDENTITY_LEN: usize = 63;

/// Payload stored when a device stays silent for a full idle window.
pub const TIMEOUT_PAYLOAD: &str = "timeout";

/// Errors raised while deriving a device identity from a topic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopicError {
    #[error("Topic '{0}' has no device segment")]
    MissingDevice(String),

    #[error("Invalid device identity '{identity}': {reason}")]
    InvalidDevice { identity: String, reason: &'static str },
}

/// Validated device identity, safe to use as a table name.
///
/// Only ASCII letters, digits and `_` are accepted, with a non-digit first
/// character, so the value can be interpolated into SQL text as an identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceIdentity(String);

impl DeviceIdentity {
    /// Validate a raw identity string.
    pub fn parse(raw: &str) -> Result<Self, TopicError> {
        let invalid = |reason| TopicError::InvalidDevice {
            identity: raw.to_string(),
            reason,
        };

        let mut chars = raw.chars();
        let first = chars.next().ok_or_else(|| invalid("identity is empty"))?;

        if raw.len() > MAX_IDENTITY_LEN {
            return Err(invalid("identity is longer than 63 characters"));
        }
        if !(first.is_ascii_alphabetic() || first == '_') {
            return Err(invalid("identity must start with a letter or underscore"));
        }
        if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
            return Err(invalid(
                "identity may only contain letters, digits and underscores",
            ));
        }

        Ok(Self(raw.to_string()))
    }

    /// Extract the device identity from a topic of the form `<root>/<device>/...`.
    pub fn from_topic(topic: &str) -> Result<Self, TopicError> {
        let segment = topic
            .split('/')
            .nth(1)
            .ok_or_else(|| TopicError::MissingDevice(topic.to_string()))?;

        Self::parse(segment)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Quoted identifier form for SQL text. Quoting keeps the identity case-sensitive.
    pub fn quoted(&self) -> String {
        format!("\"{}\"", self.0)
    }
}

impl fmt::Display for DeviceIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A single row destined for a device table.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestRecord {
    /// Full wall-clock timestamp
    pub timestamp: NaiveDateTime,
    /// Date part, stored in its own column
    pub date: NaiveDate,
    /// Time part, stored in its own column (100µs precision)
    pub time: NaiveTime,
    /// Device the record belongs to
    pub device: DeviceIdentity,
    /// Message body
    pub payload: String,
}

impl IngestRecord {
    /// Build a record stamped with the current local time.
    pub fn new(device: DeviceIdentity, payload: impl Into<String>) -> Self {
        Self::at(Local::now().naive_local(), device, payload)
    }

    /// Build the synthetic record emitted when a device goes silent.
    pub fn timeout(device: DeviceIdentity) -> Self {
        Self::new(device, TIMEOUT_PAYLOAD)
    }

    /// Build a record for an explicit timestamp.
    pub fn at(timestamp: NaiveDateTime, device: DeviceIdentity, payload: impl Into<String>) -> Self {
        let time = timestamp.time();
        let truncated_nanos = time.nanosecond() / 100_000 * 100_000;
        let time = time.with_nanosecond(truncated_nanos).unwrap_or(time);

        Self {
            timestamp,
            date: timestamp.date(),
            time,
            device,
            payload: payload.into(),
        }
    }

    pub fn is_timeout(&self) -> bool {
        self.payload == TIMEOUT_PAYLOAD
    }
}
