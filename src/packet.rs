use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Largest datagram accepted from the UDP source
pub const MAX_DATAGRAM_SIZE: usize = 1024;

/// A captured or replayed packet. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "PacketRecord")]
pub struct Packet {
    timestamp: f64,     // Seconds since epoch, assigned at capture time
    raw_data: Vec<u8>,  // Opaque payload bytes
    size: usize,        // Always raw_data.len()
}

/// Packet as it appears on the wire or in a dataset file, before validation
#[derive(Debug, Clone, Deserialize)]
pub struct PacketRecord {
    pub timestamp: f64,
    pub raw_data: Vec<u8>,
    pub size: usize,
}

impl Packet {
    pub fn new(timestamp: f64, raw_data: Vec<u8>) -> Self {
        let size = raw_data.len();
        Self {
            timestamp,
            raw_data,
            size,
        }
    }

    /// Build a packet stamped with the current wall clock time
    pub fn captured_now(raw_data: Vec<u8>) -> Self {
        Self::new(now_timestamp(), raw_data)
    }

    /// Same payload under a new timestamp
    pub fn restamped(self, timestamp: f64) -> Self {
        Self { timestamp, ..self }
    }

    pub fn timestamp(&self) -> f64 {
        self.timestamp
    }

    pub fn raw_data(&self) -> &[u8] {
        &self.raw_data
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl TryFrom<PacketRecord> for Packet {
    type Error = anyhow::Error;

    fn try_from(record: PacketRecord) -> Result<Self> {
        if record.size != record.raw_data.len() {
            bail!(
                "declared size {} does not match payload length {}",
                record.size,
                record.raw_data.len()
            );
        }
        if !record.timestamp.is_finite() {
            bail!("timestamp {} is not a finite number", record.timestamp);
        }
        Ok(Packet::new(record.timestamp, record.raw_data))
    }
}

/// Seconds since the unix epoch as a float
pub fn now_timestamp() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs_f64()
}
