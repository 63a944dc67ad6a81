//! The narrow slice of a BLE stack the link session needs.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use uuid::Uuid;

/// A characteristic, addressed either by UUID or by raw attribute handle.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Deserialize)]
#[serde(untagged)]
pub enum CharacteristicId {
    Handle(u16),
    Uuid(Uuid),
}

impl fmt::Display for CharacteristicId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Handle(handle) => write!(f, "0x{handle:04x}"),
            Self::Uuid(uuid) => write!(f, "{uuid}"),
        }
    }
}

/// One notification delivery.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub characteristic: CharacteristicId,
    pub data: Vec<u8>,
}

/// Called by the transport for every notification, in delivery order.
pub type ChunkCallback = Arc<dyn Fn(Chunk) + Send + Sync>;

/// Result of a successful subscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subscription {
    Started,
    /// The characteristic was already delivering notifications to a callback.
    AlreadyActive,
}

/// A device transport.
///
/// Every call is bounded: scans and connects by the timeout they are given, the rest by
/// the caller.
#[async_trait]
pub trait Transport: Send + Sync {
    type Device: Send + Sync;
    type Connection: Send + Sync;

    /// Scan until a device whose advertised name contains `name_filter` (ignoring case)
    /// shows up, or `timeout` elapses.
    async fn scan(&self, name_filter: &str, timeout: Duration) -> anyhow::Result<Option<Self::Device>>;

    async fn connect(&self, device: &Self::Device, timeout: Duration) -> anyhow::Result<Self::Connection>;

    async fn subscribe(
        &self,
        connection: &Self::Connection,
        characteristic: &CharacteristicId,
        callback: ChunkCallback,
    ) -> anyhow::Result<Subscription>;

    async fn unsubscribe(&self, connection: &Self::Connection, characteristic: &CharacteristicId) -> anyhow::Result<()>;

    async fn write(
        &self,
        connection: &Self::Connection,
        characteristic: &CharacteristicId,
        data: &[u8],
        with_response: bool,
    ) -> anyhow::Result<()>;

    async fn disconnect(&self, connection: Self::Connection) -> anyhow::Result<()>;
}

#[test]
fn test_characteristic_id_display() {
    assert_eq!(CharacteristicId::Handle(0x29).to_string(), "0x0029");
    let uuid = Uuid::parse_str("00002af1-0000-1000-8000-00805f9b34fb").unwrap();
    assert_eq!(CharacteristicId::Uuid(uuid).to_string(), "00002af1-0000-1000-8000-00805f9b34fb");
}
