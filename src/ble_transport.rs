//! [`Transport`] over the host's default Bluetooth adapter, using `bluest`.
//!
//! The charge controller exposes its telemetry on a handful of notify characteristics and
//! takes requests on a single write characteristic. `bluest` addresses characteristics by
//! UUID, so [`CharacteristicId::Handle`] is not supported here.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use bluest::Adapter;
use bluest::AdvertisingDevice;
use bluest::Characteristic;
use bluest::Device;
use bluest::Uuid;
use futures_util::StreamExt;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use crate::transport::CharacteristicId;
use crate::transport::Chunk;
use crate::transport::ChunkCallback;
use crate::transport::Subscription;
use crate::transport::Transport;

/// How long to wait for a disconnect after a failed connect.
const CLEANUP_TIMEOUT: Duration = Duration::from_secs(2);

pub struct BleTransport {
    adapter: Adapter,
    service: Option<Uuid>,
}

/// A connected controller with its characteristics discovered.
pub struct BleConnection {
    device: Device,
    characteristics: Vec<Characteristic>,
    notifications: Mutex<HashMap<CharacteristicId, JoinHandle<()>>>,
}

impl BleTransport {
    /// Open the default adapter and wait for it to be powered.
    ///
    /// When `service` is given, scans only report devices advertising it.
    pub async fn new(service: Option<Uuid>) -> anyhow::Result<Self> {
        let adapter = Adapter::default()
            .await
            .ok_or(anyhow!("Default adapter not found"))?;
        adapter.wait_available().await?;
        Ok(Self { adapter, service })
    }

    async fn advertised_name(device: &AdvertisingDevice) -> Option<String> {
        match &device.adv_data.local_name {
            Some(name) => Some(name.clone()),
            None => device.device.name_async().await.ok(),
        }
    }
}

impl BleConnection {
    fn characteristic(&self, id: &CharacteristicId) -> anyhow::Result<&Characteristic> {
        let uuid = match id {
            CharacteristicId::Uuid(uuid) => *uuid,
            CharacteristicId::Handle(_) => {
                return Err(anyhow!("Characteristic {id} is addressed by handle, which this transport does not support"))
            }
        };
        self.characteristics
            .iter()
            .find(|c| c.uuid() == uuid)
            .ok_or(anyhow!("The device does not expose characteristic {id}"))
    }

    fn notifications(&self) -> std::sync::MutexGuard<'_, HashMap<CharacteristicId, JoinHandle<()>>> {
        self.notifications.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for BleTransport {
    type Device = Device;
    type Connection = BleConnection;

    async fn scan(&self, name_filter: &str, scan_timeout: Duration) -> anyhow::Result<Option<Device>> {
        let required_services: Vec<Uuid> = self.service.into_iter().collect();
        let mut adapter_events = self.adapter.scan(&required_services).await?;
        let wanted = name_filter.to_lowercase();

        let found = timeout(scan_timeout, async {
            while let Some(device) = adapter_events.next().await {
                let Some(name) = Self::advertised_name(&device).await else {
                    continue;
                };
                trace!(name = %name, rssi = ?device.rssi, "Advertisement");
                if name.to_lowercase().contains(&wanted) {
                    info!(name = %name, id = ?device.device.id(), "Found device");
                    return Some(device.device);
                }
            }
            None
        })
        .await;

        Ok(found.unwrap_or(None))
    }

    async fn connect(&self, device: &Device, connect_timeout: Duration) -> anyhow::Result<BleConnection> {
        let connected = timeout(connect_timeout, async {
            self.adapter.connect_device(device).await?;
            let mut characteristics = Vec::new();
            for service in device.discover_services().await? {
                characteristics.extend(service.discover_characteristics().await?);
            }
            anyhow::Ok(characteristics)
        })
        .await
        .map_err(|_| anyhow!("Timed out connecting after {connect_timeout:?}"))
        .and_then(|connected| connected);

        let characteristics = match connected {
            Ok(characteristics) => characteristics,
            Err(err) => {
                // Discovery may have failed on a link that did come up.
                match timeout(CLEANUP_TIMEOUT, self.adapter.disconnect_device(device)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(disconnect_err)) => debug!(%disconnect_err, "Disconnect after failed connect"),
                    Err(_) => warn!("Timed out disconnecting after failed connect"),
                }
                return Err(err);
            }
        };
        debug!(
            characteristics = ?characteristics.iter().map(|c| c.uuid()).collect::<Vec<_>>(),
            "Discovered characteristics"
        );

        Ok(BleConnection { device: device.clone(), characteristics, notifications: Mutex::new(HashMap::new()) })
    }

    async fn subscribe(
        &self,
        connection: &BleConnection,
        characteristic: &CharacteristicId,
        callback: ChunkCallback,
    ) -> anyhow::Result<Subscription> {
        if connection.notifications().get(characteristic).is_some_and(|task| !task.is_finished()) {
            return Ok(Subscription::AlreadyActive);
        }

        let notify = connection.characteristic(characteristic)?.clone();
        let id = characteristic.clone();
        let (ready_tx, ready_rx) = oneshot::channel();

        // The stream borrows the characteristic, so both live inside the task.
        let task = tokio::spawn(async move {
            let mut reader = match notify.notify().await {
                Ok(reader) => {
                    let _ = ready_tx.send(Ok(()));
                    reader
                }
                Err(err) => {
                    let _ = ready_tx.send(Err(err));
                    return;
                }
            };
            while let Some(notification) = reader.next().await {
                match notification {
                    Ok(data) => {
                        trace!(characteristic = %id, data = %hex::encode(&data), "RX notification");
                        callback(Chunk { characteristic: id.clone(), data });
                    }
                    Err(err) => {
                        warn!(characteristic = %id, %err, "Notification error");
                        break;
                    }
                }
            }
            debug!(characteristic = %id, "End of notification stream");
        });

        // Tracked before waiting so the task is aborted on unsubscribe/disconnect even if the
        // caller gives up on this future.
        connection.notifications().insert(characteristic.clone(), task);

        let ready = ready_rx
            .await
            .map_err(|_| anyhow!("Notification task for {characteristic} ended before subscribing"))
            .and_then(|ready| ready.map_err(anyhow::Error::from));
        if let Err(err) = ready {
            if let Some(task) = connection.notifications().remove(characteristic) {
                task.abort();
            }
            return Err(err);
        }

        Ok(Subscription::Started)
    }

    async fn unsubscribe(&self, connection: &BleConnection, characteristic: &CharacteristicId) -> anyhow::Result<()> {
        // Dropping the stream inside the task stops notifications.
        if let Some(task) = connection.notifications().remove(characteristic) {
            task.abort();
        }
        Ok(())
    }

    async fn write(
        &self,
        connection: &BleConnection,
        characteristic: &CharacteristicId,
        data: &[u8],
        with_response: bool,
    ) -> anyhow::Result<()> {
        let write = connection.characteristic(characteristic)?;
        trace!(characteristic = %characteristic, data = %hex::encode(data), with_response, "TX");
        if with_response {
            write.write(data).await?;
        } else {
            write.write_without_response(data).await?;
        }
        Ok(())
    }

    async fn disconnect(&self, connection: BleConnection) -> anyhow::Result<()> {
        for (_, task) in connection.notifications().drain() {
            task.abort();
        }
        self.adapter.disconnect_device(&connection.device).await?;
        Ok(())
    }
}
