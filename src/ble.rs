use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use btleplug::api::{
    Central, CentralEvent, CentralState, CharPropFlags, Manager as _, Peripheral as _, ScanFilter,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::StreamExt;
use log::{debug, info, warn};
use tokio::{
    sync::{mpsc, Mutex},
    task::JoinHandle,
};

use crate::transport::{CharacteristicInfo, Transport, TransportError, TransportEvent};

async fn get_central(manager: &Manager) -> Result<Adapter, TransportError> {
    let adapters = manager.adapters().await?;
    adapters.into_iter().next().ok_or(TransportError::NoAdapter)
}

async fn advertisement(
    adapter: &Adapter,
    id: &PeripheralId,
) -> Result<Option<TransportEvent>, TransportError> {
    let peripheral = adapter.peripheral(id).await?;
    Ok(peripheral
        .properties()
        .await?
        .map(|props| TransportEvent::Advertisement {
            id: id.to_string(),
            name: props.local_name,
            rssi: props.rssi,
        }))
}

/// Notification forwarders, by peripheral.
#[derive(Clone, Default)]
struct Forwarders(Arc<Mutex<HashMap<String, JoinHandle<()>>>>);

impl Forwarders {
    async fn replace(&self, id: &str, forwarder: JoinHandle<()>) {
        if let Some(previous) = self.0.lock().await.insert(id.to_string(), forwarder) {
            previous.abort();
        }
    }

    /// Stop forwarding for `id`; `false` if nothing was running.
    async fn release(&self, id: &str) -> bool {
        match self.0.lock().await.remove(id) {
            Some(forwarder) => {
                forwarder.abort();
                true
            }
            None => false,
        }
    }

    fn abort_all(&self) {
        if let Ok(mut forwarders) = self.0.try_lock() {
            for (_, forwarder) in forwarders.drain() {
                forwarder.abort();
            }
        }
    }
}

/// Forward adapter events until the backend goes away.
async fn watch_adapter(
    adapter: Adapter,
    sender: mpsc::Sender<TransportEvent>,
    forwarders: Forwarders,
) {
    let mut events = match adapter.events().await {
        Ok(events) => events,
        Err(e) => {
            warn!("cannot subscribe to adapter events: {}", e);
            return;
        }
    };
    while let Some(event) = events.next().await {
        let forwarded = match event {
            CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                match advertisement(&adapter, &id).await {
                    Ok(forwarded) => forwarded,
                    Err(e) => {
                        debug!("cannot read properties of {}: {}", id, e);
                        None
                    }
                }
            }
            CentralEvent::DeviceDisconnected(id) => {
                info!("device disconnected: {}", id);
                if forwarders.release(&id.to_string()).await {
                    debug!("notification forwarding for {} stopped", id);
                }
                Some(TransportEvent::LinkLost {
                    id: id.to_string(),
                    reason: "link lost".to_string(),
                })
            }
            _ => None,
        };
        if let Some(event) = forwarded {
            if sender.send(event).await.is_err() {
                break;
            }
        }
    }
    debug!("adapter event stream ended");
}

/// Transport over the first Bluetooth adapter of the host.
pub struct BleTransport {
    _manager: Manager,
    adapter: Adapter,
    sender: mpsc::Sender<TransportEvent>,
    watcher: JoinHandle<()>,
    forwarders: Forwarders,
}

impl BleTransport {
    pub async fn new(
        capacity: usize,
    ) -> Result<(Self, mpsc::Receiver<TransportEvent>), TransportError> {
        let manager = Manager::new().await?;
        let adapter = get_central(&manager).await?;
        let (sender, receiver) = mpsc::channel(capacity);
        let forwarders = Forwarders::default();
        let watcher = tokio::spawn(watch_adapter(
            adapter.clone(),
            sender.clone(),
            forwarders.clone(),
        ));

        Ok((
            Self {
                _manager: manager,
                adapter,
                sender,
                watcher,
                forwarders,
            },
            receiver,
        ))
    }

    async fn peripheral(&self, id: &str) -> Result<Peripheral, TransportError> {
        self.adapter
            .peripherals()
            .await?
            .into_iter()
            .find(|p| p.id().to_string() == id)
            .ok_or_else(|| TransportError::UnknownPeripheral(id.to_string()))
    }
}

#[async_trait]
impl Transport for BleTransport {
    async fn powered(&self) -> Result<bool, TransportError> {
        // Unknown is common right after start-up on CoreBluetooth; let the scan try
        let state = self.adapter.adapter_state().await?;
        Ok(!matches!(state, CentralState::PoweredOff))
    }

    async fn start_scan(&self) -> Result<(), TransportError> {
        self.adapter.start_scan(ScanFilter::default()).await?;
        debug!("scanning started");
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        self.adapter.stop_scan().await?;
        debug!("scanning stopped");
        Ok(())
    }

    async fn connect(&self, id: &str) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id).await?;
        peripheral.connect().await?;
        Ok(())
    }

    async fn discover(&self, id: &str) -> Result<Vec<CharacteristicInfo>, TransportError> {
        let peripheral = self.peripheral(id).await?;

        // BlueZ reports the connection before its GATT cache is populated
        #[cfg(target_os = "linux")]
        tokio::time::sleep(std::time::Duration::from_millis(600)).await;

        peripheral.discover_services().await?;
        Ok(peripheral
            .characteristics()
            .into_iter()
            .map(|c| CharacteristicInfo {
                service: c.service_uuid,
                uuid: c.uuid,
                notify: c.properties.contains(CharPropFlags::NOTIFY),
                indicate: c.properties.contains(CharPropFlags::INDICATE),
            })
            .collect())
    }

    async fn subscribe(
        &self,
        id: &str,
        characteristic: &CharacteristicInfo,
    ) -> Result<(), TransportError> {
        let peripheral = self.peripheral(id).await?;
        let target = peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service)
            .ok_or(TransportError::UnknownCharacteristic(characteristic.uuid))?;
        peripheral.subscribe(&target).await?;

        let mut notifications = peripheral.notifications().await?;
        let sender = self.sender.clone();
        let device = id.to_string();
        let uuid = characteristic.uuid;
        let forwarder = tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid != uuid {
                    continue;
                }
                debug!(
                    "received message from {}: {:x?}",
                    device, notification.value
                );
                let event = TransportEvent::Notification {
                    id: device.clone(),
                    characteristic: notification.uuid,
                    value: notification.value,
                };
                if sender.send(event).await.is_err() {
                    break;
                }
            }
            debug!("notification stream of {} ended", device);
        });

        self.forwarders.replace(id, forwarder).await;
        Ok(())
    }

    async fn disconnect(&self, id: &str) -> Result<(), TransportError> {
        self.forwarders.release(id).await;
        let peripheral = self.peripheral(id).await?;
        if peripheral.is_connected().await? {
            debug!("disconnecting from {}", id);
            peripheral.disconnect().await?;
        }
        Ok(())
    }
}

impl Drop for BleTransport {
    fn drop(&mut self) {
        self.watcher.abort();
        self.forwarders.abort_all();
    }
}
