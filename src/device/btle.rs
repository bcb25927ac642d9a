use std::future::Future;
use std::pin::Pin;
use std::sync::{Mutex, PoisonError};
use async_trait::async_trait;
use btleplug::api::{Central, CentralEvent, Characteristic, Manager as _, Peripheral as _, PeripheralProperties, ScanFilter, WriteType};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use futures::channel::mpsc::{channel, Sender};
use futures::{SinkExt, Stream, StreamExt};
use log::{debug, info, warn};
use tokio::spawn;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::device::constants::{ADVERTISEMENT_BUFFER, STOP_SCAN_DEADLINE};
use crate::device::transport::{AdvertisementStream, Link, Radio};
use crate::device::types::{Advertisement, BluetoothAddress, GattCharacteristic, GattService};
use crate::error::TransportError;

type CentralEvents = Pin<Box<dyn Stream<Item = CentralEvent> + Send>>;

/// A [`Radio`] that uses every bluetooth adapter of this host through btleplug.
pub struct BtleRadio {
    // adapters stay valid only as long as the manager is alive on some platforms
    _manager: Manager,
    adapters: Vec<Adapter>,
    // cancels the advertisement forwarders of the running scan
    scan_cancel: Mutex<Option<CancellationToken>>,
}

impl BtleRadio {
    pub async fn new() -> Result<Self, TransportError> {
        let manager = Manager::new().await?;
        let adapters = manager.adapters().await?;

        if adapters.is_empty() {
            return Err(TransportError::NoAdapter);
        }

        for adapter in &adapters {
            info!("Using adapter {}", adapter.adapter_info().await.unwrap_or_else(|_| "UNKNOWN".to_string()));
        }

        Ok(BtleRadio {
            _manager: manager,
            adapters,
            scan_cancel: Mutex::new(None),
        })
    }

    async fn find_peripheral(&self, address: BluetoothAddress) -> Result<Option<Peripheral>, TransportError> {
        for adapter in &self.adapters {
            let peripherals = match adapter.peripherals().await {
                Ok(v) => v,
                Err(err) => {
                    warn!("Failed to query BLE adapter for peripherals: {}", err);
                    continue;
                },
            };

            for peripheral in peripherals {
                if BluetoothAddress::from_octets(peripheral.address().into_inner()) == address {
                    return Ok(Some(peripheral));
                }
            }
        }

        Ok(None)
    }

    async fn start_adapter_scan(
        &self,
        adapter: &Adapter,
        filter: &ScanFilter,
        cancel: &CancellationToken,
        sender: &Sender<Advertisement>,
    ) -> Result<(), TransportError> {
        let events = adapter.events().await?;
        info!("Scanning using adapter {}...", adapter.adapter_info().await.unwrap_or_else(|_| "UNKNOWN".to_string()));
        adapter.start_scan(filter.clone()).await?;
        spawn(forward_advertisements(cancel.clone(), adapter.clone(), events, sender.clone()));
        Ok(())
    }
}

fn to_advertisement(properties: PeripheralProperties) -> Advertisement {
    Advertisement {
        address: BluetoothAddress::from_octets(properties.address.into_inner()),
        services: properties.services,
        local_name: properties.local_name,
        rssi: properties.rssi,
    }
}

async fn query_advertisement(adapter: &Adapter, id: &PeripheralId) -> Result<Option<Advertisement>, TransportError> {
    let peripheral = adapter.peripheral(id).await?;
    Ok(peripheral.properties().await?.map(to_advertisement))
}

async fn advertisement_for(adapter: Adapter, event: CentralEvent) -> Option<Advertisement> {
    let id = match event {
        CentralEvent::DeviceDiscovered(id) => id,
        CentralEvent::DeviceUpdated(id) => id,
        CentralEvent::ServicesAdvertisement { id, .. } => id,
        _ => return None,
    };

    match query_advertisement(&adapter, &id).await {
        Ok(Some(advertisement)) => Some(advertisement),
        Ok(None) => {
            debug!("Peripheral {:?} has no properties", id);
            None
        },
        Err(err) => {
            warn!("Could not query peripheral for properties: {:?}", err);
            None
        },
    }
}

/// Sends the advertisement of every event to `sender` until `cancel` fires, the events end or the
/// receiver is gone. A quiet event source does not keep the task alive past `cancel`.
async fn forward_events<E, F, Fut>(cancel: CancellationToken, mut events: Pin<Box<dyn Stream<Item = E> + Send>>, mut sender: Sender<Advertisement>, mut lookup: F)
where
    F: FnMut(E) -> Fut,
    Fut: Future<Output = Option<Advertisement>>,
{
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => break,
            event = events.next() => match event {
                Some(event) => event,
                None => break,
            },
        };

        let Some(advertisement) = lookup(event).await else {
            continue;
        };

        if sender.send(advertisement).await.is_err() {
            // the scanner has stopped listening
            break;
        }
    }

    debug!("Stopped forwarding advertisements");
}

fn forward_advertisements(cancel: CancellationToken, adapter: Adapter, events: CentralEvents, sender: Sender<Advertisement>) -> impl Future<Output = ()> + Send {
    forward_events(cancel, events, sender, move |event| advertisement_for(adapter.clone(), event))
}

#[async_trait]
impl Radio for BtleRadio {
    type Link = BtleLink;

    async fn start_scan(&self, service: Uuid) -> Result<AdvertisementStream, TransportError> {
        let filter = ScanFilter {
            services: vec![service],
        };
        let (sender, receiver) = channel::<Advertisement>(ADVERTISEMENT_BUFFER);

        let cancel = CancellationToken::new();
        let previous = self.scan_cancel.lock().unwrap_or_else(PoisonError::into_inner).replace(cancel.clone());
        if let Some(previous) = previous {
            previous.cancel();
        }

        for adapter in &self.adapters {
            if let Err(err) = self.start_adapter_scan(adapter, &filter, &cancel, &sender).await {
                warn!("Failed to start scanning: {:?}", err);
                // adapters that did start must not keep scanning
                if let Err(stop_err) = self.stop_scan().await {
                    warn!("Failed to stop scanning: {:?}", stop_err);
                }
                return Err(err);
            }
        }

        Ok(receiver.boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        let active = self.scan_cancel.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(cancel) = active {
            cancel.cancel();
        }

        let mut result = Ok(());

        for adapter in &self.adapters {
            match timeout(STOP_SCAN_DEADLINE, adapter.stop_scan()).await {
                Ok(Ok(())) => {},
                Ok(Err(err)) => {
                    warn!("Failed to stop scanning: {:?}", err);
                    result = Err(err.into());
                },
                Err(_) => {
                    // macOS
                    warn!("Stopping the scan took too long");
                },
            }
        }

        result
    }

    async fn connect(&self, address: BluetoothAddress) -> Result<BtleLink, TransportError> {
        let peripheral = self.find_peripheral(address).await?
            .ok_or(TransportError::UnknownPeripheral { address })?;

        info!("Connecting to peripheral {}...", address);
        peripheral.connect().await?;

        Ok(BtleLink { peripheral })
    }
}

/// A connection to one peripheral through btleplug.
pub struct BtleLink {
    peripheral: Peripheral,
}

impl BtleLink {
    fn characteristic(&self, characteristic: &GattCharacteristic) -> Result<Characteristic, TransportError> {
        self.peripheral.characteristics()
            .into_iter()
            .find(|c| c.uuid == characteristic.uuid && c.service_uuid == characteristic.service_uuid)
            .ok_or(TransportError::MissingCharacteristic { uuid: characteristic.uuid })
    }
}

#[async_trait]
impl Link for BtleLink {
    async fn services(&self) -> Result<Vec<GattService>, TransportError> {
        info!("Connected; Discovering services...");
        self.peripheral.discover_services().await?;

        let services = self.peripheral.services()
            .into_iter()
            .map(|service| GattService {
                uuid: service.uuid,
                characteristics: service.characteristics
                    .iter()
                    .map(|c| GattCharacteristic { uuid: c.uuid, service_uuid: c.service_uuid })
                    .collect(),
            })
            .collect();

        Ok(services)
    }

    async fn write(&self, characteristic: &GattCharacteristic, payload: &[u8]) -> Result<(), TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        self.peripheral.write(&characteristic, payload, WriteType::WithResponse).await?;
        Ok(())
    }

    async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>, TransportError> {
        let characteristic = self.characteristic(characteristic)?;
        Ok(self.peripheral.read(&characteristic).await?)
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.peripheral.is_connected().await? {
            self.peripheral.disconnect().await?;
        }
        Ok(())
    }
}
