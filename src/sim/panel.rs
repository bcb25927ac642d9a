use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use uuid::Uuid;

use crate::device::channel::{decode_value, encode_value};
use crate::device::constants::{flat_panel_brightness_uuid, flat_panel_service_uuid, DEVICE_NAME};
use crate::device::types::{Advertisement, BluetoothAddress, GattCharacteristic, GattService};

struct SimPanelState {
    advertising: bool,
    connected: bool,
    // raw contents of every characteristic is shared, the panel only has one
    value: Vec<u8>,
    read_response: Option<Vec<u8>>,
    reject_connect: bool,
    reject_writes: bool,
    exchange_delay: Duration,
    discovery_delay: Duration,
    writes: usize,
    connects: usize,
}

struct SimPanelInner {
    address: BluetoothAddress,
    local_name: Option<String>,
    advertised_services: Vec<Uuid>,
    gatt: Vec<GattService>,
    state: Mutex<SimPanelState>,
}

/// A simulated peripheral. Written values are stored and read back as-is.
#[derive(Clone)]
pub struct SimPanel {
    inner: Arc<SimPanelInner>,
}

impl SimPanel {
    pub fn new(address: BluetoothAddress, advertised_services: Vec<Uuid>, gatt: Vec<GattService>) -> Self {
        SimPanel::build(address, None, advertised_services, gatt)
    }

    fn build(address: BluetoothAddress, local_name: Option<String>, advertised_services: Vec<Uuid>, gatt: Vec<GattService>) -> Self {
        SimPanel {
            inner: Arc::new(SimPanelInner {
                address,
                local_name,
                advertised_services,
                gatt,
                state: Mutex::new(SimPanelState {
                    advertising: true,
                    connected: false,
                    value: encode_value(0).to_vec(),
                    read_response: None,
                    reject_connect: false,
                    reject_writes: false,
                    exchange_delay: Duration::ZERO,
                    discovery_delay: Duration::ZERO,
                    writes: 0,
                    connects: 0,
                }),
            }),
        }
    }

    /// A panel that behaves like the real firmware.
    pub fn flat_panel(address: BluetoothAddress) -> Self {
        let service = flat_panel_service_uuid();
        let gatt = vec![GattService {
            uuid: service,
            characteristics: vec![GattCharacteristic {
                uuid: flat_panel_brightness_uuid(),
                service_uuid: service,
            }],
        }];

        SimPanel::build(address, Some(DEVICE_NAME.to_string()), vec![service], gatt)
    }

    fn state(&self) -> MutexGuard<'_, SimPanelState> {
        self.inner.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn address(&self) -> BluetoothAddress {
        self.inner.address
    }

    pub fn gatt(&self) -> Vec<GattService> {
        self.inner.gatt.clone()
    }

    pub fn advertisement(&self) -> Option<Advertisement> {
        if !self.state().advertising {
            return None;
        }

        Some(Advertisement {
            address: self.inner.address,
            services: self.inner.advertised_services.clone(),
            local_name: self.inner.local_name.clone(),
            rssi: Some(-60),
        })
    }

    pub fn has_characteristic(&self, characteristic: &GattCharacteristic) -> bool {
        self.inner.gatt.iter()
            .flat_map(|service| service.characteristics.iter())
            .any(|c| c == characteristic)
    }

    pub fn set_advertising(&self, advertising: bool) {
        self.state().advertising = advertising;
    }

    pub fn set_reject_connect(&self, reject: bool) {
        self.state().reject_connect = reject;
    }

    pub fn set_reject_writes(&self, reject: bool) {
        self.state().reject_writes = reject;
    }

    /// Answer reads with `payload` instead of the stored value.
    pub fn set_read_response(&self, payload: Option<Vec<u8>>) {
        self.state().read_response = payload;
    }

    /// How long every read and write takes.
    pub fn set_exchange_delay(&self, delay: Duration) {
        self.state().exchange_delay = delay;
    }

    pub fn exchange_delay(&self) -> Duration {
        self.state().exchange_delay
    }

    /// How long service discovery takes after a connect.
    pub fn set_discovery_delay(&self, delay: Duration) {
        self.state().discovery_delay = delay;
    }

    pub fn discovery_delay(&self) -> Duration {
        self.state().discovery_delay
    }

    pub fn rejects_connect(&self) -> bool {
        self.state().reject_connect
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        let mut state = self.state();
        if connected && !state.connected {
            state.connects += 1;
        }
        state.connected = connected;
    }

    pub(crate) fn store(&self, payload: &[u8]) -> bool {
        let mut state = self.state();
        if state.reject_writes {
            return false;
        }
        state.value = payload.to_vec();
        state.writes += 1;
        true
    }

    pub(crate) fn load(&self) -> Vec<u8> {
        let state = self.state();
        state.read_response.clone().unwrap_or_else(|| state.value.clone())
    }

    /// The brightness the panel currently holds, if the stored value is a valid payload.
    pub fn brightness(&self) -> Option<u16> {
        decode_value(&self.state().value).ok()
    }

    pub fn write_count(&self) -> usize {
        self.state().writes
    }

    pub fn connect_count(&self) -> usize {
        self.state().connects
    }
}
