use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use async_trait::async_trait;
use futures::stream;
use futures::StreamExt;
use log::debug;
use tokio::time::sleep;
use uuid::Uuid;

use crate::device::transport::{AdvertisementStream, Link, Radio};
use crate::device::types::{Advertisement, BluetoothAddress, GattCharacteristic, GattService};
use crate::error::TransportError;
use crate::sim::panel::SimPanel;

/// Address of the panel that `--simulate` provides.
pub const SIM_ADDRESS: BluetoothAddress = BluetoothAddress::masked(0xD0_0D_F1_A7_00_01);

/**
 * How often (milliseconds) every simulated panel advertises.
 */
pub const SIM_ADVERTISING_INTERVAL: u64 = 100;

struct SimRadioState {
    available: bool,
    panels: Vec<SimPanel>,
    scans_started: usize,
    scans_stopped: usize,
}

/// A [`Radio`] with simulated panels in range. Like some real stacks it ignores the service
/// filter and reports every advertising panel.
pub struct SimRadio {
    state: Arc<Mutex<SimRadioState>>,
    listeners: Arc<AtomicUsize>,
    interval: Duration,
}

fn lock(state: &Mutex<SimRadioState>) -> MutexGuard<'_, SimRadioState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

// Keeps count of the advertisement streams that are still alive.
struct ListenerGuard {
    listeners: Arc<AtomicUsize>,
}

impl ListenerGuard {
    fn register(listeners: &Arc<AtomicUsize>) -> Self {
        listeners.fetch_add(1, Ordering::SeqCst);
        ListenerGuard { listeners: listeners.clone() }
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.listeners.fetch_sub(1, Ordering::SeqCst);
    }
}

impl Default for SimRadio {
    fn default() -> Self {
        SimRadio::new()
    }
}

impl SimRadio {
    pub fn new() -> Self {
        SimRadio {
            state: Arc::new(Mutex::new(SimRadioState {
                available: true,
                panels: Vec::new(),
                scans_started: 0,
                scans_stopped: 0,
            })),
            listeners: Arc::new(AtomicUsize::new(0)),
            interval: Duration::from_millis(SIM_ADVERTISING_INTERVAL),
        }
    }

    pub fn with_panel(panel: SimPanel) -> Self {
        let radio = SimRadio::new();
        radio.add_panel(panel);
        radio
    }

    /// One flat panel at [`SIM_ADDRESS`].
    pub fn demo() -> Self {
        SimRadio::with_panel(SimPanel::flat_panel(SIM_ADDRESS))
    }

    pub fn add_panel(&self, panel: SimPanel) {
        lock(&self.state).panels.push(panel);
    }

    /// An unavailable radio fails to scan, like a host without bluetooth adapter.
    pub fn set_available(&self, available: bool) {
        lock(&self.state).available = available;
    }

    /// Advertisement streams that have not been dropped yet.
    pub fn active_listeners(&self) -> usize {
        self.listeners.load(Ordering::SeqCst)
    }

    pub fn scans_started(&self) -> usize {
        lock(&self.state).scans_started
    }

    pub fn scans_stopped(&self) -> usize {
        lock(&self.state).scans_stopped
    }

    fn panel(&self, address: BluetoothAddress) -> Option<SimPanel> {
        lock(&self.state).panels.iter().find(|panel| panel.address() == address).cloned()
    }
}

#[async_trait]
impl Radio for SimRadio {
    type Link = SimLink;

    async fn start_scan(&self, service: Uuid) -> Result<AdvertisementStream, TransportError> {
        {
            let mut state = lock(&self.state);
            if !state.available {
                return Err(TransportError::NoAdapter);
            }
            state.scans_started += 1;
        }
        debug!("Simulated scan for {} started", service);

        let shared = self.state.clone();
        let interval = self.interval;
        let guard = ListenerGuard::register(&self.listeners);

        let advertisements = stream::unfold(guard, move |guard| {
            let shared = shared.clone();
            async move {
                sleep(interval).await;
                let panels = lock(&shared).panels.clone();
                let round: Vec<Advertisement> = panels.iter().filter_map(SimPanel::advertisement).collect();
                Some((stream::iter(round), guard))
            }
        });

        Ok(advertisements.flatten().boxed())
    }

    async fn stop_scan(&self) -> Result<(), TransportError> {
        lock(&self.state).scans_stopped += 1;
        Ok(())
    }

    async fn connect(&self, address: BluetoothAddress) -> Result<SimLink, TransportError> {
        let panel = self.panel(address).ok_or(TransportError::UnknownPeripheral { address })?;

        if panel.rejects_connect() {
            return Err(TransportError::Rejected { reason: format!("{} refused the connection", address) });
        }

        panel.set_connected(true);
        Ok(SimLink { panel })
    }
}

/// A connection to a [`SimPanel`].
pub struct SimLink {
    panel: SimPanel,
}

impl SimLink {
    pub fn panel(&self) -> &SimPanel {
        &self.panel
    }

    async fn exchange_delay(&self) {
        let delay = self.panel.exchange_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }
    }

    fn check(&self, characteristic: &GattCharacteristic) -> Result<(), TransportError> {
        if !self.panel.is_connected() {
            return Err(TransportError::Closed);
        }
        if !self.panel.has_characteristic(characteristic) {
            return Err(TransportError::MissingCharacteristic { uuid: characteristic.uuid });
        }
        Ok(())
    }
}

#[async_trait]
impl Link for SimLink {
    async fn services(&self) -> Result<Vec<GattService>, TransportError> {
        let delay = self.panel.discovery_delay();
        if !delay.is_zero() {
            sleep(delay).await;
        }

        if !self.panel.is_connected() {
            return Err(TransportError::Closed);
        }
        Ok(self.panel.gatt())
    }

    async fn write(&self, characteristic: &GattCharacteristic, payload: &[u8]) -> Result<(), TransportError> {
        self.exchange_delay().await;
        self.check(characteristic)?;

        if !self.panel.store(payload) {
            return Err(TransportError::Rejected { reason: "write was not acknowledged".to_string() });
        }
        Ok(())
    }

    async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>, TransportError> {
        self.exchange_delay().await;
        self.check(characteristic)?;
        Ok(self.panel.load())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.panel.set_connected(false);
        Ok(())
    }
}
