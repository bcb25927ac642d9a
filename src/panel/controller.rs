use std::sync::atomic::{AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;
use log::{info, warn};

use crate::config::types::ConfigStore;
use crate::device::channel::CommandChannel;
use crate::device::constants::{CONNECT_TIMEOUT, DEVICE_DESCRIPTION, DEVICE_NAME, MAX_BRIGHTNESS, MIN_BRIGHTNESS};
use crate::device::session::SessionManager;
use crate::device::transport::Radio;
use crate::device::types::{BluetoothAddress, ConnectionState, PeerIdentity};
use crate::error::{BrightnessError, ConnectError};

/// The operations an imaging application uses: connect, switch the panel on at a brightness, and
/// switch it off.
///
/// Brightness and connection state are cached values. `current_brightness()` is the last level
/// the panel acknowledged, and `is_connected()` does not ask the device whether it is still there:
/// polling the device on every connection check destabilized client applications.
pub struct FlatPanel<R: Radio> {
    sessions: SessionManager<R>,
    channel: CommandChannel<R::Link>,
    brightness: AtomicU16,
    connect_timeout: Duration,
}

impl<R: Radio> FlatPanel<R> {
    pub fn new(radio: Arc<R>) -> Self {
        let sessions = SessionManager::new(radio);
        let channel = sessions.channel();

        FlatPanel {
            sessions,
            channel,
            brightness: AtomicU16::new(MIN_BRIGHTNESS),
            connect_timeout: CONNECT_TIMEOUT,
        }
    }

    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    pub fn sessions(&self) -> &SessionManager<R> {
        &self.sessions
    }

    pub async fn connect(&self, address: BluetoothAddress) -> Result<(), ConnectError> {
        self.sessions.connect(PeerIdentity::flat_panel(address), self.connect_timeout).await?;
        Ok(())
    }

    /// Connects to the panel that was paired through `config`.
    pub async fn connect_paired<C: ConfigStore>(&self, config: &C) -> Result<(), ConnectError> {
        self.connect(config.paired_address()).await
    }

    pub async fn disconnect(&self) {
        self.sessions.disconnect().await;
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.sessions.current_state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection_state() == ConnectionState::Connected
    }

    fn check_connected(&self, operation: &str) -> Result<(), BrightnessError> {
        if !self.is_connected() {
            warn!("{}: not connected", operation);
            return Err(BrightnessError::NotConnected);
        }
        Ok(())
    }

    /// Switches the panel on at `level`, in `[0, max_brightness()]`.
    pub async fn set_brightness(&self, level: i32) -> Result<(), BrightnessError> {
        let value = validate_level(level)?;
        self.check_connected("set_brightness")?;

        info!("Sending brightness {} to the device...", value);
        if let Err(source) = self.channel.write(value).await {
            return Err(BrightnessError::DeviceUpdateFailed { source });
        }

        self.brightness.store(value, Ordering::Release);
        info!("Device has been updated!");
        Ok(())
    }

    pub async fn turn_off(&self) -> Result<(), BrightnessError> {
        self.set_brightness(i32::from(MIN_BRIGHTNESS)).await
    }

    pub fn current_brightness(&self) -> u16 {
        self.brightness.load(Ordering::Acquire)
    }

    pub fn max_brightness(&self) -> u16 {
        MAX_BRIGHTNESS
    }

    /// Reads the brightness from the device. The cached brightness is left alone.
    pub async fn device_brightness(&self) -> Result<u16, BrightnessError> {
        self.check_connected("device_brightness")?;
        self.channel.read().await.map_err(|source| BrightnessError::DeviceQueryFailed { source })
    }

    pub fn name(&self) -> &'static str {
        DEVICE_NAME
    }

    pub fn description(&self) -> &'static str {
        DEVICE_DESCRIPTION
    }

    pub fn driver_version(&self) -> String {
        driver_version()
    }

    pub fn driver_info(&self) -> String {
        format!("{} Version {}", DEVICE_NAME, driver_version())
    }
}

fn validate_level(level: i32) -> Result<u16, BrightnessError> {
    match u16::try_from(level) {
        Ok(value) if value <= MAX_BRIGHTNESS => Ok(value),
        _ => Err(BrightnessError::InvalidValue {
            value: level,
            min: MIN_BRIGHTNESS,
            max: MAX_BRIGHTNESS,
        }),
    }
}

/// Major and minor version, formatted as `m.n`.
fn driver_version() -> String {
    format!("{}.{}", env!("CARGO_PKG_VERSION_MAJOR"), env!("CARGO_PKG_VERSION_MINOR"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::radio::SimRadio;

    #[test]
    fn levels_outside_the_range_are_rejected() {
        for level in [-1, 1024, i32::MIN, i32::MAX] {
            match validate_level(level) {
                Err(BrightnessError::InvalidValue { value, min, max }) => {
                    assert_eq!(value, level);
                    assert_eq!((min, max), (0, 1023));
                },
                other => panic!("expected InvalidValue for {}, got {:?}", level, other),
            }
        }
    }

    #[test]
    fn levels_inside_the_range_are_accepted() {
        assert_eq!(validate_level(0).unwrap(), 0);
        assert_eq!(validate_level(1023).unwrap(), 1023);
    }

    #[test]
    fn driver_metadata() {
        let panel = FlatPanel::new(Arc::new(SimRadio::new()));
        assert_eq!(panel.name(), "Wireless Flat Panel");
        assert_eq!(panel.max_brightness(), 1023);
        assert_eq!(panel.driver_version(), format!("{}.{}", env!("CARGO_PKG_VERSION_MAJOR"), env!("CARGO_PKG_VERSION_MINOR")));
        assert!(panel.driver_info().starts_with("Wireless Flat Panel Version "));
    }

    #[tokio::test]
    async fn commands_require_a_session() {
        let panel = FlatPanel::new(Arc::new(SimRadio::new()));

        assert!(matches!(panel.set_brightness(100).await, Err(BrightnessError::NotConnected)));
        assert!(matches!(panel.turn_off().await, Err(BrightnessError::NotConnected)));
        assert!(matches!(panel.device_brightness().await, Err(BrightnessError::NotConnected)));
        assert_eq!(panel.current_brightness(), 0);
    }
}
