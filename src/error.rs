use std::io;
use std::str::Utf8Error;
use std::time::Duration;
use thiserror::Error;
use btleplug;
use serde_json;
use uuid::Uuid;

use crate::device::types::BluetoothAddress;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to determine path to config file")]
    NoConfigPath,

    #[error("Failed to acquire file lock on config file: {source}")]
    CanNotLock { source: io::Error },

    #[error("Failed to encode/decode config as utf-8: {source}")]
    Utf8Error { #[from] source: Utf8Error },

    #[error("Failed to read/write config file: {source}")]
    IOError { #[from] source: io::Error },

    #[error("Failed to parse/build config file: {source}")]
    JsonError { #[from] source: serde_json::Error },
}

impl ConfigError {
    pub fn is_file_not_found_error(&self) -> bool {
        match self {
            ConfigError::IOError { source } => source.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("Invalid bluetooth address {input:?}, expected the form AA:BB:CC:DD:EE:FF")]
    Malformed { input: String },

    #[error("Bluetooth address {value:#X} does not fit in 48 bits")]
    OutOfRange { value: u64 },
}

/// Failures reported by a radio or by the link to a peripheral.
#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Error communicating with device (btleplug): {source}")]
    Btle { #[from] source: btleplug::Error },

    #[error("No bluetooth adapter is available")]
    NoAdapter,

    #[error("Peripheral {address} is not known to any adapter")]
    UnknownPeripheral { address: BluetoothAddress },

    #[error("Characteristic {uuid} is not available on the peripheral")]
    MissingCharacteristic { uuid: Uuid },

    #[error("The link to the peripheral has been closed")]
    Closed,

    #[error("The peripheral rejected the request: {reason}")]
    Rejected { reason: String },
}

#[derive(Error, Debug)]
pub enum ScanError {
    #[error("Failed to start scanning: {source}")]
    Unavailable { #[from] source: TransportError },
}

#[derive(Error, Debug)]
pub enum ConnectError {
    #[error("A session is already open or being opened")]
    AlreadyConnected,

    #[error("You have not yet paired a device")]
    NoPairedDevice,

    #[error("The device did not become available within {timeout:?}")]
    Timeout { timeout: Duration },

    #[error("Failed to establish a session with the device: {reason}")]
    HandshakeFailed { reason: String },

    #[error("The connect attempt was aborted by a disconnect")]
    Aborted,

    #[error("Failed to connect: {source}")]
    Scan { #[from] source: ScanError },
}

impl ConnectError {
    pub(crate) fn handshake<E: std::fmt::Display>(step: &str, error: E) -> Self {
        ConnectError::HandshakeFailed { reason: format!("{}: {}", step, error) }
    }
}

/// Failures of a single command channel exchange.
#[derive(Error, Debug)]
pub enum IoError {
    #[error("No session is open")]
    NotConnected,

    #[error("Another command is still in flight")]
    Busy,

    #[error("Failed to transmit to the control point: {source}")]
    TransportFailure { #[from] source: TransportError },

    #[error("Invalid response from the control point: {reason}")]
    InvalidResponse { reason: String },

    #[error("The control point did not respond within {deadline:?}")]
    Timeout { deadline: Duration },
}

#[derive(Error, Debug)]
pub enum BrightnessError {
    #[error("Not connected to the flat panel")]
    NotConnected,

    #[error("Invalid brightness value {value}, valid range is [{min}, {max}]")]
    InvalidValue { value: i32, min: u16, max: u16 },

    #[error("Device state could not be successfully updated: {source}")]
    DeviceUpdateFailed { #[source] source: IoError },

    #[error("Device state could not be read: {source}")]
    DeviceQueryFailed { #[source] source: IoError },
}

#[derive(Error, Debug)]
pub enum AppRunError {
    #[error("Failed to start application (config): {source}")]
    ConfigError { #[from] source: ConfigError },

    #[error("Failed to start application (bluetooth): {source}")]
    Transport { #[from] source: TransportError },

    #[error("Scan failed: {source}")]
    Scan { #[from] source: ScanError },

    #[error("Connect failed: {source}")]
    Connect { #[from] source: ConnectError },

    #[error("Command failed: {source}")]
    Brightness { #[from] source: BrightnessError },

    #[error("Failed to parse address: {source}")]
    Address { #[from] source: AddressParseError },

    #[error("Failed to initialize logging: {source}")]
    Logging { #[from] source: fern::InitError },
}
