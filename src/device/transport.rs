//! The seam between the core and a concrete bluetooth stack.
//!
//! [`Radio`] covers everything that happens before a connection exists (scanning, opening a link),
//! [`Link`] covers a connection to one peripheral.

use async_trait::async_trait;
use futures::stream::BoxStream;
use uuid::Uuid;

use crate::device::types::{Advertisement, BluetoothAddress, GattCharacteristic, GattService};
use crate::error::TransportError;

/// Raw advertisements as they arrive. Infinite unless the radio goes away.
pub type AdvertisementStream = BoxStream<'static, Advertisement>;

#[async_trait]
pub trait Radio: Send + Sync + 'static {
    type Link: Link;

    /// Start listening for advertisements. `service` is passed to the stack as a hint, some stacks
    /// ignore it, so consumers must filter again.
    async fn start_scan(&self, service: Uuid) -> Result<AdvertisementStream, TransportError>;

    /// Stop listening. Must succeed if no scan is active.
    async fn stop_scan(&self) -> Result<(), TransportError>;

    /// Open a transport level connection to a peripheral that was recently seen advertising.
    async fn connect(&self, address: BluetoothAddress) -> Result<Self::Link, TransportError>;
}

#[async_trait]
pub trait Link: Send + Sync + 'static {
    /// Enumerate services and their characteristics, bypassing any cache.
    async fn services(&self) -> Result<Vec<GattService>, TransportError>;

    /// Write with response. Only returns `Ok` once the peripheral acknowledged the value.
    async fn write(&self, characteristic: &GattCharacteristic, payload: &[u8]) -> Result<(), TransportError>;

    /// Read the current value, bypassing any cache.
    async fn read(&self, characteristic: &GattCharacteristic) -> Result<Vec<u8>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
