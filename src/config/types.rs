use serde::{Deserialize, Serialize};

use crate::device::types::BluetoothAddress;

/// What the core needs from persisted configuration.
///
/// The core only reads the paired address, at connect time. Pairing writes it.
pub trait ConfigStore {
    fn paired_address(&self) -> BluetoothAddress;
    fn set_paired_address(&mut self, address: BluetoothAddress);
    fn trace_enabled(&self) -> bool;
    fn set_trace_enabled(&mut self, enabled: bool);
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub paired_address: BluetoothAddress,
    #[serde(default)]
    pub trace_enabled: bool,
}

impl ConfigStore for Config {
    fn paired_address(&self) -> BluetoothAddress {
        self.paired_address
    }

    fn set_paired_address(&mut self, address: BluetoothAddress) {
        self.paired_address = address;
    }

    fn trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    fn set_trace_enabled(&mut self, enabled: bool) {
        self.trace_enabled = enabled;
    }
}
