use std::fmt;
use std::str::FromStr;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::device::constants::{flat_panel_brightness_uuid, flat_panel_service_uuid};
use crate::error::AddressParseError;

const ADDRESS_MASK: u64 = 0xFFFF_FFFF_FFFF;

/// A 48-bit bluetooth device address. Zero means "no device paired".
///
/// Serialized as a plain integer, the same form the firmware tooling prints.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u64", into = "u64")]
pub struct BluetoothAddress(u64);

impl BluetoothAddress {
    pub const UNPAIRED: BluetoothAddress = BluetoothAddress(0);

    pub fn new(value: u64) -> Result<Self, AddressParseError> {
        if value & !ADDRESS_MASK != 0 {
            return Err(AddressParseError::OutOfRange { value });
        }
        Ok(BluetoothAddress(value))
    }

    /// Keeps the lower 48 bits of `value`.
    pub const fn masked(value: u64) -> Self {
        BluetoothAddress(value & ADDRESS_MASK)
    }

    pub fn from_octets(octets: [u8; 6]) -> Self {
        // most significant octet first, same order as the textual form
        let value = octets.iter().fold(0u64, |acc, octet| (acc << 8) | u64::from(*octet));
        BluetoothAddress(value)
    }

    pub fn octets(&self) -> [u8; 6] {
        let bytes = self.0.to_be_bytes();
        [bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7]]
    }

    pub fn value(&self) -> u64 {
        self.0
    }

    pub fn is_unpaired(&self) -> bool {
        self.0 == 0
    }
}

impl TryFrom<u64> for BluetoothAddress {
    type Error = AddressParseError;

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        BluetoothAddress::new(value)
    }
}

impl From<BluetoothAddress> for u64 {
    fn from(address: BluetoothAddress) -> Self {
        address.0
    }
}

impl fmt::Display for BluetoothAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let o = self.octets();
        write!(f, "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}", o[0], o[1], o[2], o[3], o[4], o[5])
    }
}

impl FromStr for BluetoothAddress {
    type Err = AddressParseError;

    /// Accepts `AA:BB:CC:DD:EE:FF`, `AA-BB-CC-DD-EE-FF` or `AABBCCDDEEFF`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let digits: String = if s.contains(':') || s.contains('-') {
            let parts: Vec<&str> = s.split(|c| c == ':' || c == '-').collect();
            if parts.len() != 6 || parts.iter().any(|part| part.len() != 2) {
                return Err(AddressParseError::Malformed { input: s.to_string() });
            }
            parts.concat()
        } else {
            s.to_string()
        };

        if digits.len() != 12 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressParseError::Malformed { input: s.to_string() });
        }

        let value = u64::from_str_radix(&digits, 16)
            .map_err(|_| AddressParseError::Malformed { input: s.to_string() })?;
        BluetoothAddress::new(value)
    }
}

/// Identifies the target device and its control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerIdentity {
    pub address: BluetoothAddress,
    pub service_id: Uuid,
    pub characteristic_id: Uuid,
}

impl PeerIdentity {
    /// Identity of a flat panel at the given address, using the UUIDs shared with the firmware.
    pub fn flat_panel(address: BluetoothAddress) -> Self {
        PeerIdentity {
            address,
            service_id: flat_panel_service_uuid(),
            characteristic_id: flat_panel_brightness_uuid(),
        }
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let result = match self {
            ConnectionState::Disconnected => "Disconnected",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        };

        write!(f, "{}", result)
    }
}

/// A single advertisement as reported by a radio.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub address: BluetoothAddress,
    pub services: Vec<Uuid>,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
}

/// A peer that advertised the service a scan was filtered on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredCandidate {
    pub address: BluetoothAddress,
    pub first_seen_order: usize,
    pub local_name: Option<String>,
    pub rssi: Option<i16>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct GattCharacteristic {
    pub uuid: Uuid,
    pub service_uuid: Uuid,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GattService {
    pub uuid: Uuid,
    pub characteristics: Vec<GattCharacteristic>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_displayed_upper_case_and_zero_padded() {
        let address = BluetoothAddress::new(0x0A_0B_0C_0D_0E_0F).unwrap();
        assert_eq!(address.to_string(), "0A:0B:0C:0D:0E:0F");
    }

    #[test]
    fn address_parses_all_supported_forms() {
        let expected = BluetoothAddress::new(0xD4_36_39_C1_22_7E).unwrap();
        assert_eq!("D4:36:39:C1:22:7E".parse::<BluetoothAddress>().unwrap(), expected);
        assert_eq!("d4-36-39-c1-22-7e".parse::<BluetoothAddress>().unwrap(), expected);
        assert_eq!(" d43639c1227e ".parse::<BluetoothAddress>().unwrap(), expected);
    }

    #[test]
    fn address_rejects_malformed_input() {
        for input in ["", "D4:36:39:C1:22", "D4:36:39:C1:22:7E:00", "D4:3:639:C1:22:7E", "ZZ3639C1227E", "d43639c1227"] {
            assert!(input.parse::<BluetoothAddress>().is_err(), "{input} should not parse");
        }
    }

    #[test]
    fn address_rejects_values_wider_than_48_bits() {
        assert!(matches!(
            BluetoothAddress::new(1 << 48),
            Err(AddressParseError::OutOfRange { .. })
        ));
    }

    #[test]
    fn octets_round_trip() {
        let octets = [0xD4, 0x36, 0x39, 0xC1, 0x22, 0x7E];
        let address = BluetoothAddress::from_octets(octets);
        assert_eq!(address.value(), 0xD4_36_39_C1_22_7E);
        assert_eq!(address.octets(), octets);
    }

    #[test]
    fn default_address_is_unpaired() {
        assert!(BluetoothAddress::default().is_unpaired());
        assert_eq!(BluetoothAddress::default(), BluetoothAddress::UNPAIRED);
    }
}
