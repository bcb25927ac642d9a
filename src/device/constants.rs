use std::time::Duration;
use uuid::Uuid;

/**
 * How long a connect attempt may take (scan, connect and GATT lookup) before it is given up.
 */
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/**
 * How long a single read or write on the control point may take.
 */
pub const COMMAND_DEADLINE: Duration = Duration::from_millis(2000);

/**
 * How long stopping a scan on an adapter may take before we stop waiting for it.
 */
pub const STOP_SCAN_DEADLINE: Duration = Duration::from_millis(2000);

/**
 * Default duration of a scan started for pairing purposes.
 */
pub const PAIRING_SCAN_DURATION: Duration = Duration::from_secs(10);

/**
 * Capacity of the channel between the radio event task and the scanner.
 */
pub const ADVERTISEMENT_BUFFER: usize = 64;

/**
 * The UUID of the Bluetooth BLE service exposed by the flat panel firmware.
 */
pub const FLAT_PANEL_SERVICE: &str = "0d389e0f-25dc-4070-9135-400b81e543ce";

/**
 * The UUID of the Bluetooth BLE characteristic holding the brightness (the control point).
 */
pub const FLAT_PANEL_BRIGHTNESS_CHARACTERISTIC: &str = "2a0f87c9-7270-4c3e-aaa3-647961dfffa3";

pub const MIN_BRIGHTNESS: u16 = 0;

/**
 * The brightness at which the panel delivers its maximum illumination.
 * Values are exchanged with the firmware as 2 byte little endian unsigned integers.
 */
pub const MAX_BRIGHTNESS: u16 = 1023;

/**
 * Size in bytes of the value stored in the control point.
 */
pub const BRIGHTNESS_PAYLOAD_LEN: usize = 2;

pub const DEVICE_NAME: &str = "Wireless Flat Panel";
pub const DEVICE_DESCRIPTION: &str = "Wireless flat panel for camera calibration frames";

pub const fn flat_panel_service_uuid() -> Uuid {
    Uuid::from_u128(0x0d389e0f_25dc_4070_9135_400b81e543ce)
}

pub const fn flat_panel_brightness_uuid() -> Uuid {
    Uuid::from_u128(0x2a0f87c9_7270_4c3e_aaa3_647961dfffa3)
}
