use std::sync::Arc;
use proptest::prelude::*;
use wireless_flat_panel::device::channel::{decode_value, encode_value};
use wireless_flat_panel::device::types::BluetoothAddress;
use wireless_flat_panel::error::BrightnessError;
use wireless_flat_panel::panel::controller::FlatPanel;
use wireless_flat_panel::sim::panel::SimPanel;
use wireless_flat_panel::sim::radio::{SimRadio, SIM_ADDRESS};

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

proptest! {
    #[test]
    fn address_text_form_parses_back(value in 0u64..(1 << 48)) {
        let address = BluetoothAddress::new(value).unwrap();
        let text = address.to_string();

        prop_assert_eq!(text.len(), 17);
        prop_assert_eq!(text.parse::<BluetoothAddress>().unwrap(), address);
        prop_assert_eq!(text.to_lowercase().replace(':', "").parse::<BluetoothAddress>().unwrap(), address);
    }

    #[test]
    fn wide_addresses_are_rejected(value in (1u64 << 48)..=u64::MAX) {
        prop_assert!(BluetoothAddress::new(value).is_err());
    }

    #[test]
    fn payloads_carry_every_level(level in 0u16..=1023) {
        let payload = encode_value(level);
        prop_assert_eq!(payload[0], (level & 0xFF) as u8);
        prop_assert_eq!(payload[1], (level >> 8) as u8);
        prop_assert_eq!(decode_value(&payload).unwrap(), level);
    }

    #[test]
    fn valid_levels_reach_the_panel(level in 0i32..=1023) {
        let device = SimPanel::flat_panel(SIM_ADDRESS);
        let panel = FlatPanel::new(Arc::new(SimRadio::with_panel(device.clone())));

        runtime().block_on(async {
            panel.connect(SIM_ADDRESS).await.unwrap();
            panel.set_brightness(level).await.unwrap();
        });

        prop_assert_eq!(i32::from(panel.current_brightness()), level);
        prop_assert_eq!(device.brightness().map(i32::from), Some(level));
    }

    #[test]
    fn invalid_levels_are_rejected(level in prop_oneof![i32::MIN..0, 1024..=i32::MAX]) {
        let panel = FlatPanel::new(Arc::new(SimRadio::demo()));

        let result = runtime().block_on(panel.set_brightness(level));
        prop_assert!(
            matches!(result, Err(BrightnessError::InvalidValue { value, min: 0, max: 1023 }) if value == level),
            "unexpected result {:?}", result
        );
    }
}
