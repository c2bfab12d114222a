//! USB Target Hierarchy Tests
//!
//! Exercises target, interface and pipe binding against the mock bus:
//! descriptors, alternate-setting switches, pipe lookup and device reset.
//!
//! Run with: `cargo test -p redirector --test target_tests`

use common::PipeInfo;
use common::test_utils::{BusCall, MockUsbBus, bulk_pair, receiver_descriptor};
use protocol::{
    ConfigDescriptorHeader, DeviceDescriptor, PipeType, UsbError, UsbSpeed,
    encode_config_descriptor_header,
};
use redirector::usb::UsbTarget;
use std::sync::Arc;

fn target(bus: &Arc<MockUsbBus>) -> UsbTarget {
    UsbTarget::create(bus.clone()).expect("target creation failed")
}

fn audio_like_bus() -> Arc<MockUsbBus> {
    // Interface 1 is a streaming interface with an empty default setting
    Arc::new(MockUsbBus::new(vec![
        vec![bulk_pair(0)],
        vec![
            vec![],
            vec![PipeInfo::new(0x83, PipeType::Isochronous, 192)],
            vec![PipeInfo::new(0x83, PipeType::Isochronous, 384)],
        ],
    ]))
}

mod creation {
    use super::*;

    #[test]
    fn test_binds_every_interface() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(3));
        let target = target(&bus);

        assert_eq!(target.interface_count(), 3);
        for n in 0..3u8 {
            let interface = target.interface(usize::from(n)).unwrap();
            assert_eq!(interface.number(), n);
            assert_eq!(interface.alt_setting(), 0);
            assert_eq!(interface.generation(), 1);
            assert_eq!(interface.endpoint_addresses(), vec![0x81 + n, 0x01 + n]);
        }
        assert_eq!(
            bus.calls()[..2],
            [
                BusCall::ConfigurationDescriptor(0),
                BusCall::SelectConfiguration
            ]
        );
    }

    #[test]
    fn test_no_interfaces_is_an_invalid_state() {
        let bus = Arc::new(MockUsbBus::new(vec![]));
        assert_eq!(
            UsbTarget::create(bus).err(),
            Some(UsbError::InvalidDeviceState)
        );
    }

    #[test]
    fn test_configuration_failure_propagates() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(1));
        bus.fail_select_configuration(UsbError::NoDevice);
        assert_eq!(UsbTarget::create(bus).err(), Some(UsbError::NoDevice));
    }

    #[test]
    fn test_default_setting_failure_propagates() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(2));
        bus.fail_select_setting(1, 0, UsbError::Busy);
        assert_eq!(UsbTarget::create(bus).err(), Some(UsbError::Busy));
    }

    #[test]
    fn test_zero_pipe_setting() {
        let bus = audio_like_bus();
        let target = target(&bus);

        let streaming = target.interface(1).unwrap();
        assert_eq!(streaming.pipe_count(), 0);
        assert!(streaming.endpoint_addresses().is_empty());
    }

    #[test]
    fn test_short_transfers_enabled_on_every_pipe() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(2));
        let _target = target(&bus);

        let calls = bus.calls();
        for endpoint in [0x81, 0x01, 0x82, 0x02] {
            assert!(calls.contains(&BusCall::DisableMaxPacketSizeCheck(endpoint)));
        }
    }
}

fn config_descriptor(total_length: u16, extra: usize) -> Vec<u8> {
    let header = ConfigDescriptorHeader {
        total_length,
        num_interfaces: 1,
        configuration_value: 1,
        ..Default::default()
    };
    let mut raw = encode_config_descriptor_header(&header).to_vec();
    raw.resize(raw.len() + extra, 0);
    raw
}

mod descriptors {
    use super::*;

    #[test]
    fn test_device_descriptor_read_at_creation() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(1));
        let target = target(&bus);

        bus.set_device_descriptor(DeviceDescriptor {
            vendor_id: 0x1234,
            ..receiver_descriptor()
        });
        assert_eq!(*target.device_descriptor(), receiver_descriptor());
        assert!(!target.device_descriptor().is_hub());
    }

    #[test]
    fn test_speed_comes_from_bus() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(1));
        let target = target(&bus);
        assert_eq!(target.speed(), UsbSpeed::Full);

        bus.set_speed(UsbSpeed::High);
        assert_eq!(target.speed(), UsbSpeed::High);
    }

    #[test]
    fn test_descriptor_failure_fails_creation() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(1));
        bus.fail_descriptors(UsbError::NoDevice);
        assert_eq!(UsbTarget::create(bus.clone()).err(), Some(UsbError::NoDevice));
        assert!(bus.calls().is_empty());
    }

    #[test]
    fn test_zero_total_length_fails_creation() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(1));
        bus.set_configuration_descriptor(config_descriptor(0, 16));

        assert_eq!(
            UsbTarget::create(bus.clone()).err(),
            Some(UsbError::InvalidConfigurationDescriptor)
        );
        assert!(!bus.calls().contains(&BusCall::SelectConfiguration));
    }

    #[test]
    fn test_configuration_descriptor_trimmed_to_total_length() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(1));
        let target = target(&bus);
        assert_eq!(target.configuration_descriptor(0).unwrap().len(), 9 + 9 + 2 * 7);

        bus.set_configuration_descriptor(config_descriptor(12, 8));
        let raw = target.configuration_descriptor(0).unwrap();
        assert_eq!(raw.len(), 12);
        assert_eq!(&raw[..2], &[0x09, 0x02]);
    }

    #[test]
    fn test_malformed_configuration_descriptors() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(1));
        let target = target(&bus);

        // Shorter than the length it reports
        bus.set_configuration_descriptor(config_descriptor(32, 4));
        assert_eq!(
            target.configuration_descriptor(0),
            Err(UsbError::InvalidConfigurationDescriptor)
        );

        // Not a configuration descriptor at all
        let mut raw = config_descriptor(9, 0);
        raw[1] = DeviceDescriptor::DESCRIPTOR_TYPE;
        bus.set_configuration_descriptor(raw);
        assert_eq!(
            target.configuration_descriptor(0),
            Err(UsbError::InvalidConfigurationDescriptor)
        );

        bus.set_configuration_descriptor(vec![0x09, 0x02]);
        assert_eq!(
            target.configuration_descriptor(0),
            Err(UsbError::InvalidConfigurationDescriptor)
        );
    }

    #[test]
    fn test_unknown_configuration_index() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(1));
        let target = target(&bus);
        assert_eq!(target.configuration_descriptor(1), Err(UsbError::Stall));
    }
}

mod alt_settings {
    use super::*;

    #[test]
    fn test_switch_rebuilds_pipes() {
        let bus = audio_like_bus();
        let target = target(&bus);

        target.set_interface_alt_setting(1, 2).unwrap();

        let streaming = target.interface(1).unwrap();
        assert_eq!(streaming.alt_setting(), 2);
        assert_eq!(streaming.generation(), 2);
        assert_eq!(streaming.endpoint_addresses(), vec![0x83]);
        assert_eq!(bus.current_alt_setting(1), Some(2));

        // The other interface is untouched
        assert_eq!(target.interface(0).unwrap().generation(), 1);
    }

    #[test]
    fn test_reselecting_same_setting_rebuilds_again() {
        let bus = audio_like_bus();
        let target = target(&bus);

        target.set_interface_alt_setting(1, 1).unwrap();
        target.set_interface_alt_setting(1, 1).unwrap();

        let streaming = target.interface(1).unwrap();
        assert_eq!(streaming.alt_setting(), 1);
        assert_eq!(streaming.generation(), 3);
        assert_eq!(streaming.endpoint_addresses(), vec![0x83]);
    }

    #[test]
    fn test_failed_switch_keeps_previous_set() {
        let bus = audio_like_bus();
        let target = target(&bus);
        target.set_interface_alt_setting(1, 1).unwrap();
        bus.fail_select_setting(1, 2, UsbError::Busy);

        assert_eq!(target.set_interface_alt_setting(1, 2), Err(UsbError::Busy));

        let streaming = target.interface(1).unwrap();
        assert_eq!(streaming.alt_setting(), 1);
        assert_eq!(streaming.generation(), 2);
        assert_eq!(streaming.endpoint_addresses(), vec![0x83]);
    }

    #[test]
    fn test_pipe_failure_keeps_previous_set() {
        let bus = audio_like_bus();
        let target = target(&bus);
        target.set_interface_alt_setting(1, 1).unwrap();
        bus.fail_configured_pipe(1, 0, UsbError::NotFound);

        assert_eq!(
            target.set_interface_alt_setting(1, 2),
            Err(UsbError::NotFound)
        );

        let streaming = target.interface(1).unwrap();
        assert_eq!(streaming.alt_setting(), 1);
        assert_eq!(streaming.generation(), 2);
        assert_eq!(streaming.endpoint_addresses(), vec![0x83]);
        assert!(target.abort_pipe(0x83).is_ok());
    }

    #[test]
    fn test_out_of_range_indices() {
        let bus = audio_like_bus();
        let target = target(&bus);
        bus.clear_calls();

        assert_eq!(
            target.set_interface_alt_setting(2, 0),
            Err(UsbError::InvalidParameter)
        );
        assert_eq!(
            target.set_interface_alt_setting(u64::MAX, 0),
            Err(UsbError::InvalidParameter)
        );
        assert_eq!(
            target.set_interface_alt_setting(1, 0x1_0000),
            Err(UsbError::InvalidParameter)
        );
        assert!(bus.calls().is_empty());
    }

    #[test]
    fn test_setting_unknown_to_bus() {
        let bus = audio_like_bus();
        let target = target(&bus);

        assert_eq!(
            target.set_interface_alt_setting(1, 9),
            Err(UsbError::InvalidParameter)
        );
        assert_eq!(target.interface(1).unwrap().generation(), 1);
    }
}

mod pipe_control {
    use super::*;

    #[test]
    fn test_abort_and_reset_route_by_endpoint() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(2));
        let target = target(&bus);
        bus.clear_calls();

        target.abort_pipe(0x82).unwrap();
        target.reset_pipe(0x02).unwrap();

        assert_eq!(
            bus.calls(),
            vec![BusCall::AbortPipe(0x82), BusCall::ResetPipe(0x02)]
        );
    }

    #[test]
    fn test_missing_endpoint() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(1));
        let target = target(&bus);

        assert_eq!(target.abort_pipe(0x85), Err(UsbError::NotFound));
        assert_eq!(target.reset_pipe(0x05), Err(UsbError::NotFound));
    }

    #[test]
    fn test_endpoint_gone_after_switch() {
        let bus = Arc::new(MockUsbBus::new(vec![vec![
            bulk_pair(0),
            vec![PipeInfo::new(0x84, PipeType::Interrupt, 8)],
        ]]));
        let target = target(&bus);

        target.set_interface_alt_setting(0, 1).unwrap();
        assert_eq!(target.abort_pipe(0x81), Err(UsbError::NotFound));
        assert_eq!(target.abort_pipe(0x84), Ok(()));
    }

    #[test]
    fn test_abort_failure_is_reported() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(1));
        let target = target(&bus);
        bus.fail_abort_pipe(0x81, UsbError::NoDevice);

        assert_eq!(target.abort_pipe(0x81), Err(UsbError::NoDevice));
    }
}

mod device_reset {
    use super::*;

    #[test]
    fn test_reset_touches_every_pipe() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(2));
        let target = target(&bus);
        bus.clear_calls();

        target.reset_device().unwrap();

        assert_eq!(
            bus.calls(),
            vec![
                BusCall::AbortPipe(0x81),
                BusCall::ResetPipe(0x81),
                BusCall::AbortPipe(0x01),
                BusCall::ResetPipe(0x01),
                BusCall::AbortPipe(0x82),
                BusCall::ResetPipe(0x82),
                BusCall::AbortPipe(0x02),
                BusCall::ResetPipe(0x02),
            ]
        );
    }

    #[test]
    fn test_failing_interface_does_not_stop_reset() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(4));
        let target = target(&bus);
        bus.fail_reset_pipe(0x83, UsbError::Stall);
        bus.clear_calls();

        assert_eq!(target.reset_device(), Err(UsbError::Stall));

        let calls = bus.calls();
        assert!(calls.contains(&BusCall::ResetPipe(0x84)));
        assert!(calls.contains(&BusCall::ResetPipe(0x04)));
    }

    #[test]
    fn test_last_failure_wins() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(4));
        let target = target(&bus);
        bus.fail_reset_pipe(0x82, UsbError::Stall);
        bus.fail_abort_pipe(0x04, UsbError::NoDevice);

        assert_eq!(target.reset_device(), Err(UsbError::NoDevice));
    }

    #[test]
    fn test_reset_without_pipes() {
        let bus = audio_like_bus();
        let target = target(&bus);
        bus.clear_calls();

        target.reset_device().unwrap();
        assert_eq!(bus.calls().len(), 4);
    }
}

mod port_cycle {
    use super::*;

    #[test]
    fn test_cycle_reaches_bus() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(2));
        let target = target(&bus);
        bus.clear_calls();

        target.cycle_port().unwrap();

        assert_eq!(bus.calls(), vec![BusCall::CyclePort]);
        assert_eq!(target.interface(1).unwrap().generation(), 1);
    }

    #[test]
    fn test_cycle_failure_is_reported() {
        let bus = Arc::new(MockUsbBus::with_bulk_interfaces(1));
        let target = target(&bus);
        bus.fail_cycle_port(UsbError::NoDevice);

        assert_eq!(target.cycle_port(), Err(UsbError::NoDevice));
        assert_eq!(target.abort_pipe(0x81), Ok(()));
    }
}
