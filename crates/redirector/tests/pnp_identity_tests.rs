//! PnP Identity Tests
//!
//! Checks what an attached redirector answers to bus ID and capability
//! queries, and what it leaves to the device below.
//!
//! Run with: `cargo test -p redirector --test pnp_identity_tests`

use common::test_utils::{MockPnpDevice, MockUsbBus};
use common::{PnpInformation, PnpIrp};
use protocol::wide::{from_wide_multi_sz, from_wide_sz, to_wide_sz};
use protocol::{BusQueryIdType, DeviceCapabilities, PnpMinorFunction, UsbError};
use redirector::config::RedirectorSettings;
use redirector::identity::{
    REDIRECTOR_COMPATIBLE_IDS, REDIRECTOR_DEVICE_ID, REDIRECTOR_HARDWARE_IDS,
};
use redirector::{FilterDevice, RedirectRegistry};
use std::sync::Arc;

async fn attach_with(lower: Arc<MockPnpDevice>, instance_number: u32) -> FilterDevice {
    let settings = RedirectorSettings {
        instance_number,
        ..Default::default()
    };
    FilterDevice::attach(
        &settings,
        lower,
        Arc::new(MockUsbBus::with_bulk_interfaces(1)),
        Arc::new(RedirectRegistry::new()),
    )
    .await
    .expect("attach failed")
}

async fn attach(instance_number: u32) -> FilterDevice {
    attach_with(Arc::new(MockPnpDevice::new()), instance_number).await
}

fn query_string(filter: &FilterDevice, id_type: BusQueryIdType) -> String {
    let mut irp = PnpIrp::query_id(id_type);
    filter.pnp(&mut irp);
    assert_eq!(irp.status, Ok(()), "{:?} query failed", id_type);
    match irp.information {
        PnpInformation::Id(raw) => from_wide_sz(&raw).unwrap(),
        other => panic!("unexpected answer {:?}", other),
    }
}

fn query_list(filter: &FilterDevice, id_type: BusQueryIdType) -> Vec<String> {
    let mut irp = PnpIrp::query_id(id_type);
    filter.pnp(&mut irp);
    assert_eq!(irp.status, Ok(()), "{:?} query failed", id_type);
    match irp.information {
        PnpInformation::Id(raw) => from_wide_multi_sz(&raw).unwrap(),
        other => panic!("unexpected answer {:?}", other),
    }
}

fn query_capabilities(filter: &FilterDevice) -> (Result<(), UsbError>, PnpInformation) {
    let mut irp = PnpIrp::query_capabilities();
    filter.pnp(&mut irp);
    (irp.status, irp.information)
}

mod bus_ids {
    use super::*;

    #[tokio::test]
    async fn test_device_id_is_replaced() {
        let filter = attach(0).await;
        assert_eq!(
            query_string(&filter, BusQueryIdType::DeviceId),
            REDIRECTOR_DEVICE_ID
        );
    }

    #[tokio::test]
    async fn test_instance_id_follows_instance_number() {
        let filter = attach(0).await;
        assert_eq!(query_string(&filter, BusQueryIdType::InstanceId), "UsbRedir0");

        let filter = attach(12).await;
        assert_eq!(query_string(&filter, BusQueryIdType::InstanceId), "UsbRedir12");
    }

    #[tokio::test]
    async fn test_id_lists_are_replaced() {
        let filter = attach(0).await;
        assert_eq!(
            query_list(&filter, BusQueryIdType::HardwareIds),
            REDIRECTOR_HARDWARE_IDS.to_vec()
        );
        assert_eq!(
            query_list(&filter, BusQueryIdType::CompatibleIds),
            REDIRECTOR_COMPATIBLE_IDS.to_vec()
        );
    }

    #[tokio::test]
    async fn test_serial_number_passes_through() {
        let lower = MockPnpDevice::new()
            .with_id(BusQueryIdType::DeviceSerialNumber, to_wide_sz("2B5A5C1"));
        let filter = attach_with(Arc::new(lower), 0).await;

        assert_eq!(
            query_string(&filter, BusQueryIdType::DeviceSerialNumber),
            "2B5A5C1"
        );
    }

    #[tokio::test]
    async fn test_lower_failure_is_not_masked() {
        let filter = attach(0).await;

        let mut irp = PnpIrp::query_id(BusQueryIdType::ContainerId);
        filter.pnp(&mut irp);
        assert_eq!(irp.status, Err(UsbError::NotSupported));
        assert_eq!(irp.information, PnpInformation::None);
    }

    #[tokio::test]
    async fn test_identity_keeps_real_ids() {
        let filter = attach(3).await;
        let identity = filter.identity();

        assert_eq!(identity.device_id, MockPnpDevice::DEVICE_ID);
        assert_eq!(identity.instance_id, MockPnpDevice::INSTANCE_ID);
        assert_eq!(
            identity.hardware_ids,
            vec!["USB\\VID_046D&PID_C52B&REV_1201", "USB\\VID_046D&PID_C52B"]
        );
        assert_eq!(identity.compatible_ids.len(), 3);
    }

    #[tokio::test]
    async fn test_queries_reach_lower_device() {
        let lower = Arc::new(MockPnpDevice::new());
        let filter = attach_with(lower.clone(), 0).await;
        let before = lower.sent().len();

        query_string(&filter, BusQueryIdType::DeviceId);

        let sent = lower.sent();
        assert_eq!(sent.len(), before + 1);
        assert_eq!(
            sent.last(),
            Some(&(PnpMinorFunction::QueryId, Some(BusQueryIdType::DeviceId)))
        );
    }
}

mod capabilities {
    use super::*;

    #[tokio::test]
    async fn test_flags_are_forced() {
        let filter = attach(0).await;

        let (status, information) = query_capabilities(&filter);
        assert_eq!(status, Ok(()));
        let PnpInformation::Capabilities(caps) = information else {
            panic!("no capabilities in answer");
        };

        assert!(caps.raw_device_ok);
        assert!(caps.no_display_in_ui);
        assert!(caps.silent_install);
        assert!(!caps.removable);
        assert!(!caps.eject_supported);
    }

    #[tokio::test]
    async fn test_other_fields_survive() {
        let filter = attach(0).await;

        let (_, information) = query_capabilities(&filter);
        let PnpInformation::Capabilities(caps) = information else {
            panic!("no capabilities in answer");
        };
        assert!(caps.surprise_removal_ok);
        assert_eq!(caps.address, 2);
        assert_eq!(caps.ui_number, 2);
    }

    #[tokio::test]
    async fn test_failed_query_is_left_alone() {
        let lower = MockPnpDevice::new().with_capabilities(None);
        let filter = attach_with(Arc::new(lower), 0).await;

        let (status, information) = query_capabilities(&filter);
        assert_eq!(status, Err(UsbError::Unsuccessful));
        assert_eq!(
            information,
            PnpInformation::Capabilities(DeviceCapabilities::default())
        );
    }
}

mod passthrough {
    use super::*;

    #[tokio::test]
    async fn test_other_minor_functions_are_forwarded() {
        let lower = Arc::new(MockPnpDevice::new());
        let filter = attach_with(lower.clone(), 0).await;

        let mut irp = PnpIrp::new(PnpMinorFunction::QueryDeviceRelations);
        filter.pnp(&mut irp);

        assert_eq!(irp.status, Ok(()));
        assert_eq!(
            lower.sent().last(),
            Some(&(PnpMinorFunction::QueryDeviceRelations, None))
        );
    }
}
