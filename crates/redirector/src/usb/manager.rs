//! USB device enumeration
//!
//! Finds the device to redirect among those currently connected. Filters
//! use the `VID:PID` form of the configuration file, with `*` matching any
//! value. Root hubs are never candidates.

use crate::usb::device::{DeviceSummary, UsbDevice};
use crate::usb::transfers::map_rusb_error;
use protocol::{UsbError, UsbResult};
use rusb::{Context, UsbContext};
use tracing::{debug, info, warn};

pub struct DeviceManager {
    context: Context,
}

impl DeviceManager {
    pub fn new() -> UsbResult<Self> {
        let context = Context::new().map_err(map_rusb_error)?;
        Ok(Self { context })
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    fn devices(&self) -> UsbResult<Vec<UsbDevice>> {
        let list = self.context.devices().map_err(map_rusb_error)?;
        let mut devices = Vec::new();
        for device in list.iter() {
            match UsbDevice::new(device) {
                Ok(device) => devices.push(device),
                Err(e) => warn!("Failed to read device descriptor: {}", e),
            }
        }
        Ok(devices)
    }

    /// Summaries of every connected device except root hubs
    pub fn list_devices(&self) -> UsbResult<Vec<DeviceSummary>> {
        let summaries: Vec<DeviceSummary> = self
            .devices()?
            .iter()
            .map(UsbDevice::summary)
            .filter(|summary| {
                if summary.is_root_hub() {
                    debug!(
                        "Skipping root hub: bus={}, addr={}",
                        summary.bus_number, summary.device_address
                    );
                }
                !summary.is_root_hub()
            })
            .collect();
        debug!("Enumerated {} devices", summaries.len());
        Ok(summaries)
    }

    /// First non-hub device matching `filter`
    pub fn find(&self, filter: &str) -> UsbResult<UsbDevice> {
        let filters = [filter.to_string()];
        let device = self
            .devices()?
            .into_iter()
            .find(|device| {
                let summary = device.summary();
                !summary.is_root_hub()
                    && Self::check_filter(summary.vendor_id, summary.product_id, &filters)
            })
            .ok_or_else(|| {
                warn!("No device matches filter {}", filter);
                UsbError::NotFound
            })?;

        info!(
            "Found device {:03}:{:03} for filter {}",
            device.bus_number(),
            device.device_address(),
            filter
        );
        Ok(device)
    }

    /// Whether a VID/PID pair matches any of `filters`
    ///
    /// An empty filter list matches everything.
    pub fn check_filter(vid: u16, pid: u16, filters: &[String]) -> bool {
        if filters.is_empty() {
            return true;
        }

        filters.iter().any(|filter| {
            let Some((filter_vid, filter_pid)) = filter.split_once(':') else {
                return false;
            };
            matches_id(filter_vid, vid) && matches_id(filter_pid, pid)
        })
    }
}

fn matches_id(pattern: &str, value: u16) -> bool {
    if pattern == "*" {
        return true;
    }
    let hex = pattern
        .strip_prefix("0x")
        .or_else(|| pattern.strip_prefix("0X"))
        .unwrap_or(pattern);
    u16::from_str_radix(hex, 16).is_ok_and(|id| id == value)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_logic() {
        let filters = vec!["0x1234:0x5678".to_string(), "0xABCD:*".to_string()];

        assert!(DeviceManager::check_filter(0x1234, 0x5678, &filters));
        assert!(DeviceManager::check_filter(0xABCD, 0x1111, &filters));
        assert!(DeviceManager::check_filter(0xabcd, 0x9999, &filters));

        assert!(!DeviceManager::check_filter(0x1234, 0x9999, &filters));
        assert!(!DeviceManager::check_filter(0x9999, 0x5678, &filters));

        assert!(DeviceManager::check_filter(0x1234, 0x5678, &[]));
    }

    #[test]
    fn test_malformed_filter_matches_nothing() {
        let filters = vec!["0x1234".to_string(), "0xZZZZ:*".to_string()];
        assert!(!DeviceManager::check_filter(0x1234, 0x0001, &filters));
    }

    #[test]
    fn test_wildcard_vendor() {
        let filters = vec!["*:0x0002".to_string()];
        assert!(DeviceManager::check_filter(0x0001, 0x0002, &filters));
        assert!(!DeviceManager::check_filter(0x0001, 0x0003, &filters));
    }
}
