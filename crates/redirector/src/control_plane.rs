//! Control-plane registry of active redirects

use protocol::{DeviceIdKey, UsbError, UsbStatus};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

/// Registry the redirector reports its lifecycle to
pub trait ControlPlane: Send + Sync {
    /// A redirector for `(device_id, instance_id)` is up and owned by
    /// filter instance `owner`
    fn notify_redirector_attached(&self, device_id: &str, instance_id: &str, owner: u32)
    -> UsbStatus;

    /// The redirect for `key` is going away
    fn remove_redirect(&self, key: &DeviceIdKey) -> UsbStatus;
}

/// One active redirect
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedirectEntry {
    pub device_id: String,
    pub instance_id: String,
    pub owner: u32,
}

/// In-memory control plane
#[derive(Debug, Default)]
pub struct RedirectRegistry {
    redirects: Mutex<BTreeMap<DeviceIdKey, u32>>,
}

impl RedirectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Active redirects ordered by key
    pub fn snapshot(&self) -> Vec<RedirectEntry> {
        self.redirects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, &owner)| RedirectEntry {
                device_id: key.device_id.clone(),
                instance_id: key.instance_id.clone(),
                owner,
            })
            .collect()
    }

    pub fn contains(&self, key: &DeviceIdKey) -> bool {
        self.redirects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.redirects
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ControlPlane for RedirectRegistry {
    fn notify_redirector_attached(
        &self,
        device_id: &str,
        instance_id: &str,
        owner: u32,
    ) -> UsbStatus {
        let key = DeviceIdKey::new(device_id, instance_id);
        let mut redirects = self.redirects.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = redirects.get(&key) {
            warn!(
                "Redirect for {}\\{} already owned by instance {}",
                device_id, instance_id, existing
            );
            return Err(UsbError::ObjectNameCollision);
        }

        debug!("Redirect registered: {}\\{} -> {}", device_id, instance_id, owner);
        redirects.insert(key, owner);
        Ok(())
    }

    fn remove_redirect(&self, key: &DeviceIdKey) -> UsbStatus {
        let mut redirects = self.redirects.lock().unwrap_or_else(PoisonError::into_inner);
        match redirects.remove(key) {
            Some(owner) => {
                debug!(
                    "Redirect removed: {}\\{} (instance {})",
                    key.device_id, key.instance_id, owner
                );
                Ok(())
            }
            None => Err(UsbError::NotFound),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_attach_and_remove() {
        let registry = RedirectRegistry::new();
        assert!(registry.is_empty());

        registry
            .notify_redirector_attached("USB\\VID_1234&PID_0001", "1&2&3", 0)
            .unwrap();
        let key = DeviceIdKey::new("USB\\VID_1234&PID_0001", "1&2&3");
        assert!(registry.contains(&key));
        assert_eq!(
            registry.snapshot(),
            vec![RedirectEntry {
                device_id: "USB\\VID_1234&PID_0001".into(),
                instance_id: "1&2&3".into(),
                owner: 0,
            }]
        );

        registry.remove_redirect(&key).unwrap();
        assert!(registry.is_empty());
    }

    #[test]
    fn test_duplicate_attach_collides() {
        let registry = RedirectRegistry::new();
        registry.notify_redirector_attached("dev", "inst", 1).unwrap();
        assert_eq!(
            registry.notify_redirector_attached("dev", "inst", 2),
            Err(UsbError::ObjectNameCollision)
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_remove_unknown() {
        let registry = RedirectRegistry::new();
        assert_eq!(
            registry.remove_redirect(&DeviceIdKey::new("dev", "inst")),
            Err(UsbError::NotFound)
        );
    }
}
