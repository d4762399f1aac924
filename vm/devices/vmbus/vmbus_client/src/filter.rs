// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Filtering of offers by interface type.
//!
//! Only channels whose drivers are expected to run are accepted. On isolated
//! VMs the list shrinks to the devices that have been hardened against a
//! malicious host.

use guid::Guid;

/// The synthetic SCSI controller.
pub const STORAGE_INTERFACE: Guid = Guid::from_static_str("ba6163d9-04a1-4d29-b605-72e2ffb1dc7f");
/// The synthetic network adapter.
pub const NETWORK_INTERFACE: Guid = Guid::from_static_str("f8615163-df3e-46c5-913f-f2d2f965ed0e");
/// The virtual PCI bus.
pub const VPCI_INTERFACE: Guid = Guid::from_static_str("44c4f61d-4444-4400-9d52-802e27ede19f");
/// The synthetic video device.
pub const VIDEO_INTERFACE: Guid = Guid::from_static_str("da0a7802-e377-4aac-8e77-0558eb1073f8");
/// The VMBus file system.
pub const VMBFS_INTERFACE: Guid = Guid::from_static_str("c376c1c3-d276-48d2-90a9-c04748072c60");
/// The synthetic keyboard.
pub const KEYBOARD_INTERFACE: Guid = Guid::from_static_str("f912ad6d-2b17-48ea-bd65-f927a61c7684");

/// An interface type accepted by a [`ChannelFilter`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AllowedInterface {
    /// The interface type.
    pub interface_id: Guid,
    /// Whether the interface is also accepted on isolated VMs.
    pub allowed_when_isolated: bool,
}

/// Decides which offers become channels.
#[derive(Debug, Clone)]
pub struct ChannelFilter {
    allowed: Option<Vec<AllowedInterface>>,
    vmbfs_when_isolated: bool,
}

impl Default for ChannelFilter {
    /// The boot device set: storage, network and virtual PCI everywhere;
    /// video, vmbfs and the keyboard only without isolation.
    fn default() -> Self {
        let allow = |interface_id, allowed_when_isolated| AllowedInterface {
            interface_id,
            allowed_when_isolated,
        };
        Self {
            allowed: Some(vec![
                allow(STORAGE_INTERFACE, true),
                allow(NETWORK_INTERFACE, true),
                allow(VPCI_INTERFACE, true),
                allow(VIDEO_INTERFACE, false),
                allow(VMBFS_INTERFACE, false),
                allow(KEYBOARD_INTERFACE, false),
            ]),
            vmbfs_when_isolated: false,
        }
    }
}

impl ChannelFilter {
    /// A filter accepting exactly `allowed`.
    pub fn new(allowed: Vec<AllowedInterface>) -> Self {
        Self {
            allowed: Some(allowed),
            vmbfs_when_isolated: false,
        }
    }

    /// A filter accepting every offer.
    pub fn allow_all() -> Self {
        Self {
            allowed: None,
            vmbfs_when_isolated: false,
        }
    }

    /// Also accepts vmbfs on isolated VMs, where it is used for
    /// provisioning.
    pub fn with_vmbfs_when_isolated(mut self, enable: bool) -> Self {
        self.vmbfs_when_isolated = enable;
        self
    }

    /// Returns true if an offer of `interface_id` should be accepted.
    pub fn is_allowed(&self, interface_id: &Guid, isolated: bool) -> bool {
        let Some(allowed) = &self.allowed else {
            return true;
        };
        if allowed
            .iter()
            .any(|a| a.interface_id == *interface_id && (a.allowed_when_isolated || !isolated))
        {
            return true;
        }
        isolated && self.vmbfs_when_isolated && *interface_id == VMBFS_INTERFACE
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_with_tracing::test;

    #[test]
    fn boot_filter() {
        let filter = ChannelFilter::default();
        for id in [STORAGE_INTERFACE, NETWORK_INTERFACE, VPCI_INTERFACE] {
            assert!(filter.is_allowed(&id, false));
            assert!(filter.is_allowed(&id, true));
        }
        for id in [VIDEO_INTERFACE, VMBFS_INTERFACE, KEYBOARD_INTERFACE] {
            assert!(filter.is_allowed(&id, false));
            assert!(!filter.is_allowed(&id, true));
        }
        let unknown = Guid::from_static_str("00000000-0000-0000-0000-000000000001");
        assert!(!filter.is_allowed(&unknown, false));
        assert!(ChannelFilter::allow_all().is_allowed(&unknown, true));
    }

    #[test]
    fn vmbfs_when_isolated() {
        let filter = ChannelFilter::default().with_vmbfs_when_isolated(true);
        assert!(filter.is_allowed(&VMBFS_INTERFACE, true));
        assert!(!filter.is_allowed(&VIDEO_INTERFACE, true));
    }
}
