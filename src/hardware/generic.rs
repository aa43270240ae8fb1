use anyhow::Context;
use sysinfo::{Disks, Networks};

use super::{HardwareManager, HardwareSupport, NetworkInterface};

/// Works on any host sysinfo understands. Vendor managers outrank it.
#[derive(Debug, Default, Clone, Copy)]
pub struct GenericHardwareManager;

impl GenericHardwareManager {
    pub fn new() -> Self {
        Self
    }
}

impl HardwareManager for GenericHardwareManager {
    fn name(&self) -> &str {
        "generic"
    }

    fn evaluate_support(&self) -> HardwareSupport {
        HardwareSupport::Generic
    }

    fn list_network_interfaces(&self) -> anyhow::Result<Vec<NetworkInterface>> {
        let networks = Networks::new_with_refreshed_list();
        let mut interfaces: Vec<NetworkInterface> = networks
            .iter()
            .filter(|(name, data)| name.as_str() != "lo" && !data.mac_address().is_unspecified())
            .map(|(name, data)| NetworkInterface {
                name: name.clone(),
                mac_address: data.mac_address().to_string(),
            })
            .collect();
        interfaces.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(interfaces)
    }

    /// Largest non-removable disk.
    fn get_os_install_device(&self) -> anyhow::Result<String> {
        let disks = Disks::new_with_refreshed_list();
        disks
            .list()
            .iter()
            .filter(|disk| !disk.is_removable())
            .max_by_key(|disk| disk.total_space())
            .map(|disk| disk.name().to_string_lossy().into_owned())
            .context("no suitable install device found")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claims_generic_support() {
        assert_eq!(GenericHardwareManager::new().evaluate_support(), HardwareSupport::Generic);
    }

    #[test]
    fn interfaces_are_sorted_and_skip_loopback() {
        let interfaces = GenericHardwareManager::new().list_network_interfaces().unwrap();
        assert!(interfaces.iter().all(|iface| iface.name != "lo"));
        assert!(interfaces.windows(2).all(|w| w[0].name <= w[1].name));
    }
}
