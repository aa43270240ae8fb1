mod generic;

pub use generic::GenericHardwareManager;

use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// How well a manager fits the machine it runs on. Higher wins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum HardwareSupport {
    None = 0,
    Generic = 1,
    Mainline = 2,
    ServiceProvider = 3,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NetworkInterface {
    pub name: String,
    pub mac_address: String,
}

/// What the node reports about itself in every heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HardwareSummary {
    pub manager: String,
    pub interfaces: Vec<NetworkInterface>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_install_device: Option<String>,
}

pub trait HardwareManager: Send + Sync {
    fn name(&self) -> &str;

    fn evaluate_support(&self) -> HardwareSupport;

    fn list_network_interfaces(&self) -> anyhow::Result<Vec<NetworkInterface>>;

    fn get_os_install_device(&self) -> anyhow::Result<String>;

    /// MAC of the first interface; the node's identity towards the controller.
    fn primary_mac_address(&self) -> anyhow::Result<String> {
        self.list_network_interfaces()?
            .into_iter()
            .next()
            .map(|iface| iface.mac_address)
            .ok_or_else(|| anyhow::anyhow!("no network interfaces found"))
    }

    fn summary(&self) -> HardwareSummary {
        let interfaces = self.list_network_interfaces().unwrap_or_else(|e| {
            warn!(manager = %self.name(), error = %e, "could not list network interfaces");
            Vec::new()
        });
        let os_install_device = match self.get_os_install_device() {
            Ok(device) => Some(device),
            Err(e) => {
                warn!(manager = %self.name(), error = %e, "could not find an install device");
                None
            }
        };
        HardwareSummary {
            manager: self.name().to_string(),
            interfaces,
            os_install_device,
        }
    }
}

/// Pick the manager claiming the strongest support. On a tie the earlier
/// candidate wins; managers answering `None` are never picked.
pub fn select_hardware_manager(
    candidates: Vec<Arc<dyn HardwareManager>>,
) -> Option<Arc<dyn HardwareManager>> {
    let mut selected: Option<(HardwareSupport, Arc<dyn HardwareManager>)> = None;
    for manager in candidates {
        let support = manager.evaluate_support();
        info!(manager = %manager.name(), support = ?support, "evaluated hardware manager");
        if support == HardwareSupport::None {
            continue;
        }
        if selected.as_ref().map_or(true, |(best, _)| support > *best) {
            selected = Some((support, manager));
        }
    }

    if let Some((support, manager)) = &selected {
        info!(manager = %manager.name(), support = ?support, "selected hardware manager");
    }
    selected.map(|(_, manager)| manager)
}
