use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::Result;

/// An audio sink the output context can be routed to
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputDevice {
    pub device_id: String,
    pub label: String,
}

/// Platform output-device registry
pub trait DeviceRegistry: Send + Sync {
    fn enumerate_output_devices(&self) -> Result<Vec<OutputDevice>>;

    /// Send a unit on `notify` whenever the device list changes
    fn on_device_change(&self, notify: mpsc::UnboundedSender<()>);
}

/// Cached device list plus the active sink
#[derive(Debug, Clone, Default)]
pub struct OutputDeviceSet {
    devices: Vec<OutputDevice>,
    active: Option<OutputDevice>,
}

impl OutputDeviceSet {
    pub fn devices(&self) -> &[OutputDevice] {
        &self.devices
    }

    pub fn active(&self) -> Option<&OutputDevice> {
        self.active.as_ref()
    }

    /// Replace the cached list; the first device becomes active if none is
    pub fn refresh(&mut self, devices: Vec<OutputDevice>) {
        if self.active.is_none() {
            self.active = devices.first().cloned();
        }
        self.devices = devices;
    }

    pub fn find(&self, device_id: &str) -> Option<&OutputDevice> {
        self.devices.iter().find(|d| d.device_id == device_id)
    }

    pub fn set_active(&mut self, device_id: &str) {
        self.active = self.find(device_id).cloned();
    }
}
