pub mod classify;
pub mod monitor;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

pub use classify::MediaClassifier;
pub use monitor::MonitorEvent;

/// A block device as described by one udev notification.
///
/// Built from the `KEY=VALUE` properties udev broadcasts; `ACTION`,
/// `DEVNAME` and `DEVTYPE` are pulled out, the rest stays in `properties`
/// (e.g. `ID_BUS`, `ID_FS_TYPE`, `ID_PART_TABLE_TYPE`).
#[derive(Debug, Clone, Default)]
pub struct Device {
    pub action: String,
    pub subsystem: Option<String>,
    pub device_node: Option<PathBuf>,
    pub device_type: Option<String>,
    pub properties: HashMap<String, String>,
}

impl Device {
    pub fn from_properties(properties: HashMap<String, String>) -> Self {
        let action = properties.get("ACTION").cloned().unwrap_or_default();
        let subsystem = properties.get("SUBSYSTEM").cloned();
        let device_type = properties.get("DEVTYPE").cloned();
        let device_node = properties.get("DEVNAME").map(|name| {
            // The kernel reports DEVNAME relative to /dev, udev reports it absolute
            if name.starts_with('/') {
                PathBuf::from(name)
            } else {
                Path::new("/dev").join(name)
            }
        });

        Self {
            action,
            subsystem,
            device_node,
            device_type,
            properties,
        }
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Kernel name of the device (`sdb`, `mmcblk0`), the last component
    /// of the device node.
    pub fn kernel_name(&self) -> Option<&str> {
        self.device_node
            .as_deref()
            .and_then(Path::file_name)
            .and_then(|n| n.to_str())
    }
}

/// Effective media transition after classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Insert,
    Remove,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Action::Insert => write!(f, "insert"),
            Action::Remove => write!(f, "remove"),
        }
    }
}

/// A classified removable-media event, consumed once by the dispatcher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceEvent {
    pub device_node: PathBuf,
    pub action: Action,
    pub has_media: bool,
}

impl DeviceEvent {
    /// Identity used for duplicate suppression.
    pub fn key(&self) -> (Action, &Path) {
        (self.action, &self.device_node)
    }
}

#[cfg(test)]
pub(crate) fn test_device(pairs: &[(&str, &str)]) -> Device {
    Device::from_properties(
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
    )
}
