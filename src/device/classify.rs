//! Removable-media classification.
//!
//! Decides whether a block device is a card slot or card reader we care
//! about, and turns its raw udev action into an effective insert/remove.
//!
//! A `change` notification is what a card slot emits when a card goes in
//! or out, so the media check disambiguates it. The media check is a
//! heuristic: with no partition table and no filesystem reported, it relies
//! on the sysfs size attribute, and an unreadable size counts as "no media".
use std::path::PathBuf;

use tracing::debug;

use super::{Action, Device, DeviceEvent};

pub struct MediaClassifier {
    sysfs_root: PathBuf,
}

impl MediaClassifier {
    pub fn new(sysfs_root: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
        }
    }

    fn block_attribute(&self, name: &str, attribute: &str) -> Option<String> {
        let path = self.sysfs_root.join("block").join(name).join(attribute);
        match std::fs::read_to_string(&path) {
            Ok(value) => Some(value.trim().to_string()),
            Err(e) => {
                debug!("Cannot read {}: {e}", path.display());
                None
            }
        }
    }

    /// True for whole-disk memory card devices: native `mmcblk*` slots, and
    /// `sd*` disks attached over USB or flagged removable by the kernel.
    /// Partitions never qualify.
    pub fn is_removable_storage(&self, device: &Device) -> bool {
        if device.device_type.as_deref() != Some("disk") {
            return false;
        }
        let (Some(node), Some(name)) = (device.device_node.as_deref(), device.kernel_name())
        else {
            return false;
        };

        if name.contains("mmcblk") {
            return true;
        }

        // Path::starts_with only matches whole components
        if node.to_str().is_some_and(|n| n.starts_with("/dev/sd")) {
            if device.property("ID_BUS") == Some("usb") {
                return true;
            }
            return self.block_attribute(name, "removable").as_deref() == Some("1");
        }

        false
    }

    pub fn has_media(&self, device: &Device) -> bool {
        if device.property("ID_PART_TABLE_TYPE").is_some_and(|v| !v.is_empty()) {
            return true;
        }
        if device.property("ID_FS_TYPE").is_some_and(|v| !v.is_empty()) {
            return true;
        }

        let Some(name) = device.kernel_name() else {
            return false;
        };
        self.block_attribute(name, "size")
            .and_then(|size| size.parse::<u64>().ok())
            .is_some_and(|sectors| sectors > 0)
    }

    /// Maps a udev notification to an effective media event.
    ///
    /// Returns `None` for devices that are not removable storage and for
    /// actions other than add/remove/change.
    pub fn classify(&self, device: &Device) -> Option<DeviceEvent> {
        if !self.is_removable_storage(device) {
            return None;
        }
        let device_node = device.device_node.clone()?;
        let has_media = self.has_media(device);

        let action = match device.action.as_str() {
            "add" => Action::Insert,
            "remove" => Action::Remove,
            "change" if has_media => Action::Insert,
            "change" => Action::Remove,
            other => {
                debug!("Ignoring '{other}' on {}", device_node.display());
                return None;
            }
        };

        Some(DeviceEvent {
            device_node,
            action,
            has_media,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::test_device;

    /// Builds a fake `/sys/block/<name>` with the given attributes.
    fn sysfs_with(name: &str, attrs: &[(&str, &str)]) -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        let block = dir.path().join("block").join(name);
        std::fs::create_dir_all(&block).unwrap();
        for (attr, value) in attrs {
            std::fs::write(block.join(attr), format!("{value}\n")).unwrap();
        }
        dir
    }

    fn empty_sysfs() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    // ── is_removable_storage ─────────────────────────────

    #[test]
    fn test_usb_disk_is_removable() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = test_device(&[
            ("DEVNAME", "/dev/sdb"),
            ("DEVTYPE", "disk"),
            ("ID_BUS", "usb"),
        ]);
        assert!(classifier.is_removable_storage(&dev));
    }

    #[test]
    fn test_usb_disk_with_removable_flag() {
        let sysfs = sysfs_with("sdz", &[("removable", "1")]);
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = test_device(&[
            ("DEVNAME", "/dev/sdz"),
            ("DEVTYPE", "disk"),
            ("ID_BUS", "usb"),
        ]);
        assert!(classifier.is_removable_storage(&dev));
    }

    #[test]
    fn test_sd_disk_removable_attribute_without_usb_bus() {
        let sysfs = sysfs_with("sdc", &[("removable", "1")]);
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = test_device(&[
            ("DEVNAME", "/dev/sdc"),
            ("DEVTYPE", "disk"),
            ("ID_BUS", "ata"),
        ]);
        assert!(classifier.is_removable_storage(&dev));
    }

    #[test]
    fn test_fixed_sata_disk_is_not_removable() {
        let sysfs = sysfs_with("sda", &[("removable", "0")]);
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = test_device(&[
            ("DEVNAME", "/dev/sda"),
            ("DEVTYPE", "disk"),
            ("ID_BUS", "ata"),
        ]);
        assert!(!classifier.is_removable_storage(&dev));
    }

    #[test]
    fn test_unreadable_removable_attribute_is_false() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = test_device(&[("DEVNAME", "/dev/sdd"), ("DEVTYPE", "disk")]);
        assert!(!classifier.is_removable_storage(&dev));
    }

    #[test]
    fn test_mmc_slot_is_removable() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = test_device(&[("DEVNAME", "/dev/mmcblk0"), ("DEVTYPE", "disk")]);
        assert!(classifier.is_removable_storage(&dev));
    }

    #[test]
    fn test_partitions_are_excluded() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());
        let mmc_part = test_device(&[("DEVNAME", "/dev/mmcblk0p1"), ("DEVTYPE", "partition")]);
        let usb_part = test_device(&[
            ("DEVNAME", "/dev/sdb1"),
            ("DEVTYPE", "partition"),
            ("ID_BUS", "usb"),
        ]);
        assert!(!classifier.is_removable_storage(&mmc_part));
        assert!(!classifier.is_removable_storage(&usb_part));
    }

    #[test]
    fn test_other_block_devices_are_excluded() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());
        for node in ["/dev/nvme0n1", "/dev/loop0", "/dev/dm-0", "/dev/sr0"] {
            let dev = test_device(&[("DEVNAME", node), ("DEVTYPE", "disk"), ("ID_BUS", "usb")]);
            assert!(!classifier.is_removable_storage(&dev), "{node}");
        }
    }

    #[test]
    fn test_device_without_node_is_excluded() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = test_device(&[("DEVTYPE", "disk"), ("ID_BUS", "usb")]);
        assert!(!classifier.is_removable_storage(&dev));
    }

    // ── has_media ────────────────────────────────────────

    #[test]
    fn test_partition_table_means_media() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = test_device(&[("DEVNAME", "/dev/sdb"), ("ID_PART_TABLE_TYPE", "dos")]);
        assert!(classifier.has_media(&dev));
    }

    #[test]
    fn test_filesystem_means_media() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = test_device(&[("DEVNAME", "/dev/sdb"), ("ID_FS_TYPE", "vfat")]);
        assert!(classifier.has_media(&dev));
    }

    #[test]
    fn test_size_fallback() {
        let sysfs = sysfs_with("sdb", &[("size", "62333952")]);
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = test_device(&[("DEVNAME", "/dev/sdb")]);
        assert!(classifier.has_media(&dev));
    }

    #[test]
    fn test_zero_size_is_empty_slot() {
        let sysfs = sysfs_with("sdb", &[("size", "0")]);
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = test_device(&[("DEVNAME", "/dev/sdb")]);
        assert!(!classifier.has_media(&dev));
    }

    #[test]
    fn test_unreadable_or_garbage_size_is_no_media() {
        let sysfs = sysfs_with("sdc", &[("size", "n/a")]);
        let classifier = MediaClassifier::new(sysfs.path());
        assert!(!classifier.has_media(&test_device(&[("DEVNAME", "/dev/sdb")])));
        assert!(!classifier.has_media(&test_device(&[("DEVNAME", "/dev/sdc")])));
    }

    // ── classify ─────────────────────────────────────────

    fn usb_card(action: &str, extra: &[(&'static str, &'static str)]) -> Device {
        let mut pairs = vec![
            ("ACTION", action),
            ("DEVNAME", "/dev/sdz"),
            ("DEVTYPE", "disk"),
            ("ID_BUS", "usb"),
        ];
        pairs.extend_from_slice(extra);
        test_device(&pairs)
    }

    #[test]
    fn test_add_and_remove_map_directly() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());

        let insert = classifier.classify(&usb_card("add", &[])).unwrap();
        assert_eq!(insert.action, Action::Insert);
        assert_eq!(insert.device_node, PathBuf::from("/dev/sdz"));

        let remove = classifier.classify(&usb_card("remove", &[])).unwrap();
        assert_eq!(remove.action, Action::Remove);
    }

    #[test]
    fn test_change_with_media_is_insert() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());
        let event = classifier
            .classify(&usb_card("change", &[("ID_FS_TYPE", "exfat")]))
            .unwrap();
        assert_eq!(event.action, Action::Insert);
        assert!(event.has_media);
    }

    #[test]
    fn test_change_without_media_is_remove() {
        let sysfs = sysfs_with("sdz", &[("size", "0")]);
        let classifier = MediaClassifier::new(sysfs.path());
        let event = classifier.classify(&usb_card("change", &[])).unwrap();
        assert_eq!(event.action, Action::Remove);
        assert!(!event.has_media);
    }

    #[test]
    fn test_change_classification_is_stable() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = usb_card("change", &[("ID_PART_TABLE_TYPE", "gpt")]);
        let first = classifier.classify(&dev).unwrap();
        let second = classifier.classify(&dev).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_other_actions_ignored() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());
        assert!(classifier.classify(&usb_card("bind", &[])).is_none());
        assert!(classifier.classify(&usb_card("move", &[])).is_none());
        assert!(classifier.classify(&usb_card("online", &[])).is_none());
    }

    #[test]
    fn test_non_removable_device_not_classified() {
        let sysfs = empty_sysfs();
        let classifier = MediaClassifier::new(sysfs.path());
        let dev = test_device(&[
            ("ACTION", "add"),
            ("DEVNAME", "/dev/nvme0n1"),
            ("DEVTYPE", "disk"),
        ]);
        assert!(classifier.classify(&dev).is_none());
    }
}
