//! Resolves the mount point of a freshly inserted card.
//!
//! The desktop automounter (or udisks, or an fstab entry) mounts the card
//! some time after udev reports it, so resolution polls the mount table
//! with a bounded deadline. Running out of time is a normal outcome for
//! unformatted cards and is reported as `None`.
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::{MountConfig, SystemConfig};

pub struct MountResolver {
    sysfs_root: PathBuf,
    mounts: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl MountResolver {
    pub fn new(system: &SystemConfig, mount: &MountConfig) -> Self {
        Self {
            sysfs_root: system.sysfs_root.clone(),
            mounts: system.mounts.clone(),
            timeout: mount.timeout(),
            poll_interval: mount.poll_interval(),
        }
    }

    /// Polls until one of the device's partitions (or the device itself)
    /// shows up in the mount table, or the timeout elapses.
    pub async fn resolve(&self, device_node: &Path) -> Option<PathBuf> {
        let deadline = Instant::now() + self.timeout;

        loop {
            let candidates = self.candidates(device_node);
            if let Some(mount_point) = self.lookup(&candidates) {
                return Some(mount_point);
            }

            if Instant::now() + self.poll_interval > deadline {
                debug!(
                    "{} not mounted after {}ms",
                    device_node.display(),
                    self.timeout.as_millis()
                );
                return None;
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// Partition device nodes listed under `/sys/block/<name>`, sorted.
    /// A card formatted without a partition table has none, in which case
    /// the whole-disk node is the only candidate.
    fn candidates(&self, device_node: &Path) -> Vec<PathBuf> {
        let Some(name) = device_node.file_name().and_then(|n| n.to_str()) else {
            return vec![device_node.to_path_buf()];
        };

        let mut partitions: Vec<PathBuf> = std::fs::read_dir(self.sysfs_root.join("block").join(name))
            .map(|entries| {
                entries
                    .filter_map(|entry| entry.ok())
                    .filter_map(|entry| entry.file_name().into_string().ok())
                    .filter(|entry| entry.starts_with(name) && entry.len() > name.len())
                    .map(|entry| Path::new("/dev").join(entry))
                    .collect()
            })
            .unwrap_or_default();
        partitions.sort();

        if partitions.is_empty() {
            partitions.push(device_node.to_path_buf());
        }
        partitions
    }

    /// Mount point of the first candidate present in the mount table.
    fn lookup(&self, candidates: &[PathBuf]) -> Option<PathBuf> {
        let table = match std::fs::read_to_string(&self.mounts) {
            Ok(table) => table,
            Err(e) => {
                debug!("Cannot read {}: {e}", self.mounts.display());
                return None;
            }
        };
        let entries = parse_mount_table(&table);

        candidates.iter().find_map(|candidate| {
            entries
                .iter()
                .find(|(source, _)| Path::new(source) == candidate)
                .map(|(_, target)| PathBuf::from(target))
        })
    }
}

/// Parses `/proc/mounts` into `(source, target)` pairs.
fn parse_mount_table(table: &str) -> Vec<(String, String)> {
    table
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let source = fields.next()?;
            let target = fields.next()?;
            Some((unescape(source), unescape(target)))
        })
        .collect()
}

/// Undoes the kernel's octal escaping of whitespace and backslashes
/// in mount table fields (`\040` for a space).
fn unescape(field: &str) -> String {
    let bytes = field.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 4 <= bytes.len() {
            let octal = std::str::from_utf8(&bytes[i + 1..i + 4]).unwrap_or("");
            if let Ok(value) = u8::from_str_radix(octal, 8) {
                out.push(value);
                i += 4;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}
