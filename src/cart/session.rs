//! Discovery of a user's graphical session environment.
//!
//! A cart that opens a window needs the `DISPLAY`/`WAYLAND_DISPLAY` of the
//! session already running on the device. The daemon itself has none, so
//! the values are borrowed from a live process owned by the target user.
use std::collections::HashMap;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;

use nix::unistd::Uid;
use tracing::debug;

/// Variables copied from the user's session when found.
pub const SESSION_VARS: [&str; 4] = [
    "DISPLAY",
    "WAYLAND_DISPLAY",
    "XAUTHORITY",
    "DBUS_SESSION_BUS_ADDRESS",
];

/// Source of session variables for a user account.
pub trait SessionEnvSource: Send + Sync {
    /// Best effort: an empty map is a valid answer.
    fn discover(&self, uid: Uid) -> HashMap<String, String>;
}

/// Scans `/proc/<pid>/environ` of processes owned by the user.
pub struct ProcSessionEnv {
    proc_root: PathBuf,
}

impl ProcSessionEnv {
    pub fn new(proc_root: impl Into<PathBuf>) -> Self {
        Self {
            proc_root: proc_root.into(),
        }
    }

    fn pids(&self) -> Vec<u32> {
        let mut pids: Vec<u32> = match std::fs::read_dir(&self.proc_root) {
            Ok(entries) => entries
                .filter_map(|entry| entry.ok())
                .filter_map(|entry| entry.file_name().to_str()?.parse().ok())
                .collect(),
            Err(e) => {
                debug!("Cannot list {}: {e}", self.proc_root.display());
                Vec::new()
            }
        };
        pids.sort_unstable();
        pids
    }
}

impl SessionEnvSource for ProcSessionEnv {
    fn discover(&self, uid: Uid) -> HashMap<String, String> {
        let mut found = HashMap::new();

        for pid in self.pids() {
            let dir = self.proc_root.join(pid.to_string());
            // Processes exit while we scan; every error just skips the pid
            let Ok(meta) = std::fs::metadata(&dir) else {
                continue;
            };
            if meta.uid() != uid.as_raw() {
                continue;
            }
            let Ok(environ) = std::fs::read(dir.join("environ")) else {
                continue;
            };

            for entry in environ.split(|b| *b == 0) {
                let entry = String::from_utf8_lossy(entry);
                let Some((key, value)) = entry.split_once('=') else {
                    continue;
                };
                if SESSION_VARS.contains(&key) && !found.contains_key(key) {
                    found.insert(key.to_string(), value.to_string());
                }
            }

            if found.contains_key("DISPLAY") || found.contains_key("WAYLAND_DISPLAY") {
                debug!("Session environment taken from pid {pid}");
                break;
            }
        }

        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake_proc() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        // Non-pid entries are present in a real /proc
        std::fs::create_dir_all(dir.path().join("self")).unwrap();
        std::fs::write(dir.path().join("uptime"), "1.0 1.0\n").unwrap();
        dir
    }

    fn add_process(proc: &tempfile::TempDir, pid: u32, env: &[&str]) {
        let pid_dir = proc.path().join(pid.to_string());
        std::fs::create_dir_all(&pid_dir).unwrap();
        let mut environ = Vec::new();
        for var in env {
            environ.extend_from_slice(var.as_bytes());
            environ.push(0);
        }
        std::fs::write(pid_dir.join("environ"), environ).unwrap();
    }

    #[test]
    fn test_discovers_allow_listed_vars_only() {
        let proc = fake_proc();
        add_process(
            &proc,
            1200,
            &[
                "PATH=/usr/bin",
                "DISPLAY=:0",
                "XAUTHORITY=/home/pi/.Xauthority",
                "SECRET_TOKEN=hunter2",
            ],
        );
        let env = ProcSessionEnv::new(proc.path()).discover(Uid::current());

        assert_eq!(env.get("DISPLAY").map(String::as_str), Some(":0"));
        assert_eq!(
            env.get("XAUTHORITY").map(String::as_str),
            Some("/home/pi/.Xauthority")
        );
        assert!(!env.contains_key("PATH"));
        assert!(!env.contains_key("SECRET_TOKEN"));
    }

    #[test]
    fn test_merges_until_display_found() {
        let proc = fake_proc();
        add_process(&proc, 100, &["DBUS_SESSION_BUS_ADDRESS=unix:path=/run/user/1000/bus"]);
        add_process(&proc, 200, &["WAYLAND_DISPLAY=wayland-1"]);
        add_process(&proc, 300, &["DISPLAY=:1"]);
        let env = ProcSessionEnv::new(proc.path()).discover(Uid::current());

        assert_eq!(
            env.get("DBUS_SESSION_BUS_ADDRESS").map(String::as_str),
            Some("unix:path=/run/user/1000/bus")
        );
        assert_eq!(env.get("WAYLAND_DISPLAY").map(String::as_str), Some("wayland-1"));
        // Scanning stopped at pid 200
        assert!(!env.contains_key("DISPLAY"));
    }

    #[test]
    fn test_first_value_wins() {
        let proc = fake_proc();
        add_process(&proc, 10, &["XAUTHORITY=/first"]);
        add_process(&proc, 20, &["XAUTHORITY=/second", "DISPLAY=:0"]);
        let env = ProcSessionEnv::new(proc.path()).discover(Uid::current());
        assert_eq!(env.get("XAUTHORITY").map(String::as_str), Some("/first"));
        assert_eq!(env.get("DISPLAY").map(String::as_str), Some(":0"));
    }

    #[test]
    fn test_other_users_processes_ignored() {
        let proc = fake_proc();
        add_process(&proc, 1200, &["DISPLAY=:0"]);
        let other = Uid::from_raw(Uid::current().as_raw().wrapping_add(1));
        let env = ProcSessionEnv::new(proc.path()).discover(other);
        assert!(env.is_empty());
    }

    #[test]
    fn test_missing_proc_root() {
        let env = ProcSessionEnv::new("/nonexistent/proc").discover(Uid::current());
        assert!(env.is_empty());
    }
}
