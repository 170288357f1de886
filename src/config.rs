use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default location of the daemon configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/cartd/cartd.toml";

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct Config {
    pub trust: TrustConfig,
    pub mount: MountConfig,
    pub supervisor: SupervisorConfig,
    pub system: SystemConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct TrustConfig {
    /// File listing the public keys allowed to sign carts
    pub allowed_signers: PathBuf,
    /// Signature namespace; signatures made for another namespace never verify
    pub namespace: String,
    /// Signer principal looked up in `allowed_signers`.
    /// Falls back to `namespace` when unset.
    pub identity: Option<String>,
    /// External verifier program (ssh-keygen compatible command line)
    pub verifier: String,
    pub timeout_secs: u64,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            allowed_signers: PathBuf::from("/etc/cart_trust/allowed_signers"),
            namespace: "cart".to_string(),
            identity: None,
            verifier: "ssh-keygen".to_string(),
            timeout_secs: 10,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct MountConfig {
    pub timeout_ms: u64,
    pub poll_interval_ms: u64,
}

impl Default for MountConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5000,
            poll_interval_ms: 500,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SupervisorConfig {
    /// Account the cart payload runs as. `--user` on the command line wins.
    pub run_as_user: Option<String>,
    pub kill_grace_ms: u64,
    pub shell: PathBuf,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            run_as_user: None,
            kill_grace_ms: 3000,
            shell: PathBuf::from("/bin/sh"),
        }
    }
}

/// Kernel interfaces the daemon reads. Only overridden by tests.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct SystemConfig {
    pub sysfs_root: PathBuf,
    pub mounts: PathBuf,
    pub proc_root: PathBuf,
}

impl Default for SystemConfig {
    fn default() -> Self {
        Self {
            sysfs_root: PathBuf::from("/sys"),
            mounts: PathBuf::from("/proc/mounts"),
            proc_root: PathBuf::from("/proc"),
        }
    }
}

impl TrustConfig {
    pub fn identity(&self) -> &str {
        self.identity.as_deref().unwrap_or(&self.namespace)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl MountConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl SupervisorConfig {
    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }
}

impl Config {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Loads `path` when given. Without an explicit path the default file
    /// is used if present, otherwise built-in defaults apply.
    pub fn load_or_default(path: Option<&str>) -> anyhow::Result<Self> {
        match path {
            Some(path) => Self::load(path),
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => Self::load(DEFAULT_CONFIG_PATH),
            None => Ok(Self::default()),
        }
    }

    fn parse(content: &str) -> anyhow::Result<Self> {
        // Expand environment variables like ${CART_USER}
        let expanded = shellexpand::env(content)?;
        let config: Config = toml::from_str(&expanded)?;
        Ok(config)
    }
}
