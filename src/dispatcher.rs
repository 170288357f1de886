use std::path::{Path, PathBuf};

use anyhow::{anyhow, Result};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cart::{
    CartFile, CartRegistry, KillReport, ProcSessionEnv, RunningCart, Supervisor,
};
use crate::config::Config;
use crate::device::{Action, Device, DeviceEvent, MediaClassifier, MonitorEvent};
use crate::mount::MountResolver;
use crate::trust::{SshKeygenVerifier, UntrustedReason, Verdict, Verifier};

/// What the dispatcher decided for one notification.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Spawned { pgid: Pid },
    NotMounted,
    NoManifest,
    Untrusted(UntrustedReason),
    InvalidManifest(String),
    NoExec,
    SpawnFailed(String),
    Stopped(KillReport),
    NothingRunning,
    Duplicate,
    /// Not removable storage, or an action we do not act on
    Ignored,
}

/// The event loop, core of cartd.
///
/// Receives udev notifications, classifies them, and drives each card
/// through mount → verify → spawn on insert and kill on removal. Events
/// are handled strictly one at a time.
pub struct EventDispatcher {
    classifier: MediaClassifier,
    mounts: MountResolver,
    verifier: Box<dyn Verifier>,
    supervisor: Supervisor,
    registry: CartRegistry,
    last_event: Option<(Action, PathBuf)>,
}

impl EventDispatcher {
    pub fn new(
        classifier: MediaClassifier,
        mounts: MountResolver,
        verifier: Box<dyn Verifier>,
        supervisor: Supervisor,
    ) -> Self {
        Self {
            classifier,
            mounts,
            verifier,
            supervisor,
            registry: CartRegistry::new(),
            last_event: None,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            MediaClassifier::new(&config.system.sysfs_root),
            MountResolver::new(&config.system, &config.mount),
            Box::new(SshKeygenVerifier::new(&config.trust)),
            Supervisor::new(
                &config.supervisor,
                Box::new(ProcSessionEnv::new(&config.system.proc_root)),
            ),
        )
    }

    #[cfg(test)]
    pub fn registry(&self) -> &CartRegistry {
        &self.registry
    }

    /// Main loop. Returns only when the notification bus fails, which the
    /// caller treats as fatal; tracked carts are left for `shutdown()`.
    pub async fn run(&mut self, mut events: mpsc::Receiver<MonitorEvent>) -> Result<()> {
        info!("Monitoring for SD cards...");
        if let Some(user) = self.supervisor.run_as_user() {
            info!("Exec commands will run as: {user}");
        }

        while let Some(event) = events.recv().await {
            match event {
                MonitorEvent::Device(device) => {
                    self.handle_device(&device).await;
                }
                MonitorEvent::Error(e) => {
                    return Err(anyhow!("device notification bus failed: {e}"));
                }
            }
        }

        Err(anyhow!("device notification bus closed"))
    }

    pub async fn handle_device(&mut self, device: &Device) -> Outcome {
        match self.classifier.classify(device) {
            Some(event) => self.handle_event(event).await,
            None => Outcome::Ignored,
        }
    }

    /// Routes one classified event. An event identical to the previous one
    /// is a redelivery and is dropped.
    pub async fn handle_event(&mut self, event: DeviceEvent) -> Outcome {
        let (action, node) = event.key();
        if let Some((last_action, last_node)) = &self.last_event {
            if *last_action == action && last_node == node {
                debug!("Duplicate {action} for {}, skipping", node.display());
                return Outcome::Duplicate;
            }
        }
        self.last_event = Some((event.action, event.device_node.clone()));
        debug!(
            "{} {action} (media present: {})",
            event.device_node.display(),
            event.has_media
        );

        match event.action {
            Action::Insert => self.insert(&event.device_node).await,
            Action::Remove => self.remove(&event.device_node).await,
        }
    }

    async fn insert(&mut self, device_node: &Path) -> Outcome {
        info!("SD card inserted: {}", device_node.display());

        // A re-insert without a removal in between must not leave the old
        // payload running next to the new one
        if self.registry.contains(device_node) {
            warn!(
                "{} already has a running cart, stopping it first",
                device_node.display()
            );
            self.stop(device_node).await;
            if self.registry.contains(device_node) {
                return Outcome::SpawnFailed(format!(
                    "previous cart for {} could not be stopped",
                    device_node.display()
                ));
            }
        }

        let Some(mount_point) = self.mounts.resolve(device_node).await else {
            info!("Card not mounted: {}", device_node.display());
            return Outcome::NotMounted;
        };
        info!("{} mounted at {}", device_node.display(), mount_point.display());

        let cart_file = match CartFile::read(&mount_point).await {
            Ok(Some(file)) => file,
            Ok(None) => {
                info!("No cart.yaml detected on {}", mount_point.display());
                return Outcome::NoManifest;
            }
            Err(e) => {
                warn!("Execution blocked: {e}");
                return Outcome::InvalidManifest(e.to_string());
            }
        };
        info!("Found cart.yaml at {}", cart_file.path.display());

        if let Verdict::Untrusted(reason) =
            self.verifier.verify(&cart_file.path, &cart_file.content).await
        {
            warn!("Execution blocked (untrusted cart): {reason}");
            return Outcome::Untrusted(reason);
        }

        let manifest = match cart_file.parse() {
            Ok(manifest) => manifest,
            Err(e) => {
                warn!("Execution blocked: {e}");
                return Outcome::InvalidManifest(e.to_string());
            }
        };
        let Some(command) = manifest.command() else {
            info!("No 'exec' field in {}", cart_file.path.display());
            return Outcome::NoExec;
        };

        match self.supervisor.spawn(device_node, &mount_point, command) {
            Ok(cart) => {
                let pgid = cart.pgid;
                info!(
                    "Cart for {} running as process group {pgid}",
                    device_node.display()
                );
                if let Some(mut stale) = self.registry.insert(cart) {
                    // Never drop a tracked group without killing it
                    self.supervisor.kill(&mut stale).await;
                }
                Outcome::Spawned { pgid }
            }
            Err(e) => {
                error!("Cannot start cart from {}: {e}", device_node.display());
                Outcome::SpawnFailed(e.to_string())
            }
        }
    }

    async fn remove(&mut self, device_node: &Path) -> Outcome {
        info!("SD card removed: {}", device_node.display());
        match self.stop(device_node).await {
            Some(report) => Outcome::Stopped(report),
            None => Outcome::NothingRunning,
        }
    }

    /// Kills and unregisters the cart for `device_node`.
    ///
    /// The entry stays registered until the kill completes, and stays for
    /// good if the group survived it, so a live group is never untracked.
    async fn stop(&mut self, device_node: &Path) -> Option<KillReport> {
        let cart = self.registry.get_mut(device_node)?;
        let report = self.supervisor.kill(cart).await;
        if report.survived {
            error!(
                "Process group {} for {} could not be killed, keeping it tracked",
                cart.pgid,
                device_node.display()
            );
            return Some(report);
        }
        if let Some(cart) = self.registry.remove(device_node) {
            log_stopped(&cart, &report);
        }
        Some(report)
    }

    /// Kills every tracked cart. Called on signal shutdown and bus failure.
    pub async fn shutdown(&mut self) {
        if self.registry.is_empty() {
            return;
        }
        info!("Stopping {} running cart(s)...", self.registry.len());
        for device_node in self.registry.device_nodes() {
            self.stop(&device_node).await;
        }
        info!("Stopped.");
    }
}

fn log_stopped(cart: &RunningCart, report: &KillReport) {
    let uptime = chrono::Utc::now() - cart.started_at;
    let how = if report.already_exited {
        "had already exited"
    } else if report.kill_sent {
        "killed"
    } else if report.term_sent {
        "terminated"
    } else {
        "gone"
    };
    info!(
        "Cart for {} ({}) {how} after {}s, teardown took {}ms (pgid {}, user {})",
        cart.device_node.display(),
        cart.mount_point.display(),
        uptime.num_seconds(),
        report.waited.as_millis(),
        cart.pgid,
        cart.owner.as_deref().unwrap_or("daemon")
    );
}
