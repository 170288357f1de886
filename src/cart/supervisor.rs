//! Launching and tearing down cart payloads.
//!
//! Every payload is started as the leader of its own process group so the
//! whole tree it forks can be signalled at once. Teardown is SIGTERM to the
//! group, a bounded grace period, then SIGKILL.
use std::collections::{BTreeMap, HashMap};
use std::io;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use chrono::{DateTime, Utc};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{Gid, Pid, Uid, User};
use thiserror::Error;
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::session::SessionEnvSource;
use crate::config::SupervisorConfig;

/// How often the group is checked while waiting for it to exit.
const KILL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Upper bound on reaping the leader after SIGKILL.
const REAP_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("unknown user account '{0}'")]
    UnknownUser(String),
    #[error("cannot look up user '{name}': {source}")]
    UserLookup {
        name: String,
        #[source]
        source: Errno,
    },
    #[error("cannot start '{command}': {source}")]
    Launch {
        command: String,
        #[source]
        source: io::Error,
    },
    #[error("payload '{0}' exited before it could be tracked")]
    Vanished(String),
}

/// A resolved user account payloads run as.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub name: String,
    pub uid: Uid,
    pub gid: Gid,
    pub home: PathBuf,
}

impl Identity {
    pub fn lookup(name: &str) -> Result<Self, SpawnError> {
        let user = User::from_name(name)
            .map_err(|source| SpawnError::UserLookup {
                name: name.to_string(),
                source,
            })?
            .ok_or_else(|| SpawnError::UnknownUser(name.to_string()))?;

        Ok(Self {
            name: user.name,
            uid: user.uid,
            gid: user.gid,
            home: user.dir,
        })
    }

    fn runtime_dir(&self) -> PathBuf {
        PathBuf::from(format!("/run/user/{}", self.uid))
    }
}

/// Everything the launch primitive applies to a payload before it runs:
/// command, working directory, target identity and environment overrides.
#[derive(Debug, Clone)]
pub struct SpawnConfig {
    pub shell: PathBuf,
    pub command: String,
    pub working_dir: PathBuf,
    pub identity: Option<Identity>,
    pub env: BTreeMap<String, String>,
}

impl SpawnConfig {
    pub fn new(shell: impl Into<PathBuf>, command: &str, working_dir: &Path) -> Self {
        Self {
            shell: shell.into(),
            command: command.to_string(),
            working_dir: working_dir.to_path_buf(),
            identity: None,
            env: BTreeMap::new(),
        }
    }

    /// Targets `identity`: sets the login variables and merges the
    /// discovered session variables on top.
    pub fn run_as(mut self, identity: Identity, session: HashMap<String, String>) -> Self {
        let home = identity.home.to_string_lossy().into_owned();
        self.env.insert("HOME".to_string(), home);
        self.env.insert("USER".to_string(), identity.name.clone());
        self.env.insert("LOGNAME".to_string(), identity.name.clone());
        self.env.insert(
            "XDG_RUNTIME_DIR".to_string(),
            identity.runtime_dir().to_string_lossy().into_owned(),
        );
        self.env.extend(session);
        self.identity = Some(identity);
        self
    }

    fn command(&self) -> Command {
        let mut cmd = std::process::Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .envs(&self.env)
            .stdin(Stdio::null())
            .process_group(0);
        if let Some(identity) = &self.identity {
            // Applied in the child before exec. Running as root, std also
            // drops the supplementary groups when switching uid.
            cmd.gid(identity.gid.as_raw()).uid(identity.uid.as_raw());
        }
        Command::from(cmd)
    }
}

/// A payload process group owned by the daemon.
#[derive(Debug)]
pub struct RunningCart {
    pub device_node: PathBuf,
    pub mount_point: PathBuf,
    pub pgid: Pid,
    pub owner: Option<String>,
    pub started_at: DateTime<Utc>,
    child: Child,
}

/// What teardown had to do.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct KillReport {
    pub term_sent: bool,
    pub kill_sent: bool,
    /// The group was already gone when teardown started
    pub already_exited: bool,
    /// SIGKILL could not be delivered and the group still exists
    pub survived: bool,
    pub waited: Duration,
}

pub struct Supervisor {
    shell: PathBuf,
    run_as_user: Option<String>,
    kill_grace: Duration,
    session: Box<dyn SessionEnvSource>,
}

impl Supervisor {
    pub fn new(config: &SupervisorConfig, session: Box<dyn SessionEnvSource>) -> Self {
        Self {
            shell: config.shell.clone(),
            run_as_user: config.run_as_user.clone(),
            kill_grace: config.kill_grace(),
            session,
        }
    }

    pub fn run_as_user(&self) -> Option<&str> {
        self.run_as_user.as_deref()
    }

    /// Builds the launch configuration for a cart command.
    ///
    /// An account that cannot be resolved is an error; the command is never
    /// run under the daemon's own identity instead.
    pub fn spawn_config(&self, command: &str, mount_point: &Path) -> Result<SpawnConfig, SpawnError> {
        let config = SpawnConfig::new(&self.shell, command, mount_point);
        match &self.run_as_user {
            Some(name) => {
                let identity = Identity::lookup(name)?;
                let session = self.session.discover(identity.uid);
                if session.is_empty() {
                    debug!("No session environment found for {name}");
                }
                Ok(config.run_as(identity, session))
            }
            None => Ok(config),
        }
    }

    pub fn spawn(
        &self,
        device_node: &Path,
        mount_point: &Path,
        command: &str,
    ) -> Result<RunningCart, SpawnError> {
        let config = self.spawn_config(command, mount_point)?;
        self.launch(device_node, config)
    }

    pub fn launch(&self, device_node: &Path, config: SpawnConfig) -> Result<RunningCart, SpawnError> {
        let owner = config.identity.as_ref().map(|i| i.name.clone());
        match &owner {
            Some(user) => info!("Executing as {user}: {}", config.command),
            None => info!("Executing: {}", config.command),
        }

        let child = config.command().spawn().map_err(|source| SpawnError::Launch {
            command: config.command.clone(),
            source,
        })?;
        // The leader's pid is the group id (process_group(0))
        let pid = child
            .id()
            .ok_or_else(|| SpawnError::Vanished(config.command.clone()))?;

        Ok(RunningCart {
            device_node: device_node.to_path_buf(),
            mount_point: config.working_dir,
            pgid: Pid::from_raw(pid as i32),
            owner,
            started_at: Utc::now(),
            child,
        })
    }

    /// Terminates the cart's whole process group.
    ///
    /// A group that no longer exists counts as terminated.
    pub async fn kill(&self, cart: &mut RunningCart) -> KillReport {
        let started = Instant::now();
        let pgid = cart.pgid;
        let mut report = KillReport::default();

        info!("Killing process group {pgid}");
        match killpg(pgid, Signal::SIGTERM) {
            Ok(()) => report.term_sent = true,
            Err(Errno::ESRCH) => {
                let _ = cart.child.try_wait();
                report.already_exited = true;
                return report;
            }
            Err(e) => warn!("SIGTERM to process group {pgid} failed: {e}"),
        }

        let deadline = started + self.kill_grace;
        loop {
            // Reap the leader so it does not keep the group alive as a zombie
            let _ = cart.child.try_wait();
            if !group_alive(pgid) {
                report.waited = started.elapsed();
                return report;
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(KILL_POLL_INTERVAL).await;
        }

        warn!(
            "Process group {pgid} still alive after {}ms, sending SIGKILL",
            self.kill_grace.as_millis()
        );
        match killpg(pgid, Signal::SIGKILL) {
            Ok(()) => report.kill_sent = true,
            Err(Errno::ESRCH) => {}
            Err(e) => {
                warn!("SIGKILL to process group {pgid} failed: {e}");
                report.survived = group_alive(pgid);
            }
        }
        if tokio::time::timeout(REAP_TIMEOUT, cart.child.wait())
            .await
            .is_err()
        {
            warn!("Process group {pgid} leader not reaped after SIGKILL");
        }

        report.waited = started.elapsed();
        report
    }
}

fn group_alive(pgid: Pid) -> bool {
    !matches!(killpg(pgid, None), Err(Errno::ESRCH))
}
