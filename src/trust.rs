//! Signature gate in front of cart execution.
//!
//! A cart is trusted only when `cart.yaml.sig` is a valid detached
//! signature over the exact manifest bytes, made for the configured
//! namespace by a key listed in the trusted-signer store. Verification is
//! delegated to `ssh-keygen -Y verify`; anything but a clean zero exit is
//! a rejection. There is no configuration under which an unsigned cart runs.
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, info};

use crate::config::TrustConfig;

/// Why a cart was not trusted. Each cause is logged distinctly.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum UntrustedReason {
    #[error("signature file {0} missing")]
    MissingSignature(PathBuf),
    #[error("trusted signer store {0} missing")]
    MissingTrustStore(PathBuf),
    #[error("signature verification failed ({0})")]
    Rejected(String),
    #[error("cannot run verifier '{program}': {reason}")]
    Invocation { program: String, reason: String },
    #[error("verifier did not finish within {}s", .0.as_secs())]
    TimedOut(Duration),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    Trusted,
    Untrusted(UntrustedReason),
}

impl Verdict {
    pub fn is_trusted(&self) -> bool {
        matches!(self, Verdict::Trusted)
    }
}

/// Checks a manifest against its detached signature.
///
/// `content` is the manifest as already read by the caller; the same bytes
/// are verified and later parsed, so a file swapped on the card in between
/// cannot slip through.
#[async_trait]
pub trait Verifier: Send + Sync {
    async fn verify(&self, manifest: &Path, content: &[u8]) -> Verdict;
}

/// `cart.yaml` → `cart.yaml.sig`
pub fn signature_path(manifest: &Path) -> PathBuf {
    let mut path = OsString::from(manifest.as_os_str());
    path.push(".sig");
    PathBuf::from(path)
}

/// Runs `<program> -Y verify -f <signers> -I <identity> -n <namespace> -s <sig> -`
/// with the manifest on stdin.
pub struct SshKeygenVerifier {
    program: String,
    allowed_signers: PathBuf,
    identity: String,
    namespace: String,
    timeout: Duration,
}

impl SshKeygenVerifier {
    pub fn new(config: &TrustConfig) -> Self {
        Self {
            program: config.verifier.clone(),
            allowed_signers: config.allowed_signers.clone(),
            identity: config.identity().to_string(),
            namespace: config.namespace.clone(),
            timeout: config.timeout(),
        }
    }

    async fn run(&self, signature: &Path, content: &[u8]) -> Verdict {
        let invocation = |reason: String| {
            Verdict::Untrusted(UntrustedReason::Invocation {
                program: self.program.clone(),
                reason,
            })
        };

        let mut child = match Command::new(&self.program)
            .args(["-Y", "verify", "-f"])
            .arg(&self.allowed_signers)
            .arg("-I")
            .arg(&self.identity)
            .arg("-n")
            .arg(&self.namespace)
            .arg("-s")
            .arg(signature)
            .arg("-")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
        {
            Ok(child) => child,
            Err(e) => return invocation(e.to_string()),
        };

        // Feeding stdin and collecting output share one deadline
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A verifier that exits without reading stdin closes the pipe
                // early; its exit status decides the verdict.
                if let Err(e) = stdin.write_all(content).await {
                    debug!("Writing manifest to verifier: {e}");
                }
            }
        };
        let exchange = async {
            let ((), output) = tokio::join!(feed, child.wait_with_output());
            output
        };

        let output = match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(output)) => output,
            Ok(Err(e)) => return invocation(e.to_string()),
            Err(_) => return Verdict::Untrusted(UntrustedReason::TimedOut(self.timeout)),
        };

        if output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            if !stdout.trim().is_empty() {
                debug!("Verifier: {}", stdout.trim());
            }
            Verdict::Trusted
        } else {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.trim().is_empty() {
                debug!("Verifier: {}", stderr.trim());
            }
            Verdict::Untrusted(UntrustedReason::Rejected(output.status.to_string()))
        }
    }
}

#[async_trait]
impl Verifier for SshKeygenVerifier {
    async fn verify(&self, manifest: &Path, content: &[u8]) -> Verdict {
        let signature = signature_path(manifest);

        if !tokio::fs::try_exists(&signature).await.unwrap_or(false) {
            return Verdict::Untrusted(UntrustedReason::MissingSignature(signature));
        }
        if !tokio::fs::try_exists(&self.allowed_signers).await.unwrap_or(false) {
            return Verdict::Untrusted(UntrustedReason::MissingTrustStore(
                self.allowed_signers.clone(),
            ));
        }

        let verdict = self.run(&signature, content).await;
        if verdict.is_trusted() {
            info!("Signature verification OK for {}", manifest.display());
        }
        verdict
    }
}
