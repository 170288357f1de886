use std::io;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tokio::io::AsyncReadExt;

/// Manifest file name at the root of a cart's filesystem.
pub const MANIFEST_FILE: &str = "cart.yaml";

/// Largest manifest read from a card.
pub const MAX_MANIFEST_SIZE: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("cannot read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("{} exceeds {limit} bytes", .path.display())]
    TooLarge { path: PathBuf, limit: u64 },
    #[error("malformed {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Payload descriptor. Only `exec` is recognized; other keys are ignored.
#[derive(Debug, Deserialize, Clone, Default, PartialEq)]
pub struct CartManifest {
    #[serde(default)]
    pub exec: Option<String>,
}

impl CartManifest {
    /// The shell command to run, if the manifest names a non-blank one.
    pub fn command(&self) -> Option<&str> {
        self.exec.as_deref().map(str::trim).filter(|c| !c.is_empty())
    }
}

/// Raw manifest bytes as read from the card.
///
/// Verification and parsing both work from this one read.
#[derive(Debug, Clone)]
pub struct CartFile {
    pub path: PathBuf,
    pub content: Vec<u8>,
}

impl CartFile {
    /// Reads `cart.yaml` from the mount root. `Ok(None)` means the card
    /// carries no manifest.
    ///
    /// At most `MAX_MANIFEST_SIZE` bytes are read; a bigger file is refused.
    pub async fn read(mount_point: &Path) -> Result<Option<Self>, ManifestError> {
        let path = mount_point.join(MANIFEST_FILE);
        let file = match tokio::fs::File::open(&path).await {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(ManifestError::Read { path, source }),
        };

        let mut content = Vec::new();
        if let Err(source) = file
            .take(MAX_MANIFEST_SIZE + 1)
            .read_to_end(&mut content)
            .await
        {
            return Err(ManifestError::Read { path, source });
        }
        if content.len() as u64 > MAX_MANIFEST_SIZE {
            return Err(ManifestError::TooLarge {
                path,
                limit: MAX_MANIFEST_SIZE,
            });
        }
        Ok(Some(Self { path, content }))
    }

    pub fn parse(&self) -> Result<CartManifest, ManifestError> {
        // An empty document carries no `exec`, same as a missing key
        if self.content.iter().all(u8::is_ascii_whitespace) {
            return Ok(CartManifest::default());
        }
        serde_yaml::from_slice(&self.content).map_err(|source| ManifestError::Parse {
            path: self.path.clone(),
            source,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cart_file(content: &str) -> CartFile {
        CartFile {
            path: PathBuf::from("/media/cart/cart.yaml"),
            content: content.as_bytes().to_vec(),
        }
    }

    #[test]
    fn test_parse_exec() {
        let manifest = cart_file("exec: python3 game.py --fullscreen\n").parse().unwrap();
        assert_eq!(manifest.command(), Some("python3 game.py --fullscreen"));
    }

    #[test]
    fn test_unknown_keys_ignored() {
        let manifest = cart_file("name: Snake\nversion: 2\nexec: ./snake\n")
            .parse()
            .unwrap();
        assert_eq!(manifest.command(), Some("./snake"));
    }

    #[test]
    fn test_missing_exec() {
        let manifest = cart_file("name: Snake\n").parse().unwrap();
        assert_eq!(manifest.command(), None);
    }

    #[test]
    fn test_blank_exec_is_no_command() {
        let manifest = cart_file("exec: \"   \"\n").parse().unwrap();
        assert_eq!(manifest.command(), None);
    }

    #[test]
    fn test_empty_document() {
        assert_eq!(cart_file("").parse().unwrap(), CartManifest::default());
        assert_eq!(cart_file("\n  \n").parse().unwrap(), CartManifest::default());
    }

    #[test]
    fn test_malformed_yaml() {
        let err = cart_file("exec: [unterminated\n").parse().unwrap_err();
        assert!(matches!(err, ManifestError::Parse { .. }));
        assert!(err.to_string().contains("cart.yaml"));
    }

    #[test]
    fn test_wrong_exec_type() {
        assert!(cart_file("exec:\n  - a\n  - b\n").parse().is_err());
    }

    #[tokio::test]
    async fn test_read_missing_manifest() {
        let dir = tempfile::tempdir().unwrap();
        assert!(CartFile::read(dir.path()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_manifest_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(MANIFEST_FILE), "exec: ./run\n").unwrap();
        let file = CartFile::read(dir.path()).await.unwrap().unwrap();
        assert_eq!(file.path, dir.path().join("cart.yaml"));
        assert_eq!(file.content, b"exec: ./run\n");
    }

    #[tokio::test]
    async fn test_read_refuses_oversized_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(MANIFEST_FILE);

        let mut content = b"exec: ./run\n".to_vec();
        content.resize(MAX_MANIFEST_SIZE as usize, b'#');
        std::fs::write(&path, &content).unwrap();
        let file = CartFile::read(dir.path()).await.unwrap().unwrap();
        assert_eq!(file.content.len() as u64, MAX_MANIFEST_SIZE);

        content.push(b'#');
        std::fs::write(&path, &content).unwrap();
        let err = CartFile::read(dir.path()).await.unwrap_err();
        assert!(matches!(err, ManifestError::TooLarge { limit: MAX_MANIFEST_SIZE, .. }));
    }
}
