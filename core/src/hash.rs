//! Canonical command hashing.
//!
//! A request pins a digest over (raw command ∥ working directory ∥
//! shell-interpretation flag) at creation time. The executor recomputes the
//! digest at the gate to detect tampering, and the emergency path uses a
//! prefix of it as a non-interactive acknowledgement token.

use std::path::Path;
use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use sha2::Digest;
use sha2::Sha256;

use crate::error::Result;
use crate::error::SlbErr;

/// Minimum number of hex characters an emergency acknowledgement must carry.
pub const MIN_ACK_LEN: usize = 8;

/// What actually runs: the raw text, where, and whether a shell interprets
/// it. The canonical hash is immutable once a request is created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandSpec {
    pub command: String,
    pub cwd: PathBuf,
    pub use_shell: bool,
}

impl CommandSpec {
    pub fn new(command: impl Into<String>, cwd: impl Into<PathBuf>, use_shell: bool) -> Self {
        Self {
            command: command.into(),
            cwd: cwd.into(),
            use_shell,
        }
    }

    /// Hex SHA-256 over the three fields, NUL-separated so that no pair of
    /// distinct specs can collide by field concatenation.
    pub fn canonical_hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.command.as_bytes());
        hasher.update([0u8]);
        hasher.update(path_bytes(&self.cwd));
        hasher.update([0u8]);
        hasher.update([u8::from(self.use_shell)]);
        hex::encode(hasher.finalize())
    }
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> &[u8] {
    use std::os::unix::ffi::OsStrExt;
    path.as_os_str().as_bytes()
}

#[cfg(not(unix))]
fn path_bytes(path: &Path) -> Vec<u8> {
    path.to_string_lossy().into_owned().into_bytes()
}

/// Validate an emergency acknowledgement against the canonical hash: at
/// least [`MIN_ACK_LEN`] hex characters forming a prefix of the hash.
pub fn verify_ack(ack: &str, hash: &str) -> Result<()> {
    if ack.len() < MIN_ACK_LEN {
        return Err(SlbErr::Validation(format!(
            "acknowledgement must be at least {MIN_ACK_LEN} hex characters of the command hash"
        )));
    }
    if !ack.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(SlbErr::Validation(
            "acknowledgement must be hex characters of the command hash".to_string(),
        ));
    }
    if !hash.starts_with(&ack.to_ascii_lowercase()) {
        return Err(SlbErr::Validation(
            "acknowledgement does not match the command hash".to_string(),
        ));
    }
    Ok(())
}
