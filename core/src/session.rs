//! Sessions: the only identity the core recognizes.
//!
//! A session is an authenticated principal for one agent run. Rows are
//! append-only; the secret key is generated here and compared in constant
//! time during reviewer authentication.

use std::path::PathBuf;

use chrono::DateTime;
use chrono::Utc;
use rand::RngCore;
use serde::Deserialize;
use serde::Serialize;
use subtle::ConstantTimeEq;
use uuid::Uuid;

const SESSION_KEY_BYTES: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: Uuid,
    /// High-entropy secret, hex-encoded. Held by the agent and presented on
    /// every mutating verb.
    pub session_key: String,
    pub agent: String,
    pub model: String,
    /// Tool identifier, e.g. "claude-code" or "codex".
    pub program: String,
    pub project_path: PathBuf,
    pub created_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        agent: impl Into<String>,
        model: impl Into<String>,
        program: impl Into<String>,
        project_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_key: generate_session_key(),
            agent: agent.into(),
            model: model.into(),
            program: program.into(),
            project_path: project_path.into(),
            created_at: Utc::now(),
        }
    }

    /// Constant-time comparison of the supplied key against the stored one.
    /// A length mismatch short-circuits, which leaks only the key length —
    /// keys are fixed-size so every wrong guess takes the same path.
    pub fn verify_key(&self, supplied: &str) -> bool {
        let stored = self.session_key.as_bytes();
        let supplied = supplied.as_bytes();
        if stored.len() != supplied.len() {
            return false;
        }
        stored.ct_eq(supplied).into()
    }
}

pub fn generate_session_key() -> String {
    let mut bytes = [0u8; SESSION_KEY_BYTES];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
