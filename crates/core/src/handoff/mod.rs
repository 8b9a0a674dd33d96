/// Live handoff of established connections
///
/// A running instance offers duplicates of its live sockets together with
/// opaque resume state. A new instance of the same identity adopts them with
/// the token it was given. The record is consumed exactly once; whatever
/// happens, the old instance learns whether to close its copies
/// (`Committed`) or keep serving (`Aborted`).

pub mod coordinator;

pub use coordinator::{HandoffConfig, HandoffCoordinator, HandoffSummary};

use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Random 128-bit token, hex encoded
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandoffToken(String);

impl HandoffToken {
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(hex::encode(bytes))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for HandoffToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Tokens are bearer secrets; only a prefix goes to logs.
        write!(f, "HandoffToken({}…)", &self.0[..self.0.len().min(8)])
    }
}

impl fmt::Display for HandoffToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.0[..self.0.len().min(8)])
    }
}

impl From<String> for HandoffToken {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Describes one offered socket
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionMeta {
    /// Connection class; must be resumable for the offering identity
    pub class: String,

    /// Opaque application state the new instance resumes from
    pub resume_state: Vec<u8>,
}

impl ConnectionMeta {
    pub fn new(class: impl Into<String>, resume_state: Vec<u8>) -> Self {
        Self {
            class: class.into(),
            resume_state,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandoffOutcome {
    /// The new instance owns the connections; close your copies
    Committed,
    /// Nothing changed hands; keep serving
    Aborted,
}
