//! Quest interpreter session layer.
//!
//! [`protocol`] defines the line-JSON wire shapes and their translation into
//! [`QuestState`]; [`bridge`] owns the interpreter subprocess and the
//! [`QuestEngine`] seam the rest of the runner is written against.

pub mod bridge;
pub mod protocol;

use std::fmt;

pub use bridge::{EngineBridge, QuestEngine};
pub use protocol::{Choice, GameStatus, QuestState};

/// Failure raised by the engine bridge. Non-retryable at this layer; the run
/// loop decides what a failure means for the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    /// Subprocess could not be spawned or its initial state was unusable.
    Startup { detail: String, stderr: String },
    /// No schema-matching reply arrived within the read budget.
    Timeout { budget_secs: u64 },
    /// A JSON reply arrived but did not match the expected schema.
    Protocol { detail: String },
    /// The subprocess exited while a reply was still expected.
    Crashed { detail: String },
}

impl fmt::Display for BridgeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BridgeError::Startup { detail, stderr } => {
                if stderr.is_empty() {
                    write!(f, "bridge startup failed: {detail}")
                } else {
                    write!(f, "bridge startup failed: {detail} (stderr: {stderr})")
                }
            }
            BridgeError::Timeout { budget_secs } => {
                write!(f, "bridge timed out after {budget_secs}s")
            }
            BridgeError::Protocol { detail } => write!(f, "bridge protocol violation: {detail}"),
            BridgeError::Crashed { detail } => write!(f, "bridge subprocess crashed: {detail}"),
        }
    }
}

impl std::error::Error for BridgeError {}
