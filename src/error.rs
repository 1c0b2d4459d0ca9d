//! Error taxonomy for a verification run.
//!
//! Timeouts and forbidden console output are *not* errors: they resolve to a
//! FAIL verdict (see [`crate::verdict::FailReason`]). Everything here ends a
//! run with outcome ERROR, or, for [`HarnessError::Config`], stops it before a
//! browser is ever launched.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::RunState;

#[derive(Error, Debug)]
pub enum HarnessError {
    #[error("invalid session config: {0}")]
    Config(String),

    #[error("browser failed to launch: {0}")]
    Launch(String),

    #[error("navigation to {url} failed: {reason}")]
    Navigation { url: String, reason: String },

    #[error("browser operation failed: {0}")]
    Browser(String),

    #[error("illegal run state transition: {from:?} -> {to:?}")]
    State { from: RunState, to: RunState },
}

/// Serialisable discriminant of [`HarnessError`], recorded in verdicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Config,
    Launch,
    Navigation,
    Browser,
    State,
}

impl HarnessError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            HarnessError::Config(_) => ErrorKind::Config,
            HarnessError::Launch(_) => ErrorKind::Launch,
            HarnessError::Navigation { .. } => ErrorKind::Navigation,
            HarnessError::Browser(_) => ErrorKind::Browser,
            HarnessError::State { .. } => ErrorKind::State,
        }
    }

    /// Shorthand for building a config error from anything displayable.
    pub fn config(msg: impl Into<String>) -> Self {
        HarnessError::Config(msg.into())
    }
}

pub type HarnessResult<T> = Result<T, HarnessError>;
