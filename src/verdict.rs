//! The final, immutable result of one run.

use std::path::PathBuf;
use std::process::ExitCode;

use serde::{Deserialize, Serialize};

use crate::error::{ErrorKind, HarnessError};
use crate::matcher::{RuleSummary, Violation};
use crate::waiter::ReadyBy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Outcome {
    Pass,
    Fail,
    Error,
}

impl Outcome {
    /// 0 = PASS, 1 = FAIL, 2 = ERROR.
    pub fn code(&self) -> u8 {
        match self {
            Outcome::Pass => 0,
            Outcome::Fail => 1,
            Outcome::Error => 2,
        }
    }

    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.code())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Pass => "PASS",
            Outcome::Fail => "FAIL",
            Outcome::Error => "ERROR",
        }
    }
}

/// Why a run failed, most severe first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailReason {
    /// Loaded, but emitted something forbidden.
    ForbiddenPattern,
    /// Never became ready.
    Timeout,
    /// Ready by selector, but strict mode wanted every required marker.
    UnmatchedRequired,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&HarnessError> for ErrorReport {
    fn from(e: &HarnessError) -> Self {
        Self {
            kind: e.kind(),
            message: e.to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Verdict {
    pub run_id: String,
    pub name: String,
    pub target_url: String,
    pub outcome: Outcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fail_reason: Option<FailReason>,
    /// `None` when the run errored before waiting started.
    pub ready_by: Option<ReadyBy>,
    pub wait_ms: u64,
    pub unmatched_required: Vec<RuleSummary>,
    pub violated_forbidden: Vec<Violation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorReport>,
    pub console_entries: u64,
    pub transcript_truncated: bool,
    pub transcript_path: Option<PathBuf>,
    pub screenshot_path: Option<PathBuf>,
}

/// Decide PASS/FAIL for a run that reached the waiting stage.
pub fn judge(
    ready_by: ReadyBy,
    has_violations: bool,
    has_unmatched: bool,
    strict: bool,
) -> (Outcome, Option<FailReason>) {
    if has_violations {
        (Outcome::Fail, Some(FailReason::ForbiddenPattern))
    } else if !ready_by.is_ready() {
        (Outcome::Fail, Some(FailReason::Timeout))
    } else if strict && has_unmatched {
        (Outcome::Fail, Some(FailReason::UnmatchedRequired))
    } else {
        (Outcome::Pass, None)
    }
}

impl Verdict {
    /// One human-readable line, e.g. `PASS scene: ready by MATCH in 840 ms`.
    pub fn summary(&self) -> String {
        let mut line = format!("{} {}", self.outcome.as_str(), self.name);
        if let Some(err) = &self.error {
            line.push_str(&format!(": {}", err.message));
            return line;
        }
        if let Some(ready_by) = self.ready_by {
            let how = match ready_by {
                ReadyBy::Selector => "ready by SELECTOR",
                ReadyBy::Match => "ready by MATCH",
                ReadyBy::Timeout => "timed out",
            };
            line.push_str(&format!(": {how} in {} ms", self.wait_ms));
        }
        if !self.violated_forbidden.is_empty() {
            let labels: Vec<_> = self
                .violated_forbidden
                .iter()
                .map(|v| format!("{:?} (#{})", v.rule.label, v.sequence))
                .collect();
            line.push_str(&format!("; forbidden: {}", labels.join(", ")));
        }
        if !self.unmatched_required.is_empty() {
            let labels: Vec<_> = self
                .unmatched_required
                .iter()
                .map(|r| format!("{:?}", r.label))
                .collect();
            line.push_str(&format!("; missing: {}", labels.join(", ")));
        }
        line
    }
}
