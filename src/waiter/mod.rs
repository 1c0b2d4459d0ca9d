//! Readiness waiter: block until the page is ready or the budget runs out.
//!
//! Each poll drains pending console output into the recorder, then checks,
//! in priority order: the ready selector, the matcher's MATCH state, and the
//! budget. Every probe runs under a hard deadline of
//! `max_wait + poll_interval`, so a hung browser call cannot stall the run.
//! Cutting a console read short only drops the reply; the messages stay
//! buffered in the page for the next read.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{debug, warn};

use crate::browser::PageHandle;
use crate::recorder::ConsoleRecorder;

/// Which condition ended the wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ReadyBy {
    Selector,
    Match,
    Timeout,
}

impl ReadyBy {
    pub fn is_ready(&self) -> bool {
        !matches!(self, ReadyBy::Timeout)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOutcome {
    pub ready_by: ReadyBy,
    pub elapsed: Duration,
}

#[derive(Debug, Clone)]
pub struct ReadinessWaiter {
    poll_interval: Duration,
    max_wait: Duration,
    deadline: Option<Instant>,
}

impl ReadinessWaiter {
    pub fn new(poll_interval: Duration, max_wait: Duration) -> Self {
        Self {
            poll_interval,
            max_wait,
            deadline: None,
        }
    }

    /// Cap the wait at an absolute instant in addition to `max_wait`.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub async fn wait(
        &self,
        page: &dyn PageHandle,
        recorder: &mut ConsoleRecorder,
        ready_selector: Option<&str>,
    ) -> WaitOutcome {
        let start = Instant::now();
        let mut budget_end = start + self.max_wait;
        if let Some(deadline) = self.deadline {
            budget_end = budget_end.min(deadline);
        }
        let hard_stop = budget_end + self.poll_interval;
        let done = |ready_by| WaitOutcome {
            ready_by,
            elapsed: start.elapsed(),
        };

        let mut polls: u64 = 0;
        loop {
            polls += 1;
            match timeout_at(hard_stop, poll_once(page, recorder, ready_selector)).await {
                Ok(Some(ready_by)) => {
                    debug!(?ready_by, polls, "page ready");
                    return done(ready_by);
                }
                Ok(None) => {}
                Err(_) => {
                    warn!(polls, "readiness probe still pending at hard deadline");
                    return done(ReadyBy::Timeout);
                }
            }

            let now = Instant::now();
            if now >= budget_end {
                debug!(polls, "wait budget exhausted");
                return done(ReadyBy::Timeout);
            }
            sleep_until((now + self.poll_interval).min(budget_end)).await;
        }
    }
}

async fn poll_once(
    page: &dyn PageHandle,
    recorder: &mut ConsoleRecorder,
    ready_selector: Option<&str>,
) -> Option<ReadyBy> {
    if let Err(e) = recorder.drain(page).await {
        debug!(error = %e, "console drain failed; retrying next poll");
    }
    if let Some(selector) = ready_selector {
        match page.selector_present(selector).await {
            Ok(true) => return Some(ReadyBy::Selector),
            Ok(false) => {}
            Err(e) => debug!(selector, error = %e, "selector probe failed; retrying next poll"),
        }
    }
    if recorder.matcher().is_ready() {
        return Some(ReadyBy::Match);
    }
    None
}
