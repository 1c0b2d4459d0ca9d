//! Session runner: owns the browser for one run and turns it into a verdict.
//!
//! A run moves `Init → Launched → Navigated → Waiting → {Passed, Failed}`;
//! any failure on the way lands in `Errored`. Whatever happens after launch,
//! the browser is closed exactly once before the verdict is returned.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use serde::Serialize;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio::time::{timeout, timeout_at, Instant};
use tracing::{debug, error, info, warn, Instrument};

use crate::browser::{BrowserDriver, BrowserHandle, PageHandle};
use crate::config::SessionConfig;
use crate::error::{HarnessError, HarnessResult};
use crate::matcher::SignalMatcher;
use crate::recorder::ConsoleRecorder;
use crate::verdict::{judge, ErrorReport, Outcome, Verdict};
use crate::waiter::{ReadinessWaiter, ReadyBy, WaitOutcome};

const SCREENSHOT_TIMEOUT: Duration = Duration::from_secs(30);
const TEARDOWN_TIMEOUT: Duration = Duration::from_secs(10);
const LATE_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Init,
    Launched,
    Navigated,
    Waiting,
    Passed,
    Failed,
    Errored,
}

impl RunState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Passed | RunState::Failed | RunState::Errored)
    }

    pub fn can_advance_to(&self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (Init, Launched) | (Launched, Navigated) | (Navigated, Waiting) => true,
            (Waiting, Passed) | (Waiting, Failed) => true,
            (from, Errored) => !from.is_terminal(),
            _ => false,
        }
    }

    pub fn advance(&mut self, next: RunState) -> HarnessResult<()> {
        if !self.can_advance_to(next) {
            return Err(HarnessError::State {
                from: *self,
                to: next,
            });
        }
        debug!(from = ?self, to = ?next, "run state");
        *self = next;
        Ok(())
    }
}

#[derive(Clone)]
pub struct SessionRunner {
    driver: Arc<dyn BrowserDriver>,
}

impl SessionRunner {
    pub fn new(driver: Arc<dyn BrowserDriver>) -> Self {
        Self { driver }
    }

    /// Execute one run. Never fails: problems become an ERROR verdict.
    pub async fn run(&self, config: &SessionConfig) -> Verdict {
        let run_id = uuid::Uuid::new_v4().to_string();
        let span = tracing::info_span!("session", name = %config.name, run_id = %run_id);
        self.run_inner(config, run_id).instrument(span).await
    }

    async fn run_inner(&self, config: &SessionConfig, run_id: String) -> Verdict {
        info!(url = %config.target_url, "starting run");
        let mut state = RunState::Init;
        let mut recorder = ConsoleRecorder::new(
            SignalMatcher::new(config.rules.clone()),
            config.transcript_cap,
        )
        .echo(config.echo_console);

        let (result, screenshot) = match self.driver.launch(&config.launch).await {
            Ok(browser) => with_browser(browser, config, &mut state, &mut recorder).await,
            Err(e) => (Err(HarnessError::Launch(format!("{e:#}"))), None),
        };

        let transcript_path = match config.transcript_path() {
            Some(path) if recorder.is_attached() => write_transcript(&recorder, path).await,
            _ => None,
        };

        conclude(
            config,
            run_id,
            &mut state,
            &recorder,
            result,
            screenshot,
            transcript_path,
        )
    }
}

/// Everything that happens while a browser is alive. Closes it on the way out.
async fn with_browser(
    mut browser: Box<dyn BrowserHandle>,
    config: &SessionConfig,
    state: &mut RunState,
    recorder: &mut ConsoleRecorder,
) -> (HarnessResult<WaitOutcome>, Option<PathBuf>) {
    let page = match state.advance(RunState::Launched) {
        Ok(()) => browser
            .new_page()
            .await
            .map_err(|e| HarnessError::Browser(format!("opening page: {e:#}"))),
        Err(e) => Err(e),
    };

    let outcome = match page {
        Ok(page) => {
            let result = drive(page.as_ref(), config, state, recorder).await;
            if recorder.is_attached() {
                late_drain(page.as_ref(), recorder).await;
            }
            let shot = capture_screenshot(page.as_ref(), &config.screenshot_path).await;
            (result, shot)
        }
        Err(e) => (Err(e), None),
    };

    match timeout(TEARDOWN_TIMEOUT, browser.close()).await {
        Ok(Ok(())) => debug!("browser closed"),
        Ok(Err(e)) => warn!(error = %format!("{e:#}"), "browser teardown failed"),
        Err(_) => warn!("browser teardown timed out; dropping handle"),
    }
    outcome
}

/// Attach, navigate, optionally click, then wait.
async fn drive(
    page: &dyn PageHandle,
    config: &SessionConfig,
    state: &mut RunState,
    recorder: &mut ConsoleRecorder,
) -> HarnessResult<WaitOutcome> {
    recorder
        .attach(page)
        .await
        .map_err(|e| HarnessError::Browser(format!("{e:#}")))?;

    let nav = page
        .goto(&config.target_url)
        .await
        .map_err(|e| HarnessError::Navigation {
            url: config.target_url.clone(),
            reason: format!("{e:#}"),
        })?;
    if !nav.is_success() {
        return Err(HarnessError::Navigation {
            url: config.target_url.clone(),
            reason: format!("HTTP status {}", nav.status.unwrap_or_default()),
        });
    }
    state.advance(RunState::Navigated)?;
    info!(status = ?nav.status, "navigated");

    let started = Instant::now();
    let deadline = started + config.max_wait;
    if let Some(selector) = &config.click_selector {
        match timeout_at(deadline, page.click(selector)).await {
            Ok(Ok(())) => debug!(selector = %selector, "clicked"),
            Ok(Err(e)) => {
                return Err(HarnessError::Browser(format!("click {selector}: {e:#}")));
            }
            Err(_) => {
                warn!(selector = %selector, "click target never became clickable");
                state.advance(RunState::Waiting)?;
                return Ok(WaitOutcome {
                    ready_by: ReadyBy::Timeout,
                    elapsed: started.elapsed(),
                });
            }
        }
    }

    state.advance(RunState::Waiting)?;
    let waiter =
        ReadinessWaiter::new(config.poll_interval, config.max_wait).with_deadline(deadline);
    let mut outcome = waiter
        .wait(page, recorder, config.ready_selector.as_deref())
        .await;
    outcome.elapsed = started.elapsed();
    Ok(outcome)
}

/// Pick up console output that arrived after the last poll, including
/// anything a read cut off at the wait deadline left unrecorded.
async fn late_drain(page: &dyn PageHandle, recorder: &mut ConsoleRecorder) {
    match timeout(LATE_DRAIN_TIMEOUT, recorder.drain(page)).await {
        Ok(Ok(n)) if n > 0 => debug!(messages = n, "late console drain"),
        Ok(Ok(_)) => {}
        Ok(Err(e)) => debug!(error = %e, "late console drain failed"),
        Err(_) => debug!("late console drain timed out"),
    }
}

/// Best effort: a missing screenshot never changes the outcome.
async fn capture_screenshot(page: &dyn PageHandle, path: &Path) -> Option<PathBuf> {
    let bytes = match timeout(SCREENSHOT_TIMEOUT, page.screenshot()).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(e)) => {
            warn!(error = %format!("{e:#}"), "screenshot failed");
            return None;
        }
        Err(_) => {
            warn!("screenshot timed out");
            return None;
        }
    };
    match write_artifact(path, &bytes).await {
        Ok(()) => {
            info!(path = %path.display(), bytes = bytes.len(), "screenshot saved");
            Some(path.to_path_buf())
        }
        Err(e) => {
            warn!(error = %format!("{e:#}"), "could not save screenshot");
            None
        }
    }
}

async fn write_artifact(path: &Path, bytes: &[u8]) -> anyhow::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    tokio::fs::write(path, bytes)
        .await
        .with_context(|| format!("writing {}", path.display()))
}

async fn write_transcript(recorder: &ConsoleRecorder, path: PathBuf) -> Option<PathBuf> {
    match recorder.transcript().write_to(&path).await {
        Ok(()) => Some(path),
        Err(e) => {
            warn!(error = %format!("{e:#}"), "could not save console transcript");
            None
        }
    }
}

fn conclude(
    config: &SessionConfig,
    run_id: String,
    state: &mut RunState,
    recorder: &ConsoleRecorder,
    result: HarnessResult<WaitOutcome>,
    screenshot_path: Option<PathBuf>,
    transcript_path: Option<PathBuf>,
) -> Verdict {
    let matcher = recorder.matcher();
    let unmatched_required = matcher.unmatched_required();
    let violated_forbidden = matcher.violations().to_vec();

    let (outcome, fail_reason, ready_by, wait_ms, error) = match result {
        Ok(wait) => {
            let (outcome, reason) = judge(
                wait.ready_by,
                !violated_forbidden.is_empty(),
                !unmatched_required.is_empty(),
                config.strict,
            );
            let terminal = if outcome == Outcome::Pass {
                RunState::Passed
            } else {
                RunState::Failed
            };
            if let Err(e) = state.advance(terminal) {
                error!(error = %e, "run ended in unexpected state");
            }
            (
                outcome,
                reason,
                Some(wait.ready_by),
                wait.elapsed.as_millis() as u64,
                None,
            )
        }
        Err(e) => {
            if let Err(se) = state.advance(RunState::Errored) {
                error!(error = %se, "run ended in unexpected state");
            }
            error!(kind = ?e.kind(), error = %e, "run errored");
            (Outcome::Error, None, None, 0, Some(ErrorReport::from(&e)))
        }
    };

    let transcript = recorder.transcript();
    let verdict = Verdict {
        run_id,
        name: config.name.clone(),
        target_url: config.target_url.clone(),
        outcome,
        fail_reason,
        ready_by,
        wait_ms,
        unmatched_required,
        violated_forbidden,
        error,
        console_entries: transcript.total_recorded(),
        transcript_truncated: transcript.is_truncated(),
        transcript_path,
        screenshot_path,
    };
    info!(
        outcome = verdict.outcome.as_str(),
        ready_by = ?verdict.ready_by,
        wait_ms = verdict.wait_ms,
        console_entries = verdict.console_entries,
        "run finished"
    );
    verdict
}

/// Run independent sessions concurrently, at most `max_parallel` at a time.
/// Verdicts come back in input order.
pub async fn run_suite(
    runner: &SessionRunner,
    sessions: Vec<SessionConfig>,
    max_parallel: usize,
) -> Vec<Verdict> {
    let limit = Arc::new(Semaphore::new(max_parallel.max(1)));
    let mut slots: Vec<Option<Verdict>> = vec![None; sessions.len()];
    let mut fallback = Vec::with_capacity(sessions.len());
    let mut task_index = HashMap::new();
    let mut set = JoinSet::new();

    for (index, config) in sessions.into_iter().enumerate() {
        fallback.push((config.name.clone(), config.target_url.clone()));
        let runner = runner.clone();
        let limit = Arc::clone(&limit);
        let handle = set.spawn(async move {
            let _permit = limit.acquire_owned().await.ok();
            (index, runner.run(&config).await)
        });
        task_index.insert(handle.id(), index);
    }

    while let Some(joined) = set.join_next().await {
        match joined {
            Ok((index, verdict)) => slots[index] = Some(verdict),
            Err(e) => {
                error!(error = %e, "session task aborted");
                if let Some(&index) = task_index.get(&e.id()) {
                    let (name, url) = &fallback[index];
                    slots[index] = Some(aborted_verdict(name, url, &e.to_string()));
                }
            }
        }
    }

    slots.into_iter().flatten().collect()
}

fn aborted_verdict(name: &str, url: &str, message: &str) -> Verdict {
    let err = HarnessError::Browser(format!("session task aborted: {message}"));
    Verdict {
        run_id: uuid::Uuid::new_v4().to_string(),
        name: name.to_string(),
        target_url: url.to_string(),
        outcome: Outcome::Error,
        fail_reason: None,
        ready_by: None,
        wait_ms: 0,
        unmatched_required: Vec::new(),
        violated_forbidden: Vec::new(),
        error: Some(ErrorReport::from(&err)),
        console_entries: 0,
        transcript_truncated: false,
        transcript_path: None,
        screenshot_path: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut s = RunState::Init;
        for next in [
            RunState::Launched,
            RunState::Navigated,
            RunState::Waiting,
            RunState::Passed,
        ] {
            s.advance(next).unwrap();
        }
        assert!(s.is_terminal());
    }

    #[test]
    fn states_cannot_be_skipped() {
        let mut s = RunState::Init;
        assert!(s.advance(RunState::Navigated).is_err());
        assert_eq!(s, RunState::Init);

        s.advance(RunState::Launched).unwrap();
        assert!(s.advance(RunState::Waiting).is_err());
        assert!(s.advance(RunState::Passed).is_err());
        assert!(s.advance(RunState::Launched).is_err());
    }

    #[test]
    fn errored_reachable_from_any_non_terminal_state() {
        for from in [
            RunState::Init,
            RunState::Launched,
            RunState::Navigated,
            RunState::Waiting,
        ] {
            let mut s = from;
            s.advance(RunState::Errored).unwrap();
        }
    }

    #[test]
    fn terminal_states_never_reentered() {
        for from in [RunState::Passed, RunState::Failed, RunState::Errored] {
            for to in [
                RunState::Init,
                RunState::Waiting,
                RunState::Passed,
                RunState::Failed,
                RunState::Errored,
            ] {
                assert!(!from.can_advance_to(to), "{from:?} -> {to:?}");
            }
        }
    }
}
