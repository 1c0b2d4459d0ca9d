//! Command-line surface: argument model, run planning, and output.
//!
//! Keeps `main.rs` slim: clap parsing is declared here so tests can build
//! a [`Cli`] from argument lists.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use tracing::debug;

use crate::browser;
use crate::config::{
    BackendKind, SessionConfig, SessionSpec, SuiteConfig, DEFAULT_MAX_PARALLEL,
    DEFAULT_POLL_INTERVAL_MS, DEFAULT_SCREENSHOT_PATH, DEFAULT_TIMEOUT_MS,
};
use crate::error::{HarnessError, HarnessResult};
use crate::runner::{run_suite, SessionRunner};
use crate::verdict::{Outcome, Verdict};

#[derive(Parser, Debug)]
#[command(
    name = "render-probe",
    version,
    about = "Load a page in a headless browser, wait until it is ready, and judge its console output"
)]
pub struct Cli {
    /// YAML suite file describing one or more sessions
    #[arg(short, long, conflicts_with = "url")]
    pub config: Option<PathBuf>,

    /// Page to verify
    #[arg(long, required_unless_present = "config")]
    pub url: Option<String>,

    /// CSS selector that signals the page is ready
    #[arg(long, conflicts_with = "config")]
    pub ready_selector: Option<String>,

    /// Console substring that must appear (repeatable)
    #[arg(long = "require", value_name = "PATTERN", conflicts_with = "config")]
    pub require: Vec<String>,

    /// Console substring that fails the run (repeatable)
    #[arg(long = "forbid", value_name = "PATTERN", conflicts_with = "config")]
    pub forbid: Vec<String>,

    /// Console regex that must match (repeatable)
    #[arg(long = "require-regex", value_name = "REGEX", conflicts_with = "config")]
    pub require_regex: Vec<String>,

    /// Console regex that fails the run (repeatable)
    #[arg(long = "forbid-regex", value_name = "REGEX", conflicts_with = "config")]
    pub forbid_regex: Vec<String>,

    /// Wait budget in milliseconds
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_MS, conflicts_with = "config")]
    pub timeout_ms: u64,

    /// Poll interval in milliseconds
    #[arg(long, default_value_t = DEFAULT_POLL_INTERVAL_MS, conflicts_with = "config")]
    pub poll_interval_ms: u64,

    /// Where to write the screenshot
    #[arg(long, default_value = DEFAULT_SCREENSHOT_PATH, conflicts_with = "config")]
    pub screenshot_path: PathBuf,

    /// Keep at most N console entries in the transcript
    #[arg(long, value_name = "N", conflicts_with = "config")]
    pub transcript_cap: Option<usize>,

    /// Do not write the console transcript file
    #[arg(long, conflicts_with = "config")]
    pub no_transcript: bool,

    /// Show the browser window
    #[arg(long, conflicts_with = "config")]
    pub headed: bool,

    /// Extra browser flag, passed through untouched (repeatable)
    #[arg(
        long = "browser-arg",
        value_name = "FLAG",
        allow_hyphen_values = true,
        conflicts_with = "config"
    )]
    pub browser_args: Vec<String>,

    /// Selector to click after the page loads, before waiting
    #[arg(long, value_name = "SELECTOR", conflicts_with = "config")]
    pub click: Option<String>,

    /// Log every console line at info level
    #[arg(long, conflicts_with = "config")]
    pub echo_console: bool,

    /// Fail when required patterns are missing even if the selector appeared
    #[arg(long, conflicts_with = "config")]
    pub strict: bool,

    /// Browser back-end
    #[arg(long, value_enum)]
    pub backend: Option<BackendKind>,

    /// Base URL of the browser sidecar
    #[arg(long, env = "BROWSER_SIDECAR_URL")]
    pub sidecar_url: Option<String>,

    /// Maximum concurrent sessions for suites
    #[arg(long)]
    pub max_parallel: Option<usize>,

    /// Print verdicts as JSON
    #[arg(long)]
    pub json: bool,

    /// Also write logs as JSON lines to this file
    #[arg(long)]
    pub log_file: Option<PathBuf>,
}

/// Everything needed to start running, already validated.
#[derive(Debug)]
pub struct RunPlan {
    pub backend: BackendKind,
    pub sidecar_url: Option<String>,
    pub max_parallel: usize,
    pub sessions: Vec<SessionConfig>,
}

impl Cli {
    /// Flags for a single run, as a session spec.
    pub fn session_spec(&self) -> Option<SessionSpec> {
        let url = self.url.clone()?;
        let mut spec = SessionSpec::new(url);
        spec.ready_selector = self.ready_selector.clone();
        spec.require = self.require.clone();
        spec.forbid = self.forbid.clone();
        spec.require_regex = self.require_regex.clone();
        spec.forbid_regex = self.forbid_regex.clone();
        spec.timeout_ms = self.timeout_ms;
        spec.poll_interval_ms = self.poll_interval_ms;
        spec.screenshot_path = self.screenshot_path.clone();
        spec.transcript = !self.no_transcript;
        spec.transcript_cap = self.transcript_cap;
        spec.headless = !self.headed;
        spec.browser_args = self.browser_args.clone();
        spec.click = self.click.clone();
        spec.echo_console = self.echo_console;
        spec.strict = self.strict;
        Some(spec)
    }

    /// Build and validate the run plan. Command-line back-end options win
    /// over those in a suite file.
    pub async fn plan(&self) -> HarnessResult<RunPlan> {
        if self.max_parallel == Some(0) {
            return Err(HarnessError::config("max_parallel must be greater than zero"));
        }

        let (sessions, file_backend, file_sidecar, file_parallel) = match &self.config {
            Some(path) => {
                let suite = SuiteConfig::load(path)
                    .await
                    .map_err(|e| HarnessError::config(format!("{e:#}")))?;
                let backend = suite.backend;
                let sidecar = suite.sidecar_url.clone();
                let parallel = suite.max_parallel;
                (suite.into_sessions()?, backend, sidecar, parallel)
            }
            None => {
                let spec = self
                    .session_spec()
                    .ok_or_else(|| HarnessError::config("either --url or --config is required"))?;
                (vec![SessionConfig::from_spec(spec)?], None, None, None)
            }
        };

        Ok(RunPlan {
            backend: self.backend.or(file_backend).unwrap_or_default(),
            sidecar_url: self.sidecar_url.clone().or(file_sidecar),
            max_parallel: self
                .max_parallel
                .or(file_parallel)
                .unwrap_or(DEFAULT_MAX_PARALLEL),
            sessions,
        })
    }
}

/// Most severe outcome across all verdicts (PASS when there are none).
pub fn overall_outcome(verdicts: &[Verdict]) -> Outcome {
    verdicts
        .iter()
        .map(|v| v.outcome)
        .max()
        .unwrap_or(Outcome::Pass)
}

/// Plan, run, print. Returns the process exit code.
pub async fn execute(cli: Cli) -> ExitCode {
    run(&cli).await.exit_code()
}

/// Plan, run and print; the overall outcome decides the exit code. Setup
/// failures count as ERROR.
pub async fn run(cli: &Cli) -> Outcome {
    let plan = match cli.plan().await {
        Ok(plan) => plan,
        Err(e) => return report_setup_error(&e),
    };
    debug!(
        backend = ?plan.backend,
        sessions = plan.sessions.len(),
        max_parallel = plan.max_parallel,
        "run plan ready"
    );

    let driver = match browser::driver_for(plan.backend, plan.sidecar_url.as_deref()) {
        Ok(driver) => driver,
        Err(e) => return report_setup_error(&e),
    };
    let runner = SessionRunner::new(driver);
    let verdicts = run_suite(&runner, plan.sessions, plan.max_parallel).await;

    print_verdicts(&verdicts, cli.json);
    overall_outcome(&verdicts)
}

fn report_setup_error(e: &HarnessError) -> Outcome {
    tracing::error!(kind = ?e.kind(), error = %e, "cannot start");
    eprintln!("error: {e}");
    Outcome::Error
}

fn print_verdicts(verdicts: &[Verdict], json: bool) {
    if json {
        let rendered = if verdicts.len() == 1 {
            serde_json::to_string_pretty(&verdicts[0])
        } else {
            serde_json::to_string_pretty(verdicts)
        };
        match rendered {
            Ok(text) => println!("{text}"),
            Err(e) => eprintln!("error: could not serialise verdicts: {e}"),
        }
        return;
    }
    for v in verdicts {
        println!("{}", v.summary());
        if let Some(path) = &v.screenshot_path {
            println!("  screenshot: {}", path.display());
        }
        if let Some(path) = &v.transcript_path {
            println!("  console:    {}", path.display());
        }
    }
}
