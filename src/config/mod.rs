use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::browser::LaunchSettings;
use crate::error::{HarnessError, HarnessResult};
use crate::matcher::{MatchRule, RuleKind};

pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_SCREENSHOT_PATH: &str = "verification/screenshot.png";
pub const DEFAULT_MAX_PARALLEL: usize = 4;

/// Which browser back-end drives the runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Playwright,
    Sidecar,
}

impl Default for BackendKind {
    fn default() -> Self {
        if cfg!(feature = "playwright") {
            BackendKind::Playwright
        } else {
            BackendKind::Sidecar
        }
    }
}

/// One run as written by the caller (CLI flags or a suite file entry).
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SessionSpec {
    /// Display name; defaults to the URL.
    #[serde(default)]
    pub name: Option<String>,
    pub url: String,
    #[serde(default)]
    pub ready_selector: Option<String>,
    /// Substrings that must appear in console output.
    #[serde(default)]
    pub require: Vec<String>,
    /// Substrings that fail the run if they appear.
    #[serde(default)]
    pub forbid: Vec<String>,
    #[serde(default)]
    pub require_regex: Vec<String>,
    #[serde(default)]
    pub forbid_regex: Vec<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_screenshot_path")]
    pub screenshot_path: PathBuf,
    /// Write `<stem>.console.log` next to the screenshot.
    #[serde(default = "default_true")]
    pub transcript: bool,
    /// Keep at most this many console entries (oldest evicted).
    #[serde(default)]
    pub transcript_cap: Option<usize>,
    #[serde(default = "default_true")]
    pub headless: bool,
    /// Extra browser command-line flags, passed through untouched.
    #[serde(default)]
    pub browser_args: Vec<String>,
    /// Element to click once the page has loaded, before waiting.
    #[serde(default)]
    pub click: Option<String>,
    #[serde(default)]
    pub echo_console: bool,
    /// Also fail when required rules are unmatched after selector readiness.
    #[serde(default)]
    pub strict: bool,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

fn default_poll_interval_ms() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_screenshot_path() -> PathBuf {
    PathBuf::from(DEFAULT_SCREENSHOT_PATH)
}

fn default_true() -> bool {
    true
}

impl SessionSpec {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            name: None,
            url: url.into(),
            ready_selector: None,
            require: Vec::new(),
            forbid: Vec::new(),
            require_regex: Vec::new(),
            forbid_regex: Vec::new(),
            timeout_ms: DEFAULT_TIMEOUT_MS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            screenshot_path: default_screenshot_path(),
            transcript: true,
            transcript_cap: None,
            headless: true,
            browser_args: Vec::new(),
            click: None,
            echo_console: false,
            strict: false,
        }
    }
}

/// Validated, read-only configuration for a single run.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub name: String,
    pub target_url: String,
    pub ready_selector: Option<String>,
    pub rules: Vec<MatchRule>,
    pub max_wait: Duration,
    pub poll_interval: Duration,
    pub screenshot_path: PathBuf,
    pub write_transcript: bool,
    pub transcript_cap: Option<usize>,
    pub launch: LaunchSettings,
    pub click_selector: Option<String>,
    pub echo_console: bool,
    pub strict: bool,
}

impl SessionConfig {
    pub fn from_spec(spec: SessionSpec) -> HarnessResult<Self> {
        let url = reqwest::Url::parse(&spec.url)
            .map_err(|e| HarnessError::config(format!("url {:?}: {e}", spec.url)))?;
        if !matches!(url.scheme(), "http" | "https" | "file") {
            return Err(HarnessError::config(format!(
                "url {:?}: unsupported scheme {:?}",
                spec.url,
                url.scheme()
            )));
        }
        if spec.timeout_ms == 0 {
            return Err(HarnessError::config("timeout_ms must be greater than zero"));
        }
        if spec.poll_interval_ms == 0 {
            return Err(HarnessError::config(
                "poll_interval_ms must be greater than zero",
            ));
        }
        if spec.transcript_cap == Some(0) {
            return Err(HarnessError::config(
                "transcript_cap must be greater than zero",
            ));
        }
        let ready_selector = non_blank("ready_selector", spec.ready_selector)?;
        let click_selector = non_blank("click", spec.click)?;
        if spec.screenshot_path.file_name().is_none() {
            return Err(HarnessError::config(format!(
                "screenshot_path {} does not name a file",
                spec.screenshot_path.display()
            )));
        }

        let mut rules = Vec::new();
        for (kind, patterns) in [
            (RuleKind::Required, &spec.require),
            (RuleKind::Forbidden, &spec.forbid),
        ] {
            for p in patterns {
                if p.is_empty() {
                    return Err(HarnessError::config("console patterns must not be empty"));
                }
                rules.push(match kind {
                    RuleKind::Required => MatchRule::required(p.as_str()),
                    RuleKind::Forbidden => MatchRule::forbidden(p.as_str()),
                });
            }
        }
        for (kind, patterns) in [
            (RuleKind::Required, &spec.require_regex),
            (RuleKind::Forbidden, &spec.forbid_regex),
        ] {
            for p in patterns {
                if p.is_empty() {
                    return Err(HarnessError::config("console patterns must not be empty"));
                }
                let rule = MatchRule::regex(kind, p)
                    .map_err(|e| HarnessError::config(format!("regex {p:?}: {e}")))?;
                rules.push(rule.with_label(format!("/{p}/")));
            }
        }

        let has_required = rules.iter().any(|r| r.kind() == RuleKind::Required);
        if ready_selector.is_none() && !has_required {
            return Err(HarnessError::config(
                "nothing to wait for: set ready_selector or at least one required pattern",
            ));
        }

        Ok(Self {
            name: spec.name.unwrap_or_else(|| spec.url.clone()),
            target_url: spec.url,
            ready_selector,
            rules,
            max_wait: Duration::from_millis(spec.timeout_ms),
            poll_interval: Duration::from_millis(spec.poll_interval_ms),
            screenshot_path: spec.screenshot_path,
            write_transcript: spec.transcript,
            transcript_cap: spec.transcript_cap,
            launch: LaunchSettings {
                headless: spec.headless,
                args: spec.browser_args,
            },
            click_selector,
            echo_console: spec.echo_console,
            strict: spec.strict,
        })
    }

    /// Where the console transcript lands, when enabled.
    pub fn transcript_path(&self) -> Option<PathBuf> {
        self.write_transcript
            .then(|| crate::utils::sibling_path(&self.screenshot_path, "console.log"))
    }
}

fn non_blank(field: &str, value: Option<String>) -> HarnessResult<Option<String>> {
    match value {
        Some(v) if v.trim().is_empty() => {
            Err(HarnessError::config(format!("{field} must not be blank")))
        }
        other => Ok(other),
    }
}

/// A YAML file describing several runs.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct SuiteConfig {
    #[serde(default)]
    pub backend: Option<BackendKind>,
    #[serde(default)]
    pub sidecar_url: Option<String>,
    /// Upper bound on concurrently running sessions.
    #[serde(default)]
    pub max_parallel: Option<usize>,
    pub sessions: Vec<SessionSpec>,
}

impl SuiteConfig {
    /// Read and parse a YAML suite file.
    pub async fn load(path: &Path) -> anyhow::Result<SuiteConfig> {
        let contents = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("failed to read suite file: {}", path.display()))?;
        let suite: SuiteConfig =
            serde_yaml_ng::from_str(&contents).context("failed to parse suite YAML")?;
        tracing::debug!(sessions = suite.sessions.len(), "suite loaded");
        Ok(suite)
    }

    /// Validate every session and the constraints between them.
    pub fn into_sessions(self) -> HarnessResult<Vec<SessionConfig>> {
        if self.sessions.is_empty() {
            return Err(HarnessError::config("suite has no sessions"));
        }
        if self.max_parallel == Some(0) {
            return Err(HarnessError::config("max_parallel must be greater than zero"));
        }

        let mut names = HashSet::new();
        let mut shots = HashSet::new();
        let mut transcripts = HashSet::new();
        let mut out = Vec::with_capacity(self.sessions.len());
        for spec in self.sessions {
            let cfg = SessionConfig::from_spec(spec)?;
            if !names.insert(cfg.name.clone()) {
                return Err(HarnessError::config(format!(
                    "duplicate session name: {}",
                    cfg.name
                )));
            }
            if !shots.insert(cfg.screenshot_path.clone()) {
                return Err(HarnessError::config(format!(
                    "session '{}' reuses screenshot path {}",
                    cfg.name,
                    cfg.screenshot_path.display()
                )));
            }
            if let Some(path) = cfg.transcript_path() {
                if !transcripts.insert(path.clone()) {
                    return Err(HarnessError::config(format!(
                        "session '{}' reuses transcript path {}",
                        cfg.name,
                        path.display()
                    )));
                }
            }
            out.push(cfg);
        }
        Ok(out)
    }
}
