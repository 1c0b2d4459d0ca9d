//! Browser seam: the only place the harness touches a real browser.
//!
//! Two back-ends are available:
//!
//! * **`playwright` feature** (default): drives a headless Chromium
//!   in-process via the [`playwright-rs`](https://github.com/padamson/playwright-rust)
//!   crate. Every run gets its own Playwright server and browser.
//!
//! * **Sidecar**: talks to an external Playwright/CDP sidecar over HTTP.
//!   Always compiled; selected with `--backend sidecar`.
//!
//! Console capture works the same on both: an init script wraps the page's
//! `console` methods and buffers messages in `window`, and the recorder reads
//! that buffer on every poll. Reads go through a [`ConsoleCursor`]: the page
//! only discards entries the cursor has already passed, so a read that is
//! cancelled half-way leaves everything in place for the next one.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;

use crate::config::BackendKind;
use crate::error::{HarnessError, HarnessResult};
use crate::recorder::RawConsoleMessage;

#[cfg(feature = "playwright")]
pub mod playwright;
pub mod sidecar;

/// Options passed to the browser at launch. `args` are never interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSettings {
    pub headless: bool,
    pub args: Vec<String>,
}

impl Default for LaunchSettings {
    fn default() -> Self {
        Self {
            headless: true,
            args: Vec::new(),
        }
    }
}

/// Result of a top-level navigation. `status` is `None` when the browser
/// reports no response (e.g. `file://` URLs).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Navigation {
    pub status: Option<u16>,
}

impl Navigation {
    pub fn is_success(&self) -> bool {
        self.status.map_or(true, |s| (200..300).contains(&s))
    }
}

/// Starts browser processes.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn launch(&self, settings: &LaunchSettings) -> anyhow::Result<Box<dyn BrowserHandle>>;
}

/// A running browser, exclusively owned by one run.
#[async_trait]
pub trait BrowserHandle: Send {
    async fn new_page(&mut self) -> anyhow::Result<Box<dyn PageHandle>>;

    /// Shut the browser down. Consumes the handle so it cannot run twice.
    async fn close(self: Box<Self>) -> anyhow::Result<()>;
}

/// The page under test.
#[async_trait]
pub trait PageHandle: Send + Sync {
    /// Register the console hook for this and every later document.
    async fn install_console_capture(&self) -> anyhow::Result<()>;
    async fn goto(&self, url: &str) -> anyhow::Result<Navigation>;
    async fn selector_present(&self, selector: &str) -> anyhow::Result<bool>;
    async fn click(&self, selector: &str) -> anyhow::Result<()>;
    /// Messages buffered at or after `cursor`. Entries before the cursor may
    /// be discarded page-side; nothing at or after it may be.
    async fn read_console(&self, cursor: &ConsoleCursor) -> anyhow::Result<ConsoleBatch>;
    /// PNG bytes of the current viewport.
    async fn screenshot(&self) -> anyhow::Result<Vec<u8>>;
}

/// How far the recorder has read into the page's console buffer.
///
/// `epoch` identifies the buffer; a new epoch means the page started a fresh
/// buffer (e.g. after a cross-origin navigation) and indices restart at 0.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsoleCursor {
    pub epoch: Option<String>,
    pub next: u64,
}

/// Buffered console messages; `entries[i]` has index `first + i`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ConsoleBatch {
    #[serde(default)]
    pub epoch: Option<String>,
    #[serde(default)]
    pub first: u64,
    #[serde(default)]
    pub entries: Vec<RawConsoleMessage>,
}

/// Build the driver for `kind`.
pub fn driver_for(
    kind: BackendKind,
    sidecar_url: Option<&str>,
) -> HarnessResult<Arc<dyn BrowserDriver>> {
    match kind {
        #[cfg(feature = "playwright")]
        BackendKind::Playwright => Ok(Arc::new(playwright::PlaywrightDriver::new())),
        #[cfg(not(feature = "playwright"))]
        BackendKind::Playwright => Err(HarnessError::config(
            "the playwright backend is not compiled in; rebuild with --features playwright or use --backend sidecar",
        )),
        BackendKind::Sidecar => {
            let url = sidecar_url.unwrap_or(sidecar::DEFAULT_SIDECAR_URL);
            let driver = sidecar::SidecarDriver::new(url)
                .map_err(|e| HarnessError::config(format!("{e:#}")))?;
            Ok(Arc::new(driver))
        }
    }
}

// ── Console hook ─────────────────────────────────────────────

/// Installed before any page script runs. Idempotent per document.
///
/// Every output-producing `console` method is wrapped, along with uncaught
/// errors, unhandled rejections and failed resource loads. Before the
/// document is unloaded the unread buffer is parked in `sessionStorage`, so a
/// reload or same-origin redirect carries it over to the next document.
pub const CONSOLE_CAPTURE_SCRIPT: &str = r#"(() => {
  if (window.__renderProbeHooked) return;
  window.__renderProbeHooked = true;
  const KEY = '__renderProbeConsole';
  let buf = null;
  try {
    buf = JSON.parse(sessionStorage.getItem(KEY) || 'null');
    sessionStorage.removeItem(KEY);
  } catch (_) {}
  if (!buf || !Array.isArray(buf.items) || typeof buf.base !== 'number') {
    const epoch = Date.now().toString(36) + Math.random().toString(36).slice(2);
    buf = { epoch, base: 0, items: [] };
  }
  window.__renderProbeConsole = buf;
  const show = (a) => {
    if (typeof a === 'string') return a;
    if (a instanceof Error) return a.stack || String(a);
    try { return JSON.stringify(a); } catch (_) { return String(a); }
  };
  const push = (level, args) => {
    try { buf.items.push({ level, text: Array.from(args).map(show).join(' ') }); } catch (_) {}
  };
  const silent = new Set(['clear', 'context', 'createTask', 'groupEnd', 'profile', 'profileEnd', 'timeStamp']);
  for (const name of Object.keys(console)) {
    const original = console[name];
    if (typeof original !== 'function' || silent.has(name)) continue;
    console[name] = function (...args) {
      if (name === 'assert') {
        if (!args[0]) push('error', ['Assertion failed:', ...args.slice(1)]);
      } else {
        push(name, args);
      }
      return original.apply(console, args);
    };
  }
  window.addEventListener('error', (ev) => {
    const t = ev.target;
    if (t && t !== window && (t.src || t.href)) {
      push('error', ['Failed to load resource: ' + (t.src || t.href)]);
    } else {
      push('error', [ev.message || String(ev)]);
    }
  }, true);
  window.addEventListener('unhandledrejection', (ev) => push('error', ['Unhandled rejection: ' + show(ev.reason)]));
  window.addEventListener('securitypolicyviolation', (ev) =>
    push('error', ['Refused to load ' + ev.blockedURI + ' (' + ev.violatedDirective + ')']));
  window.addEventListener('pagehide', () => {
    try { sessionStorage.setItem(KEY, JSON.stringify(buf)); } catch (_) {}
  });
  window.addEventListener('pageshow', (ev) => {
    if (ev.persisted) { try { sessionStorage.removeItem(KEY); } catch (_) {} }
  });
})();"#;

/// JS expression that discards entries before `cursor` and evaluates to a
/// JSON string of the remaining buffer (`{epoch, first, entries}`).
pub fn console_read_expr(cursor: &ConsoleCursor) -> String {
    let epoch = match &cursor.epoch {
        Some(e) => Value::String(e.clone()).to_string(),
        None => "null".to_string(),
    };
    format!(
        r#"(() => {{
  const b = window.__renderProbeConsole;
  if (!b) return JSON.stringify({{ entries: [] }});
  const next = {next};
  if (b.epoch === {epoch} && next > b.base) {{
    const seen = Math.min(next - b.base, b.items.length);
    b.items.splice(0, seen);
    b.base += seen;
  }}
  return JSON.stringify({{ epoch: b.epoch, first: b.base, entries: b.items }});
}})()"#,
        next = cursor.next,
    )
}

/// JS expression testing whether `selector` currently matches an element.
pub fn selector_probe_expr(selector: &str) -> String {
    let quoted = Value::String(selector.to_string()).to_string();
    format!("document.querySelector({quoted}) !== null")
}

/// Parse the result of [`console_read_expr`]. Backends may hand back the
/// JSON text, a JSON-quoted string of it, or the object itself.
pub fn parse_console_batch(value: Value) -> anyhow::Result<ConsoleBatch> {
    match value {
        Value::Null => Ok(ConsoleBatch::default()),
        Value::String(text) => parse_console_text(&text),
        object @ Value::Object(_) => {
            serde_json::from_value(object).map_err(|e| anyhow::anyhow!("bad console batch: {e}"))
        }
        other => anyhow::bail!("unexpected console batch: {other}"),
    }
}

pub fn parse_console_text(text: &str) -> anyhow::Result<ConsoleBatch> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "undefined" {
        return Ok(ConsoleBatch::default());
    }
    let value: Value = serde_json::from_str(trimmed)
        .map_err(|e| anyhow::anyhow!("console batch is not JSON: {e}"))?;
    match value {
        Value::String(inner) => parse_console_text(&inner),
        other => parse_console_batch(other),
    }
}
