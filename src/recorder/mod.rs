//! Console recorder: turns page console output into an ordered transcript
//! and feeds every line through the [`SignalMatcher`].
//!
//! The recorder must be attached to a page before navigation starts;
//! otherwise messages emitted while the page loads are lost.
//!
//! [`ConsoleRecorder::drain`] is cancel-safe: the cursor only moves after a
//! read has returned, and the page keeps everything the cursor has not
//! passed. A drain cut off by a timeout loses nothing.

use std::collections::VecDeque;
use std::fmt;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::browser::{ConsoleCursor, PageHandle};
use crate::matcher::SignalMatcher;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConsoleLevel {
    Log,
    Info,
    Warn,
    Error,
    Debug,
    Other,
}

impl ConsoleLevel {
    /// Map a browser-reported level name (`console.warn` → `"warn"`).
    pub fn parse(name: &str) -> Self {
        match name.to_ascii_lowercase().as_str() {
            "log" => ConsoleLevel::Log,
            "info" => ConsoleLevel::Info,
            "warn" | "warning" => ConsoleLevel::Warn,
            "error" => ConsoleLevel::Error,
            "debug" | "trace" => ConsoleLevel::Debug,
            _ => ConsoleLevel::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConsoleLevel::Log => "log",
            ConsoleLevel::Info => "info",
            ConsoleLevel::Warn => "warn",
            ConsoleLevel::Error => "error",
            ConsoleLevel::Debug => "debug",
            ConsoleLevel::Other => "other",
        }
    }
}

impl fmt::Display for ConsoleLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A console message as a backend hands it over, before it is sequenced.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RawConsoleMessage {
    #[serde(deserialize_with = "de_level")]
    pub level: ConsoleLevel,
    pub text: String,
}

fn de_level<'de, D>(d: D) -> Result<ConsoleLevel, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let name = String::deserialize(d)?;
    Ok(ConsoleLevel::parse(&name))
}

impl RawConsoleMessage {
    pub fn new(level: ConsoleLevel, text: impl Into<String>) -> Self {
        Self {
            level,
            text: text.into(),
        }
    }
}

/// One recorded console line. `timestamp` is measured from recorder creation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsoleEntry {
    pub sequence: u64,
    pub timestamp: Duration,
    pub text: String,
    pub level: ConsoleLevel,
}

/// Ordered console transcript, optionally capped (oldest entries evicted).
#[derive(Debug, Default)]
pub struct Transcript {
    entries: VecDeque<ConsoleEntry>,
    cap: Option<usize>,
    truncated: bool,
    total: u64,
}

impl Transcript {
    pub fn new(cap: Option<usize>) -> Self {
        Self {
            entries: VecDeque::new(),
            cap,
            truncated: false,
            total: 0,
        }
    }

    fn push(&mut self, entry: ConsoleEntry) {
        if let Some(cap) = self.cap {
            while self.entries.len() >= cap {
                self.entries.pop_front();
                self.truncated = true;
            }
        }
        self.entries.push_back(entry);
        self.total += 1;
    }

    pub fn entries(&self) -> impl Iterator<Item = &ConsoleEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `true` once any entry has been evicted by the cap.
    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    /// Number of entries ever recorded, evicted ones included.
    pub fn total_recorded(&self) -> u64 {
        self.total
    }

    /// Render as newline-delimited `sequence, timestamp_ms, text` lines.
    pub fn render(&self) -> String {
        let mut out = String::new();
        if self.truncated {
            out.push_str("# truncated\n");
        }
        for e in &self.entries {
            let text = e.text.replace('\r', "\\r").replace('\n', "\\n");
            out.push_str(&format!(
                "{}, {}, {}\n",
                e.sequence,
                e.timestamp.as_millis(),
                text
            ));
        }
        out
    }

    pub async fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(path, self.render())
            .await
            .with_context(|| format!("writing transcript {}", path.display()))
    }
}

pub struct ConsoleRecorder {
    matcher: SignalMatcher,
    transcript: Transcript,
    started: Instant,
    next_sequence: u64,
    cursor: ConsoleCursor,
    attached: bool,
    echo: bool,
}

impl ConsoleRecorder {
    pub fn new(matcher: SignalMatcher, cap: Option<usize>) -> Self {
        Self {
            matcher,
            transcript: Transcript::new(cap),
            started: Instant::now(),
            next_sequence: 1,
            cursor: ConsoleCursor::default(),
            attached: false,
            echo: false,
        }
    }

    /// Log every console line at `info` instead of `debug`.
    pub fn echo(mut self, echo: bool) -> Self {
        self.echo = echo;
        self
    }

    /// Install console capture on `page`. Call before navigating.
    pub async fn attach(&mut self, page: &dyn PageHandle) -> anyhow::Result<()> {
        page.install_console_capture()
            .await
            .context("installing console capture")?;
        self.attached = true;
        debug!("console recorder attached");
        Ok(())
    }

    pub fn is_attached(&self) -> bool {
        self.attached
    }

    /// Append one message to the transcript and run it through the matcher.
    /// Returns the entry's sequence number.
    pub fn record(&mut self, level: ConsoleLevel, text: impl Into<String>) -> u64 {
        let text = text.into();
        let sequence = self.next_sequence;
        self.next_sequence += 1;

        if self.echo {
            info!(target: "console", %level, sequence, "{text}");
        } else {
            debug!(target: "console", %level, sequence, "{text}");
        }

        self.matcher.evaluate(sequence, &text);
        self.transcript.push(ConsoleEntry {
            sequence,
            timestamp: self.started.elapsed(),
            text,
            level,
        });
        sequence
    }

    /// Pull pending messages from `page` in arrival order. Returns how many
    /// new entries were recorded.
    pub async fn drain(&mut self, page: &dyn PageHandle) -> anyhow::Result<usize> {
        let batch = page.read_console(&self.cursor).await?;

        if batch.epoch != self.cursor.epoch {
            if self.cursor.epoch.is_some() {
                debug!(
                    unread_from = self.cursor.next,
                    "page started a new console buffer"
                );
            }
            self.cursor = ConsoleCursor {
                epoch: batch.epoch,
                next: 0,
            };
        }
        if batch.first > self.cursor.next {
            warn!(
                missing = batch.first - self.cursor.next,
                "console entries discarded before they were read"
            );
        }

        let mut count = 0;
        for (index, msg) in (batch.first..).zip(batch.entries) {
            if index < self.cursor.next {
                continue;
            }
            self.record(msg.level, msg.text);
            self.cursor.next = index + 1;
            count += 1;
        }
        Ok(count)
    }

    /// Position the next read starts from.
    pub fn cursor(&self) -> &ConsoleCursor {
        &self.cursor
    }

    pub fn matcher(&self) -> &SignalMatcher {
        &self.matcher
    }

    pub fn transcript(&self) -> &Transcript {
        &self.transcript
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::{ConsoleBatch, Navigation};
    use crate::matcher::MatchRule;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// Page-side buffer that honours the cursor contract, with an optional
    /// delay on every read.
    #[derive(Default)]
    struct BufferedPage {
        epoch: Mutex<Option<String>>,
        base: Mutex<u64>,
        items: Mutex<Vec<RawConsoleMessage>>,
        read_delay: Option<Duration>,
    }

    impl BufferedPage {
        fn log(&self, text: &str) {
            self.items
                .lock()
                .unwrap()
                .push(RawConsoleMessage::new(ConsoleLevel::Log, text));
        }

        fn new_document(&self, epoch: &str) {
            *self.epoch.lock().unwrap() = Some(epoch.to_string());
            *self.base.lock().unwrap() = 0;
            self.items.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl PageHandle for BufferedPage {
        async fn install_console_capture(&self) -> anyhow::Result<()> {
            Ok(())
        }
        async fn goto(&self, _url: &str) -> anyhow::Result<Navigation> {
            Ok(Navigation::default())
        }
        async fn selector_present(&self, _selector: &str) -> anyhow::Result<bool> {
            Ok(false)
        }
        async fn click(&self, _selector: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn read_console(&self, cursor: &ConsoleCursor) -> anyhow::Result<ConsoleBatch> {
            let epoch = self.epoch.lock().unwrap().clone();
            {
                let mut base = self.base.lock().unwrap();
                let mut items = self.items.lock().unwrap();
                if cursor.epoch == epoch && cursor.next > *base {
                    let seen = ((cursor.next - *base) as usize).min(items.len());
                    items.drain(..seen);
                    *base += seen as u64;
                }
            }
            if let Some(delay) = self.read_delay {
                tokio::time::sleep(delay).await;
            }
            Ok(ConsoleBatch {
                epoch,
                first: *self.base.lock().unwrap(),
                entries: self.items.lock().unwrap().clone(),
            })
        }
        async fn screenshot(&self) -> anyhow::Result<Vec<u8>> {
            Ok(Vec::new())
        }
    }

    fn recorder(cap: Option<usize>) -> ConsoleRecorder {
        ConsoleRecorder::new(SignalMatcher::new(vec![MatchRule::required("ready")]), cap)
    }

    #[test]
    fn sequences_increase_in_arrival_order() {
        let mut r = recorder(None);
        assert_eq!(r.record(ConsoleLevel::Log, "one"), 1);
        assert_eq!(r.record(ConsoleLevel::Warn, "two"), 2);
        assert_eq!(r.record(ConsoleLevel::Error, "three"), 3);

        let texts: Vec<_> = r.transcript().entries().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["one", "two", "three"]);
        assert!(!r.transcript().is_truncated());
    }

    #[test]
    fn recorded_text_reaches_matcher() {
        let mut r = recorder(None);
        r.record(ConsoleLevel::Info, "scene ready");
        assert!(r.matcher().is_ready());
    }

    #[test]
    fn cap_evicts_oldest_and_flags_truncation() {
        let mut r = recorder(Some(2));
        r.record(ConsoleLevel::Log, "ready");
        r.record(ConsoleLevel::Log, "b");
        r.record(ConsoleLevel::Log, "c");

        let t = r.transcript();
        assert_eq!(t.len(), 2);
        assert!(t.is_truncated());
        assert_eq!(t.total_recorded(), 3);
        let seqs: Vec<_> = t.entries().map(|e| e.sequence).collect();
        assert_eq!(seqs, [2, 3]);
        // matches from evicted entries are kept
        assert!(r.matcher().is_ready());
    }

    #[test]
    fn render_escapes_newlines() {
        let mut r = recorder(Some(1));
        r.record(ConsoleLevel::Log, "dropped");
        r.record(ConsoleLevel::Error, "line one\nline two");

        let rendered = r.transcript().render();
        let mut lines = rendered.lines();
        assert_eq!(lines.next(), Some("# truncated"));
        let last = lines.next().unwrap();
        assert!(last.starts_with("2, "));
        assert!(last.ends_with(", line one\\nline two"));
        assert_eq!(lines.next(), None);
    }

    #[tokio::test]
    async fn drain_records_each_entry_once() {
        let page = BufferedPage::default();
        let mut r = recorder(None);
        page.log("one");
        page.log("two");
        assert_eq!(r.drain(&page).await.unwrap(), 2);
        assert_eq!(r.drain(&page).await.unwrap(), 0);
        page.log("three");
        assert_eq!(r.drain(&page).await.unwrap(), 1);

        let texts: Vec<_> = r.transcript().entries().map(|e| e.text.as_str()).collect();
        assert_eq!(texts, ["one", "two", "three"]);
        assert_eq!(r.cursor().next, 3);
        // acknowledged entries are released page-side on the following read
        r.drain(&page).await.unwrap();
        assert!(page.items.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_drain_loses_nothing() {
        let page = BufferedPage {
            read_delay: Some(Duration::from_millis(150)),
            ..Default::default()
        };
        let mut r = recorder(None);
        page.log("WebGPU not supported");

        let cut = tokio::time::timeout(Duration::from_millis(100), r.drain(&page)).await;
        assert!(cut.is_err());
        assert_eq!(r.transcript().len(), 0);

        assert_eq!(r.drain(&page).await.unwrap(), 1);
        assert_eq!(
            r.transcript().entries().next().map(|e| e.text.as_str()),
            Some("WebGPU not supported")
        );
    }

    #[tokio::test]
    async fn new_buffer_epoch_restarts_the_cursor() {
        let page = BufferedPage::default();
        page.new_document("first");
        let mut r = recorder(None);
        page.log("a");
        page.log("b");
        r.drain(&page).await.unwrap();

        page.new_document("second");
        page.log("ready");
        assert_eq!(r.drain(&page).await.unwrap(), 1);
        assert_eq!(r.cursor().epoch.as_deref(), Some("second"));
        assert_eq!(r.transcript().total_recorded(), 3);
        assert!(r.matcher().is_ready());
    }

    #[test]
    fn level_names_map_leniently() {
        assert_eq!(ConsoleLevel::parse("warning"), ConsoleLevel::Warn);
        assert_eq!(ConsoleLevel::parse("ERROR"), ConsoleLevel::Error);
        assert_eq!(ConsoleLevel::parse("table"), ConsoleLevel::Other);
    }

    #[tokio::test]
    async fn transcript_written_to_nested_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/run.console.log");
        let mut r = recorder(None);
        r.record(ConsoleLevel::Log, "hello");
        r.transcript().write_to(&path).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("1, "));
        assert!(contents.trim_end().ends_with(", hello"));
    }
}
