//! Playwright-backed browser driver.
//!
//! Each launch starts its own Playwright server process and Chromium
//! instance, so concurrent runs never share browser state.

use anyhow::Context;
use async_trait::async_trait;
use tokio::sync::Mutex;

use playwright_rs::api::LaunchOptions;
use playwright_rs::protocol::{Browser, Page, Playwright};

use super::{
    console_read_expr, parse_console_text, BrowserDriver, BrowserHandle, ConsoleBatch,
    ConsoleCursor, LaunchSettings, Navigation, PageHandle, CONSOLE_CAPTURE_SCRIPT,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct PlaywrightDriver;

impl PlaywrightDriver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BrowserDriver for PlaywrightDriver {
    async fn launch(&self, settings: &LaunchSettings) -> anyhow::Result<Box<dyn BrowserHandle>> {
        let playwright = Playwright::launch()
            .await
            .map_err(|e| anyhow::anyhow!("failed to launch Playwright server: {e}"))?;

        let mut launch_opts = LaunchOptions::new().headless(settings.headless);
        if !settings.args.is_empty() {
            launch_opts = launch_opts.args(settings.args.clone());
        }
        let browser = playwright
            .chromium()
            .launch_with_options(launch_opts)
            .await
            .map_err(|e| anyhow::anyhow!("failed to launch Chromium: {e}"))?;

        tracing::debug!(
            headless = settings.headless,
            args = settings.args.len(),
            "chromium launched"
        );
        Ok(Box::new(PlaywrightBrowser {
            _playwright: playwright,
            browser,
        }))
    }
}

struct PlaywrightBrowser {
    _playwright: Playwright,
    browser: Browser,
}

#[async_trait]
impl BrowserHandle for PlaywrightBrowser {
    async fn new_page(&mut self) -> anyhow::Result<Box<dyn PageHandle>> {
        let page = self
            .browser
            .new_page()
            .await
            .map_err(|e| anyhow::anyhow!("failed to create page: {e}"))?;
        Ok(Box::new(PlaywrightPage {
            page: Mutex::new(page),
        }))
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.browser
            .close()
            .await
            .map_err(|e| anyhow::anyhow!("browser close failed: {e}"))
    }
}

struct PlaywrightPage {
    page: Mutex<Page>,
}

impl PlaywrightPage {
    async fn page(&self) -> Page {
        self.page.lock().await.clone()
    }
}

#[async_trait]
impl PageHandle for PlaywrightPage {
    async fn install_console_capture(&self) -> anyhow::Result<()> {
        self.page()
            .await
            .add_init_script(CONSOLE_CAPTURE_SCRIPT)
            .await
            .map_err(|e| anyhow::anyhow!("add_init_script failed: {e}"))
    }

    async fn goto(&self, url: &str) -> anyhow::Result<Navigation> {
        let response = self
            .page()
            .await
            .goto(url, None)
            .await
            .map_err(|e| anyhow::anyhow!("goto failed: {e}"))?;
        Ok(Navigation {
            status: response.map(|r| r.status()),
        })
    }

    async fn selector_present(&self, selector: &str) -> anyhow::Result<bool> {
        let count = self
            .page()
            .await
            .locator(selector)
            .await
            .count()
            .await
            .map_err(|e| anyhow::anyhow!("locator count failed: {e}"))?;
        Ok(count > 0)
    }

    async fn click(&self, selector: &str) -> anyhow::Result<()> {
        self.page()
            .await
            .locator(selector)
            .await
            .click(None)
            .await
            .map_err(|e| anyhow::anyhow!("click on {selector} failed: {e}"))
    }

    async fn read_console(&self, cursor: &ConsoleCursor) -> anyhow::Result<ConsoleBatch> {
        // `evaluate_value` returns a `String` representation of the result.
        let raw = self
            .page()
            .await
            .evaluate_value(&console_read_expr(cursor))
            .await
            .map_err(|e| anyhow::anyhow!("eval failed: {e}"))?;
        parse_console_text(&raw).context("reading console buffer")
    }

    async fn screenshot(&self) -> anyhow::Result<Vec<u8>> {
        self.page()
            .await
            .screenshot(None)
            .await
            .map_err(|e| anyhow::anyhow!("screenshot failed: {e}"))
    }
}
