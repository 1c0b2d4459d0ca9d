//! HTTP client for a headless-browser sidecar process.
//!
//! The sidecar owns the real browser; each sidecar session holds exactly
//! one page. Endpoints (all JSON):
//!
//! | method | path                          | body / reply                         |
//! |--------|-------------------------------|--------------------------------------|
//! | GET    | `/health`                     | any 2xx                              |
//! | POST   | `/sessions`                   | `{headless, args}` → `{session_id}`  |
//! | POST   | `/sessions/{id}/init_script`  | `{script}`                           |
//! | POST   | `/sessions/{id}/goto`         | `{url}` → `{ok, status?}`            |
//! | POST   | `/sessions/{id}/eval`         | `{expression}` → `{result}`          |
//! | POST   | `/sessions/{id}/click`        | `{selector}`                         |
//! | GET    | `/sessions/{id}/screenshot`   | → `{data}` (base64 PNG)              |
//! | DELETE | `/sessions/{id}`              |                                      |

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use serde_json::Value;

use super::{
    console_read_expr, parse_console_batch, selector_probe_expr, BrowserDriver, BrowserHandle,
    ConsoleBatch, ConsoleCursor, LaunchSettings, Navigation, PageHandle, CONSOLE_CAPTURE_SCRIPT,
};
use crate::utils::truncate_str;

/// Default base URL for the browser sidecar.
pub const DEFAULT_SIDECAR_URL: &str = "http://127.0.0.1:9514";

#[derive(Debug, Clone)]
pub struct SidecarDriver {
    client: reqwest::Client,
    base_url: String,
}

impl SidecarDriver {
    pub fn new(base_url: &str) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()
            .context("building HTTP client for browser sidecar")?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl BrowserDriver for SidecarDriver {
    async fn launch(&self, settings: &LaunchSettings) -> anyhow::Result<Box<dyn BrowserHandle>> {
        // Health check: fail fast if sidecar is down.
        let health = format!("{}/health", self.base_url);
        self.client
            .get(&health)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .with_context(|| format!("browser sidecar not reachable at {}", self.base_url))?;

        let body = serde_json::json!({
            "headless": settings.headless,
            "args": settings.args,
        });
        let json: Value = self
            .client
            .post(format!("{}/sessions", self.base_url))
            .json(&body)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("creating browser session")?
            .json()
            .await
            .context("parsing session response")?;
        let session_id = json["session_id"]
            .as_str()
            .map(|s| s.to_string())
            .ok_or_else(|| anyhow::anyhow!("sidecar did not return session_id"))?;

        tracing::debug!(%session_id, "sidecar session created");
        Ok(Box::new(SidecarBrowser {
            client: self.client.clone(),
            session_url: format!("{}/sessions/{}", self.base_url, session_id),
            page_opened: false,
        }))
    }
}

struct SidecarBrowser {
    client: reqwest::Client,
    session_url: String,
    page_opened: bool,
}

#[async_trait]
impl BrowserHandle for SidecarBrowser {
    async fn new_page(&mut self) -> anyhow::Result<Box<dyn PageHandle>> {
        if self.page_opened {
            anyhow::bail!("sidecar sessions hold a single page");
        }
        self.page_opened = true;
        Ok(Box::new(SidecarPage {
            client: self.client.clone(),
            session_url: self.session_url.clone(),
        }))
    }

    async fn close(self: Box<Self>) -> anyhow::Result<()> {
        self.client
            .delete(&self.session_url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("closing browser session")?;
        Ok(())
    }
}

struct SidecarPage {
    client: reqwest::Client,
    session_url: String,
}

impl SidecarPage {
    async fn post(&self, action: &str, body: Value) -> anyhow::Result<Value> {
        let resp = self
            .client
            .post(format!("{}/{action}", self.session_url))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("browser {action}"))?;
        let status = resp.status();
        if !status.is_success() {
            let detail = resp.text().await.unwrap_or_default();
            anyhow::bail!(
                "browser {action} returned {status}: {}",
                truncate_str(&detail, 300)
            );
        }
        let text = resp.text().await.with_context(|| format!("reading {action} response"))?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).with_context(|| format!("parsing {action} response"))
    }

    async fn eval(&self, expression: &str) -> anyhow::Result<Value> {
        let json = self
            .post("eval", serde_json::json!({ "expression": expression }))
            .await?;
        Ok(json.get("result").cloned().unwrap_or(Value::Null))
    }
}

#[async_trait]
impl PageHandle for SidecarPage {
    async fn install_console_capture(&self) -> anyhow::Result<()> {
        self.post(
            "init_script",
            serde_json::json!({ "script": CONSOLE_CAPTURE_SCRIPT }),
        )
        .await?;
        Ok(())
    }

    async fn goto(&self, url: &str) -> anyhow::Result<Navigation> {
        let json = self.post("goto", serde_json::json!({ "url": url })).await?;
        if json.get("ok").and_then(Value::as_bool) == Some(false) {
            let reason = json
                .get("error")
                .and_then(Value::as_str)
                .unwrap_or("sidecar reported failure");
            anyhow::bail!("{reason}");
        }
        let status = json
            .get("status")
            .and_then(Value::as_u64)
            .and_then(|s| u16::try_from(s).ok());
        Ok(Navigation { status })
    }

    async fn selector_present(&self, selector: &str) -> anyhow::Result<bool> {
        let result = self.eval(&selector_probe_expr(selector)).await?;
        match result {
            Value::Bool(b) => Ok(b),
            Value::String(s) => Ok(s == "true"),
            other => anyhow::bail!("unexpected selector probe result: {other}"),
        }
    }

    async fn click(&self, selector: &str) -> anyhow::Result<()> {
        self.post("click", serde_json::json!({ "selector": selector }))
            .await?;
        Ok(())
    }

    async fn read_console(&self, cursor: &ConsoleCursor) -> anyhow::Result<ConsoleBatch> {
        let result = self.eval(&console_read_expr(cursor)).await?;
        parse_console_batch(result)
    }

    async fn screenshot(&self) -> anyhow::Result<Vec<u8>> {
        let json: Value = self
            .client
            .get(format!("{}/screenshot", self.session_url))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .context("browser screenshot")?
            .json()
            .await
            .context("parsing screenshot response")?;
        let data = json["data"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("sidecar did not return screenshot data"))?;
        base64::engine::general_purpose::STANDARD
            .decode(data)
            .context("decoding screenshot")
    }
}
