use anyhow::Result;
use async_trait::async_trait;
use chromiumoxide::browser::Browser as OxideBrowser;
use chromiumoxide::cdp::browser_protocol::input::InsertTextParams;
use chromiumoxide::handler::Handler;
use chromiumoxide::page::Page;
use futures::StreamExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

use crate::agent::AgentError;

/// How an action addresses an element on the page.
#[derive(Clone, Debug, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "by", rename_all = "snake_case")]
pub enum Locator {
    Css { selector: String },
    Index { index: usize },
    Text { pattern: String },
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PageSnapshot {
    pub url: Option<String>,
    pub title: Option<String>,
    pub text: String,
    pub dom: Option<String>,
}

/// The browser as the loop sees it. Driver faults surface as `AgentError`
/// values and are converted to failure results at the dispatch boundary;
/// they never cross into the agent loop as raised faults.
#[async_trait]
pub trait BrowserDriver: Send + Sync {
    async fn navigate(&self, url: &str) -> Result<(), AgentError>;
    async fn locate(&self, target: &Locator) -> Result<bool, AgentError>;
    async fn click(&self, target: &Locator) -> Result<(), AgentError>;
    async fn type_text(&self, target: &Locator, text: &str) -> Result<(), AgentError>;
    async fn upload(&self, target: &Locator, path: &str) -> Result<(), AgentError>;
    async fn extract(&self) -> Result<PageSnapshot, AgentError>;
}

// ========================= Shared Session =========================

/// Capability wrapper for a browser session shared between concurrently
/// running agents. Every call holds the mutex for its full duration, so
/// one loop's click can never interleave with another's navigation.
pub struct SharedDriver<D> {
    inner: Arc<Mutex<D>>,
}

impl<D> SharedDriver<D> {
    pub fn new(driver: D) -> Self {
        Self { inner: Arc::new(Mutex::new(driver)) }
    }
}

impl<D> Clone for SharedDriver<D> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

#[async_trait]
impl<D: BrowserDriver> BrowserDriver for SharedDriver<D> {
    async fn navigate(&self, url: &str) -> Result<(), AgentError> {
        self.inner.lock().await.navigate(url).await
    }

    async fn locate(&self, target: &Locator) -> Result<bool, AgentError> {
        self.inner.lock().await.locate(target).await
    }

    async fn click(&self, target: &Locator) -> Result<(), AgentError> {
        self.inner.lock().await.click(target).await
    }

    async fn type_text(&self, target: &Locator, text: &str) -> Result<(), AgentError> {
        self.inner.lock().await.type_text(target, text).await
    }

    async fn upload(&self, target: &Locator, path: &str) -> Result<(), AgentError> {
        self.inner.lock().await.upload(target, path).await
    }

    async fn extract(&self) -> Result<PageSnapshot, AgentError> {
        self.inner.lock().await.extract().await
    }
}

// ========================= Null Driver =========================

/// Inert driver for tests and offline dry runs.
#[derive(Clone, Copy, Default)]
pub struct NullDriver;

#[async_trait]
impl BrowserDriver for NullDriver {
    async fn navigate(&self, _url: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn locate(&self, _target: &Locator) -> Result<bool, AgentError> {
        Ok(true)
    }

    async fn click(&self, _target: &Locator) -> Result<(), AgentError> {
        Ok(())
    }

    async fn type_text(&self, _target: &Locator, _text: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn upload(&self, _target: &Locator, _path: &str) -> Result<(), AgentError> {
        Ok(())
    }

    async fn extract(&self) -> Result<PageSnapshot, AgentError> {
        Ok(PageSnapshot {
            url: Some("about:blank".to_string()),
            title: Some("null".to_string()),
            text: String::new(),
            dom: Some("<html></html>".to_string()),
        })
    }
}

// ========================= Chromium Adapter =========================

#[derive(Clone)]
pub struct CdpConfig {
    pub headless: bool,
    pub user_agent: Option<String>,
}

impl Default for CdpConfig {
    fn default() -> Self {
        Self { headless: true, user_agent: None }
    }
}

const INTERACTIVE_SELECTOR: &str =
    "a, button, input, select, textarea, [role=\"button\"], [onclick]";

pub struct CdpDriver {
    page: Page,
    _browser: OxideBrowser,
}

impl CdpDriver {
    pub async fn launch(cfg: CdpConfig) -> Result<Self> {
        let mut builder = chromiumoxide::browser::BrowserConfig::builder();
        if !cfg.headless {
            builder = builder.with_head();
        }
        let bcfg = builder.build().map_err(|e| anyhow::anyhow!(e))?;
        let (browser, handler) = OxideBrowser::launch(bcfg).await?;
        Self::attach(browser, handler, cfg.user_agent).await
    }

    pub async fn connect(ws_url: &str) -> Result<Self> {
        let (browser, handler) = OxideBrowser::connect(ws_url).await?;
        Self::attach(browser, handler, None).await
    }

    // The CDP event stream must keep draining or every command stalls.
    async fn attach(
        browser: OxideBrowser,
        handler: Handler,
        user_agent: Option<String>,
    ) -> Result<Self> {
        tokio::spawn(handler.for_each(|_event| async {}));
        let page = browser.new_page("about:blank").await?;
        if let Some(ua) = user_agent {
            page.set_user_agent(ua).await?;
        }
        Ok(Self { page, _browser: browser })
    }

    async fn goto(&self, url: &str) -> Result<()> {
        self.page.goto(url).await?;
        self.page.wait_for_navigation().await?;
        sleep(Duration::from_millis(400)).await;
        Ok(())
    }

    async fn js_string(&self, js: String) -> Result<String> {
        let value: String = self.page.evaluate(js).await?.into_value()?;
        Ok(value)
    }

    /// Runs a snippet that answers 'ok' or 'miss' for the given target.
    async fn js_on_target(&self, target: &Locator, verb: &str) -> Result<bool> {
        let js = match target {
            Locator::Css { selector } => format!(
                "(function() {{ const el = document.querySelector({sel}); \
                 if (!el) return 'miss'; el.{verb}; return 'ok'; }})()",
                sel = js_quote(selector),
                verb = verb,
            ),
            Locator::Index { index } => format!(
                "(function() {{ const els = Array.from(document.querySelectorAll({sel})); \
                 if ({idx} >= els.length) return 'miss'; els[{idx}].{verb}; return 'ok'; }})()",
                sel = js_quote(INTERACTIVE_SELECTOR),
                idx = index,
                verb = verb,
            ),
            Locator::Text { pattern } => format!(
                "(function() {{ const els = Array.from(document.querySelectorAll('*')); \
                 const el = els.find(e => e.childElementCount === 0 && \
                 (e.innerText || '').includes({pat})); \
                 if (!el) return 'miss'; el.{verb}; return 'ok'; }})()",
                pat = js_quote(pattern),
                verb = verb,
            ),
        };
        Ok(self.js_string(js).await? == "ok")
    }

    async fn insert_text(&self, text: &str) -> Result<()> {
        self.page.execute(InsertTextParams { text: text.to_string() }).await?;
        Ok(())
    }
}

fn js_quote(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| "\"\"".to_string())
}

fn browser_err(e: impl std::fmt::Display) -> AgentError {
    AgentError::Browser(e.to_string())
}

#[async_trait]
impl BrowserDriver for CdpDriver {
    async fn navigate(&self, url: &str) -> Result<(), AgentError> {
        self.goto(url).await.map_err(browser_err)
    }

    async fn locate(&self, target: &Locator) -> Result<bool, AgentError> {
        match target {
            Locator::Css { selector } => Ok(self.page.find_element(selector.as_str()).await.is_ok()),
            _ => self.js_on_target(target, "tagName").await.map_err(browser_err),
        }
    }

    async fn click(&self, target: &Locator) -> Result<(), AgentError> {
        match target {
            Locator::Css { selector } => {
                self.page
                    .find_element(selector.as_str())
                    .await
                    .map_err(browser_err)?
                    .click()
                    .await
                    .map_err(browser_err)?;
                Ok(())
            }
            _ => {
                let hit = self.js_on_target(target, "click()").await.map_err(browser_err)?;
                if hit {
                    Ok(())
                } else {
                    Err(AgentError::Browser(format!("no element matched {:?}", target)))
                }
            }
        }
    }

    async fn type_text(&self, target: &Locator, text: &str) -> Result<(), AgentError> {
        let focused = self.js_on_target(target, "focus()").await.map_err(browser_err)?;
        if !focused {
            return Err(AgentError::Browser(format!("no element matched {:?}", target)));
        }
        self.insert_text(text).await.map_err(browser_err)
    }

    async fn upload(&self, _target: &Locator, _path: &str) -> Result<(), AgentError> {
        // The plain CDP transport has no file-chooser hook wired up here;
        // the failure surfaces to the planner like any other driver fault.
        Err(AgentError::Browser("file upload is not supported by the cdp driver".to_string()))
    }

    async fn extract(&self) -> Result<PageSnapshot, AgentError> {
        let url = self.page.url().await.map_err(browser_err)?;
        let title = self
            .js_string("document.title".to_string())
            .await
            .map_err(browser_err)?;
        let text = self
            .js_string("document.body ? document.body.innerText : ''".to_string())
            .await
            .map_err(browser_err)?;
        let dom = self.page.content().await.map_err(browser_err)?;
        Ok(PageSnapshot {
            url,
            title: if title.is_empty() { None } else { Some(title) },
            text,
            dom: Some(dom),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locators_round_trip_through_serde() {
        let css: Locator =
            serde_json::from_str(r#"{"by":"css","selector":"input[type=file]"}"#).unwrap();
        assert!(matches!(css, Locator::Css { ref selector } if selector == "input[type=file]"));

        let idx: Locator = serde_json::from_str(r#"{"by":"index","index":4}"#).unwrap();
        assert!(matches!(idx, Locator::Index { index: 4 }));
    }

    #[test]
    fn js_quote_escapes_embedded_quotes() {
        assert_eq!(js_quote("a\"b"), "\"a\\\"b\"");
    }

    #[tokio::test]
    async fn shared_driver_serializes_calls() {
        let shared = SharedDriver::new(NullDriver);
        let a = shared.clone();
        let b = shared.clone();
        let (ra, rb) = tokio::join!(a.navigate("https://one.test"), b.navigate("https://two.test"));
        assert!(ra.is_ok() && rb.is_ok());
    }
}
