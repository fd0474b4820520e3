//! Chromium-backed `PageDriver` using chromiumoxide.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::cdp::browser_protocol::network::CookieParam;
use chromiumoxide::page::Page;
use futures::StreamExt;

use crate::page::{DriverFactory, LoadState, PageDriver, StoredCookie};

/// Pause after `readyState == complete` standing in for network idle.
const NETWORK_SETTLE: Duration = Duration::from_millis(750);
const READY_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Default)]
pub struct BrowserSettings {
    pub headless: bool,
    pub chrome_path: Option<PathBuf>,
}

/// One Chromium process; every crawl gets its own tab.
pub struct ChromiumBrowser {
    browser: Browser,
}

impl ChromiumBrowser {
    pub async fn launch(settings: &BrowserSettings) -> Result<Self> {
        let mut builder = BrowserConfig::builder()
            .arg("--disable-gpu")
            .arg("--no-sandbox")
            .arg("--disable-dev-shm-usage")
            .arg("--disable-extensions");
        if !settings.headless {
            builder = builder.with_head();
        }
        if let Some(path) = &settings.chrome_path {
            builder = builder.chrome_executable(path);
        }
        let config = builder
            .build()
            .map_err(|e| anyhow::anyhow!("failed to build browser config: {e}"))?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .context("failed to launch Chromium")?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if let Err(e) = event {
                    log::debug!("browser handler event error: {e}");
                }
            }
        });

        Ok(Self { browser })
    }
}

#[async_trait]
impl DriverFactory for ChromiumBrowser {
    async fn open(&self) -> Result<Box<dyn PageDriver>> {
        let page = self
            .browser
            .new_page("about:blank")
            .await
            .context("failed to create new page")?;
        Ok(Box::new(ChromiumPage { page }))
    }
}

pub struct ChromiumPage {
    page: Page,
}

impl ChromiumPage {
    async fn eval<T: serde::de::DeserializeOwned>(&self, script: &str) -> Result<T> {
        let result = self
            .page
            .evaluate(script)
            .await
            .context("JS execution failed")?;
        result
            .into_value()
            .map_err(|e| anyhow::anyhow!("failed to convert JS result: {e:?}"))
    }
}

fn visibility_script(selector: &str) -> Result<String> {
    let selector = serde_json::to_string(selector)?;
    Ok(format!(
        "(() => {{
            const el = document.querySelector({selector});
            if (!el) return false;
            const style = window.getComputedStyle(el);
            const rect = el.getBoundingClientRect();
            return style.display !== 'none' && style.visibility !== 'hidden'
                && rect.width > 0 && rect.height > 0;
        }})()"
    ))
}

#[async_trait]
impl PageDriver for ChromiumPage {
    async fn goto(&mut self, url: &str) -> Result<()> {
        self.page
            .goto(url)
            .await
            .with_context(|| format!("navigation to {url} failed"))?;
        Ok(())
    }

    async fn wait_for_load(&mut self, state: LoadState) -> Result<()> {
        loop {
            let ready: String = self.eval("document.readyState").await?;
            if ready == "complete" {
                break;
            }
            tokio::time::sleep(READY_POLL).await;
        }
        if state == LoadState::NetworkIdle {
            tokio::time::sleep(NETWORK_SETTLE).await;
        }
        Ok(())
    }

    async fn is_visible(&mut self, selector: &str) -> Result<bool> {
        self.eval(&visibility_script(selector)?).await
    }

    async fn fill(&mut self, selector: &str, text: &str) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .with_context(|| format!("no element for {selector}"))?
            .click()
            .await?
            .type_str(text)
            .await?;
        Ok(())
    }

    async fn click(&mut self, selector: &str) -> Result<()> {
        self.page
            .find_element(selector)
            .await
            .with_context(|| format!("no element for {selector}"))?
            .click()
            .await?;
        Ok(())
    }

    async fn press_key(&mut self, key: &str) -> Result<()> {
        self.page
            .find_element("body")
            .await
            .context("page has no body")?
            .press_key(key)
            .await?;
        Ok(())
    }

    async fn content(&mut self) -> Result<String> {
        self.eval("document.documentElement.outerHTML").await
    }

    async fn cookies(&mut self) -> Result<Vec<StoredCookie>> {
        let cookies = self
            .page
            .get_cookies()
            .await
            .context("failed to read cookies")?;
        Ok(cookies
            .into_iter()
            .map(|c| StoredCookie {
                name: c.name,
                value: c.value,
                domain: c.domain,
                path: c.path,
            })
            .collect())
    }

    async fn set_cookies(&mut self, cookies: Vec<StoredCookie>) -> Result<()> {
        let params = cookies
            .into_iter()
            .map(|c| {
                let mut param = CookieParam::new(c.name, c.value);
                param.domain = Some(c.domain);
                param.path = Some(c.path);
                param
            })
            .collect();
        self.page
            .set_cookies(params)
            .await
            .context("failed to set cookies")?;
        Ok(())
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.page.close().await.context("failed to close page")?;
        Ok(())
    }
}
