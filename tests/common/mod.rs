#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;

use marketscout::data_models::{Listing, SearchId, SearchIdentity};
use marketscout::notify::{Notification, Notifier};
use marketscout::page::{DriverFactory, LoadState, PageDriver, PageStructure, StoredCookie};
use marketscout::session::{Credentials, SessionConfig};
use marketscout::store::{ListingStore, MemoryStore};

pub fn test_structure() -> PageStructure {
    PageStructure {
        listing_container: "div.card".to_string(),
        url: "a.link".to_string(),
        title: "span.title".to_string(),
        price: "span.price".to_string(),
        location: "span.loc".to_string(),
        image: "img.photo".to_string(),
        ..PageStructure::default()
    }
}

pub fn session_config(credentials: bool) -> SessionConfig {
    SessionConfig {
        credentials: credentials.then(|| Credentials {
            email: "me@example.com".to_string(),
            password: "hunter2".to_string(),
        }),
        wait_timeout: Duration::from_millis(200),
        ..SessionConfig::default()
    }
}

pub fn card(id: u32, title: &str, price: &str) -> String {
    format!(
        r#"<div class="card">
            <a class="link" href="/marketplace/item/{id}/?ref=search">
                <img class="photo" src="https://cdn.example.com/{id}.jpg">
                <span class="price">{price}</span>
                <span class="title">{title}</span>
                <span class="loc">Seattle, WA</span>
            </a>
        </div>"#
    )
}

pub fn item_url(id: u32) -> String {
    format!("https://www.facebook.com/marketplace/item/{id}/")
}

pub fn page_of(cards: &[String]) -> String {
    format!("<html><body><div class=\"feed\">{}</div></body></html>", cards.join("\n"))
}

/// What the scripted page does, plus a log of every driver call it received.
#[derive(Default)]
pub struct Script {
    /// Answers for successive login form visibility checks; exhausted means hidden.
    pub login_visible: VecDeque<bool>,
    pub popup_visible: bool,
    pub html: String,
    /// Driver call (by name) that fails every time.
    pub fail_on: Option<&'static str>,
    /// Driver call (by name) that never completes.
    pub hang_on: Option<&'static str>,
    pub fail_open: bool,
    pub cookies: Vec<StoredCookie>,
    pub calls: Vec<String>,
}

impl Script {
    pub fn count(&self, call: &str) -> usize {
        self.calls.iter().filter(|c| c.as_str() == call).count()
    }
}

#[derive(Clone)]
pub struct FakePage {
    script: Arc<Mutex<Script>>,
    structure: PageStructure,
}

impl FakePage {
    pub fn new(script: Script) -> (Self, Arc<Mutex<Script>>) {
        let script = Arc::new(Mutex::new(script));
        (
            Self {
                script: script.clone(),
                structure: test_structure(),
            },
            script,
        )
    }

    async fn record(&self, name: &'static str, detail: &str) -> Result<()> {
        let hang = {
            let mut script = self.script.lock().unwrap();
            script.calls.push(if detail.is_empty() {
                name.to_string()
            } else {
                format!("{name}:{detail}")
            });
            if script.fail_on == Some(name) {
                anyhow::bail!("{name} failed");
            }
            script.hang_on == Some(name)
        };
        if hang {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}

#[async_trait]
impl PageDriver for FakePage {
    async fn goto(&mut self, url: &str) -> Result<()> {
        self.record("goto", url).await
    }

    async fn wait_for_load(&mut self, state: LoadState) -> Result<()> {
        let state = format!("{state:?}");
        self.record("wait", &state).await
    }

    async fn is_visible(&mut self, selector: &str) -> Result<bool> {
        self.record("is_visible", selector).await?;
        let mut script = self.script.lock().unwrap();
        if selector == self.structure.login_form {
            Ok(script.login_visible.pop_front().unwrap_or(false))
        } else if selector == self.structure.dismiss_popup {
            Ok(script.popup_visible)
        } else {
            Ok(false)
        }
    }

    async fn fill(&mut self, selector: &str, _text: &str) -> Result<()> {
        self.record("fill", selector).await
    }

    async fn click(&mut self, selector: &str) -> Result<()> {
        self.record("click", selector).await
    }

    async fn press_key(&mut self, key: &str) -> Result<()> {
        self.record("press_key", key).await
    }

    async fn content(&mut self) -> Result<String> {
        self.record("content", "").await?;
        Ok(self.script.lock().unwrap().html.clone())
    }

    async fn cookies(&mut self) -> Result<Vec<StoredCookie>> {
        self.record("cookies", "").await?;
        Ok(self.script.lock().unwrap().cookies.clone())
    }

    async fn set_cookies(&mut self, cookies: Vec<StoredCookie>) -> Result<()> {
        self.record("set_cookies", &cookies.len().to_string()).await
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.record("close", "").await
    }
}

/// Hands out pages that all share one script.
pub struct FakeFactory {
    pub script: Arc<Mutex<Script>>,
}

impl FakeFactory {
    pub fn new(script: Script) -> Self {
        Self {
            script: Arc::new(Mutex::new(script)),
        }
    }

    pub fn set_html(&self, html: String) {
        self.script.lock().unwrap().html = html;
    }

    pub fn calls(&self) -> Vec<String> {
        self.script.lock().unwrap().calls.clone()
    }
}

#[async_trait]
impl DriverFactory for FakeFactory {
    async fn open(&self) -> Result<Box<dyn PageDriver>> {
        if self.script.lock().unwrap().fail_open {
            anyhow::bail!("browser is gone");
        }
        Ok(Box::new(FakePage {
            script: self.script.clone(),
            structure: test_structure(),
        }))
    }
}

#[derive(Default)]
pub struct Recorder {
    pub sent: Mutex<Vec<Notification>>,
}

#[async_trait]
impl Notifier for Recorder {
    async fn send(&self, notification: &Notification) -> Result<()> {
        self.sent.lock().unwrap().push(notification.clone());
        Ok(())
    }
}

/// `MemoryStore` whose insert step can be made to fail.
#[derive(Default)]
pub struct FlakyStore {
    pub inner: MemoryStore,
    pub fail_insert: Mutex<bool>,
}

#[async_trait]
impl ListingStore for FlakyStore {
    async fn resolve_or_create_identity(&self, identity: &SearchIdentity) -> Result<SearchId> {
        self.inner.resolve_or_create_identity(identity).await
    }

    async fn upsert_if_absent(&self, id: &SearchId, listings: &[Listing]) -> Result<u64> {
        if *self.fail_insert.lock().unwrap() {
            anyhow::bail!("connection reset");
        }
        self.inner.upsert_if_absent(id, listings).await
    }

    async fn delete_where_url_not_in(&self, id: &SearchId, urls: &[String]) -> Result<u64> {
        self.inner.delete_where_url_not_in(id, urls).await
    }

    async fn mark_all_seen(&self, id: &SearchId) -> Result<u64> {
        self.inner.mark_all_seen(id).await
    }

    async fn update_positions(&self, id: &SearchId, positions: &[(String, u32)]) -> Result<u64> {
        self.inner.update_positions(id, positions).await
    }

    async fn query_ordered_by_position(
        &self,
        id: &SearchId,
        only_new: bool,
    ) -> Result<Vec<Listing>> {
        self.inner.query_ordered_by_position(id, only_new).await
    }
}
