//! Drives one marketplace search page from navigation to extracted fragments.
//!
//! ```text
//! NAVIGATING -> LOGIN_RETRY (x3) -> POST_LOGIN -> SCROLLING (x10) -> EXTRACTING -> DONE
//!                    |
//!                    +-> FATAL_LOGIN_FAILURE        any driver error -> CRASHED
//! ```

use std::fmt;
use std::time::Duration;

use anyhow::Result;
use scraper::Html;

use crate::data_models::RawFragment;
use crate::error::CrawlError;
use crate::page::{LoadState, PageDriver, PageStructure, Role, SessionStore};

pub const MAX_LOGIN_ATTEMPTS: usize = 3;
pub const SCROLL_ITERATIONS: usize = 10;
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStage {
    Navigating,
    LoginRetry,
    PostLogin,
    Scrolling,
    Extracting,
    Done,
    FatalLoginFailure,
    Crashed,
}

impl fmt::Display for SessionStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStage::Navigating => "navigating",
            SessionStage::LoginRetry => "retrying login",
            SessionStage::PostLogin => "handling post-login overlays",
            SessionStage::Scrolling => "scrolling",
            SessionStage::Extracting => "extracting listings",
            SessionStage::Done => "done",
            SessionStage::FatalLoginFailure => "failing login",
            SessionStage::Crashed => "crashed",
        };
        f.write_str(name)
    }
}

#[derive(Clone)]
pub struct Credentials {
    pub email: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("email", &self.email)
            .field("password", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub credentials: Option<Credentials>,
    pub max_login_attempts: usize,
    pub scroll_iterations: usize,
    /// Bound on every navigation, visibility check and load wait.
    pub wait_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        SessionConfig {
            credentials: None,
            max_login_attempts: MAX_LOGIN_ATTEMPTS,
            scroll_iterations: SCROLL_ITERATIONS,
            wait_timeout: WAIT_TIMEOUT,
        }
    }
}

pub struct SessionOrchestrator<'a> {
    driver: &'a mut dyn PageDriver,
    structure: &'a PageStructure,
    config: &'a SessionConfig,
    session_store: Option<&'a SessionStore>,
    stage: SessionStage,
    login_attempts: usize,
}

impl<'a> SessionOrchestrator<'a> {
    pub fn new(
        driver: &'a mut dyn PageDriver,
        structure: &'a PageStructure,
        config: &'a SessionConfig,
    ) -> Self {
        Self {
            driver,
            structure,
            config,
            session_store: None,
            stage: SessionStage::Navigating,
            login_attempts: 0,
        }
    }

    /// Restore saved session state before navigating and save it after a login.
    pub fn with_session_store(mut self, store: &'a SessionStore) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn stage(&self) -> SessionStage {
        self.stage
    }

    pub fn login_attempts(&self) -> usize {
        self.login_attempts
    }

    pub async fn run(&mut self, url: &str) -> Result<Vec<RawFragment>, CrawlError> {
        self.restore_session().await;

        self.transition(SessionStage::Navigating);
        log::info!("opening {url}");
        let navigated = bounded(self.config.wait_timeout, "navigation", self.driver.goto(url)).await;
        self.check(navigated)?;
        self.wait_quiet(LoadState::Load).await?;

        let logged_in = if self.visible(Role::LoginForm).await? {
            self.transition(SessionStage::LoginRetry);
            self.login().await?;
            true
        } else {
            false
        };

        self.transition(SessionStage::PostLogin);
        if !logged_in {
            self.dismiss_popup().await?;
        }

        self.transition(SessionStage::Scrolling);
        for i in 0..self.config.scroll_iterations {
            let pressed =
                bounded(self.config.wait_timeout, "scroll", self.driver.press_key("End")).await;
            self.check(pressed)?;
            self.wait_quiet(LoadState::NetworkIdle).await?;
            log::debug!("scroll {}/{}", i + 1, self.config.scroll_iterations);
        }

        self.transition(SessionStage::Extracting);
        let content = bounded(self.config.wait_timeout, "reading content", self.driver.content()).await;
        let html = self.check(content)?;
        let fragments = extract_fragments(&html, self.structure).map_err(|e| self.crash(e))?;
        log::info!("extracted {} listing fragments", fragments.len());

        self.transition(SessionStage::Done);
        Ok(fragments)
    }

    async fn login(&mut self) -> Result<(), CrawlError> {
        let Some(credentials) = self.config.credentials.clone() else {
            log::error!("login prompt shown but no credentials are configured");
            self.transition(SessionStage::FatalLoginFailure);
            return Err(CrawlError::LoginFailure { attempts: 0 });
        };

        let structure = self.structure;
        let timeout = self.config.wait_timeout;
        let mut visible = true;
        while visible && self.login_attempts < self.config.max_login_attempts {
            self.login_attempts += 1;
            log::info!(
                "attempting login ({}/{})",
                self.login_attempts,
                self.config.max_login_attempts
            );
            let filled = bounded(
                timeout,
                "filling email",
                self.driver
                    .fill(structure.find(Role::EmailField), &credentials.email),
            )
            .await;
            self.check(filled)?;
            let filled = bounded(
                timeout,
                "filling password",
                self.driver
                    .fill(structure.find(Role::PasswordField), &credentials.password),
            )
            .await;
            self.check(filled)?;
            let clicked = bounded(
                timeout,
                "login click",
                self.driver.click(structure.find(Role::LoginButton)),
            )
            .await;
            self.check(clicked)?;
            self.wait_quiet(LoadState::NetworkIdle).await?;
            visible = self.visible(Role::LoginForm).await?;
        }

        if visible {
            self.transition(SessionStage::FatalLoginFailure);
            log::error!("login form still visible after {} attempts", self.login_attempts);
            return Err(CrawlError::LoginFailure {
                attempts: self.login_attempts,
            });
        }

        log::info!("logged in after {} attempt(s)", self.login_attempts);
        self.save_session().await;
        Ok(())
    }

    async fn dismiss_popup(&mut self) -> Result<(), CrawlError> {
        if !self.visible(Role::DismissPopup).await? {
            log::debug!("no popup to dismiss");
            return Ok(());
        }
        let structure = self.structure;
        let selector = structure.find(Role::DismissPopup);
        match bounded(self.config.wait_timeout, "popup click", self.driver.click(selector)).await {
            Ok(()) => {
                log::debug!("dismissed popup");
                self.wait_quiet(LoadState::Load).await
            }
            Err(e) => {
                log::warn!("could not dismiss popup: {:#}", e);
                Ok(())
            }
        }
    }

    async fn restore_session(&mut self) {
        let Some(store) = self.session_store else {
            return;
        };
        let Some(cookies) = store.load() else {
            log::debug!("no saved session, navigating anonymously");
            return;
        };
        let count = cookies.len();
        let restored = bounded(
            self.config.wait_timeout,
            "restoring cookies",
            self.driver.set_cookies(cookies),
        )
        .await;
        match restored {
            Ok(()) => log::debug!("restored {count} session cookies"),
            Err(e) => log::warn!("could not restore session state: {:#}", e),
        }
    }

    async fn save_session(&mut self) {
        let Some(store) = self.session_store else {
            return;
        };
        let cookies = bounded(self.config.wait_timeout, "reading cookies", self.driver.cookies()).await;
        let saved = match cookies {
            Ok(cookies) => store.save(&cookies),
            Err(e) => Err(e),
        };
        if let Err(e) = saved {
            log::warn!("could not save session state: {:#}", e);
        }
    }

    /// Timeouts count as "not visible".
    async fn visible(&mut self, role: Role) -> Result<bool, CrawlError> {
        let structure = self.structure;
        let selector = structure.find(role);
        match tokio::time::timeout(self.config.wait_timeout, self.driver.is_visible(selector)).await
        {
            Ok(Ok(visible)) => Ok(visible),
            Ok(Err(e)) => Err(self.crash(e)),
            Err(_) => {
                log::debug!("visibility check for {role:?} timed out, assuming hidden");
                Ok(false)
            }
        }
    }

    /// Waits for quiescence; running out of time is tolerated.
    async fn wait_quiet(&mut self, state: LoadState) -> Result<(), CrawlError> {
        match tokio::time::timeout(self.config.wait_timeout, self.driver.wait_for_load(state)).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(self.crash(e)),
            Err(_) => {
                log::debug!("{state:?} not reached within {:?}", self.config.wait_timeout);
                Ok(())
            }
        }
    }

    fn check<T>(&mut self, result: Result<T>) -> Result<T, CrawlError> {
        result.map_err(|e| self.crash(e))
    }

    fn crash(&mut self, source: anyhow::Error) -> CrawlError {
        let stage = self.stage;
        log::error!("crawl crashed while {stage}: {:#}", source);
        self.stage = SessionStage::Crashed;
        CrawlError::CrawlCrash { stage, source }
    }

    fn transition(&mut self, next: SessionStage) {
        log::debug!("session {} -> {}", self.stage, next);
        self.stage = next;
    }
}

/// Runs one driver call, turning an elapsed `timeout` into an error.
async fn bounded<T>(
    timeout: Duration,
    what: &str,
    call: impl Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(timeout, call).await {
        Ok(result) => result,
        Err(_) => Err(anyhow::anyhow!("{what} timed out after {timeout:?}")),
    }
}

/// Outer HTML of every listing container, in document order.
pub fn extract_fragments(html: &str, structure: &PageStructure) -> Result<Vec<RawFragment>> {
    let selector = structure.selector(Role::ListingContainer)?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&selector)
        .map(|element| RawFragment(element.html()))
        .collect())
}
