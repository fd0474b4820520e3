//! Seams to the browser and to the page's markup.
//!
//! The session and the normalizer only ever ask for a `Role`; which selector
//! locates it is configuration (`PageStructure`), and how a selector is
//! resolved in a live page is the `PageDriver`'s business.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use scraper::Selector;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    LoginForm,
    EmailField,
    PasswordField,
    LoginButton,
    DismissPopup,
    ListingContainer,
    Title,
    Price,
    Location,
    Image,
    Url,
}

impl Role {
    pub const ALL: [Role; 11] = [
        Role::LoginForm,
        Role::EmailField,
        Role::PasswordField,
        Role::LoginButton,
        Role::DismissPopup,
        Role::ListingContainer,
        Role::Title,
        Role::Price,
        Role::Location,
        Role::Image,
        Role::Url,
    ];
}

/// Role → CSS selector map. Site markup churns, so this is loaded from JSON
/// when `PAGE_STRUCTURE_PATH` is set; missing keys keep their defaults.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct PageStructure {
    pub login_form: String,
    pub email_field: String,
    pub password_field: String,
    pub login_button: String,
    pub dismiss_popup: String,
    pub listing_container: String,
    pub title: String,
    pub price: String,
    pub location: String,
    pub image: String,
    pub url: String,
}

fn exact_class(tag: &str, classes: &str) -> String {
    format!("{tag}[class=\"{classes}\"]")
}

impl Default for PageStructure {
    fn default() -> Self {
        PageStructure {
            login_form: "div#loginform".to_string(),
            email_field: "input[name=\"email\"]".to_string(),
            password_field: "input[name=\"pass\"]".to_string(),
            login_button: "button[name=\"login\"]".to_string(),
            dismiss_popup: "div[aria-label=\"Close\"][role=\"button\"]".to_string(),
            listing_container: exact_class(
                "div",
                "x9f619 x78zum5 x1r8uery xdt5ytf x1iyjqo2 xs83m0k x1e558r4 x150jy0e \
                 x1iorvi4 xjkvuk6 xnpuxes x291uyu x1uepa24",
            ),
            title: exact_class("span", "x1lliihq x6ikm8r x10wlt62 x1n2onr6"),
            price: exact_class(
                "span",
                "x193iq5w xeuugli x13faqbe x1vvkbs x1xmvt09 x1lliihq x1s928wv xhkezso \
                 x1gmr53x x1cpjm7i x1fgarty x1943h6x xudqn12 x676frb x1lkfr7t x1lbecb7 \
                 x1s688f xzsf02u",
            ),
            location: exact_class(
                "span",
                "x1lliihq x6ikm8r x10wlt62 x1n2onr6 xlyipyv xuxw1ft x1j85h84",
            ),
            image: exact_class("img", "xt7dq6l xl1xv1r x6ikm8r x10wlt62 xh8yej3"),
            url: exact_class(
                "a",
                "x1i10hfl xjbqb8w x1ejq31n xd10rxx x1sy0etr x17r0tee x972fbf xcfux6l \
                 x1qhh985 xm0m39n x9f619 x1ypdohk xt0psk2 xe8uvvx xdj266r x11i5rnm \
                 xat24cr x1mh8g0r xexx8yu x4uap5 x18d9i69 xkhd6sd x16tdsg8 xggy1nq \
                 x1a2a7pz x1heor9g xt0b8zv x1hl2dhg x1lku1pv",
            ),
        }
    }
}

impl PageStructure {
    pub fn find(&self, role: Role) -> &str {
        match role {
            Role::LoginForm => &self.login_form,
            Role::EmailField => &self.email_field,
            Role::PasswordField => &self.password_field,
            Role::LoginButton => &self.login_button,
            Role::DismissPopup => &self.dismiss_popup,
            Role::ListingContainer => &self.listing_container,
            Role::Title => &self.title,
            Role::Price => &self.price,
            Role::Location => &self.location,
            Role::Image => &self.image,
            Role::Url => &self.url,
        }
    }

    /// Compiled selector for `role`.
    pub fn selector(&self, role: Role) -> Result<Selector> {
        let raw = self.find(role);
        Selector::parse(raw).map_err(|e| anyhow::anyhow!("invalid selector for {role:?} ({raw}): {e}"))
    }

    pub fn validate(&self) -> Result<()> {
        for role in Role::ALL {
            self.selector(role)?;
        }
        Ok(())
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read page structure {}", path.display()))?;
        let structure: PageStructure =
            serde_json::from_str(&raw).context("Failed to parse page structure")?;
        structure.validate()?;
        Ok(structure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Load,
    NetworkIdle,
}

/// A rendered page the session can drive. Selectors come from `PageStructure`.
#[async_trait]
pub trait PageDriver: Send + Sync {
    async fn goto(&mut self, url: &str) -> Result<()>;
    async fn wait_for_load(&mut self, state: LoadState) -> Result<()>;
    async fn is_visible(&mut self, selector: &str) -> Result<bool>;
    async fn fill(&mut self, selector: &str, text: &str) -> Result<()>;
    async fn click(&mut self, selector: &str) -> Result<()>;
    async fn press_key(&mut self, key: &str) -> Result<()>;
    /// Full rendered HTML.
    async fn content(&mut self) -> Result<String>;
    async fn cookies(&mut self) -> Result<Vec<StoredCookie>>;
    async fn set_cookies(&mut self, cookies: Vec<StoredCookie>) -> Result<()>;
    async fn close(self: Box<Self>) -> Result<()>;
}

#[async_trait]
pub trait DriverFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn PageDriver>>;
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct StoredCookie {
    pub name: String,
    pub value: String,
    pub domain: String,
    pub path: String,
}

/// Saved browser session for "the current profile".
#[derive(Debug, Clone)]
pub struct SessionStore {
    path: PathBuf,
}

impl SessionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Absent or malformed state yields `None`; neither is an error.
    pub fn load(&self) -> Option<Vec<StoredCookie>> {
        let raw = match std::fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                log::warn!("could not read session state {}: {e}", self.path.display());
                return None;
            }
        };
        match serde_json::from_str::<Vec<StoredCookie>>(&raw) {
            Ok(cookies) if !cookies.is_empty() => Some(cookies),
            Ok(_) => None,
            Err(e) => {
                log::warn!("ignoring malformed session state {}: {e}", self.path.display());
                None
            }
        }
    }

    pub fn save(&self, cookies: &[StoredCookie]) -> Result<()> {
        let json = serde_json::to_string_pretty(cookies)?;
        std::fs::write(&self.path, json)
            .with_context(|| format!("Failed to write session state {}", self.path.display()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_structure_compiles() {
        let structure = PageStructure::default();
        structure.validate().unwrap();
        assert_eq!(structure.find(Role::LoginForm), "div#loginform");
    }

    #[test]
    fn partial_structure_keeps_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("structure.json");
        std::fs::write(&path, r#"{"title": "h2.listing-title"}"#).unwrap();

        let structure = PageStructure::from_file(&path).unwrap();
        assert_eq!(structure.find(Role::Title), "h2.listing-title");
        assert_eq!(structure.find(Role::Url), PageStructure::default().url);
    }

    #[test]
    fn invalid_selector_is_rejected() {
        let structure = PageStructure {
            price: "span[[".to_string(),
            ..PageStructure::default()
        };
        assert!(structure.validate().is_err());
    }

    #[test]
    fn session_state_roundtrip_and_fallbacks() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("state.json"));
        assert!(store.load().is_none());

        let cookies = vec![StoredCookie {
            name: "c_user".into(),
            value: "42".into(),
            domain: ".facebook.com".into(),
            path: "/".into(),
        }];
        store.save(&cookies).unwrap();
        assert_eq!(store.load(), Some(cookies));

        std::fs::write(dir.path().join("state.json"), "{not json").unwrap();
        assert!(store.load().is_none());
    }
}
