use dotenvy::dotenv;
use once_cell::sync::Lazy;
use std::env;
use std::path::PathBuf;
use std::str::FromStr;

pub static CONFIG: Lazy<Config> = Lazy::new(|| {
    dotenv().ok(); // Load .env file if present
    Config {
        mongo_uri: get_env_or_default("MONGO_URI", "mongodb://localhost:27017"),
        mongo_db_name: get_env_or_default("MONGO_DB_NAME", "marketscout"),
        fb_user: get_env_opt("FB_USER"),
        fb_password: get_env_opt("FB_PASSWORD"),
        host: get_env_or_default("HOST", "127.0.0.1"),
        port: get_env_parsed("PORT", 8000),
        ntfy_server: get_env_or_default("NTFY_SERVER", "https://ntfy.sh"),
        ntfy_topic: get_env_opt("NTFY_TOPIC"),
        notify_limit: parse_notify_limit(env::var("NOTIFY_LIMIT").ok().as_deref()),
        session_state_path: PathBuf::from(get_env_or_default(
            "SESSION_STATE_PATH",
            "session_state.json",
        )),
        failed_listing_spool: get_env_opt("FAILED_LISTING_SPOOL").map(PathBuf::from),
        page_structure_path: get_env_opt("PAGE_STRUCTURE_PATH").map(PathBuf::from),
        headless: get_env_parsed("HEADLESS", true),
        scroll_iterations: get_env_parsed("SCROLL_ITERATIONS", 10),
        wait_timeout_ms: get_env_parsed("WAIT_TIMEOUT_MS", 5_000),
        chrome_path: get_env_opt("CHROME_PATH").map(PathBuf::from),
    }
});

pub struct Config {
    pub mongo_uri: String,
    pub mongo_db_name: String,
    pub fb_user: Option<String>,
    pub fb_password: Option<String>,
    pub host: String,
    pub port: u16,
    pub ntfy_server: String,
    pub ntfy_topic: Option<String>,
    /// Maximum number of individually detailed alerts per crawl.
    pub notify_limit: Option<usize>,
    pub session_state_path: PathBuf,
    pub failed_listing_spool: Option<PathBuf>,
    pub page_structure_path: Option<PathBuf>,
    pub headless: bool,
    pub scroll_iterations: usize,
    pub wait_timeout_ms: u64,
    pub chrome_path: Option<PathBuf>,
}

pub const DEFAULT_NOTIFY_LIMIT: usize = 5;

fn get_env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn get_env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

fn get_env_parsed<T: FromStr>(key: &str, default: T) -> T {
    match env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            log::warn!("ignoring unparsable value for {key}: {raw:?}");
            default
        }),
        Err(_) => default,
    }
}

/// `none` (or `off`) disables the cap, anything unparsable falls back to the default.
pub fn parse_notify_limit(raw: Option<&str>) -> Option<usize> {
    match raw.map(str::trim) {
        None | Some("") => Some(DEFAULT_NOTIFY_LIMIT),
        Some(v) if v.eq_ignore_ascii_case("none") || v.eq_ignore_ascii_case("off") => None,
        Some(v) => Some(v.parse().unwrap_or(DEFAULT_NOTIFY_LIMIT)),
    }
}
