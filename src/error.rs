use thiserror::Error;

use crate::session::SessionStage;

/// Store steps of a reconciliation, in the order they run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreStep {
    ResolveIdentity,
    RemoveStale,
    Insert,
    QueryNew,
    UpdatePositions,
    MarkSeen,
    QueryAll,
}

impl std::fmt::Display for StoreStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StoreStep::ResolveIdentity => "resolve identity",
            StoreStep::RemoveStale => "remove stale",
            StoreStep::Insert => "insert",
            StoreStep::QueryNew => "query new",
            StoreStep::UpdatePositions => "update positions",
            StoreStep::MarkSeen => "mark seen",
            StoreStep::QueryAll => "query all",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum CrawlError {
    /// The login form was still visible after every allowed attempt.
    #[error("login failed after {attempts} attempt(s)")]
    LoginFailure { attempts: usize },

    #[error("crawl crashed while {stage}: {source:#}")]
    CrawlCrash {
        stage: SessionStage,
        #[source]
        source: anyhow::Error,
    },

    #[error("store step '{step}' failed: {source:#}")]
    StoreFailure {
        step: StoreStep,
        #[source]
        source: anyhow::Error,
    },

    #[error("malformed listing #{index}: {reason}")]
    MalformedListing { index: usize, reason: String },
}

impl CrawlError {
    pub fn is_auth(&self) -> bool {
        matches!(self, CrawlError::LoginFailure { .. })
    }

    /// Whether the whole crawl attempt is lost. Store and listing failures are recovered.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CrawlError::LoginFailure { .. } | CrawlError::CrawlCrash { .. }
        )
    }
}
