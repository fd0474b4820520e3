use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use nanoid::nanoid;
use serde::Serialize;

use crate::data_models::{Listing, SearchIdentity};
use crate::detector::ChangeDetector;
use crate::error::{CrawlError, StoreStep};
use crate::normalizer::{DiagnosticSpool, Normalizer};
use crate::page::{DriverFactory, PageDriver, PageStructure, SessionStore};
use crate::session::{SessionConfig, SessionOrchestrator, SessionStage};

#[derive(Debug, Clone, Serialize)]
pub struct CrawlOutcome {
    pub crawl_id: String,
    pub identity: SearchIdentity,
    pub listings: Vec<Listing>,
    pub new_listings: Vec<Listing>,
    /// Size of the normalized batch, which the alert policy ranks against.
    pub batch_len: usize,
    pub rejected: usize,
    pub failed_steps: Vec<StoreStep>,
    pub crawled_at: DateTime<Utc>,
}

#[async_trait]
pub trait CrawlRunner: Send + Sync {
    async fn crawl(&self, identity: &SearchIdentity) -> Result<CrawlOutcome, CrawlError>;
}

pub struct Crawler {
    drivers: Arc<dyn DriverFactory>,
    structure: Arc<PageStructure>,
    session: SessionConfig,
    session_store: Option<SessionStore>,
    spool: Option<DiagnosticSpool>,
    detector: Arc<ChangeDetector>,
}

impl Crawler {
    pub fn new(
        drivers: Arc<dyn DriverFactory>,
        structure: Arc<PageStructure>,
        session: SessionConfig,
        detector: Arc<ChangeDetector>,
    ) -> Crawler {
        Crawler {
            drivers,
            structure,
            session,
            session_store: None,
            spool: None,
            detector,
        }
    }

    pub fn with_session_store(mut self, store: SessionStore) -> Self {
        self.session_store = Some(store);
        self
    }

    pub fn with_spool(mut self, spool: DiagnosticSpool) -> Self {
        self.spool = Some(spool);
        self
    }

    async fn fetch_listings(
        &self,
        driver: &mut dyn PageDriver,
        identity: &SearchIdentity,
    ) -> Result<(Vec<Listing>, usize), CrawlError> {
        let mut orchestrator = SessionOrchestrator::new(driver, &self.structure, &self.session);
        if let Some(store) = &self.session_store {
            orchestrator = orchestrator.with_session_store(store);
        }
        let fragments = orchestrator.run(&identity.search_url()).await?;

        let batch = Normalizer::new(&self.structure)
            .with_spool(self.spool.as_ref())
            .normalize(&fragments)
            .map_err(|source| CrawlError::CrawlCrash {
                stage: SessionStage::Extracting,
                source,
            })?;
        Ok((batch.listings, batch.rejected.len()))
    }
}

#[async_trait]
impl CrawlRunner for Crawler {
    async fn crawl(&self, identity: &SearchIdentity) -> Result<CrawlOutcome, CrawlError> {
        let crawl_id = nanoid!(10);
        log::info!("[{crawl_id}] crawling {identity}");

        let mut driver = self
            .drivers
            .open()
            .await
            .map_err(|source| CrawlError::CrawlCrash {
                stage: SessionStage::Navigating,
                source,
            })?;

        let fetched = self.fetch_listings(driver.as_mut(), identity).await;
        if let Err(e) = driver.close().await {
            log::warn!("[{crawl_id}] could not close page: {:#}", e);
        }
        let (batch, rejected) = fetched?;

        let reconciliation = self.detector.reconcile(identity, &batch).await;
        if reconciliation.is_degraded() {
            log::warn!(
                "[{crawl_id}] store steps failed: {:?}",
                reconciliation.failed_steps
            );
        }

        Ok(CrawlOutcome {
            crawl_id,
            identity: identity.clone(),
            listings: reconciliation.listings,
            new_listings: reconciliation.new_listings,
            batch_len: batch.len(),
            rejected,
            failed_steps: reconciliation.failed_steps,
            crawled_at: Utc::now(),
        })
    }
}
