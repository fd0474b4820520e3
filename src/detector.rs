//! Reconciles a freshly normalized batch against the persisted set of one
//! search identity.
//!
//! Order per crawl, never reordered and never interleaved for one identity:
//! resolve identity, remove stale, insert absent, snapshot the new-set,
//! refresh positions, mark everything seen, read back the full set.
//! A failing step is logged and skipped; the next crawl re-derives it.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::data_models::{Listing, SearchIdentity};
use crate::error::{CrawlError, StoreStep};
use crate::store::ListingStore;

#[derive(Debug, Clone, Serialize)]
pub struct Reconciliation {
    /// Persisted set after mark-seen, ordered by position.
    pub listings: Vec<Listing>,
    /// Rows flagged new before mark-seen, ordered by position.
    pub new_listings: Vec<Listing>,
    /// Steps that failed and were skipped.
    pub failed_steps: Vec<StoreStep>,
}

impl Reconciliation {
    pub fn is_degraded(&self) -> bool {
        !self.failed_steps.is_empty()
    }
}

/// Exclusive per-identity leases. Crawls for different identities proceed independently.
/// An identity's entry is dropped once no crawl holds or awaits its lease.
#[derive(Default)]
pub struct IdentityLeases {
    locks: Arc<DashMap<SearchIdentity, Arc<Mutex<()>>>>,
}

impl IdentityLeases {
    pub async fn acquire(&self, identity: &SearchIdentity) -> Lease {
        let lock = self
            .locks
            .entry(identity.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        Lease {
            guard: Some(lock.lock_owned().await),
            identity: identity.clone(),
            locks: self.locks.clone(),
        }
    }

    /// Identities currently held or awaited.
    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

pub struct Lease {
    guard: Option<OwnedMutexGuard<()>>,
    identity: SearchIdentity,
    locks: Arc<DashMap<SearchIdentity, Arc<Mutex<()>>>>,
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.guard.take();
        // Only the map's own handle left: nobody holds or waits for this identity.
        self.locks
            .remove_if(&self.identity, |_, lock| Arc::strong_count(lock) == 1);
    }
}

pub struct ChangeDetector {
    store: Arc<dyn ListingStore>,
    leases: IdentityLeases,
}

impl ChangeDetector {
    pub fn new(store: Arc<dyn ListingStore>) -> Self {
        Self {
            store,
            leases: IdentityLeases::default(),
        }
    }

    /// Never fails: store errors degrade the result instead.
    pub async fn reconcile(&self, identity: &SearchIdentity, batch: &[Listing]) -> Reconciliation {
        let _lease = self.leases.acquire(identity).await;
        let mut failed_steps = Vec::new();

        let id = match self.store.resolve_or_create_identity(identity).await {
            Ok(id) => id,
            Err(e) => {
                report(StoreStep::ResolveIdentity, e, &mut failed_steps);
                return Reconciliation {
                    listings: batch.to_vec(),
                    new_listings: Vec::new(),
                    failed_steps,
                };
            }
        };

        let urls: Vec<String> = batch
            .iter()
            .map(|listing| listing.url.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        match self.store.delete_where_url_not_in(&id, &urls).await {
            Ok(deleted) => log::info!("{identity}: removed {deleted} stale listings"),
            Err(e) => report(StoreStep::RemoveStale, e, &mut failed_steps),
        }

        match self.store.upsert_if_absent(&id, batch).await {
            Ok(inserted) => log::info!("{identity}: inserted {inserted} listings"),
            Err(e) => report(StoreStep::Insert, e, &mut failed_steps),
        }

        let new_listings = match self.store.query_ordered_by_position(&id, true).await {
            Ok(new) => new,
            Err(e) => {
                report(StoreStep::QueryNew, e, &mut failed_steps);
                Vec::new()
            }
        };

        let positions = latest_positions(batch);
        if let Err(e) = self.store.update_positions(&id, &positions).await {
            report(StoreStep::UpdatePositions, e, &mut failed_steps);
        }

        if let Err(e) = self.store.mark_all_seen(&id).await {
            report(StoreStep::MarkSeen, e, &mut failed_steps);
        }

        let mut listings = match self.store.query_ordered_by_position(&id, false).await {
            Ok(all) => all,
            Err(e) => {
                report(StoreStep::QueryAll, e, &mut failed_steps);
                batch.to_vec()
            }
        };
        let store_lags_batch = failed_steps
            .iter()
            .any(|step| matches!(step, StoreStep::RemoveStale | StoreStep::Insert));
        if store_lags_batch && !failed_steps.contains(&StoreStep::QueryAll) {
            listings = overlay_batch(batch, listings);
        }

        log::info!(
            "{identity} ({id}): {} listings, {} new",
            listings.len(),
            new_listings.len()
        );
        Reconciliation {
            listings,
            new_listings,
            failed_steps,
        }
    }
}

/// First occurrence wins when a url repeats within one batch.
fn latest_positions(batch: &[Listing]) -> Vec<(String, u32)> {
    let mut seen = HashSet::new();
    batch
        .iter()
        .filter(|listing| seen.insert(listing.url.as_str()))
        .map(|listing| (listing.url.clone(), listing.position))
        .collect()
}

/// The crawled batch in page order, taking each listing's stored row when there is one.
/// Used when the store missed inserts or kept stale rows.
fn overlay_batch(batch: &[Listing], stored: Vec<Listing>) -> Vec<Listing> {
    let mut stored: HashMap<String, Listing> = stored
        .into_iter()
        .map(|listing| (listing.url.clone(), listing))
        .collect();
    let mut seen = HashSet::new();
    batch
        .iter()
        .filter(|listing| seen.insert(listing.url.as_str()))
        .map(|listing| {
            stored.remove(&listing.url).map_or_else(
                || listing.clone(),
                |mut row| {
                    row.position = listing.position;
                    row
                },
            )
        })
        .collect()
}

fn report(step: StoreStep, source: anyhow::Error, failed_steps: &mut Vec<StoreStep>) {
    let error = CrawlError::StoreFailure { step, source };
    log::error!("{error}");
    failed_steps.push(step);
}
