use std::collections::HashSet;
use std::sync::Mutex;

use anyhow::Result;
use async_trait::async_trait;

use crate::data_models::{Listing, SearchId, SearchIdentity};

/// Persistence consumed by the change detector. Every operation is scoped to one
/// identity and is idempotent when replayed with the same batch.
#[async_trait]
pub trait ListingStore: Send + Sync {
    async fn resolve_or_create_identity(&self, identity: &SearchIdentity) -> Result<SearchId>;

    /// Inserts listings whose url is not yet stored for `id`, flagged new.
    /// Existing rows are untouched. Returns the number inserted.
    async fn upsert_if_absent(&self, id: &SearchId, listings: &[Listing]) -> Result<u64>;

    async fn delete_where_url_not_in(&self, id: &SearchId, urls: &[String]) -> Result<u64>;

    async fn mark_all_seen(&self, id: &SearchId) -> Result<u64>;

    /// Records the latest page rank of rows that are still listed.
    async fn update_positions(&self, id: &SearchId, positions: &[(String, u32)]) -> Result<u64>;

    async fn query_ordered_by_position(&self, id: &SearchId, only_new: bool)
    -> Result<Vec<Listing>>;
}

#[derive(Default)]
struct MemoryInner {
    identities: Vec<SearchIdentity>,
    rows: Vec<(SearchId, Listing)>,
}

/// In-process store, used for dry runs and tests.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn row_count(&self) -> usize {
        self.lock().rows.len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        // A poisoned lock only means another test thread panicked mid-write.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl ListingStore for MemoryStore {
    async fn resolve_or_create_identity(&self, identity: &SearchIdentity) -> Result<SearchId> {
        let mut inner = self.lock();
        let index = match inner.identities.iter().position(|i| i == identity) {
            Some(index) => index,
            None => {
                inner.identities.push(identity.clone());
                inner.identities.len() - 1
            }
        };
        Ok(SearchId((index + 1).to_string()))
    }

    async fn upsert_if_absent(&self, id: &SearchId, listings: &[Listing]) -> Result<u64> {
        let mut inner = self.lock();
        let mut existing: HashSet<String> = inner
            .rows
            .iter()
            .filter(|(row_id, _)| row_id == id)
            .map(|(_, listing)| listing.url.clone())
            .collect();

        let mut inserted = 0;
        for listing in listings {
            if !existing.insert(listing.url.clone()) {
                continue;
            }
            let mut row = listing.clone();
            row.is_new = true;
            inner.rows.push((id.clone(), row));
            inserted += 1;
        }
        Ok(inserted)
    }

    async fn delete_where_url_not_in(&self, id: &SearchId, urls: &[String]) -> Result<u64> {
        let keep: HashSet<&str> = urls.iter().map(String::as_str).collect();
        let mut inner = self.lock();
        let before = inner.rows.len();
        inner
            .rows
            .retain(|(row_id, listing)| row_id != id || keep.contains(listing.url.as_str()));
        Ok((before - inner.rows.len()) as u64)
    }

    async fn mark_all_seen(&self, id: &SearchId) -> Result<u64> {
        let mut inner = self.lock();
        let mut updated = 0;
        for (_, listing) in inner.rows.iter_mut().filter(|(row_id, _)| row_id == id) {
            if listing.is_new {
                listing.is_new = false;
                updated += 1;
            }
        }
        Ok(updated)
    }

    async fn update_positions(&self, id: &SearchId, positions: &[(String, u32)]) -> Result<u64> {
        let mut inner = self.lock();
        let mut updated = 0;
        for (url, position) in positions {
            if let Some((_, listing)) = inner
                .rows
                .iter_mut()
                .find(|(row_id, listing)| row_id == id && &listing.url == url)
            {
                if listing.position != *position {
                    listing.position = *position;
                    updated += 1;
                }
            }
        }
        Ok(updated)
    }

    async fn query_ordered_by_position(
        &self,
        id: &SearchId,
        only_new: bool,
    ) -> Result<Vec<Listing>> {
        let inner = self.lock();
        let mut listings: Vec<Listing> = inner
            .rows
            .iter()
            .filter(|(row_id, listing)| row_id == id && (!only_new || listing.is_new))
            .map(|(_, listing)| listing.clone())
            .collect();
        listings.sort_by_key(|listing| listing.position);
        Ok(listings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn listing(url: &str, position: u32) -> Listing {
        Listing::new(url, position)
    }

    #[tokio::test]
    async fn identities_are_stable_and_distinct() -> Result<()> {
        let store = MemoryStore::new();
        let a = store
            .resolve_or_create_identity(&SearchIdentity::new("nyc", "search", "query=bike"))
            .await?;
        let b = store
            .resolve_or_create_identity(&SearchIdentity::new("nyc", "search", "query=Bike"))
            .await?;
        let a_again = store
            .resolve_or_create_identity(&SearchIdentity::new("nyc", "search", "query=bike"))
            .await?;
        assert_eq!(a, a_again);
        assert_ne!(a, b);
        Ok(())
    }

    #[tokio::test]
    async fn upsert_skips_existing_and_in_batch_duplicates() -> Result<()> {
        let store = MemoryStore::new();
        let id = SearchId("1".into());

        let inserted = store
            .upsert_if_absent(&id, &[listing("a", 1), listing("a", 2), listing("b", 3)])
            .await?;
        assert_eq!(inserted, 2);
        assert_eq!(store.upsert_if_absent(&id, &[listing("b", 1)]).await?, 0);

        let rows = store.query_ordered_by_position(&id, true).await?;
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|l| l.is_new));
        assert_eq!(rows[0].position, 1);
        Ok(())
    }

    #[tokio::test]
    async fn delete_is_scoped_to_identity() -> Result<()> {
        let store = MemoryStore::new();
        let one = SearchId("1".into());
        let two = SearchId("2".into());
        store.upsert_if_absent(&one, &[listing("a", 1), listing("b", 2)]).await?;
        store.upsert_if_absent(&two, &[listing("a", 1)]).await?;

        let deleted = store.delete_where_url_not_in(&one, &["b".to_string()]).await?;
        assert_eq!(deleted, 1);
        assert_eq!(store.query_ordered_by_position(&two, false).await?.len(), 1);
        assert_eq!(store.row_count(), 2);
        Ok(())
    }
}
