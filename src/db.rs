use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::TryStreamExt;
use mongodb::error::{Error as MongoError, ErrorKind, WriteFailure};
use mongodb::options::{ClientOptions, IndexOptions, ReturnDocument};
use mongodb::{
    Client, Collection, Database as MongoDatabase, IndexModel,
    bson::{DateTime, Document, doc, oid::ObjectId},
};
use once_cell::sync::OnceCell;
use serde::{Serialize, de::DeserializeOwned};

use crate::config::CONFIG;
use crate::data_models::{
    Listing, ListingDoc, SearchCriteriaDoc, SearchId, SearchIdentity, to_bson_datetime,
};
use crate::store::ListingStore;

/// Global database instance
static DB: OnceCell<Database> = OnceCell::new();

/// Collection names as constants for consistency
pub mod collections {
    pub const SEARCH_CRITERIA: &str = "search_criteria";
    pub const LISTINGS: &str = "listings";
}

const DUPLICATE_KEY: i32 = 11000;

/// Main database wrapper providing connection management and collection access
#[derive(Debug, Clone)]
pub struct Database {
    client: Client,
    db: MongoDatabase,
}

impl Database {
    /// Create a new Database instance with custom URI and database name.
    /// Useful for testing with a different database.
    pub async fn new(uri: &str, db_name: &str) -> Result<Self> {
        let client_options = ClientOptions::parse(uri)
            .await
            .context("Failed to parse MongoDB connection string")?;

        let client =
            Client::with_options(client_options).context("Failed to create MongoDB client")?;

        // Ping the database to verify connection
        client
            .database("admin")
            .run_command(doc! { "ping": 1 })
            .await
            .context("Failed to connect to MongoDB")?;

        log::info!("Connected to MongoDB database: {}", db_name);

        let db = client.database(db_name);
        let database = Self { client, db };
        database.ensure_indexes().await?;
        Ok(database)
    }

    /// Create a Database instance using environment configuration
    pub async fn from_config() -> Result<Self> {
        Self::new(&CONFIG.mongo_uri, &CONFIG.mongo_db_name).await
    }

    /// Initialize the global database instance.
    /// Call this once at application startup.
    pub async fn init_global() -> Result<&'static Database> {
        let db = Self::from_config().await?;
        DB.set(db)
            .map_err(|_| anyhow::anyhow!("Database already initialized"))?;
        Ok(Self::get())
    }

    /// Get the global database instance.
    /// Panics if database hasn't been initialized.
    pub fn get() -> &'static Database {
        DB.get()
            .expect("Database not initialized. Call Database::init_global() first.")
    }

    /// Get a typed collection by name
    pub fn collection<T>(&self, name: &str) -> Collection<T>
    where
        T: Send + Sync,
    {
        self.db.collection(name)
    }

    /// Get the underlying MongoDB client (for advanced operations)
    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn search_criteria(&self) -> Collection<SearchCriteriaDoc> {
        self.collection(collections::SEARCH_CRITERIA)
    }

    pub fn listings(&self) -> Collection<ListingDoc> {
        self.collection(collections::LISTINGS)
    }

    /// Uniqueness of identities and of `(search_id, url)` is enforced here, not in code.
    async fn ensure_indexes(&self) -> Result<()> {
        let unique = || IndexOptions::builder().unique(Some(true)).build();

        self.search_criteria()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "location": 1, "category": 1, "query": 1 })
                    .options(unique())
                    .build(),
            )
            .await
            .context("Failed to create search criteria index")?;

        self.listings()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "search_id": 1, "url": 1 })
                    .options(unique())
                    .build(),
            )
            .await
            .context("Failed to create listings index")?;

        self.listings()
            .create_index(
                IndexModel::builder()
                    .keys(doc! { "search_id": 1, "position": 1 })
                    .build(),
            )
            .await
            .context("Failed to create listings position index")?;

        Ok(())
    }
}

// =============================================================================
// Generic collection operations
// =============================================================================

pub struct Repository<T>
where
    T: Send + Sync,
{
    collection: Collection<T>,
}

impl<T> Repository<T>
where
    T: Serialize + DeserializeOwned + Unpin + Send + Sync,
{
    pub fn new(collection: Collection<T>) -> Self {
        Self { collection }
    }

    /// Find a single document matching a filter
    pub async fn find_one(&self, filter: Document) -> Result<Option<T>> {
        self.collection
            .find_one(filter)
            .await
            .context("Failed to find document")
    }

    /// Find all documents matching a filter, in `sort` order
    pub async fn find_sorted(&self, filter: Document, sort: Document) -> Result<Vec<T>> {
        let cursor = self
            .collection
            .find(filter)
            .sort(sort)
            .await
            .context("Failed to execute find query")?;

        cursor
            .try_collect()
            .await
            .context("Failed to collect results")
    }

    /// Update multiple documents matching a filter
    pub async fn update_many(&self, filter: Document, update: Document) -> Result<u64> {
        let result = self
            .collection
            .update_many(filter, doc! { "$set": update })
            .await
            .context("Failed to update documents")?;

        Ok(result.modified_count)
    }

    /// Delete multiple documents matching a filter
    pub async fn delete_many(&self, filter: Document) -> Result<u64> {
        let result = self
            .collection
            .delete_many(filter)
            .await
            .context("Failed to delete documents")?;

        Ok(result.deleted_count)
    }

    /// Count documents matching a filter
    pub async fn count(&self, filter: Document) -> Result<u64> {
        self.collection
            .count_documents(filter)
            .await
            .context("Failed to count documents")
    }
}

fn is_duplicate_key(error: &MongoError) -> bool {
    match error.kind.as_ref() {
        ErrorKind::Write(WriteFailure::WriteError(e)) => e.code == DUPLICATE_KEY,
        ErrorKind::Command(e) => e.code == DUPLICATE_KEY,
        _ => false,
    }
}

fn object_id(id: &SearchId) -> Result<ObjectId> {
    ObjectId::parse_str(&id.0).with_context(|| format!("Invalid search id {id}"))
}

// =============================================================================
// Search criteria
// =============================================================================

pub struct SearchCriteriaRepo {
    repo: Repository<SearchCriteriaDoc>,
}

impl SearchCriteriaRepo {
    pub fn new(db: &Database) -> Self {
        Self {
            repo: Repository::new(db.search_criteria()),
        }
    }

    pub async fn get_or_insert(&self, identity: &SearchIdentity) -> Result<ObjectId> {
        let filter = doc! {
            "location": identity.location.as_str(),
            "category": identity.category.as_str(),
            "query": identity.query.as_str(),
        };
        let upserted = self
            .repo
            .collection
            .find_one_and_update(
                filter.clone(),
                doc! { "$setOnInsert": { "created_at": DateTime::now() } },
            )
            .upsert(true)
            .return_document(ReturnDocument::After)
            .await;

        let found = match upserted {
            Ok(found) => found,
            // Lost a creation race; the winner's row is there now.
            Err(e) if is_duplicate_key(&e) => self.repo.find_one(filter).await?,
            Err(e) => return Err(e).context("Failed to upsert search criteria"),
        };
        found
            .map(|criteria| criteria.id)
            .ok_or_else(|| anyhow::anyhow!("Search criteria {identity} missing after upsert"))
    }
}

// =============================================================================
// Listings
// =============================================================================

pub struct ListingRepo {
    repo: Repository<ListingDoc>,
}

impl ListingRepo {
    pub fn new(db: &Database) -> Self {
        Self {
            repo: Repository::new(db.listings()),
        }
    }

    pub async fn insert_if_absent(&self, search_id: ObjectId, listing: &Listing) -> Result<bool> {
        let filter = doc! { "search_id": search_id, "url": listing.url.as_str() };
        let update = doc! {
            "$setOnInsert": {
                "title": listing.title.clone(),
                "price": listing.price.clone(),
                "location": listing.location.clone(),
                "image": listing.image.clone(),
                "position": i64::from(listing.position),
                "is_new": true,
                "observed_at": to_bson_datetime(listing.observed_at),
            }
        };
        match self
            .repo
            .collection
            .update_one(filter, update)
            .upsert(true)
            .await
        {
            Ok(result) => Ok(result.upserted_id.is_some()),
            Err(e) if is_duplicate_key(&e) => {
                log::debug!("skipping duplicate listing {}", listing.url);
                Ok(false)
            }
            Err(e) => Err(e).context("Failed to insert listing"),
        }
    }

    pub async fn delete_not_in(&self, search_id: ObjectId, urls: &[String]) -> Result<u64> {
        self.repo
            .delete_many(doc! { "search_id": search_id, "url": { "$nin": urls.to_vec() } })
            .await
    }

    pub async fn mark_all_seen(&self, search_id: ObjectId) -> Result<u64> {
        self.repo
            .update_many(
                doc! { "search_id": search_id, "is_new": true },
                doc! { "is_new": false },
            )
            .await
    }

    pub async fn set_position(&self, search_id: ObjectId, url: &str, position: u32) -> Result<u64> {
        self.repo
            .update_many(
                doc! { "search_id": search_id, "url": url },
                doc! { "position": i64::from(position) },
            )
            .await
    }

    pub async fn list(&self, search_id: ObjectId, only_new: bool) -> Result<Vec<ListingDoc>> {
        let mut filter = doc! { "search_id": search_id };
        if only_new {
            filter.insert("is_new", true);
        }
        self.repo.find_sorted(filter, doc! { "position": 1 }).await
    }

    pub async fn count(&self, search_id: ObjectId) -> Result<u64> {
        self.repo.count(doc! { "search_id": search_id }).await
    }
}

/// `ListingStore` backed by MongoDB.
pub struct MongoStore {
    criteria: SearchCriteriaRepo,
    listings: ListingRepo,
}

impl MongoStore {
    pub fn new(db: &Database) -> Self {
        Self {
            criteria: SearchCriteriaRepo::new(db),
            listings: ListingRepo::new(db),
        }
    }

    pub fn listings(&self) -> &ListingRepo {
        &self.listings
    }
}

#[async_trait]
impl ListingStore for MongoStore {
    async fn resolve_or_create_identity(&self, identity: &SearchIdentity) -> Result<SearchId> {
        let id = self.criteria.get_or_insert(identity).await?;
        Ok(SearchId(id.to_hex()))
    }

    async fn upsert_if_absent(&self, id: &SearchId, listings: &[Listing]) -> Result<u64> {
        let search_id = object_id(id)?;
        let mut inserted = 0;
        for listing in listings {
            if self.listings.insert_if_absent(search_id, listing).await? {
                inserted += 1;
            }
        }
        Ok(inserted)
    }

    async fn delete_where_url_not_in(&self, id: &SearchId, urls: &[String]) -> Result<u64> {
        self.listings.delete_not_in(object_id(id)?, urls).await
    }

    async fn mark_all_seen(&self, id: &SearchId) -> Result<u64> {
        self.listings.mark_all_seen(object_id(id)?).await
    }

    async fn update_positions(&self, id: &SearchId, positions: &[(String, u32)]) -> Result<u64> {
        let search_id = object_id(id)?;
        let mut updated = 0;
        for (url, position) in positions {
            updated += self.listings.set_position(search_id, url, *position).await?;
        }
        Ok(updated)
    }

    async fn query_ordered_by_position(
        &self,
        id: &SearchId,
        only_new: bool,
    ) -> Result<Vec<Listing>> {
        let docs = self.listings.list(object_id(id)?, only_new).await?;
        Ok(docs.into_iter().map(Listing::from).collect())
    }
}

// =============================================================================
// Test utilities
// =============================================================================
