use chrono::{DateTime, Utc};
use mongodb::bson::{DateTime as BsonDateTime, oid::ObjectId};
use serde::{Deserialize, Serialize};

/// The `(location, category, query)` triple that scopes a persisted listing set.
/// Compared exactly; callers normalize before constructing one.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchIdentity {
    pub location: String,
    pub category: String,
    pub query: String,
}

impl SearchIdentity {
    pub fn new(
        location: impl Into<String>,
        category: impl Into<String>,
        query: impl Into<String>,
    ) -> SearchIdentity {
        SearchIdentity {
            location: location.into(),
            category: category.into(),
            query: query.into(),
        }
    }
}

impl std::fmt::Display for SearchIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}?{}", self.location, self.category, self.query)
    }
}

/// Store-assigned key of a `SearchIdentity`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
pub struct SearchId(pub String);

impl std::fmt::Display for SearchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Per-listing DOM subtree (outer HTML) handed from the session to the normalizer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFragment(pub String);

impl RawFragment {
    pub fn html(&self) -> &str {
        &self.0
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Listing {
    pub url: String,
    pub title: Option<String>,
    pub price: Option<String>,
    pub location: Option<String>,
    pub image: Option<String>,
    /// 1-based rank in the crawl that last observed this listing.
    pub position: u32,
    pub is_new: bool,
    pub observed_at: DateTime<Utc>,
}

impl Listing {
    pub fn new(url: impl Into<String>, position: u32) -> Listing {
        Listing {
            url: url.into(),
            title: None,
            price: None,
            location: None,
            image: None,
            position,
            is_new: false,
            observed_at: Utc::now(),
        }
    }

    /// Short label used in logs and notification titles.
    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct SearchCriteriaDoc {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub location: String,
    pub category: String,
    pub query: String,
    pub created_at: BsonDateTime,
}

#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ListingDoc {
    #[serde(rename = "_id")]
    pub id: ObjectId,
    pub search_id: ObjectId,

    pub url: String,
    pub title: Option<String>,
    pub price: Option<String>,
    pub location: Option<String>,
    pub image: Option<String>,
    pub position: i64,
    pub is_new: bool,
    pub observed_at: BsonDateTime,
}

impl From<ListingDoc> for Listing {
    fn from(doc: ListingDoc) -> Listing {
        Listing {
            url: doc.url,
            title: doc.title,
            price: doc.price,
            location: doc.location,
            image: doc.image,
            position: u32::try_from(doc.position).unwrap_or(u32::MAX),
            is_new: doc.is_new,
            observed_at: DateTime::<Utc>::from_timestamp_millis(doc.observed_at.timestamp_millis())
                .unwrap_or_default(),
        }
    }
}

pub fn to_bson_datetime(at: DateTime<Utc>) -> BsonDateTime {
    BsonDateTime::from_millis(at.timestamp_millis())
}
