use serde::{Deserialize, Serialize};

use crate::data_models::Listing;

#[derive(Debug, Deserialize)]
pub struct CrawlRequest {
    pub city: String,
    pub category: Option<String>,
    pub query: Option<String>,
    pub sort: Option<String>,
    pub min_price: Option<u32>,
    pub max_price: Option<u32>,
    /// Comma-separated item conditions, e.g. `New,Used - Good`.
    pub condition: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CrawlResponse {
    pub crawl_id: String,
    pub listings: Vec<Listing>,
    pub new_listings: Vec<Listing>,
}
