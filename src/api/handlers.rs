use axum::{
    Json,
    extract::{Query, State},
    http::StatusCode,
};
use std::sync::Arc;
use std::time::Instant;

use crate::crawler::CrawlRunner;
use crate::error::CrawlError;
use crate::marketplace::{SEARCH_CATEGORY, SearchFilters, city_slug, parse_conditions};

use super::models::{CrawlRequest, CrawlResponse};

pub async fn root_handler() -> &'static str {
    "Welcome to marketscout. Try /crawl_facebook_marketplace?city=nyc&query=bike"
}

pub async fn crawl_marketplace_handler(
    State(runner): State<Arc<dyn CrawlRunner>>,
    Query(request): Query<CrawlRequest>,
) -> Result<Json<CrawlResponse>, (StatusCode, String)> {
    let start = Instant::now();

    let Some(city) = city_slug(&request.city) else {
        return Err((StatusCode::NOT_FOUND, format!("Unknown city: {}", request.city)));
    };
    let conditions = parse_conditions(request.condition.as_deref().unwrap_or("").split(','))
        .map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let category = request
        .category
        .as_deref()
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(SEARCH_CATEGORY)
        .to_string();

    let identity = SearchFilters {
        query: request.query.map(|q| q.trim().to_string()),
        sort: request.sort,
        min_price: request.min_price,
        max_price: request.max_price,
        conditions,
    }
    .into_identity(&city, &category);

    let outcome = runner.crawl(&identity).await.map_err(error_response)?;
    log::info!(
        "[{}] served {} listings ({} new) in {}ms",
        outcome.crawl_id,
        outcome.listings.len(),
        outcome.new_listings.len(),
        start.elapsed().as_millis()
    );

    Ok(Json(CrawlResponse {
        crawl_id: outcome.crawl_id,
        listings: outcome.listings,
        new_listings: outcome.new_listings,
    }))
}

fn error_response(error: CrawlError) -> (StatusCode, String) {
    let status = if error.is_auth() {
        StatusCode::UNAUTHORIZED
    } else {
        StatusCode::INTERNAL_SERVER_ERROR
    };
    log::error!("crawl request failed: {error}");
    (status, error.to_string())
}
