use axum::{Router, routing::get};
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use crate::crawler::CrawlRunner;

pub mod handlers;
pub mod models;

pub fn create_router(runner: Arc<dyn CrawlRunner>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/", get(handlers::root_handler))
        .route(
            "/crawl_facebook_marketplace",
            get(handlers::crawl_marketplace_handler),
        )
        .with_state(runner)
        .layer(cors)
}
