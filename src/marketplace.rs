//! Marketplace constants and search URL construction.

use anyhow::Result;
use reqwest::Url;

use crate::data_models::SearchIdentity;

pub const MARKETPLACE_ORIGIN: &str = "https://www.facebook.com";

/// Category segment used for a plain text search.
pub const SEARCH_CATEGORY: &str = "search";

/// City slugs from the marketplace's US directory.
pub const CITIES: &[&str] = &[
    "nyc",
    "la",
    "vegas",
    "chicago",
    "houston",
    "sanantonio",
    "miami",
    "orlando",
    "sandiego",
    "arlington",
    "baltimore",
    "cincinnati",
    "denver",
    "fortworth",
    "jacksonville",
    "memphis",
    "nashville",
    "philly",
    "portland",
    "sanjose",
    "tucson",
    "atlanta",
    "boston",
    "columbus",
    "detroit",
    "honolulu",
    "kansascity",
    "neworleans",
    "phoenix",
    "seattle",
    "dc",
    "milwaukee",
    "sac",
    "austin",
    "charlotte",
    "dallas",
    "elpaso",
    "indianapolis",
    "louisville",
    "minneapolis",
    "oklahoma",
    "pittsburgh",
    "sanfrancisco",
    "tampa",
];

pub const CONDITIONS: &[&str] = &["New", "Used - Like New", "Used - Good", "Used - Fair"];

pub fn is_supported_city(slug: &str) -> bool {
    CITIES.contains(&slug)
}

/// Slug for user input such as `" Seattle "`, if the city is supported.
pub fn city_slug(raw: &str) -> Option<String> {
    let slug = raw.trim().to_lowercase();
    is_supported_city(&slug).then_some(slug)
}

/// Entry of `CONDITIONS` matching `name`, ignoring case and surrounding space.
pub fn canonical_condition(name: &str) -> Option<&'static str> {
    let name = name.trim();
    CONDITIONS
        .iter()
        .copied()
        .find(|condition| condition.eq_ignore_ascii_case(name))
}

pub fn parse_conditions<'a>(names: impl IntoIterator<Item = &'a str>) -> Result<Vec<String>> {
    names
        .into_iter()
        .filter(|name| !name.trim().is_empty())
        .map(|name| {
            canonical_condition(name).map(str::to_string).ok_or_else(|| {
                anyhow::anyhow!(
                    "unknown condition {name:?}, expected one of: {}",
                    CONDITIONS.join(", ")
                )
            })
        })
        .collect()
}

impl SearchIdentity {
    /// Search page for this identity. `query` is already an encoded parameter string.
    pub fn search_url(&self) -> String {
        let mut url = format!(
            "{}/marketplace/{}/{}",
            MARKETPLACE_ORIGIN, self.location, self.category
        );
        if !self.query.is_empty() {
            url.push('?');
            url.push_str(&self.query);
        }
        url
    }
}

/// User-facing search options folded into the identity's `query` string.
#[derive(Debug, Clone, Default)]
pub struct SearchFilters {
    pub query: Option<String>,
    pub sort: Option<String>,
    pub min_price: Option<u32>,
    pub max_price: Option<u32>,
    /// Entries of `CONDITIONS`.
    pub conditions: Vec<String>,
}

impl SearchFilters {
    pub fn to_query_string(&self) -> String {
        let mut terms = Vec::new();
        if let Some(query) = self.query.as_deref().filter(|q| !q.is_empty()) {
            terms.push(format!("query={query}"));
        }
        if let Some(sort) = self.sort.as_deref().filter(|s| !s.is_empty()) {
            terms.push(format!("sortBy={sort}"));
        }
        if let Some(min) = self.min_price.filter(|m| *m > 0) {
            terms.push(format!("minPrice={min}"));
        }
        if let Some(max) = self.max_price {
            terms.push(format!("maxPrice={max}"));
        }
        if !self.conditions.is_empty() {
            let conditions = self
                .conditions
                .iter()
                .map(|c| c.replace(' ', "_").to_lowercase())
                .collect::<Vec<_>>()
                .join(",");
            terms.push(format!("itemCondition={conditions}"));
        }
        terms.join("&")
    }

    pub fn into_identity(self, location: &str, category: &str) -> SearchIdentity {
        SearchIdentity::new(location, category, self.to_query_string())
    }
}

/// Canonical absolute form of a listing link: query noise after `/?` is
/// dropped and the path gets a trailing slash. `None` when nothing is left.
pub fn canonical_listing_url(href: &str) -> Option<String> {
    let href = href.trim();
    let stripped = match href.find("/?") {
        Some(idx) => &href[..idx + 1],
        None => href,
    };
    if stripped.is_empty() {
        return None;
    }

    let base = Url::parse(MARKETPLACE_ORIGIN).ok()?;
    let mut url = base.join(stripped).ok()?;
    if url.scheme() != "http" && url.scheme() != "https" {
        return None;
    }
    url.set_query(None);
    url.set_fragment(None);
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Some(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn search_url_for_identity() {
        let identity = SearchIdentity::new("seattle", "search", "query=bike&maxPrice=300");
        assert_eq!(
            identity.search_url(),
            "https://www.facebook.com/marketplace/seattle/search?query=bike&maxPrice=300"
        );

        let bare = SearchIdentity::new("nyc", "vehicles", "");
        assert_eq!(
            bare.search_url(),
            "https://www.facebook.com/marketplace/nyc/vehicles"
        );
    }

    #[test]
    fn filters_build_query_string() {
        let filters = SearchFilters {
            query: Some("iphone".into()),
            sort: Some("creation_time_descend".into()),
            min_price: Some(0),
            max_price: Some(500),
            conditions: vec!["Used - Like New".into(), "New".into()],
        };
        assert_eq!(
            filters.to_query_string(),
            "query=iphone&sortBy=creation_time_descend&maxPrice=500&itemCondition=used_-_like_new,new"
        );
        assert_eq!(SearchFilters::default().to_query_string(), "");
    }

    #[test]
    fn canonical_url_strips_tracking_noise() {
        assert_eq!(
            canonical_listing_url("/marketplace/item/123456/?ref=search&referral_code=x").as_deref(),
            Some("https://www.facebook.com/marketplace/item/123456/")
        );
        assert_eq!(
            canonical_listing_url("/marketplace/item/99").as_deref(),
            Some("https://www.facebook.com/marketplace/item/99/")
        );
        assert_eq!(
            canonical_listing_url("https://www.facebook.com/marketplace/item/7/").as_deref(),
            Some("https://www.facebook.com/marketplace/item/7/")
        );
        assert_eq!(canonical_listing_url("   "), None);
        assert_eq!(canonical_listing_url("javascript:void(0)"), None);
    }

    #[test]
    fn supported_cities() {
        assert!(is_supported_city("seattle"));
        assert!(!is_supported_city("Seattle"));
        assert!(!is_supported_city("atlantis"));
    }

    #[test]
    fn conditions_are_validated_and_canonicalized() {
        assert_eq!(canonical_condition(" used - good "), Some("Used - Good"));
        assert_eq!(canonical_condition("mint"), None);

        let parsed = parse_conditions(["new", "", "USED - LIKE NEW"]).unwrap();
        assert_eq!(parsed, vec!["New", "Used - Like New"]);

        let err = parse_conditions(["new", "broken"]).unwrap_err();
        assert!(err.to_string().contains("\"broken\""));
    }

    #[test]
    fn city_slug_requires_a_supported_city() {
        assert_eq!(city_slug(" Seattle ").as_deref(), Some("seattle"));
        assert_eq!(city_slug("atlantis"), None);
    }
}
