use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use chrono::Utc;
use scraper::{ElementRef, Html, Selector};

use crate::data_models::{Listing, RawFragment};
use crate::error::CrawlError;
use crate::marketplace::canonical_listing_url;
use crate::page::{PageStructure, Role};

const SPOOL_SEPARATOR: &str = "\n------------------\n";

/// Append-only sink for fragments that produced nothing usable.
#[derive(Debug, Clone)]
pub struct DiagnosticSpool {
    path: PathBuf,
}

impl DiagnosticSpool {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn append(&self, fragment: &RawFragment) -> Result<()> {
        let text = html2text::from_read(fragment.html().as_bytes(), 80)
            .unwrap_or_else(|_| fragment.html().to_string());
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open spool {}", self.path.display()))?;
        file.write_all(text.as_bytes())?;
        file.write_all(SPOOL_SEPARATOR.as_bytes())?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NormalizedBatch {
    /// Accepted listings; `position` is the 1-based rank among them.
    pub listings: Vec<Listing>,
    /// One `MalformedListing` per rejected fragment.
    pub rejected: Vec<CrawlError>,
}

struct Selectors {
    url: Selector,
    title: Selector,
    price: Selector,
    location: Selector,
    image: Selector,
}

impl Selectors {
    fn compile(structure: &PageStructure) -> Result<Self> {
        Ok(Self {
            url: structure.selector(Role::Url)?,
            title: structure.selector(Role::Title)?,
            price: structure.selector(Role::Price)?,
            location: structure.selector(Role::Location)?,
            image: structure.selector(Role::Image)?,
        })
    }
}

pub struct Normalizer<'a> {
    structure: &'a PageStructure,
    spool: Option<&'a DiagnosticSpool>,
}

impl<'a> Normalizer<'a> {
    pub fn new(structure: &'a PageStructure) -> Self {
        Self {
            structure,
            spool: None,
        }
    }

    pub fn with_spool(mut self, spool: Option<&'a DiagnosticSpool>) -> Self {
        self.spool = spool;
        self
    }

    /// Fails only when the configured selectors do not compile.
    pub fn normalize(&self, fragments: &[RawFragment]) -> Result<NormalizedBatch> {
        let selectors = Selectors::compile(self.structure)?;
        let observed_at = Utc::now();
        let mut batch = NormalizedBatch::default();

        for (index, fragment) in fragments.iter().enumerate() {
            match self.normalize_one(&selectors, index, fragment) {
                Ok(mut listing) => {
                    listing.position = batch.listings.len() as u32 + 1;
                    listing.observed_at = observed_at;
                    log::debug!("found listing: {}", listing.label());
                    batch.listings.push(listing);
                }
                Err(rejection) => batch.rejected.push(rejection),
            }
        }

        log::info!(
            "parsed {} listings ({} rejected)",
            batch.listings.len(),
            batch.rejected.len()
        );
        Ok(batch)
    }

    fn normalize_one(
        &self,
        selectors: &Selectors,
        index: usize,
        fragment: &RawFragment,
    ) -> Result<Listing, CrawlError> {
        let document = Html::parse_fragment(fragment.html());

        // Unlinkable listings are useless, skip the remaining lookups.
        let Some(href) = document
            .select(&selectors.url)
            .find_map(|anchor| anchor.value().attr("href"))
        else {
            log::debug!("listing #{index} has no link, skipping");
            return Err(CrawlError::MalformedListing {
                index,
                reason: "missing url".to_string(),
            });
        };

        let url = canonical_listing_url(href);
        let title = first_text(&document, &selectors.title);
        let price = first_text(&document, &selectors.price);
        let location = first_text(&document, &selectors.location);
        let image = document
            .select(&selectors.image)
            .find_map(|img| img.value().attr("src"))
            .map(str::trim)
            .filter(|src| !src.is_empty())
            .map(str::to_string);

        let Some(url) = url else {
            let empty = title.is_none() && price.is_none() && location.is_none() && image.is_none();
            if empty {
                log::warn!("couldn't parse listing number {index}");
                self.spool(fragment);
            } else {
                log::warn!("listing #{index} has an unresolvable link {href:?}, skipping");
            }
            return Err(CrawlError::MalformedListing {
                index,
                reason: format!("unresolvable url {href:?}"),
            });
        };

        Ok(Listing {
            url,
            title,
            price,
            location,
            image,
            position: 0,
            is_new: false,
            observed_at: Utc::now(),
        })
    }

    fn spool(&self, fragment: &RawFragment) {
        if let Some(spool) = self.spool {
            if let Err(e) = spool.append(fragment) {
                log::warn!("could not spool failed listing: {:#}", e);
            }
        }
    }
}

fn first_text(document: &Html, selector: &Selector) -> Option<String> {
    document.select(selector).find_map(|element| {
        let text = collapse_whitespace(element);
        (!text.is_empty()).then_some(text)
    })
}

fn collapse_whitespace(element: ElementRef<'_>) -> String {
    element.text().flat_map(str::split_whitespace).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn structure() -> PageStructure {
        PageStructure {
            listing_container: "div.card".to_string(),
            title: "span.title".to_string(),
            price: "span.price".to_string(),
            location: "span.loc".to_string(),
            image: "img.photo".to_string(),
            url: "a.link".to_string(),
            ..PageStructure::default()
        }
    }

    fn fragment(html: &str) -> RawFragment {
        RawFragment(html.to_string())
    }

    #[test]
    fn full_listing_is_canonicalized() {
        let structure = structure();
        let batch = Normalizer::new(&structure)
            .normalize(&[fragment(
                r#"<div class="card">
                    <a class="link" href="/marketplace/item/42/?ref=search&tracking=abc">
                      <img class="photo" src="https://cdn.example/42.jpg">
                      <span class="price">$120</span>
                      <span class="title">  Road   bike </span>
                      <span class="loc">Seattle, WA</span>
                    </a>
                  </div>"#,
            )])
            .unwrap();

        assert!(batch.rejected.is_empty());
        let listing = &batch.listings[0];
        assert_eq!(listing.url, "https://www.facebook.com/marketplace/item/42/");
        assert_eq!(listing.title.as_deref(), Some("Road bike"));
        assert_eq!(listing.price.as_deref(), Some("$120"));
        assert_eq!(listing.location.as_deref(), Some("Seattle, WA"));
        assert_eq!(listing.image.as_deref(), Some("https://cdn.example/42.jpg"));
        assert_eq!(listing.position, 1);
        assert!(!listing.is_new);
    }

    #[test]
    fn missing_url_rejects_regardless_of_other_fields() {
        let structure = structure();
        let batch = Normalizer::new(&structure)
            .normalize(&[
                fragment(r#"<div class="card"><span class="title">No link</span><span class="price">$5</span></div>"#),
                fragment(r#"<div class="card"><a class="link" href="/marketplace/item/7/"></a></div>"#),
            ])
            .unwrap();

        assert_eq!(batch.listings.len(), 1);
        assert_eq!(batch.listings[0].url, "https://www.facebook.com/marketplace/item/7/");
        assert_eq!(batch.listings[0].title, None);
        assert!(matches!(
            batch.rejected[0],
            CrawlError::MalformedListing { index: 0, .. }
        ));
    }

    #[test]
    fn positions_follow_accepted_order() {
        let structure = structure();
        let batch = Normalizer::new(&structure)
            .normalize(&[
                fragment(r#"<div class="card"><a class="link" href="/marketplace/item/1/">a</a></div>"#),
                fragment(r#"<div class="card"><span class="title">orphan</span></div>"#),
                fragment(r#"<div class="card"><a class="link" href="/marketplace/item/3/">c</a></div>"#),
            ])
            .unwrap();

        let ranks: Vec<_> = batch.listings.iter().map(|l| (l.url.as_str(), l.position)).collect();
        assert_eq!(
            ranks,
            vec![
                ("https://www.facebook.com/marketplace/item/1/", 1),
                ("https://www.facebook.com/marketplace/item/3/", 2),
            ]
        );
    }

    #[test]
    fn empty_fragment_with_blank_link_is_spooled() {
        let dir = tempfile::tempdir().unwrap();
        let spool = DiagnosticSpool::new(dir.path().join("failed_listing.txt"));
        let structure = structure();

        let batch = Normalizer::new(&structure)
            .with_spool(Some(&spool))
            .normalize(&[fragment(
                r#"<div class="card"><a class="link" href="  ">nothing here</a></div>"#,
            )])
            .unwrap();

        assert!(batch.listings.is_empty());
        assert_eq!(batch.rejected.len(), 1);
        let spooled = std::fs::read_to_string(dir.path().join("failed_listing.txt")).unwrap();
        assert!(spooled.contains("nothing here"));
        assert!(spooled.contains("------------------"));
    }
}
