//! Best-effort catalog lookup: maps a free-text query onto a store listing
//! so the fetch service gets a real package id. Failures here never fail a
//! request; callers fall back to the raw query.

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use url::Url;

use crate::http_client;
use crate::normalize::collapse_whitespace;

static DETAIL_LINK: Lazy<Selector> = Lazy::new(|| {
    Selector::parse(r#"a[href*="/store/apps/details?id="]"#).expect("detail link selector")
});
static IMAGE: Lazy<Selector> = Lazy::new(|| Selector::parse("img").expect("image selector"));
static RATED: Lazy<Selector> =
    Lazy::new(|| Selector::parse(r#"[aria-label*="Rated"]"#).expect("rating selector"));
static RATING_VALUE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(\d+(?:[.,]\d+)?)").expect("rating regex"));

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogHit {
    pub detail_url: String,
    pub title: Option<String>,
    pub icon_url: Option<String>,
    pub rating: Option<String>,
}

impl CatalogHit {
    pub fn package_id(&self) -> Option<String> {
        extract_package_id(&self.detail_url)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("catalog request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("catalog returned HTTP {0}")]
    Status(u16),
    #[error("invalid catalog url: {0}")]
    Url(#[from] url::ParseError),
}

#[async_trait]
pub trait CatalogProvider: Send + Sync {
    async fn search_one(&self, term: &str) -> Result<Option<CatalogHit>, CatalogError>;
}

/// Lookups are switched off; every query goes to the fetch service verbatim.
pub struct DisabledCatalog;

#[async_trait]
impl CatalogProvider for DisabledCatalog {
    async fn search_one(&self, _term: &str) -> Result<Option<CatalogHit>, CatalogError> {
        Ok(None)
    }
}

/// Scrapes the public Play Store search page.
pub struct PlayStoreCatalog {
    base_url: Url,
    http: reqwest::Client,
}

impl PlayStoreCatalog {
    pub fn new(base_url: &str, timeout: std::time::Duration) -> Result<Self, CatalogError> {
        let http = http_client::browser_builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: Url::parse(base_url)?,
            http,
        })
    }
}

#[async_trait]
impl CatalogProvider for PlayStoreCatalog {
    async fn search_one(&self, term: &str) -> Result<Option<CatalogHit>, CatalogError> {
        let mut url = self.base_url.join("/store/search")?;
        url.query_pairs_mut()
            .append_pair("q", term)
            .append_pair("c", "apps")
            .append_pair("hl", "en");
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(CatalogError::Status(status.as_u16()));
        }
        let html = response.text().await?;
        Ok(parse_search_page(&html, &self.base_url))
    }
}

fn element_text(element: &ElementRef<'_>) -> Option<String> {
    let text = collapse_whitespace(&element.text().collect::<Vec<_>>().join(" "));
    (!text.is_empty()).then_some(text)
}

fn image_source(element: &ElementRef<'_>, base: &Url) -> Option<String> {
    element.select(&IMAGE).find_map(|img| {
        let raw = img
            .value()
            .attr("src")
            .or_else(|| img.value().attr("data-src"))?;
        base.join(raw).ok().map(String::from)
    })
}

/// First app listing on a search results page.
pub fn parse_search_page(html: &str, base: &Url) -> Option<CatalogHit> {
    let document = Html::parse_document(html);
    let anchors: Vec<ElementRef<'_>> = document.select(&DETAIL_LINK).collect();
    let first_href = anchors.first()?.value().attr("href")?;
    let detail_url = base.join(first_href).ok()?;
    let same_listing = || {
        anchors
            .iter()
            .filter(move |a| a.value().attr("href") == Some(first_href))
    };

    let title = same_listing().find_map(|a| {
        element_text(a).or_else(|| a.value().attr("aria-label").map(collapse_whitespace))
    });
    let icon_url = same_listing().find_map(|a| image_source(a, base));
    let rating = document.select(&RATED).find_map(|el| {
        let label = el.value().attr("aria-label")?;
        RATING_VALUE
            .captures(label)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().replace(',', "."))
    });

    Some(CatalogHit {
        detail_url: detail_url.into(),
        title,
        icon_url,
        rating,
    })
}

/// Package id from a listing URL's `id` parameter; must look like a dotted
/// Android package name.
pub fn extract_package_id(detail_url: &str) -> Option<String> {
    let parsed = Url::parse(detail_url)
        .or_else(|_| Url::parse("https://play.google.com")?.join(detail_url))
        .ok()?;
    parsed
        .query_pairs()
        .find(|(key, _)| key == "id")
        .map(|(_, value)| value.trim().to_string())
        .filter(|id| id.contains('.') && !id.starts_with('.') && !id.ends_with('.'))
}
