use crate::config::PipelineConfig;
use crate::metrics;
use crate::models::Candidate;
use crate::search::authority;
use once_cell::sync::Lazy;
use reqwest::Client;
use scraper::{Html, Selector};
use serde::Deserialize;
use std::{collections::HashSet, time::Duration};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Hosts that only ever serve search-engine thumbnails.
pub const THUMBNAIL_HOSTS: &[&str] = &[
    "encrypted-tbn0.gstatic.com",
    "tse1.mm.bing.net",
    "tse2.mm.bing.net",
    "tse3.mm.bing.net",
    "tse4.mm.bing.net",
];

const LARGE_PHOTO_FILTER: &str = "%2Bfilterui%3Aimagesize-large%2Bfilterui%3Aphoto-photo";

static RESULT_ANCHORS: Lazy<Selector> =
    Lazy::new(|| Selector::parse("a.iusc, a.iuscp").expect("static selector"));
static INLINE_IMAGES: Lazy<Selector> =
    Lazy::new(|| Selector::parse("img").expect("static selector"));

#[derive(Debug, Error)]
pub enum SearchError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("HTTP {0}")]
    Status(u16),
}

/// Per-result metadata blob carried by the structured backend.
#[derive(Debug, Deserialize)]
struct ResultMetadata {
    #[serde(default)]
    murl: Option<String>,
    #[serde(default)]
    murl2: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Accepted,
    NotWeb,
    Thumbnail,
    OffScope,
    Duplicate,
    Full,
}

/// Filtered, deduplicated, capped candidate list for one search attempt.
#[derive(Debug)]
pub struct CandidateSet {
    cap: usize,
    allowed_host: Option<String>,
    seen: HashSet<String>,
    items: Vec<Candidate>,
}

impl CandidateSet {
    pub fn new(cap: usize, scope: Option<&str>) -> Self {
        Self {
            cap,
            allowed_host: scope.and_then(authority),
            seen: HashSet::new(),
            items: Vec::new(),
        }
    }

    pub fn offer(&mut self, raw: &str) -> Admission {
        if self.is_full() {
            return Admission::Full;
        }
        let url = raw.trim();
        if !(url.starts_with("http://") || url.starts_with("https://")) {
            return Admission::NotWeb;
        }
        let Some(host) = authority(url) else {
            return Admission::NotWeb;
        };
        if THUMBNAIL_HOSTS.contains(&host.as_str()) {
            debug!(target = "imagery.search", url = %url, "thumbnail_host_skipped");
            metrics::candidate_rejected("thumbnail_host");
            return Admission::Thumbnail;
        }
        if let Some(allowed) = &self.allowed_host
            && host != *allowed
        {
            debug!(target = "imagery.search", host = %host, expected = %allowed, "off_scope_host_skipped");
            metrics::candidate_rejected("off_scope_host");
            return Admission::OffScope;
        }
        if !self.seen.insert(url.to_string()) {
            return Admission::Duplicate;
        }
        if self.items.len() < 5 {
            debug!(target = "imagery.search", url = %url, "candidate");
        }
        self.items.push(Candidate {
            url: url.to_string(),
            host,
        });
        Admission::Accepted
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.cap
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn into_candidates(self) -> Vec<Candidate> {
        self.items
    }
}

#[derive(Clone)]
pub struct CandidateExtractor {
    http: Client,
    structured_url: String,
    inline_url: String,
    cap: usize,
    timeout: Duration,
}

impl CandidateExtractor {
    pub fn new(http: Client, config: &PipelineConfig) -> Self {
        Self {
            http,
            structured_url: config.structured_search_url.clone(),
            inline_url: config.inline_search_url.clone(),
            cap: config.max_candidates,
            timeout: config.search_timeout,
        }
    }

    pub fn structured_search_url(&self, query: &str) -> String {
        format!(
            "{}{}q={}&qft={}",
            self.structured_url,
            query_separator(&self.structured_url),
            urlencoding::encode(query),
            LARGE_PHOTO_FILTER
        )
    }

    pub fn inline_search_url(&self, query: &str) -> String {
        format!(
            "{}{}tbm=isch&q={}",
            self.inline_url,
            query_separator(&self.inline_url),
            urlencoding::encode(query)
        )
    }

    /// Runs `query` against both backends. `scope` restricts candidates to one host.
    /// Backend failures are logged and never abort the other backend.
    pub async fn extract(&self, query: &str, scope: Option<&str>) -> Vec<Candidate> {
        let mut set = CandidateSet::new(self.cap, scope);
        info!(
            target = "imagery.search",
            query = %query,
            scope = scope.unwrap_or("-"),
            "search_started"
        );

        match self.fetch_page(&self.structured_search_url(query)).await {
            Ok(body) => {
                for url in parse_structured_results(&body) {
                    set.offer(&url);
                    if set.is_full() {
                        break;
                    }
                }
            }
            Err(err) => {
                warn!(target = "imagery.search", backend = "structured", error = %err, "search_backend_failed");
            }
        }

        if !set.is_full() {
            match self.fetch_page(&self.inline_search_url(query)).await {
                Ok(body) => {
                    for url in parse_inline_images(&body) {
                        set.offer(&url);
                        if set.is_full() {
                            break;
                        }
                    }
                }
                Err(err) => {
                    warn!(target = "imagery.search", backend = "inline", error = %err, "search_backend_failed");
                }
            }
        }

        info!(
            target = "imagery.search",
            selected = set.len(),
            scope = scope.unwrap_or("-"),
            "candidates_selected"
        );
        set.into_candidates()
    }

    async fn fetch_page(&self, url: &str) -> Result<String, SearchError> {
        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|err| SearchError::Request(err.to_string()))?;
        if !response.status().is_success() {
            return Err(SearchError::Status(response.status().as_u16()));
        }
        response
            .text()
            .await
            .map_err(|err| SearchError::Request(err.to_string()))
    }
}

/// Full-size URLs from the structured backend's per-result metadata.
pub fn parse_structured_results(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(&RESULT_ANCHORS)
        .filter_map(|anchor| {
            let raw = anchor
                .value()
                .attr("m")
                .or_else(|| anchor.value().attr("mad"))?;
            let meta: ResultMetadata = serde_json::from_str(raw).ok()?;
            meta.murl.or(meta.murl2)
        })
        .collect()
}

/// Inline image references from the fallback backend.
pub fn parse_inline_images(html: &str) -> Vec<String> {
    let document = Html::parse_document(html);
    document
        .select(&INLINE_IMAGES)
        .filter_map(|img| {
            img.value()
                .attr("src")
                .or_else(|| img.value().attr("data-src"))
                .map(str::to_string)
        })
        .collect()
}

fn query_separator(base: &str) -> char {
    if base.contains('?') { '&' } else { '?' }
}
