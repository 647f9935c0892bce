//! Contracts for the collaborators the extraction runtime drives, plus
//! fixture-first implementations used for replays and tests.
//!
//! Site-specific HTML/JSON parsers and the real HTTP layer live outside this
//! workspace; they plug in through [`SiteParser`] and [`PageFetcher`].

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deckhive_core::Record;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "deckhive-adapters";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedPage {
    pub url: String,
    pub content_type: String,
    pub body: Vec<u8>,
    pub fetched_at: DateTime<Utc>,
    /// Served from a local cache rather than the origin.
    #[serde(default)]
    pub from_cache: bool,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("no page available for {url}")]
    Missing { url: String },
    #[error("fetching {url}: {message}")]
    Transport { url: String, message: String },
}

#[derive(Debug, Error)]
pub enum ParseError {
    #[error("{source_id}: malformed page {url}: {message}")]
    Malformed {
        source_id: String,
        url: String,
        message: String,
    },
    #[error("{source_id}: invalid json in {url}: {error}")]
    Json {
        source_id: String,
        url: String,
        #[source]
        error: serde_json::Error,
    },
}

/// Produces raw pages for task URLs. Retries and rate limiting are the implementor's concern.
#[async_trait]
pub trait PageFetcher: Send + Sync {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError>;
}

/// Pure page-to-record conversion for one data source.
pub trait SiteParser: Send + Sync {
    fn source_id(&self) -> &str;

    fn parse(&self, page: &FetchedPage) -> Result<Record, ParseError>;
}

/// Parser for sources whose pages already carry a JSON-encoded [`Record`]
/// (API endpoints and previously exported corpora).
#[derive(Debug, Clone)]
pub struct JsonRecordParser {
    source_id: String,
}

impl JsonRecordParser {
    pub fn new(source_id: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
        }
    }
}

impl SiteParser for JsonRecordParser {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn parse(&self, page: &FetchedPage) -> Result<Record, ParseError> {
        if page.body.iter().all(u8::is_ascii_whitespace) {
            return Err(ParseError::Malformed {
                source_id: self.source_id.clone(),
                url: page.url.clone(),
                message: "empty body".to_string(),
            });
        }
        let mut record: Record =
            serde_json::from_slice(&page.body).map_err(|error| ParseError::Json {
                source_id: self.source_id.clone(),
                url: page.url.clone(),
                error,
            })?;
        if record.source.trim().is_empty() {
            record.source = self.source_id.clone();
        }
        if record.url.trim().is_empty() {
            record.url = page.url.clone();
        }
        Ok(record)
    }
}

/// One captured page in a fixture manifest; the body is either inline or a
/// path relative to the manifest.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixturePage {
    pub url: String,
    #[serde(default = "default_content_type")]
    pub content_type: String,
    #[serde(default)]
    pub path: Option<String>,
    #[serde(default)]
    pub inline_text: Option<String>,
    #[serde(default)]
    pub from_cache: bool,
}

fn default_content_type() -> String {
    "application/json".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureManifest {
    pub fetched_at: DateTime<Utc>,
    pub pages: Vec<FixturePage>,
}

/// Serves captured pages instead of hitting the network.
#[derive(Debug, Default)]
pub struct FixtureFetcher {
    pages: HashMap<String, FetchedPage>,
    fetches: AtomicUsize,
}

impl FixtureFetcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page(self, url: &str, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.insert_page(url, content_type, body.into(), false)
    }

    /// Like [`FixtureFetcher::with_page`], but the page reports a cache hit.
    pub fn with_cached_page(self, url: &str, content_type: &str, body: impl Into<Vec<u8>>) -> Self {
        self.insert_page(url, content_type, body.into(), true)
    }

    fn insert_page(mut self, url: &str, content_type: &str, body: Vec<u8>, from_cache: bool) -> Self {
        self.pages.insert(
            url.to_string(),
            FetchedPage {
                url: url.to_string(),
                content_type: content_type.to_string(),
                body,
                fetched_at: Utc::now(),
                from_cache,
            },
        );
        self
    }

    /// Loads every page listed in a fixture manifest, hydrating file-backed bodies.
    pub fn from_manifest(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let manifest: FixtureManifest = read_json_file(path)?;
        let base = path.parent().unwrap_or_else(|| Path::new("."));

        let mut pages = HashMap::with_capacity(manifest.pages.len());
        for page in manifest.pages {
            let body = match (&page.inline_text, &page.path) {
                (Some(text), _) => text.clone().into_bytes(),
                (None, Some(rel)) => {
                    let raw_path = base.join(rel);
                    fs::read(&raw_path)
                        .with_context(|| format!("reading fixture page {}", raw_path.display()))?
                }
                (None, None) => anyhow::bail!("fixture page {} has neither inline_text nor path", page.url),
            };
            pages.insert(
                page.url.clone(),
                FetchedPage {
                    url: page.url,
                    content_type: page.content_type,
                    body,
                    fetched_at: manifest.fetched_at,
                    from_cache: page.from_cache,
                },
            );
        }
        Ok(Self {
            pages,
            fetches: AtomicUsize::new(0),
        })
    }

    pub fn urls(&self) -> Vec<String> {
        let mut urls: Vec<_> = self.pages.keys().cloned().collect();
        urls.sort();
        urls
    }

    /// Number of fetches served (including misses).
    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl PageFetcher for FixtureFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchedPage, FetchError> {
        self.fetches.fetch_add(1, Ordering::Relaxed);
        self.pages.get(url).cloned().ok_or_else(|| FetchError::Missing {
            url: url.to_string(),
        })
    }
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(url: &str, body: &str) -> FetchedPage {
        FetchedPage {
            url: url.to_string(),
            content_type: "application/json".to_string(),
            body: body.as_bytes().to_vec(),
            fetched_at: Utc::now(),
            from_cache: false,
        }
    }

    #[test]
    fn json_parser_backfills_source_and_url() {
        let parser = JsonRecordParser::new("ygoprodeck");
        let record = parser
            .parse(&page(
                "https://ygoprodeck.example/deck/7",
                r#"{"id":"7","url":"","source":"","release_date":"2024-05-01T00:00:00Z",
                    "groups":[{"name":"Main","entries":[{"name":"Ash Blossom","count":3}]}]}"#,
            ))
            .expect("parse");
        assert_eq!(record.source, "ygoprodeck");
        assert_eq!(record.url, "https://ygoprodeck.example/deck/7");
        assert_eq!(record.groups[0].entries[0].count, 3);
    }

    #[test]
    fn json_parser_reports_malformed_pages() {
        let parser = JsonRecordParser::new("limitless-web");
        let empty = parser.parse(&page("https://x.example/1", "  ")).expect_err("empty");
        assert!(matches!(empty, ParseError::Malformed { .. }));
        let broken = parser.parse(&page("https://x.example/2", "{\"id\":")).expect_err("broken");
        assert!(broken.to_string().contains("invalid json in https://x.example/2"));
    }

    #[tokio::test]
    async fn fixture_manifest_hydrates_file_pages() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::write(dir.path().join("deck-2.json"), r#"{"id":"2"}"#).expect("write page");
        fs::write(
            dir.path().join("pages.json"),
            r#"{"fetched_at":"2026-02-24T12:00:00Z","pages":[
                {"url":"https://a.example/1","inline_text":"{\"id\":\"1\"}"},
                {"url":"https://a.example/2","content_type":"text/json","path":"deck-2.json","from_cache":true}
            ]}"#,
        )
        .expect("write manifest");

        let fetcher = FixtureFetcher::from_manifest(dir.path().join("pages.json")).expect("load");
        assert_eq!(fetcher.urls(), vec!["https://a.example/1", "https://a.example/2"]);

        let second = fetcher.fetch("https://a.example/2").await.expect("fetch");
        assert_eq!(second.body, br#"{"id":"2"}"#);
        assert_eq!(second.content_type, "text/json");
        assert!(second.from_cache);
        assert!(!fetcher.fetch("https://a.example/1").await.expect("fetch").from_cache);
        assert!(matches!(
            fetcher.fetch("https://a.example/3").await,
            Err(FetchError::Missing { .. })
        ));
        assert_eq!(fetcher.fetches(), 3);
    }
}
