//! Core deck model, name normalization, canonicalization and content fingerprints.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

mod canonical;
mod fingerprint;
mod normalize;

pub use canonical::{Canonicalized, ValidationError};
pub use fingerprint::compute_fingerprint;
pub use normalize::{is_valid_name, normalize_name};

pub const CRATE_NAME: &str = "deckhive-core";

/// A single named card line inside a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Entry {
    pub name: String,
    pub count: u32,
}

impl Entry {
    pub fn new(name: impl Into<String>, count: u32) -> Self {
        Self {
            name: name.into(),
            count,
        }
    }
}

/// Named partition of a record ("Main", "Sideboard", ...).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: String,
    #[serde(default)]
    pub entries: Vec<Entry>,
}

impl Group {
    pub fn new(name: impl Into<String>, entries: Vec<Entry>) -> Self {
        Self {
            name: name.into(),
            entries,
        }
    }
}

/// Descriptive metadata that does not take part in the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct RecordMeta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub archetype: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub placement: Option<u32>,
}

/// One deck/cube/set-like grouping scraped from a source.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub url: String,
    pub source: String,
    pub release_date: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
    #[serde(default)]
    pub meta: RecordMeta,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
}

impl Record {
    /// Returns the content fingerprint, computing and caching it on first use.
    ///
    /// Only meaningful after [`Record::canonicalize`] succeeded; canonicalizing
    /// again drops the cached value.
    pub fn fingerprint(&mut self) -> &str {
        if self.content_hash.is_none() {
            self.content_hash = Some(compute_fingerprint(self));
        }
        self.content_hash.as_deref().unwrap_or_default()
    }

    pub fn entry_count(&self) -> usize {
        self.groups.iter().map(|g| g.entries.len()).sum()
    }

    /// Timestamp used for export freshness: `updated_at`, else `release_date`.
    pub fn freshness(&self) -> Option<DateTime<Utc>> {
        self.updated_at.or(self.release_date)
    }
}
