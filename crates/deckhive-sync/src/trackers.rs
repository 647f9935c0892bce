//! Persistent timestamp ledgers deciding what to re-extract and re-export.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use deckhive_storage::{join_key, BlobStore, StorageError};
use parking_lot::RwLock;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;
use tracing::{debug, info};

pub const EXPORT_TRACKER_FILE: &str = ".export_tracker.json";
pub const INCREMENTAL_TRACKER_FILE: &str = ".incremental_tracker.json";

const RECENT_WINDOW_HOURS: i64 = 24;

#[derive(Debug, Error)]
pub enum TrackerError {
    #[error("checking {key}: {source}")]
    Check {
        key: String,
        #[source]
        source: StorageError,
    },
    #[error("reading {key}: {source}")]
    Read {
        key: String,
        #[source]
        source: StorageError,
    },
    #[error("parsing {key}: {source}")]
    Parse {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serializing {key}: {source}")]
    Serialize {
        key: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("writing {key}: {source}")]
    Write {
        key: String,
        #[source]
        source: StorageError,
    },
}

/// Reads a JSON state blob. A missing key is `Ok(None)`; anything else that
/// goes wrong is an error, never an empty state.
pub(crate) async fn load_json<T: DeserializeOwned>(
    store: &dyn BlobStore,
    key: &str,
) -> Result<Option<T>, TrackerError> {
    let exists = store.exists(key).await.map_err(|source| TrackerError::Check {
        key: key.to_string(),
        source,
    })?;
    if !exists {
        return Ok(None);
    }
    let bytes = store.read(key).await.map_err(|source| TrackerError::Read {
        key: key.to_string(),
        source,
    })?;
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| TrackerError::Parse {
            key: key.to_string(),
            source,
        })
}

pub(crate) async fn save_json<T: Serialize>(
    store: &dyn BlobStore,
    key: &str,
    value: &T,
) -> Result<(), TrackerError> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|source| TrackerError::Serialize {
        key: key.to_string(),
        source,
    })?;
    store.write(key, &bytes).await.map_err(|source| TrackerError::Write {
        key: key.to_string(),
        source,
    })
}

/// Key-to-timestamp map persisted as a single JSON object.
struct TimestampLedger {
    store: Arc<dyn BlobStore>,
    key: String,
    entries: RwLock<HashMap<String, DateTime<Utc>>>,
}

impl TimestampLedger {
    fn new(store: Arc<dyn BlobStore>, key: String) -> Self {
        Self {
            store,
            key,
            entries: RwLock::new(HashMap::new()),
        }
    }

    fn get(&self, key: &str) -> Option<DateTime<Utc>> {
        self.entries.read().get(key).copied()
    }

    fn set(&self, key: &str, at: DateTime<Utc>) {
        self.entries.write().insert(key.to_string(), at);
    }

    fn len(&self) -> usize {
        self.entries.read().len()
    }

    fn count_since(&self, cutoff: DateTime<Utc>) -> usize {
        self.entries.read().values().filter(|at| **at > cutoff).count()
    }

    async fn load(&self) -> Result<usize, TrackerError> {
        let loaded: HashMap<String, DateTime<Utc>> =
            match load_json(self.store.as_ref(), &self.key).await? {
                Some(loaded) => loaded,
                None => {
                    debug!(key = %self.key, "no tracker state yet, starting empty");
                    HashMap::new()
                }
            };
        let count = loaded.len();
        *self.entries.write() = loaded;
        Ok(count)
    }

    async fn save(&self) -> Result<usize, TrackerError> {
        // Sorted copy so the lock is not held across the write.
        let snapshot: BTreeMap<String, DateTime<Utc>> = self
            .entries
            .read()
            .iter()
            .map(|(key, at)| (key.clone(), *at))
            .collect();
        save_json(self.store.as_ref(), &self.key, &snapshot).await?;
        Ok(snapshot.len())
    }
}

/// Remembers when each stored item was last exported.
pub struct ExportTracker {
    ledger: TimestampLedger,
}

impl ExportTracker {
    pub fn new(store: Arc<dyn BlobStore>, prefix: &str) -> Self {
        Self {
            ledger: TimestampLedger::new(store, join_key(prefix, EXPORT_TRACKER_FILE)),
        }
    }

    pub fn key(&self) -> &str {
        &self.ledger.key
    }

    /// True when the item was never exported, or changed after its last
    /// export. The record's own `updated_at` wins over the blob mtime.
    pub fn should_export(
        &self,
        key: &str,
        blob_modified: Option<DateTime<Utc>>,
        updated_at: Option<DateTime<Utc>>,
        version: Option<u32>,
    ) -> bool {
        let Some(last) = self.ledger.get(key) else {
            return true;
        };
        let changed = match (updated_at, blob_modified) {
            (Some(updated_at), _) => updated_at > last,
            (None, Some(modified)) => modified > last,
            (None, None) => false,
        };
        if !changed {
            debug!(key, ?version, last_exported = %last, "export up to date");
        }
        changed
    }

    pub fn mark_exported(&self, key: &str) {
        self.mark_exported_at(key, Utc::now());
    }

    pub fn mark_exported_at(&self, key: &str, at: DateTime<Utc>) {
        self.ledger.set(key, at);
    }

    pub fn last_exported(&self, key: &str) -> Option<DateTime<Utc>> {
        self.ledger.get(key)
    }

    /// `(total, exported in the last 24h)`.
    pub fn stats(&self) -> (usize, usize) {
        let cutoff = Utc::now() - chrono::Duration::hours(RECENT_WINDOW_HOURS);
        (self.ledger.len(), self.ledger.count_since(cutoff))
    }

    pub async fn load(&self) -> Result<(), TrackerError> {
        let count = self.ledger.load().await?;
        info!(key = %self.ledger.key, entries = count, "loaded export tracker");
        Ok(())
    }

    pub async fn save(&self) -> Result<(), TrackerError> {
        let count = self.ledger.save().await?;
        info!(key = %self.ledger.key, entries = count, "saved export tracker");
        Ok(())
    }
}

/// Remembers when each source URL was last extracted.
pub struct IncrementalTracker {
    ledger: TimestampLedger,
}

impl IncrementalTracker {
    pub fn new(store: Arc<dyn BlobStore>, prefix: &str) -> Self {
        Self {
            ledger: TimestampLedger::new(store, join_key(prefix, INCREMENTAL_TRACKER_FILE)),
        }
    }

    pub fn key(&self) -> &str {
        &self.ledger.key
    }

    /// Unseen URLs always extract. A zero `max_age` means "never refresh".
    pub fn should_extract(&self, url: &str, max_age: Duration) -> bool {
        let Some(last) = self.ledger.get(url) else {
            return true;
        };
        if max_age.is_zero() {
            return false;
        }
        // A timestamp in the future (clock skew) counts as fresh.
        match (Utc::now() - last).to_std() {
            Ok(elapsed) => elapsed > max_age,
            Err(_) => false,
        }
    }

    pub fn mark_extracted(&self, url: &str) {
        self.mark_extracted_at(url, Utc::now());
    }

    pub fn mark_extracted_at(&self, url: &str, at: DateTime<Utc>) {
        self.ledger.set(url, at);
    }

    pub fn last_seen(&self, url: &str) -> Option<DateTime<Utc>> {
        self.ledger.get(url)
    }

    pub fn len(&self) -> usize {
        self.ledger.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn load(&self) -> Result<(), TrackerError> {
        let count = self.ledger.load().await?;
        info!(key = %self.ledger.key, entries = count, "loaded incremental tracker");
        Ok(())
    }

    pub async fn save(&self) -> Result<(), TrackerError> {
        let count = self.ledger.save().await?;
        info!(key = %self.ledger.key, entries = count, "saved incremental tracker");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use deckhive_storage::MemoryBlobStore;

    fn ts(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, day, hour, 0, 0)
            .single()
            .expect("valid timestamp")
    }

    #[tokio::test]
    async fn export_decisions_follow_freshness_and_survive_reload() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let tracker = ExportTracker::new(Arc::clone(&store), "magic/goldfish");
        let key = "magic/goldfish/collections/d1.json";

        assert!(tracker.should_export(key, Some(ts(1, 0)), None, None));
        tracker.mark_exported_at(key, ts(2, 0));
        assert!(!tracker.should_export(key, Some(ts(1, 0)), None, Some(1)));
        assert!(tracker.should_export(key, Some(ts(3, 0)), None, None));
        // Record timestamp wins even when the blob looks old.
        assert!(tracker.should_export(key, Some(ts(1, 0)), Some(ts(2, 1)), None));
        assert!(!tracker.should_export(key, Some(ts(5, 0)), Some(ts(1, 0)), None));
        assert!(!tracker.should_export(key, None, None, None));

        tracker.save().await.expect("save");
        assert!(store.exists("magic/goldfish/.export_tracker.json").await.expect("exists"));

        let reloaded = ExportTracker::new(Arc::clone(&store), "magic/goldfish");
        reloaded.load().await.expect("load");
        assert_eq!(reloaded.last_exported(key), Some(ts(2, 0)));
        assert!(!reloaded.should_export(key, Some(ts(1, 0)), None, None));
    }

    #[tokio::test]
    async fn export_stats_split_recent_from_total() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let tracker = ExportTracker::new(store, "p");
        tracker.mark_exported_at("old", Utc::now() - chrono::Duration::days(3));
        tracker.mark_exported("fresh-a");
        tracker.mark_exported("fresh-b");
        assert_eq!(tracker.stats(), (3, 2));
    }

    #[tokio::test]
    async fn missing_state_loads_empty_but_corrupt_state_fails() {
        let store = MemoryBlobStore::new();
        store.write("p/.incremental_tracker.json", b"{not json").await.expect("seed");
        let store: Arc<dyn BlobStore> = Arc::new(store);

        let fresh = IncrementalTracker::new(Arc::clone(&store), "other");
        fresh.load().await.expect("missing file is empty");
        assert!(fresh.is_empty());

        let corrupt = IncrementalTracker::new(store, "p");
        assert!(matches!(corrupt.load().await, Err(TrackerError::Parse { .. })));
    }

    #[tokio::test]
    async fn incremental_freshness_window() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let tracker = IncrementalTracker::new(store, "pokemon/limitless");
        let hour = Duration::from_secs(3600);

        assert!(tracker.should_extract("https://a", hour));
        tracker.mark_extracted("https://a");
        assert!(!tracker.should_extract("https://a", hour));
        assert!(!tracker.should_extract("https://a", Duration::ZERO));

        tracker.mark_extracted_at("https://b", Utc::now() - chrono::Duration::hours(2));
        assert!(tracker.should_extract("https://b", hour));
        assert!(!tracker.should_extract("https://b", Duration::ZERO));

        tracker.mark_extracted_at("https://c", Utc::now() + chrono::Duration::hours(1));
        assert!(!tracker.should_extract("https://c", hour));
        assert_eq!(tracker.len(), 3);
    }

    #[tokio::test]
    async fn incremental_state_round_trips_through_the_store() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::new());
        let tracker = IncrementalTracker::new(Arc::clone(&store), "pokemon/limitless");
        tracker.mark_extracted_at("https://a", ts(4, 12));
        tracker.save().await.expect("save");

        let reloaded = IncrementalTracker::new(store, "pokemon/limitless");
        reloaded.load().await.expect("load");
        assert_eq!(reloaded.last_seen("https://a"), Some(ts(4, 12)));
    }
}
