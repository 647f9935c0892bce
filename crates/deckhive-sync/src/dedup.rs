//! Cross-source duplicate detection keyed by content fingerprint.

use std::collections::btree_map::Entry as MapEntry;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

use deckhive_core::Record;
use deckhive_storage::{join_key, BlobStore};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::trackers::{load_json, save_json, TrackerError};

pub const DEDUP_FILE: &str = ".deduplication.json";

/// Rank given to sources missing from the priority table.
pub const DEFAULT_SOURCE_RANK: u32 = 1;

const BUILTIN_PRIORITIES: &[(&str, u32)] = &[
    ("scryfall", 10),
    ("mtgtop8", 9),
    ("goldfish", 8),
    ("deckbox", 7),
    ("ygoprodeck", 6),
    ("limitless-web", 5),
    ("pokemoncard-io", 4),
];

/// One registered fingerprint. Canonical fields are fixed at first sighting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeckSignature {
    pub card_signature: String,
    pub sources: BTreeSet<String>,
    pub canonical_id: String,
    pub canonical_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupOutcome {
    pub is_duplicate: bool,
    pub canonical_id: String,
    pub canonical_url: String,
}

/// Static source ranking, optionally overridden from configuration.
#[derive(Debug, Clone)]
pub struct SourcePriority {
    ranks: HashMap<String, u32>,
}

impl Default for SourcePriority {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SourcePriority {
    pub fn builtin() -> Self {
        Self {
            ranks: BUILTIN_PRIORITIES
                .iter()
                .map(|(source, rank)| (source.to_string(), *rank))
                .collect(),
        }
    }

    /// Overrides win over the built-in table. A zero rank is lifted to the
    /// default so every source stays rankable.
    pub fn with_overrides(mut self, overrides: impl IntoIterator<Item = (String, u32)>) -> Self {
        for (source, rank) in overrides {
            self.ranks.insert(source, rank.max(DEFAULT_SOURCE_RANK));
        }
        self
    }

    pub fn rank(&self, source: &str) -> u32 {
        self.ranks.get(source).copied().unwrap_or(DEFAULT_SOURCE_RANK)
    }
}

pub struct DeduplicationRegistry {
    store: Arc<dyn BlobStore>,
    key: String,
    priority: SourcePriority,
    entries: RwLock<BTreeMap<String, DeckSignature>>,
}

impl DeduplicationRegistry {
    pub fn new(store: Arc<dyn BlobStore>, prefix: &str, priority: SourcePriority) -> Self {
        Self {
            store,
            key: join_key(prefix, DEDUP_FILE),
            priority,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// Registers the record's fingerprint, or joins its source to the
    /// existing entry and reports the canonical identity already on file.
    pub fn find_or_register(&self, record: &mut Record) -> DedupOutcome {
        let signature = record.fingerprint().to_string();

        // Fast path: known signature already listing this source.
        if let Some(existing) = self.entries.read().get(&signature) {
            if existing.sources.contains(&record.source) {
                return duplicate_of(existing);
            }
        }

        // Re-check under the write lock; a concurrent caller may have won.
        let mut entries = self.entries.write();
        match entries.entry(signature) {
            MapEntry::Occupied(mut slot) => {
                let existing = slot.get_mut();
                if existing.sources.insert(record.source.clone()) {
                    debug!(
                        signature = %existing.card_signature,
                        source = %record.source,
                        canonical_id = %existing.canonical_id,
                        "duplicate deck seen on new source"
                    );
                }
                duplicate_of(existing)
            }
            MapEntry::Vacant(slot) => {
                let card_signature = slot.key().clone();
                slot.insert(DeckSignature {
                    card_signature,
                    sources: BTreeSet::from([record.source.clone()]),
                    canonical_id: record.id.clone(),
                    canonical_url: record.url.clone(),
                });
                DedupOutcome {
                    is_duplicate: false,
                    canonical_id: record.id.clone(),
                    canonical_url: record.url.clone(),
                }
            }
        }
    }

    /// Highest-ranked source registered for `signature`. Equal ranks resolve
    /// to the lexically smallest source id.
    pub fn get_canonical_source(&self, signature: &str) -> Option<String> {
        let entries = self.entries.read();
        let entry = entries.get(signature)?;
        // `sources` iterates in ascending order, so strict `>` keeps the
        // smallest id among equal ranks.
        let mut best: Option<(&String, u32)> = None;
        for source in &entry.sources {
            let rank = self.priority.rank(source);
            if best.map_or(true, |(_, top)| rank > top) {
                best = Some((source, rank));
            }
        }
        best.map(|(source, _)| source.clone())
    }

    pub fn get(&self, signature: &str) -> Option<DeckSignature> {
        self.entries.read().get(signature).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Signatures reported by more than one source.
    pub fn cross_source_count(&self) -> usize {
        self.entries
            .read()
            .values()
            .filter(|entry| entry.sources.len() > 1)
            .count()
    }

    pub async fn load(&self) -> Result<(), TrackerError> {
        let loaded: BTreeMap<String, DeckSignature> =
            match load_json(self.store.as_ref(), &self.key).await? {
                Some(loaded) => loaded,
                None => {
                    debug!(key = %self.key, "no dedup registry yet, starting empty");
                    BTreeMap::new()
                }
            };
        let count = loaded.len();
        *self.entries.write() = loaded;
        info!(key = %self.key, entries = count, "loaded dedup registry");
        Ok(())
    }

    pub async fn save(&self) -> Result<(), TrackerError> {
        let snapshot = self.entries.read().clone();
        save_json(self.store.as_ref(), &self.key, &snapshot).await?;
        info!(key = %self.key, entries = snapshot.len(), "saved dedup registry");
        Ok(())
    }
}

fn duplicate_of(entry: &DeckSignature) -> DedupOutcome {
    DedupOutcome {
        is_duplicate: true,
        canonical_id: entry.canonical_id.clone(),
        canonical_url: entry.canonical_url.clone(),
    }
}
