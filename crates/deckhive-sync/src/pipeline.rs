//! Extraction run: task URL -> fetch -> parse -> canonicalize -> dedup -> store.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use deckhive_adapters::{PageFetcher, SiteParser};
use deckhive_core::Record;
use deckhive_storage::{join_key, BlobStore};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::SyncConfig;
use crate::dedup::DeduplicationRegistry;
use crate::executor::{deserialize_record, Executor, ExecutorError, Flow, RunReport, TaskError};
use crate::stats::{ExtractStats, ProgressReporter, StatsSnapshot};
use crate::trackers::IncrementalTracker;

pub const COLLECTIONS_DIR: &str = "collections";

#[derive(Debug, Clone, Serialize)]
pub struct ExtractionSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub report: RunReport,
    pub stats: StatsSnapshot,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DedupRebuild {
    pub records: usize,
    pub signatures: usize,
    pub duplicates: usize,
}

/// `<prefix>/collections/`, the listing prefix for stored records.
pub fn collections_prefix(prefix: &str) -> String {
    format!("{}/", join_key(prefix, COLLECTIONS_DIR))
}

/// Blob key for a record id.
///
/// Bytes outside `[A-Za-z0-9._-]`, `%` itself and a leading `.` are
/// percent-encoded, so distinct ids always map to distinct keys.
pub fn collection_key(prefix: &str, id: &str) -> String {
    let mut name = String::with_capacity(id.len());
    for (i, byte) in id.bytes().enumerate() {
        let safe = byte.is_ascii_alphanumeric() || matches!(byte, b'-' | b'_') || (byte == b'.' && i > 0);
        if safe {
            name.push(char::from(byte));
        } else {
            name.push_str(&format!("%{byte:02X}"));
        }
    }
    join_key(&collections_prefix(prefix), &format!("{name}.json"))
}

enum TaskSource {
    List(Vec<String>),
    Queue(mpsc::Receiver<String>),
}

pub struct ExtractionPipeline {
    config: SyncConfig,
    store: Arc<dyn BlobStore>,
    fetcher: Arc<dyn PageFetcher>,
    parser: Arc<dyn SiteParser>,
    dedup: Arc<DeduplicationRegistry>,
    incremental: Arc<IncrementalTracker>,
    stats: Arc<ExtractStats>,
}

impl ExtractionPipeline {
    pub fn new(
        config: SyncConfig,
        store: Arc<dyn BlobStore>,
        fetcher: Arc<dyn PageFetcher>,
        parser: Arc<dyn SiteParser>,
    ) -> Result<Self> {
        let priority = config.source_priority()?;
        let dedup = DeduplicationRegistry::new(Arc::clone(&store), &config.prefix, priority);
        let incremental = IncrementalTracker::new(Arc::clone(&store), &config.prefix);
        Ok(Self {
            config,
            store,
            fetcher,
            parser,
            dedup: Arc::new(dedup),
            incremental: Arc::new(incremental),
            stats: Arc::new(ExtractStats::new()),
        })
    }

    pub fn dedup(&self) -> &DeduplicationRegistry {
        &self.dedup
    }

    pub fn incremental(&self) -> &IncrementalTracker {
        &self.incremental
    }

    pub fn stats(&self) -> &ExtractStats {
        &self.stats
    }

    pub async fn run(&self, cancel: &CancellationToken, urls: Vec<String>) -> Result<ExtractionSummary> {
        self.drive(cancel, TaskSource::List(urls)).await
    }

    /// Runs against a live queue, e.g. fed by a page scroller discovering URLs.
    pub async fn run_queue(
        &self,
        cancel: &CancellationToken,
        urls: mpsc::Receiver<String>,
    ) -> Result<ExtractionSummary> {
        self.drive(cancel, TaskSource::Queue(urls)).await
    }

    async fn drive(&self, cancel: &CancellationToken, tasks: TaskSource) -> Result<ExtractionSummary> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let dataset = self.parser.source_id().to_string();
        info!(%run_id, dataset = %dataset, prefix = %self.config.prefix, "extraction started");

        self.dedup.load().await.context("loading dedup registry")?;
        self.incremental
            .load()
            .await
            .context("loading incremental tracker")?;

        let progress = Arc::new(ProgressReporter::new(dataset.clone(), self.config.progress_interval));
        let executor = Executor::new(self.config.parallel)?
            .with_stats(&dataset, Arc::clone(&self.stats))
            .with_progress(Arc::clone(&progress));

        let task = Arc::new(TaskContext {
            prefix: self.config.prefix.clone(),
            max_age: self.config.max_age,
            cancel: cancel.clone(),
            store: Arc::clone(&self.store),
            fetcher: Arc::clone(&self.fetcher),
            parser: Arc::clone(&self.parser),
            dedup: Arc::clone(&self.dedup),
            incremental: Arc::clone(&self.incremental),
            stats: Arc::clone(&self.stats),
        });
        let handler = move |url: String| {
            let task = Arc::clone(&task);
            async move { task.process(url).await }
        };
        let outcome = match tasks {
            TaskSource::List(urls) => executor.run_iter(cancel, urls, handler).await,
            TaskSource::Queue(rx) => executor.run(cancel, rx, handler).await,
        };

        // Trackers are saved whatever happened to the run.
        let dedup_saved = self.dedup.save().await;
        let incremental_saved = self.incremental.save().await;
        progress.final_report();
        info!(%run_id, dataset = %dataset, summary = %self.stats.summary(), "extraction finished");

        dedup_saved.context("saving dedup registry")?;
        incremental_saved.context("saving incremental tracker")?;
        let report = match outcome {
            Ok(report) => report,
            Err(ExecutorError::Cancelled { report }) => {
                warn!(%run_id, dispatched = report.dispatched, "extraction cancelled");
                anyhow::bail!("extraction {run_id} cancelled after {} tasks", report.dispatched);
            }
            Err(err) => return Err(err).context("running extraction tasks"),
        };

        Ok(ExtractionSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            report,
            stats: self.stats.snapshot(),
        })
    }
}

struct TaskContext {
    prefix: String,
    max_age: Duration,
    cancel: CancellationToken,
    store: Arc<dyn BlobStore>,
    fetcher: Arc<dyn PageFetcher>,
    parser: Arc<dyn SiteParser>,
    dedup: Arc<DeduplicationRegistry>,
    incremental: Arc<IncrementalTracker>,
    stats: Arc<ExtractStats>,
}

impl TaskContext {
    async fn process(&self, url: String) -> Result<Flow, TaskError> {
        if !self.incremental.should_extract(&url, self.max_age) {
            debug!(url = %url, "fresh, skipping");
            self.stats.record_skipped();
            return Ok(Flow::Continue);
        }

        let page = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(TaskError::Cancelled),
            page = self.fetcher.fetch(&url) => page?,
        };
        if page.from_cache {
            self.stats.record_cache_hit();
        } else {
            self.stats.record_cache_miss();
        }
        let mut record = self.parser.parse(&page)?;
        if record.source.is_empty() {
            record.source = self.parser.source_id().to_string();
        }
        if record.url.is_empty() {
            record.url = url.clone();
        }

        let changes = record.canonicalize()?;
        if changes.renamed > 0 {
            self.stats.record_normalized(changes.renamed);
        }

        let outcome = self.dedup.find_or_register(&mut record);
        if outcome.is_duplicate && outcome.canonical_id != record.id {
            debug!(
                url = %url,
                source = %record.source,
                canonical_id = %outcome.canonical_id,
                canonical_url = %outcome.canonical_url,
                "duplicate deck, canonical copy already stored"
            );
            self.stats.record_duplicate();
            self.incremental.mark_extracted(&url);
            return Ok(Flow::Continue);
        }

        self.write_record(&record).await?;
        self.incremental.mark_extracted(&url);
        Ok(Flow::Continue)
    }

    async fn write_record(&self, record: &Record) -> Result<(), TaskError> {
        let key = collection_key(&self.prefix, &record.id);
        let bytes = serde_json::to_vec_pretty(record).map_err(|source| TaskError::Encode {
            id: record.id.clone(),
            source,
        })?;
        self.store.write(&key, &bytes).await?;
        debug!(key = %key, entries = record.entry_count(), "stored record");
        Ok(())
    }
}

/// Rebuilds `<prefix>/.deduplication.json` from the stored collections,
/// discarding whatever registry was on file.
pub async fn rebuild_dedup_registry(
    cancel: &CancellationToken,
    store: Arc<dyn BlobStore>,
    config: &SyncConfig,
) -> Result<DedupRebuild> {
    let registry = Arc::new(DeduplicationRegistry::new(
        Arc::clone(&store),
        &config.prefix,
        config.source_priority()?,
    ));
    let stats = Arc::new(ExtractStats::new());
    let executor = Executor::new(config.parallel)?.with_stats("dedup-rebuild", Arc::clone(&stats));

    let prefix = collections_prefix(&config.prefix);
    let handler_registry = Arc::clone(&registry);
    let handler_stats = Arc::clone(&stats);
    let report = executor
        .iter_prefix(cancel, store, &prefix, deserialize_record, move |_key, mut record: Record| {
            let registry = Arc::clone(&handler_registry);
            let stats = Arc::clone(&handler_stats);
            async move {
                record.canonicalize()?;
                if registry.find_or_register(&mut record).is_duplicate {
                    stats.record_duplicate();
                }
                Ok(Flow::Continue)
            }
        })
        .await
        .with_context(|| format!("replaying {prefix}"))?;

    registry.save().await.context("saving dedup registry")?;
    let rebuild = DedupRebuild {
        records: report.succeeded,
        signatures: registry.len(),
        duplicates: stats.duplicates() as usize,
    };
    info!(
        prefix = %config.prefix,
        records = rebuild.records,
        signatures = rebuild.signatures,
        duplicates = rebuild.duplicates,
        failed = report.failed,
        "dedup registry rebuilt"
    );
    Ok(rebuild)
}
